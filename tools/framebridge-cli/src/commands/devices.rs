//! List devices from a catalog file.

use std::path::PathBuf;

use framebridge_device_model::{DeviceCatalog, StaticCatalog};

pub fn run(path: PathBuf) -> anyhow::Result<()> {
    let catalog = StaticCatalog::load(&path)
        .map_err(|e| anyhow::anyhow!("Failed to load catalog: {e}"))?;
    let devices = catalog.devices();

    if devices.is_empty() {
        println!("No devices in {}", path.display());
        return Ok(());
    }

    for device in &devices {
        let mut flags = Vec::new();
        if !device.available {
            flags.push("unavailable");
        }
        if device.busy {
            flags.push("busy");
        }
        if device.supports_external_keying {
            flags.push("keying");
        }
        println!(
            "{} ({} {}) [{}]",
            device.display_name,
            device.vendor,
            device.model,
            flags.join(", ")
        );
        println!("  ID: {}", device.id);
        for port in &device.ports {
            println!(
                "  {:<16} {:?}/{:?} {:?}{}",
                port.id,
                port.direction,
                port.role,
                port.connector,
                if port.available { "" } else { " (unavailable)" }
            );
        }
    }
    Ok(())
}
