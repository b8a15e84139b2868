//! Checks run in the `Validating` phase, before anything is mutated.

use framebridge_common::error::{BridgeError, BridgeResult};
use framebridge_device_model::{DeviceCatalog, OutputConfiguration, OutputKey};
use framebridge_output::OutputAdapter;

/// Validate `config` against live device data and the adapter that
/// would drive it.
pub fn validate_request(
    config: &OutputConfiguration,
    catalog: &dyn DeviceCatalog,
    adapter: &dyn OutputAdapter,
) -> BridgeResult<()> {
    config.validate_shape()?;

    match config.key {
        OutputKey::KeyFill => {
            let fill = config.targets.fill_port.as_deref().unwrap_or_default();
            let (device, _) = catalog
                .port(fill)
                .ok_or_else(|| BridgeError::config(format!("Unknown output port '{fill}'")))?;
            if !device.supports_external_keying {
                return Err(BridgeError::config(format!(
                    "Device {} does not support external keying",
                    device.display_name
                )));
            }
            check_device_available(&device)?;
        }
        OutputKey::Video => {
            let port = config.targets.output_port.as_deref().unwrap_or_default();
            let (device, _) = catalog
                .port(port)
                .ok_or_else(|| BridgeError::config(format!("Unknown output port '{port}'")))?;
            check_device_available(&device)?;
        }
        OutputKey::Display | OutputKey::Stream => {}
    }

    adapter.validate(config)
}

fn check_device_available(device: &framebridge_device_model::DeviceDescriptor) -> BridgeResult<()> {
    if !device.available {
        return Err(BridgeError::config(format!(
            "Device {} is not available",
            device.display_name
        )));
    }
    if device.busy {
        // The busy flag may reflect our own running helper.
        tracing::debug!(device = %device.id, "Device reported busy");
    }
    Ok(())
}
