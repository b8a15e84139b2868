//! Port checks run against live device data before any helper is spawned.

use framebridge_common::error::{BridgeError, BridgeResult};
use framebridge_device_model::{
    DeviceCatalog, DeviceDescriptor, FrameFormat, OutputPixelFormat, PortDescriptor,
    PortDirection, PortRole,
};

/// A resolved fill/key pair on one device.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyFillPorts {
    pub device: DeviceDescriptor,
    pub fill: PortDescriptor,
    pub key: PortDescriptor,
}

/// A resolved single video port.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoPort {
    pub device: DeviceDescriptor,
    pub port: PortDescriptor,
}

fn lookup(catalog: &dyn DeviceCatalog, port_id: &str) -> BridgeResult<(DeviceDescriptor, PortDescriptor)> {
    catalog
        .port(port_id)
        .ok_or_else(|| BridgeError::config(format!("Unknown output port '{port_id}'")))
}

fn usable_output(device: &DeviceDescriptor, port: &PortDescriptor) -> bool {
    port.direction == PortDirection::Output && port.available && device.available
}

/// Fill must be a video-role port and key a key-role port, both outputs on
/// the same device.
pub fn validate_key_fill(
    catalog: &dyn DeviceCatalog,
    fill_port: &str,
    key_port: &str,
) -> BridgeResult<KeyFillPorts> {
    let (fill_device, fill) = lookup(catalog, fill_port)?;
    let (key_device, key) = lookup(catalog, key_port)?;

    if fill_device.id != key_device.id || fill.device_id != key.device_id {
        return Err(BridgeError::config(format!(
            "Ports {fill_port} and {key_port} belong to different devices"
        )));
    }

    let roles_ok = fill.role == PortRole::Video && key.role == PortRole::Key;
    if !roles_ok || !usable_output(&fill_device, &fill) || !usable_output(&key_device, &key) {
        return Err(BridgeError::config(format!(
            "Ports {fill_port} and {key_port} are not a valid fill/key pair"
        )));
    }

    Ok(KeyFillPorts {
        device: fill_device,
        fill,
        key,
    })
}

/// A single video output port on an available device.
pub fn validate_single_video(catalog: &dyn DeviceCatalog, port_id: &str) -> BridgeResult<VideoPort> {
    let (device, port) = lookup(catalog, port_id)?;
    if port.device_id != device.id {
        return Err(BridgeError::config(format!(
            "Port {port_id} does not belong to device {}",
            device.id
        )));
    }
    if port.role != PortRole::Video {
        return Err(BridgeError::config(format!(
            "Port {port_id} is a key port and cannot carry program video"
        )));
    }
    if !usable_output(&device, &port) {
        return Err(BridgeError::config(format!(
            "Port {port_id} is not an available output"
        )));
    }
    Ok(VideoPort { device, port })
}

/// Check a pixel format against a port's advertised formats. An empty
/// list means the port accepts anything.
pub fn check_port_format(port: &PortDescriptor, format: OutputPixelFormat) -> BridgeResult<()> {
    if port.formats.is_empty() || port.formats.contains(&format) {
        Ok(())
    } else {
        Err(BridgeError::config(format!(
            "Port {} does not support pixel format {}",
            port.id,
            format.label()
        )))
    }
}

/// Check a frame format against a port's modes. An empty list means
/// unconstrained.
pub fn check_port_mode(port: &PortDescriptor, format: &FrameFormat) -> BridgeResult<()> {
    if port.modes.is_empty() || port.modes.iter().any(|m| m.matches(format)) {
        Ok(())
    } else {
        Err(BridgeError::config(format!(
            "Port {} does not support {}x{}@{}",
            port.id, format.width, format.height, format.fps
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use framebridge_device_model::{Connector, StaticCatalog, VideoMode};

    fn port(id: &str, device: &str, role: PortRole) -> PortDescriptor {
        PortDescriptor {
            id: id.to_string(),
            device_id: device.to_string(),
            display_name: id.to_uppercase(),
            direction: PortDirection::Output,
            role,
            connector: Connector::Sdi,
            formats: vec![OutputPixelFormat::Yuv8, OutputPixelFormat::Argb8],
            modes: vec![VideoMode {
                width: 1920,
                height: 1080,
                fps: 50.0,
                interlaced: false,
            }],
            available: true,
        }
    }

    fn device(id: &str, ports: Vec<PortDescriptor>) -> DeviceDescriptor {
        DeviceDescriptor {
            id: id.to_string(),
            display_name: id.to_string(),
            vendor: String::new(),
            model: String::new(),
            available: true,
            busy: false,
            supports_external_keying: true,
            ports,
        }
    }

    fn catalog() -> StaticCatalog {
        StaticCatalog::new(vec![
            device(
                "dl0",
                vec![
                    port("dl0-sdi-a", "dl0", PortRole::Video),
                    port("dl0-sdi-b", "dl0", PortRole::Key),
                ],
            ),
            device("dl1", vec![port("dl1-sdi-b", "dl1", PortRole::Key)]),
        ])
    }

    #[test]
    fn fill_and_key_on_one_device_pass() {
        let pair = validate_key_fill(&catalog(), "dl0-sdi-a", "dl0-sdi-b").unwrap();
        assert_eq!(pair.device.id, "dl0");
        assert_eq!(pair.key.role, PortRole::Key);
    }

    #[test]
    fn swapped_roles_are_rejected() {
        let err = validate_key_fill(&catalog(), "dl0-sdi-b", "dl0-sdi-a").unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("not a valid fill/key pair"));
    }

    #[test]
    fn cross_device_pair_is_rejected() {
        let err = validate_key_fill(&catalog(), "dl0-sdi-a", "dl1-sdi-b").unwrap_err();
        assert!(err.to_string().contains("different devices"));
    }

    #[test]
    fn single_video_rejects_key_ports_and_unknown_ids() {
        assert!(validate_single_video(&catalog(), "dl0-sdi-a").is_ok());
        assert!(validate_single_video(&catalog(), "dl0-sdi-b").is_err());
        assert!(validate_single_video(&catalog(), "nope").is_err());
    }

    #[test]
    fn unavailable_port_is_rejected() {
        let mut dead = port("dl2-sdi", "dl2", PortRole::Video);
        dead.available = false;
        let catalog = StaticCatalog::new(vec![device("dl2", vec![dead])]);
        assert!(validate_single_video(&catalog, "dl2-sdi").is_err());
    }

    #[test]
    fn format_and_mode_checks() {
        let p = port("x", "d", PortRole::Video);
        assert!(check_port_format(&p, OutputPixelFormat::Argb8).is_ok());
        assert!(check_port_format(&p, OutputPixelFormat::Yuv10).is_err());
        assert!(check_port_mode(&p, &FrameFormat::default()).is_ok());
        let uhd = FrameFormat {
            width: 3840,
            height: 2160,
            fps: 50.0,
        };
        assert!(check_port_mode(&p, &uhd).is_err());
    }
}
