//! Device catalog contract and a static, file-backed implementation.

use std::collections::BTreeMap;
use std::path::Path;

use framebridge_common::error::{BridgeError, BridgeResult};

use crate::{DeviceDescriptor, PortDescriptor};

/// Read-only lookup of device and port descriptors.
///
/// Implemented by the device collaborator. The pipeline re-validates
/// every output request against it, regardless of upstream validation.
pub trait DeviceCatalog: Send + Sync {
    /// All known devices.
    fn devices(&self) -> Vec<DeviceDescriptor>;

    /// Look up a device by id.
    fn device(&self, device_id: &str) -> Option<DeviceDescriptor> {
        self.devices().into_iter().find(|d| d.id == device_id)
    }

    /// Look up a port by id, along with its owning device.
    fn port(&self, port_id: &str) -> Option<(DeviceDescriptor, PortDescriptor)> {
        self.devices().into_iter().find_map(|device| {
            let port = device.port(port_id).cloned()?;
            Some((device, port))
        })
    }
}

/// A catalog backed by an in-memory snapshot.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    devices: BTreeMap<String, DeviceDescriptor>,
}

impl StaticCatalog {
    pub fn new(devices: Vec<DeviceDescriptor>) -> Self {
        Self {
            devices: devices.into_iter().map(|d| (d.id.clone(), d)).collect(),
        }
    }

    /// Load a JSON array of devices.
    pub fn load(path: &Path) -> BridgeResult<Self> {
        if !path.exists() {
            return Err(BridgeError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        let content = std::fs::read_to_string(path)?;
        let devices: Vec<DeviceDescriptor> = serde_json::from_str(&content)?;
        tracing::debug!(count = devices.len(), path = %path.display(), "Loaded device catalog");
        Ok(Self::new(devices))
    }
}

impl DeviceCatalog for StaticCatalog {
    fn devices(&self) -> Vec<DeviceDescriptor> {
        self.devices.values().cloned().collect()
    }

    fn device(&self, device_id: &str) -> Option<DeviceDescriptor> {
        self.devices.get(device_id).cloned()
    }
}
