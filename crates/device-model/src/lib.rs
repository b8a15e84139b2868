//! FrameBridge device model.
//!
//! Read-only device/port descriptors supplied by the device collaborator,
//! and the output configuration the orchestrator applies. The pipeline
//! never enumerates hardware itself; it looks descriptors up through a
//! [`DeviceCatalog`].

pub mod catalog;
pub mod output;

pub use catalog::*;
pub use output::*;

use serde::{Deserialize, Serialize};

/// Which direction a port carries video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortDirection {
    Input,
    Output,
}

/// What signal a port carries in a keying setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortRole {
    /// Program video, or the fill half of a key/fill pair.
    Video,
    /// Alpha matte half of a key/fill pair.
    Key,
}

/// Physical or virtual connector type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Connector {
    Sdi,
    Hdmi,
    Display,
    Network,
}

/// A video mode a port can emit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoMode {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    #[serde(default)]
    pub interlaced: bool,
}

impl VideoMode {
    /// Whether this mode matches a requested frame format (fps within 0.01).
    pub fn matches(&self, format: &FrameFormat) -> bool {
        self.width == format.width
            && self.height == format.height
            && (self.fps - format.fps).abs() < 0.01
    }
}

/// A single output or input connector on a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortDescriptor {
    pub id: String,
    pub device_id: String,
    pub display_name: String,
    pub direction: PortDirection,
    pub role: PortRole,
    pub connector: Connector,
    /// Pixel formats the port accepts.
    #[serde(default)]
    pub formats: Vec<OutputPixelFormat>,
    /// Modes the port can emit. Empty means unconstrained.
    #[serde(default)]
    pub modes: Vec<VideoMode>,
    #[serde(default = "default_true")]
    pub available: bool,
}

/// A device exposing one or more ports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub vendor: String,
    #[serde(default)]
    pub model: String,
    #[serde(default = "default_true")]
    pub available: bool,
    #[serde(default)]
    pub busy: bool,
    #[serde(default)]
    pub supports_external_keying: bool,
    #[serde(default)]
    pub ports: Vec<PortDescriptor>,
}

impl DeviceDescriptor {
    /// Find a port on this device by id.
    pub fn port(&self, port_id: &str) -> Option<&PortDescriptor> {
        self.ports.iter().find(|p| p.id == port_id)
    }
}

fn default_true() -> bool {
    true
}
