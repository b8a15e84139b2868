//! FrameBridge compositing host.
//!
//! The host renders layers off-screen and publishes frames to the Frame
//! Bus. Layer commands arrive over a loopback control channel; frame bytes
//! never travel over it.

pub mod client;
pub mod engine;
pub mod host;
pub mod layer;
pub mod protocol;
pub mod server;

pub use client::CompositorClient;
pub use engine::{RenderEngine, Scene, SoftwareEngine, Surface};
pub use host::CompositorHost;
pub use layer::{BackgroundMode, Layer, LayerLayout, TEST_PATTERN_LAYER_ID};
pub use protocol::{
    AssetDescriptor, BackgroundPolicy, ChannelLimits, ControlCommand, FrameBusTarget, HostEvent,
    HostStatus, LayerSpec, RendererConfig, ValueMap,
};
pub use server::{spawn_host, HostHandle};
