use std::sync::Arc;

use framebridge_common::config::HelperConfig;
use framebridge_common::error::BridgeResult;
use framebridge_device_model::{DeviceCatalog, OutputConfiguration, OutputKey};

use crate::helper::HelperCommand;

/// Everything a sink needs to plan its helper.
#[derive(Clone)]
pub struct AdapterContext {
    pub helpers: HelperConfig,
    /// Helpers read the Frame Bus when set; otherwise frames are pushed
    /// over stdin with the legacy protocol.
    pub use_frame_bus: bool,
    /// Base Frame Bus name; the region read is
    /// [`FrameFormat::framebus_name`] of the configured format.
    ///
    /// [`FrameFormat::framebus_name`]: framebridge_device_model::FrameFormat::framebus_name
    pub framebus_name: String,
    pub catalog: Arc<dyn DeviceCatalog>,
}

impl std::fmt::Debug for AdapterContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterContext")
            .field("use_frame_bus", &self.use_frame_bus)
            .field("framebus_name", &self.framebus_name)
            .finish_non_exhaustive()
    }
}

/// Per-topology validation and helper command construction.
pub trait Sink: Send + Sync {
    fn key(&self) -> OutputKey;

    /// Validate `config` and build the helper invocation. Never spawns.
    fn plan(&self, config: &OutputConfiguration, context: &AdapterContext) -> BridgeResult<HelperCommand>;
}

/// Append the arguments every helper takes.
fn with_format_args(
    command: HelperCommand,
    config: &OutputConfiguration,
    context: &AdapterContext,
) -> HelperCommand {
    let command = command
        .flag("--width", config.format.width)
        .flag("--height", config.format.height)
        .flag("--fps", config.format.fps);
    if context.use_frame_bus {
        command.flag("--framebus-name", config.format.framebus_name(&context.framebus_name))
    } else {
        command
    }
}

/// The sink for an output topology.
pub fn sink_for(key: OutputKey) -> Box<dyn Sink> {
    match key {
        OutputKey::Video => Box::new(VideoSink),
        OutputKey::KeyFill => Box::new(KeyFillSink),
        OutputKey::Display => Box::new(DisplaySink),
        OutputKey::Stream => Box::new(StreamSink),
    }
}

pub mod display;
pub mod keyfill;
pub mod stream;
pub mod video;

pub use display::DisplaySink;
pub use keyfill::KeyFillSink;
pub use stream::StreamSink;
pub use video::VideoSink;
