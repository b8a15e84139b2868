//! Network video stream.

use framebridge_common::error::{BridgeError, BridgeResult};
use framebridge_device_model::{OutputConfiguration, OutputKey};

use super::{with_format_args, AdapterContext, Sink};
use crate::helper::HelperCommand;

const SCHEMES: [&str; 4] = ["srt://", "rtmp://", "rtmps://", "udp://"];

#[derive(Debug, Default, Clone, Copy)]
pub struct StreamSink;

impl Sink for StreamSink {
    fn key(&self) -> OutputKey {
        OutputKey::Stream
    }

    fn plan(&self, config: &OutputConfiguration, context: &AdapterContext) -> BridgeResult<HelperCommand> {
        config.validate_shape()?;
        if !context.use_frame_bus {
            return Err(BridgeError::config(
                "Stream output reads frames from the Frame Bus; enable output.use_frame_bus",
            ));
        }

        let url = config.targets.stream_url.as_deref().unwrap_or_default();
        if !SCHEMES.iter().any(|scheme| url.starts_with(scheme)) {
            return Err(BridgeError::config(format!("Unsupported stream URL '{url}'")));
        }

        let command = HelperCommand::new("stream", &context.helpers.stream);
        Ok(with_format_args(command, config, context).flag("--url", url))
    }
}
