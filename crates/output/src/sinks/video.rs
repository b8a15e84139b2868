//! Program video on a single hardware port.

use framebridge_common::error::BridgeResult;
use framebridge_device_model::{OutputConfiguration, OutputKey, OutputPixelFormat};

use super::{with_format_args, AdapterContext, Sink};
use crate::helper::HelperCommand;
use crate::ports::{check_port_format, check_port_mode, validate_single_video};

#[derive(Debug, Default, Clone, Copy)]
pub struct VideoSink;

impl Sink for VideoSink {
    fn key(&self) -> OutputKey {
        OutputKey::Video
    }

    fn plan(&self, config: &OutputConfiguration, context: &AdapterContext) -> BridgeResult<HelperCommand> {
        config.validate_shape()?;

        let port_id = config.targets.output_port.as_deref().unwrap_or_default();
        let target = validate_single_video(context.catalog.as_ref(), port_id)?;
        let pixel_format = config.pixel_format.unwrap_or(OutputPixelFormat::Yuv8);
        check_port_format(&target.port, pixel_format)?;
        check_port_mode(&target.port, &config.format)?;

        let command = HelperCommand::new("decklink-video", &context.helpers.decklink)
            .arg("--playback")
            .flag("--device", &target.device.id);
        Ok(with_format_args(command, config, context)
            .flag("--output-port", &target.port.id)
            .flag("--pixel-format", pixel_format.label())
            .flag("--range", config.range.label())
            .flag("--colorspace", config.colorspace.label()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sinks::fixtures::{config, context};
    use framebridge_device_model::OutputTargets;

    fn on(port: &str) -> OutputConfiguration {
        config(
            OutputKey::Video,
            OutputTargets {
                output_port: Some(port.to_string()),
                ..Default::default()
            },
        )
    }

    #[test]
    fn defaults_to_8bit_yuv() {
        let command = VideoSink.plan(&on("dl0-hdmi"), &context(true)).unwrap();
        let args = command.args.join(" ");
        assert!(args.contains("--output-port dl0-hdmi"));
        assert!(args.contains("--pixel-format 8bit_yuv"));
        assert!(args.contains("--range legal --colorspace rec709"));
    }

    #[test]
    fn key_port_cannot_carry_video() {
        assert!(VideoSink.plan(&on("dl0-sdi-b"), &context(true)).is_err());
    }

    #[test]
    fn missing_port_is_a_config_error() {
        let err = VideoSink
            .plan(&config(OutputKey::Video, OutputTargets::default()), &context(true))
            .unwrap_err();
        assert!(err.is_config());
    }
}
