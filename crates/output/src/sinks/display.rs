//! Fullscreen output on a local display.

use framebridge_common::error::{BridgeError, BridgeResult};
use framebridge_device_model::{OutputConfiguration, OutputKey};

use super::{with_format_args, AdapterContext, Sink};
use crate::helper::HelperCommand;

#[derive(Debug, Default, Clone, Copy)]
pub struct DisplaySink;

impl Sink for DisplaySink {
    fn key(&self) -> OutputKey {
        OutputKey::Display
    }

    fn plan(&self, config: &OutputConfiguration, context: &AdapterContext) -> BridgeResult<HelperCommand> {
        config.validate_shape()?;
        if !context.use_frame_bus {
            return Err(BridgeError::config(
                "Display output reads frames from the Frame Bus; enable output.use_frame_bus",
            ));
        }

        let index = config.targets.display_index.unwrap_or(0);
        let command = HelperCommand::new("display", &context.helpers.display);
        Ok(with_format_args(command, config, context).flag("--display-index", index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sinks::fixtures::{config, context};
    use framebridge_device_model::OutputTargets;

    #[test]
    fn passes_display_index() {
        let cfg = config(
            OutputKey::Display,
            OutputTargets {
                display_index: Some(2),
                ..Default::default()
            },
        );
        let command = DisplaySink.plan(&cfg, &context(true)).unwrap();
        assert_eq!(
            command.args,
            vec![
                "--width",
                "1920",
                "--height",
                "1080",
                "--fps",
                "50",
                "--framebus-name",
                "fb-test-1920x1080-50",
                "--display-index",
                "2"
            ]
        );
    }

    #[test]
    fn legacy_mode_is_rejected() {
        let cfg = config(OutputKey::Display, OutputTargets::default());
        assert!(DisplaySink.plan(&cfg, &context(false)).unwrap_err().is_config());
    }
}
