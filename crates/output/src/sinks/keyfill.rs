//! Hardware fill + key on two ports of one device.

use framebridge_common::error::{BridgeError, BridgeResult};
use framebridge_device_model::{OutputConfiguration, OutputKey, OutputPixelFormat};

use super::{with_format_args, AdapterContext, Sink};
use crate::helper::HelperCommand;
use crate::ports::{check_port_format, check_port_mode, validate_key_fill};

/// The only format accepted for the key channel.
pub const KEY_PIXEL_FORMAT: OutputPixelFormat = OutputPixelFormat::Argb8;

#[derive(Debug, Default, Clone, Copy)]
pub struct KeyFillSink;

impl Sink for KeyFillSink {
    fn key(&self) -> OutputKey {
        OutputKey::KeyFill
    }

    fn plan(&self, config: &OutputConfiguration, context: &AdapterContext) -> BridgeResult<HelperCommand> {
        config.validate_shape()?;

        let pixel_format = config.pixel_format.unwrap_or(KEY_PIXEL_FORMAT);
        if pixel_format != KEY_PIXEL_FORMAT {
            return Err(BridgeError::config(format!(
                "Key/fill output requires {} for the key channel, got {}",
                KEY_PIXEL_FORMAT.label(),
                pixel_format.label()
            )));
        }

        let fill = config.targets.fill_port.as_deref().unwrap_or_default();
        let key = config.targets.key_port.as_deref().unwrap_or_default();
        let pair = validate_key_fill(context.catalog.as_ref(), fill, key)?;
        check_port_mode(&pair.fill, &config.format)?;
        check_port_mode(&pair.key, &config.format)?;
        check_port_format(&pair.fill, pixel_format)?;
        check_port_format(&pair.key, KEY_PIXEL_FORMAT)?;

        let command = HelperCommand::new("decklink-keyfill", &context.helpers.decklink)
            .arg("--playback")
            .flag("--device", &pair.device.id);
        Ok(with_format_args(command, config, context)
            .flag("--fill-port", &pair.fill.id)
            .flag("--key-port", &pair.key.id)
            .flag("--pixel-format", pixel_format.label())
            .flag("--range", config.range.label())
            .flag("--colorspace", config.colorspace.label()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sinks::fixtures::{config, context, device};
    use framebridge_device_model::{OutputTargets, StaticCatalog};
    use std::sync::Arc;

    fn targets(fill: &str, key: &str) -> OutputTargets {
        OutputTargets {
            fill_port: Some(fill.to_string()),
            key_port: Some(key.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn plans_playback_with_both_ports() {
        let command = KeyFillSink
            .plan(&config(OutputKey::KeyFill, targets("dl0-sdi-a", "dl0-sdi-b")), &context(true))
            .unwrap();
        let args = command.args.join(" ");
        assert!(args.starts_with("--playback --device dl0"));
        assert!(args.contains("--fill-port dl0-sdi-a --key-port dl0-sdi-b"));
        assert!(args.contains("--pixel-format 8bit_argb"));
        assert!(args.contains("--framebus-name fb-test"));
    }

    #[test]
    fn rejects_non_alpha_key_format() {
        let mut cfg = config(OutputKey::KeyFill, targets("dl0-sdi-a", "dl0-sdi-b"));
        cfg.pixel_format = Some(OutputPixelFormat::Yuv8);
        let err = KeyFillSink.plan(&cfg, &context(true)).unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("8bit_argb"));
    }

    #[test]
    fn rejects_key_port_without_alpha_format() {
        let mut device = device();
        for port in &mut device.ports {
            if port.id == "dl0-sdi-b" {
                port.formats = vec![OutputPixelFormat::Yuv8];
            }
        }
        let context = AdapterContext {
            catalog: Arc::new(StaticCatalog::new(vec![device])),
            ..context(true)
        };
        let err = KeyFillSink
            .plan(&config(OutputKey::KeyFill, targets("dl0-sdi-a", "dl0-sdi-b")), &context)
            .unwrap_err();
        assert!(err.is_config());
        assert!(err
            .to_string()
            .contains("Port dl0-sdi-b does not support pixel format 8bit_argb"));
    }

    #[test]
    fn rejects_swapped_roles() {
        let err = KeyFillSink
            .plan(&config(OutputKey::KeyFill, targets("dl0-sdi-b", "dl0-sdi-a")), &context(true))
            .unwrap_err();
        assert!(err.to_string().contains("not a valid fill/key pair"));
    }

    #[test]
    fn legacy_mode_omits_framebus_name() {
        let command = KeyFillSink
            .plan(&config(OutputKey::KeyFill, targets("dl0-sdi-a", "dl0-sdi-b")), &context(false))
            .unwrap();
        assert!(!command.args.iter().any(|a| a == "--framebus-name"));
    }
}
