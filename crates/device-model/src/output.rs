//! Output configuration applied by the orchestrator.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use framebridge_common::error::{BridgeError, BridgeResult};

/// Output topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKey {
    /// One program signal on a hardware port.
    Video,
    /// Fill + key pair on two hardware ports of one device.
    KeyFill,
    /// Fullscreen on a local display.
    Display,
    /// Network video stream.
    Stream,
}

impl OutputKey {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::KeyFill => "key_fill",
            Self::Display => "display",
            Self::Stream => "stream",
        }
    }
}

impl fmt::Display for OutputKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pixel format emitted on the wire by a hardware helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutputPixelFormat {
    #[serde(rename = "8bit_yuv", alias = "yuv8")]
    Yuv8,
    #[serde(rename = "10bit_yuv", alias = "yuv10")]
    Yuv10,
    #[serde(rename = "8bit_argb", alias = "argb")]
    Argb8,
    #[serde(rename = "8bit_bgra", alias = "bgra")]
    Bgra8,
}

impl OutputPixelFormat {
    /// Helper command-line label.
    pub fn label(self) -> &'static str {
        match self {
            Self::Yuv8 => "8bit_yuv",
            Self::Yuv10 => "10bit_yuv",
            Self::Argb8 => "8bit_argb",
            Self::Bgra8 => "8bit_bgra",
        }
    }
}

impl FromStr for OutputPixelFormat {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "8bit_yuv" | "yuv8" => Ok(Self::Yuv8),
            "10bit_yuv" | "yuv10" => Ok(Self::Yuv10),
            "8bit_argb" | "argb" => Ok(Self::Argb8),
            "8bit_bgra" | "bgra" => Ok(Self::Bgra8),
            other => Err(BridgeError::config(format!("Unknown pixel format: {other}"))),
        }
    }
}

/// Signal range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SignalRange {
    #[default]
    Legal,
    Full,
}

impl SignalRange {
    pub fn label(self) -> &'static str {
        match self {
            Self::Legal => "legal",
            Self::Full => "full",
        }
    }
}

/// Output colorspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Colorspace {
    #[default]
    Auto,
    #[serde(alias = "bt601")]
    Rec601,
    #[serde(alias = "bt709")]
    Rec709,
    #[serde(alias = "bt2020")]
    Rec2020,
}

impl Colorspace {
    pub fn label(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Rec601 => "rec601",
            Self::Rec709 => "rec709",
            Self::Rec2020 => "rec2020",
        }
    }
}

/// Resolution and rate of the output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameFormat {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

impl FrameFormat {
    /// Integral rate used for the Frame Bus and render loop.
    pub fn bus_fps(&self) -> u32 {
        self.fps.round().max(1.0) as u32
    }

    /// Bytes in one RGBA8 frame.
    pub fn rgba_frame_size(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }

    /// Frame Bus region carrying this format under `base`. Each format
    /// gets its own region so a reader never sees its region change shape.
    pub fn framebus_name(&self, base: &str) -> String {
        format!("{base}-{}x{}-{}", self.width, self.height, self.bus_fps())
    }
}

impl Default for FrameFormat {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            fps: 50.0,
        }
    }
}

/// Ports and endpoints the output targets.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputTargets {
    /// Single hardware output port (video topology).
    pub output_port: Option<String>,
    /// Fill port of a key/fill pair.
    pub fill_port: Option<String>,
    /// Key port of a key/fill pair.
    pub key_port: Option<String>,
    /// Local display index (display topology).
    pub display_index: Option<u32>,
    /// Destination URL (stream topology).
    pub stream_url: Option<String>,
}

/// The complete output configuration for a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfiguration {
    pub key: OutputKey,
    #[serde(default)]
    pub targets: OutputTargets,
    #[serde(default)]
    pub pixel_format: Option<OutputPixelFormat>,
    #[serde(default)]
    pub range: SignalRange,
    #[serde(default)]
    pub colorspace: Colorspace,
    #[serde(default)]
    pub format: FrameFormat,
}

impl OutputConfiguration {
    /// Structural checks that need no device data.
    pub fn validate_shape(&self) -> BridgeResult<()> {
        if self.format.width == 0 || self.format.height == 0 {
            return Err(BridgeError::config(format!(
                "Invalid output size {}x{}",
                self.format.width, self.format.height
            )));
        }
        if !(self.format.fps.is_finite() && self.format.fps > 0.0) {
            return Err(BridgeError::config(format!(
                "Invalid output frame rate {}",
                self.format.fps
            )));
        }

        let targets = &self.targets;
        match self.key {
            OutputKey::Video => {
                if targets.output_port.as_deref().unwrap_or("").is_empty() {
                    return Err(BridgeError::config(
                        "Output port is required for video playback",
                    ));
                }
            }
            OutputKey::KeyFill => {
                if targets.fill_port.as_deref().unwrap_or("").is_empty()
                    || targets.key_port.as_deref().unwrap_or("").is_empty()
                {
                    return Err(BridgeError::config(
                        "Key/fill output requires both a fill port and a key port",
                    ));
                }
                if targets.fill_port == targets.key_port {
                    return Err(BridgeError::config(
                        "Fill and key ports must be different",
                    ));
                }
            }
            OutputKey::Display => {}
            OutputKey::Stream => {
                if targets.stream_url.as_deref().unwrap_or("").is_empty() {
                    return Err(BridgeError::config("Stream output requires a URL"));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_fill() -> OutputConfiguration {
        OutputConfiguration {
            key: OutputKey::KeyFill,
            targets: OutputTargets {
                fill_port: Some("dl0-sdi-a".to_string()),
                key_port: Some("dl0-sdi-b".to_string()),
                ..Default::default()
            },
            pixel_format: Some(OutputPixelFormat::Argb8),
            range: SignalRange::Legal,
            colorspace: Colorspace::Rec709,
            format: FrameFormat::default(),
        }
    }

    #[test]
    fn key_fill_shape_requires_both_ports() {
        assert!(key_fill().validate_shape().is_ok());

        let mut missing = key_fill();
        missing.targets.key_port = None;
        assert!(missing.validate_shape().unwrap_err().is_config());

        let mut same = key_fill();
        same.targets.key_port = same.targets.fill_port.clone();
        assert!(same.validate_shape().is_err());
    }

    #[test]
    fn pixel_format_accepts_aliases() {
        assert_eq!(
            "argb".parse::<OutputPixelFormat>().unwrap(),
            OutputPixelFormat::Argb8
        );
        let parsed: OutputPixelFormat = serde_json::from_str("\"yuv10\"").unwrap();
        assert_eq!(parsed, OutputPixelFormat::Yuv10);
        assert!("rgb565".parse::<OutputPixelFormat>().is_err());
    }

    #[test]
    fn bus_fps_rounds_fractional_rates() {
        let format = FrameFormat {
            width: 1920,
            height: 1080,
            fps: 59.94,
        };
        assert_eq!(format.bus_fps(), 60);
        assert_eq!(format.rgba_frame_size(), 1920 * 1080 * 4);
        assert_eq!(format.framebus_name("fb"), "fb-1920x1080-60");
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let json = r#"{"key":"display","targets":{"display_index":1}}"#;
        let config: OutputConfiguration = serde_json::from_str(json).unwrap();
        assert_eq!(config.key, OutputKey::Display);
        assert_eq!(config.range, SignalRange::Legal);
        assert_eq!(config.format.fps, 50.0);
        assert!(config.validate_shape().is_ok());
    }
}
