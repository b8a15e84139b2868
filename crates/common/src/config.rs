//! Application configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Global application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Logging configuration.
    pub logging: LoggingConfig,

    /// Frame Bus defaults.
    pub frame_bus: FrameBusDefaults,

    /// Control-channel limits and timeouts.
    pub control: ControlConfig,

    /// Helper process locations and shutdown timing.
    pub helpers: HelperConfig,

    /// Output adapter behaviour.
    pub output: OutputDefaults,

    /// Directory for persisted session state (last-known-good output).
    pub state_dir: Option<PathBuf>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "framebridge=debug,warn").
    pub level: String,

    /// Whether to output structured JSON logs.
    pub json: bool,

    /// Optional log file path.
    pub file: Option<PathBuf>,
}

/// Frame Bus defaults used when a session creates its shared region.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameBusDefaults {
    /// Prefix for generated region names.
    pub name_prefix: String,

    /// Number of slots in the ring.
    pub slot_count: u32,

    /// Directory that backs shared regions. `None` picks the platform default.
    pub shm_dir: Option<PathBuf>,
}

/// Control-channel limits and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Maximum JSON header length in bytes.
    pub max_header_bytes: u32,

    /// Maximum trailing payload length in bytes.
    pub max_payload_bytes: u32,

    /// How long a command waits for its acknowledgment.
    pub ack_timeout_ms: u64,

    /// How long to wait for the host's `ready` event.
    pub ready_timeout_ms: u64,
}

/// Helper process locations and timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HelperConfig {
    /// SDI/HDMI hardware helper (key/fill and single video).
    pub decklink: PathBuf,

    /// Local display helper.
    pub display: PathBuf,

    /// Network stream helper.
    pub stream: PathBuf,

    /// How long a helper has to emit `{"type":"ready"}`.
    pub ready_timeout_ms: u64,

    /// Wait after the protocol shutdown before sending SIGTERM.
    pub graceful_timeout_ms: u64,

    /// Wait after SIGTERM before the unconditional kill.
    pub terminate_timeout_ms: u64,
}

/// Output adapter behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputDefaults {
    /// Helpers read frames from the Frame Bus. When false, frames are pushed
    /// over the helper's stdin using the legacy framing.
    pub use_frame_bus: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            frame_bus: FrameBusDefaults::default(),
            control: ControlConfig::default(),
            helpers: HelperConfig::default(),
            output: OutputDefaults::default(),
            state_dir: Some(dirs_default_state()),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file: None,
        }
    }
}

impl Default for FrameBusDefaults {
    fn default() -> Self {
        Self {
            name_prefix: "framebridge".to_string(),
            slot_count: 3,
            shm_dir: None,
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            max_header_bytes: 64 * 1024,
            max_payload_bytes: 64 * 1024 * 1024,
            ack_timeout_ms: 2_000,
            ready_timeout_ms: 10_000,
        }
    }
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            decklink: PathBuf::from("decklink-helper"),
            display: PathBuf::from("display-helper"),
            stream: PathBuf::from("stream-helper"),
            ready_timeout_ms: 10_000,
            graceful_timeout_ms: 2_000,
            terminate_timeout_ms: 1_000,
        }
    }
}

impl Default for OutputDefaults {
    fn default() -> Self {
        Self {
            use_frame_bus: true,
        }
    }
}

impl ControlConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }
}

impl HelperConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn graceful_timeout(&self) -> Duration {
        Duration::from_millis(self.graceful_timeout_ms)
    }

    pub fn terminate_timeout(&self) -> Duration {
        Duration::from_millis(self.terminate_timeout_ms)
    }
}

impl AppConfig {
    /// Load config from the standard location, falling back to defaults.
    pub fn load() -> Self {
        let config_path = config_file_path();
        if config_path.exists() {
            match std::fs::read_to_string(&config_path) {
                Ok(content) => match serde_json::from_str(&content) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Failed to parse config at {:?}: {}", config_path, e);
                    }
                },
                Err(e) => {
                    tracing::warn!("Failed to read config at {:?}: {}", config_path, e);
                }
            }
        }
        Self::default()
    }

    /// Load config from an explicit path. Errors are returned, not defaulted.
    pub fn load_from(path: &std::path::Path) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(std::io::Error::other)
    }

    /// Save config to the standard location.
    pub fn save(&self) -> Result<(), std::io::Error> {
        let config_path = config_file_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(config_path, json)
    }
}

/// Standard config file location.
pub fn config_file_path() -> PathBuf {
    let base = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".config")
        });
    base.join("framebridge").join("config.json")
}

/// Default state directory.
fn dirs_default_state() -> PathBuf {
    let base = std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local").join("state")
        });
    base.join("framebridge")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_fills_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"output":{"use_frame_bus":false}}"#).unwrap();
        assert!(!config.output.use_frame_bus);
        assert_eq!(config.frame_bus.slot_count, 3);
        assert_eq!(config.control.max_header_bytes, 64 * 1024);
        assert_eq!(config.helpers.graceful_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn defaults_prefer_frame_bus() {
        let config = AppConfig::default();
        assert!(config.output.use_frame_bus);
        assert!(config.frame_bus.slot_count >= 2);
    }
}
