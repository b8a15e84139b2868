//! Last-known-good output configuration on disk.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use framebridge_common::error::BridgeResult;
use framebridge_device_model::OutputConfiguration;

const FILE_NAME: &str = "last_known_good.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Record {
    saved_at: DateTime<Utc>,
    config: OutputConfiguration,
}

/// JSON file holding the last committed output configuration.
#[derive(Debug, Clone)]
pub struct LastKnownGoodStore {
    path: PathBuf,
}

impl LastKnownGoodStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored configuration. A missing or unreadable file yields
    /// `None`.
    pub fn load(&self) -> Option<OutputConfiguration> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to read last-known-good");
                return None;
            }
        };
        match serde_json::from_str::<Record>(&content) {
            Ok(record) => Some(record.config),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Ignoring malformed last-known-good");
                None
            }
        }
    }

    /// Write atomically: temp file then rename.
    pub fn save(&self, config: &OutputConfiguration) -> BridgeResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let record = Record {
            saved_at: Utc::now(),
            config: config.clone(),
        };
        let json = serde_json::to_string_pretty(&record)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        tracing::debug!(path = %self.path.display(), output = %config.key, "Saved last-known-good");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use framebridge_device_model::{
        Colorspace, FrameFormat, OutputKey, OutputTargets, SignalRange,
    };

    #[test]
    fn save_then_load() {
        let dir = std::env::temp_dir().join(format!("framebridge-lkg-{}", uuid::Uuid::new_v4()));
        let store = LastKnownGoodStore::new(&dir);
        assert!(store.load().is_none());

        let config = OutputConfiguration {
            key: OutputKey::Display,
            targets: OutputTargets {
                display_index: Some(1),
                ..Default::default()
            },
            pixel_format: None,
            range: SignalRange::Full,
            colorspace: Colorspace::Auto,
            format: FrameFormat::default(),
        };
        store.save(&config).unwrap();
        assert_eq!(store.load(), Some(config));

        std::fs::write(store.path(), "{not json").unwrap();
        assert!(store.load().is_none());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
