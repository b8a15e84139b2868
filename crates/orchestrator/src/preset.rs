//! Timed layer groups.
//!
//! A preset groups layers sent together. With a duration, its timer starts
//! when the host first reports one of the member layers rendered, and on
//! expiry every member layer is removed.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;

use framebridge_common::error::BridgeResult;
use framebridge_compositor::CompositorClient;

/// Layer removal as seen by the preset timer.
#[async_trait::async_trait]
pub trait LayerControl: Send + Sync {
    async fn remove_layer(&self, layer_id: &str) -> BridgeResult<()>;
}

#[async_trait::async_trait]
impl LayerControl for CompositorClient {
    async fn remove_layer(&self, layer_id: &str) -> BridgeResult<()> {
        CompositorClient::remove_layer(self, layer_id).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PresetState {
    /// Waiting for a member layer to render.
    Pending,
    /// Timer running.
    Started,
    Expired,
}

struct ActivePreset {
    members: BTreeSet<String>,
    duration: Option<Duration>,
    state: PresetState,
    epoch: u64,
    timer: Option<JoinHandle<()>>,
}

impl ActivePreset {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Status view of one preset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresetStatus {
    pub id: String,
    pub members: Vec<String>,
    pub duration_ms: Option<u64>,
    pub state: PresetState,
}

#[derive(Default)]
struct Registry {
    presets: BTreeMap<String, ActivePreset>,
    next_epoch: u64,
}

pub struct PresetManager {
    layers: Arc<dyn LayerControl>,
    registry: Arc<Mutex<Registry>>,
}

impl std::fmt::Debug for PresetManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresetManager")
            .field("presets", &self.status().len())
            .finish()
    }
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl PresetManager {
    pub fn new(layers: Arc<dyn LayerControl>) -> Self {
        Self {
            layers,
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }

    /// Record `layer_id` as a member of `preset_id`. Re-sending a preset
    /// with a different duration restarts it.
    pub fn register(&self, preset_id: &str, layer_id: &str, duration: Option<Duration>) {
        let mut registry = lock(&self.registry);
        let preset = registry
            .presets
            .entry(preset_id.to_string())
            .or_insert_with(|| ActivePreset {
                members: BTreeSet::new(),
                duration,
                state: PresetState::Pending,
                epoch: 0,
                timer: None,
            });

        if preset.duration != duration || preset.state == PresetState::Expired {
            tracing::debug!(preset = %preset_id, "Preset restarted");
            preset.cancel_timer();
            preset.duration = duration;
            preset.state = PresetState::Pending;
        }
        preset.members.insert(layer_id.to_string());
    }

    /// Called for every `layer_rendered` event.
    pub fn on_layer_rendered(&self, layer_id: &str) {
        let mut registry = lock(&self.registry);
        let Registry {
            presets,
            next_epoch,
        } = &mut *registry;

        for (id, preset) in presets.iter_mut() {
            if preset.state != PresetState::Pending || !preset.members.contains(layer_id) {
                continue;
            }
            let Some(duration) = preset.duration else {
                continue;
            };
            *next_epoch += 1;
            preset.epoch = *next_epoch;
            preset.state = PresetState::Started;
            preset.timer = Some(tokio::spawn(expire_after(
                Arc::downgrade(&self.registry),
                self.layers.clone(),
                id.clone(),
                preset.epoch,
                duration,
            )));
            tracing::info!(preset = %id, duration_ms = duration.as_millis() as u64, "Preset timer started");
        }
    }

    /// Remove a preset and all its member layers. Returns the layers that
    /// were removed; an unknown id removes nothing.
    pub async fn remove_preset(&self, preset_id: &str) -> BridgeResult<Vec<String>> {
        let preset = lock(&self.registry).presets.remove(preset_id);
        let Some(mut preset) = preset else {
            return Ok(Vec::new());
        };
        preset.cancel_timer();
        let members: Vec<String> = preset.members.into_iter().collect();
        for layer_id in &members {
            self.layers.remove_layer(layer_id).await?;
        }
        tracing::info!(preset = %preset_id, layers = members.len(), "Preset removed");
        Ok(members)
    }

    /// Drop a layer removed by other means from every preset. Presets left
    /// without members are discarded.
    pub fn forget_layer(&self, layer_id: &str) {
        let mut registry = lock(&self.registry);
        registry.presets.retain(|_, preset| {
            preset.members.remove(layer_id);
            if preset.members.is_empty() {
                preset.cancel_timer();
                false
            } else {
                true
            }
        });
    }

    pub fn status(&self) -> Vec<PresetStatus> {
        lock(&self.registry)
            .presets
            .iter()
            .map(|(id, preset)| PresetStatus {
                id: id.clone(),
                members: preset.members.iter().cloned().collect(),
                duration_ms: preset.duration.map(|d| d.as_millis() as u64),
                state: preset.state,
            })
            .collect()
    }

    /// Cancel every timer.
    pub fn clear(&self) {
        let mut registry = lock(&self.registry);
        for preset in registry.presets.values_mut() {
            preset.cancel_timer();
        }
        registry.presets.clear();
    }
}

impl Drop for PresetManager {
    fn drop(&mut self) {
        self.clear();
    }
}

async fn expire_after(
    registry: Weak<Mutex<Registry>>,
    layers: Arc<dyn LayerControl>,
    preset_id: String,
    epoch: u64,
    duration: Duration,
) {
    tokio::time::sleep(duration).await;

    let Some(shared) = registry.upgrade() else {
        return;
    };
    let members: Vec<String> = {
        let mut registry = lock(&shared);
        match registry.presets.get_mut(&preset_id) {
            Some(preset) if preset.epoch == epoch && preset.state == PresetState::Started => {
                preset.state = PresetState::Expired;
                preset.members.iter().cloned().collect()
            }
            _ => return,
        }
    };

    tracing::info!(preset = %preset_id, layers = members.len(), "Preset expired");
    for layer_id in &members {
        if let Err(e) = layers.remove_layer(layer_id).await {
            tracing::warn!(preset = %preset_id, layer = %layer_id, error = %e, "Failed to remove expired layer");
        }
    }

    let mut registry = lock(&shared);
    let finished = registry
        .presets
        .get(&preset_id)
        .map(|preset| preset.epoch == epoch && preset.state == PresetState::Expired)
        .unwrap_or(false);
    if finished {
        registry.presets.remove(&preset_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        removed: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn removed(&self) -> Vec<String> {
            self.removed.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl LayerControl for Recorder {
        async fn remove_layer(&self, layer_id: &str) -> BridgeResult<()> {
            self.removed.lock().unwrap().push(layer_id.to_string());
            Ok(())
        }
    }

    fn manager() -> (PresetManager, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        (PresetManager::new(recorder.clone()), recorder)
    }

    #[tokio::test(start_paused = true)]
    async fn timer_waits_for_first_render() {
        let (presets, recorder) = manager();
        presets.register("lower-third", "name", Some(Duration::from_millis(500)));
        presets.register("lower-third", "title", Some(Duration::from_millis(500)));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(recorder.removed().is_empty());
        assert_eq!(presets.status()[0].state, PresetState::Pending);

        presets.on_layer_rendered("title");
        assert_eq!(presets.status()[0].state, PresetState::Started);
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(recorder.removed(), vec!["name".to_string(), "title".to_string()]);
        assert!(presets.status().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn duration_change_restarts_the_timer() {
        let (presets, recorder) = manager();
        presets.register("p", "a", Some(Duration::from_millis(300)));
        presets.on_layer_rendered("a");
        tokio::time::sleep(Duration::from_millis(200)).await;

        presets.register("p", "a", Some(Duration::from_millis(1_000)));
        assert_eq!(presets.status()[0].state, PresetState::Pending);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(recorder.removed().is_empty());

        presets.on_layer_rendered("a");
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(recorder.removed(), vec!["a".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn remove_preset_clears_timer() {
        let (presets, recorder) = manager();
        presets.register("p", "a", Some(Duration::from_millis(300)));
        presets.on_layer_rendered("a");
        assert_eq!(presets.remove_preset("p").await.unwrap(), vec!["a".to_string()]);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(recorder.removed(), vec!["a".to_string()]);
        assert!(presets.remove_preset("p").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn untimed_presets_never_expire() {
        let (presets, _recorder) = manager();
        presets.register("p", "a", None);
        presets.on_layer_rendered("a");
        assert_eq!(presets.status()[0].state, PresetState::Pending);
    }

    #[test]
    fn forgetting_last_member_drops_preset() {
        let (presets, _recorder) = manager();
        presets.register("p", "a", None);
        presets.register("p", "b", None);
        presets.forget_layer("a");
        assert_eq!(presets.status()[0].members, vec!["b".to_string()]);
        presets.forget_layer("b");
        assert!(presets.status().is_empty());
    }
}
