//! Session context: the pipeline's public surface.
//!
//! One [`SessionContext`] per session, passed explicitly to whoever drives
//! it. Every operation reports success or failure with a reason instead of
//! returning errors across the boundary.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use framebridge_common::config::AppConfig;
use framebridge_common::error::BridgeResult;
use framebridge_compositor::{
    spawn_host, BackgroundMode, BackgroundPolicy, CompositorClient, FrameBusTarget, HostEvent,
    HostHandle, HostStatus, LayerLayout, LayerSpec, RenderEngine, RendererConfig, SoftwareEngine,
    ValueMap,
};
use framebridge_device_model::{DeviceCatalog, FrameFormat, OutputConfiguration, OutputKey};
use framebridge_frame_bus::PixelFormat;
use framebridge_output::{AdapterContext, AdapterFactory, HelperAdapterFactory};

use crate::orchestrator::{OrchestratorStatus, OutputOrchestrator};
use crate::persist::LastKnownGoodStore;
use crate::preset::{PresetManager, PresetStatus};
use crate::relay::FrameRelay;

/// Outcome of a session operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResult {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl OperationResult {
    pub fn success() -> Self {
        Self {
            ok: true,
            reason: None,
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            reason: Some(reason.into()),
        }
    }

    fn from_result(op: &str, result: BridgeResult<()>) -> Self {
        match result {
            Ok(()) => Self::success(),
            Err(e) => {
                tracing::warn!(operation = op, error = %e, "Session operation failed");
                Self::failure(e.to_string())
            }
        }
    }
}

/// Preset membership carried by `send_layer`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresetRef {
    pub id: String,
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SendLayerPayload {
    #[serde(flatten)]
    pub layer: LayerSpec,
    #[serde(default)]
    pub preset: Option<PresetRef>,
    /// Raw RGBA matching `layer.asset`; travels as the message payload.
    #[serde(skip)]
    pub asset_rgba: Vec<u8>,
}

impl SendLayerPayload {
    pub fn new(layer: LayerSpec) -> Self {
        Self {
            layer,
            preset: None,
            asset_rgba: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UpdateValuesPayload {
    pub layer_id: String,
    #[serde(default)]
    pub values: ValueMap,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UpdateLayoutPayload {
    pub layer_id: String,
    pub layout: LayerLayout,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoveLayerPayload {
    pub layer_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemovePresetPayload {
    pub preset_id: String,
}

/// Everything reported by `get_status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    /// Base name; the live region is reported by the compositor.
    pub framebus_name: String,
    pub use_frame_bus: bool,
    pub compositor: Option<HostStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compositor_error: Option<String>,
    pub output: OrchestratorStatus,
    pub presets: Vec<PresetStatus>,
}

/// How to build a session.
pub struct SessionOptions {
    pub config: AppConfig,
    pub catalog: Arc<dyn DeviceCatalog>,
    /// Renderer format before any output is configured.
    pub initial_format: FrameFormat,
    /// Base Frame Bus name, defaulting to `<frame_bus.name_prefix>-<random>`.
    /// Each output format gets its own region under it.
    pub framebus_name: Option<String>,
    /// Defaults to helper-process adapters.
    pub factory: Option<Arc<dyn AdapterFactory>>,
    /// Bring back the stored last-known-good output on start.
    pub restore_outputs: bool,
}

impl SessionOptions {
    pub fn new(config: AppConfig, catalog: Arc<dyn DeviceCatalog>) -> Self {
        Self {
            config,
            catalog,
            initial_format: FrameFormat::default(),
            framebus_name: None,
            factory: None,
            restore_outputs: false,
        }
    }
}

pub struct SessionContext {
    id: String,
    started_at: DateTime<Utc>,
    config: AppConfig,
    framebus_name: String,
    client: Arc<CompositorClient>,
    host: std::sync::Mutex<Option<HostHandle>>,
    orchestrator: Arc<OutputOrchestrator>,
    presets: Arc<PresetManager>,
    renderer: Mutex<RendererConfig>,
    relay: Option<FrameRelay>,
    event_task: JoinHandle<()>,
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("id", &self.id)
            .field("framebus_name", &self.framebus_name)
            .finish_non_exhaustive()
    }
}

fn background_for(key: Option<OutputKey>) -> BackgroundPolicy {
    match key {
        // Keyers need real alpha.
        Some(OutputKey::KeyFill) | None => BackgroundPolicy::default(),
        Some(_) => BackgroundPolicy {
            mode: BackgroundMode::Solid,
            clear_color: [0, 0, 0, 255],
        },
    }
}

fn renderer_config(
    config: &AppConfig,
    framebus_name: &str,
    format: &FrameFormat,
    key: Option<OutputKey>,
) -> RendererConfig {
    RendererConfig {
        width: format.width,
        height: format.height,
        fps: format.bus_fps(),
        pixel_format: PixelFormat::Rgba8,
        framebus: FrameBusTarget {
            name: format.framebus_name(framebus_name),
            slot_count: config.frame_bus.slot_count,
            force_recreate: true,
            shm_dir: config.frame_bus.shm_dir.clone(),
        },
        background: background_for(key),
        retain_previous: false,
    }
}

impl SessionContext {
    /// Start an in-process compositing host with the software engine and
    /// attach a session to it.
    pub async fn start(options: SessionOptions) -> BridgeResult<Self> {
        Self::start_with_engine(options, Box::new(SoftwareEngine::new())).await
    }

    pub async fn start_with_engine(
        options: SessionOptions,
        engine: Box<dyn RenderEngine>,
    ) -> BridgeResult<Self> {
        let host = spawn_host(engine, &options.config.control).await?;
        let client = match CompositorClient::connect(host.addr(), host.token(), &options.config.control).await {
            Ok(client) => client,
            Err(e) => {
                host.shutdown().await;
                return Err(e);
            }
        };
        Self::attach(client, Some(host), options).await
    }

    /// Attach to a compositing host running elsewhere on this machine.
    pub async fn connect(addr: SocketAddr, token: &str, options: SessionOptions) -> BridgeResult<Self> {
        let client = CompositorClient::connect(addr, token, &options.config.control).await?;
        Self::attach(client, None, options).await
    }

    async fn attach(
        client: CompositorClient,
        host: Option<HostHandle>,
        options: SessionOptions,
    ) -> BridgeResult<Self> {
        let SessionOptions {
            config,
            catalog,
            initial_format,
            framebus_name,
            factory,
            restore_outputs,
        } = options;

        let id = uuid::Uuid::new_v4().simple().to_string();
        let framebus_name = framebus_name
            .unwrap_or_else(|| format!("{}-{}", config.frame_bus.name_prefix, &id[..12]));
        let client = Arc::new(client);

        let renderer = renderer_config(&config, &framebus_name, &initial_format, None);
        if let Err(e) = client.configure_renderer(renderer.clone()).await {
            if let Some(host) = host {
                host.shutdown().await;
            }
            return Err(e);
        }

        let factory = factory.unwrap_or_else(|| {
            Arc::new(HelperAdapterFactory::new(AdapterContext {
                helpers: config.helpers.clone(),
                use_frame_bus: config.output.use_frame_bus,
                framebus_name: framebus_name.clone(),
                catalog: catalog.clone(),
            }))
        });
        let store = config.state_dir.as_deref().map(LastKnownGoodStore::new);
        let orchestrator = Arc::new(OutputOrchestrator::new(factory, catalog, store));

        let presets = Arc::new(PresetManager::new(client.clone()));
        let event_task = tokio::spawn(forward_events(client.subscribe(), Arc::downgrade(&presets)));

        let relay = (!config.output.use_frame_bus).then(|| {
            FrameRelay::spawn(
                orchestrator.clone(),
                renderer.framebus.name.clone(),
                config.frame_bus.shm_dir.clone(),
                renderer.fps,
            )
        });

        tracing::info!(
            session = %id,
            framebus = %framebus_name,
            use_frame_bus = config.output.use_frame_bus,
            "Session started"
        );

        let session = Self {
            id,
            started_at: Utc::now(),
            config,
            framebus_name,
            client,
            host: std::sync::Mutex::new(host),
            orchestrator,
            presets,
            renderer: Mutex::new(renderer),
            relay,
            event_task,
        };

        if restore_outputs {
            if let Some(config) = session.orchestrator.last_known_good() {
                let result = session.configure_outputs(config).await;
                if !result.ok {
                    tracing::warn!(reason = ?result.reason, "Could not restore last-known-good output");
                }
            }
        }
        Ok(session)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn framebus_name(&self) -> &str {
        &self.framebus_name
    }

    pub fn orchestrator(&self) -> &OutputOrchestrator {
        &self.orchestrator
    }

    /// Host events (`layer_rendered`, ...).
    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.client.subscribe()
    }

    /// Atomically switch the session's output.
    ///
    /// The region for the requested format (and for the last-known-good
    /// one, if a rollback would need it) is staged next to the live one, so
    /// the running output keeps receiving frames throughout. Once the
    /// transition settles only the region of the surviving output is kept.
    pub async fn configure_outputs(&self, config: OutputConfiguration) -> OperationResult {
        if let Err(e) = config.validate_shape() {
            return OperationResult::from_result("configure_outputs", Err(e));
        }

        let mut renderer = self.renderer.lock().await;
        let previous = renderer.clone();

        let mut staged = false;
        for region in self.regions_to_stage(&config, &previous) {
            if let Err(e) = self.client.configure_renderer(region.clone()).await {
                if staged {
                    self.settle_renderer(&mut renderer, previous).await;
                }
                return OperationResult::from_result("configure_outputs", Err(e));
            }
            *renderer = RendererConfig {
                retain_previous: false,
                ..region
            };
            staged = true;
        }

        let report = self.orchestrator.apply(config).await;

        let settled = match self.orchestrator.active() {
            Some(active) => self.renderer_for(&active.config.format, Some(active.config.key)),
            None => previous,
        };
        if staged || settled != *renderer {
            self.settle_renderer(&mut renderer, settled).await;
        }

        if report.is_committed() {
            return OperationResult::success();
        }
        let mut reason = report
            .error
            .clone()
            .unwrap_or_else(|| "Output transition failed".to_string());
        if let Some(rollback) = &report.rollback_error {
            reason = format!("{reason}; rollback failed: {rollback}");
        }
        OperationResult::failure(reason)
    }

    fn renderer_for(&self, format: &FrameFormat, key: Option<OutputKey>) -> RendererConfig {
        renderer_config(&self.config, &self.framebus_name, format, key)
    }

    /// Regions that must be fed before `config` is applied, in order; the
    /// last one becomes the primary.
    fn regions_to_stage(&self, config: &OutputConfiguration, previous: &RendererConfig) -> Vec<RendererConfig> {
        let wanted = self.renderer_for(&config.format, Some(config.key));
        let mut regions = Vec::new();
        if let Some(fallback) = self.orchestrator.last_known_good() {
            let fallback = self.renderer_for(&fallback.format, Some(fallback.key));
            if fallback.framebus.name != previous.framebus.name
                && fallback.framebus.name != wanted.framebus.name
            {
                regions.push(fallback);
            }
        }
        if wanted != *previous || !regions.is_empty() {
            regions.push(wanted);
        }
        for region in &mut regions {
            region.retain_previous = true;
        }
        regions
    }

    /// Make `target` the only region the host feeds.
    async fn settle_renderer(&self, current: &mut RendererConfig, target: RendererConfig) {
        match self.client.configure_renderer(target.clone()).await {
            Ok(()) => {
                if let Some(relay) = &self.relay {
                    relay.reopen(target.framebus.name.clone(), target.fps);
                }
                *current = target;
            }
            Err(e) => tracing::warn!(framebus = %target.framebus.name, error = %e, "Failed to settle renderer"),
        }
    }

    /// Create or replace a layer.
    pub async fn send_layer(&self, payload: SendLayerPayload) -> OperationResult {
        let SendLayerPayload {
            layer,
            preset,
            asset_rgba,
        } = payload;
        let layer_id = layer.layer_id.clone();

        // Register first so an early `layer_rendered` is not missed.
        if let Some(preset) = &preset {
            let duration = preset.duration_ms.map(Duration::from_millis);
            self.presets.register(&preset.id, &layer_id, duration);
        }

        let result = self.client.create_layer(layer, asset_rgba).await;
        if result.is_err() && preset.is_some() {
            self.presets.forget_layer(&layer_id);
        }
        OperationResult::from_result("send_layer", result)
    }

    pub async fn update_values(&self, payload: UpdateValuesPayload) -> OperationResult {
        let result = self
            .client
            .update_values(&payload.layer_id, payload.values)
            .await;
        OperationResult::from_result("update_values", result)
    }

    pub async fn update_layout(&self, payload: UpdateLayoutPayload) -> OperationResult {
        let result = self
            .client
            .update_layout(&payload.layer_id, payload.layout)
            .await;
        OperationResult::from_result("update_layout", result)
    }

    pub async fn remove_layer(&self, payload: RemoveLayerPayload) -> OperationResult {
        let result = self.client.remove_layer(&payload.layer_id).await;
        self.presets.forget_layer(&payload.layer_id);
        OperationResult::from_result("remove_layer", result)
    }

    /// Remove every layer of a preset and clear its timer. An unknown
    /// preset is a no-op.
    pub async fn remove_preset(&self, payload: RemovePresetPayload) -> OperationResult {
        let result = self
            .presets
            .remove_preset(&payload.preset_id)
            .await
            .map(drop);
        OperationResult::from_result("remove_preset", result)
    }

    /// Show colour bars above all layers.
    pub async fn send_test_pattern(&self) -> OperationResult {
        OperationResult::from_result("send_test_pattern", self.client.test_pattern(true).await)
    }

    pub async fn get_status(&self) -> SessionStatus {
        let (compositor, compositor_error) = match self.client.status().await {
            Ok(status) => (Some(status), None),
            Err(e) => (None, Some(e.to_string())),
        };
        SessionStatus {
            session_id: self.id.clone(),
            started_at: self.started_at,
            framebus_name: self.framebus_name.clone(),
            use_frame_bus: self.config.output.use_frame_bus,
            compositor,
            compositor_error,
            output: self.orchestrator.status(),
            presets: self.presets.status(),
        }
    }

    /// Stop outputs and presets, then the host if this session owns it.
    pub async fn close(&self) -> BridgeResult<()> {
        self.presets.clear();
        let stopped = self.orchestrator.stop().await;

        let host = self
            .host
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(host) = host {
            if let Err(e) = self.client.shutdown().await {
                tracing::debug!(error = %e, "Host shutdown request failed");
            }
            host.shutdown().await;
        }
        tracing::info!(session = %self.id, "Session closed");
        stopped
    }
}

impl Drop for SessionContext {
    fn drop(&mut self) {
        self.event_task.abort();
    }
}

async fn forward_events(mut events: broadcast::Receiver<HostEvent>, presets: Weak<PresetManager>) {
    loop {
        match events.recv().await {
            Ok(HostEvent::LayerRendered { layer_id }) => {
                let Some(presets) = presets.upgrade() else {
                    break;
                };
                presets.on_layer_rendered(&layer_id);
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "Dropped host events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
