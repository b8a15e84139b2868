//! Output adapters.
//!
//! An adapter owns at most one helper process. `configure` always tears
//! down the previous helper first and resolves once the new one reports
//! ready. `stop` may be called at any time, including while a configure
//! is waiting; stop always wins and the adapter ends not configured.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use framebridge_common::error::{BridgeError, BridgeResult};
use framebridge_device_model::{OutputConfiguration, OutputKey};

use crate::backpressure::{LatestFrame, Offer, VideoFrame};
use crate::helper::{HelperProcess, HelperTimeouts};
use crate::sinks::{sink_for, AdapterContext, Sink};

/// Observable adapter lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterState {
    NotConfigured,
    Configuring,
    Running,
    Stopping,
    /// The helper exited while running.
    Failed,
}

/// Common contract for all output sinks.
#[async_trait::async_trait]
pub trait OutputAdapter: Send + Sync {
    /// Topology this adapter drives.
    fn kind(&self) -> OutputKey;

    /// Check `config` against live device data without spawning anything.
    fn validate(&self, config: &OutputConfiguration) -> BridgeResult<()>;

    /// Stop any running helper, then start one for `config` and wait for
    /// it to report ready.
    async fn configure(&self, config: &OutputConfiguration) -> BridgeResult<()>;

    /// Hand a frame to the helper. A no-op on the Frame Bus path.
    async fn send_frame(&self, frame: &VideoFrame, config: &OutputConfiguration) -> BridgeResult<()>;

    /// Stop the helper. Safe to call repeatedly.
    async fn stop(&self) -> BridgeResult<()>;

    fn state(&self) -> AdapterState;

    fn watch_state(&self) -> watch::Receiver<AdapterState>;
}

/// Creates adapters for the orchestrator.
pub trait AdapterFactory: Send + Sync {
    fn create(&self, key: OutputKey) -> Arc<dyn OutputAdapter>;
}

struct Running {
    process: HelperProcess,
    frames: Option<Arc<LatestFrame>>,
    monitor: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Slot {
    generation: u64,
    current: Option<Running>,
}

struct Shared {
    slot: Mutex<Slot>,
    state: watch::Sender<AdapterState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Publish `state` only if no stop or configure has started since
    /// `generation`.
    fn set_state_if_current(&self, generation: u64, state: AdapterState) -> bool {
        let slot = self.lock();
        if slot.generation != generation {
            return false;
        }
        self.state.send_replace(state);
        true
    }
}

/// Adapter driving one helper process per configuration.
pub struct HelperAdapter {
    sink: Box<dyn Sink>,
    context: AdapterContext,
    timeouts: HelperTimeouts,
    shared: Arc<Shared>,
}

impl HelperAdapter {
    pub fn new(sink: Box<dyn Sink>, context: AdapterContext) -> Self {
        let timeouts = HelperTimeouts::from(&context.helpers);
        let (state, _) = watch::channel(AdapterState::NotConfigured);
        Self {
            sink,
            context,
            timeouts,
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot::default()),
                state,
            }),
        }
    }

    pub fn for_key(key: OutputKey, context: AdapterContext) -> Self {
        Self::new(sink_for(key), context)
    }

    /// Frames dropped under backpressure on the legacy path.
    pub fn frames_replaced(&self) -> u64 {
        self.shared
            .lock()
            .current
            .as_ref()
            .and_then(|running| running.frames.as_ref())
            .map(|frames| frames.replaced())
            .unwrap_or(0)
    }

    /// Start a new generation and take whatever helper is current.
    fn begin(&self) -> (u64, Option<Running>) {
        let mut slot = self.shared.lock();
        slot.generation += 1;
        (slot.generation, slot.current.take())
    }

    async fn teardown(&self, running: Running) {
        let Running {
            process,
            frames,
            monitor,
        } = running;
        if let Some(monitor) = monitor {
            monitor.abort();
        }
        if let Some(frames) = frames {
            frames.close();
        }
        let label = process.label().to_string();
        let exit = process.shutdown(&self.timeouts).await;
        tracing::info!(
            helper = %label,
            code = ?exit.code,
            signal = ?exit.signal,
            "Helper stopped"
        );
    }

    async fn start(&self, generation: u64, config: &OutputConfiguration) -> BridgeResult<()> {
        let command = self.sink.plan(config, &self.context)?;
        if !self.shared.set_state_if_current(generation, AdapterState::Configuring) {
            return Err(cancelled());
        }

        let mut process = HelperProcess::spawn(&command)?;
        let frames = if self.context.use_frame_bus {
            None
        } else {
            Some(process.start_frame_pump()?)
        };
        let ready = process
            .take_ready()
            .ok_or_else(|| BridgeError::process("Helper readiness already consumed"))?;
        let exit = process.exit_watch();

        // Park the process where stop() can reach it while we wait.
        let stale = {
            let mut slot = self.shared.lock();
            if slot.generation == generation {
                slot.current = Some(Running {
                    process,
                    frames,
                    monitor: None,
                });
                None
            } else {
                Some(Running {
                    process,
                    frames,
                    monitor: None,
                })
            }
        };
        if let Some(stale) = stale {
            self.teardown(stale).await;
            return Err(cancelled());
        }

        let outcome = ready.wait(self.timeouts.ready).await;

        let (failed, error) = {
            let mut slot = self.shared.lock();
            if slot.generation != generation {
                return Err(cancelled());
            }
            match outcome {
                Ok(()) => {
                    let monitor = tokio::spawn(monitor_exit(
                        self.shared.clone(),
                        generation,
                        self.sink.key(),
                        exit,
                    ));
                    if let Some(running) = slot.current.as_mut() {
                        running.monitor = Some(monitor);
                    }
                    self.shared.state.send_replace(AdapterState::Running);
                    return Ok(());
                }
                Err(e) => {
                    self.shared.state.send_replace(AdapterState::NotConfigured);
                    (slot.current.take(), e)
                }
            }
        };
        if let Some(failed) = failed {
            self.teardown(failed).await;
        }
        Err(error)
    }
}

fn cancelled() -> BridgeError {
    BridgeError::process("Configure cancelled by stop")
}

async fn monitor_exit(
    shared: Arc<Shared>,
    generation: u64,
    key: OutputKey,
    mut exit: watch::Receiver<Option<framebridge_common::error::ProcessExit>>,
) {
    let status = loop {
        if let Some(status) = *exit.borrow_and_update() {
            break status;
        }
        if exit.changed().await.is_err() {
            return;
        }
    };
    let slot = shared.lock();
    let running = *shared.state.borrow() == AdapterState::Running;
    if slot.generation == generation && running {
        tracing::error!(
            output = %key,
            code = ?status.code,
            signal = ?status.signal,
            "Helper exited while running"
        );
        shared.state.send_replace(AdapterState::Failed);
    }
}

#[async_trait::async_trait]
impl OutputAdapter for HelperAdapter {
    fn kind(&self) -> OutputKey {
        self.sink.key()
    }

    fn validate(&self, config: &OutputConfiguration) -> BridgeResult<()> {
        if config.key != self.sink.key() {
            return Err(BridgeError::config(format!(
                "{} adapter cannot drive a {} output",
                self.sink.key(),
                config.key
            )));
        }
        self.sink.plan(config, &self.context).map(drop)
    }

    async fn configure(&self, config: &OutputConfiguration) -> BridgeResult<()> {
        self.validate(config)?;

        let (generation, previous) = self.begin();
        if let Some(previous) = previous {
            self.shared
                .set_state_if_current(generation, AdapterState::Stopping);
            self.teardown(previous).await;
        }

        tracing::info!(output = %config.key, "Configuring output adapter");
        match self.start(generation, config).await {
            Ok(()) => {
                tracing::info!(output = %config.key, "Output adapter running");
                Ok(())
            }
            Err(e) => {
                self.shared
                    .set_state_if_current(generation, AdapterState::NotConfigured);
                tracing::warn!(output = %config.key, error = %e, "Output adapter configure failed");
                Err(e)
            }
        }
    }

    async fn send_frame(&self, frame: &VideoFrame, config: &OutputConfiguration) -> BridgeResult<()> {
        if self.context.use_frame_bus {
            return Ok(());
        }
        let frames = {
            let slot = self.shared.lock();
            match (&slot.current, *self.shared.state.borrow()) {
                (Some(running), AdapterState::Running) => running.frames.clone(),
                _ => None,
            }
        };
        let Some(frames) = frames else {
            return Err(BridgeError::NotConfigured);
        };

        if frame.rgba.len() != frame.width as usize * frame.height as usize * 4 {
            return Err(BridgeError::protocol(format!(
                "Frame of {} bytes is not {}x{} RGBA",
                frame.rgba.len(),
                frame.width,
                frame.height
            )));
        }
        if frame.width != config.format.width || frame.height != config.format.height {
            tracing::debug!(
                width = frame.width,
                height = frame.height,
                "Frame size differs from the configured output"
            );
        }
        match frames.offer(frame.clone()).await {
            Offer::Queued => Ok(()),
            Offer::Held | Offer::Replaced => {
                tracing::trace!(output = %config.key, "Helper busy; frame held");
                Ok(())
            }
            Offer::Closed => Err(BridgeError::process(format!(
                "{} helper stopped accepting frames",
                config.key
            ))),
        }
    }

    async fn stop(&self) -> BridgeResult<()> {
        let (generation, current) = self.begin();
        if let Some(current) = current {
            self.shared
                .set_state_if_current(generation, AdapterState::Stopping);
            self.teardown(current).await;
        }
        self.shared
            .set_state_if_current(generation, AdapterState::NotConfigured);
        Ok(())
    }

    fn state(&self) -> AdapterState {
        *self.shared.state.borrow()
    }

    fn watch_state(&self) -> watch::Receiver<AdapterState> {
        self.shared.state.subscribe()
    }
}

impl Drop for HelperAdapter {
    fn drop(&mut self) {
        // Dropping the process handle kills the helper.
        let mut slot = self.shared.lock();
        if let Some(running) = slot.current.take() {
            if let Some(monitor) = running.monitor {
                monitor.abort();
            }
            if let Some(frames) = running.frames {
                frames.close();
            }
        }
    }
}

/// Builds [`HelperAdapter`]s sharing one context.
#[derive(Debug, Clone)]
pub struct HelperAdapterFactory {
    context: AdapterContext,
}

impl HelperAdapterFactory {
    pub fn new(context: AdapterContext) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &AdapterContext {
        &self.context
    }
}

impl AdapterFactory for HelperAdapterFactory {
    fn create(&self, key: OutputKey) -> Arc<dyn OutputAdapter> {
        Arc::new(HelperAdapter::for_key(key, self.context.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sinks::fixtures::{config, context};
    use framebridge_device_model::OutputTargets;

    #[tokio::test]
    async fn stop_is_idempotent_when_idle() {
        let adapter = HelperAdapter::for_key(OutputKey::Display, context(true));
        adapter.stop().await.unwrap();
        adapter.stop().await.unwrap();
        assert_eq!(adapter.state(), AdapterState::NotConfigured);
    }

    #[tokio::test]
    async fn send_frame_is_a_no_op_on_the_frame_bus() {
        let adapter = HelperAdapter::for_key(OutputKey::Display, context(true));
        let cfg = config(OutputKey::Display, OutputTargets::default());
        let frame = VideoFrame {
            width: 1,
            height: 1,
            timestamp_ns: 0,
            rgba: vec![0; 4],
        };
        assert!(adapter.send_frame(&frame, &cfg).await.is_ok());
    }

    #[tokio::test]
    async fn send_frame_requires_running_on_legacy_path() {
        let adapter = HelperAdapter::for_key(OutputKey::Video, context(false));
        let cfg = config(OutputKey::Video, OutputTargets::default());
        let frame = VideoFrame {
            width: 1,
            height: 1,
            timestamp_ns: 0,
            rgba: vec![0; 4],
        };
        assert!(matches!(
            adapter.send_frame(&frame, &cfg).await,
            Err(BridgeError::NotConfigured)
        ));
    }

    #[test]
    fn validate_rejects_mismatched_topology() {
        let adapter = HelperAdapter::for_key(OutputKey::Video, context(true));
        let cfg = config(OutputKey::Display, OutputTargets::default());
        assert!(adapter.validate(&cfg).unwrap_err().is_config());
    }
}
