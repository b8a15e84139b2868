//! Atomic output transitions.
//!
//! The orchestrator owns the single active output. A transition validates
//! the request, configures a new adapter while the old one keeps running,
//! and only then swaps the two. If the new adapter fails, the
//! last-known-good configuration is brought back; if that fails too the
//! orchestrator holds a persistent error until a later transition
//! succeeds. Transitions run one at a time in request order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;

use framebridge_common::error::BridgeResult;
use framebridge_device_model::{DeviceCatalog, OutputConfiguration};
use framebridge_output::{AdapterFactory, AdapterState, OutputAdapter, VideoFrame};

use crate::persist::LastKnownGoodStore;
use crate::transition::{TransitionOutcome, TransitionPhase, TransitionReport};
use crate::validate::validate_request;

/// The adapter currently driving the output and what it was given.
#[derive(Clone)]
pub struct ActiveOutput {
    pub adapter: Arc<dyn OutputAdapter>,
    pub config: OutputConfiguration,
}

impl std::fmt::Debug for ActiveOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveOutput")
            .field("key", &self.config.key)
            .field("state", &self.adapter.state())
            .finish()
    }
}

/// Snapshot for status reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrchestratorStatus {
    pub phase: TransitionPhase,
    pub active: Option<OutputConfiguration>,
    pub adapter_state: Option<AdapterState>,
    pub last_known_good: Option<OutputConfiguration>,
    pub last_error: Option<String>,
    /// Set when a rollback failed. Cleared by the next committed transition.
    pub persistent_error: Option<String>,
    pub last_transition: Option<TransitionReport>,
}

#[derive(Default)]
struct State {
    phase: Option<TransitionPhase>,
    active: Option<ActiveOutput>,
    last_known_good: Option<OutputConfiguration>,
    last_error: Option<String>,
    persistent_error: Option<String>,
    last_report: Option<TransitionReport>,
}

pub struct OutputOrchestrator {
    factory: Arc<dyn AdapterFactory>,
    catalog: Arc<dyn DeviceCatalog>,
    store: Option<LastKnownGoodStore>,
    serial: tokio::sync::Mutex<()>,
    state: Mutex<State>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for OutputOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputOrchestrator")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl OutputOrchestrator {
    /// Create an orchestrator. A stored last-known-good configuration is
    /// loaded but not applied; see [`OutputOrchestrator::restore`].
    pub fn new(
        factory: Arc<dyn AdapterFactory>,
        catalog: Arc<dyn DeviceCatalog>,
        store: Option<LastKnownGoodStore>,
    ) -> Self {
        let last_known_good = store.as_ref().and_then(LastKnownGoodStore::load);
        if let Some(config) = &last_known_good {
            tracing::info!(output = %config.key, "Loaded last-known-good output");
        }
        Self {
            factory,
            catalog,
            store,
            serial: tokio::sync::Mutex::new(()),
            state: Mutex::new(State {
                last_known_good,
                ..State::default()
            }),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn enter(&self, report: &mut TransitionReport, phase: TransitionPhase) {
        report.advance(phase);
        self.lock().phase = Some(phase);
    }

    pub fn status(&self) -> OrchestratorStatus {
        let state = self.lock();
        OrchestratorStatus {
            phase: state.phase.unwrap_or(TransitionPhase::Idle),
            active: state.active.as_ref().map(|a| a.config.clone()),
            adapter_state: state.active.as_ref().map(|a| a.adapter.state()),
            last_known_good: state.last_known_good.clone(),
            last_error: state.last_error.clone(),
            persistent_error: state.persistent_error.clone(),
            last_transition: state.last_report.clone(),
        }
    }

    pub fn active(&self) -> Option<ActiveOutput> {
        self.lock().active.clone()
    }

    pub fn last_known_good(&self) -> Option<OutputConfiguration> {
        self.lock().last_known_good.clone()
    }

    pub fn persistent_error(&self) -> Option<String> {
        self.lock().persistent_error.clone()
    }

    /// Push a frame to the active adapter (legacy path only).
    pub async fn send_frame(&self, frame: &VideoFrame) -> BridgeResult<()> {
        match self.active() {
            Some(active) => active.adapter.send_frame(frame, &active.config).await,
            None => Err(framebridge_common::error::BridgeError::NotConfigured),
        }
    }

    /// Run one transition to `config`. Waits for any transition already in
    /// flight to settle first.
    pub async fn apply(&self, config: OutputConfiguration) -> TransitionReport {
        let _serial = self.serial.lock().await;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut report = TransitionReport::new(id, config.key);
        tracing::info!(transition = id, output = %config.key, "Output transition requested");

        self.enter(&mut report, TransitionPhase::Validating);
        let candidate = self.factory.create(config.key);
        if let Err(e) = validate_request(&config, self.catalog.as_ref(), candidate.as_ref()) {
            tracing::warn!(transition = id, error = %e, "Output transition rejected");
            report.error = Some(e.to_string());
            return self.settle(report, TransitionOutcome::Rejected);
        }

        self.enter(&mut report, TransitionPhase::StagedApply);
        match candidate.configure(&config).await {
            Ok(()) => {
                self.enter(&mut report, TransitionPhase::Committed);
                self.commit(candidate, config).await;
                tracing::info!(transition = id, "Output transition committed");
                self.settle(report, TransitionOutcome::Committed)
            }
            Err(e) => {
                tracing::warn!(transition = id, error = %e, "Staged apply failed; rolling back");
                report.error = Some(e.to_string());
                if let Err(stop_err) = candidate.stop().await {
                    tracing::warn!(transition = id, error = %stop_err, "Failed to stop rejected adapter");
                }
                self.enter(&mut report, TransitionPhase::RollingBack);
                let outcome = match self.roll_back().await {
                    Ok(outcome) => outcome,
                    Err(rollback_err) => {
                        report.rollback_error = Some(rollback_err);
                        TransitionOutcome::RollbackFailed
                    }
                };
                self.settle(report, outcome)
            }
        }
    }

    /// Re-apply the stored last-known-good configuration, if any.
    pub async fn restore(&self) -> Option<TransitionReport> {
        let config = self.last_known_good()?;
        Some(self.apply(config).await)
    }

    /// Stop the active adapter. Waits for an in-flight transition.
    pub async fn stop(&self) -> BridgeResult<()> {
        let _serial = self.serial.lock().await;
        let active = self.lock().active.take();
        if let Some(active) = active {
            tracing::info!(output = %active.config.key, "Stopping active output");
            active.adapter.stop().await?;
        }
        Ok(())
    }

    /// Swap in `adapter` as the active output and stop the previous one.
    async fn commit(&self, adapter: Arc<dyn OutputAdapter>, config: OutputConfiguration) {
        let previous = {
            let mut state = self.lock();
            state.last_known_good = Some(config.clone());
            state.persistent_error = None;
            state.last_error = None;
            state.active.replace(ActiveOutput {
                adapter,
                config: config.clone(),
            })
        };

        if let Some(store) = &self.store {
            if let Err(e) = store.save(&config) {
                tracing::warn!(error = %e, "Failed to persist last-known-good output");
            }
        }

        if let Some(previous) = previous {
            if let Err(e) = previous.adapter.stop().await {
                tracing::warn!(error = %e, "Failed to stop previous output adapter");
            }
        }
    }

    async fn roll_back(&self) -> Result<TransitionOutcome, String> {
        let (last_known_good, live) = {
            let state = self.lock();
            (state.last_known_good.clone(), state.active.clone())
        };
        let Some(last_known_good) = last_known_good else {
            tracing::warn!("No last-known-good output to roll back to");
            return Ok(TransitionOutcome::Failed);
        };

        // The previous adapter was never touched; if it still runs the
        // last-known-good configuration there is nothing to re-apply.
        if let Some(live) = &live {
            if live.config == last_known_good && live.adapter.state() == AdapterState::Running {
                tracing::info!(output = %live.config.key, "Previous output still live");
                return Ok(TransitionOutcome::RolledBack);
            }
        }

        let fresh = self.factory.create(last_known_good.key);
        let reapplied = match validate_request(&last_known_good, self.catalog.as_ref(), fresh.as_ref()) {
            Ok(()) => fresh.configure(&last_known_good).await,
            Err(e) => Err(e),
        };
        match reapplied {
            Ok(()) => {
                let previous = self.lock().active.replace(ActiveOutput {
                    adapter: fresh,
                    config: last_known_good,
                });
                if let Some(previous) = previous {
                    let _ = previous.adapter.stop().await;
                }
                tracing::info!("Rolled back to last-known-good output");
                Ok(TransitionOutcome::RolledBack)
            }
            Err(e) => {
                tracing::error!(error = %e, "Rollback to last-known-good failed");
                let _ = fresh.stop().await;
                let previous = self.lock().active.take();
                if let Some(previous) = previous {
                    let _ = previous.adapter.stop().await;
                }
                Err(e.to_string())
            }
        }
    }

    fn settle(&self, mut report: TransitionReport, outcome: TransitionOutcome) -> TransitionReport {
        report.finish(outcome);
        let mut state = self.lock();
        state.phase = Some(TransitionPhase::Idle);
        match outcome {
            TransitionOutcome::Committed => {}
            TransitionOutcome::RollbackFailed => {
                let message = format!(
                    "Output transition failed ({}) and rollback failed ({})",
                    report.error.as_deref().unwrap_or("unknown"),
                    report.rollback_error.as_deref().unwrap_or("unknown")
                );
                state.last_error = Some(message.clone());
                state.persistent_error = Some(message);
            }
            _ => state.last_error = report.error.clone(),
        }
        state.last_report = Some(report.clone());
        report
    }
}
