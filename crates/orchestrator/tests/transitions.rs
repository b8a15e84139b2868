//! Transition behaviour with scripted adapters.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;

use framebridge_common::error::{BridgeError, BridgeResult, ProcessExit};
use framebridge_device_model::{
    Colorspace, Connector, DeviceDescriptor, FrameFormat, OutputConfiguration, OutputKey,
    OutputTargets, PortDescriptor, PortDirection, PortRole, SignalRange, StaticCatalog,
};
use framebridge_orchestrator::{
    LastKnownGoodStore, OutputOrchestrator, TransitionOutcome, TransitionPhase,
};
use framebridge_output::{AdapterFactory, AdapterState, OutputAdapter, VideoFrame};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Behavior {
    Ready,
    ExitBeforeReady,
    Slow(Duration),
}

#[derive(Default)]
struct Journal {
    events: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl Journal {
    fn log(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn position(&self, event: &str) -> usize {
        self.events()
            .iter()
            .position(|e| e == event)
            .unwrap_or_else(|| panic!("missing event {event}"))
    }
}

struct FakeAdapter {
    id: usize,
    key: OutputKey,
    behavior: Behavior,
    journal: Arc<Journal>,
    state: watch::Sender<AdapterState>,
}

impl FakeAdapter {
    fn set_running(&self, running: bool) {
        let was = *self.state.borrow() == AdapterState::Running;
        if running && !was {
            let now = self.journal.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.journal.max_running.fetch_max(now, Ordering::SeqCst);
        } else if !running && was {
            self.journal.running.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait::async_trait]
impl OutputAdapter for FakeAdapter {
    fn kind(&self) -> OutputKey {
        self.key
    }

    fn validate(&self, config: &OutputConfiguration) -> BridgeResult<()> {
        if config.key == self.key {
            Ok(())
        } else {
            Err(BridgeError::config("wrong adapter"))
        }
    }

    async fn configure(&self, _config: &OutputConfiguration) -> BridgeResult<()> {
        let now = self.journal.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.journal.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.journal.log(format!("configure#{}", self.id));
        self.state.send_replace(AdapterState::Configuring);

        let result = match self.behavior {
            Behavior::Ready => Ok(()),
            Behavior::Slow(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            Behavior::ExitBeforeReady => Err(BridgeError::HelperExited {
                helper: format!("fake-{}", self.id),
                exit: ProcessExit {
                    code: Some(1),
                    signal: None,
                },
            }),
        };

        self.journal.in_flight.fetch_sub(1, Ordering::SeqCst);
        match &result {
            Ok(()) => {
                self.set_running(true);
                self.state.send_replace(AdapterState::Running);
            }
            Err(_) => {
                self.state.send_replace(AdapterState::NotConfigured);
            }
        }
        result
    }

    async fn send_frame(&self, _frame: &VideoFrame, _config: &OutputConfiguration) -> BridgeResult<()> {
        Ok(())
    }

    async fn stop(&self) -> BridgeResult<()> {
        self.journal.log(format!("stop#{}", self.id));
        self.set_running(false);
        self.state.send_replace(AdapterState::NotConfigured);
        Ok(())
    }

    fn state(&self) -> AdapterState {
        *self.state.borrow()
    }

    fn watch_state(&self) -> watch::Receiver<AdapterState> {
        self.state.subscribe()
    }
}

#[derive(Default)]
struct FakeFactory {
    script: Mutex<VecDeque<Behavior>>,
    created: Mutex<Vec<Arc<FakeAdapter>>>,
    journal: Arc<Journal>,
}

impl FakeFactory {
    fn scripted(behaviors: &[Behavior]) -> Arc<Self> {
        let factory = Self::default();
        factory.script.lock().unwrap().extend(behaviors.iter().copied());
        Arc::new(factory)
    }

    fn adapter(&self, id: usize) -> Arc<FakeAdapter> {
        self.created.lock().unwrap()[id].clone()
    }

    fn created(&self) -> usize {
        self.created.lock().unwrap().len()
    }
}

impl AdapterFactory for FakeFactory {
    fn create(&self, key: OutputKey) -> Arc<dyn OutputAdapter> {
        let behavior = self.script.lock().unwrap().pop_front().unwrap_or(Behavior::Ready);
        let mut created = self.created.lock().unwrap();
        let (state, _) = watch::channel(AdapterState::NotConfigured);
        let adapter = Arc::new(FakeAdapter {
            id: created.len(),
            key,
            behavior,
            journal: self.journal.clone(),
            state,
        });
        created.push(adapter.clone());
        adapter
    }
}

fn catalog() -> Arc<StaticCatalog> {
    let port = |id: &str, role| PortDescriptor {
        id: id.to_string(),
        device_id: "hdmi0".to_string(),
        display_name: id.to_string(),
        direction: PortDirection::Output,
        role,
        connector: Connector::Hdmi,
        formats: vec![],
        modes: vec![],
        available: true,
    };
    Arc::new(StaticCatalog::new(vec![DeviceDescriptor {
        id: "hdmi0".to_string(),
        display_name: "UltraStudio HD Mini".to_string(),
        vendor: "Blackmagic".to_string(),
        model: "HD Mini".to_string(),
        available: true,
        busy: false,
        supports_external_keying: false,
        ports: vec![
            port("hdmi0-hdmi", PortRole::Video),
            port("hdmi0-key", PortRole::Key),
        ],
    }]))
}

fn display(index: u32) -> OutputConfiguration {
    OutputConfiguration {
        key: OutputKey::Display,
        targets: OutputTargets {
            display_index: Some(index),
            ..Default::default()
        },
        pixel_format: None,
        range: SignalRange::Full,
        colorspace: Colorspace::Auto,
        format: FrameFormat::default(),
    }
}

fn orchestrator(factory: Arc<FakeFactory>, store: Option<LastKnownGoodStore>) -> OutputOrchestrator {
    OutputOrchestrator::new(factory, catalog(), store)
}

fn state_dir() -> std::path::PathBuf {
    std::env::temp_dir().join(format!("framebridge-orch-{}", uuid::Uuid::new_v4()))
}

#[tokio::test]
async fn commit_persists_last_known_good() {
    let dir = state_dir();
    let factory = FakeFactory::scripted(&[]);
    let orch = orchestrator(factory.clone(), Some(LastKnownGoodStore::new(&dir)));

    let report = orch.apply(display(0)).await;
    assert_eq!(report.outcome, Some(TransitionOutcome::Committed));
    assert_eq!(
        report.path(),
        vec![
            TransitionPhase::Idle,
            TransitionPhase::Validating,
            TransitionPhase::StagedApply,
            TransitionPhase::Committed,
            TransitionPhase::Idle
        ]
    );

    let status = orch.status();
    assert_eq!(status.phase, TransitionPhase::Idle);
    assert_eq!(status.active, Some(display(0)));
    assert_eq!(status.adapter_state, Some(AdapterState::Running));
    assert_eq!(LastKnownGoodStore::new(&dir).load(), Some(display(0)));
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn old_output_stays_live_until_new_one_is_ready() {
    let factory = FakeFactory::scripted(&[]);
    let orch = orchestrator(factory.clone(), None);

    assert!(orch.apply(display(0)).await.is_committed());
    assert!(orch.apply(display(1)).await.is_committed());

    assert!(factory.journal.position("configure#1") < factory.journal.position("stop#0"));
    assert_eq!(factory.adapter(0).state(), AdapterState::NotConfigured);
    assert_eq!(factory.adapter(1).state(), AdapterState::Running);
    assert_eq!(factory.journal.running.load(Ordering::SeqCst), 1);
    assert!(factory.journal.max_running.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn failed_stage_keeps_previous_output() {
    let factory = FakeFactory::scripted(&[Behavior::Ready, Behavior::ExitBeforeReady]);
    let orch = orchestrator(factory.clone(), None);

    assert!(orch.apply(display(0)).await.is_committed());
    let report = orch.apply(display(1)).await;

    assert_eq!(report.outcome, Some(TransitionOutcome::RolledBack));
    assert!(report.path().contains(&TransitionPhase::RollingBack));
    assert!(!report.path().contains(&TransitionPhase::Committed));
    assert!(report.error.unwrap().contains("exit code 1"));

    let status = orch.status();
    assert_eq!(status.active, Some(display(0)));
    assert!(status.persistent_error.is_none());
    assert!(status.last_error.is_some());
    assert_eq!(factory.adapter(0).state(), AdapterState::Running);
    assert_eq!(factory.adapter(1).state(), AdapterState::NotConfigured);
    assert_eq!(factory.journal.running.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn rollback_reapplies_on_fresh_adapter_when_previous_died() {
    let factory = FakeFactory::scripted(&[Behavior::Ready, Behavior::ExitBeforeReady, Behavior::Ready]);
    let orch = orchestrator(factory.clone(), None);

    assert!(orch.apply(display(0)).await.is_committed());
    factory.adapter(0).stop().await.unwrap();

    let report = orch.apply(display(1)).await;
    assert_eq!(report.outcome, Some(TransitionOutcome::RolledBack));
    assert_eq!(factory.created(), 3);
    assert_eq!(factory.adapter(2).state(), AdapterState::Running);
    assert_eq!(orch.status().active, Some(display(0)));
}

#[tokio::test]
async fn failed_rollback_is_persistent_until_next_commit() {
    let factory = FakeFactory::scripted(&[
        Behavior::Ready,
        Behavior::ExitBeforeReady,
        Behavior::ExitBeforeReady,
    ]);
    let orch = orchestrator(factory.clone(), None);

    assert!(orch.apply(display(0)).await.is_committed());
    factory.adapter(0).stop().await.unwrap();

    let report = orch.apply(display(1)).await;
    assert_eq!(report.outcome, Some(TransitionOutcome::RollbackFailed));
    assert!(report.rollback_error.is_some());
    let status = orch.status();
    assert!(status.persistent_error.is_some());
    assert!(status.active.is_none());
    assert_eq!(factory.journal.running.load(Ordering::SeqCst), 0);

    // A rejected request does not clear it.
    let mut bad = display(2);
    bad.format.width = 0;
    assert_eq!(orch.apply(bad).await.outcome, Some(TransitionOutcome::Rejected));
    assert!(orch.persistent_error().is_some());

    assert!(orch.apply(display(2)).await.is_committed());
    assert!(orch.persistent_error().is_none());
}

#[tokio::test]
async fn failure_without_last_known_good_leaves_no_output() {
    let factory = FakeFactory::scripted(&[Behavior::ExitBeforeReady]);
    let orch = orchestrator(factory.clone(), None);

    let report = orch.apply(display(0)).await;
    assert_eq!(report.outcome, Some(TransitionOutcome::Failed));
    assert!(orch.status().active.is_none());
    assert!(orch.status().last_error.is_some());
}

#[tokio::test]
async fn keying_requires_device_capability() {
    let factory = FakeFactory::scripted(&[]);
    let orch = orchestrator(factory.clone(), None);
    let request = OutputConfiguration {
        key: OutputKey::KeyFill,
        targets: OutputTargets {
            fill_port: Some("hdmi0-hdmi".to_string()),
            key_port: Some("hdmi0-key".to_string()),
            ..Default::default()
        },
        pixel_format: None,
        range: SignalRange::Legal,
        colorspace: Colorspace::Rec709,
        format: FrameFormat::default(),
    };

    let report = orch.apply(request).await;
    assert_eq!(report.outcome, Some(TransitionOutcome::Rejected));
    assert!(report.error.unwrap().contains("external keying"));
    assert!(factory.journal.events().is_empty());
}

#[tokio::test]
async fn transitions_run_one_at_a_time() {
    let slow = Behavior::Slow(Duration::from_millis(50));
    let factory = FakeFactory::scripted(&[slow, slow, slow, slow]);
    let orch = Arc::new(orchestrator(factory.clone(), None));

    let mut tasks = Vec::new();
    for index in 0..4 {
        let orch = orch.clone();
        tasks.push(tokio::spawn(async move { orch.apply(display(index)).await }));
    }
    for task in tasks {
        assert!(task.await.unwrap().is_committed());
    }

    assert_eq!(factory.journal.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(factory.journal.running.load(Ordering::SeqCst), 1);
    assert!(factory.journal.max_running.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn restore_applies_stored_configuration() {
    let dir = state_dir();
    LastKnownGoodStore::new(&dir).save(&display(3)).unwrap();

    let factory = FakeFactory::scripted(&[]);
    let orch = orchestrator(factory.clone(), Some(LastKnownGoodStore::new(&dir)));
    assert_eq!(orch.last_known_good(), Some(display(3)));
    let report = orch.restore().await.unwrap();
    assert!(report.is_committed());
    assert_eq!(orch.status().active, Some(display(3)));
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn stop_clears_active_output() {
    let factory = FakeFactory::scripted(&[]);
    let orch = orchestrator(factory.clone(), None);
    assert!(orch.apply(display(0)).await.is_committed());
    orch.stop().await.unwrap();
    orch.stop().await.unwrap();
    assert!(orch.status().active.is_none());
    assert_eq!(factory.adapter(0).state(), AdapterState::NotConfigured);
}
