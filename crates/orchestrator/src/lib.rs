//! FrameBridge output orchestration.
//!
//! Owns the single active output of a session and switches it atomically:
//!
//! ```text
//! Idle ─▶ Validating ─▶ StagedApply ─┬─▶ Committed ───┬─▶ Idle
//!              │                     └─▶ RollingBack ─┘
//!              └─────────────────────────────────────────▶ Idle (rejected)
//! ```
//!
//! [`SessionContext`] ties the orchestrator to a compositing host and
//! exposes the operations callers drive a session with.

pub mod orchestrator;
pub mod persist;
pub mod preset;
pub mod relay;
pub mod session;
pub mod transition;
pub mod validate;

pub use orchestrator::{ActiveOutput, OrchestratorStatus, OutputOrchestrator};
pub use persist::LastKnownGoodStore;
pub use preset::{LayerControl, PresetManager, PresetState, PresetStatus};
pub use relay::FrameRelay;
pub use session::{
    OperationResult, PresetRef, RemoveLayerPayload, RemovePresetPayload, SendLayerPayload,
    SessionContext, SessionOptions, SessionStatus, UpdateLayoutPayload, UpdateValuesPayload,
};
pub use transition::{TransitionOutcome, TransitionPhase, TransitionReport};
pub use validate::validate_request;
