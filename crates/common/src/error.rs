//! Error types shared across FrameBridge crates.
//!
//! Errors are grouped by where they originate so callers can decide how
//! to react: configuration errors are rejected before anything is
//! spawned, process errors fail the pending configure/transition,
//! transport errors terminate a single connection, and shared-memory
//! errors fail fast at configure time.

use std::fmt;
use std::path::PathBuf;

/// How a helper process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProcessExit {
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
    /// Terminating signal, if the process was killed by one.
    pub signal: Option<i32>,
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// Top-level error type for FrameBridge operations.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Process error: {message}")]
    Process { message: String },

    #[error("Helper '{helper}' exited before ready ({exit})")]
    HelperExited { helper: String, exit: ProcessExit },

    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Shared memory error: {message}")]
    SharedMemory { message: String },

    #[error("Compositor error: {message}")]
    Compositor { message: String },

    #[error("Transition error: {message}")]
    Transition { message: String },

    #[error("Timed out after {millis}ms waiting for {what}")]
    Timeout { what: String, millis: u64 },

    #[error("Adapter is not configured")]
    NotConfigured,

    #[error("File not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias using BridgeError.
pub type BridgeResult<T> = Result<T, BridgeError>;

impl BridgeError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    pub fn process(msg: impl Into<String>) -> Self {
        Self::Process {
            message: msg.into(),
        }
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport {
            message: msg.into(),
        }
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol {
            message: msg.into(),
        }
    }

    pub fn shared_memory(msg: impl Into<String>) -> Self {
        Self::SharedMemory {
            message: msg.into(),
        }
    }

    pub fn compositor(msg: impl Into<String>) -> Self {
        Self::Compositor {
            message: msg.into(),
        }
    }

    pub fn transition(msg: impl Into<String>) -> Self {
        Self::Transition {
            message: msg.into(),
        }
    }

    pub fn timeout(what: impl Into<String>, millis: u64) -> Self {
        Self::Timeout {
            what: what.into(),
            millis,
        }
    }

    /// Whether this error was raised before any process was spawned.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config { .. })
    }

    /// Exit status carried by a helper failure, if any.
    pub fn process_exit(&self) -> Option<ProcessExit> {
        match self {
            Self::HelperExited { exit, .. } => Some(*exit),
            _ => None,
        }
    }
}
