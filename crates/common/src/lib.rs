//! FrameBridge Common Utilities
//!
//! Shared infrastructure for all FrameBridge crates:
//! - Error taxonomy and result aliases
//! - Monotonic clock and frame ticking for real-time loops
//! - Tracing/logging initialization
//! - Configuration loading

pub mod clock;
pub mod config;
pub mod error;
pub mod logging;

pub use clock::*;
pub use config::*;
pub use error::*;
