//! FrameBridge output adapters.
//!
//! Each adapter drives one helper process for one sink type: hardware
//! key/fill, hardware single video, a local display or a network stream.
//! Helpers read composited frames from the Frame Bus, or receive them on
//! stdin via the legacy push protocol when the Frame Bus is disabled.

pub mod adapter;
pub mod backpressure;
pub mod helper;
pub mod legacy;
pub mod ports;
pub mod sinks;

pub use adapter::{AdapterFactory, AdapterState, HelperAdapter, HelperAdapterFactory, OutputAdapter};
pub use backpressure::{LatestFrame, Offer, VideoFrame};
pub use helper::{HelperCommand, HelperMessage, HelperProcess, HelperTimeouts, ReadySignal};
pub use sinks::{sink_for, AdapterContext, Sink};
