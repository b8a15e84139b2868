//! Frame relay for the legacy push path.
//!
//! When helpers do not read the Frame Bus themselves, this task reads it
//! at the output rate and hands each new frame to the active adapter.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use framebridge_common::clock::FrameTicker;
use framebridge_common::error::BridgeError;
use framebridge_frame_bus::{open_reader, FrameBusReader};
use framebridge_output::VideoFrame;

use crate::orchestrator::OutputOrchestrator;

/// Region name and rate the relay reads at.
type Route = (String, u32);

pub struct FrameRelay {
    route: watch::Sender<Route>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for FrameRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let route = self.route.borrow();
        f.debug_struct("FrameRelay")
            .field("framebus", &route.0)
            .field("fps", &route.1)
            .finish()
    }
}

impl FrameRelay {
    pub fn spawn(
        orchestrator: Arc<OutputOrchestrator>,
        framebus_name: String,
        shm_dir: Option<PathBuf>,
        fps: u32,
    ) -> Self {
        let (route, route_rx) = watch::channel((framebus_name, fps));
        let task = tokio::spawn(relay_loop(orchestrator, shm_dir, route_rx));
        Self { route, task }
    }

    /// Follow the output to another region. A no-op for the current one.
    pub fn reopen(&self, framebus_name: String, fps: u32) {
        let next = (framebus_name, fps);
        self.route.send_if_modified(|route| {
            if *route == next {
                return false;
            }
            *route = next;
            true
        });
    }
}

impl Drop for FrameRelay {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn relay_loop(
    orchestrator: Arc<OutputOrchestrator>,
    shm_dir: Option<PathBuf>,
    mut route: watch::Receiver<Route>,
) {
    let (mut name, fps) = route.borrow_and_update().clone();
    let mut reader: Option<FrameBusReader> = None;
    let mut ticker = FrameTicker::new(fps);
    let mut relayed: u64 = 0;

    loop {
        let deadline = ticker.advance(std::time::Instant::now());
        tokio::select! {
            _ = tokio::time::sleep_until(deadline.into()) => {}
            changed = route.changed() => {
                if changed.is_err() {
                    break;
                }
                let (next, fps) = route.borrow_and_update().clone();
                name = next;
                ticker = FrameTicker::new(fps);
                reader = None;
                continue;
            }
        }

        if reader.is_none() {
            match open_reader(&name, shm_dir.as_deref()) {
                Ok(opened) => {
                    tracing::debug!(framebus = %name, "Frame relay attached");
                    reader = Some(opened);
                }
                Err(e) => {
                    tracing::trace!(framebus = %name, error = %e, "Frame Bus not ready for relay");
                    continue;
                }
            }
        }
        let Some(bus) = reader.as_mut() else {
            continue;
        };

        let (width, height) = (bus.header().width, bus.header().height);
        let frame = match bus.read_latest() {
            Some(frame) if frame.fresh => VideoFrame {
                width,
                height,
                timestamp_ns: frame.timestamp_ns,
                rgba: frame.bytes.clone(),
            },
            _ => continue,
        };

        match orchestrator.send_frame(&frame).await {
            Ok(()) => relayed += 1,
            Err(BridgeError::NotConfigured) => {}
            Err(e) => tracing::debug!(error = %e, "Frame relay send failed"),
        }
    }
    tracing::debug!(framebus = %name, relayed, "Frame relay stopped");
}
