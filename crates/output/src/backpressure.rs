//! Single-slot frame holder for the legacy push path.
//!
//! While a write to the helper is in flight the adapter cannot send, so
//! new frames replace the one pending frame instead of queueing. When the
//! write completes the newest frame goes next.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::{Mutex, Notify};

/// One RGBA frame handed to an adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub timestamp_ns: u64,
    pub rgba: Vec<u8>,
}

/// What became of a frame handed to [`LatestFrame::offer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    /// The transport is idle; this frame goes out next.
    Queued,
    /// A write is in flight; the frame waits for it to finish.
    Held,
    /// Took the place of a pending frame that was never sent.
    Replaced,
    /// The holder is closed and the frame was discarded.
    Closed,
}

/// Latest-frame-wins holder shared between the adapter and its writer task.
#[derive(Debug, Default)]
pub struct LatestFrame {
    pending: Mutex<Option<VideoFrame>>,
    notify: Notify,
    can_send: AtomicBool,
    closed: AtomicBool,
    replaced: AtomicU64,
}

impl LatestFrame {
    pub fn new() -> Self {
        Self {
            can_send: AtomicBool::new(true),
            ..Self::default()
        }
    }

    /// Store `frame` as the pending frame.
    pub async fn offer(&self, frame: VideoFrame) -> Offer {
        if self.is_closed() {
            return Offer::Closed;
        }
        let replaced = self.pending.lock().await.replace(frame).is_some();
        self.notify.notify_one();
        if replaced {
            let total = self.replaced.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::trace!(replaced = total, "Pending frame replaced under backpressure");
            Offer::Replaced
        } else if self.can_send() {
            Offer::Queued
        } else {
            Offer::Held
        }
    }

    /// Wait for the next frame. Returns `None` once closed.
    pub async fn next(&self) -> Option<VideoFrame> {
        loop {
            if self.is_closed() {
                return None;
            }
            if let Some(frame) = self.pending.lock().await.take() {
                return Some(frame);
            }
            self.notify.notified().await;
        }
    }

    /// Whether the transport can take a frame right now.
    pub fn can_send(&self) -> bool {
        self.can_send.load(Ordering::Acquire)
    }

    pub fn set_can_send(&self, value: bool) {
        self.can_send.store(value, Ordering::Release);
    }

    /// Frames dropped because a newer one arrived first.
    pub fn replaced(&self) -> u64 {
        self.replaced.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop delivering frames; any pending frame is discarded.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}
