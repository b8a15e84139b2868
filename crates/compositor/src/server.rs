//! Loopback control server and frame loop.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;

use framebridge_common::clock::{frame_interval, FrameTicker};
use framebridge_common::config::ControlConfig;
use framebridge_common::error::{BridgeError, BridgeResult};

use crate::engine::RenderEngine;
use crate::host::{Applied, CompositorHost};
use crate::protocol::{
    read_message, write_message, ChannelLimits, CommandEnvelope, ControlCommand, HostEvent,
    HostStatus,
};

const EVENT_CAPACITY: usize = 256;
const REPLY_CAPACITY: usize = 64;

struct Shared {
    host: Mutex<CompositorHost>,
    token: String,
    limits: ChannelLimits,
    events: broadcast::Sender<HostEvent>,
    configured: Notify,
    shutdown: watch::Sender<bool>,
}

/// A running compositing host.
pub struct HostHandle {
    addr: SocketAddr,
    shared: Arc<Shared>,
    accept_task: JoinHandle<()>,
    frame_task: JoinHandle<()>,
}

impl std::fmt::Debug for HostHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostHandle").field("addr", &self.addr).finish()
    }
}

impl HostHandle {
    /// Loopback address of the control channel.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Per-session token clients must present in `hello`.
    pub fn token(&self) -> &str {
        &self.shared.token
    }

    pub async fn status(&self) -> HostStatus {
        self.shared.host.lock().await.status()
    }

    /// Resolve once a client sent `shutdown` or [`HostHandle::shutdown`]
    /// was called.
    pub async fn wait(&self) {
        stopped(&mut self.shared.shutdown.subscribe()).await;
    }

    /// Stop accepting, stop the frame loop and close the Frame Bus writer.
    pub async fn shutdown(self) {
        self.shared.shutdown.send_replace(true);
        let _ = self.accept_task.await;
        let _ = self.frame_task.await;
        self.shared.host.lock().await.shutdown();
    }
}

/// Bind the control channel on `127.0.0.1:0` and start serving.
pub async fn spawn_host(engine: Box<dyn RenderEngine>, control: &ControlConfig) -> BridgeResult<HostHandle> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .await
        .map_err(|e| BridgeError::transport(format!("bind control channel: {e}")))?;
    let addr = listener.local_addr()?;

    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    let (shutdown, _) = watch::channel(false);
    let shared = Arc::new(Shared {
        host: Mutex::new(CompositorHost::new(engine)),
        token: uuid::Uuid::new_v4().simple().to_string(),
        limits: ChannelLimits::from(control),
        events,
        configured: Notify::new(),
        shutdown,
    });

    let accept_task = tokio::spawn(accept_loop(listener, shared.clone()));
    let frame_task = tokio::spawn(frame_loop(shared.clone()));
    tracing::info!(addr = %addr, "Compositing host listening");

    Ok(HostHandle {
        addr,
        shared,
        accept_task,
        frame_task,
    })
}

/// Resolve once the shutdown flag is set (or its sender is gone).
async fn stopped(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    let mut shutdown = shared.shutdown.subscribe();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if !peer.ip().is_loopback() {
                        tracing::warn!(peer = %peer, "Rejected non-loopback control connection");
                        continue;
                    }
                    let shared = shared.clone();
                    tokio::spawn(async move {
                        match handle_connection(stream, shared).await {
                            Ok(()) => tracing::debug!(peer = %peer, "Control connection closed"),
                            Err(e) => tracing::warn!(peer = %peer, error = %e, "Control connection terminated"),
                        }
                    });
                }
                Err(e) => tracing::warn!(error = %e, "Failed to accept control connection"),
            },
            _ = stopped(&mut shutdown) => break,
        }
    }
}

async fn handle_connection(stream: TcpStream, shared: Arc<Shared>) -> BridgeResult<()> {
    let _ = stream.set_nodelay(true);
    let (mut reader, writer) = stream.into_split();

    let hello = read_message(&mut reader, &shared.limits)
        .await?
        .ok_or_else(|| BridgeError::transport("Connection closed before hello"))?;
    let envelope: CommandEnvelope = hello.decode()?;
    match &envelope.command {
        ControlCommand::Hello { token } if *token == shared.token => {}
        ControlCommand::Hello { .. } => return Err(BridgeError::transport("Handshake token mismatch")),
        other => {
            return Err(BridgeError::protocol(format!(
                "Expected hello, got {}",
                other.kind()
            )))
        }
    }

    let (replies, reply_rx) = mpsc::channel(REPLY_CAPACITY);
    let writer_task = tokio::spawn(write_loop(
        writer,
        reply_rx,
        shared.events.subscribe(),
        shared.limits,
    ));
    let _ = replies.send(HostEvent::ack(envelope.request_id, &Ok(()))).await;

    let mut shutdown = shared.shutdown.subscribe();
    let result = loop {
        let message = tokio::select! {
            read = read_message(&mut reader, &shared.limits) => match read {
                Ok(Some(message)) => message,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            },
            _ = stopped(&mut shutdown) => break Ok(()),
        };
        let envelope: CommandEnvelope = match message.decode() {
            Ok(envelope) => envelope,
            Err(e) => break Err(e),
        };

        let request_id = envelope.request_id;
        let kind = envelope.command.kind();
        let applied = shared
            .host
            .lock()
            .await
            .apply(envelope.command, message.payload);

        let reply = match applied {
            Ok(Applied::Done) => HostEvent::ack(request_id, &Ok(())),
            Ok(Applied::Ready(ready)) => {
                shared.configured.notify_one();
                let _ = shared.events.send(ready);
                HostEvent::ack(request_id, &Ok(()))
            }
            Ok(Applied::Status(status)) => HostEvent::Status { request_id, status },
            Ok(Applied::Shutdown) => {
                let _ = replies.send(HostEvent::ack(request_id, &Ok(()))).await;
                shared.shutdown.send_replace(true);
                break Ok(());
            }
            Err(e) => {
                tracing::warn!(command = kind, error = %e, "Control command failed");
                HostEvent::ack(request_id, &Err(e))
            }
        };
        if replies.send(reply).await.is_err() {
            break Ok(());
        }
    };

    drop(replies);
    let _ = writer_task.await;
    result
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut replies: mpsc::Receiver<HostEvent>,
    mut events: broadcast::Receiver<HostEvent>,
    limits: ChannelLimits,
) {
    loop {
        let event = tokio::select! {
            reply = replies.recv() => match reply {
                Some(event) => event,
                None => break,
            },
            event = events.recv() => match event {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Control connection lagging behind host events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };
        if let Err(e) = write_message(&mut writer, &event, &[], &limits).await {
            tracing::debug!(error = %e, "Control connection write failed");
            break;
        }
    }
}

async fn frame_loop(shared: Arc<Shared>) {
    let mut shutdown = shared.shutdown.subscribe();
    let mut ticker: Option<FrameTicker> = None;
    let mut failing = false;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let (fps, rendered) = {
            let mut host = shared.host.lock().await;
            match host.fps() {
                Some(fps) => (Some(fps), host.render_frame()),
                None => (None, Ok(Vec::new())),
            }
        };

        match rendered {
            Ok(ids) => {
                if failing {
                    tracing::info!("Frame loop recovered");
                    failing = false;
                }
                for layer_id in ids {
                    let _ = shared.events.send(HostEvent::LayerRendered { layer_id });
                }
            }
            Err(e) => {
                if !failing {
                    tracing::error!(error = %e, "Frame render failed");
                    failing = true;
                }
            }
        }

        let Some(fps) = fps else {
            ticker = None;
            tokio::select! {
                _ = shared.configured.notified() => continue,
                _ = stopped(&mut shutdown) => break,
            }
        };

        if ticker.as_ref().is_some_and(|t| t.interval() != frame_interval(fps)) {
            ticker = None;
        }
        let deadline = ticker
            .get_or_insert_with(|| FrameTicker::new(fps))
            .advance(std::time::Instant::now());

        tokio::select! {
            _ = tokio::time::sleep_until(deadline.into()) => {}
            _ = stopped(&mut shutdown) => break,
        }
    }
    tracing::debug!("Frame loop stopped");
}
