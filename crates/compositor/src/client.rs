//! Control channel client used by the orchestrator.
//!
//! Every call suspends until the host acknowledges it, bounded by the
//! configured ack timeout. Commands are written in call order over one
//! connection, so the host applies them in that order.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;

use framebridge_common::config::ControlConfig;
use framebridge_common::error::{BridgeError, BridgeResult};

use crate::layer::LayerLayout;
use crate::protocol::{
    read_message, write_message, ChannelLimits, CommandEnvelope, ControlCommand, HostEvent,
    HostStatus, LayerSpec, RendererConfig, ValueMap,
};

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<HostEvent>>>>;

/// Connection to a compositing host.
pub struct CompositorClient {
    writer: Mutex<OwnedWriteHalf>,
    pending: Pending,
    events: broadcast::Sender<HostEvent>,
    next_id: AtomicU64,
    limits: ChannelLimits,
    ack_timeout: Duration,
    ready_timeout: Duration,
    closed: Arc<AtomicBool>,
    reader_task: JoinHandle<()>,
}

impl std::fmt::Debug for CompositorClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositorClient")
            .field("closed", &self.is_closed())
            .field("ack_timeout", &self.ack_timeout)
            .finish()
    }
}

impl CompositorClient {
    /// Connect and complete the `hello` handshake.
    pub async fn connect(addr: SocketAddr, token: &str, control: &ControlConfig) -> BridgeResult<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| BridgeError::transport(format!("connect to compositor at {addr}: {e}")))?;
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();

        let limits = ChannelLimits::from(control);
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (events, _) = broadcast::channel(256);
        let closed = Arc::new(AtomicBool::new(false));
        let reader_task = tokio::spawn(read_loop(
            reader,
            pending.clone(),
            events.clone(),
            limits,
            closed.clone(),
        ));

        let client = Self {
            writer: Mutex::new(writer),
            pending,
            events,
            next_id: AtomicU64::new(1),
            limits,
            ack_timeout: control.ack_timeout(),
            ready_timeout: control.ready_timeout(),
            closed,
            reader_task,
        };
        client
            .request(
                ControlCommand::Hello {
                    token: token.to_string(),
                },
                Vec::new(),
            )
            .await?;
        tracing::debug!(addr = %addr, "Connected to compositing host");
        Ok(client)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Host events not tied to a request (`ready`, `layer_rendered`, ...).
    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.events.subscribe()
    }

    /// Send one command and wait for its reply.
    pub async fn request(&self, command: ControlCommand, payload: Vec<u8>) -> BridgeResult<HostEvent> {
        if self.is_closed() {
            return Err(BridgeError::transport("Control channel is closed"));
        }
        let kind = command.kind();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let envelope = CommandEnvelope {
            request_id: Some(id),
            command,
        };
        let written = {
            let mut writer = self.writer.lock().await;
            write_message(&mut *writer, &envelope, &payload, &self.limits).await
        };
        if let Err(e) = written {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        let reply = match tokio::time::timeout(self.ack_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => {
                return Err(BridgeError::transport(format!(
                    "Control channel closed while waiting for {kind} ack"
                )))
            }
            Err(_) => {
                self.pending.lock().await.remove(&id);
                return Err(BridgeError::timeout(
                    format!("{kind} ack"),
                    self.ack_timeout.as_millis() as u64,
                ));
            }
        };

        match reply {
            HostEvent::Ack {
                ok: false, error, ..
            } => Err(BridgeError::compositor(
                error.unwrap_or_else(|| format!("{kind} rejected")),
            )),
            other => Ok(other),
        }
    }

    /// Configure the renderer and wait for `ready`.
    pub async fn configure_renderer(&self, config: RendererConfig) -> BridgeResult<()> {
        let mut events = self.subscribe();
        let name = config.framebus.name.clone();
        self.request(ControlCommand::RendererConfigure(config), Vec::new())
            .await?;

        let ready = async {
            loop {
                match events.recv().await {
                    Ok(HostEvent::Ready { framebus_name, .. }) if framebus_name == name => {
                        return Ok(())
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(BridgeError::transport("Control channel closed before ready"))
                    }
                }
            }
        };
        tokio::time::timeout(self.ready_timeout, ready)
            .await
            .map_err(|_| {
                BridgeError::timeout("compositor ready", self.ready_timeout.as_millis() as u64)
            })?
    }

    /// Create (or replace) a layer. `asset` is raw RGBA matching
    /// `spec.asset`.
    pub async fn create_layer(&self, spec: LayerSpec, asset: Vec<u8>) -> BridgeResult<()> {
        self.request(ControlCommand::CreateLayer(spec), asset)
            .await
            .map(drop)
    }

    pub async fn update_values(&self, layer_id: &str, values: ValueMap) -> BridgeResult<()> {
        self.request(
            ControlCommand::UpdateValues {
                layer_id: layer_id.to_string(),
                values,
            },
            Vec::new(),
        )
        .await
        .map(drop)
    }

    pub async fn update_layout(&self, layer_id: &str, layout: LayerLayout) -> BridgeResult<()> {
        self.request(
            ControlCommand::UpdateLayout {
                layer_id: layer_id.to_string(),
                layout,
            },
            Vec::new(),
        )
        .await
        .map(drop)
    }

    pub async fn remove_layer(&self, layer_id: &str) -> BridgeResult<()> {
        self.request(
            ControlCommand::RemoveLayer {
                layer_id: layer_id.to_string(),
            },
            Vec::new(),
        )
        .await
        .map(drop)
    }

    pub async fn test_pattern(&self, enabled: bool) -> BridgeResult<()> {
        self.request(ControlCommand::TestPattern { enabled }, Vec::new())
            .await
            .map(drop)
    }

    pub async fn status(&self) -> BridgeResult<HostStatus> {
        match self.request(ControlCommand::GetStatus, Vec::new()).await? {
            HostEvent::Status { status, .. } => Ok(status),
            other => Err(BridgeError::protocol(format!(
                "Unexpected reply to get_status: {other:?}"
            ))),
        }
    }

    /// Ask the host to exit.
    pub async fn shutdown(&self) -> BridgeResult<()> {
        self.request(ControlCommand::Shutdown, Vec::new())
            .await
            .map(drop)
    }
}

impl Drop for CompositorClient {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    pending: Pending,
    events: broadcast::Sender<HostEvent>,
    limits: ChannelLimits,
    closed: Arc<AtomicBool>,
) {
    loop {
        let message = match read_message(&mut reader, &limits).await {
            Ok(Some(message)) => message,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "Compositor control channel failed");
                break;
            }
        };
        let event: HostEvent = match message.decode() {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping compositor connection on malformed event");
                break;
            }
        };

        if let Some(id) = event.request_id() {
            if let Some(tx) = pending.lock().await.remove(&id) {
                let _ = tx.send(event);
                continue;
            }
        }
        if let HostEvent::Error { message } = &event {
            tracing::warn!(error = %message, "Compositor reported an error");
        }
        let _ = events.send(event);
    }

    closed.store(true, Ordering::SeqCst);
    // Dropping the senders fails every waiting request.
    pending.lock().await.clear();
    tracing::debug!("Compositor control channel closed");
}
