//! Control channel wire format.
//!
//! Every message is `[u32 BE header length][JSON header][payload]`, where
//! the payload length is declared inside the header as `bufferLength`.
//! Limits are enforced before any buffer is allocated, so an oversized
//! declaration never reaches layer logic.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use framebridge_common::config::ControlConfig;
use framebridge_common::error::{BridgeError, BridgeResult};
use framebridge_frame_bus::PixelFormat;

use crate::layer::{BackgroundMode, LayerLayout};

/// Header key carrying the payload length.
pub const BUFFER_LENGTH_KEY: &str = "bufferLength";

/// Size ceilings for one control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelLimits {
    pub max_header_bytes: usize,
    pub max_payload_bytes: usize,
}

impl Default for ChannelLimits {
    fn default() -> Self {
        Self::from(&ControlConfig::default())
    }
}

impl From<&ControlConfig> for ChannelLimits {
    fn from(config: &ControlConfig) -> Self {
        Self {
            max_header_bytes: config.max_header_bytes as usize,
            max_payload_bytes: config.max_payload_bytes as usize,
        }
    }
}

/// Values bound into a layer's template.
pub type ValueMap = BTreeMap<String, serde_json::Value>;

/// Shared-memory target for the frame loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameBusTarget {
    pub name: String,
    #[serde(default = "default_slot_count")]
    pub slot_count: u32,
    #[serde(default = "default_true")]
    pub force_recreate: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shm_dir: Option<PathBuf>,
}

fn default_slot_count() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

/// What the frame is cleared to before layers are drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackgroundPolicy {
    #[serde(default)]
    pub mode: BackgroundMode,
    #[serde(default)]
    pub clear_color: [u8; 4],
}

impl Default for BackgroundPolicy {
    fn default() -> Self {
        Self {
            mode: BackgroundMode::Transparent,
            clear_color: [0, 0, 0, 0],
        }
    }
}

/// Parameters of `renderer_configure`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RendererConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    #[serde(default = "default_pixel_format")]
    pub pixel_format: PixelFormat,
    pub framebus: FrameBusTarget,
    #[serde(default)]
    pub background: BackgroundPolicy,
    /// Keep feeding previously configured regions after switching to this
    /// one. A later `renderer_configure` without it closes them.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub retain_previous: bool,
}

fn default_pixel_format() -> PixelFormat {
    PixelFormat::Rgba8
}

/// Raw RGBA image shipped in the message payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetDescriptor {
    pub width: u32,
    pub height: u32,
}

impl AssetDescriptor {
    pub fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }
}

/// Parameters of `create_layer`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerSpec {
    pub layer_id: String,
    #[serde(default)]
    pub html: String,
    #[serde(default)]
    pub css: String,
    #[serde(default)]
    pub values: ValueMap,
    #[serde(default)]
    pub layout: LayerLayout,
    #[serde(default)]
    pub z_index: i32,
    #[serde(default)]
    pub background_mode: BackgroundMode,
    /// Present when the payload carries an RGBA image for the layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset: Option<AssetDescriptor>,
}

impl LayerSpec {
    pub fn new(layer_id: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            layer_id: layer_id.into(),
            html: html.into(),
            css: String::new(),
            values: ValueMap::new(),
            layout: LayerLayout::default(),
            z_index: 0,
            background_mode: BackgroundMode::Transparent,
            asset: None,
        }
    }
}

/// Commands accepted by the compositing host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlCommand {
    Hello {
        token: String,
    },
    RendererConfigure(RendererConfig),
    CreateLayer(LayerSpec),
    UpdateValues {
        layer_id: String,
        values: ValueMap,
    },
    UpdateLayout {
        layer_id: String,
        layout: LayerLayout,
    },
    RemoveLayer {
        layer_id: String,
    },
    TestPattern {
        #[serde(default = "default_true")]
        enabled: bool,
    },
    GetStatus,
    Shutdown,
}

impl ControlCommand {
    /// Wire name of the command.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::RendererConfigure(_) => "renderer_configure",
            Self::CreateLayer(_) => "create_layer",
            Self::UpdateValues { .. } => "update_values",
            Self::UpdateLayout { .. } => "update_layout",
            Self::RemoveLayer { .. } => "remove_layer",
            Self::TestPattern { .. } => "test_pattern",
            Self::GetStatus => "get_status",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Header of a command message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
    #[serde(flatten)]
    pub command: ControlCommand,
}

/// Snapshot reported by `get_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct HostStatus {
    pub ready: bool,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub framebus_name: Option<String>,
    /// Earlier regions still fed while an output transition is staged.
    #[serde(default)]
    pub retained_framebus: Vec<String>,
    pub frames_written: u64,
    pub layer_ids: Vec<String>,
    pub test_pattern: bool,
    pub engine: String,
}

/// Events emitted by the compositing host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostEvent {
    Ready {
        width: u32,
        height: u32,
        fps: u32,
        framebus_name: String,
    },
    Ack {
        #[serde(default)]
        request_id: Option<u64>,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    LayerRendered {
        layer_id: String,
    },
    /// Reply to `get_status`, in place of an ack.
    Status {
        #[serde(default)]
        request_id: Option<u64>,
        status: HostStatus,
    },
    Error {
        message: String,
    },
}

impl HostEvent {
    /// Request this event answers, if any.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            Self::Ack { request_id, .. } | Self::Status { request_id, .. } => *request_id,
            _ => None,
        }
    }

    pub fn ack(request_id: Option<u64>, result: &BridgeResult<()>) -> Self {
        match result {
            Ok(()) => Self::Ack {
                request_id,
                ok: true,
                error: None,
            },
            Err(e) => Self::Ack {
                request_id,
                ok: false,
                error: Some(e.to_string()),
            },
        }
    }
}

/// One framed message before its header is interpreted.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    pub header: serde_json::Value,
    pub payload: Vec<u8>,
}

impl RawMessage {
    /// Decode the header into a typed envelope. Unknown `type` values are
    /// errors.
    pub fn decode<T: DeserializeOwned>(&self) -> BridgeResult<T> {
        serde_json::from_value(self.header.clone())
            .map_err(|e| BridgeError::protocol(format!("Malformed control message: {e}")))
    }
}

/// Encode one message into a contiguous buffer.
pub fn encode_message<T: Serialize>(
    header: &T,
    payload: &[u8],
    limits: &ChannelLimits,
) -> BridgeResult<Vec<u8>> {
    if payload.len() > limits.max_payload_bytes {
        return Err(BridgeError::protocol(format!(
            "Payload of {} bytes exceeds limit of {}",
            payload.len(),
            limits.max_payload_bytes
        )));
    }

    let mut value = serde_json::to_value(header)?;
    match value.as_object_mut() {
        Some(map) => {
            map.insert(BUFFER_LENGTH_KEY.to_string(), payload.len().into());
        }
        None => return Err(BridgeError::protocol("Control header must be a JSON object")),
    }
    let json = serde_json::to_vec(&value)?;
    if json.len() > limits.max_header_bytes {
        return Err(BridgeError::protocol(format!(
            "Header of {} bytes exceeds limit of {}",
            json.len(),
            limits.max_header_bytes
        )));
    }

    let mut buf = Vec::with_capacity(4 + json.len() + payload.len());
    buf.extend_from_slice(&(json.len() as u32).to_be_bytes());
    buf.extend_from_slice(&json);
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Write one message.
pub async fn write_message<W, T>(
    writer: &mut W,
    header: &T,
    payload: &[u8],
    limits: &ChannelLimits,
) -> BridgeResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let buf = encode_message(header, payload, limits)?;
    writer
        .write_all(&buf)
        .await
        .map_err(|e| BridgeError::transport(format!("write control message: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| BridgeError::transport(format!("flush control message: {e}")))
}

/// Read one message. Returns `Ok(None)` on a clean end of stream between
/// messages.
pub async fn read_message<R>(reader: &mut R, limits: &ChannelLimits) -> BridgeResult<Option<RawMessage>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(BridgeError::transport(format!("read header length: {e}"))),
    }

    let header_len = u32::from_be_bytes(len_buf) as usize;
    if header_len == 0 || header_len > limits.max_header_bytes {
        return Err(BridgeError::protocol(format!(
            "Header length {header_len} outside 1..={}",
            limits.max_header_bytes
        )));
    }

    let mut json_buf = vec![0u8; header_len];
    reader
        .read_exact(&mut json_buf)
        .await
        .map_err(|e| BridgeError::transport(format!("read header: {e}")))?;
    let header: serde_json::Value = serde_json::from_slice(&json_buf)
        .map_err(|e| BridgeError::protocol(format!("Header is not valid JSON: {e}")))?;
    if !header.is_object() {
        return Err(BridgeError::protocol("Control header must be a JSON object"));
    }

    let payload_len = match header.get(BUFFER_LENGTH_KEY) {
        None | Some(serde_json::Value::Null) => 0,
        Some(value) => value
            .as_u64()
            .ok_or_else(|| BridgeError::protocol("bufferLength must be a non-negative integer"))?,
    };
    if payload_len > limits.max_payload_bytes as u64 {
        return Err(BridgeError::protocol(format!(
            "Declared bufferLength {payload_len} exceeds limit of {}",
            limits.max_payload_bytes
        )));
    }

    let mut payload = vec![0u8; payload_len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| BridgeError::transport(format!("read payload: {e}")))?;

    Ok(Some(RawMessage { header, payload }))
}
