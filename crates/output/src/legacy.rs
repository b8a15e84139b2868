//! Legacy push protocol.
//!
//! Frames are written to the helper's stdin as a fixed 28-byte big-endian
//! header followed by raw RGBA bytes:
//!
//! ```text
//! magic u32 | version u16 | type u16 | width u32 | height u32 | timestamp u64 | payload_len u32
//! ```

use framebridge_common::error::{BridgeError, BridgeResult};

pub const LEGACY_MAGIC: u32 = 0x4252_4746;
pub const LEGACY_VERSION: u16 = 1;
pub const LEGACY_HEADER_SIZE: usize = 28;

/// Largest payload accepted: one 8K RGBA frame.
pub const LEGACY_MAX_PAYLOAD: usize = 7680 * 4320 * 4;

/// Message type carried in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum LegacyMessageType {
    Frame = 1,
    Shutdown = 2,
}

impl LegacyMessageType {
    fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            1 => Some(Self::Frame),
            2 => Some(Self::Shutdown),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegacyHeader {
    pub kind: LegacyMessageType,
    pub width: u32,
    pub height: u32,
    pub timestamp: u64,
    pub payload_len: u32,
}

impl LegacyHeader {
    /// Header for a graceful-exit request; the payload is empty.
    pub fn shutdown() -> Self {
        Self {
            kind: LegacyMessageType::Shutdown,
            width: 0,
            height: 0,
            timestamp: 0,
            payload_len: 0,
        }
    }

    pub fn encode(&self) -> [u8; LEGACY_HEADER_SIZE] {
        let mut buf = [0u8; LEGACY_HEADER_SIZE];
        buf[0..4].copy_from_slice(&LEGACY_MAGIC.to_be_bytes());
        buf[4..6].copy_from_slice(&LEGACY_VERSION.to_be_bytes());
        buf[6..8].copy_from_slice(&(self.kind as u16).to_be_bytes());
        buf[8..12].copy_from_slice(&self.width.to_be_bytes());
        buf[12..16].copy_from_slice(&self.height.to_be_bytes());
        buf[16..24].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[24..28].copy_from_slice(&self.payload_len.to_be_bytes());
        buf
    }

    /// Parse and bound-check a header. A frame payload must be exactly
    /// `width * height * 4` bytes and within [`LEGACY_MAX_PAYLOAD`].
    pub fn decode(buf: &[u8]) -> BridgeResult<Self> {
        if buf.len() < LEGACY_HEADER_SIZE {
            return Err(BridgeError::protocol(format!(
                "Legacy header needs {LEGACY_HEADER_SIZE} bytes, got {}",
                buf.len()
            )));
        }
        let u32_at = |i: usize| u32::from_be_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        let u16_at = |i: usize| u16::from_be_bytes([buf[i], buf[i + 1]]);

        let magic = u32_at(0);
        if magic != LEGACY_MAGIC {
            return Err(BridgeError::protocol(format!("Bad legacy frame magic {magic:#010x}")));
        }
        let version = u16_at(4);
        if version != LEGACY_VERSION {
            return Err(BridgeError::protocol(format!(
                "Unsupported legacy frame version {version}"
            )));
        }
        let raw_kind = u16_at(6);
        let kind = LegacyMessageType::from_raw(raw_kind)
            .ok_or_else(|| BridgeError::protocol(format!("Unknown legacy message type {raw_kind}")))?;

        let mut ts = [0u8; 8];
        ts.copy_from_slice(&buf[16..24]);
        let header = Self {
            kind,
            width: u32_at(8),
            height: u32_at(12),
            timestamp: u64::from_be_bytes(ts),
            payload_len: u32_at(24),
        };

        if header.payload_len as usize > LEGACY_MAX_PAYLOAD {
            return Err(BridgeError::protocol(format!(
                "Legacy payload of {} bytes exceeds limit",
                header.payload_len
            )));
        }
        if kind == LegacyMessageType::Frame {
            let expected = header.width as u64 * header.height as u64 * 4;
            if header.payload_len as u64 != expected {
                return Err(BridgeError::protocol(format!(
                    "Legacy frame payload {} does not match {}x{} RGBA",
                    header.payload_len, header.width, header.height
                )));
            }
        }
        Ok(header)
    }
}

/// Encode a complete FRAME message.
pub fn encode_frame(width: u32, height: u32, timestamp: u64, rgba: &[u8]) -> BridgeResult<Vec<u8>> {
    let expected = width as usize * height as usize * 4;
    if rgba.len() != expected || expected > LEGACY_MAX_PAYLOAD {
        return Err(BridgeError::protocol(format!(
            "Cannot encode {} bytes as a {width}x{height} RGBA frame",
            rgba.len()
        )));
    }
    let header = LegacyHeader {
        kind: LegacyMessageType::Frame,
        width,
        height,
        timestamp,
        payload_len: expected as u32,
    };
    let mut buf = Vec::with_capacity(LEGACY_HEADER_SIZE + rgba.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(rgba);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_big_endian() {
        let bytes = LegacyHeader {
            kind: LegacyMessageType::Frame,
            width: 2,
            height: 1,
            timestamp: 0x0102_0304_0506_0708,
            payload_len: 8,
        }
        .encode();
        assert_eq!(&bytes[0..4], &[0x42, 0x52, 0x47, 0x46]);
        assert_eq!(&bytes[4..8], &[0, 1, 0, 1]);
        assert_eq!(&bytes[8..12], &[0, 0, 0, 2]);
        assert_eq!(&bytes[16..24], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&bytes[24..28], &[0, 0, 0, 8]);
    }

    #[test]
    fn frame_message_decodes() {
        let msg = encode_frame(2, 2, 99, &[7u8; 16]).unwrap();
        assert_eq!(msg.len(), LEGACY_HEADER_SIZE + 16);
        let header = LegacyHeader::decode(&msg).unwrap();
        assert_eq!(header.kind, LegacyMessageType::Frame);
        assert_eq!(header.timestamp, 99);
        assert_eq!(header.payload_len, 16);
    }

    #[test]
    fn shutdown_has_empty_payload() {
        let header = LegacyHeader::decode(&LegacyHeader::shutdown().encode()).unwrap();
        assert_eq!(header.kind, LegacyMessageType::Shutdown);
        assert_eq!(header.payload_len, 0);
    }

    #[test]
    fn decode_rejects_bad_input() {
        let mut bytes = LegacyHeader::shutdown().encode();
        bytes[0] = 0;
        assert!(LegacyHeader::decode(&bytes).is_err());
        assert!(LegacyHeader::decode(&[0u8; 10]).is_err());

        let mut mismatched = encode_frame(2, 2, 0, &[0u8; 16]).unwrap();
        mismatched[27] = 15;
        assert!(LegacyHeader::decode(&mismatched).is_err());

        let mut huge = LegacyHeader::shutdown().encode();
        huge[24..28].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(LegacyHeader::decode(&huge).is_err());
    }

    #[test]
    fn encode_rejects_wrong_length() {
        assert!(encode_frame(4, 4, 0, &[0u8; 10]).is_err());
    }

    proptest::proptest! {
        #[test]
        fn accepted_headers_respect_payload_bounds(
            kind in 0u16..4,
            width in 0u32..10_000,
            height in 0u32..10_000,
            timestamp: u64,
            payload_len: u32,
        ) {
            let mut buf = [0u8; LEGACY_HEADER_SIZE];
            buf[0..4].copy_from_slice(&LEGACY_MAGIC.to_be_bytes());
            buf[4..6].copy_from_slice(&LEGACY_VERSION.to_be_bytes());
            buf[6..8].copy_from_slice(&kind.to_be_bytes());
            buf[8..12].copy_from_slice(&width.to_be_bytes());
            buf[12..16].copy_from_slice(&height.to_be_bytes());
            buf[16..24].copy_from_slice(&timestamp.to_be_bytes());
            buf[24..28].copy_from_slice(&payload_len.to_be_bytes());

            if let Ok(header) = LegacyHeader::decode(&buf) {
                proptest::prop_assert!(header.payload_len as usize <= LEGACY_MAX_PAYLOAD);
                if header.kind == LegacyMessageType::Frame {
                    proptest::prop_assert_eq!(
                        header.payload_len as u64,
                        width as u64 * height as u64 * 4
                    );
                }
                proptest::prop_assert_eq!(header.encode(), buf);
            }
        }
    }
}
