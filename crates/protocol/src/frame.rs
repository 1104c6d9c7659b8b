//! Binary framing for the WebSocket fallback video sink.
//!
//! ```text
//! [0]      type: u8, always 1 (video)
//! [1..9]   wallclock_ms: f64, big-endian
//! [9..]    compressed frame payload
//! ```

pub const WS_FRAME_TYPE_VIDEO: u8 = 1;
pub const WS_FRAME_HEADER_SIZE: usize = 9;

#[derive(Debug, Clone, PartialEq)]
pub struct WsFrameHeader {
    pub wallclock_ms: f64,
}

impl WsFrameHeader {
    pub fn new(wallclock_ms: f64) -> Self {
        Self { wallclock_ms }
    }

    /// Serialize header + payload into one buffer, ready to send as a single
    /// WebSocket binary message.
    pub fn encode(&self, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(WS_FRAME_HEADER_SIZE + payload.len());
        buf.push(WS_FRAME_TYPE_VIDEO);
        buf.extend_from_slice(&self.wallclock_ms.to_be_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    /// Parse a header off the front of `buf`, returning the header and the
    /// remaining payload slice.
    pub fn decode(buf: &[u8]) -> Result<(Self, &[u8]), WsFrameError> {
        if buf.len() < WS_FRAME_HEADER_SIZE {
            return Err(WsFrameError::TooShort(buf.len()));
        }
        let kind = buf[0];
        if kind != WS_FRAME_TYPE_VIDEO {
            return Err(WsFrameError::UnknownType(kind));
        }
        let wallclock_ms = f64::from_be_bytes(buf[1..9].try_into().unwrap());
        Ok((Self { wallclock_ms }, &buf[WS_FRAME_HEADER_SIZE..]))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WsFrameError {
    #[error("buffer too short: {0} bytes (need at least {WS_FRAME_HEADER_SIZE})")]
    TooShort(usize),
    #[error("unknown frame type: {0}")]
    UnknownType(u8),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_preserves_wallclock_and_payload() {
        let header = WsFrameHeader::new(1_700_000_000_123.0);
        let payload = vec![0xDE, 0xAD, 0xBE, 0xEF];
        let encoded = header.encode(&payload);
        assert_eq!(encoded[0], WS_FRAME_TYPE_VIDEO);

        let (decoded, rest) = WsFrameHeader::decode(&encoded).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(rest, &payload[..]);
    }

    #[test]
    fn decode_rejects_short_buffer() {
        let buf = [1u8; 4];
        match WsFrameHeader::decode(&buf) {
            Err(WsFrameError::TooShort(4)) => {}
            other => panic!("expected TooShort(4), got {:?}", other),
        }
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let header = WsFrameHeader::new(0.0);
        let mut encoded = header.encode(&[]);
        encoded[0] = 2;
        match WsFrameHeader::decode(&encoded) {
            Err(WsFrameError::UnknownType(2)) => {}
            other => panic!("expected UnknownType(2), got {:?}", other),
        }
    }

    #[test]
    fn empty_payload_is_valid() {
        let header = WsFrameHeader::new(42.0);
        let encoded = header.encode(&[]);
        let (decoded, rest) = WsFrameHeader::decode(&encoded).unwrap();
        assert_eq!(decoded.wallclock_ms, 42.0);
        assert!(rest.is_empty());
    }
}
