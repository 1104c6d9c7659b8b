//! C4: parses the encoder's DKIF-style container (the same layout as the
//! real IVF format) off its stdout into discrete `Frame`s. Invalid magic or
//! I/O error simply ends this de-muxer instance; the supervisor observes
//! that as the child's stdout EOF and decides whether to restart.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::DemuxError;
use crate::fanout::FrameFanout;

const FILE_HEADER_SIZE: usize = 32;
const FRAME_HEADER_SIZE: usize = 12;
const MAGIC: &[u8; 4] = b"DKIF";

#[derive(Debug, Clone)]
pub struct Frame {
    pub bytes: Bytes,
    pub capture_time_ms: f64,
    pub epoch: u32,
}

fn now_ms() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
        * 1000.0
}

/// Reads `stream` to EOF, emitting each frame to `fanout` as it's parsed.
/// Returns the number of frames successfully emitted (useful for tests);
/// the supervisor only cares that this function returned at all.
pub async fn demux_stream<R: AsyncRead + Unpin>(
    mut stream: R,
    epoch: u32,
    fanout: Arc<FrameFanout>,
) -> Result<usize, DemuxError> {
    let mut file_header = [0u8; FILE_HEADER_SIZE];
    if let Err(e) = stream.read_exact(&mut file_header).await {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Ok(0);
        }
        return Err(e.into());
    }
    let magic: [u8; 4] = file_header[0..4].try_into().unwrap();
    if &magic != MAGIC {
        tracing::warn!("de-muxer aborting: bad container magic {:?}", magic);
        return Err(DemuxError::BadMagic(magic));
    }

    let mut count = 0usize;
    loop {
        let mut frame_header = [0u8; FRAME_HEADER_SIZE];
        match stream.read_exact(&mut frame_header).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let size = u32::from_le_bytes(frame_header[0..4].try_into().unwrap()) as usize;

        let mut payload = vec![0u8; size];
        match stream.read_exact(&mut payload).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(DemuxError::Truncated);
            }
            Err(e) => return Err(e.into()),
        }

        let frame = Frame {
            bytes: Bytes::from(payload),
            capture_time_ms: now_ms(),
            epoch,
        };
        fanout.publish(frame).await;
        count += 1;
    }

    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::FrameFanout;

    fn build_stream(frames: &[&[u8]]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&[0u8; FILE_HEADER_SIZE - 4]);
        for f in frames {
            buf.extend_from_slice(&(f.len() as u32).to_le_bytes());
            buf.extend_from_slice(&[0u8; 8]); // ignored timestamp
            buf.extend_from_slice(f);
        }
        buf
    }

    #[tokio::test]
    async fn parses_exact_frame_boundaries() {
        let stream = build_stream(&[b"abc", b"de", b""]);
        let fanout = FrameFanout::new(30);
        let count = demux_stream(stream.as_slice(), 1, fanout).await.unwrap();
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn bad_magic_aborts_instance() {
        let mut stream = build_stream(&[b"abc"]);
        stream[0] = b'X';
        let fanout = FrameFanout::new(30);
        let err = demux_stream(stream.as_slice(), 1, fanout).await.unwrap_err();
        assert!(matches!(err, DemuxError::BadMagic(_)));
    }

    #[tokio::test]
    async fn truncated_payload_is_an_error() {
        let mut stream = build_stream(&[b"abcdefgh"]);
        stream.truncate(stream.len() - 4);
        let fanout = FrameFanout::new(30);
        let err = demux_stream(stream.as_slice(), 1, fanout).await.unwrap_err();
        assert!(matches!(err, DemuxError::Truncated));
    }

    #[tokio::test]
    async fn empty_stream_after_valid_header_is_clean_eof() {
        let stream = build_stream(&[]);
        let fanout = FrameFanout::new(30);
        let count = demux_stream(stream.as_slice(), 1, fanout).await.unwrap();
        assert_eq!(count, 0);
    }
}
