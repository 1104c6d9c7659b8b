//! C5: distributes frames from the de-muxer to every active sink.
//!
//! The WebRTC video track is process-wide and shared by every client peer
//! connection (the same pattern `add_track` uses in a single-peer agent,
//! just with one sender instance bound to many peers instead of one).
//! A single pacing writer task maintains the one-slot look-ahead described
//! in the design doc so every viewer gets identical, correctly-paced video
//! regardless of how many are connected. The WebSocket binary fallback is
//! genuinely per-client: each connection gets its own bounded queue drained
//! by that connection's own writer task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use deskcast_protocol::WsFrameHeader;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::demux::Frame;

const WEBRTC_QUEUE_CAPACITY: usize = 300;
const WS_QUEUE_CAPACITY: usize = 300;

struct ClientEntry {
    tx: mpsc::Sender<Bytes>,
    ready: Arc<AtomicBool>,
}

pub struct FrameFanout {
    webrtc_tx: mpsc::Sender<Frame>,
    clients: RwLock<HashMap<Uuid, ClientEntry>>,
    fps: Arc<AtomicU32>,
}

impl FrameFanout {
    /// `video_track` is `None` in places (unit tests) that only exercise the
    /// WebSocket sink path and de-muxer wiring.
    pub fn new(initial_fps: u32) -> Arc<Self> {
        Self::new_inner(initial_fps, None)
    }

    pub fn with_video_track(initial_fps: u32, video_track: Arc<TrackLocalStaticSample>) -> Arc<Self> {
        Self::new_inner(initial_fps, Some(video_track))
    }

    fn new_inner(initial_fps: u32, video_track: Option<Arc<TrackLocalStaticSample>>) -> Arc<Self> {
        let (webrtc_tx, webrtc_rx) = mpsc::channel(WEBRTC_QUEUE_CAPACITY);
        let fps = Arc::new(AtomicU32::new(initial_fps));
        let fanout = Arc::new(Self {
            webrtc_tx,
            clients: RwLock::new(HashMap::new()),
            fps: Arc::clone(&fps),
        });
        if let Some(track) = video_track {
            tokio::spawn(pacing_writer(webrtc_rx, track, fps));
        } else {
            // Drain the channel so publish() never blocks even without a track.
            tokio::spawn(async move {
                let mut rx = webrtc_rx;
                while rx.recv().await.is_some() {}
            });
        }
        fanout
    }

    pub fn update_fps(&self, fps: u32) {
        self.fps.store(fps, Ordering::Relaxed);
    }

    pub async fn register_client(&self, id: Uuid) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(WS_QUEUE_CAPACITY);
        self.clients.write().await.insert(
            id,
            ClientEntry {
                tx,
                ready: Arc::new(AtomicBool::new(false)),
            },
        );
        rx
    }

    pub async fn set_webrtc_ready(&self, id: Uuid, ready: bool) {
        if let Some(entry) = self.clients.read().await.get(&id) {
            entry.ready.store(ready, Ordering::Relaxed);
        }
    }

    pub async fn remove_client(&self, id: Uuid) {
        self.clients.write().await.remove(&id);
    }

    /// Called by the de-muxer for every parsed frame.
    pub async fn publish(&self, frame: Frame) {
        if self.webrtc_tx.try_send(frame.clone()).is_err() {
            tracing::warn!("webrtc frame queue full, dropping frame");
        }

        let clients = self.clients.read().await;
        if clients.is_empty() {
            return;
        }
        let packet = Bytes::from(WsFrameHeader::new(frame.capture_time_ms).encode(&frame.bytes));
        for entry in clients.values() {
            if entry.ready.load(Ordering::Relaxed) {
                continue;
            }
            if entry.tx.try_send(packet.clone()).is_err() {
                tracing::warn!("ws binary queue full for client, dropping frame");
            }
        }
    }
}

async fn pacing_writer(
    mut rx: mpsc::Receiver<Frame>,
    track: Arc<TrackLocalStaticSample>,
    fps: Arc<AtomicU32>,
) {
    let mut held: Option<Frame> = None;
    while let Some(frame) = rx.recv().await {
        if let Some(cur) = held.take() {
            let duration_ns = if frame.epoch == cur.epoch {
                let gap_ms = frame.capture_time_ms - cur.capture_time_ms;
                ((gap_ms * 1_000_000.0).max(1_000.0)) as u64
            } else {
                let current_fps = fps.load(Ordering::Relaxed).max(1);
                (1_000_000_000u64 / current_fps as u64).max(1_000)
            };
            write_sample(&track, cur.bytes.to_vec(), duration_ns).await;
        }
        held = Some(frame);
    }
}

async fn write_sample(track: &Arc<TrackLocalStaticSample>, data: Vec<u8>, duration_ns: u64) {
    let sample = webrtc::media::Sample {
        data: Bytes::from(data),
        duration: Duration::from_nanos(duration_ns),
        ..Default::default()
    };
    if let Err(e) = track.write_sample(&sample).await {
        tracing::debug!("failed to write video sample: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(epoch: u32, capture_time_ms: f64, payload: &[u8]) -> Frame {
        Frame {
            bytes: Bytes::copy_from_slice(payload),
            capture_time_ms,
            epoch,
        }
    }

    #[tokio::test]
    async fn ready_client_receives_no_ws_packets() {
        let fanout = FrameFanout::new(30);
        let id = Uuid::new_v4();
        let mut rx = fanout.register_client(id).await;
        fanout.set_webrtc_ready(id, true).await;
        fanout.publish(frame(1, 0.0, b"x")).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn not_ready_client_receives_typed_ws_packet() {
        let fanout = FrameFanout::new(30);
        let id = Uuid::new_v4();
        let mut rx = fanout.register_client(id).await;
        fanout.publish(frame(1, 12345.0, b"abc")).await;
        let packet = rx.try_recv().expect("packet should arrive");
        assert_eq!(packet[0], 1);
        assert_eq!(&packet[9..], b"abc");
    }

    #[tokio::test]
    async fn removed_client_stops_receiving() {
        let fanout = FrameFanout::new(30);
        let id = Uuid::new_v4();
        let mut rx = fanout.register_client(id).await;
        fanout.remove_client(id).await;
        fanout.publish(frame(1, 0.0, b"x")).await;
        assert!(rx.try_recv().is_err());
    }
}
