//! C6: per-client WebRTC signaling. Each client gets its own
//! `RTCPeerConnection`, but every connection adds the *same* process-wide
//! video track as a sendonly transceiver, so the single pacing writer in
//! `fanout` is the only thing that ever calls `write_sample`.

use std::sync::Arc;

use anyhow::Context;
use deskcast_protocol::SessionDescription;
use tokio::sync::{mpsc, Mutex};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Strips receiver-driven congestion control hints from an SDP offer before
/// it's used to create the local answer. Rate control here is entirely
/// server-driven via the config channel (C1); leaving these in would let
/// the browser's bandwidth estimator fight the encoder supervisor.
pub fn strip_congestion_control(sdp: &str) -> String {
    sdp.lines()
        .filter(|line| {
            let l = line.trim();
            !(l.starts_with("a=rtcp-fb:") && (l.contains("transport-cc") || l.contains("goog-remb")))
                && !l.contains("a=extmap") // transport-cc relies on an RTP header extension too
        })
        .collect::<Vec<_>>()
        .join("\r\n")
}

pub struct WebRtcSession {
    peer_connection: Arc<RTCPeerConnection>,
}

impl WebRtcSession {
    /// Builds a fresh peer connection bound to `port` (single-port
    /// deployment: ICE is pinned to the HTTP listener's own UDP port) and
    /// adds the shared video track as a sendonly transceiver.
    pub async fn new(
        port: u16,
        public_ip: Option<String>,
        video_track: Arc<TrackLocalStaticSample>,
        ice_candidate_tx: mpsc::Sender<serde_json::Value>,
    ) -> anyhow::Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_codec(
            webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_H264.to_string(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line:
                        "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                            .to_string(),
                    rtcp_feedback: vec![],
                },
                payload_type: 125,
                ..Default::default()
            },
            RTPCodecType::Video,
        )?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let mut setting_engine = SettingEngine::default();
        setting_engine.set_ephemeral_udp_port_range(port, port)?;
        if let Some(ip) = public_ip {
            setting_engine.set_nat_1to1_ips(vec![ip], RTCIceCandidateType::Host);
        }

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: vec!["stun:stun.l.google.com:19302".to_string()],
                ..Default::default()
            }],
            ..Default::default()
        };

        let peer_connection = Arc::new(api.new_peer_connection(config).await?);

        peer_connection
            .add_transceiver_from_track(
                Arc::clone(&video_track) as Arc<dyn TrackLocal + Send + Sync>,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Sendonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .context("failed to add shared video track")?;

        peer_connection.on_peer_connection_state_change(Box::new(move |state| {
            match state {
                RTCPeerConnectionState::Failed | RTCPeerConnectionState::Disconnected => {
                    tracing::info!(?state, "webrtc peer connection degraded");
                }
                _ => tracing::debug!(?state, "webrtc peer connection state changed"),
            }
            Box::pin(async {})
        }));

        peer_connection.on_ice_candidate(Box::new(move |candidate| {
            let tx = ice_candidate_tx.clone();
            Box::pin(async move {
                if let Some(c) = candidate {
                    if let Ok(json) = c.to_json() {
                        let value = serde_json::json!({
                            "candidate": json.candidate,
                            "sdpMid": json.sdp_mid,
                            "sdpMLineIndex": json.sdp_mline_index,
                        });
                        let _ = tx.try_send(value);
                    }
                }
            })
        }));

        Ok(Self { peer_connection })
    }

    /// Handles an inbound `webrtc_offer`: set remote description (after
    /// stripping congestion-control feedback), create and set the local
    /// answer, and return it for the caller to send back as `webrtc_answer`.
    pub async fn handle_offer(&self, offer: SessionDescription) -> anyhow::Result<SessionDescription> {
        let sanitized = strip_congestion_control(&offer.sdp);
        let remote = RTCSessionDescription::offer(sanitized).context("invalid offer SDP")?;
        self.peer_connection
            .set_remote_description(remote)
            .await
            .context("failed to set remote description")?;

        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .context("failed to create answer")?;
        self.peer_connection
            .set_local_description(answer.clone())
            .await
            .context("failed to set local description")?;

        Ok(SessionDescription {
            kind: "answer".to_string(),
            sdp: answer.sdp,
        })
    }

    pub async fn add_ice_candidate(&self, candidate: serde_json::Value) -> anyhow::Result<()> {
        let init: RTCIceCandidateInit = serde_json::from_value(candidate.clone())
            .unwrap_or(RTCIceCandidateInit {
                candidate: candidate.get("candidate").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                sdp_mid: candidate.get("sdpMid").and_then(|v| v.as_str()).map(|s| s.to_string()),
                sdp_mline_index: candidate.get("sdpMLineIndex").and_then(|v| v.as_u64()).map(|v| v as u16),
                ..Default::default()
            });
        self.peer_connection
            .add_ice_candidate(init)
            .await
            .context("failed to add ICE candidate")
    }

    pub async fn close(&self) -> anyhow::Result<()> {
        self.peer_connection.close().await.context("failed to close peer connection")
    }
}

/// Holds at most one live WebRTC session per client.
pub type SharedWebRtcSession = Arc<Mutex<Option<WebRtcSession>>>;

/// Closes and clears any previous session in `slot`. Must be called before
/// building a new `WebRtcSession` for the same client (§4.6 step 1):
/// both are pinned to the same single UDP port, so a window where both
/// exist at once is not just wasted work, it's a port conflict.
pub async fn close_existing(slot: &SharedWebRtcSession) {
    let mut guard = slot.lock().await;
    if let Some(old) = guard.take() {
        if let Err(e) = old.close().await {
            tracing::debug!("error closing previous peer connection: {e}");
        }
    }
}

pub async fn store_session(slot: &SharedWebRtcSession, new_session: WebRtcSession) {
    *slot.lock().await = Some(new_session);
}

/// Resolve the IP to advertise for 1:1 NAT mapping: an explicit env
/// override wins, otherwise the first IPv4 address resolved from the
/// request's `Host` header.
pub fn resolve_public_ip(env_override: Option<&str>, host_header: Option<&str>) -> Option<String> {
    if let Some(ip) = env_override {
        return Some(ip.to_string());
    }
    let host = host_header?;
    let host_only = host.split(':').next().unwrap_or(host);
    if host_only.parse::<std::net::Ipv4Addr>().is_ok() {
        return Some(host_only.to_string());
    }
    use std::net::ToSocketAddrs;
    (host_only, 0u16)
        .to_socket_addrs()
        .ok()?
        .find_map(|addr| match addr {
            std::net::SocketAddr::V4(v4) => Some(v4.ip().to_string()),
            _ => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_transport_cc_and_remb_feedback_lines() {
        let sdp = "m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
                   a=rtcp-fb:96 transport-cc\r\n\
                   a=rtcp-fb:96 goog-remb\r\n\
                   a=rtcp-fb:96 nack pli\r\n\
                   a=extmap:3 http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01\r\n";
        let cleaned = strip_congestion_control(sdp);
        assert!(!cleaned.contains("transport-cc"));
        assert!(!cleaned.contains("goog-remb"));
        assert!(!cleaned.contains("extmap"));
        assert!(cleaned.contains("nack pli"));
    }

    #[test]
    fn env_override_wins_over_host_header() {
        let ip = resolve_public_ip(Some("203.0.113.5"), Some("example.com:8080"));
        assert_eq!(ip.as_deref(), Some("203.0.113.5"));
    }

    #[test]
    fn literal_ipv4_host_header_is_used_directly() {
        let ip = resolve_public_ip(None, Some("198.51.100.9:8080"));
        assert_eq!(ip.as_deref(), Some("198.51.100.9"));
    }

    #[test]
    fn missing_override_and_host_yields_none() {
        assert_eq!(resolve_public_ip(None, None), None);
    }
}
