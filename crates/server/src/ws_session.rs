//! C7: per-connection control-channel session. One `handle_socket` call per
//! client; owns the binary frame receiver handed out by the fan-out (C5)
//! and dispatches every inbound `ClientMessage` to the subsystem that owns
//! it (C1 config, C2 input, C6 WebRTC).

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use deskcast_protocol::{ClientMessage, ServerMessage};
use tokio::time::{interval, Duration, Instant};
use uuid::Uuid;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::config_registry::ConfigRegistry;
use crate::fanout::FrameFanout;
use crate::input::{InputCoalescer, InputTask};
use crate::webrtc_session::{self, SharedWebRtcSession, WebRtcSession};

const WS_PING_INTERVAL: Duration = Duration::from_secs(30);
const WS_PONG_TIMEOUT: Duration = Duration::from_secs(90);

pub struct SessionContext {
    pub config: Arc<ConfigRegistry>,
    pub input: Arc<InputCoalescer>,
    pub fanout: Arc<FrameFanout>,
    pub video_track: Arc<TrackLocalStaticSample>,
    pub webrtc_port: u16,
    pub webrtc_public_ip: Option<String>,
    pub host_header: Option<String>,
}

pub async fn handle_socket(mut socket: WebSocket, ctx: SessionContext) {
    let client_id = Uuid::new_v4();
    let mut frame_rx = ctx.fanout.register_client(client_id).await;
    let webrtc_session: SharedWebRtcSession = Arc::new(tokio::sync::Mutex::new(None));
    let (ice_tx, mut ice_rx) = tokio::sync::mpsc::channel::<serde_json::Value>(32);

    let mut ping_interval = interval(WS_PING_INTERVAL);
    ping_interval.tick().await;
    let mut last_pong = Instant::now();

    tracing::info!(%client_id, "control session connected");

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if last_pong.elapsed() > WS_PONG_TIMEOUT {
                    tracing::debug!(%client_id, "ping timeout, closing");
                    break;
                }
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }

            Some(frame) = frame_rx.recv() => {
                if socket.send(Message::Binary(frame.to_vec().into())).await.is_err() {
                    tracing::debug!(%client_id, "binary send failed");
                    break;
                }
            }

            Some(candidate) = ice_rx.recv() => {
                let msg = ServerMessage::WebrtcIce { candidate };
                if let Ok(json) = serde_json::to_string(&msg) {
                    if socket.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
            }

            incoming = socket.recv() => {
                let Some(result) = incoming else { break };
                match result {
                    Ok(Message::Text(text)) => {
                        if let Err(e) = dispatch_text(&text, &ctx, client_id, &webrtc_session, &ice_tx, &mut socket).await {
                            tracing::debug!(%client_id, "error handling message: {e}");
                        }
                    }
                    Ok(Message::Pong(_)) => {
                        last_pong = Instant::now();
                    }
                    Ok(Message::Close(_)) => {
                        tracing::info!(%client_id, "control session closed by client");
                        break;
                    }
                    Err(e) => {
                        tracing::debug!(%client_id, "socket error: {e}");
                        break;
                    }
                    _ => {}
                }
            }

            else => break,
        }
    }

    ctx.fanout.remove_client(client_id).await;
    if let Some(session) = webrtc_session.lock().await.take() {
        let _ = session.close().await;
    }
    tracing::info!(%client_id, "control session disconnected");
}

async fn dispatch_text(
    text: &str,
    ctx: &SessionContext,
    client_id: Uuid,
    webrtc_session: &SharedWebRtcSession,
    ice_tx: &tokio::sync::mpsc::Sender<serde_json::Value>,
    socket: &mut WebSocket,
) -> anyhow::Result<()> {
    let msg: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            let err = ServerMessage::Error {
                message: format!("invalid message: {e}"),
            };
            if let Ok(json) = serde_json::to_string(&err) {
                let _ = socket.send(Message::Text(json.into())).await;
            }
            return Ok(());
        }
    };

    match msg {
        ClientMessage::Ping { timestamp } => {
            let pong = ServerMessage::Pong { timestamp };
            if let Ok(json) = serde_json::to_string(&pong) {
                let _ = socket.send(Message::Text(json.into())).await;
            }
        }
        ClientMessage::Keydown { key } => ctx.input.submit(InputTask::KeyDown(key)),
        ClientMessage::Keyup { key } => ctx.input.submit(InputTask::KeyUp(key)),
        ClientMessage::Mousemove { x, y } => ctx.input.submit(InputTask::Mouse { nx: x, ny: y }),
        ClientMessage::Mousedown { button } => {
            ctx.input.submit(InputTask::Button { button, down: true })
        }
        ClientMessage::Mouseup { button } => {
            ctx.input.submit(InputTask::Button { button, down: false })
        }
        ClientMessage::Spawn { command } => {
            if deskcast_protocol::is_spawn_allowed(&command) {
                tokio::spawn(async move {
                    let _ = tokio::process::Command::new(&command).spawn();
                });
            } else {
                tracing::warn!(%client_id, %command, "rejected spawn outside allow-list");
            }
        }
        ClientMessage::Config {
            bandwidth,
            quality,
            framerate,
            vbr,
            cpu_effort,
            cpu_threads,
            enable_desktop_mouse,
        } => {
            let patch = crate::config_registry::ConfigPatch {
                bandwidth_mbps: bandwidth,
                quality,
                framerate,
                vbr,
                cpu_effort,
                cpu_threads,
                draw_mouse: enable_desktop_mouse,
            };
            let (changed, adjusted) = ctx.config.apply_patch(patch).await;
            if changed {
                ctx.fanout.update_fps(ctx.config.snapshot().await.0.fps);
            }
            for e in adjusted {
                tracing::debug!(%client_id, "config field clamped: {e}");
            }
        }
        ClientMessage::Resize { width, height } => {
            if ctx.config.resize(width, height).await {
                ctx.fanout.update_fps(ctx.config.snapshot().await.0.fps);
            }
        }
        ClientMessage::WebrtcOffer { sdp } => {
            // Close any previous peer for this client before building the
            // new one: both are pinned to the same UDP port.
            webrtc_session::close_existing(webrtc_session).await;

            let public_ip = webrtc_session::resolve_public_ip(
                ctx.webrtc_public_ip.as_deref(),
                ctx.host_header.as_deref(),
            );
            match WebRtcSession::new(ctx.webrtc_port, public_ip, Arc::clone(&ctx.video_track), ice_tx.clone()).await {
                Ok(session) => match session.handle_offer(sdp).await {
                    Ok(answer) => {
                        webrtc_session::store_session(webrtc_session, session).await;
                        let msg = ServerMessage::WebrtcAnswer { sdp: answer };
                        if let Ok(json) = serde_json::to_string(&msg) {
                            let _ = socket.send(Message::Text(json.into())).await;
                        }
                    }
                    Err(e) => tracing::warn!(%client_id, "failed to answer offer: {e}"),
                },
                Err(e) => tracing::warn!(%client_id, "failed to create peer connection: {e}"),
            }
        }
        ClientMessage::WebrtcIce { candidate } => {
            let guard = webrtc_session.lock().await;
            if let Some(session) = guard.as_ref() {
                if let Err(e) = session.add_ice_candidate(candidate).await {
                    tracing::debug!(%client_id, "failed to add remote ICE candidate: {e}");
                }
            }
        }
        ClientMessage::WebrtcReady => {
            ctx.fanout.set_webrtc_ready(client_id, true).await;
        }
    }

    Ok(())
}
