//! C8: axum router. No auth/session layer survives from the teacher here —
//! this process serves exactly one desktop to whoever can reach its port.
//! A WebSocket upgrade is handled on *any* path (the control channel has no
//! fixed mount point in this system), everything else falls through to the
//! static viewer.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{FromRequestParts, State};
use axum::http::{header, HeaderMap, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tower::ServiceExt;
use tower_http::services::ServeDir;

use crate::config_registry::ConfigRegistry;
use crate::fanout::FrameFanout;
use crate::input::InputCoalescer;
use crate::ws_session::{self, SessionContext};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ConfigRegistry>,
    pub input: Arc<InputCoalescer>,
    pub fanout: Arc<FrameFanout>,
    pub video_track: Arc<webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample>,
    pub webrtc_port: u16,
    pub webrtc_public_ip: Option<String>,
}

pub fn build_router(state: Arc<AppState>, public_dir: &str) -> Router {
    let serve_dir = ServeDir::new(public_dir);

    Router::new()
        .fallback(move |request: Request<Body>| {
            let state = Arc::clone(&state);
            let serve_dir = serve_dir.clone();
            async move { route_by_upgrade(state, serve_dir, request).await }
        })
        .layer(axum::middleware::from_fn(security_headers))
}

/// Every path is a candidate WebSocket upgrade: if the request carries an
/// `Upgrade: websocket` header, hand off to the control session (C7);
/// otherwise serve it as a static file.
async fn route_by_upgrade(state: Arc<AppState>, serve_dir: ServeDir, request: Request<Body>) -> Response {
    let is_ws_upgrade = request
        .headers()
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    if !is_ws_upgrade {
        return match serve_dir.oneshot(request).await {
            Ok(response) => response.map(Body::new).into_response(),
            Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
        };
    }

    let (mut parts, _body) = request.into_parts();
    let headers = parts.headers.clone();
    match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
        Ok(ws) => ws_upgrade(State(state), headers, ws).await.into_response(),
        Err(rejection) => rejection.into_response(),
    }
}

async fn ws_upgrade(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let host_header = headers
        .get("host")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    ws.max_message_size(65_536).on_upgrade(move |socket| {
        let ctx = SessionContext {
            config: state.config.clone(),
            input: state.input.clone(),
            fanout: state.fanout.clone(),
            video_track: state.video_track.clone(),
            webrtc_port: state.webrtc_port,
            webrtc_public_ip: state.webrtc_public_ip.clone(),
            host_header,
        };
        ws_session::handle_socket(socket, ctx)
    })
}

/// No HSTS here: this server speaks plain HTTP/WS by design (TLS, if
/// wanted, belongs in a reverse proxy in front of it).
async fn security_headers(
    request: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "referrer-policy",
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static(
            "default-src 'self'; script-src 'self'; style-src 'self' 'unsafe-inline'; \
             connect-src 'self' wss: ws:; img-src 'self' data:; media-src 'self' blob:",
        ),
    );
    headers.insert(
        "cross-origin-opener-policy",
        HeaderValue::from_static("same-origin"),
    );
    headers.insert(
        "cross-origin-embedder-policy",
        HeaderValue::from_static("require-corp"),
    );

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use webrtc::api::media_engine::MIME_TYPE_H264;
    use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
    use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

    fn test_state() -> Arc<AppState> {
        let config = ConfigRegistry::new(30, 1280, 720, 3840, 2160);
        let fanout = FrameFanout::new(30);
        let input = Arc::new(InputCoalescer::spawn(
            "true".to_string(),
            ":99".to_string(),
            config.screen_handle(),
        ));
        let video_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_string(),
                ..Default::default()
            },
            "video".to_string(),
            "deskcast".to_string(),
        ));
        Arc::new(AppState {
            config,
            input,
            fanout,
            video_track,
            webrtc_port: 8080,
            webrtc_public_ip: None,
        })
    }

    fn manifest_dir() -> &'static str {
        env!("CARGO_MANIFEST_DIR")
    }

    #[tokio::test]
    async fn security_headers_present_on_static_fallback() {
        let app = build_router(test_state(), manifest_dir());
        let request = Request::builder().uri("/missing.html").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert!(response.headers().contains_key("x-content-type-options"));
        assert!(response.headers().contains_key("content-security-policy"));
    }

    #[tokio::test]
    async fn static_file_is_served_from_public_dir() {
        let app = build_router(test_state(), manifest_dir());
        let request = Request::builder().uri("/Cargo.toml").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&body).contains("deskcast-server"));
    }

    #[tokio::test]
    async fn upgrade_header_on_ws_path_is_routed_to_control_session() {
        let app = build_router(test_state(), manifest_dir());
        let request = Request::builder()
            .uri("/ws")
            .header(axum::http::header::UPGRADE, "websocket")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        // missing Sec-WebSocket-Key/Version means the handshake itself is
        // rejected, but BAD_REQUEST (not a static 404) proves it reached
        // the upgrade path rather than the file service.
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn upgrade_header_on_arbitrary_path_is_also_routed_to_control_session() {
        let app = build_router(test_state(), manifest_dir());
        let request = Request::builder()
            .uri("/anything/at/all")
            .header(axum::http::header::UPGRADE, "websocket")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn missing_upgrade_header_on_ws_path_falls_back_to_static_service() {
        let app = build_router(test_state(), manifest_dir());
        let request = Request::builder().uri("/ws").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        // no file named "ws" in the served directory
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
