mod cli;
mod config_registry;
mod demux;
mod encoder;
mod error;
mod fanout;
mod http;
mod input;
mod ws_session;
mod webrtc_session;

use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;
use tracing_subscriber::EnvFilter;
use webrtc::api::media_engine::MIME_TYPE_H264;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::config_registry::ConfigRegistry;
use crate::encoder::EncoderSupervisor;
use crate::fanout::FrameFanout;
use crate::http::AppState;
use crate::input::InputCoalescer;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = cli::parse_args()?;

    if !std::path::Path::new(&args.public_dir).is_dir() {
        tracing::warn!(
            "public dir '{}' does not exist — the viewer will not load",
            args.public_dir
        );
    }

    let config = ConfigRegistry::new(args.fps, 1280, 720, args.max_width, args.max_height);

    let video_track = Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_H264.to_string(),
            clock_rate: 90000,
            ..Default::default()
        },
        "video".to_string(),
        "deskcast".to_string(),
    ));

    let fanout = FrameFanout::with_video_track(args.fps, Arc::clone(&video_track));

    let input = Arc::new(InputCoalescer::spawn(
        args.injector_bin.clone(),
        format!(":{}", args.display_num),
        config.screen_handle(),
    ));

    let supervisor = EncoderSupervisor::new(
        Arc::clone(&config),
        config.screen_handle(),
        Arc::clone(&fanout),
        args.encoder_bin.clone(),
        args.display_num.clone(),
        args.test_pattern,
    );

    let should_run = Arc::new(AtomicBool::new(true));
    let supervisor_handle = {
        let supervisor = Arc::clone(&supervisor);
        let should_run = Arc::clone(&should_run);
        tokio::spawn(async move { supervisor.run(should_run).await })
    };

    let state = Arc::new(AppState {
        config,
        input,
        fanout,
        video_track,
        webrtc_port: args.port,
        webrtc_public_ip: args.webrtc_public_ip.clone(),
    });

    let app = http::build_router(Arc::clone(&state), &args.public_dir)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    let request_id = request
                        .headers()
                        .get("x-request-id")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-");
                    tracing::info_span!(
                        "request",
                        method = %request.method(),
                        path = %request.uri().path(),
                        request_id = %request_id,
                    )
                })
                .on_request(|_request: &axum::http::Request<_>, _span: &tracing::Span| {
                    tracing::event!(Level::INFO, "started");
                })
                .on_response(
                    |response: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     _span: &tracing::Span| {
                        tracing::event!(
                            Level::INFO,
                            status = %response.status().as_u16(),
                            duration_ms = %latency.as_millis(),
                            "completed"
                        );
                    },
                ),
        )
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    let bind_addr: SocketAddr = format!("0.0.0.0:{}", args.port)
        .parse()
        .context("invalid bind address")?;
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind to {bind_addr}"))?;

    tracing::info!("===========================================");
    tracing::info!("  deskcast server");
    tracing::info!("  Listening on http://{bind_addr}");
    tracing::info!("===========================================");

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("received SIGINT, shutting down"),
                _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
            }
        })
        .await
        .context("server error")?;

    should_run.store(false, std::sync::atomic::Ordering::Release);
    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), supervisor_handle).await;

    tracing::info!("deskcast server shut down cleanly");
    Ok(())
}
