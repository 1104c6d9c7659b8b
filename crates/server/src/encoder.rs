//! C3: spawns, monitors, and restarts the external encoder child. Enforces
//! "at most one encoder child alive at any instant" by tying each loop
//! iteration's respawn to the previous child's de-muxer observing EOF,
//! rather than to a timer — same discipline as the session manager's
//! SIGTERM-then-wait shutdown, just looped instead of one-shot.

use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use deskcast_protocol::{EncoderConfig, ScreenState, TargetMode};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncBufReadExt;
use tokio::process::{Child, Command};
use tokio::sync::RwLock;

use crate::config_registry::ConfigRegistry;
use crate::demux::demux_stream;
use crate::error::EncoderError;
use crate::fanout::FrameFanout;

const RESTART_BACKOFF: Duration = Duration::from_secs(1);
/// Frame-decimation floor for `vbr = true`: never let more than this many
/// frames pass without emitting one, even on an unchanging screen.
const VBR_MAX_SKIP: u32 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Starting,
    Running,
    Stopping,
}

pub struct EncoderSupervisor {
    config: Arc<ConfigRegistry>,
    screen: Arc<RwLock<ScreenState>>,
    fanout: Arc<FrameFanout>,
    encoder_bin: String,
    display_num: String,
    test_pattern: bool,
    epoch: AtomicU32,
    state: RwLock<SupervisorState>,
}

impl EncoderSupervisor {
    pub fn new(
        config: Arc<ConfigRegistry>,
        screen: Arc<RwLock<ScreenState>>,
        fanout: Arc<FrameFanout>,
        encoder_bin: String,
        display_num: String,
        test_pattern: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            screen,
            fanout,
            encoder_bin,
            display_num,
            test_pattern,
            epoch: AtomicU32::new(0),
            state: RwLock::new(SupervisorState::Idle),
        })
    }

    pub async fn state(&self) -> SupervisorState {
        *self.state.read().await
    }

    pub fn epoch(&self) -> u32 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Drives the Idle -> Starting -> Running -> Stopping -> Idle cycle
    /// until `should_run` goes false (process shutdown). Never returns
    /// while the process wants encoding to continue.
    pub async fn run(self: Arc<Self>, should_run: Arc<std::sync::atomic::AtomicBool>) {
        while should_run.load(Ordering::Acquire) {
            *self.state.write().await = SupervisorState::Starting;
            let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;

            let (cfg, screen) = self.config.snapshot().await;
            let spawned = self.spawn_child(&cfg, &screen).await.map_err(EncoderError::Spawn);

            let mut child = match spawned {
                Ok(child) => child,
                Err(e) => {
                    tracing::error!("{e}");
                    *self.state.write().await = SupervisorState::Idle;
                    tokio::time::sleep(RESTART_BACKOFF).await;
                    continue;
                }
            };

            let pid = child.id();
            let stdout = match child.stdout.take().ok_or(EncoderError::MissingStdout) {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!("{e}");
                    let _ = child.kill().await;
                    *self.state.write().await = SupervisorState::Idle;
                    tokio::time::sleep(RESTART_BACKOFF).await;
                    continue;
                }
            };
            if let Some(stderr) = child.stderr.take() {
                tokio::spawn(log_stderr(stderr));
            }

            *self.state.write().await = SupervisorState::Running;
            let fanout = Arc::clone(&self.fanout);
            let demux_handle = tokio::spawn(async move { demux_stream(stdout, epoch, fanout).await });

            tokio::select! {
                status = child.wait() => {
                    match status {
                        Ok(status) => tracing::info!(?status, epoch, "encoder exited"),
                        Err(e) => tracing::warn!("{}", EncoderError::Wait(e)),
                    }
                }
                _ = self.config.wait_for_restart() => {
                    tracing::info!(epoch, "config changed, restarting encoder");
                    terminate(pid);
                    if tokio::time::timeout(Duration::from_secs(5), child.wait()).await.is_err() {
                        tracing::warn!(epoch, "encoder ignored SIGTERM, killing");
                        let _ = child.kill().await;
                    }
                }
            }

            *self.state.write().await = SupervisorState::Stopping;
            // The invariant "at most one encoder child" depends on this:
            // don't loop back to Starting until the de-muxer has observed EOF.
            let _ = demux_handle.await;
            *self.state.write().await = SupervisorState::Idle;

            if should_run.load(Ordering::Acquire) {
                tokio::time::sleep(RESTART_BACKOFF).await;
            }
        }
    }

    async fn spawn_child(&self, cfg: &EncoderConfig, screen: &ScreenState) -> std::io::Result<Child> {
        let args = build_args(cfg, screen, &self.display_num, self.test_pattern);
        Command::new(&self.encoder_bin)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
    }
}

fn terminate(pid: Option<u32>) {
    let Some(pid) = pid else { return };
    let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
}

async fn log_stderr(stderr: tokio::process::ChildStderr) {
    let mut lines = tokio::io::BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(target: "encoder", "{line}");
    }
}

/// Compose the encoder's argument vector from a config/screen snapshot.
/// Pure function so the rate-control math is independently testable
/// without spawning anything.
pub fn build_args(cfg: &EncoderConfig, screen: &ScreenState, display_num: &str, test_pattern: bool) -> Vec<String> {
    let mut args = Vec::new();

    if test_pattern {
        args.push("--test-source".to_string());
    } else {
        args.push("--source".to_string());
        args.push(format!(":{display_num}.0"));
    }
    args.push("--width".to_string());
    args.push(screen.width.to_string());
    args.push("--height".to_string());
    args.push(screen.height.to_string());
    args.push("--fps".to_string());
    args.push(cfg.fps.to_string());
    args.push("--gop".to_string());
    args.push(cfg.fps.to_string());
    args.push("--cpu-effort".to_string());
    args.push(cfg.cpu_effort.to_string());
    args.push("--cpu-threads".to_string());
    args.push(cfg.cpu_threads.to_string());
    if cfg.draw_mouse {
        args.push("--draw-mouse".to_string());
    }

    match cfg.target_mode {
        TargetMode::Bandwidth => {
            let target = cfg.bandwidth_target_kbps();
            let buffer = (target as f64 * 0.2).round() as u32;
            args.push("--bitrate".to_string());
            args.push(target.to_string());
            args.push("--maxrate".to_string());
            args.push(target.to_string());
            args.push("--bufsize".to_string());
            args.push(buffer.to_string());
        }
        TargetMode::Quality => {
            let q = cfg.quantizer();
            let maxrate = cfg.quality_maxrate_kbps();
            let buffer = (maxrate as f64 * 0.2).round() as u32;
            args.push("--qp".to_string());
            args.push(q.to_string());
            args.push("--maxrate".to_string());
            args.push(maxrate.to_string());
            args.push("--bufsize".to_string());
            args.push(buffer.to_string());
        }
    }

    if cfg.vbr {
        args.push("--vbr".to_string());
        args.push("--vbr-max-skip".to_string());
        args.push(VBR_MAX_SKIP.to_string());
    }

    args
}
