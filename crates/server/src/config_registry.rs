//! C1: process-wide encoder parameters and screen geometry, with a
//! coalesced restart-signal channel. Mirrors the teacher's single-writer
//! broadcast-channel shape (`signaling::SignalingChannel`), but here the
//! "payload" is just a unit signal that the supervisor drains and coalesces.

use std::sync::Arc;

use deskcast_protocol::{ConfigError, EncoderConfig, ScreenState};
use tokio::sync::{Notify, RwLock};

/// Applied under one lock section so a batch of field writes and the
/// restart signal they trigger are atomic with respect to readers.
pub struct ConfigRegistry {
    inner: RwLock<Inner>,
    /// Shared with the encoder supervisor and input coalescer so pointer
    /// normalization and capture geometry always see the same screen state
    /// `resize` just wrote, never a stale copy.
    screen: Arc<RwLock<ScreenState>>,
    max_width: u32,
    max_height: u32,
    /// Coalescing restart signal: any number of `notify_one` calls between
    /// two `notified().await` completions collapse into a single wakeup.
    restart_signal: Notify,
}

struct Inner {
    encoder: EncoderConfig,
}

/// Fields a client `config` message may set; all optional, applied as one
/// batch so multiple changed fields trigger at most one restart.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfigPatch {
    pub bandwidth_mbps: Option<u32>,
    pub quality: Option<u32>,
    pub framerate: Option<u32>,
    pub vbr: Option<bool>,
    pub cpu_effort: Option<u32>,
    pub cpu_threads: Option<u32>,
    pub draw_mouse: Option<bool>,
}

impl ConfigRegistry {
    pub fn new(initial_fps: u32, initial_width: u32, initial_height: u32, max_width: u32, max_height: u32) -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(Inner {
                encoder: EncoderConfig::new(initial_fps),
            }),
            screen: Arc::new(RwLock::new(ScreenState::new(initial_width, initial_height))),
            max_width,
            max_height,
            restart_signal: Notify::new(),
        })
    }

    pub async fn snapshot(&self) -> (EncoderConfig, ScreenState) {
        let inner = self.inner.read().await;
        let screen = *self.screen.read().await;
        (inner.encoder, screen)
    }

    /// Shared handle so the encoder supervisor and input coalescer always
    /// read the same screen state a `resize` call just wrote.
    pub fn screen_handle(&self) -> Arc<RwLock<ScreenState>> {
        Arc::clone(&self.screen)
    }

    /// Apply a batch of config fields, clamping any that land outside their
    /// allowed range rather than rejecting the whole patch. Returns the
    /// fields that had to be clamped (empty if every field landed in
    /// range) alongside whether anything actually changed (and therefore a
    /// restart was signaled). This operation cannot fail.
    pub async fn apply_patch(&self, patch: ConfigPatch) -> (bool, Vec<ConfigError>) {
        let mut inner = self.inner.write().await;
        let before = inner.encoder;
        let mut candidate = before;

        // framerate is applied before the rate-control fields so a combined
        // {bandwidth, framerate} message computes bitrate/GOP against the
        // new fps, not the stale one.
        if let Some(fps) = patch.framerate {
            candidate.fps = fps;
        }
        if let Some(bandwidth) = patch.bandwidth_mbps {
            candidate.target_mode = deskcast_protocol::TargetMode::Bandwidth;
            candidate.bandwidth_mbps = bandwidth;
        }
        if let Some(quality) = patch.quality {
            candidate.target_mode = deskcast_protocol::TargetMode::Quality;
            candidate.quality = quality;
        }
        if let Some(vbr) = patch.vbr {
            candidate.vbr = vbr;
        }
        if let Some(effort) = patch.cpu_effort {
            candidate.cpu_effort = effort;
        }
        if let Some(threads) = patch.cpu_threads {
            candidate.cpu_threads = threads;
        }
        if let Some(draw_mouse) = patch.draw_mouse {
            candidate.draw_mouse = draw_mouse;
        }

        let adjusted = candidate.clamp_fields();
        inner.encoder = candidate;
        let changed = candidate != before;
        drop(inner);
        if changed {
            self.restart_signal.notify_one();
        }
        (changed, adjusted)
    }

    /// Resize, clamped to `[MIN, max]`. Returns `true` if the clamped value
    /// differs from the current screen state (and a restart was signaled).
    pub async fn resize(&self, width: u32, height: u32) -> bool {
        if width == 0 || height == 0 {
            return false;
        }
        let clamped = ScreenState::clamp(width, height, self.max_width, self.max_height);
        let mut screen = self.screen.write().await;
        if clamped == *screen {
            return false;
        }
        *screen = clamped;
        drop(screen);
        self.restart_signal.notify_one();
        true
    }

    /// Await the next coalesced restart request. Multiple signals raised
    /// while no one is waiting collapse into a single wakeup.
    pub async fn wait_for_restart(&self) {
        self.restart_signal.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn identical_config_patch_reports_no_change() {
        let registry = ConfigRegistry::new(30, 1280, 720, 3840, 2160);
        let (cfg, _) = registry.snapshot().await;
        let patch = ConfigPatch {
            bandwidth_mbps: Some(cfg.bandwidth_mbps),
            ..Default::default()
        };
        // first application with the *same* value as the default is a no-op
        // only if the default already matches; force a real baseline first.
        registry
            .apply_patch(ConfigPatch {
                bandwidth_mbps: Some(7),
                ..Default::default()
            })
            .await;
        let (changed, adjusted) = registry
            .apply_patch(ConfigPatch {
                bandwidth_mbps: Some(7),
                ..Default::default()
            })
            .await;
        assert!(!changed);
        assert!(adjusted.is_empty());
        let _ = patch;
    }

    #[tokio::test]
    async fn out_of_range_patch_is_clamped_into_range() {
        let registry = ConfigRegistry::new(30, 1280, 720, 3840, 2160);
        let (changed, adjusted) = registry
            .apply_patch(ConfigPatch {
                quality: Some(5),
                ..Default::default()
            })
            .await;
        assert!(changed);
        assert_eq!(adjusted.len(), 1);
        assert!(matches!(adjusted[0], deskcast_protocol::ConfigError::OutOfRange { field: "quality", .. }));
        let (cfg, _) = registry.snapshot().await;
        assert_eq!(cfg.quality, 10);
    }

    #[tokio::test]
    async fn resize_to_same_clamped_value_is_noop() {
        let registry = ConfigRegistry::new(30, 1280, 720, 3840, 2160);
        assert!(!registry.resize(1280, 720).await);
    }

    #[tokio::test]
    async fn resize_zero_is_rejected() {
        let registry = ConfigRegistry::new(30, 1280, 720, 3840, 2160);
        assert!(!registry.resize(0, 0).await);
        let (_, screen) = registry.snapshot().await;
        assert_eq!(screen, ScreenState::new(1280, 720));
    }

    #[tokio::test]
    async fn resize_below_minimum_clamps_to_320x240() {
        let registry = ConfigRegistry::new(30, 1280, 720, 3840, 2160);
        assert!(registry.resize(10, 10).await);
        let (_, screen) = registry.snapshot().await;
        assert_eq!(screen, ScreenState::new(320, 240));
    }

    #[tokio::test]
    async fn combined_bandwidth_and_framerate_is_one_logical_change() {
        let registry = ConfigRegistry::new(30, 1280, 720, 3840, 2160);
        let (changed, adjusted) = registry
            .apply_patch(ConfigPatch {
                bandwidth_mbps: Some(5),
                framerate: Some(15),
                ..Default::default()
            })
            .await;
        assert!(changed);
        assert!(adjusted.is_empty());
        let (cfg, _) = registry.snapshot().await;
        assert_eq!(cfg.fps, 15);
        assert_eq!(cfg.bandwidth_mbps, 5);
    }

    #[tokio::test]
    async fn rapid_signals_coalesce_into_one_wait() {
        let registry = ConfigRegistry::new(30, 1280, 720, 3840, 2160);
        for i in 0..20u32 {
            registry
                .apply_patch(ConfigPatch {
                    quality: Some(10 + i),
                    ..Default::default()
                })
                .await;
        }
        // A single wait_for_restart resolves immediately: Notify's permit
        // model means at least one pending notification is consumed here,
        // it does not queue 20 separate wakeups.
        tokio::time::timeout(std::time::Duration::from_millis(50), registry.wait_for_restart())
            .await
            .expect("restart signal should already be pending");
    }
}
