use serde::{Deserialize, Serialize};

/// Minimum and maximum screen dimensions accepted by a resize request.
pub const MIN_WIDTH: u32 = 320;
pub const MIN_HEIGHT: u32 = 240;

/// Current output geometry. Clamped to `[MIN_WIDTH..=max_width, MIN_HEIGHT..=max_height]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenState {
    pub width: u32,
    pub height: u32,
}

impl ScreenState {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Clamp a requested size into `[MIN_WIDTH, max_width] x [MIN_HEIGHT, max_height]`.
    pub fn clamp(width: u32, height: u32, max_width: u32, max_height: u32) -> Self {
        Self {
            width: width.clamp(MIN_WIDTH, max_width.max(MIN_WIDTH)),
            height: height.clamp(MIN_HEIGHT, max_height.max(MIN_HEIGHT)),
        }
    }
}

/// Encoder rate-control strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetMode {
    Bandwidth,
    Quality,
}

/// Process-wide encoder parameters. Every field change that differs from the
/// current value is expected to trigger exactly one encoder restart; callers
/// batch several field writes under one `ConfigRegistry::apply` call so that
/// a single client message collapses to a single restart.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EncoderConfig {
    pub target_mode: TargetMode,
    pub bandwidth_mbps: u32,
    pub quality: u32,
    pub fps: u32,
    pub vbr: bool,
    pub cpu_effort: u32,
    pub cpu_threads: u32,
    pub draw_mouse: bool,
}

impl EncoderConfig {
    pub fn new(fps: u32) -> Self {
        Self {
            target_mode: TargetMode::Bandwidth,
            bandwidth_mbps: 5,
            quality: 70,
            fps,
            vbr: false,
            cpu_effort: 4,
            cpu_threads: 4,
            draw_mouse: true,
        }
    }

    /// Quantizer for `target_mode = Quality`: linear map of `quality` in
    /// `[10,100]` to `q` in `[4,50]`, clamped to the encoder's legal `[4,63]`.
    pub fn quantizer(&self) -> u32 {
        let q = 50.0 - (self.quality as f64 - 10.0) * 46.0 / 90.0;
        q.round().clamp(4.0, 63.0) as u32
    }

    /// Maxrate in kbps for `target_mode = Quality`.
    pub fn quality_maxrate_kbps(&self) -> u32 {
        let rate = 2000.0 + (self.quality as f64 - 10.0) * 18000.0 / 90.0;
        rate.round() as u32
    }

    /// Target/maxrate in kbps for `target_mode = Bandwidth`.
    pub fn bandwidth_target_kbps(&self) -> u32 {
        self.bandwidth_mbps * 1000
    }

    /// Clamps every field into the range a client `config` message is
    /// allowed to set, reporting (but not rejecting) the fields it had to
    /// move. Field setters clamp rather than reject outright: a config
    /// update has no failure mode, it just may not land exactly as sent.
    pub fn clamp_fields(&mut self) -> Vec<ConfigError> {
        let mut adjusted = Vec::new();

        if self.bandwidth_mbps < 1 {
            adjusted.push(ConfigError::OutOfRange {
                field: "bandwidth_mbps",
                value: self.bandwidth_mbps as i64,
            });
            self.bandwidth_mbps = 1;
        }
        if !(10..=100).contains(&self.quality) {
            adjusted.push(ConfigError::OutOfRange {
                field: "quality",
                value: self.quality as i64,
            });
            self.quality = self.quality.clamp(10, 100);
        }
        if !(1..=120).contains(&self.fps) {
            adjusted.push(ConfigError::OutOfRange {
                field: "fps",
                value: self.fps as i64,
            });
            self.fps = self.fps.clamp(1, 120);
        }
        if self.cpu_effort > 8 {
            adjusted.push(ConfigError::OutOfRange {
                field: "cpu_effort",
                value: self.cpu_effort as i64,
            });
            self.cpu_effort = 8;
        }
        if !(1..=16).contains(&self.cpu_threads) {
            adjusted.push(ConfigError::OutOfRange {
                field: "cpu_threads",
                value: self.cpu_threads as i64,
            });
            self.cpu_threads = self.cpu_threads.clamp(1, 16);
        }

        adjusted
    }
}

/// Reports which field a `clamp_fields` call had to move into range; not a
/// failure, since the corresponding operation always succeeds.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: i64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_boundaries_match_spec() {
        let mut cfg = EncoderConfig::new(30);
        cfg.quality = 10;
        assert_eq!(cfg.quantizer(), 50);
        cfg.quality = 100;
        assert_eq!(cfg.quantizer(), 4);
    }

    #[test]
    fn quality_maxrate_boundaries() {
        let mut cfg = EncoderConfig::new(30);
        cfg.quality = 10;
        assert_eq!(cfg.quality_maxrate_kbps(), 2000);
        cfg.quality = 100;
        assert_eq!(cfg.quality_maxrate_kbps(), 20000);
    }

    #[test]
    fn bandwidth_target_is_mbps_times_1000() {
        let mut cfg = EncoderConfig::new(30);
        cfg.bandwidth_mbps = 3;
        assert_eq!(cfg.bandwidth_target_kbps(), 3000);
    }

    #[test]
    fn screen_state_clamps_small_request() {
        let s = ScreenState::clamp(10, 10, 3840, 2160);
        assert_eq!(s, ScreenState::new(MIN_WIDTH, MIN_HEIGHT));
    }

    #[test]
    fn screen_state_clamps_large_request() {
        let s = ScreenState::clamp(7680, 4320, 3840, 2160);
        assert_eq!(s, ScreenState::new(3840, 2160));
    }

    #[test]
    fn screen_state_passes_through_in_range() {
        let s = ScreenState::clamp(1920, 1080, 3840, 2160);
        assert_eq!(s, ScreenState::new(1920, 1080));
    }

    #[test]
    fn default_config_has_nothing_to_clamp() {
        assert!(EncoderConfig::new(30).clamp_fields().is_empty());
    }

    #[test]
    fn quality_outside_10_to_100_is_clamped_and_reported() {
        let mut cfg = EncoderConfig::new(30);
        cfg.quality = 5;
        let adjusted = cfg.clamp_fields();
        assert_eq!(
            adjusted,
            vec![ConfigError::OutOfRange {
                field: "quality",
                value: 5
            }]
        );
        assert_eq!(cfg.quality, 10);
    }

    #[test]
    fn fps_above_120_is_clamped_to_120() {
        let mut cfg = EncoderConfig::new(30);
        cfg.fps = 240;
        let adjusted = cfg.clamp_fields();
        assert!(!adjusted.is_empty());
        assert_eq!(cfg.fps, 120);
    }
}
