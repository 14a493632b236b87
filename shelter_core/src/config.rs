//! Observer configuration and persisted control preferences.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Geometry limits for the inspector overlay, in terminal cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayConfig {
    /// Gap kept between the overlay and the viewport edges / its anchor
    pub margin: i32,
    pub default_width: i32,
    pub default_height: i32,
    pub min_width: i32,
    pub min_height: i32,
    pub max_width: i32,
    pub max_height: i32,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            margin: 2,
            default_width: 48,
            default_height: 14,
            min_width: 24,
            min_height: 6,
            max_width: 120,
            max_height: 40,
        }
    }
}

/// Configuration for an observer session.
#[derive(Debug, Clone)]
pub struct ObserverConfig {
    /// Base URL of the simulation service API
    pub base_url: String,

    /// Live-state poll cadence (default: 2000 ms)
    pub poll_interval: Duration,

    /// Budget for ordinary requests (default: 10 s)
    pub request_timeout: Duration,

    /// Budget for `run_next`, which runs a whole simulated turn (default: 5 min)
    pub run_next_timeout: Duration,

    /// Trailing steps shown in windowed timeline view (default: 5)
    pub window_len: usize,

    /// Decision records kept per agent (default: 10)
    pub history_cap: usize,

    /// How long a freshly settled agent stays highlighted (default: 1500 ms)
    pub settle_glow: Duration,

    /// Directory of the sled database holding persisted state
    pub storage_path: PathBuf,

    /// Inspector overlay geometry
    pub overlay: OverlayConfig,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000/api".to_string(),
            poll_interval: Duration::from_millis(2000),
            request_timeout: Duration::from_secs(10),
            run_next_timeout: Duration::from_secs(300),
            window_len: 5,
            history_cap: 10,
            settle_glow: Duration::from_millis(1500),
            storage_path: PathBuf::from(".shelter-observer"),
            overlay: OverlayConfig::default(),
        }
    }
}

/// Playback pace multiplier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeedTier {
    Slow,
    #[default]
    Normal,
    Fast,
}

impl SpeedTier {
    /// Factor applied to every step delay.
    pub fn factor(self) -> f64 {
        match self {
            SpeedTier::Slow => 1.5,
            SpeedTier::Normal => 1.0,
            SpeedTier::Fast => 0.5,
        }
    }

    pub fn next(self) -> Self {
        match self {
            SpeedTier::Slow => SpeedTier::Normal,
            SpeedTier::Normal => SpeedTier::Fast,
            SpeedTier::Fast => SpeedTier::Slow,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            SpeedTier::Slow => "slow",
            SpeedTier::Normal => "normal",
            SpeedTier::Fast => "fast",
        }
    }
}

/// User-facing controls that survive a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPreferences {
    pub auto_run: bool,
    pub speed: SpeedTier,
    pub poll_interval_ms: u64,
}

impl Default for ControlPreferences {
    fn default() -> Self {
        Self {
            auto_run: false,
            speed: SpeedTier::Normal,
            poll_interval_ms: 2000,
        }
    }
}

impl ControlPreferences {
    /// Poll interval, never below 250 ms.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(250))
    }
}
