//! # Detector Configuration
//!
//! Tuning knobs for segmentation, loudness measurement, result queueing and
//! callback correlation. Everything has a sensible default and the whole tree
//! can be loaded from (or saved to) a JSON file for quick experiments.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

/// Complete detector configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub segmentation: SegmentationConfig,
    pub loudness: LoudnessConfig,
    pub queue: QueueConfig,
    pub correlation: Correlation,
}

/// How many segments a buffer is split into.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentCountPolicy {
    /// Derive the count from a target number of detections per second.
    RateAdaptive { target_rate: f64 },
    /// Always use the same number of segments.
    Fixed { count: usize },
}

/// Segmentation parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentationConfig {
    pub count: SegmentCountPolicy,
    /// Guard margin on each side of a segment, as a fraction of the segment width.
    pub guard_fraction: f64,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            count: SegmentCountPolicy::RateAdaptive { target_rate: 100.0 },
            // Half a part on each interior boundary
            guard_fraction: 0.5,
        }
    }
}

/// Which amplitude statistic feeds the decibel conversion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LevelMode {
    #[default]
    Rms,
    /// Largest sample after 16-bit quantization.
    Peak,
}

/// Reference constants for the decibel conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoudnessConfig {
    /// Full-scale sample value (16-bit signed PCM).
    pub full_scale: i32,
    /// Divisor mapping scaled amplitude to pressure.
    pub ref_pressure: f64,
    /// p0 in `20 * log10(p / p0)`.
    pub reference_pressure: f64,
    /// Pressures at or below this map to the silence sentinel.
    pub pressure_floor: f64,
    pub mode: LevelMode,
}

impl Default for LoudnessConfig {
    fn default() -> Self {
        Self {
            full_scale: 32767,
            ref_pressure: 51805.5336,
            reference_pressure: 0.0002,
            pressure_floor: 0.0,
            mode: LevelMode::Rms,
        }
    }
}

/// What to do when a bounded queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    #[default]
    DropOldest,
    RejectNewest,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// `None` keeps an unbounded backlog.
    pub capacity: Option<usize>,
    pub overflow: OverflowPolicy,
}

/// How an estimator reply is matched to the segment that produced it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Correlation {
    /// Match on the token echoed by the estimator. No-pitch replies resolve
    /// their own segment, so later timestamps stay correct.
    #[default]
    Token,
    /// Legacy arrival-order matching: the n-th pitch reply belongs to the n-th
    /// segment. No-pitch replies do not advance, shifting later attributions.
    Positional,
}

impl DetectorConfig {
    /// Loads a configuration from a JSON file and validates it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Like [`DetectorConfig::load`], but falls back to defaults when the file does not exist.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text)?;
        Ok(())
    }

    /// Checks that every parameter is in a usable range.
    pub fn validate(&self) -> Result<()> {
        match self.segmentation.count {
            SegmentCountPolicy::RateAdaptive { target_rate } => {
                if !(target_rate.is_finite() && target_rate > 0.0) {
                    return Err(Error::InvalidConfig(format!(
                        "target_rate must be positive, got {target_rate}"
                    )));
                }
            }
            SegmentCountPolicy::Fixed { count } => {
                if count == 0 {
                    return Err(Error::InvalidConfig(
                        "fixed segment count must be at least 1".into(),
                    ));
                }
            }
        }

        let guard = self.segmentation.guard_fraction;
        if !(0.0..=2.0).contains(&guard) {
            return Err(Error::InvalidConfig(format!(
                "guard_fraction must be within [0, 2], got {guard}"
            )));
        }

        let l = &self.loudness;
        if l.full_scale <= 0 {
            return Err(Error::InvalidConfig("full_scale must be positive".into()));
        }
        if !(l.ref_pressure.is_finite() && l.ref_pressure > 0.0) {
            return Err(Error::InvalidConfig("ref_pressure must be positive".into()));
        }
        if !(l.reference_pressure.is_finite() && l.reference_pressure > 0.0) {
            return Err(Error::InvalidConfig("reference_pressure must be positive".into()));
        }
        if !(l.pressure_floor.is_finite() && l.pressure_floor >= 0.0) {
            return Err(Error::InvalidConfig("pressure_floor must be non-negative".into()));
        }

        if self.queue.capacity == Some(0) {
            return Err(Error::InvalidConfig("queue capacity must be at least 1".into()));
        }
        Ok(())
    }
}
