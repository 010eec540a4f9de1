//! # Loudness Measurement
//!
//! Converts the amplitude of a sample segment to a decibel value referenced to
//! a fixed pressure constant. Degenerate input (empty, silent, non-finite)
//! maps to [`SILENCE_DB`] so a NaN or infinity never reaches a result.

use crate::config::{LevelMode, LoudnessConfig};

/// Value reported for segments with no measurable level.
pub const SILENCE_DB: f64 = 0.0;

/// Pure decibel meter over `f32` sample slices.
#[derive(Debug, Clone)]
pub struct LoudnessMeter {
    config: LoudnessConfig,
}

impl Default for LoudnessMeter {
    fn default() -> Self {
        Self::new(LoudnessConfig::default())
    }
}

impl LoudnessMeter {
    pub fn new(config: LoudnessConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LoudnessConfig {
        &self.config
    }

    /// Measures the loudness of `samples` in dB.
    ///
    /// The level (RMS or quantized peak) is scaled to full scale, divided by
    /// the reference pressure and converted with `20 * log10(p / p0)`.
    pub fn measure(&self, samples: &[f32]) -> f64 {
        let level = match self.config.mode {
            LevelMode::Rms => rms(samples) * self.config.full_scale as f64,
            LevelMode::Peak => quantized_peak(samples, self.config.full_scale) as f64,
        };

        let pressure = level / self.config.ref_pressure;
        if !pressure.is_finite() || pressure <= self.config.pressure_floor || pressure <= 0.0 {
            return SILENCE_DB;
        }

        let db = 20.0 * (pressure / self.config.reference_pressure).log10();
        if db.is_finite() { db } else { SILENCE_DB }
    }
}

/// Root-mean-square amplitude. Zero for an empty slice.
pub fn rms(samples: &[f32]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_sq / samples.len() as f64).sqrt()
}

/// Largest positive sample after rounding to the integer full-scale grid.
fn quantized_peak(samples: &[f32], full_scale: i32) -> i32 {
    let scale = full_scale as f64;
    samples
        .iter()
        .filter(|s| s.is_finite())
        .map(|&s| ((s as f64) * scale).round().clamp(-scale - 1.0, scale) as i32)
        .max()
        .unwrap_or(0)
        .max(0)
}
