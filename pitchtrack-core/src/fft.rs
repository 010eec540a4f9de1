//! # Fast Fourier Transform (FFT) Module
//!
//! Magnitude spectra for segment-sized signals, used to refine a time-domain
//! pitch estimate. Signals are DC-centred and Hann-windowed before the
//! transform.

use rustfft::{FftPlanner, num_complex::Complex};

/// Removes the DC offset from a signal by making its average value zero.
fn remove_dc_offset(signal: &mut [f32]) {
    let len = signal.len();
    if len == 0 {
        return;
    }
    let avg = signal.iter().sum::<f32>() / len as f32;
    if avg.abs() > 1e-6 {
        for sample in signal.iter_mut() {
            *sample -= avg;
        }
    }
}

/// Applies a Hann window to reduce spectral leakage.
fn apply_hann_window(buffer: &mut [f32]) {
    let n = buffer.len();
    if n < 2 {
        return;
    }
    let n_minus_1 = (n - 1) as f32;
    for (i, sample) in buffer.iter_mut().enumerate() {
        let multiplier = 0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / n_minus_1).cos());
        *sample *= multiplier;
    }
}

/// Reusable spectrum calculator. Plans are cached by the planner across
/// calls, which matters because segment lengths repeat from buffer to buffer.
pub struct SpectrumAnalyzer {
    planner: FftPlanner<f32>,
}

impl std::fmt::Debug for SpectrumAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpectrumAnalyzer").finish_non_exhaustive()
    }
}

impl Default for SpectrumAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl SpectrumAnalyzer {
    pub fn new() -> Self {
        Self { planner: FftPlanner::new() }
    }

    /// Magnitudes of the first `signal.len() / 2` bins (up to Nyquist).
    pub fn magnitudes(&mut self, signal: &[f32]) -> Vec<f32> {
        if signal.is_empty() {
            return Vec::new();
        }

        let mut processed = signal.to_vec();
        remove_dc_offset(&mut processed);
        apply_hann_window(&mut processed);

        let fft = self.planner.plan_fft_forward(processed.len());
        let mut buffer: Vec<Complex<f32>> = processed
            .into_iter()
            .map(|sample| Complex { re: sample, im: 0.0 })
            .collect();
        fft.process(&mut buffer);

        buffer
            .iter()
            .take(signal.len() / 2)
            .map(|c| c.norm()) // sqrt(re^2 + im^2)
            .collect()
    }
}
