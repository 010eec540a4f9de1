//! # Pitch Detection Module
//!
//! Reference [`PitchAnalyzer`] built on the YIN algorithm, with an optional
//! spectral refinement pass. Hosts that bring their own estimator never touch
//! this module; it exists so the detection pipeline can run end to end.
//!
//! ## Features
//! - YIN pitch detection with octave error prevention
//! - Noise rejection through an RMS gate and a clarity check
//! - Parabolic interpolation for sub-sample accuracy
//! - Spectrum refinement for improved precision

use crate::estimator::{PitchAnalyzer, PitchEstimate};
use crate::fft::SpectrumAnalyzer;

/// Largest normalized difference a period may have before it counts as noise.
const CLARITY_THRESHOLD: f32 = 0.1;

/// Lowest frequency reported; anything below is treated as no pitch.
const MIN_FREQUENCY: f32 = 20.0;

/// Detects the fundamental frequency of `signal` with the YIN algorithm.
///
/// # Returns
/// * `Some(frequency)` - Detected frequency in Hz
/// * `None` - Silence, noise, or a signal too short to hold a period
pub fn detect_pitch_yin(signal: &[f32], sample_rate: u32, amplitude_threshold: f32) -> Option<f32> {
    let frame_size = signal.len();
    let half = frame_size / 2;
    if half < 3 || sample_rate == 0 {
        return None;
    }

    // Noise gate
    let rms = (signal.iter().map(|&s| s * s).sum::<f32>() / frame_size as f32).sqrt();
    if rms < amplitude_threshold {
        return None;
    }

    // Difference function
    let mut yin_buffer = vec![0.0_f32; half];
    for tau in 1..half {
        let mut diff = 0.0;
        for i in 0..half {
            let delta = signal[i] - signal[i + tau];
            diff += delta * delta;
        }
        yin_buffer[tau] = diff;
    }

    // Cumulative mean normalized difference
    let mut running_sum = 0.0;
    yin_buffer[0] = 1.0;
    for (tau, value) in yin_buffer.iter_mut().enumerate().skip(1) {
        running_sum += *value;
        if running_sum != 0.0 {
            *value *= tau as f32 / running_sum;
        } else {
            *value = 1.0;
        }
    }

    // First dip close to the global minimum, which avoids picking a multiple of the period
    let min_val = yin_buffer.iter().skip(1).cloned().fold(f32::INFINITY, f32::min);
    let threshold = min_val + 0.05;

    let mut period = (2..half).find(|&tau| yin_buffer[tau] < threshold)?;
    while period + 1 < half && yin_buffer[period + 1] < yin_buffer[period] {
        period += 1;
    }

    if yin_buffer[period] > CLARITY_THRESHOLD || period + 1 >= half {
        return None;
    }

    let y1 = yin_buffer[period - 1];
    let y2 = yin_buffer[period];
    let y3 = yin_buffer[period + 1];
    let curvature = y1 - 2.0 * y2 + y3;
    let period_float = if curvature != 0.0 {
        period as f32 + (y1 - y3) / (2.0 * curvature)
    } else {
        period as f32
    };

    let frequency = sample_rate as f32 / period_float;
    if frequency.is_finite() && frequency > MIN_FREQUENCY {
        Some(frequency)
    } else {
        None
    }
}

/// Refines a frequency estimate using a magnitude spectrum of `fft_len` points.
///
/// Looks for the strongest bin within two bins of `rough_freq` and applies
/// parabolic interpolation on the log magnitudes around it. Falls back to
/// `rough_freq` whenever the spectrum does not support a better answer.
pub fn refine_from_spectrum(
    magnitudes: &[f32],
    fft_len: usize,
    rough_freq: f32,
    sample_rate: u32,
) -> f32 {
    if rough_freq <= 0.0 || magnitudes.len() < 3 || fft_len == 0 {
        return rough_freq;
    }
    let bin_width = sample_rate as f32 / fft_len as f32;
    let target_bin = rough_freq / bin_width;
    let search_radius = 2.0;
    let start_bin = (target_bin - search_radius).max(0.0) as usize;
    let end_bin = ((target_bin + search_radius) as usize).min(magnitudes.len() - 1);
    if start_bin >= end_bin {
        return rough_freq;
    }

    let peak_bin = magnitudes[start_bin..=end_bin]
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(offset, _)| start_bin + offset);
    let Some(peak_bin) = peak_bin else {
        return rough_freq;
    };
    if peak_bin == 0 || peak_bin >= magnitudes.len() - 1 {
        return rough_freq;
    }

    let y1 = magnitudes[peak_bin - 1].ln();
    let y2 = magnitudes[peak_bin].ln();
    let y3 = magnitudes[peak_bin + 1].ln();
    if !y1.is_finite() || !y2.is_finite() || !y3.is_finite() {
        return rough_freq;
    }

    let denominator = 2.0 * y2 - y1 - y3;
    if denominator.abs() < 1e-6 {
        return rough_freq;
    }

    let peak_shift = (y3 - y1) / (2.0 * denominator);
    let final_freq = (peak_bin as f32 + peak_shift) * bin_width;
    if final_freq.is_finite() && final_freq > 0.0 {
        final_freq
    } else {
        rough_freq
    }
}

/// YIN analyzer with optional spectral refinement.
#[derive(Debug)]
pub struct YinAnalyzer {
    /// Minimum RMS amplitude for a segment to be analyzed.
    pub amplitude_threshold: f32,
    /// Refine the YIN estimate against the segment's spectrum.
    pub refine: bool,
    spectrum: SpectrumAnalyzer,
}

impl Default for YinAnalyzer {
    fn default() -> Self {
        Self::new(0.01)
    }
}

impl YinAnalyzer {
    pub fn new(amplitude_threshold: f32) -> Self {
        Self {
            amplitude_threshold,
            refine: true,
            spectrum: SpectrumAnalyzer::new(),
        }
    }

    pub fn with_refinement(mut self, refine: bool) -> Self {
        self.refine = refine;
        self
    }

    /// Frequency of `samples`, or `None` when no clear pitch is present.
    pub fn detect_frequency(&mut self, samples: &[f32], sample_rate: u32) -> Option<f32> {
        let rough = detect_pitch_yin(samples, sample_rate, self.amplitude_threshold)?;
        if !self.refine {
            return Some(rough);
        }

        let magnitudes = self.spectrum.magnitudes(samples);
        let refined = refine_from_spectrum(&magnitudes, samples.len(), rough, sample_rate);
        // Keep the refinement only when it stays within an eighth tone of YIN
        if (refined / rough).log2().abs() * 1200.0 <= 25.0 {
            Some(refined)
        } else {
            Some(rough)
        }
    }
}

impl PitchAnalyzer for YinAnalyzer {
    fn analyze(
        &mut self,
        samples: &[f32],
        sample_rate: u32,
    ) -> Result<Option<PitchEstimate>, String> {
        if samples.iter().any(|s| !s.is_finite()) {
            return Err("segment contains non-finite samples".into());
        }
        Ok(self
            .detect_frequency(samples, sample_rate)
            .map(|freq| PitchEstimate::from_frequency(freq as f64)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generate_sine(sample_rate: u32, freq: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| {
                let phase = 2.0 * std::f32::consts::PI * freq * i as f32 / sample_rate as f32;
                0.5 * phase.sin()
            })
            .collect()
    }

    #[test]
    fn detects_a440() {
        let samples = generate_sine(44100, 440.0, 2048);
        let freq = detect_pitch_yin(&samples, 44100, 0.01).expect("should detect a pitch");
        assert!((freq - 440.0).abs() < 2.0, "expected ~440 Hz, got {freq}");
    }

    #[test]
    fn detects_various_frequencies() {
        let mut analyzer = YinAnalyzer::default();
        for freq in [220.0_f32, 330.0, 440.0, 660.0, 880.0] {
            let samples = generate_sine(44100, freq, 2048);
            let detected = analyzer
                .detect_frequency(&samples, 44100)
                .expect("should detect a pitch");
            let error_percent = ((detected - freq) / freq).abs() * 100.0;
            assert!(error_percent < 2.0, "{freq} Hz detected as {detected} Hz");
        }
    }

    #[test]
    fn silence_is_no_pitch() {
        let mut analyzer = YinAnalyzer::default();
        assert_eq!(analyzer.analyze(&[0.0; 1024], 44100), Ok(None));
    }

    #[test]
    fn short_signal_is_no_pitch() {
        assert_eq!(detect_pitch_yin(&[0.5, -0.5, 0.5, -0.5], 44100, 0.01), None);
    }

    #[test]
    fn non_finite_samples_are_an_error() {
        let mut analyzer = YinAnalyzer::default();
        let mut samples = generate_sine(44100, 440.0, 512);
        samples[10] = f32::NAN;
        assert!(analyzer.analyze(&samples, 44100).is_err());
    }

    #[test]
    fn analyzer_names_the_note() {
        let mut analyzer = YinAnalyzer::default().with_refinement(false);
        let samples = generate_sine(44100, 440.0, 2048);
        let estimate = analyzer.analyze(&samples, 44100).unwrap().expect("pitch");
        assert_eq!(estimate.note, "A4");
        assert!(estimate.cents.abs() < 10.0);
    }

    #[test]
    fn refinement_falls_back_on_bad_input() {
        assert_eq!(refine_from_spectrum(&[], 0, 440.0, 44100), 440.0);
        assert_eq!(refine_from_spectrum(&[1.0; 16], 32, -1.0, 44100), -1.0);
    }
}
