//! # Segmentation
//!
//! Splits an audio buffer into overlapping analysis segments. Each segment has
//! a nominal range, used for timing, and a wider analysis range that reaches
//! into its neighbours by a guard margin so the estimator sees some context
//! around the boundary.
//!
//! The nominal ranges always tile `[0, frame_length)` exactly: integer division
//! leaves a remainder, and the last segment absorbs it.

use std::ops::Range;

use crate::config::SegmentCountPolicy;
use crate::error::{Error, Result};

/// A borrowed block of mono samples captured by the host.
#[derive(Debug, Clone, Copy)]
pub struct AudioBuffer<'a> {
    samples: &'a [f32],
    sample_rate: u32,
}

impl<'a> AudioBuffer<'a> {
    pub fn new(samples: &'a [f32], sample_rate: u32) -> Self {
        Self { samples, sample_rate }
    }

    pub fn samples(&self) -> &'a [f32] {
        self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn frame_length(&self) -> usize {
        self.samples.len()
    }

    /// Length of the buffer in milliseconds.
    pub fn duration_ms(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64 * 1000.0
    }

    /// Rejects buffers that would divide by zero further down.
    pub fn validate(&self) -> Result<()> {
        if self.samples.is_empty() {
            return Err(Error::InvalidInput("buffer has zero frames".into()));
        }
        if self.sample_rate == 0 {
            return Err(Error::InvalidInput("sample rate is zero".into()));
        }
        Ok(())
    }
}

/// One analysis unit within a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Position in submission order.
    pub index: usize,
    /// Nominal range, used for timing.
    pub nominal: Range<usize>,
    /// Guard-extended range handed to the estimator.
    pub analysis: Range<usize>,
}

impl Segment {
    /// Samples of the analysis range.
    pub fn samples<'a>(&self, buffer: &AudioBuffer<'a>) -> &'a [f32] {
        &buffer.samples()[self.analysis.clone()]
    }
}

/// Computes the number of segments for a buffer.
///
/// The rate-adaptive form picks enough segments to reach `target_rate`
/// detections per second: `ceil(target_rate / (sample_rate / frame_length))`,
/// at least one and never more than there are frames.
pub fn segment_count(
    policy: SegmentCountPolicy,
    frame_length: usize,
    sample_rate: u32,
) -> Result<usize> {
    if frame_length == 0 || sample_rate == 0 {
        return Err(Error::InvalidInput(format!(
            "cannot segment {frame_length} frames at {sample_rate} Hz"
        )));
    }

    let count = match policy {
        SegmentCountPolicy::Fixed { count } => count,
        SegmentCountPolicy::RateAdaptive { target_rate } => {
            let buffers_per_second = sample_rate as f64 / frame_length as f64;
            // Tolerate float noise when the ratio is an exact integer
            let raw = target_rate / buffers_per_second - 1e-9;
            if raw.is_finite() { raw.ceil().max(1.0) as usize } else { 1 }
        }
    };
    Ok(count.clamp(1, frame_length))
}

/// Splits buffers into guard-extended segments.
#[derive(Debug, Clone)]
pub struct Segmenter {
    guard_fraction: f64,
}

impl Segmenter {
    pub fn new(guard_fraction: f64) -> Self {
        Self { guard_fraction: guard_fraction.max(0.0) }
    }

    pub fn guard_fraction(&self) -> f64 {
        self.guard_fraction
    }

    /// Splits `frame_length` frames into `count` segments, in increasing start order.
    pub fn split(&self, frame_length: usize, count: usize) -> Result<Vec<Segment>> {
        if frame_length == 0 {
            return Err(Error::InvalidInput("buffer has zero frames".into()));
        }
        if count == 0 || count > frame_length {
            return Err(Error::InvalidInput(format!(
                "cannot split {frame_length} frames into {count} segments"
            )));
        }

        let frames_per_part = frame_length / count;
        let guard = (frames_per_part as f64 * self.guard_fraction).floor() as usize;

        let segments = (0..count)
            .map(|i| {
                let start = i * frames_per_part;
                let end = if i + 1 == count { frame_length } else { start + frames_per_part };
                Segment {
                    index: i,
                    nominal: start..end,
                    analysis: start.saturating_sub(guard)..(end + guard).min(frame_length),
                }
            })
            .collect();
        Ok(segments)
    }
}
