// pitchtrack-core/src/lib.rs

//! The core logic for block-based pitch tracking.
//! This crate splits captured audio blocks into overlapping segments,
//! measures their loudness, hands them to a pitch estimator and rebuilds
//! a time-ordered queue of results. It is completely headless and does
//! no audio capture of its own.
//!
//! ```
//! use pitchtrack_core::{
//!     AudioBuffer, DetectionSession, DetectorConfig, InlineEstimator, YinAnalyzer,
//! };
//!
//! let samples: Vec<f32> = (0..4096)
//!     .map(|i| 0.5 * (2.0 * std::f32::consts::PI * 440.0 * i as f32 / 44100.0).sin())
//!     .collect();
//! let buffer = AudioBuffer::new(&samples, 44100);
//!
//! let estimator = InlineEstimator::new(YinAnalyzer::default());
//! let mut session = DetectionSession::new(DetectorConfig::default(), estimator).unwrap();
//! session.detect(&buffer, 0.0, buffer.duration_ms()).unwrap();
//!
//! while let Some(sample) = session.pop_next() {
//!     println!(
//!         "{} at {:.1} ms, {:.1} dB",
//!         sample.pitch.note, sample.timestamp_ms, sample.loudness_db
//!     );
//! }
//! ```

pub mod config;
pub mod error;
pub mod estimator;
pub mod fft;
pub mod loudness;
pub mod pitch;
pub mod queue;
pub mod segment;
pub mod session;
pub mod tuning;

pub use config::{
    Correlation, DetectorConfig, LevelMode, LoudnessConfig, OverflowPolicy, QueueConfig,
    SegmentCountPolicy, SegmentationConfig,
};
pub use error::{Error, Result};
pub use estimator::{
    EstimatorReply, InlineEstimator, PitchAnalyzer, PitchEstimate, PitchEstimator, ReplyKind,
    Responder, SegmentSubmission, SegmentToken, ThreadedEstimator,
};
pub use loudness::{LoudnessMeter, SILENCE_DB};
pub use pitch::YinAnalyzer;
pub use queue::{PitchSample, ResultQueue};
pub use segment::{AudioBuffer, Segment, Segmenter, segment_count};
pub use session::DetectionSession;
