//! # Pitch Estimator Interface
//!
//! The detection session never computes pitch itself. It hands each segment
//! to a [`PitchEstimator`] together with a [`Responder`], and the estimator
//! answers through the responder whenever it is done: inline during
//! `submit`, or later from another thread.
//!
//! Every submission carries a [`SegmentToken`]. Estimators must echo it back
//! unchanged. With token correlation that is all the session needs; with the
//! legacy positional correlation the estimator must also reply exactly once
//! per submission, in submission order.

use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::tuning;

/// Output of an estimator for one segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PitchEstimate {
    /// Nearest note name with octave, e.g. "A4".
    pub note: String,
    /// Measured frequency in Hz.
    pub frequency: f64,
    /// Measured frequency minus the nearest note's frequency, in Hz.
    pub offset_frequency: f64,
    /// Offset as a percentage of the gap to the neighbouring note.
    pub percentage: f64,
    pub cents: f64,
}

impl PitchEstimate {
    /// Builds an estimate by placing `frequency` against the equal-tempered scale.
    pub fn from_frequency(frequency: f64) -> Self {
        let offset = tuning::offset_from_nearest(frequency);
        Self {
            note: offset.note.name.clone(),
            frequency,
            offset_frequency: offset.frequency,
            percentage: offset.percentage,
            cents: offset.cents,
        }
    }
}

/// Opaque identity of one submitted segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegmentToken {
    generation: u64,
    index: usize,
}

impl SegmentToken {
    pub(crate) fn new(generation: u64, index: usize) -> Self {
        Self { generation, index }
    }

    /// Sequence number of the `detect` call that produced the segment.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

/// A segment handed to an estimator. The samples are a copy of the segment's
/// guard-extended range, so the estimator may keep them past `detect`.
#[derive(Debug, Clone)]
pub struct SegmentSubmission {
    pub token: SegmentToken,
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplyKind {
    Pitch(PitchEstimate),
    /// The segment held no discernible pitch (silence, noise).
    NoPitch,
    Error(String),
}

/// One estimator callback.
#[derive(Debug, Clone, PartialEq)]
pub struct EstimatorReply {
    pub token: SegmentToken,
    pub kind: ReplyKind,
}

/// Callback handle given to estimators. Cheap to clone and `Send`, so
/// replies can come from any thread.
#[derive(Debug, Clone)]
pub struct Responder {
    tx: Sender<EstimatorReply>,
}

impl Responder {
    pub fn pitch(&self, token: SegmentToken, estimate: PitchEstimate) -> bool {
        self.send(EstimatorReply { token, kind: ReplyKind::Pitch(estimate) })
    }

    pub fn no_pitch(&self, token: SegmentToken) -> bool {
        self.send(EstimatorReply { token, kind: ReplyKind::NoPitch })
    }

    pub fn error(&self, token: SegmentToken, message: impl Into<String>) -> bool {
        self.send(EstimatorReply { token, kind: ReplyKind::Error(message.into()) })
    }

    /// Delivers a reply. Returns `false` once the session has been dropped.
    pub fn send(&self, reply: EstimatorReply) -> bool {
        if self.tx.send(reply).is_err() {
            tracing::debug!("detection session is gone, reply discarded");
            return false;
        }
        true
    }
}

/// Creates the reply channel shared by a session and its estimator.
pub(crate) fn reply_channel() -> (Responder, Receiver<EstimatorReply>) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (Responder { tx }, rx)
}

/// A pitch estimator the session can submit segments to.
///
/// `submit` must not block waiting for analysis to finish when the estimator
/// is asynchronous. It may reply immediately through `responder`, or clone
/// the responder and reply later. Each submission gets at most one reply.
pub trait PitchEstimator: Send {
    fn submit(&mut self, submission: SegmentSubmission, responder: &Responder) -> Result<()>;
}

impl<E: PitchEstimator + ?Sized> PitchEstimator for Box<E> {
    fn submit(&mut self, submission: SegmentSubmission, responder: &Responder) -> Result<()> {
        (**self).submit(submission, responder)
    }
}

/// A synchronous pitch algorithm: samples in, zero or one estimate out.
pub trait PitchAnalyzer: Send {
    fn analyze(
        &mut self,
        samples: &[f32],
        sample_rate: u32,
    ) -> std::result::Result<Option<PitchEstimate>, String>;
}

fn respond(
    analyzer: &mut dyn PitchAnalyzer,
    submission: &SegmentSubmission,
    responder: &Responder,
) -> bool {
    let token = submission.token;
    match analyzer.analyze(&submission.samples, submission.sample_rate) {
        Ok(Some(estimate)) => responder.pitch(token, estimate),
        Ok(None) => responder.no_pitch(token),
        Err(message) => responder.error(token, message),
    }
}

/// Runs an analyzer on the caller's thread and replies before `submit` returns.
#[derive(Debug)]
pub struct InlineEstimator<A> {
    analyzer: A,
}

impl<A: PitchAnalyzer> InlineEstimator<A> {
    pub fn new(analyzer: A) -> Self {
        Self { analyzer }
    }
}

impl<A: PitchAnalyzer> PitchEstimator for InlineEstimator<A> {
    fn submit(&mut self, submission: SegmentSubmission, responder: &Responder) -> Result<()> {
        respond(&mut self.analyzer, &submission, responder);
        Ok(())
    }
}

/// Runs an analyzer on a dedicated worker thread.
///
/// Submissions are queued on a channel and processed one at a time, so
/// replies keep submission order. Dropping the estimator signals the worker
/// to stop and joins it; queued submissions that were not started are
/// abandoned.
pub struct ThreadedEstimator {
    jobs: Sender<(SegmentSubmission, Responder)>,
    shutdown_tx: Sender<()>,
    thread_handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for ThreadedEstimator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadedEstimator")
            .field("queued", &self.jobs.len())
            .field("running", &self.thread_handle.is_some())
            .finish()
    }
}

impl ThreadedEstimator {
    pub fn spawn<A: PitchAnalyzer + 'static>(mut analyzer: A) -> Result<Self> {
        let (jobs, jobs_rx) = crossbeam_channel::unbounded::<(SegmentSubmission, Responder)>();
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(1);

        let thread_handle = thread::Builder::new()
            .name("pitch-estimator".into())
            .spawn(move || {
                tracing::debug!("estimator worker started");
                loop {
                    crossbeam_channel::select! {
                        recv(jobs_rx) -> msg => match msg {
                            Ok((submission, responder)) => {
                                respond(&mut analyzer, &submission, &responder);
                            }
                            Err(_) => break,
                        },
                        recv(shutdown_rx) -> _ => break,
                    }
                }
                tracing::debug!("estimator worker finished");
            })?;

        Ok(Self {
            jobs,
            shutdown_tx,
            thread_handle: Some(thread_handle),
        })
    }

    /// Submissions waiting for the worker.
    pub fn queued(&self) -> usize {
        self.jobs.len()
    }
}

impl PitchEstimator for ThreadedEstimator {
    fn submit(&mut self, submission: SegmentSubmission, responder: &Responder) -> Result<()> {
        self.jobs
            .send((submission, responder.clone()))
            .map_err(|_| Error::Estimator("estimator worker has stopped".into()))
    }
}

impl Drop for ThreadedEstimator {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.try_send(());
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                tracing::warn!("estimator worker panicked");
            }
        }
    }
}
