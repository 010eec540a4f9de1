//! # Detection Session
//!
//! Orchestrates a `detect` call: segments the buffer, measures each segment's
//! loudness, submits the segments to the estimator and turns the replies that
//! come back into timestamped [`PitchSample`]s.
//!
//! The session is the only writer of its state. Estimators reply through a
//! channel, and the session drains that channel inside `detect`, `pump` and
//! `pop_next`, so submission and callback handling never race even when the
//! estimator works on another thread.

use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};

use crate::config::{Correlation, DetectorConfig};
use crate::error::{Error, Result};
use crate::estimator::{
    EstimatorReply, PitchEstimate, PitchEstimator, ReplyKind, Responder, SegmentSubmission,
    SegmentToken, reply_channel,
};
use crate::loudness::LoudnessMeter;
use crate::queue::{PitchSample, ResultQueue};
use crate::segment::{AudioBuffer, Segmenter, segment_count};

/// State of the most recent `detect` call. Replaced wholesale on every call.
#[derive(Debug, Clone, Default)]
struct CallState {
    generation: u64,
    detect_duration_ms: f64,
    segment_count: usize,
    time_slice_ms: f64,
    /// Index-aligned with segment submission order.
    loudness: Vec<f64>,
    /// Segments that already received a reply (token correlation only).
    resolved: Vec<bool>,
    /// Segments the estimator accepted. Below `segment_count` only if a submit failed.
    submitted: usize,
    next_expected: usize,
}

impl CallState {
    /// `D - (N - i - 1) * T`: the last segment lands on the nominal duration.
    fn timestamp(&self, index: usize) -> f64 {
        self.detect_duration_ms - (self.segment_count - index - 1) as f64 * self.time_slice_ms
    }

    fn is_complete(&self) -> bool {
        self.next_expected >= self.submitted
    }

    /// Stops waiting for segments `from..` after the estimator refused one.
    fn abandon_from(&mut self, from: usize) {
        self.submitted = from;
        for resolved in &mut self.resolved[from..] {
            *resolved = true;
        }
    }
}

/// Long-lived pitch detection session.
pub struct DetectionSession {
    config: DetectorConfig,
    segmenter: Segmenter,
    meter: LoudnessMeter,
    estimator: Box<dyn PitchEstimator>,
    responder: Responder,
    replies: Receiver<EstimatorReply>,
    call: CallState,
    generation: u64,
    last_block_time_ms: Option<f64>,
    queue: ResultQueue,
}

impl std::fmt::Debug for DetectionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectionSession")
            .field("config", &self.config)
            .field("generation", &self.generation)
            .field("segment_count", &self.call.segment_count)
            .field("next_expected", &self.call.next_expected)
            .field("pending", &self.queue.len())
            .finish_non_exhaustive()
    }
}

impl DetectionSession {
    pub fn new(config: DetectorConfig, estimator: impl PitchEstimator + 'static) -> Result<Self> {
        config.validate()?;
        let (responder, replies) = reply_channel();
        Ok(Self {
            segmenter: Segmenter::new(config.segmentation.guard_fraction),
            meter: LoudnessMeter::new(config.loudness.clone()),
            queue: ResultQueue::new(&config.queue),
            config,
            estimator: Box::new(estimator),
            responder,
            replies,
            call: CallState::default(),
            generation: 0,
            last_block_time_ms: None,
        })
    }

    /// Processes one block of audio.
    ///
    /// `at_time_ms` is the host's capture time for the block and
    /// `duration_ms` the nominal duration timestamps are counted back from.
    /// Returns once every segment has been submitted; replies are collected
    /// later by [`pump`](Self::pump) and [`pop_next`](Self::pop_next).
    ///
    /// If the estimator refuses a segment, the error is returned and the call
    /// is closed at that segment: replies to the segments submitted before it
    /// are still collected, and the call counts as complete once they arrive.
    pub fn detect(
        &mut self,
        buffer: &AudioBuffer<'_>,
        at_time_ms: f64,
        duration_ms: f64,
    ) -> Result<()> {
        buffer.validate()?;
        if !duration_ms.is_finite() {
            return Err(Error::InvalidInput(format!(
                "duration must be finite, got {duration_ms}"
            )));
        }

        let frame_length = buffer.frame_length();
        let count = segment_count(
            self.config.segmentation.count,
            frame_length,
            buffer.sample_rate(),
        )?;
        let segments = self.segmenter.split(frame_length, count)?;

        // Anything already delivered belongs to the previous call
        self.pump();
        if !self.call.is_complete() {
            tracing::debug!(
                generation = self.call.generation,
                outstanding = self.call.submitted - self.call.next_expected,
                "starting a new call before the previous one completed"
            );
        }

        self.generation += 1;
        let loudness: Vec<f64> = segments
            .iter()
            .map(|segment| self.meter.measure(segment.samples(buffer)))
            .collect();
        self.call = CallState {
            generation: self.generation,
            detect_duration_ms: duration_ms,
            segment_count: count,
            time_slice_ms: buffer.duration_ms() / count as f64,
            loudness,
            resolved: vec![false; count],
            submitted: count,
            next_expected: 0,
        };
        self.last_block_time_ms = Some(at_time_ms);

        tracing::debug!(
            generation = self.generation,
            frames = frame_length,
            segments = count,
            time_slice_ms = self.call.time_slice_ms,
            "segmented buffer"
        );

        for segment in &segments {
            let submission = SegmentSubmission {
                token: SegmentToken::new(self.generation, segment.index),
                samples: segment.samples(buffer).to_vec(),
                sample_rate: buffer.sample_rate(),
            };
            if let Err(e) = self.estimator.submit(submission, &self.responder) {
                tracing::warn!(
                    generation = self.generation,
                    index = segment.index,
                    "estimator refused segment, closing call: {}",
                    e
                );
                self.call.abandon_from(segment.index);
                self.pump();
                return Err(e);
            }
        }

        // Inline estimators have already answered
        self.pump();
        Ok(())
    }

    /// Handles a single estimator reply. Returns `true` if it produced a
    /// queued sample.
    pub fn on_reply(&mut self, reply: EstimatorReply) -> bool {
        match self.config.correlation {
            Correlation::Token => self.accept_by_token(reply),
            Correlation::Positional => self.accept_by_position(reply),
        }
    }

    fn accept_by_token(&mut self, reply: EstimatorReply) -> bool {
        let index = reply.token.index();
        let call = &mut self.call;
        if reply.token.generation() != call.generation
            || index >= call.segment_count
            || call.resolved[index]
        {
            tracing::debug!(
                generation = reply.token.generation(),
                index,
                current = call.generation,
                "dropping stale estimator reply"
            );
            return false;
        }
        call.resolved[index] = true;
        call.next_expected += 1;

        match reply.kind {
            ReplyKind::Pitch(estimate) => self.enqueue(index, estimate),
            ReplyKind::NoPitch => false,
            ReplyKind::Error(message) => {
                tracing::warn!(index, %message, "estimator failed on segment");
                false
            }
        }
    }

    /// Legacy arrival-order correlation: no-pitch and error replies do not
    /// advance the index, so every later pitch shifts one segment earlier.
    fn accept_by_position(&mut self, reply: EstimatorReply) -> bool {
        match reply.kind {
            ReplyKind::Pitch(estimate) => {
                if self.call.is_complete() {
                    tracing::debug!(
                        generation = self.call.generation,
                        "dropping over-delivered estimator reply"
                    );
                    return false;
                }
                let index = self.call.next_expected;
                self.call.next_expected += 1;
                self.enqueue(index, estimate)
            }
            ReplyKind::NoPitch => false,
            ReplyKind::Error(message) => {
                tracing::warn!(%message, "estimator failed on segment");
                false
            }
        }
    }

    fn enqueue(&mut self, index: usize, pitch: PitchEstimate) -> bool {
        let sample = PitchSample {
            pitch,
            timestamp_ms: self.call.timestamp(index),
            loudness_db: self.call.loudness[index],
            segment: index,
        };
        self.queue.push(sample)
    }

    /// Processes every reply delivered so far without blocking. Returns how
    /// many were handled.
    pub fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(reply) = self.replies.try_recv() {
            self.on_reply(reply);
            handled += 1;
        }
        handled
    }

    /// Blocks until every segment of the current call has been answered or
    /// `timeout` elapses. Returns whether the call completed.
    ///
    /// Meant for offline hosts and tests; a real-time host should rely on
    /// `pop_next` instead.
    pub fn wait_for_call(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.pump();
            if self.call.is_complete() {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.replies.recv_timeout(remaining) {
                Ok(reply) => {
                    self.on_reply(reply);
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return self.call.is_complete();
                }
            }
        }
    }

    /// Returns the oldest finished sample, if any. Never blocks.
    pub fn pop_next(&mut self) -> Option<PitchSample> {
        self.pump();
        self.queue.pop_next()
    }

    /// Samples waiting to be popped.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Samples lost to a bounded queue's overflow policy.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn segment_count(&self) -> usize {
        self.call.segment_count
    }

    pub fn time_slice_ms(&self) -> f64 {
        self.call.time_slice_ms
    }

    pub fn detect_duration_ms(&self) -> f64 {
        self.call.detect_duration_ms
    }

    /// Replies accounted for in the current call.
    pub fn next_expected_index(&self) -> usize {
        self.call.next_expected
    }

    /// Loudness of each segment of the current call, in submission order.
    pub fn segment_loudness(&self) -> &[f64] {
        &self.call.loudness
    }

    pub fn is_call_complete(&self) -> bool {
        self.call.is_complete()
    }

    /// Number of `detect` calls accepted so far.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn last_block_time_ms(&self) -> Option<f64> {
        self.last_block_time_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{QueueConfig, SegmentCountPolicy};
    use std::sync::{Arc, Mutex};

    /// Accepts submissions and lets the test answer them by hand.
    #[derive(Clone, Default)]
    struct Recorder {
        submitted: Arc<Mutex<Vec<SegmentToken>>>,
        responder: Arc<Mutex<Option<Responder>>>,
    }

    impl PitchEstimator for Recorder {
        fn submit(&mut self, submission: SegmentSubmission, responder: &Responder) -> Result<()> {
            self.submitted.lock().unwrap().push(submission.token);
            *self.responder.lock().unwrap() = Some(responder.clone());
            Ok(())
        }
    }

    impl Recorder {
        fn tokens(&self) -> Vec<SegmentToken> {
            self.submitted.lock().unwrap().clone()
        }

        fn responder(&self) -> Responder {
            self.responder.lock().unwrap().clone().expect("nothing submitted yet")
        }
    }

    fn fixed(count: usize, correlation: Correlation) -> DetectorConfig {
        let mut config = DetectorConfig::default();
        config.segmentation.count = SegmentCountPolicy::Fixed { count };
        config.correlation = correlation;
        config
    }

    fn ramp(len: usize) -> Vec<f32> {
        (0..len).map(|i| i as f32 / len as f32).collect()
    }

    fn a4() -> PitchEstimate {
        PitchEstimate::from_frequency(440.0)
    }

    #[test]
    fn rejects_empty_buffer_without_touching_state() {
        let recorder = Recorder::default();
        let mut session =
            DetectionSession::new(fixed(4, Correlation::Token), recorder.clone()).unwrap();
        let err = session.detect(&AudioBuffer::new(&[], 44100), 0.0, 10.0).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert_eq!(session.generation(), 0);
        assert!(recorder.tokens().is_empty());

        let samples = ramp(64);
        assert!(session.detect(&AudioBuffer::new(&samples, 0), 0.0, 10.0).is_err());
        assert!(session.detect(&AudioBuffer::new(&samples, 8000), 0.0, f64::NAN).is_err());
    }

    #[test]
    fn loudness_is_ready_before_replies() {
        let recorder = Recorder::default();
        let mut session =
            DetectionSession::new(fixed(4, Correlation::Token), recorder.clone()).unwrap();
        let samples = ramp(400);
        session.detect(&AudioBuffer::new(&samples, 8000), 0.0, 50.0).unwrap();

        assert_eq!(session.segment_count(), 4);
        assert_eq!(session.segment_loudness().len(), 4);
        assert_eq!(recorder.tokens().len(), 4);
        // A rising ramp gets louder segment by segment
        let loudness = session.segment_loudness();
        assert!(loudness.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn timestamps_count_back_from_duration() {
        let recorder = Recorder::default();
        let mut session =
            DetectionSession::new(fixed(5, Correlation::Token), recorder.clone()).unwrap();
        let samples = ramp(1000);
        // 1000 frames at 10 kHz = 100 ms, 20 ms per segment
        session.detect(&AudioBuffer::new(&samples, 10_000), 0.0, 100.0).unwrap();
        assert!((session.time_slice_ms() - 20.0).abs() < 1e-9);

        let responder = recorder.responder();
        for token in recorder.tokens() {
            responder.pitch(token, a4());
        }
        let times: Vec<f64> =
            std::iter::from_fn(|| session.pop_next()).map(|s| s.timestamp_ms).collect();
        assert_eq!(times.len(), 5);
        for (time, expected) in times.iter().zip([20.0, 40.0, 60.0, 80.0, 100.0]) {
            assert!((time - expected).abs() < 1e-9, "{time} != {expected}");
        }
        assert!(session.is_call_complete());
    }

    #[test]
    fn token_mode_keeps_attribution_after_no_pitch() {
        let recorder = Recorder::default();
        let mut session =
            DetectionSession::new(fixed(3, Correlation::Token), recorder.clone()).unwrap();
        let samples = ramp(300);
        session.detect(&AudioBuffer::new(&samples, 3000), 0.0, 100.0).unwrap();

        let tokens = recorder.tokens();
        let responder = recorder.responder();
        responder.no_pitch(tokens[0]);
        responder.pitch(tokens[1], a4());
        responder.error(tokens[2], "decoder hiccup");

        let sample = session.pop_next().expect("one sample");
        assert_eq!(sample.segment, 1);
        assert!((sample.timestamp_ms - (100.0 - 100.0 / 3.0)).abs() < 1e-9);
        assert_eq!(sample.loudness_db, session.segment_loudness()[1]);
        assert!(session.pop_next().is_none());
        assert_eq!(session.next_expected_index(), 3);
        assert!(session.is_call_complete());
    }

    #[test]
    fn token_mode_accepts_out_of_order_replies() {
        let recorder = Recorder::default();
        let mut session =
            DetectionSession::new(fixed(3, Correlation::Token), recorder.clone()).unwrap();
        let samples = ramp(300);
        session.detect(&AudioBuffer::new(&samples, 3000), 0.0, 100.0).unwrap();

        let tokens = recorder.tokens();
        let responder = recorder.responder();
        for &i in &[2, 0, 1] {
            responder.pitch(tokens[i], a4());
        }
        let segments: Vec<usize> =
            std::iter::from_fn(|| session.pop_next()).map(|s| s.segment).collect();
        // FIFO by acceptance, each tied to its own segment
        assert_eq!(segments, vec![2, 0, 1]);
    }

    #[test]
    fn token_mode_drops_stale_and_duplicate_replies() {
        let recorder = Recorder::default();
        let mut session =
            DetectionSession::new(fixed(2, Correlation::Token), recorder.clone()).unwrap();
        let samples = ramp(200);
        session.detect(&AudioBuffer::new(&samples, 2000), 0.0, 100.0).unwrap();
        let old_tokens = recorder.tokens();

        session.detect(&AudioBuffer::new(&samples, 2000), 100.0, 100.0).unwrap();
        let responder = recorder.responder();
        responder.pitch(old_tokens[0], a4());
        assert!(session.pop_next().is_none());

        let new_tokens = &recorder.tokens()[2..];
        responder.pitch(new_tokens[0], a4());
        responder.pitch(new_tokens[0], a4());
        assert_eq!(session.pop_next().map(|s| s.segment), Some(0));
        assert!(session.pop_next().is_none());
        assert_eq!(session.next_expected_index(), 1);
    }

    #[test]
    fn positional_mode_skews_after_no_pitch() {
        let recorder = Recorder::default();
        let mut session =
            DetectionSession::new(fixed(3, Correlation::Positional), recorder.clone()).unwrap();
        let samples = ramp(300);
        session.detect(&AudioBuffer::new(&samples, 3000), 0.0, 100.0).unwrap();

        let tokens = recorder.tokens();
        let responder = recorder.responder();
        responder.no_pitch(tokens[0]);
        responder.pitch(tokens[1], a4());

        // Reply for segment 1 is attributed to segment 0
        let sample = session.pop_next().expect("one sample");
        assert_eq!(sample.segment, 0);
        assert!((sample.timestamp_ms - (100.0 - 2.0 * 100.0 / 3.0)).abs() < 1e-9);
        assert_eq!(session.next_expected_index(), 1);
    }

    #[test]
    fn positional_mode_ignores_over_delivery() {
        let recorder = Recorder::default();
        let mut session =
            DetectionSession::new(fixed(2, Correlation::Positional), recorder.clone()).unwrap();
        let samples = ramp(200);
        session.detect(&AudioBuffer::new(&samples, 2000), 0.0, 100.0).unwrap();

        let token = recorder.tokens()[0];
        let responder = recorder.responder();
        for _ in 0..5 {
            responder.pitch(token, a4());
        }
        assert_eq!(session.pump(), 5);
        assert_eq!(session.pending(), 2);
        assert_eq!(session.next_expected_index(), 2);
    }

    #[test]
    fn replies_before_first_detect_are_dropped() {
        let mut session =
            DetectionSession::new(fixed(2, Correlation::Positional), Recorder::default()).unwrap();
        let reply = EstimatorReply {
            token: SegmentToken::new(0, 0),
            kind: ReplyKind::Pitch(a4()),
        };
        assert!(!session.on_reply(reply));
        assert!(session.pop_next().is_none());
    }

    #[test]
    fn bounded_queue_reports_drops() {
        let recorder = Recorder::default();
        let mut config = fixed(4, Correlation::Token);
        config.queue = QueueConfig {
            capacity: Some(2),
            ..QueueConfig::default()
        };
        let mut session = DetectionSession::new(config, recorder.clone()).unwrap();
        let samples = ramp(400);
        session.detect(&AudioBuffer::new(&samples, 4000), 0.0, 100.0).unwrap();

        let responder = recorder.responder();
        for token in recorder.tokens() {
            responder.pitch(token, a4());
        }
        session.pump();
        assert_eq!(session.pending(), 2);
        assert_eq!(session.dropped(), 2);
        assert_eq!(session.pop_next().map(|s| s.segment), Some(2));
    }

    /// Answers the first `accepted` submissions inline, then refuses the rest.
    struct FailAfter {
        accepted: usize,
        seen: usize,
    }

    impl PitchEstimator for FailAfter {
        fn submit(&mut self, submission: SegmentSubmission, responder: &Responder) -> Result<()> {
            if self.seen == self.accepted {
                return Err(Error::Estimator("worker queue closed".into()));
            }
            self.seen += 1;
            responder.pitch(submission.token, a4());
            Ok(())
        }
    }

    fn assert_send<T: Send>() {}

    #[test]
    fn session_is_send() {
        assert_send::<DetectionSession>();
    }

    #[test]
    fn refused_submit_closes_the_call() {
        for correlation in [Correlation::Token, Correlation::Positional] {
            let estimator = FailAfter { accepted: 3, seen: 0 };
            let mut session = DetectionSession::new(fixed(5, correlation), estimator).unwrap();
            let samples = ramp(500);
            let err = session
                .detect(&AudioBuffer::new(&samples, 5000), 0.0, 100.0)
                .unwrap_err();
            assert!(matches!(err, Error::Estimator(_)));

            assert!(session.is_call_complete(), "{correlation:?}");
            assert_eq!(session.pending(), 3);
            assert!(session.wait_for_call(Duration::ZERO));
            let segments: Vec<usize> =
                std::iter::from_fn(|| session.pop_next()).map(|s| s.segment).collect();
            assert_eq!(segments, vec![0, 1, 2]);
        }
    }

    #[test]
    fn refused_segments_ignore_late_replies() {
        let estimator = FailAfter { accepted: 1, seen: 0 };
        let mut session = DetectionSession::new(fixed(3, Correlation::Token), estimator).unwrap();
        let samples = ramp(300);
        assert!(session.detect(&AudioBuffer::new(&samples, 3000), 0.0, 100.0).is_err());
        assert_eq!(session.pending(), 1);

        let reply = EstimatorReply {
            token: SegmentToken::new(session.generation(), 2),
            kind: ReplyKind::Pitch(a4()),
        };
        assert!(!session.on_reply(reply));
        assert_eq!(session.next_expected_index(), 1);
    }

    #[test]
    fn unbounded_capacity_value_is_accepted() {
        let recorder = Recorder::default();
        let mut config = fixed(2, Correlation::Token);
        config.queue = QueueConfig {
            capacity: Some(usize::MAX),
            ..QueueConfig::default()
        };
        let mut session = DetectionSession::new(config, recorder.clone()).unwrap();
        let samples = ramp(200);
        session.detect(&AudioBuffer::new(&samples, 2000), 0.0, 100.0).unwrap();
        let responder = recorder.responder();
        for token in recorder.tokens() {
            responder.pitch(token, a4());
        }
        session.pump();
        assert_eq!(session.pending(), 2);
        assert_eq!(session.dropped(), 0);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = DetectorConfig::default();
        config.segmentation.guard_fraction = 5.0;
        assert!(DetectionSession::new(config, Recorder::default()).is_err());
    }
}
