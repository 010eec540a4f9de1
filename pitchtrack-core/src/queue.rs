//! FIFO of finished pitch samples, drained by the host.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::config::{OverflowPolicy, QueueConfig};
use crate::estimator::PitchEstimate;

/// One reconstructed result: the estimator's output placed in time and
/// paired with the loudness of the segment it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PitchSample {
    pub pitch: PitchEstimate,
    /// Milliseconds, on the same base as the `duration` passed to `detect`.
    pub timestamp_ms: f64,
    pub loudness_db: f64,
    /// Segment the sample was attributed to.
    pub segment: usize,
}

/// Upper limit on the up-front allocation, whatever the configured capacity.
const INITIAL_RESERVE: usize = 1024;

#[derive(Debug, Default)]
pub struct ResultQueue {
    samples: VecDeque<PitchSample>,
    capacity: Option<usize>,
    overflow: OverflowPolicy,
    dropped: u64,
}

impl ResultQueue {
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            // The bound is enforced on push, not reserved up front
            samples: VecDeque::with_capacity(
                config.capacity.map_or(16, |capacity| capacity.min(INITIAL_RESERVE)),
            ),
            capacity: config.capacity,
            overflow: config.overflow,
            dropped: 0,
        }
    }

    /// Appends a sample. Returns `false` if the sample was rejected.
    pub(crate) fn push(&mut self, sample: PitchSample) -> bool {
        let full = self.capacity.filter(|&capacity| self.samples.len() >= capacity);
        if let Some(capacity) = full {
            self.dropped += 1;
            match self.overflow {
                OverflowPolicy::RejectNewest => {
                    tracing::debug!(capacity, "result queue full, rejecting sample");
                    return false;
                }
                OverflowPolicy::DropOldest => {
                    tracing::debug!(capacity, "result queue full, dropping oldest sample");
                    self.samples.pop_front();
                }
            }
        }
        self.samples.push_back(sample);
        true
    }

    /// Removes and returns the oldest sample, if any.
    pub fn pop_next(&mut self) -> Option<PitchSample> {
        self.samples.pop_front()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Samples lost to overflow since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
