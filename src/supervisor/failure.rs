use std::{collections::VecDeque, time::Duration};
use tokio::time::Instant;

/// Sliding window of recent child failures.
#[derive(Debug, Clone)]
pub struct FailureTracker {
    decay: Duration,
    threshold: u32,
    failures: VecDeque<Instant>,
}

impl FailureTracker {
    pub fn new(decay: Duration, threshold: u32) -> Self {
        Self {
            decay,
            threshold,
            failures: VecDeque::new(),
        }
    }

    /// Records one failure at `now`, returns true once more than `threshold`
    /// failures fall inside the decay window.
    pub fn record(&mut self, now: Instant) -> bool {
        self.failures.push_back(now);
        while let Some(first) = self.failures.front() {
            if now.duration_since(*first) > self.decay {
                self.failures.pop_front();
            } else {
                break;
            }
        }
        self.failures.len() > self.threshold as usize
    }

    pub fn count(&self) -> usize {
        self.failures.len()
    }

    pub fn reset(&mut self) {
        self.failures.clear();
    }
}
