//! Progress reporting for chunk transfers

use crate::uploader::error::UploadError;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Receives byte-level progress and retry notices from the chunk transport
pub trait ChunkObserver: Send + Sync {
    /// Cumulative bytes read into the request body for this attempt.
    /// Starts again from zero on every attempt.
    fn on_progress(&self, chunk_index: u32, loaded: u64);

    /// Called before attempt `attempt` of `max_attempts` is made
    fn on_retry(&self, _chunk_index: u32, _attempt: u32, _max_attempts: u32, _error: &UploadError) {}
}

/// No-op observer
pub struct NoOpObserver;

impl ChunkObserver for NoOpObserver {
    fn on_progress(&self, _chunk_index: u32, _loaded: u64) {}
}

/// Closure-based progress observer
pub struct FnObserver<F>(pub F);

impl<F> ChunkObserver for FnObserver<F>
where
    F: Fn(u32, u64) + Send + Sync,
{
    fn on_progress(&self, chunk_index: u32, loaded: u64) {
        (self.0)(chunk_index, loaded)
    }
}

struct SpeedSample {
    bytes: u64,
    timestamp: Instant,
}

/// Transfer speed over a sliding window of samples
pub struct SpeedCalculator {
    samples: VecDeque<SpeedSample>,
    max_samples: usize,
    window_size: Duration,
}

impl SpeedCalculator {
    pub fn new(window_size: Duration, max_samples: usize) -> Self {
        Self {
            samples: VecDeque::new(),
            max_samples: max_samples.max(2),
            window_size,
        }
    }

    /// Record `bytes` transferred just now
    pub fn add_sample(&mut self, bytes: u64) {
        let now = Instant::now();
        self.samples.push_back(SpeedSample {
            bytes,
            timestamp: now,
        });

        while let Some(oldest) = self.samples.front() {
            if now.duration_since(oldest.timestamp) > self.window_size
                || self.samples.len() > self.max_samples
            {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Average speed in the window; 0 with fewer than two samples
    pub fn bytes_per_second(&self) -> f64 {
        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return 0.0;
        };
        if self.samples.len() < 2 {
            return 0.0;
        }

        let elapsed = last.timestamp.duration_since(first.timestamp);
        if elapsed.is_zero() {
            return 0.0;
        }

        // The first sample's bytes arrived before the measured interval
        let total: u64 = self.samples.iter().skip(1).map(|sample| sample.bytes).sum();
        total as f64 / elapsed.as_secs_f64()
    }

    /// Estimated time to transfer `remaining` bytes at the current speed
    pub fn eta(&self, remaining: u64) -> Option<Duration> {
        let speed = self.bytes_per_second();
        if speed <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining as f64 / speed))
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }
}

impl Default for SpeedCalculator {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), 100)
    }
}
