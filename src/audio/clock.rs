//! Global sample clock
//!
//! One monotonically increasing sample index shared by the emission and
//! detection paths of a session. [`SampleClock`] is the only writer and is
//! not `Clone`; other threads observe it through
//! [`ClockReader`] handles.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Single-writer sample clock
#[derive(Debug, Default)]
pub struct SampleClock {
    ticks: Arc<AtomicU64>,
}

impl SampleClock {
    /// Create a clock at sample 0
    pub fn new() -> Self {
        Self::default()
    }

    /// Current global sample index
    pub fn now(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    /// Advance by `samples`, returning the new index
    pub fn advance(&mut self, samples: u64) -> u64 {
        self.ticks.fetch_add(samples, Ordering::Release) + samples
    }

    /// Restart at sample 0 (session restart only)
    pub fn reset(&mut self) {
        self.ticks.store(0, Ordering::Release);
    }

    /// Read-only handle for other threads
    pub fn reader(&self) -> ClockReader {
        ClockReader {
            ticks: Arc::clone(&self.ticks),
        }
    }
}

/// Read-only view of a [`SampleClock`]
#[derive(Debug, Clone)]
pub struct ClockReader {
    ticks: Arc<AtomicU64>,
}

impl ClockReader {
    /// Current global sample index
    pub fn now(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    /// Convert a sample index to seconds at `sample_rate`
    pub fn seconds(&self, sample_rate: u32) -> f64 {
        self.now() as f64 / sample_rate as f64
    }
}
