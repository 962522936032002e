//! Latency history and per-tone running statistics
//!
//! Keeps a bounded, timestamped history of latency measurements plus
//! all-time min/max/average and detection counters for every tone.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;

use crate::audio::detector::DetectionEvent;
use crate::audio::scheduler::LatencyResult;

/// Maximum number of measurements kept in history
const MAX_HISTORY_SIZE: usize = 3600;

/// Frequencies closer than this share one entry
const FREQUENCY_TOLERANCE_HZ: f64 = 1e-6;

/// One timestamped latency measurement
#[derive(Debug, Clone, Serialize)]
pub struct LatencyRecord {
    pub timestamp: DateTime<Utc>,
    pub frequency: f64,
    pub latency_samples: i64,
    pub latency_ms: f64,
}

/// Running statistics for one tone
#[derive(Debug, Clone, Serialize)]
pub struct ToneStats {
    pub frequency: f64,
    /// Most recent latency (ms)
    pub current_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub avg_ms: f64,
    /// Latency measurements recorded
    pub measurements: u64,
    /// Detections recorded, timed or not
    pub detections: u64,
    /// Chirps that were never heard
    pub missed: u64,
    #[serde(skip)]
    sum_ms: f64,
}

impl ToneStats {
    fn new(frequency: f64) -> Self {
        Self {
            frequency,
            current_ms: 0.0,
            min_ms: f64::MAX,
            max_ms: f64::MIN,
            avg_ms: 0.0,
            measurements: 0,
            detections: 0,
            missed: 0,
            sum_ms: 0.0,
        }
    }

    fn add(&mut self, latency_ms: f64) {
        self.current_ms = latency_ms;
        self.min_ms = self.min_ms.min(latency_ms);
        self.max_ms = self.max_ms.max(latency_ms);
        self.measurements += 1;
        self.sum_ms += latency_ms;
        self.avg_ms = self.sum_ms / self.measurements as f64;
    }

    /// Missed chirps as a fraction of all chirps that got an outcome
    pub fn miss_rate(&self) -> f64 {
        let total = self.measurements + self.missed;
        if total == 0 {
            0.0
        } else {
            self.missed as f64 / total as f64
        }
    }
}

/// Statistics store for latency measurements
#[derive(Debug)]
pub struct StatsStore {
    history: VecDeque<LatencyRecord>,
    max_size: usize,
    tones: Vec<ToneStats>,
}

impl StatsStore {
    pub fn new() -> Self {
        Self::with_capacity(MAX_HISTORY_SIZE)
    }

    /// Store keeping at most `max_size` measurements in history
    pub fn with_capacity(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            history: VecDeque::with_capacity(max_size),
            max_size,
            tones: Vec::new(),
        }
    }

    fn tone_mut(&mut self, frequency: f64) -> &mut ToneStats {
        let index = match self
            .tones
            .iter()
            .position(|t| (t.frequency - frequency).abs() < FREQUENCY_TOLERANCE_HZ)
        {
            Some(index) => index,
            None => {
                self.tones.push(ToneStats::new(frequency));
                self.tones.len() - 1
            }
        };
        &mut self.tones[index]
    }

    /// Record a latency measurement
    pub fn record_latency(&mut self, result: &LatencyResult) {
        if self.history.len() >= self.max_size {
            self.history.pop_front();
        }
        self.history.push_back(LatencyRecord {
            timestamp: Utc::now(),
            frequency: result.frequency,
            latency_samples: result.latency_samples,
            latency_ms: result.latency_ms,
        });
        self.tone_mut(result.frequency).add(result.latency_ms);
    }

    /// Count a detection
    pub fn record_detection(&mut self, event: &DetectionEvent) {
        self.tone_mut(event.frequency).detections += 1;
    }

    /// Count a chirp that was never heard
    pub fn record_missed(&mut self, frequency: f64) {
        self.tone_mut(frequency).missed += 1;
    }

    /// Per-tone statistics, in the order tones were first seen
    pub fn stats(&self) -> &[ToneStats] {
        &self.tones
    }

    /// Statistics for one tone
    pub fn tone(&self, frequency: f64) -> Option<&ToneStats> {
        self.tones
            .iter()
            .find(|t| (t.frequency - frequency).abs() < FREQUENCY_TOLERANCE_HZ)
    }

    pub fn history(&self) -> &VecDeque<LatencyRecord> {
        &self.history
    }

    /// Latency values for plotting (last `count` points)
    ///
    /// Returns (seconds before now, latency_ms) pairs, newest first.
    pub fn latency_plot_data(&self, count: usize) -> Vec<(f64, f64)> {
        let now = Utc::now();
        self.history
            .iter()
            .rev()
            .take(count)
            .map(|m| {
                let time_offset = (now - m.timestamp).num_milliseconds() as f64 / 1000.0;
                (-time_offset, m.latency_ms)
            })
            .collect()
    }

    /// Clear all history and reset statistics
    pub fn clear(&mut self) {
        self.history.clear();
        self.tones.clear();
    }
}

impl Default for StatsStore {
    fn default() -> Self {
        Self::new()
    }
}
