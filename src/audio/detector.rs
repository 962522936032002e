//! Threshold, hysteresis and debounce detection over a magnitude stream
//!
//! The detector looks for runs of consecutive samples whose magnitude is
//! strictly above a threshold. A run that reaches the required length fires
//! one detection when it ends; shorter runs are dropped. After a detection,
//! input is ignored for a debounce window so the detector cannot re-trigger
//! on its own tail or on feedback.
//!
//! A detection reports the center of the run and a mark that is shifted back
//! by the length of the emitted reference tone, so that it lines up with the
//! start of the burst and can be compared directly to a scheduled emission.

use crate::config::{ConfigError, ToneConfig};

use super::reference::reference_length;

/// Fixed detection settings for one tracked frequency
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorConfig {
    /// Target frequency in Hz (reported in events)
    pub frequency: f64,
    /// Length in samples of the emitted reference tone
    pub reference_len: usize,
    /// Magnitude that must be exceeded (equal is "below")
    pub threshold: f32,
    /// Required run length `C`
    pub consecutive: u32,
    /// Samples after a detection mark during which input is ignored
    pub debounce_samples: u64,
}

impl DetectorConfig {
    /// Build and validate detector settings
    pub fn new(
        frequency: f64,
        reference_len: usize,
        threshold: f32,
        consecutive: u32,
        debounce_samples: u64,
    ) -> Result<Self, ConfigError> {
        if !frequency.is_finite() || frequency <= 0.0 {
            return Err(ConfigError::InvalidFrequency(frequency));
        }
        if !threshold.is_finite() || threshold < 0.0 {
            return Err(ConfigError::InvalidThreshold(threshold));
        }
        if consecutive == 0 {
            return Err(ConfigError::InvalidConsecutive);
        }
        Ok(Self {
            frequency,
            reference_len,
            threshold,
            consecutive,
            debounce_samples,
        })
    }

    /// Detector settings for a configured tone
    pub fn from_tone(tone: &ToneConfig, sample_rate: u32) -> Result<Self, ConfigError> {
        tone.validate(sample_rate)?;
        Self::new(
            tone.frequency,
            reference_length(sample_rate, tone.frequency, tone.emit_periods),
            tone.threshold,
            tone.consecutive,
            tone.debounce_samples,
        )
    }
}

/// A detected tone burst
///
/// Produced by the detector and handed straight to the consumer; nothing
/// keeps it afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionEvent {
    /// Target frequency of the detector that fired
    pub frequency: f64,
    /// Global sample index of the run center
    pub center: i64,
    /// Center shifted back by the reference length (burst start estimate)
    pub mark: i64,
    /// Length of the above-threshold run
    pub run_length: u32,
    /// Largest magnitude seen during the run
    pub peak_magnitude: f32,
    /// Global sample index at which the run ended and the event fired
    pub detected_at: u64,
    /// `mark - scheduled start` when a chirp was outstanding
    pub latency: Option<i64>,
}

/// Coarse detector state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorState {
    /// Not accumulating
    Below,
    /// Inside a run shorter than the required length
    Accumulating,
    /// Inside a run long enough to fire when it ends
    Armed,
}

/// Per-frequency detection state machine
///
/// # Example
/// ```
/// use tonetimer::audio::detector::{DetectorConfig, ToneDetector};
///
/// let config = DetectorConfig::new(1000.0, 480, 0.1, 3, 100).unwrap();
/// let mut detector = ToneDetector::new(config);
///
/// assert!(detector.process(0.5, 0).is_none());
/// assert!(detector.process(0.5, 1).is_none());
/// assert!(detector.process(0.5, 2).is_none());
/// // The run ends here and is long enough
/// let event = detector.process(0.0, 3).unwrap();
/// assert_eq!(event.center, 1);
/// ```
#[derive(Debug)]
pub struct ToneDetector {
    config: DetectorConfig,
    /// Current run length `c`
    run_length: u32,
    /// Peak magnitude of the current run
    run_peak: f32,
    /// Mark of the last detection
    last_detection: Option<i64>,
    /// Detections fired since creation or reset
    detections: u64,
    /// Largest magnitude in the current block
    block_peak: f32,
}

impl ToneDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            run_length: 0,
            run_peak: 0.0,
            last_detection: None,
            detections: 0,
            block_peak: 0.0,
        }
    }

    /// Process one magnitude sample at global index `t`
    ///
    /// Samples must arrive in order, once each. Returns the detection when a
    /// qualifying run ends at this sample.
    pub fn process(&mut self, magnitude: f32, t: u64) -> Option<DetectionEvent> {
        if magnitude > self.block_peak {
            self.block_peak = magnitude;
        }

        let above = !self.is_debouncing(t) && magnitude > self.config.threshold;
        if above {
            self.run_length = self.run_length.saturating_add(1);
            if magnitude > self.run_peak {
                self.run_peak = magnitude;
            }
            return None;
        }

        let run = std::mem::take(&mut self.run_length);
        let peak = std::mem::take(&mut self.run_peak);
        if run < self.config.consecutive {
            return None;
        }
        Some(self.fire(run, peak, t))
    }

    fn fire(&mut self, run: u32, peak: f32, t: u64) -> DetectionEvent {
        let center = t as i64 - 1 - (run / 2) as i64;
        let mark = center - self.config.reference_len as i64;
        self.last_detection = Some(mark);
        self.detections += 1;

        DetectionEvent {
            frequency: self.config.frequency,
            center,
            mark,
            run_length: run,
            peak_magnitude: peak,
            detected_at: t,
            latency: None,
        }
    }

    /// Process a block of magnitudes starting at global index `start_t`
    ///
    /// `on_detection` runs inline for every event and must not block.
    pub fn process_block<F>(&mut self, magnitudes: &[f32], start_t: u64, mut on_detection: F)
    where
        F: FnMut(DetectionEvent),
    {
        self.begin_block();
        for (i, &magnitude) in magnitudes.iter().enumerate() {
            if let Some(event) = self.process(magnitude, start_t + i as u64) {
                on_detection(event);
            }
        }
    }

    /// Process a block and collect its detections
    pub fn process_buffer(&mut self, magnitudes: &[f32], start_t: u64) -> Vec<DetectionEvent> {
        let mut events = Vec::new();
        self.process_block(magnitudes, start_t, |event| events.push(event));
        events
    }

    /// Start a new block for the peak diagnostic
    pub fn begin_block(&mut self) {
        self.block_peak = 0.0;
    }

    /// True while `t` is inside the debounce window of the last detection
    pub fn is_debouncing(&self, t: u64) -> bool {
        match self.last_detection {
            Some(mark) => (t as i64) <= mark.saturating_add(self.config.debounce_samples as i64),
            None => false,
        }
    }

    pub fn state(&self) -> DetectorState {
        match self.run_length {
            0 => DetectorState::Below,
            c if c < self.config.consecutive => DetectorState::Accumulating,
            _ => DetectorState::Armed,
        }
    }

    /// Current run length
    pub fn run_length(&self) -> u32 {
        self.run_length
    }

    /// Mark of the most recent detection
    pub fn last_detection(&self) -> Option<i64> {
        self.last_detection
    }

    /// Number of detections fired
    pub fn detections(&self) -> u64 {
        self.detections
    }

    /// Largest magnitude seen in the current (or last) block
    pub fn block_peak(&self) -> f32 {
        self.block_peak
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn frequency(&self) -> f64 {
        self.config.frequency
    }

    /// Reset all state (session restart)
    pub fn reset(&mut self) {
        self.run_length = 0;
        self.run_peak = 0.0;
        self.last_detection = None;
        self.detections = 0;
        self.block_peak = 0.0;
    }
}
