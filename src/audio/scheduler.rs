//! Chirp scheduling and echo timing
//!
//! A [`ChirpScheduler`] emits a short tone burst at a chosen global sample
//! index and, when its detector later reports the burst, turns the
//! detection mark into a round-trip latency. In the self-measurement loop it
//! then schedules the next chirp a fixed lead time after the detection.
//!
//! ```text
//! latency_samples = detection_mark - scheduled_start
//! latency_ms      = latency_samples / sample_rate * 1000
//! ```
//!
//! There is at most one outstanding chirp. Scheduling again overwrites it.
//! A chirp that is never heard stays outstanding until the next overwrite;
//! there is no timeout or retry.

use super::detector::DetectionEvent;
use super::reference::ReferenceWaveform;

/// Default chirp amplitude (-6dB for headroom)
pub const CHIRP_AMPLITUDE: f32 = 0.5;

/// Frequencies closer than this are treated as the same tone
const FREQUENCY_TOLERANCE_HZ: f64 = 1e-6;

/// The single outstanding chirp of a scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChirpSchedule {
    /// Global sample index of the first emitted sample
    pub start: u64,
    /// Set once a detection has been timed against this chirp
    pub answered: bool,
}

/// Round-trip latency derived from one detection
#[derive(Debug, Clone, PartialEq)]
pub struct LatencyResult {
    /// Tone frequency in Hz
    pub frequency: f64,
    /// Scheduled emission start
    pub scheduled_at: u64,
    /// Detection mark the latency was measured to
    pub mark: i64,
    /// Latency in samples (can be negative for a bad threshold setup)
    pub latency_samples: i64,
    /// Latency in milliseconds
    pub latency_ms: f64,
}

/// Outgoing chirp synthesis and echo timer for one frequency
///
/// # Example
/// ```
/// use tonetimer::audio::reference::{ReferenceWaveform, WaveformKind};
/// use tonetimer::audio::scheduler::ChirpScheduler;
///
/// let chirp = ReferenceWaveform::generate(48000, 1000.0, 10.0, WaveformKind::Sine).unwrap();
/// let mut scheduler = ChirpScheduler::new(chirp, 4800);
///
/// scheduler.schedule_chirp(0, 100);
/// assert_eq!(scheduler.next_sample(99), 0.0);
/// assert_eq!(scheduler.next_sample(100), 0.0); // sin(0)
/// assert!(scheduler.next_sample(103) > 0.0);
/// ```
#[derive(Debug)]
pub struct ChirpScheduler {
    waveform: ReferenceWaveform,
    amplitude: f32,
    lead_samples: u64,
    rearm: bool,
    outstanding: Option<ChirpSchedule>,
    measurements: u64,
}

impl ChirpScheduler {
    /// Scheduler running the self-measurement loop with `lead_samples` between
    /// a detection and the next chirp
    pub fn new(waveform: ReferenceWaveform, lead_samples: u64) -> Self {
        Self {
            waveform,
            amplitude: CHIRP_AMPLITUDE,
            lead_samples,
            rearm: true,
            outstanding: None,
            measurements: 0,
        }
    }

    /// Scheduler that only emits on request and never re-arms itself
    pub fn manual(waveform: ReferenceWaveform) -> Self {
        Self {
            rearm: false,
            ..Self::new(waveform, 0)
        }
    }

    /// Set output amplitude (clamped to 0.0..=1.0)
    pub fn with_amplitude(mut self, amplitude: f32) -> Self {
        self.set_amplitude(amplitude);
        self
    }

    pub fn set_amplitude(&mut self, amplitude: f32) {
        self.amplitude = amplitude.clamp(0.0, 1.0);
    }

    /// Schedule a chirp to start at `now + delay_samples`, replacing any
    /// outstanding one
    pub fn schedule_chirp(&mut self, now: u64, delay_samples: u64) -> ChirpSchedule {
        let schedule = ChirpSchedule {
            start: now.saturating_add(delay_samples),
            answered: false,
        };
        self.outstanding = Some(schedule);
        schedule
    }

    /// Output sample for global index `t`
    #[inline]
    pub fn next_sample(&self, t: u64) -> f32 {
        match self.outstanding {
            Some(schedule) if t >= schedule.start => {
                let offset = t - schedule.start;
                if offset < self.waveform.len() as u64 {
                    self.waveform.get(offset as usize) * self.amplitude
                } else {
                    0.0
                }
            }
            _ => 0.0,
        }
    }

    /// Fill `out` with the samples for `start_t..start_t + out.len()`
    pub fn fill_block(&self, start_t: u64, out: &mut [f32]) {
        for (i, sample) in out.iter_mut().enumerate() {
            *sample = self.next_sample(start_t + i as u64);
        }
    }

    /// True while the outstanding chirp is being emitted at `t`
    pub fn is_emitting(&self, t: u64) -> bool {
        self.outstanding.is_some_and(|s| {
            t >= s.start && t - s.start < self.waveform.len() as u64
        })
    }

    /// Time a detection against the outstanding chirp
    ///
    /// Only detections of this scheduler's frequency that fire after the
    /// chirp has started are timed, and each chirp is timed once. On success
    /// the event's `latency` is filled in and, in loop mode, the next chirp
    /// is scheduled at `now + lead`.
    pub fn on_detection(&mut self, event: &mut DetectionEvent, now: u64) -> Option<LatencyResult> {
        if (event.frequency - self.waveform.frequency()).abs() > FREQUENCY_TOLERANCE_HZ {
            return None;
        }
        let schedule = self.outstanding.as_mut()?;
        if schedule.answered || event.detected_at < schedule.start {
            return None;
        }
        schedule.answered = true;

        let latency_samples = event.mark - schedule.start as i64;
        let result = LatencyResult {
            frequency: self.waveform.frequency(),
            scheduled_at: schedule.start,
            mark: event.mark,
            latency_samples,
            latency_ms: latency_samples as f64 / self.waveform.sample_rate() as f64 * 1000.0,
        };
        event.latency = Some(latency_samples);
        self.measurements += 1;

        if self.rearm {
            self.schedule_chirp(now, self.lead_samples);
        }
        Some(result)
    }

    /// The outstanding chirp, answered or not
    pub fn outstanding(&self) -> Option<ChirpSchedule> {
        self.outstanding
    }

    /// True if the outstanding chirp has been fully emitted without an answer
    pub fn is_waiting(&self, t: u64) -> bool {
        self.outstanding
            .is_some_and(|s| !s.answered && t >= s.start + self.waveform.len() as u64)
    }

    /// Number of latency measurements made
    pub fn measurements(&self) -> u64 {
        self.measurements
    }

    pub fn waveform(&self) -> &ReferenceWaveform {
        &self.waveform
    }

    pub fn frequency(&self) -> f64 {
        self.waveform.frequency()
    }

    pub fn lead_samples(&self) -> u64 {
        self.lead_samples
    }

    pub fn amplitude(&self) -> f32 {
        self.amplitude
    }

    /// True when detections re-arm the next chirp
    pub fn is_looping(&self) -> bool {
        self.rearm
    }

    /// Drop the outstanding chirp and counters (session restart)
    pub fn reset(&mut self) {
        self.outstanding = None;
        self.measurements = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::reference::WaveformKind;
    use approx::assert_abs_diff_eq;

    const FREQ: f64 = 44100.0 / 2.3;

    fn scheduler() -> ChirpScheduler {
        let chirp = ReferenceWaveform::generate(44100, FREQ, 100.0, WaveformKind::Sine).unwrap();
        ChirpScheduler::new(chirp, 4410).with_amplitude(1.0)
    }

    fn detection(mark: i64, detected_at: u64) -> DetectionEvent {
        DetectionEvent {
            frequency: FREQ,
            center: mark + 230,
            mark,
            run_length: 25,
            peak_magnitude: 0.5,
            detected_at,
            latency: None,
        }
    }

    #[test]
    fn test_silent_without_schedule() {
        let scheduler = scheduler();
        let mut out = vec![1.0f32; 1024];
        scheduler.fill_block(0, &mut out);
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_emits_waveform_at_schedule() {
        let mut scheduler = scheduler();
        scheduler.schedule_chirp(1000, 500);
        let len = scheduler.waveform().len() as u64;

        assert_eq!(scheduler.next_sample(1499), 0.0);
        for t in 1500..1500 + len {
            let expected = scheduler.waveform().get((t - 1500) as usize);
            assert_eq!(scheduler.next_sample(t), expected);
        }
        assert_eq!(scheduler.next_sample(1500 + len), 0.0);
        assert!(scheduler.is_emitting(1500));
        assert!(!scheduler.is_emitting(1500 + len));
    }

    #[test]
    fn test_fill_block_spans_boundary() {
        let mut scheduler = scheduler();
        scheduler.schedule_chirp(0, 1000);
        let mut first = vec![0.0f32; 1024];
        let mut second = vec![0.0f32; 1024];
        scheduler.fill_block(0, &mut first);
        scheduler.fill_block(1024, &mut second);

        let emitted: Vec<f32> = first[1000..].iter().chain(&second[..206]).copied().collect();
        assert_eq!(emitted.as_slice(), scheduler.waveform().samples());
        assert!(second[206..].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_amplitude_scales_output() {
        let chirp = ReferenceWaveform::generate(48000, 1000.0, 1.0, WaveformKind::Cosine).unwrap();
        let mut scheduler = ChirpScheduler::new(chirp, 0).with_amplitude(0.25);
        scheduler.schedule_chirp(0, 0);
        assert_abs_diff_eq!(scheduler.next_sample(0), 0.25);

        scheduler.set_amplitude(3.0);
        assert_eq!(scheduler.amplitude(), 1.0);
    }

    #[test]
    fn test_overwrite_replaces_schedule() {
        let mut scheduler = scheduler();
        scheduler.schedule_chirp(0, 100);
        scheduler.schedule_chirp(0, 5000);
        assert_eq!(scheduler.outstanding().map(|s| s.start), Some(5000));
        // Old slot is silent
        assert_eq!(scheduler.next_sample(103), 0.0);
    }

    #[test]
    fn test_zero_latency_loopback() {
        let mut scheduler = scheduler();
        scheduler.schedule_chirp(0, 2000);
        let mut event = detection(2000, 2700);

        let result = scheduler.on_detection(&mut event, 2700).unwrap();
        assert_eq!(result.latency_samples, 0);
        assert_eq!(result.latency_ms, 0.0);
        assert_eq!(event.latency, Some(0));
    }

    #[test]
    fn test_latency_in_ms() {
        let mut scheduler = scheduler();
        scheduler.schedule_chirp(0, 2000);
        // 441 samples = 10ms at 44.1kHz
        let mut event = detection(2441, 3200);
        let result = scheduler.on_detection(&mut event, 3200).unwrap();
        assert_eq!(result.latency_samples, 441);
        assert_abs_diff_eq!(result.latency_ms, 10.0, epsilon = 1e-9);
        assert_eq!(result.scheduled_at, 2000);
        assert_eq!(result.mark, 2441);
    }

    #[test]
    fn test_detection_rearms_next_chirp() {
        let mut scheduler = scheduler();
        scheduler.schedule_chirp(0, 2000);
        let mut event = detection(2100, 2800);
        scheduler.on_detection(&mut event, 2800).unwrap();

        let next = scheduler.outstanding().unwrap();
        assert_eq!(next.start, 2800 + 4410);
        assert!(!next.answered);
        assert_eq!(scheduler.measurements(), 1);
    }

    #[test]
    fn test_other_frequency_ignored() {
        let mut scheduler = scheduler();
        scheduler.schedule_chirp(0, 2000);
        let mut event = DetectionEvent {
            frequency: 44100.0 / 2.2,
            ..detection(2000, 2700)
        };
        assert!(scheduler.on_detection(&mut event, 2700).is_none());
        assert!(event.latency.is_none());
        assert_eq!(scheduler.outstanding().map(|s| s.start), Some(2000));
    }

    #[test]
    fn test_detection_before_emission_ignored() {
        let mut scheduler = scheduler();
        scheduler.schedule_chirp(0, 5000);
        let mut event = detection(1000, 1500);
        assert!(scheduler.on_detection(&mut event, 1500).is_none());
        assert_eq!(scheduler.outstanding().map(|s| s.start), Some(5000));
    }

    #[test]
    fn test_no_schedule_no_latency() {
        let mut scheduler = scheduler();
        let mut event = detection(1000, 1500);
        assert!(scheduler.on_detection(&mut event, 1500).is_none());
    }

    #[test]
    fn test_manual_chirp_answered_once() {
        let chirp = ReferenceWaveform::generate(44100, FREQ, 100.0, WaveformKind::Sine).unwrap();
        let mut scheduler = ChirpScheduler::manual(chirp);
        assert!(!scheduler.is_looping());
        scheduler.schedule_chirp(100, 0);

        let mut first = detection(150, 700);
        assert!(scheduler.on_detection(&mut first, 700).is_some());
        let mut second = detection(3000, 3500);
        assert!(scheduler.on_detection(&mut second, 3500).is_none());
        assert_eq!(scheduler.outstanding().map(|s| s.start), Some(100));
    }

    #[test]
    fn test_unanswered_chirp_stays_stale() {
        let mut scheduler = scheduler();
        scheduler.schedule_chirp(0, 100);
        let len = scheduler.waveform().len() as u64;
        assert!(!scheduler.is_waiting(100));
        assert!(scheduler.is_waiting(100 + len));
        // Nothing times it out
        assert!(scheduler.is_waiting(10_000_000));
        assert_eq!(scheduler.outstanding().map(|s| s.start), Some(100));
    }

    #[test]
    fn test_reset() {
        let mut scheduler = scheduler();
        scheduler.schedule_chirp(0, 100);
        scheduler.reset();
        assert!(scheduler.outstanding().is_none());
        assert_eq!(scheduler.measurements(), 0);
    }
}
