//! One audio session: block-by-block processing on a shared sample clock
//!
//! Each call to [`Session::process_block`] consumes one input block and
//! produces one output block of the same length. For every sample, in
//! order, each tracked tone turns its magnitude into detector state, times
//! any detection against its outstanding chirp, and contributes its chirp
//! output to the mix. The clock then advances by one, so emission and
//! detection stay on the same time base.
//!
//! Detections and latency measurements leave the processing call through a
//! bounded channel with `try_send`; a full queue drops the event rather than
//! blocking the audio thread.

use crossbeam_channel::{Receiver, Sender, TrySendError};
use thiserror::Error;

use super::clock::{ClockReader, SampleClock};
use super::correlator::{combine_block, CorrelatorError, QuadratureCorrelator};
use super::detector::{DetectionEvent, DetectorConfig, ToneDetector};
use super::reference::{ReferenceWaveform, WaveformKind};
use super::scheduler::{ChirpSchedule, ChirpScheduler, LatencyResult};
use crate::config::{ConfigError, SessionConfig};

/// Errors from session construction and block processing
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Block size mismatch: {input} input samples, {output} output samples")]
    BlockSizeMismatch { input: usize, output: usize },

    #[error("Expected correlated channels for {expected} tones, got {actual}")]
    ChannelCountMismatch { expected: usize, actual: usize },

    #[error(transparent)]
    Correlator(#[from] CorrelatorError),

    #[error("No tone at index {0}")]
    UnknownTone(usize),
}

/// Pre-filtered channels for one tone
#[derive(Debug, Clone, Copy)]
pub struct ToneChannels<'a> {
    /// Sine-correlated channel `I`
    pub sine: &'a [f32],
    /// Cosine-correlated channel `Q`; `None` for sine-only input
    pub cosine: Option<&'a [f32]>,
}

/// One block of input from the frame pump
#[derive(Debug, Clone, Copy)]
pub enum InputBlock<'a> {
    /// Raw capture samples, filtered by the built-in matched filters
    Raw(&'a [f32]),
    /// Channels already correlated by an external filter graph, one entry
    /// per tracked tone in configuration order
    Correlated(&'a [ToneChannels<'a>]),
}

impl InputBlock<'_> {
    fn len(&self) -> usize {
        match self {
            InputBlock::Raw(samples) => samples.len(),
            InputBlock::Correlated(channels) => channels.first().map_or(0, |c| c.sine.len()),
        }
    }
}

/// Event leaving the processing call
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A detector fired
    Detected(DetectionEvent),
    /// A detection was timed against a chirp
    Measured(LatencyResult),
}

/// Summary of one processed block
#[derive(Debug, Clone, Default)]
pub struct BlockReport {
    /// Global index of the first sample in the block
    pub start_t: u64,
    /// Samples processed
    pub len: usize,
    /// Detections fired in this block
    pub detections: usize,
    /// Latency measurements made in this block
    pub measurements: usize,
    /// Peak magnitude per tone
    pub peaks: Vec<f32>,
}

/// Receiving side of the session event queue
#[derive(Debug, Clone)]
pub struct EventReceiver {
    rx: Receiver<SessionEvent>,
}

impl EventReceiver {
    /// Next queued event, if any
    pub fn try_recv(&self) -> Option<SessionEvent> {
        self.rx.try_recv().ok()
    }

    /// Wait up to `timeout` for the next event
    pub fn recv_timeout(&self, timeout: std::time::Duration) -> Option<SessionEvent> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Take everything currently queued
    pub fn drain(&self) -> Vec<SessionEvent> {
        let events: Vec<SessionEvent> = self.rx.try_iter().collect();
        if !events.is_empty() {
            tracing::trace!(count = events.len(), "events_drained");
        }
        events
    }
}

/// Correlator, detector and chirp scheduler for one frequency
#[derive(Debug)]
struct TrackedTone {
    correlator: QuadratureCorrelator,
    detector: ToneDetector,
    scheduler: ChirpScheduler,
    magnitudes: Vec<f32>,
}

/// Detection-and-timing engine for one audio stream
///
/// # Example
/// ```
/// use tonetimer::audio::session::{InputBlock, Session};
/// use tonetimer::config::SessionConfig;
///
/// let mut session = Session::new(&SessionConfig::default()).unwrap();
/// session.start();
///
/// let input = vec![0.0f32; 1024];
/// let mut output = vec![0.0f32; 1024];
/// let report = session.process_block(InputBlock::Raw(&input), &mut output).unwrap();
/// assert_eq!(report.start_t, 0);
/// assert_eq!(session.now(), 1024);
/// ```
#[derive(Debug)]
pub struct Session {
    config: SessionConfig,
    clock: SampleClock,
    tones: Vec<TrackedTone>,
    events_tx: Sender<SessionEvent>,
    events_rx: Receiver<SessionEvent>,
    dropped_events: u64,
}

impl Session {
    /// Build detectors and schedulers for every configured tone
    pub fn new(config: &SessionConfig) -> Result<Self, SessionError> {
        config.validate()?;
        let sample_rate = config.sample_rate;

        let tones = config
            .tones
            .iter()
            .map(|tone| {
                let correlator = if tone.quadrature {
                    QuadratureCorrelator::new(sample_rate, tone.frequency, tone.kernel_periods)?
                } else {
                    QuadratureCorrelator::sine_only(sample_rate, tone.frequency, tone.kernel_periods)?
                };
                let detector = ToneDetector::new(DetectorConfig::from_tone(tone, sample_rate)?);
                let chirp = ReferenceWaveform::generate(
                    sample_rate,
                    tone.frequency,
                    tone.emit_periods,
                    WaveformKind::Sine,
                )?
                .tapered();
                let mut scheduler = if tone.chirp {
                    ChirpScheduler::new(chirp, config.lead_samples())
                } else {
                    ChirpScheduler::manual(chirp)
                };
                scheduler.set_amplitude(config.amplitude);

                Ok(TrackedTone {
                    correlator,
                    detector,
                    scheduler,
                    magnitudes: vec![0.0; config.block_size],
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        let (events_tx, events_rx) = crossbeam_channel::bounded(config.event_queue.max(1));

        Ok(Self {
            config: config.clone(),
            clock: SampleClock::new(),
            tones,
            events_tx,
            events_rx,
            dropped_events: 0,
        })
    }

    /// Schedule the first chirp of every looping tone
    pub fn start(&mut self) {
        let now = self.clock.now();
        for tone in &mut self.tones {
            if tone.scheduler.is_looping() {
                let lead = tone.scheduler.lead_samples();
                let schedule = tone.scheduler.schedule_chirp(now, lead);
                tracing::info!(
                    frequency = %format!("{:.1}", tone.scheduler.frequency()),
                    start = schedule.start,
                    "chirp_loop_started"
                );
            }
        }
    }

    /// Process one block; `output` must be as long as the input
    pub fn process_block(
        &mut self,
        input: InputBlock<'_>,
        output: &mut [f32],
    ) -> Result<BlockReport, SessionError> {
        let n = input.len();
        if n != output.len() {
            return Err(SessionError::BlockSizeMismatch {
                input: n,
                output: output.len(),
            });
        }
        self.correlate(input)?;

        let start_t = self.clock.now();
        let mut report = BlockReport {
            start_t,
            len: n,
            ..Default::default()
        };

        for tone in &mut self.tones {
            tone.detector.begin_block();
        }

        for (i, out) in output.iter_mut().enumerate() {
            let t = self.clock.now();
            let mut mix = 0.0f32;

            for tone in &mut self.tones {
                if let Some(mut event) = tone.detector.process(tone.magnitudes[i], t) {
                    report.detections += 1;
                    let measured = tone.scheduler.on_detection(&mut event, t);
                    Self::emit(
                        &self.events_tx,
                        &mut self.dropped_events,
                        SessionEvent::Detected(event),
                    );
                    if let Some(result) = measured {
                        report.measurements += 1;
                        Self::emit(
                            &self.events_tx,
                            &mut self.dropped_events,
                            SessionEvent::Measured(result),
                        );
                    }
                }
                mix += tone.scheduler.next_sample(t);
            }

            *out = mix.clamp(-1.0, 1.0);
            self.clock.advance(1);
        }

        report.peaks = self.tones.iter().map(|t| t.detector.block_peak()).collect();
        Ok(report)
    }

    /// Fill each tone's magnitude scratch buffer for this block
    fn correlate(&mut self, input: InputBlock<'_>) -> Result<(), SessionError> {
        let n = input.len();
        if let InputBlock::Correlated(channels) = input {
            if channels.len() != self.tones.len() {
                return Err(SessionError::ChannelCountMismatch {
                    expected: self.tones.len(),
                    actual: channels.len(),
                });
            }
        }

        for (index, tone) in self.tones.iter_mut().enumerate() {
            if tone.magnitudes.len() < n {
                tone.magnitudes.resize(n, 0.0);
            }
            let magnitudes = &mut tone.magnitudes[..n];
            match input {
                InputBlock::Raw(samples) => tone.correlator.process_block(samples, magnitudes),
                InputBlock::Correlated(channels) => {
                    let ch = channels[index];
                    combine_block(ch.sine, ch.cosine, magnitudes)?;
                }
            }
        }
        Ok(())
    }

    fn emit(tx: &Sender<SessionEvent>, dropped: &mut u64, event: SessionEvent) {
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => *dropped += 1,
        }
    }

    /// Emit tone `index` immediately (manual trigger)
    pub fn trigger_tone(&mut self, index: usize) -> Result<ChirpSchedule, SessionError> {
        self.schedule_chirp(index, 0)
    }

    /// Schedule tone `index` to start `delay_samples` from now
    pub fn schedule_chirp(
        &mut self,
        index: usize,
        delay_samples: u64,
    ) -> Result<ChirpSchedule, SessionError> {
        let now = self.clock.now();
        let tone = self
            .tones
            .get_mut(index)
            .ok_or(SessionError::UnknownTone(index))?;
        Ok(tone.scheduler.schedule_chirp(now, delay_samples))
    }

    /// Restart the clock and clear all detector and scheduler state
    pub fn reset(&mut self) {
        self.clock.reset();
        for tone in &mut self.tones {
            tone.correlator.reset();
            tone.detector.reset();
            tone.scheduler.reset();
        }
        while self.events_rx.try_recv().is_ok() {}
        self.dropped_events = 0;
        tracing::info!(tones = self.tones.len(), "session_reset");
    }

    /// Handle to the event queue
    pub fn events(&self) -> EventReceiver {
        EventReceiver {
            rx: self.events_rx.clone(),
        }
    }

    /// Read-only clock handle for other threads
    pub fn clock(&self) -> ClockReader {
        self.clock.reader()
    }

    /// Current global sample index
    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    /// Events lost to a full queue
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    pub fn tone_count(&self) -> usize {
        self.tones.len()
    }

    pub fn detector(&self, index: usize) -> Option<&ToneDetector> {
        self.tones.get(index).map(|t| &t.detector)
    }

    pub fn scheduler(&self, index: usize) -> Option<&ChirpScheduler> {
        self.tones.get(index).map(|t| &t.scheduler)
    }
}
