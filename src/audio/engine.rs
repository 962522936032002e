//! cpal audio engine: device management and duplex stream handling
//!
//! The output callback owns the [`Session`], so it is the only writer of the
//! sample clock. Each output callback:
//! - pops as many captured samples as it has output frames (silence on underrun)
//! - runs one [`Session::process_block`] per chunk of at most
//!   `CALLBACK_FRAMES` frames
//! - writes the mono result to channel 0 and silence to the rest
//!
//! The input callback only pushes channel 0 into a lock-free ring buffer.
//! Detections leave through the session's event queue; manual triggers reach
//! the output callback through a small command channel. Nothing in either
//! callback blocks or allocates.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleRate, Stream, StreamConfig};
use crossbeam_channel::{Receiver, Sender};
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::HeapRb;
use thiserror::Error;

use super::clock::ClockReader;
use super::session::{EventReceiver, InputBlock, Session, SessionError, SessionEvent};
use crate::config::SessionConfig;

/// Capture ring buffer size in samples (about 1.5 s at 44.1 kHz)
const RING_BUFFER_SIZE: usize = 65536;

/// Largest session block run by the output callback; scratch is sized once
const CALLBACK_FRAMES: usize = 8192;

/// Pending manual triggers
const COMMAND_QUEUE: usize = 16;

/// Errors from device and stream operations
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("No audio devices found")]
    NoDevices,

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("No device selected")]
    NoDeviceSelected,

    #[error("Engine is already running")]
    AlreadyRunning,

    #[error("Engine is not running")]
    NotRunning,

    #[error("Trigger queue full")]
    TriggerQueueFull,

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Failed to enumerate devices: {0}")]
    Devices(#[from] cpal::DevicesError),

    #[error("Failed to open stream: {0}")]
    BuildStream(#[from] cpal::BuildStreamError),

    #[error("Failed to start stream: {0}")]
    PlayStream(#[from] cpal::PlayStreamError),
}

/// Audio device information
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub name: String,
    pub is_default: bool,
    /// Common rates the device supports for output
    pub sample_rates: Vec<u32>,
    pub input_channels: u16,
    pub output_channels: u16,
}

/// Audio engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Stopped,
    Running,
}

/// Streams and handles that exist only while running
struct RunningStreams {
    _input: Stream,
    _output: Stream,
    running: Arc<AtomicBool>,
    events: EventReceiver,
    clock: ClockReader,
    triggers: Sender<usize>,
    overruns: Arc<AtomicU64>,
    underruns: Arc<AtomicU64>,
}

/// Duplex audio engine driving one [`Session`]
pub struct AudioEngine {
    state: EngineState,
    config: SessionConfig,
    device_name: Option<String>,
    device: Option<Device>,
    streams: Option<RunningStreams>,
}

impl AudioEngine {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            state: EngineState::Stopped,
            config,
            device_name: None,
            device: None,
            streams: None,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Sample rate the session runs at (updated by `start`)
    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    /// List available devices on the default host
    pub fn list_devices() -> Result<Vec<DeviceInfo>, EngineError> {
        let host = cpal::default_host();
        let default_input = host.default_input_device().and_then(|d| d.name().ok());
        let default_output = host.default_output_device().and_then(|d| d.name().ok());

        let mut devices = Vec::new();
        for device in host.devices()? {
            let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
            let is_default = default_input.as_deref() == Some(name.as_str())
                || default_output.as_deref() == Some(name.as_str());

            let input_channels = device
                .default_input_config()
                .map(|c| c.channels())
                .unwrap_or(0);
            let output_channels = device
                .default_output_config()
                .map(|c| c.channels())
                .unwrap_or(0);

            let common_rates = [44100, 48000, 88200, 96000];
            let mut sample_rates = Vec::new();
            if let Ok(configs) = device.supported_output_configs() {
                for config in configs {
                    for &rate in &common_rates {
                        if (config.min_sample_rate().0..=config.max_sample_rate().0).contains(&rate)
                            && !sample_rates.contains(&rate)
                        {
                            sample_rates.push(rate);
                        }
                    }
                }
            }
            sample_rates.sort();

            devices.push(DeviceInfo {
                name,
                is_default,
                sample_rates,
                input_channels,
                output_channels,
            });
        }

        if devices.is_empty() {
            return Err(EngineError::NoDevices);
        }
        Ok(devices)
    }

    /// Select a device by name
    pub fn select_device(&mut self, name: &str) -> Result<(), EngineError> {
        let host = cpal::default_host();
        let device = host
            .devices()?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| EngineError::DeviceNotFound(name.to_string()))?;

        tracing::info!(device = %name, "device_selected");
        self.device = Some(device);
        self.device_name = Some(name.to_string());
        Ok(())
    }

    /// Select the host's default duplex device
    pub fn select_default_device(&mut self) -> Result<(), EngineError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or(EngineError::NoDevices)?;
        let name = device.name().unwrap_or_else(|_| "default".to_string());
        tracing::info!(device = %name, "device_selected");
        self.device = Some(device);
        self.device_name = Some(name);
        Ok(())
    }

    pub fn device_name(&self) -> Option<&str> {
        self.device_name.as_deref()
    }

    /// Open input and output streams and start the chirp loop
    pub fn start(&mut self) -> Result<(), EngineError> {
        if self.streams.is_some() {
            return Err(EngineError::AlreadyRunning);
        }
        let device = self.device.as_ref().ok_or(EngineError::NoDeviceSelected)?;

        let default_output = device.default_output_config();
        let default_input = device.default_input_config();
        let output_channels = default_output.as_ref().map(|c| c.channels()).unwrap_or(2);
        let input_channels = default_input.as_ref().map(|c| c.channels()).unwrap_or(2);

        // Configured rate first, device default as fallback
        let device_rate = default_output
            .as_ref()
            .map(|c| c.sample_rate().0)
            .unwrap_or(self.config.sample_rate);
        let mut rates_to_try = vec![self.config.sample_rate];
        if device_rate != self.config.sample_rate {
            rates_to_try.push(device_rate);
        }

        let mut output_config = StreamConfig {
            channels: output_channels,
            sample_rate: SampleRate(self.config.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        let mut effective_rate = self.config.sample_rate;
        for &rate in &rates_to_try {
            output_config.sample_rate = SampleRate(rate);
            match device.build_output_stream(
                &output_config,
                |_: &mut [f32], _: &cpal::OutputCallbackInfo| {},
                |_| {},
                None,
            ) {
                Ok(_probe) => {
                    effective_rate = rate;
                    break;
                }
                Err(e) => {
                    tracing::warn!(rate, error = %e, "sample_rate_rejected");
                }
            }
        }
        if effective_rate != self.config.sample_rate {
            tracing::warn!(
                configured = self.config.sample_rate,
                effective = effective_rate,
                "using device default sample rate"
            );
            self.config.sample_rate = effective_rate;
        }
        output_config.sample_rate = SampleRate(effective_rate);
        let input_config = StreamConfig {
            channels: input_channels,
            sample_rate: SampleRate(effective_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let mut session = Session::new(&self.config)?;
        let events = session.events();
        let clock = session.clock();
        session.start();

        let (mut producer, mut consumer) = HeapRb::<f32>::new(RING_BUFFER_SIZE).split();
        let (trigger_tx, trigger_rx): (Sender<usize>, Receiver<usize>) =
            crossbeam_channel::bounded(COMMAND_QUEUE);

        let running = Arc::new(AtomicBool::new(true));
        let overruns = Arc::new(AtomicU64::new(0));
        let underruns = Arc::new(AtomicU64::new(0));

        let output_running = Arc::clone(&running);
        let mut pump = OutputPump::new(
            session,
            consumer,
            trigger_rx,
            output_channels as usize,
            Arc::clone(&underruns),
        );

        let output_stream = device.build_output_stream(
            &output_config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                if !output_running.load(Ordering::Relaxed) {
                    data.fill(0.0);
                    return;
                }
                pump.fill(data);
            },
            move |err| {
                tracing::error!(error = %err, "output_stream_error");
            },
            None,
        )?;

        let input_running = Arc::clone(&running);
        let input_overruns = Arc::clone(&overruns);
        let num_input_channels = (input_channels as usize).max(1);

        let input_stream = device.build_input_stream(
            &input_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if !input_running.load(Ordering::Relaxed) {
                    return;
                }
                for frame in data.chunks(num_input_channels) {
                    if producer.try_push(frame[0]).is_err() {
                        input_overruns.fetch_add(1, Ordering::Relaxed);
                    }
                }
            },
            move |err| {
                tracing::error!(error = %err, "input_stream_error");
            },
            None,
        )?;

        output_stream.play()?;
        input_stream.play()?;

        self.streams = Some(RunningStreams {
            _input: input_stream,
            _output: output_stream,
            running,
            events,
            clock,
            triggers: trigger_tx,
            overruns,
            underruns,
        });
        self.state = EngineState::Running;

        tracing::info!(
            device = %self.device_name.as_deref().unwrap_or("unknown"),
            sample_rate = effective_rate,
            output_channels,
            input_channels,
            "audio_engine_started"
        );
        Ok(())
    }

    /// Stop and close both streams
    pub fn stop(&mut self) {
        if let Some(streams) = self.streams.take() {
            streams.running.store(false, Ordering::Relaxed);
            tracing::info!(
                overruns = streams.overruns.load(Ordering::Relaxed),
                underruns = streams.underruns.load(Ordering::Relaxed),
                "audio_engine_stopped"
            );
        }
        self.state = EngineState::Stopped;
    }

    /// Emit tone `index` at the next output callback
    pub fn trigger_tone(&self, index: usize) -> Result<(), EngineError> {
        if index >= self.config.tones.len() {
            return Err(SessionError::UnknownTone(index).into());
        }
        let streams = self.streams.as_ref().ok_or(EngineError::NotRunning)?;
        streams
            .triggers
            .try_send(index)
            .map_err(|_| EngineError::TriggerQueueFull)
    }

    /// Take all queued detection and latency events
    pub fn drain_events(&self) -> Vec<SessionEvent> {
        self.streams
            .as_ref()
            .map(|s| s.events.drain())
            .unwrap_or_default()
    }

    /// Current session sample index, if running
    pub fn now(&self) -> Option<u64> {
        self.streams.as_ref().map(|s| s.clock.now())
    }

    /// Captured samples dropped because the ring buffer was full
    pub fn overruns(&self) -> u64 {
        self.streams
            .as_ref()
            .map_or(0, |s| s.overruns.load(Ordering::Relaxed))
    }

    /// Output frames processed with silence because no capture was ready
    pub fn underruns(&self) -> u64 {
        self.streams
            .as_ref()
            .map_or(0, |s| s.underruns.load(Ordering::Relaxed))
    }
}

/// Work done by the output callback: triggers, capture, one session block
/// per chunk of at most `CALLBACK_FRAMES` frames, interleaved write-out
struct OutputPump<C> {
    session: Session,
    capture: C,
    triggers: Receiver<usize>,
    input_block: Vec<f32>,
    output_block: Vec<f32>,
    channels: usize,
    underruns: Arc<AtomicU64>,
}

impl<C: Consumer<Item = f32>> OutputPump<C> {
    fn new(
        session: Session,
        capture: C,
        triggers: Receiver<usize>,
        channels: usize,
        underruns: Arc<AtomicU64>,
    ) -> Self {
        Self {
            session,
            capture,
            triggers,
            input_block: vec![0.0; CALLBACK_FRAMES],
            output_block: vec![0.0; CALLBACK_FRAMES],
            channels: channels.max(1),
            underruns,
        }
    }

    /// Fill one interleaved output buffer; never allocates
    fn fill(&mut self, data: &mut [f32]) {
        while let Ok(index) = self.triggers.try_recv() {
            // Indices are checked before they are sent
            let _ = self.session.trigger_tone(index);
        }

        for chunk in data.chunks_mut(CALLBACK_FRAMES * self.channels) {
            let frames = chunk.len() / self.channels;
            let input = &mut self.input_block[..frames];
            let output = &mut self.output_block[..frames];

            let popped = self.capture.pop_slice(input);
            if popped < frames {
                input[popped..].fill(0.0);
                self.underruns.fetch_add((frames - popped) as u64, Ordering::Relaxed);
            }

            if self.session.process_block(InputBlock::Raw(&*input), output).is_err() {
                output.fill(0.0);
            }

            for (frame, &sample) in chunk.chunks_mut(self.channels).zip(output.iter()) {
                frame[0] = sample;
                for ch in frame.iter_mut().skip(1) {
                    *ch = 0.0;
                }
            }
        }
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        self.stop();
    }
}
