//! Simulated acoustic loopback
//!
//! Plays the session's output into a delay line and captures it back as
//! input `delay` samples later, scaled by a gain and with white noise added.
//! With this a whole chirp-and-detect loop runs without audio hardware.
//!
//! The pump order matches a duplex device: capture a block, process it, then
//! play the block the session produced. The delay line starts with `delay`
//! samples of silence, so input sample `t` is exactly output sample
//! `t - delay` as long as the delay is at least one block.

use std::collections::VecDeque;

use super::session::{BlockReport, InputBlock, Session, SessionError};

/// Software frame pump with a fixed delay, gain and noise floor
///
/// # Example
/// ```
/// use tonetimer::audio::simulator::LoopbackSimulator;
///
/// let mut sim = LoopbackSimulator::new(4, 1.0, 0.0);
/// let mut input = [0.0f32; 4];
/// sim.capture(&mut input);
/// sim.play(&[0.1, 0.2, 0.3, 0.4]);
/// sim.capture(&mut input);
/// assert_eq!(input, [0.1, 0.2, 0.3, 0.4]);
/// ```
#[derive(Debug)]
pub struct LoopbackSimulator {
    delay: usize,
    gain: f32,
    noise_amplitude: f32,
    noise_seed: u32,
    line: VecDeque<f32>,
    input: Vec<f32>,
    output: Vec<f32>,
}

impl LoopbackSimulator {
    pub fn new(delay_samples: usize, gain: f32, noise_amplitude: f32) -> Self {
        let mut sim = Self {
            delay: delay_samples,
            gain,
            noise_amplitude: noise_amplitude.max(0.0),
            noise_seed: 0xDEADBEEF,
            line: VecDeque::with_capacity(delay_samples * 2),
            input: Vec::new(),
            output: Vec::new(),
        };
        sim.reset();
        sim
    }

    /// Fill `input` with what the microphone hears now
    ///
    /// Missing history (delay shorter than the block) reads as silence.
    pub fn capture(&mut self, input: &mut [f32]) {
        for sample in input.iter_mut() {
            let delayed = self.line.pop_front().unwrap_or(0.0);
            *sample = delayed * self.gain + self.noise();
        }
    }

    /// Send a block to the speaker
    pub fn play(&mut self, output: &[f32]) {
        self.line.extend(output.iter().copied());
    }

    /// Capture into `input`, then play `output`
    pub fn tick_block(&mut self, output: &[f32], input: &mut [f32]) {
        self.capture(input);
        self.play(output);
    }

    /// Run one block of `block_size` samples through `session`
    pub fn run_block(
        &mut self,
        session: &mut Session,
        block_size: usize,
    ) -> Result<BlockReport, SessionError> {
        self.input.resize(block_size, 0.0);
        self.output.resize(block_size, 0.0);

        let mut input = std::mem::take(&mut self.input);
        self.capture(&mut input);
        let result = session.process_block(InputBlock::Raw(&input), &mut self.output);
        self.input = input;

        let output = std::mem::take(&mut self.output);
        self.play(&output);
        self.output = output;

        result
    }

    /// Run whole blocks until at least `samples` have been processed
    pub fn run_for(&mut self, session: &mut Session, samples: u64) -> Result<(), SessionError> {
        let block_size = session.config().block_size;
        let end = session.now() + samples;
        while session.now() < end {
            self.run_block(session, block_size)?;
        }
        Ok(())
    }

    /// LCG white noise in `-noise_amplitude..noise_amplitude`
    fn noise(&mut self) -> f32 {
        if self.noise_amplitude == 0.0 {
            return 0.0;
        }
        self.noise_seed = self.noise_seed.wrapping_mul(1103515245).wrapping_add(12345);
        let bits = (self.noise_seed >> 16) & 0x7FFF;
        ((bits as f32 / 16384.0) - 1.0) * self.noise_amplitude
    }

    pub fn delay(&self) -> usize {
        self.delay
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    pub fn noise_amplitude(&self) -> f32 {
        self.noise_amplitude
    }

    /// Refill the delay line with silence and restart the noise sequence
    pub fn reset(&mut self) {
        self.line.clear();
        self.line.resize(self.delay, 0.0);
        self.noise_seed = 0xDEADBEEF;
    }
}
