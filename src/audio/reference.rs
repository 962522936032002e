//! Sine and cosine reference waveforms
//!
//! A reference waveform is a fixed number of periods of a pure tone. The
//! same waveform serves as a matched-filter kernel for correlation and as
//! the literal samples emitted for a chirp. Emitted chirps carry a Hann
//! envelope so their spectrum does not spill into a neighbouring tone.

use std::f64::consts::TAU;

use crate::config::ConfigError;

/// Which of the two quadrature phases a waveform carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaveformKind {
    /// `sin(i * 2π f / sr)`, starts at 0.0
    Sine,
    /// `cos(i * 2π f / sr)`, starts at 1.0
    Cosine,
}

/// Immutable tone reference, generated once per (frequency, periods, kind)
///
/// # Example
/// ```
/// use tonetimer::audio::reference::{ReferenceWaveform, WaveformKind};
///
/// let sine = ReferenceWaveform::generate(48000, 1000.0, 10.0, WaveformKind::Sine).unwrap();
/// assert_eq!(sine.len(), 480);
/// assert_eq!(sine.samples()[0], 0.0);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceWaveform {
    sample_rate: u32,
    frequency: f64,
    periods: f64,
    kind: WaveformKind,
    samples: Vec<f32>,
}

impl ReferenceWaveform {
    /// Generate `round(periods * sample_rate / frequency)` samples (at least one)
    ///
    /// # Errors
    /// Returns a [`ConfigError`] for a zero sample rate, a non-positive or
    /// non-finite frequency or period count, or a frequency above Nyquist.
    pub fn generate(
        sample_rate: u32,
        frequency: f64,
        periods: f64,
        kind: WaveformKind,
    ) -> Result<Self, ConfigError> {
        if sample_rate == 0 {
            return Err(ConfigError::InvalidSampleRate(sample_rate));
        }
        if !frequency.is_finite() || frequency <= 0.0 {
            return Err(ConfigError::InvalidFrequency(frequency));
        }
        let nyquist = sample_rate as f64 / 2.0;
        if frequency > nyquist {
            return Err(ConfigError::AboveNyquist { frequency, nyquist });
        }
        if !periods.is_finite() || periods <= 0.0 {
            return Err(ConfigError::InvalidPeriods(periods));
        }

        let length = reference_length(sample_rate, frequency, periods);
        let radians_per_sample = frequency * TAU / sample_rate as f64;
        let samples = (0..length)
            .map(|i| {
                let phase = i as f64 * radians_per_sample;
                match kind {
                    WaveformKind::Sine => phase.sin() as f32,
                    WaveformKind::Cosine => phase.cos() as f32,
                }
            })
            .collect();

        Ok(Self {
            sample_rate,
            frequency,
            periods,
            kind,
            samples,
        })
    }

    /// The same waveform under a Hann envelope
    ///
    /// Starts and ends at zero and keeps the envelope symmetric about the
    /// middle sample, so a detection run stays centred on the burst.
    pub fn tapered(mut self) -> Self {
        let window = hann_window(self.samples.len());
        for (s, w) in self.samples.iter_mut().zip(window) {
            *s *= w;
        }
        self
    }

    /// The waveform samples
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Number of samples
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Always false, a waveform holds at least one sample
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Sample at `index`, or silence past the end
    pub fn get(&self, index: usize) -> f32 {
        self.samples.get(index).copied().unwrap_or(0.0)
    }

    /// Sum of squared samples
    pub fn energy(&self) -> f32 {
        self.samples.iter().map(|s| s * s).sum()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn frequency(&self) -> f64 {
        self.frequency
    }

    pub fn periods(&self) -> f64 {
        self.periods
    }

    pub fn kind(&self) -> WaveformKind {
        self.kind
    }
}

/// Number of samples in `periods` cycles of `frequency`, rounded, minimum 1
pub fn reference_length(sample_rate: u32, frequency: f64, periods: f64) -> usize {
    ((periods * sample_rate as f64 / frequency).round() as usize).max(1)
}

/// Symmetric Hann window of `len` points; a single point is 1.0
pub fn hann_window(len: usize) -> Vec<f32> {
    if len <= 1 {
        return vec![1.0; len];
    }
    let span = (len - 1) as f64;
    (0..len)
        .map(|i| (0.5 - 0.5 * (TAU * i as f64 / span).cos()) as f32)
        .collect()
}

/// Free-function form of [`ReferenceWaveform::generate`]
pub fn generate(
    sample_rate: u32,
    frequency: f64,
    periods: f64,
    kind: WaveformKind,
) -> Result<ReferenceWaveform, ConfigError> {
    ReferenceWaveform::generate(sample_rate, frequency, periods, kind)
}

/// Generate the matching (sine, cosine) pair
pub fn quadrature_pair(
    sample_rate: u32,
    frequency: f64,
    periods: f64,
) -> Result<(ReferenceWaveform, ReferenceWaveform), ConfigError> {
    Ok((
        generate(sample_rate, frequency, periods, WaveformKind::Sine)?,
        generate(sample_rate, frequency, periods, WaveformKind::Cosine)?,
    ))
}
