//! Quadrature correlation
//!
//! Turns incoming audio into a single non-negative magnitude stream. The
//! sine-correlated channel `I` and the cosine-correlated channel `Q` are
//! combined per sample as `sqrt(I² + Q²)`, which does not depend on the
//! phase of the incoming tone. A single sine correlation can null out when
//! the tone arrives 90° off the kernel.
//!
//! The channels can come from an external filter graph ([`combine_block`])
//! or from the built-in direct-form matched filter ([`QuadratureCorrelator`]).

use ringbuf::{
    traits::{Consumer, RingBuffer},
    HeapRb,
};
use thiserror::Error;

use super::reference::{hann_window, quadrature_pair, ReferenceWaveform};
use crate::config::ConfigError;

/// Errors from block-level correlation helpers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CorrelatorError {
    #[error("Channel length mismatch: sine {sine}, cosine {cosine}, output {output}")]
    LengthMismatch {
        sine: usize,
        cosine: usize,
        output: usize,
    },
}

/// Phase-invariant magnitude of one (I, Q) pair
#[inline]
pub fn quadrature_magnitude(i: f32, q: f32) -> f32 {
    i.hypot(q)
}

/// Combine pre-filtered channels into magnitudes
///
/// With a cosine channel this is the quadrature magnitude; without one
/// (legacy sine-only input) it is `|I|`.
pub fn combine_block(
    sine: &[f32],
    cosine: Option<&[f32]>,
    out: &mut [f32],
) -> Result<(), CorrelatorError> {
    let cosine_len = cosine.map_or(sine.len(), <[f32]>::len);
    if sine.len() != out.len() || cosine_len != out.len() {
        return Err(CorrelatorError::LengthMismatch {
            sine: sine.len(),
            cosine: cosine_len,
            output: out.len(),
        });
    }

    match cosine {
        Some(cosine) => {
            for ((m, &i), &q) in out.iter_mut().zip(sine).zip(cosine) {
                *m = quadrature_magnitude(i, q);
            }
        }
        None => {
            for (m, &i) in out.iter_mut().zip(sine) {
                *m = i.abs();
            }
        }
    }
    Ok(())
}

/// The last `len` raw samples, oldest first, zero-filled at start
struct TrailingWindow {
    samples: HeapRb<f32>,
    len: usize,
}

impl std::fmt::Debug for TrailingWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrailingWindow").field("len", &self.len).finish()
    }
}

impl TrailingWindow {
    fn new(len: usize) -> Self {
        let mut window = Self {
            samples: HeapRb::new(len),
            len,
        };
        window.clear();
        window
    }

    fn push(&mut self, sample: f32) {
        self.samples.push_overwrite(sample);
    }

    /// Dot product against a kernel of the same length
    fn dot(&self, kernel: &[f32]) -> f32 {
        let (head, tail) = self.samples.as_slices();
        let (k_head, k_tail) = kernel.split_at(head.len());
        let a: f32 = head.iter().zip(k_head).map(|(x, k)| x * k).sum();
        let b: f32 = tail.iter().zip(k_tail).map(|(x, k)| x * k).sum();
        a + b
    }

    fn clear(&mut self) {
        for _ in 0..self.len {
            self.samples.push_overwrite(0.0);
        }
    }
}

/// Hann-window a reference and scale it by its projection onto the reference
///
/// A unit-amplitude tone aligned with the kernel then correlates to 1.0,
/// whatever the kernel length or frequency. The window keeps a burst at a
/// neighbouring frequency from leaking through the kernel's side lobes.
fn windowed_kernel(reference: &ReferenceWaveform) -> Vec<f32> {
    let kernel: Vec<f32> = reference
        .samples()
        .iter()
        .zip(hann_window(reference.len()))
        .map(|(s, w)| s * w)
        .collect();
    let projection: f32 = kernel.iter().zip(reference.samples()).map(|(k, s)| k * s).sum();
    let gain = if projection > f32::EPSILON {
        1.0 / projection
    } else {
        1.0
    };
    kernel.into_iter().map(|k| k * gain).collect()
}

/// Direct-form quadrature matched filter for one target frequency
///
/// # Example
/// ```
/// use tonetimer::audio::correlator::QuadratureCorrelator;
///
/// let mut correlator = QuadratureCorrelator::new(48000, 1000.0, 10.0).unwrap();
/// let magnitude = correlator.push(0.0);
/// assert_eq!(magnitude, 0.0);
/// ```
#[derive(Debug)]
pub struct QuadratureCorrelator {
    frequency: f64,
    sine_kernel: Vec<f32>,
    /// `None` runs the phase-sensitive sine-only filter
    cosine_kernel: Option<Vec<f32>>,
    window: TrailingWindow,
}

impl QuadratureCorrelator {
    /// Build sine and cosine kernels of `periods` cycles at `frequency`
    pub fn new(sample_rate: u32, frequency: f64, periods: f64) -> Result<Self, ConfigError> {
        let (sine, cosine) = quadrature_pair(sample_rate, frequency, periods)?;
        Ok(Self {
            frequency,
            sine_kernel: windowed_kernel(&sine),
            cosine_kernel: Some(windowed_kernel(&cosine)),
            window: TrailingWindow::new(sine.len()),
        })
    }

    /// Single-kernel filter producing `|I|`
    ///
    /// The magnitude of a steady tone depends on how it lines up with the
    /// kernel and can null out at 90°.
    pub fn sine_only(sample_rate: u32, frequency: f64, periods: f64) -> Result<Self, ConfigError> {
        let mut correlator = Self::new(sample_rate, frequency, periods)?;
        correlator.cosine_kernel = None;
        Ok(correlator)
    }

    /// Feed one raw sample, returning the magnitude at that sample
    #[inline]
    pub fn push(&mut self, sample: f32) -> f32 {
        self.window.push(sample);
        let i = self.window.dot(&self.sine_kernel);
        match &self.cosine_kernel {
            Some(kernel) => quadrature_magnitude(i, self.window.dot(kernel)),
            None => i.abs(),
        }
    }

    /// Correlate a block; `out` receives one magnitude per input sample
    pub fn process_block(&mut self, input: &[f32], out: &mut [f32]) {
        for (m, &x) in out.iter_mut().zip(input) {
            *m = self.push(x);
        }
    }

    /// Kernel length in samples
    pub fn kernel_len(&self) -> usize {
        self.sine_kernel.len()
    }

    pub fn frequency(&self) -> f64 {
        self.frequency
    }

    pub fn is_quadrature(&self) -> bool {
        self.cosine_kernel.is_some()
    }

    /// Forget all history
    pub fn reset(&mut self) {
        self.window.clear();
    }
}
