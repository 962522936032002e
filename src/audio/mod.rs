//! Audio processing module
//!
//! This module contains all audio-related functionality including:
//! - Sine/cosine reference waveforms ([`reference`])
//! - Quadrature correlation into a magnitude stream ([`correlator`])
//! - Threshold, hysteresis and debounce detection ([`detector`])
//! - Chirp emission and echo timing ([`scheduler`])
//! - The global sample clock ([`clock`])
//! - Per-block processing for one audio session ([`session`])
//! - Simulated acoustic loopback ([`simulator`])
//! - cpal device I/O ([`engine`], behind the `device` feature)

pub mod clock;
pub mod correlator;
pub mod detector;
#[cfg(feature = "device")]
pub mod engine;
pub mod reference;
pub mod scheduler;
pub mod session;
pub mod simulator;
