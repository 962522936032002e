//! Tonetimer - quadrature tone detection and acoustic latency measurement
//!
//! Detects a single target tone in a live or looped audio stream by
//! correlating it against sine and cosine references, and measures
//! round-trip acoustic latency by emitting a short chirp at that frequency
//! and timing when it is heard again.
//!
//! All timing is done on one global sample clock shared by the output
//! (chirp synthesis) and input (detection) paths of a session.

pub mod audio;
pub mod config;
pub mod stats;

pub use audio::{
    clock::SampleClock,
    correlator::QuadratureCorrelator,
    detector::{DetectionEvent, ToneDetector},
    reference::{ReferenceWaveform, WaveformKind},
    scheduler::{ChirpScheduler, LatencyResult},
    session::{InputBlock, Session, SessionEvent},
};
pub use config::{ConfigError, SessionConfig, ToneConfig};
pub use stats::store::StatsStore;

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default sample rate in Hz
pub const DEFAULT_SAMPLE_RATE: u32 = 44100;

/// Default number of samples per processing call
pub const DEFAULT_BLOCK_SIZE: usize = 1024;
