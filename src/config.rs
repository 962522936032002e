//! Session configuration
//!
//! Sample rate, block size, chirp lead time and the list of tracked tones.
//! Stored as JSON; every field falls back to its default when missing.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Errors reported when a configuration value cannot be used
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Sample rate must be positive, got {0}")]
    InvalidSampleRate(u32),

    #[error("Frequency must be positive and finite, got {0}")]
    InvalidFrequency(f64),

    #[error("Frequency {frequency} Hz is above the Nyquist limit of {nyquist} Hz")]
    AboveNyquist { frequency: f64, nyquist: f64 },

    #[error("Period count must be positive and finite, got {0}")]
    InvalidPeriods(f64),

    #[error("Threshold must be finite and non-negative, got {0}")]
    InvalidThreshold(f32),

    #[error("Consecutive sample requirement must be at least 1")]
    InvalidConsecutive,

    #[error("Block size must be positive")]
    InvalidBlockSize,

    #[error("Chirp lead time must be finite and non-negative, got {0}")]
    InvalidLead(f64),

    #[error("Amplitude must be in (0, 1], got {0}")]
    InvalidAmplitude(f32),

    #[error("At least one tone must be configured")]
    NoTones,
}

fn default_sample_rate() -> u32 {
    crate::DEFAULT_SAMPLE_RATE
}

fn default_block_size() -> usize {
    crate::DEFAULT_BLOCK_SIZE
}

fn default_chirp_lead_seconds() -> f64 {
    0.1
}

fn default_amplitude() -> f32 {
    0.5
}

fn default_event_queue() -> usize {
    64
}

fn default_periods() -> f64 {
    100.0
}

/// Magnitudes are in tone-amplitude units: a default chirp heard at unit
/// gain peaks near 0.375, its leakage into the other default tone near 0.002.
fn default_threshold() -> f32 {
    0.01
}

fn default_consecutive() -> u32 {
    20
}

fn default_debounce_samples() -> u64 {
    2000
}

fn default_quadrature() -> bool {
    true
}

fn default_tones() -> Vec<ToneConfig> {
    vec![
        ToneConfig::new(44100.0 / 2.2),
        ToneConfig {
            chirp: true,
            ..ToneConfig::new(44100.0 / 2.3)
        },
    ]
}

/// Detection and emission settings for one tracked frequency
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToneConfig {
    /// Target frequency in Hz
    pub frequency: f64,
    /// Matched-filter kernel length in periods of the target frequency
    #[serde(default = "default_periods")]
    pub kernel_periods: f64,
    /// Length of an emitted chirp in periods
    #[serde(default = "default_periods")]
    pub emit_periods: f64,
    /// Magnitude that a sample must exceed to count as "above"
    #[serde(default = "default_threshold")]
    pub threshold: f32,
    /// Consecutive above-threshold samples required for a detection
    #[serde(default = "default_consecutive")]
    pub consecutive: u32,
    /// Samples after a detection mark during which input is ignored
    #[serde(default = "default_debounce_samples")]
    pub debounce_samples: u64,
    /// Run the self-chirp latency loop on this frequency
    #[serde(default)]
    pub chirp: bool,
    /// Combine sine and cosine correlations; `false` uses the sine kernel alone
    #[serde(default = "default_quadrature")]
    pub quadrature: bool,
}

impl ToneConfig {
    /// Tone at `frequency` with default detection settings and no chirp loop
    pub fn new(frequency: f64) -> Self {
        Self {
            frequency,
            kernel_periods: default_periods(),
            emit_periods: default_periods(),
            threshold: default_threshold(),
            consecutive: default_consecutive(),
            debounce_samples: default_debounce_samples(),
            chirp: false,
            quadrature: default_quadrature(),
        }
    }

    /// Check this tone against the session sample rate
    pub fn validate(&self, sample_rate: u32) -> Result<(), ConfigError> {
        if sample_rate == 0 {
            return Err(ConfigError::InvalidSampleRate(sample_rate));
        }
        if !self.frequency.is_finite() || self.frequency <= 0.0 {
            return Err(ConfigError::InvalidFrequency(self.frequency));
        }
        let nyquist = sample_rate as f64 / 2.0;
        if self.frequency > nyquist {
            return Err(ConfigError::AboveNyquist {
                frequency: self.frequency,
                nyquist,
            });
        }
        for periods in [self.kernel_periods, self.emit_periods] {
            if !periods.is_finite() || periods <= 0.0 {
                return Err(ConfigError::InvalidPeriods(periods));
            }
        }
        if !self.threshold.is_finite() || self.threshold < 0.0 {
            return Err(ConfigError::InvalidThreshold(self.threshold));
        }
        if self.consecutive == 0 {
            return Err(ConfigError::InvalidConsecutive);
        }
        Ok(())
    }
}

/// Configuration for one audio session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Sample rate in Hz
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    /// Samples per processing call
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    /// Delay before each scheduled chirp, in seconds
    #[serde(default = "default_chirp_lead_seconds")]
    pub chirp_lead_seconds: f64,
    /// Chirp output amplitude, above 0.0 and at most 1.0
    #[serde(default = "default_amplitude")]
    pub amplitude: f32,
    /// Capacity of the detection event queue
    #[serde(default = "default_event_queue")]
    pub event_queue: usize,
    /// Tracked tones, one detector each
    #[serde(default = "default_tones")]
    pub tones: Vec<ToneConfig>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            block_size: default_block_size(),
            chirp_lead_seconds: default_chirp_lead_seconds(),
            amplitude: default_amplitude(),
            event_queue: default_event_queue(),
            tones: default_tones(),
        }
    }
}

impl SessionConfig {
    /// Validate every field and every tone
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_rate == 0 {
            return Err(ConfigError::InvalidSampleRate(self.sample_rate));
        }
        if self.block_size == 0 {
            return Err(ConfigError::InvalidBlockSize);
        }
        if !self.chirp_lead_seconds.is_finite() || self.chirp_lead_seconds < 0.0 {
            return Err(ConfigError::InvalidLead(self.chirp_lead_seconds));
        }
        if !self.amplitude.is_finite() || self.amplitude <= 0.0 || self.amplitude > 1.0 {
            return Err(ConfigError::InvalidAmplitude(self.amplitude));
        }
        if self.tones.is_empty() {
            return Err(ConfigError::NoTones);
        }
        self.tones
            .iter()
            .try_for_each(|tone| tone.validate(self.sample_rate))
    }

    /// Chirp lead time converted to samples
    pub fn lead_samples(&self) -> u64 {
        (self.chirp_lead_seconds * self.sample_rate as f64).round() as u64
    }

    /// Load and validate a config file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        tracing::info!(path = %path.display(), tones = config.tones.len(), "Loaded config from disk");
        Ok(config)
    }

    /// Load a config file, falling back to defaults on any error
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to load config, using defaults");
                Self::default()
            }
        }
    }

    /// Save config to disk, creating parent directories if needed
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!(path = %path.display(), "Config saved to disk");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SessionConfig::default();
        assert_eq!(config.sample_rate, 44100);
        assert_eq!(config.block_size, 1024);
        assert_eq!(config.tones.len(), 2);
        assert!(!config.tones[0].chirp);
        assert!(config.tones[1].chirp);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_lead_samples() {
        let config = SessionConfig::default();
        assert_eq!(config.lead_samples(), 4410);
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let json = r#"{"sample_rate": 48000, "tones": [{"frequency": 1000.0}]}"#;
        let config: SessionConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.sample_rate, 48000);
        assert_eq!(config.block_size, 1024);
        assert_eq!(config.tones[0].consecutive, 20);
        assert_eq!(config.tones[0].debounce_samples, 2000);
        assert!(!config.tones[0].chirp);
        assert!(config.tones[0].quadrature);
    }

    #[test]
    fn test_empty_json_uses_defaults() {
        let config: SessionConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, SessionConfig::default());
    }

    #[test]
    fn test_rejects_non_positive_frequency() {
        let tone = ToneConfig::new(0.0);
        assert_eq!(
            tone.validate(44100),
            Err(ConfigError::InvalidFrequency(0.0))
        );
        let tone = ToneConfig::new(-5.0);
        assert!(tone.validate(44100).is_err());
    }

    #[test]
    fn test_rejects_above_nyquist() {
        let tone = ToneConfig::new(30000.0);
        assert!(matches!(
            tone.validate(44100),
            Err(ConfigError::AboveNyquist { .. })
        ));
    }

    #[test]
    fn test_rejects_zero_consecutive() {
        let tone = ToneConfig {
            consecutive: 0,
            ..ToneConfig::new(1000.0)
        };
        assert_eq!(tone.validate(48000), Err(ConfigError::InvalidConsecutive));
    }

    #[test]
    fn test_rejects_empty_tones() {
        let config = SessionConfig {
            tones: vec![],
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::NoTones));
    }

    #[test]
    fn test_rejects_amplitude_outside_unit_range() {
        for amplitude in [0.0, -1.0, 1.5, f32::INFINITY] {
            let config = SessionConfig {
                amplitude,
                ..Default::default()
            };
            assert_eq!(
                config.validate(),
                Err(ConfigError::InvalidAmplitude(amplitude)),
                "amplitude {}",
                amplitude
            );
        }

        let config = SessionConfig {
            amplitude: f32::NAN,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidAmplitude(a)) if a.is_nan()
        ));

        let config = SessionConfig {
            amplitude: 1.0,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tonetimer.json");

        let config = SessionConfig {
            sample_rate: 48000,
            tones: vec![ToneConfig {
                chirp: true,
                ..ToneConfig::new(12000.0)
            }],
            ..Default::default()
        };
        config.save(&path).unwrap();

        let loaded = SessionConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_or_default_on_bad_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();

        let config = SessionConfig::load_or_default(&path);
        assert_eq!(config, SessionConfig::default());
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("invalid.json");
        std::fs::write(&path, r#"{"tones": [{"frequency": -1.0}]}"#).unwrap();

        assert!(SessionConfig::load(&path).is_err());
    }
}
