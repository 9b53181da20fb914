//! Configuration management for streamscribe.
//!
//! Nested TOML configuration with serde defaults; every value falls back to
//! the constants in `defaults`. Configuration is immutable for a session's
//! lifetime, so invalid values are rejected at load time.

use crate::defaults;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub audio: AudioConfig,
    pub ingest: IngestConfig,
    pub recognition: RecognitionConfig,
    pub diarization: DiarizationConfig,
}

/// Audio and buffering configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioConfig {
    /// Sample rate in Hz of PCM produced by decode pipelines.
    pub sample_rate: u32,
    /// Audio accumulated before a chunk is handed to recognition.
    pub min_buffer_duration_ms: u64,
    /// Circular buffer capacity in milliseconds of audio.
    pub ring_capacity_ms: u64,
}

/// Inclusive port range scanned for a free listener port.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }
}

/// Ingestion worker configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IngestConfig {
    pub srt_ports: PortRange,
    pub rtmp_ports: PortRange,
    pub websocket_ports: PortRange,
    /// External decoder command template; `{uri}` is substituted.
    pub decoder_command: String,
    /// Pipeline failures tolerated in-worker before the error is fatal.
    pub retry_ceiling: u32,
    /// Worker process respawns before the channel is marked failed.
    pub respawn_ceiling: u32,
}

/// Recognition backend configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RecognitionConfig {
    /// Provider name ("mock", "whisper").
    pub provider: String,
    /// Candidate languages. One entry fixes the language; several enable
    /// continuous language identification.
    pub languages: Vec<String>,
    /// Target languages for per-result translation maps. Empty = none.
    pub target_languages: Vec<String>,
    /// Model path for local providers.
    pub model_path: Option<String>,
}

/// Speaker diarization configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DiarizationConfig {
    /// RMS energy above which a participant counts as speaking.
    pub speech_energy_threshold: f64,
    /// Window during which a segment's speaker may still be corrected.
    pub grace_period_ms: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: defaults::SAMPLE_RATE,
            min_buffer_duration_ms: defaults::MIN_BUFFER_DURATION_MS,
            ring_capacity_ms: defaults::RING_CAPACITY_MS,
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            srt_ports: PortRange::new(defaults::SRT_PORT_RANGE.0, defaults::SRT_PORT_RANGE.1),
            rtmp_ports: PortRange::new(defaults::RTMP_PORT_RANGE.0, defaults::RTMP_PORT_RANGE.1),
            websocket_ports: PortRange::new(
                defaults::WEBSOCKET_PORT_RANGE.0,
                defaults::WEBSOCKET_PORT_RANGE.1,
            ),
            decoder_command: defaults::DECODER_COMMAND.to_string(),
            retry_ceiling: defaults::WORKER_RETRY_CEILING,
            respawn_ceiling: defaults::WORKER_RESPAWN_CEILING,
        }
    }
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            provider: defaults::DEFAULT_PROVIDER.to_string(),
            languages: vec![defaults::DEFAULT_LANGUAGE.to_string()],
            target_languages: Vec::new(),
            model_path: None,
        }
    }
}

impl Default for DiarizationConfig {
    fn default() -> Self {
        Self {
            speech_energy_threshold: defaults::SPEECH_ENERGY_THRESHOLD,
            grace_period_ms: defaults::SPEAKER_GRACE_PERIOD_MS,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Returns an error if the file contains invalid TOML.
    /// Missing fields will use default values.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                crate::error::StreamscribeError::ConfigFileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                e.into()
            }
        })?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file or return defaults if file doesn't exist
    ///
    /// Only falls back to defaults when the file is missing. Invalid TOML
    /// or invalid values are still errors.
    pub fn load_or_default(path: &Path) -> crate::error::Result<Self> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(crate::error::StreamscribeError::ConfigFileNotFound { .. }) => {
                Ok(Self::default())
            }
            Err(e) => Err(e),
        }
    }

    /// Default configuration file location
    /// (`$XDG_CONFIG_HOME/streamscribe/config.toml`).
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("streamscribe")
            .join("config.toml")
    }

    /// Serialize the configuration to a TOML string.
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// Reject configurations the core cannot run with.
    ///
    /// Values are immutable for a session's lifetime, so bad ones must be
    /// caught here rather than surfacing mid-stream.
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::StreamscribeError;

        if self.audio.sample_rate == 0 {
            return Err(StreamscribeError::ConfigInvalidValue {
                key: "audio.sample_rate".to_string(),
                message: "must be non-zero".to_string(),
            });
        }
        if self.audio.min_buffer_duration_ms == 0 {
            return Err(StreamscribeError::ConfigInvalidValue {
                key: "audio.min_buffer_duration_ms".to_string(),
                message: "must be non-zero".to_string(),
            });
        }
        if self.audio.ring_capacity_ms < self.audio.min_buffer_duration_ms {
            return Err(StreamscribeError::ConfigInvalidValue {
                key: "audio.ring_capacity_ms".to_string(),
                message: "must be at least min_buffer_duration_ms".to_string(),
            });
        }
        for (key, range) in [
            ("ingest.srt_ports", self.ingest.srt_ports),
            ("ingest.rtmp_ports", self.ingest.rtmp_ports),
            ("ingest.websocket_ports", self.ingest.websocket_ports),
        ] {
            if range.start > range.end {
                return Err(StreamscribeError::ConfigInvalidValue {
                    key: key.to_string(),
                    message: format!("start {} exceeds end {}", range.start, range.end),
                });
            }
        }
        if self.recognition.languages.is_empty() {
            return Err(StreamscribeError::ConfigInvalidValue {
                key: "recognition.languages".to_string(),
                message: "at least one candidate language is required".to_string(),
            });
        }
        Ok(())
    }
}
