//! streamscribe - Live-stream speech transcription
//!
//! Ingests live audio over SRT, RTMP, and WebSocket, transcribes it through
//! pluggable recognition backends, and attributes recognized text to speakers
//! in multi-participant conferences.

#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

pub mod audio;
pub mod cli;
pub mod clock;
pub mod config;
pub mod defaults;
pub mod diarization;
pub mod error;
pub mod ingest;
pub mod transcription;

// Core traits (ingest → transcribe → attribute)
pub use ingest::decode::{DecodePipeline, PipelineFactory};
pub use ingest::orchestrator::WorkerSpawner;
pub use transcription::provider::RecognitionProvider;

// Orchestration
pub use ingest::orchestrator::{ChannelMode, ChannelOutput, ChannelStatus, StreamOrchestrator};
pub use ingest::ports::TransportKind;

// Transcription
pub use transcription::engine::{TranscriptEvent, TranscriptKind, TranscriptionEngine};
pub use transcription::provider::{ErrorCode, ProviderProfile};

// Diarization
pub use diarization::mixer::{AudioMixer, SpeakerChangeEvent, SpeakerInfo};
pub use diarization::tracker::{ParticipantUpdate, SpeakerTracker};

// Error handling
pub use error::{Result, StreamscribeError};

// Config
pub use config::Config;

/// Build version string with optional git commit hash.
///
/// Returns `"0.3.1+abc1234"` when git hash is available, `"0.3.1"` otherwise.
pub fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("GIT_HASH") {
        Some(hash) if !hash.is_empty() => format!("{}+{}", version, hash),
        _ => version.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_string_starts_with_cargo_version() {
        let ver = version_string();
        assert!(
            ver.starts_with(env!("CARGO_PKG_VERSION")),
            "version_string should start with CARGO_PKG_VERSION, got: {}",
            ver
        );
    }
}
