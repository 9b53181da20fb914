//! Transcription over pluggable recognition backends.

pub mod engine;
pub mod provider;
#[cfg(feature = "whisper")]
pub mod whisper;

pub use engine::{EngineState, TranscriptEvent, TranscriptKind, TranscriptionEngine};
pub use provider::{ErrorCode, ProviderProfile, RecognitionProvider};
