//! Multi-transport stream ingestion.
//!
//! One isolated worker process per active stream, each owning a dynamically
//! allocated listener port and an external decode pipeline. The orchestrator
//! supervises workers, applies the buffer flush policy, and drives the
//! transcription and diarization stages.

pub mod decode;
pub mod orchestrator;
pub mod ports;
pub mod protocol;
pub mod worker;

pub use orchestrator::{ChannelMode, ChannelOutput, ChannelStatus, StreamOrchestrator};
pub use ports::TransportKind;
