//! Speaker diarization: conference mixing and segment attribution.

pub mod mixer;
pub mod tracker;

pub use mixer::{AudioMixer, SpeakerChangeEvent, SpeakerInfo};
pub use tracker::{ParticipantUpdate, SpeakerTracker};
