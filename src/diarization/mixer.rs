//! Conference audio mixing with energy-based dominant-speaker detection.
//!
//! Per-participant PCM is merged into one mixed stream on a fixed 20ms
//! cadence (320 samples at 16kHz). Each tick sums one frame per participant
//! with clipping, computes per-participant RMS energy, and picks the dominant
//! speaker among those above the speech threshold. A `speaker_changed` event
//! fires only when the dominant identity actually changes; silence is a
//! distinct identity.

use crate::defaults;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::mpsc;

/// A conference participant as seen by diarization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeakerInfo {
    pub id: String,
    pub name: String,
}

/// Dominant-speaker transition. `speaker: None` denotes silence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeakerChangeEvent {
    pub position_ms: u64,
    pub speaker: Option<SpeakerInfo>,
}

/// Mixer configuration.
#[derive(Debug, Clone)]
pub struct MixerConfig {
    /// RMS energy above which a participant counts as actively speaking.
    pub speech_energy_threshold: f64,
    /// Samples per mixing frame.
    pub frame_samples: usize,
    /// Per-participant ring capacity in frames.
    pub ring_frames: usize,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            speech_energy_threshold: defaults::SPEECH_ENERGY_THRESHOLD,
            frame_samples: defaults::MIX_FRAME_SAMPLES,
            ring_frames: defaults::PARTICIPANT_RING_FRAMES,
        }
    }
}

/// One participant's buffered samples, in first-seen order within the
/// mixer. Insertion order matters: dominant selection uses strict
/// greater-than, so earlier participants win energy ties.
struct ParticipantStream {
    id: String,
    name: String,
    samples: VecDeque<i16>,
}

/// Result of one mixing tick.
#[derive(Debug, Clone, PartialEq)]
pub struct MixTick {
    /// Mixed 16-bit LE frame; `None` when no participant had a full frame.
    pub frame: Option<Vec<u8>>,
    /// Emitted only on a dominant-speaker identity transition.
    pub speaker_change: Option<SpeakerChangeEvent>,
}

/// Merges N participant PCM streams and detects the dominant speaker.
pub struct AudioMixer {
    config: MixerConfig,
    participants: Vec<ParticipantStream>,
    position_ms: u64,
    current_speaker: Option<String>,
}

impl AudioMixer {
    pub fn new(config: MixerConfig) -> Self {
        Self {
            config,
            participants: Vec::new(),
            position_ms: 0,
            current_speaker: None,
        }
    }

    /// Buffers PCM for a participant, creating the entry on first sight
    /// and updating the display name when one is provided. Oldest samples
    /// are dropped when the participant's ring overruns.
    pub fn add_audio(&mut self, id: &str, pcm: &[u8], name: Option<&str>) {
        let capacity = self.config.ring_frames * self.config.frame_samples;
        let index = match self.participants.iter().position(|p| p.id == id) {
            Some(index) => index,
            None => {
                self.participants.push(ParticipantStream {
                    id: id.to_string(),
                    name: name.unwrap_or(id).to_string(),
                    samples: VecDeque::with_capacity(capacity),
                });
                self.participants.len() - 1
            }
        };
        let stream = &mut self.participants[index];
        if let Some(name) = name {
            stream.name = name.to_string();
        }

        for pair in pcm.chunks_exact(2) {
            stream.samples.push_back(i16::from_le_bytes([pair[0], pair[1]]));
        }
        while stream.samples.len() > capacity {
            stream.samples.pop_front();
        }
    }

    /// Runs one 20ms mixing tick.
    pub fn mix_tick(&mut self) -> MixTick {
        let frame_samples = self.config.frame_samples;
        let mut mixed = vec![0i32; frame_samples];
        let mut contributed = false;
        let mut dominant: Option<(usize, f64)> = None;

        for (index, stream) in self.participants.iter_mut().enumerate() {
            if stream.samples.len() < frame_samples {
                continue;
            }
            contributed = true;

            let mut sum_squares = 0.0f64;
            for slot in mixed.iter_mut() {
                let sample = stream.samples.pop_front().unwrap_or(0);
                *slot += sample as i32;
                sum_squares += (sample as f64) * (sample as f64);
            }
            let rms = (sum_squares / frame_samples as f64).sqrt();

            if rms > self.config.speech_energy_threshold {
                // Strict > keeps the earliest-seen participant on ties.
                let louder = dominant.map(|(_, best)| rms > best).unwrap_or(true);
                if louder {
                    dominant = Some((index, rms));
                }
            }
        }

        let dominant = dominant.map(|(index, _)| {
            let stream = &self.participants[index];
            SpeakerInfo {
                id: stream.id.clone(),
                name: stream.name.clone(),
            }
        });

        let speaker_change = if dominant.as_ref().map(|s| s.id.as_str())
            != self.current_speaker.as_deref()
        {
            self.current_speaker = dominant.as_ref().map(|s| s.id.clone());
            Some(SpeakerChangeEvent {
                position_ms: self.position_ms,
                speaker: dominant,
            })
        } else {
            None
        };

        let frame = contributed.then(|| {
            let mut pcm = Vec::with_capacity(frame_samples * 2);
            for sample in &mixed {
                let clipped = (*sample).clamp(i16::MIN as i32, i16::MAX as i32) as i16;
                pcm.extend_from_slice(&clipped.to_le_bytes());
            }
            pcm
        });
        if frame.is_some() {
            self.position_ms += defaults::MIX_FRAME_MS;
        }

        MixTick {
            frame,
            speaker_change,
        }
    }

    /// Removes a participant and its buffered audio.
    pub fn remove_participant(&mut self, id: &str) {
        self.participants.retain(|p| p.id != id);
    }

    /// Participants in first-seen order.
    pub fn participants(&self) -> Vec<SpeakerInfo> {
        self.participants
            .iter()
            .map(|p| SpeakerInfo {
                id: p.id.clone(),
                name: p.name.clone(),
            })
            .collect()
    }

    pub fn has_participant(&self, id: &str) -> bool {
        self.participants.iter().any(|p| p.id == id)
    }

    /// Position of the mixed stream in milliseconds.
    pub fn position_ms(&self) -> u64 {
        self.position_ms
    }

    /// Id of the current dominant speaker, if any.
    pub fn current_speaker(&self) -> Option<&str> {
        self.current_speaker.as_deref()
    }
}

/// Output of a running mixer task.
#[derive(Debug, Clone, PartialEq)]
pub enum MixerOutput {
    /// One mixed 20ms frame.
    Audio { pcm: Vec<u8>, position_ms: u64 },
    /// Dominant-speaker transition.
    SpeakerChanged(SpeakerChangeEvent),
}

/// Commands accepted by a running mixer task.
enum MixerCommand {
    AddAudio {
        id: String,
        pcm: Vec<u8>,
        name: Option<String>,
    },
    RemoveParticipant {
        id: String,
    },
    Shutdown,
}

/// Handle to a mixer task driven by its own 20ms interval.
#[derive(Clone)]
pub struct MixerHandle {
    commands: mpsc::Sender<MixerCommand>,
}

impl MixerHandle {
    pub async fn add_audio(&self, id: &str, pcm: Vec<u8>, name: Option<&str>) {
        let _ = self
            .commands
            .send(MixerCommand::AddAudio {
                id: id.to_string(),
                pcm,
                name: name.map(str::to_string),
            })
            .await;
    }

    pub async fn remove_participant(&self, id: &str) {
        let _ = self
            .commands
            .send(MixerCommand::RemoveParticipant { id: id.to_string() })
            .await;
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(MixerCommand::Shutdown).await;
    }
}

impl AudioMixer {
    /// Spawns the mixer on its own task, ticking every 20ms. Mixing and
    /// energy computation are synchronous within the tick; one mixer
    /// instance per conference, instances independent of each other.
    pub fn spawn(config: MixerConfig) -> (MixerHandle, mpsc::Receiver<MixerOutput>) {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(256);
        let (out_tx, out_rx) = mpsc::channel(256);
        let mut mixer = AudioMixer::new(config);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(defaults::MIX_FRAME_MS));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    command = cmd_rx.recv() => match command {
                        None | Some(MixerCommand::Shutdown) => break,
                        Some(MixerCommand::AddAudio { id, pcm, name }) => {
                            mixer.add_audio(&id, &pcm, name.as_deref());
                        }
                        Some(MixerCommand::RemoveParticipant { id }) => {
                            mixer.remove_participant(&id);
                        }
                    },
                    _ = ticker.tick() => {
                        let tick = mixer.mix_tick();
                        if let Some(change) = tick.speaker_change {
                            if out_tx.send(MixerOutput::SpeakerChanged(change)).await.is_err() {
                                break;
                            }
                        }
                        if let Some(pcm) = tick.frame {
                            let position_ms = mixer.position_ms();
                            if out_tx.send(MixerOutput::Audio { pcm, position_ms }).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        });

        (MixerHandle { commands: cmd_tx }, out_rx)
    }
}
