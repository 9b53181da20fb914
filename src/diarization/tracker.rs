//! Segment-to-speaker correlation.
//!
//! Speaker-change events and ASR partials arrive asynchronously and can
//! cross: a change event for a segment frequently lands just after the
//! segment's first partial. The tracker assigns each segment a speaker on
//! first reference and lets a late change event rewrite it — but only while
//! the assignment is younger than the grace period, and never with silence.
//! Once a final transcript has been delivered the segment is cleared, so the
//! index stays bounded.

use crate::clock::{Clock, SystemClock};
use crate::defaults;
use crate::diarization::mixer::{SpeakerChangeEvent, SpeakerInfo};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Participant roster change from the conferencing collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParticipantUpdate {
    Join { id: String, name: String },
    Leave { id: String },
}

struct SegmentAssignment {
    speaker: Option<SpeakerInfo>,
    assigned_at: Instant,
}

/// Correlates dominant-speaker events with transcript segments.
pub struct SpeakerTracker<C: Clock = SystemClock> {
    participants: HashMap<String, String>,
    current_speaker: Option<SpeakerInfo>,
    last_known_speaker: Option<SpeakerInfo>,
    segments: HashMap<u64, SegmentAssignment>,
    grace_period: Duration,
    clock: C,
}

impl SpeakerTracker<SystemClock> {
    pub fn new(grace_period_ms: u64) -> Self {
        Self::with_clock(grace_period_ms, SystemClock)
    }
}

impl Default for SpeakerTracker<SystemClock> {
    fn default() -> Self {
        Self::new(defaults::SPEAKER_GRACE_PERIOD_MS)
    }
}

impl<C: Clock> SpeakerTracker<C> {
    pub fn with_clock(grace_period_ms: u64, clock: C) -> Self {
        Self {
            participants: HashMap::new(),
            current_speaker: None,
            last_known_speaker: None,
            segments: HashMap::new(),
            grace_period: Duration::from_millis(grace_period_ms),
            clock,
        }
    }

    /// Applies a join or leave from the conferencing collaborator.
    pub fn update_participant(&mut self, update: ParticipantUpdate) {
        match update {
            ParticipantUpdate::Join { id, name } => {
                self.participants.insert(id, name);
            }
            ParticipantUpdate::Leave { id } => {
                self.participants.remove(&id);
            }
        }
    }

    /// Display name for a participant; absent ids fall back to the raw id.
    pub fn display_name(&self, id: &str) -> String {
        self.participants
            .get(id)
            .cloned()
            .unwrap_or_else(|| id.to_string())
    }

    /// Applies a dominant-speaker change.
    ///
    /// A non-null speaker also rewrites every still-open assignment within
    /// the grace period — the change event may have lost the race against
    /// the segment's first partial. Silence updates the current speaker
    /// but never retroactively clears an assignment.
    pub fn add_speaker_change(&mut self, event: SpeakerChangeEvent) {
        self.current_speaker = event.speaker.clone();

        let Some(speaker) = event.speaker else {
            return;
        };
        self.last_known_speaker = Some(speaker.clone());

        let now = self.clock.now();
        for assignment in self.segments.values_mut() {
            if now.duration_since(assignment.assigned_at) < self.grace_period {
                assignment.speaker = Some(speaker.clone());
            }
        }
    }

    /// Assigns a speaker to a segment on its first reference. Idempotent:
    /// repeat calls never change an existing assignment — only
    /// `add_speaker_change` can, and only within the grace period.
    pub fn assign_speaker_to_segment(&mut self, segment_id: u64) {
        if self.segments.contains_key(&segment_id) {
            return;
        }
        let speaker = self
            .current_speaker
            .clone()
            .or_else(|| self.last_known_speaker.clone());
        self.segments.insert(
            segment_id,
            SegmentAssignment {
                speaker,
                assigned_at: self.clock.now(),
            },
        );
    }

    /// Speaker assigned to a segment, `None` for unknown or cleared ids.
    pub fn speaker_for_segment(&self, segment_id: u64) -> Option<SpeakerInfo> {
        self.segments
            .get(&segment_id)
            .and_then(|assignment| assignment.speaker.clone())
    }

    /// Drops a segment's assignment. Called after the segment's final
    /// transcript has been emitted; keeps the index bounded.
    pub fn clear_segment(&mut self, segment_id: u64) {
        self.segments.remove(&segment_id);
    }

    /// Full reset: roster, speaker state, and all assignments.
    pub fn clear(&mut self) {
        self.participants.clear();
        self.current_speaker = None;
        self.last_known_speaker = None;
        self.segments.clear();
    }

    /// Number of open segment assignments.
    pub fn open_segments(&self) -> usize {
        self.segments.len()
    }
}
