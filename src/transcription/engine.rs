//! Transcription engine: finite-state wrapper around one recognition backend.
//!
//! The engine owns exactly one active provider at a time, maps backend
//! failures through the fixed error taxonomy, and guarantees that a
//! transcript stream never ends without a terminal event: any backend error
//! is surfaced as one synthesized final transcript before the engine parks
//! in `Error`.

use crate::clock::{Clock, SystemClock};
use crate::transcription::provider::{
    ErrorCode, ProviderEvent, ProviderProfile, RecognitionProvider, build_provider,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::mpsc;

/// Engine lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No provider attached yet, or connect in flight.
    Connecting,
    /// Provider connected and idle.
    Ready,
    /// Results are flowing.
    Transcribing,
    /// Terminal failure; a final transcript has been emitted.
    Error,
    /// Session ended.
    Closed,
}

/// Transcript result kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptKind {
    /// Non-terminal, subject to revision.
    Partial,
    /// Terminal for its time span.
    Final,
}

/// A recognized utterance leaving the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEvent {
    pub kind: TranscriptKind,
    /// Groups partials with the final that closes them.
    pub segment_id: u64,
    pub text: String,
    /// Offsets in seconds relative to the session start.
    pub start: f64,
    pub end: f64,
    pub language: String,
    /// Filled in by the speaker tracker in conference mode.
    pub speaker: Option<String>,
    /// Per-target-language translations; empty without configured targets.
    pub translations: HashMap<String, String>,
}

/// Finite-state wrapper around a pluggable recognition backend.
pub struct TranscriptionEngine<C: Clock = SystemClock> {
    state: EngineState,
    profile: Option<ProviderProfile>,
    provider: Option<Box<dyn RecognitionProvider>>,
    events: Option<mpsc::Receiver<ProviderEvent>>,
    min_buffer_duration_ms: u64,
    session_start: Option<Instant>,
    last_result_at: Option<Instant>,
    last_end: f64,
    segment_seq: u64,
    open_segment: Option<u64>,
    last_error: Option<ErrorCode>,
    clock: C,
}

impl TranscriptionEngine<SystemClock> {
    pub fn new(min_buffer_duration_ms: u64) -> Self {
        Self::with_clock(min_buffer_duration_ms, SystemClock)
    }
}

impl<C: Clock> TranscriptionEngine<C> {
    pub fn with_clock(min_buffer_duration_ms: u64, clock: C) -> Self {
        Self {
            state: EngineState::Connecting,
            profile: None,
            provider: None,
            events: None,
            min_buffer_duration_ms,
            session_start: None,
            last_result_at: None,
            last_end: 0.0,
            segment_seq: 0,
            open_segment: None,
            last_error: None,
            clock,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Last final end offset in seconds.
    pub fn last_end_offset(&self) -> f64 {
        self.last_end
    }

    /// Taxonomy code of the backend error the engine parked on, if any.
    /// The orchestrator consults it to decide between an engine restart
    /// and marking the channel failed.
    pub fn last_error_code(&self) -> Option<ErrorCode> {
        self.last_error
    }

    /// Swaps the active backend.
    ///
    /// The previous backend is stopped and its event stream dropped before
    /// the new one is attached, so no stale or duplicate events can reach
    /// the engine.
    pub async fn configure(&mut self, profile: ProviderProfile) -> crate::error::Result<()> {
        if let Some(mut old) = self.provider.take() {
            self.events = None;
            old.stop().await;
        }

        let mut provider = build_provider(&profile)?;
        self.events = provider.take_events();
        self.provider = Some(provider);
        self.profile = Some(profile);
        self.state = EngineState::Connecting;
        self.last_error = None;
        Ok(())
    }

    /// Attaches an already-built backend instead of building one from a
    /// profile. Used to inject scripted backends.
    pub fn attach_provider(&mut self, mut provider: Box<dyn RecognitionProvider>) {
        self.events = provider.take_events();
        self.provider = Some(provider);
        self.state = EngineState::Connecting;
        self.last_error = None;
    }

    /// Rebuilds the backend from the stored profile and begins a new
    /// session. Offsets continue from the last final, so transcripts
    /// stay monotonic across the restart.
    pub async fn restart(&mut self) -> crate::error::Result<()> {
        let profile = self
            .profile
            .clone()
            .ok_or(crate::error::StreamscribeError::NoProvider)?;
        self.configure(profile).await?;
        let provider = self
            .provider
            .as_mut()
            .ok_or(crate::error::StreamscribeError::NoProvider)?;
        self.last_result_at = Some(self.clock.now());
        provider.start().await
    }

    /// Begins the recognition session and records its start timestamp,
    /// the base for wall-clock offset computation.
    pub async fn start_transcription(&mut self) -> crate::error::Result<()> {
        let provider = self
            .provider
            .as_mut()
            .ok_or(crate::error::StreamscribeError::NoProvider)?;
        let now = self.clock.now();
        self.session_start = Some(now);
        self.last_result_at = Some(now);
        self.last_end = 0.0;
        provider.start().await
    }

    /// Ends the recognition session. Best-effort and idempotent.
    pub async fn stop_transcription(&mut self) {
        if let Some(provider) = self.provider.as_mut() {
            provider.stop().await;
        }
        self.state = EngineState::Closed;
    }

    /// Forwards one PCM chunk to the active backend. Without a backend
    /// this is a logged no-op.
    pub async fn transcribe(&mut self, pcm: &[u8]) -> crate::error::Result<()> {
        match self.provider.as_mut() {
            Some(provider) => provider.transcribe(pcm).await,
            None => {
                tracing::warn!("transcribe called with no provider attached");
                Ok(())
            }
        }
    }

    /// Waits for the next transcript event from the active backend,
    /// driving the engine state machine on the way.
    ///
    /// Pends forever while no backend is attached, so it can sit in a
    /// select loop alongside other event sources.
    pub async fn next_event(&mut self) -> Option<TranscriptEvent> {
        loop {
            let event = match self.events.as_mut() {
                Some(rx) => rx.recv().await,
                None => std::future::pending().await,
            };

            match event {
                Some(event) => {
                    if let Some(transcript) = self.apply(event) {
                        return Some(transcript);
                    }
                }
                None => {
                    // Backend event stream ended.
                    self.events = None;
                    if self.state != EngineState::Error {
                        self.state = EngineState::Closed;
                    }
                    return None;
                }
            }
        }
    }

    /// Applies one backend event to the state machine, producing a
    /// transcript event where the vocabulary calls for one.
    fn apply(&mut self, event: ProviderEvent) -> Option<TranscriptEvent> {
        match event {
            ProviderEvent::Connecting => {
                self.state = EngineState::Connecting;
                None
            }
            ProviderEvent::Ready => {
                self.state = EngineState::Ready;
                None
            }
            ProviderEvent::Transcribing { text, translations } => {
                self.state = EngineState::Transcribing;
                let segment_id = self.open_or_current_segment();
                Some(TranscriptEvent {
                    kind: TranscriptKind::Partial,
                    segment_id,
                    text,
                    start: self.last_end,
                    end: self.last_end,
                    language: self.configured_language(),
                    speaker: None,
                    translations,
                })
            }
            ProviderEvent::Transcribed {
                text,
                start,
                end,
                language,
                translations,
            } => {
                self.state = EngineState::Transcribing;
                let segment_id = self.open_or_current_segment();
                self.open_segment = None;

                let (start, end) = match (start, end) {
                    (Some(start), Some(end)) => (start, end),
                    // Backend without native offsets: approximate from
                    // wall clock, tied to the flush cadence which is
                    // bounded below by min_buffer_duration_ms.
                    _ => self.wall_clock_span(),
                };
                self.last_end = end;
                self.last_result_at = Some(self.clock.now());

                Some(TranscriptEvent {
                    kind: TranscriptKind::Final,
                    segment_id,
                    text,
                    start,
                    end,
                    language,
                    speaker: None,
                    translations,
                })
            }
            ProviderEvent::Error { code } => {
                // Always one terminating utterance, even on failure.
                tracing::error!(code = code.code(), "recognition backend error");
                let segment_id = self.open_or_current_segment();
                self.open_segment = None;
                self.state = EngineState::Error;
                self.last_error = Some(code);
                Some(TranscriptEvent {
                    kind: TranscriptKind::Final,
                    segment_id,
                    text: code.message().to_string(),
                    start: self.last_end,
                    end: self.last_end,
                    language: self.configured_language(),
                    speaker: None,
                    translations: HashMap::new(),
                })
            }
            ProviderEvent::Closed { code, reason } => {
                tracing::info!(code, reason = %reason, "recognition backend closed");
                if self.state != EngineState::Error {
                    self.state = EngineState::Closed;
                }
                None
            }
        }
    }

    /// Synthesizes the terminal transcript for a failure that did not
    /// come from the backend (e.g. an unrecoverable transport error).
    /// Preserves the invariant that a transcript stream never ends
    /// without an explicit marker.
    pub fn synthesize_failure(&mut self, text: &str) -> TranscriptEvent {
        let segment_id = self.open_or_current_segment();
        self.open_segment = None;
        self.state = EngineState::Error;
        TranscriptEvent {
            kind: TranscriptKind::Final,
            segment_id,
            text: text.to_string(),
            start: self.last_end,
            end: self.last_end,
            language: self.configured_language(),
            speaker: None,
            translations: HashMap::new(),
        }
    }

    /// Computes `[last_end, last_end + (elapsed - min_buffer)/1000]` for
    /// backends without native offsets.
    fn wall_clock_span(&self) -> (f64, f64) {
        let elapsed_ms = self
            .last_result_at
            .map(|at| self.clock.now().duration_since(at).as_millis() as u64)
            .unwrap_or(0);
        let delta_ms = elapsed_ms.saturating_sub(self.min_buffer_duration_ms);
        let start = self.last_end;
        (start, start + delta_ms as f64 / 1000.0)
    }

    fn open_or_current_segment(&mut self) -> u64 {
        match self.open_segment {
            Some(id) => id,
            None => {
                let id = self.segment_seq;
                self.segment_seq += 1;
                self.open_segment = Some(id);
                id
            }
        }
    }

    fn configured_language(&self) -> String {
        self.profile
            .as_ref()
            .and_then(|p| p.languages.first().cloned())
            .unwrap_or_else(|| "en".to_string())
    }
}
