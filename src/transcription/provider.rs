//! Pluggable recognition backend contract.
//!
//! Providers behave polymorphically over {start, stop, transcribe} and emit
//! one shared event vocabulary. Backend-native time units are converted at
//! this boundary: everything past it speaks seconds.

use crate::config::RecognitionConfig;
use crate::error::{Result, StreamscribeError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::mpsc;

/// 100-nanosecond ticks per second, the native offset unit of cloud
/// speech backends.
pub const TICKS_PER_SECOND: f64 = 10_000_000.0;

/// Converts backend-native 100ns ticks to seconds.
pub fn ticks_to_secs(ticks: u64) -> f64 {
    ticks as f64 / TICKS_PER_SECOND
}

/// Fixed taxonomy recognition failures are classified into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    AuthenticationFailure,
    BadRequestParameters,
    TooManyRequests,
    ConnectionFailure,
    ServiceTimeout,
    ServiceError,
    RuntimeError,
    Forbidden,
}

impl ErrorCode {
    /// Stable numeric code used on the wire.
    pub fn code(&self) -> u8 {
        match self {
            ErrorCode::AuthenticationFailure => 1,
            ErrorCode::BadRequestParameters => 2,
            ErrorCode::TooManyRequests => 3,
            ErrorCode::ConnectionFailure => 4,
            ErrorCode::ServiceTimeout => 5,
            ErrorCode::ServiceError => 6,
            ErrorCode::RuntimeError => 7,
            ErrorCode::Forbidden => 8,
        }
    }

    /// Parses a wire code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(ErrorCode::AuthenticationFailure),
            2 => Some(ErrorCode::BadRequestParameters),
            3 => Some(ErrorCode::TooManyRequests),
            4 => Some(ErrorCode::ConnectionFailure),
            5 => Some(ErrorCode::ServiceTimeout),
            6 => Some(ErrorCode::ServiceError),
            7 => Some(ErrorCode::RuntimeError),
            8 => Some(ErrorCode::Forbidden),
            _ => None,
        }
    }

    /// Human-readable text surfaced in the synthesized final transcript.
    pub fn message(&self) -> &'static str {
        match self {
            ErrorCode::AuthenticationFailure => {
                "Transcription failed: authentication failure, check credentials"
            }
            ErrorCode::BadRequestParameters => {
                "Transcription failed: invalid or unsupported request parameters"
            }
            ErrorCode::TooManyRequests => {
                "Transcription failed: request rate limit exceeded"
            }
            ErrorCode::ConnectionFailure => {
                "Transcription failed: connection to the recognition service was lost"
            }
            ErrorCode::ServiceTimeout => {
                "Transcription failed: the recognition service timed out"
            }
            ErrorCode::ServiceError => {
                "Transcription failed: the recognition service reported an error"
            }
            ErrorCode::RuntimeError => "Transcription failed: runtime error",
            ErrorCode::Forbidden => {
                "Transcription failed: access to the recognition service is forbidden"
            }
        }
    }

    /// Trust and authorization failures must propagate immediately; a
    /// retry cannot fix them.
    pub fn retriable(&self) -> bool {
        !matches!(self, ErrorCode::AuthenticationFailure | ErrorCode::Forbidden)
    }
}

/// Events emitted by a recognition backend.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    Connecting,
    Ready,
    /// Non-terminal hypothesis, subject to revision.
    Transcribing {
        text: String,
        translations: HashMap<String, String>,
    },
    /// Terminal result for a time span. Offsets are seconds; `None` when
    /// the backend has no native offsets (the engine computes them).
    Transcribed {
        text: String,
        start: Option<f64>,
        end: Option<f64>,
        language: String,
        translations: HashMap<String, String>,
    },
    Error {
        code: ErrorCode,
    },
    Closed {
        code: i32,
        reason: String,
    },
}

/// Recognition profile selecting and parameterizing a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderProfile {
    pub provider: String,
    /// One entry fixes the language; several enable continuous language
    /// identification in the backend.
    pub languages: Vec<String>,
    /// Per-result translation targets. Empty yields empty maps.
    pub target_languages: Vec<String>,
    pub model_path: Option<String>,
}

impl ProviderProfile {
    pub fn from_config(config: &RecognitionConfig) -> Self {
        Self {
            provider: config.provider.clone(),
            languages: config.languages.clone(),
            target_languages: config.target_languages.clone(),
            model_path: config.model_path.clone(),
        }
    }
}

/// Recognition backend capability set.
///
/// Events flow through the receiver handed out by `take_events`, taken
/// exactly once at attach time.
#[async_trait]
pub trait RecognitionProvider: Send + Sync {
    /// Connects the backend and begins a recognition session.
    async fn start(&mut self) -> Result<()>;

    /// Ends the session. Best-effort and idempotent.
    async fn stop(&mut self);

    /// Feeds one PCM chunk (16-bit LE mono 16kHz) to the backend.
    async fn transcribe(&mut self, pcm: &[u8]) -> Result<()>;

    /// Hands out the event receiver. Returns `None` after the first call.
    fn take_events(&mut self) -> Option<mpsc::Receiver<ProviderEvent>>;
}

/// Builds the provider named by the profile.
///
/// An unknown name is a configuration error: fail fast, no retry.
pub fn build_provider(profile: &ProviderProfile) -> Result<Box<dyn RecognitionProvider>> {
    match profile.provider.as_str() {
        "mock" => Ok(Box::new(MockProvider::new(profile.clone()))),
        #[cfg(feature = "whisper")]
        "whisper" => Ok(Box::new(crate::transcription::whisper::WhisperProvider::new(
            profile.clone(),
        )?)),
        other => Err(StreamscribeError::UnknownProvider {
            name: other.to_string(),
        }),
    }
}

/// One scripted reaction of the mock backend to a `transcribe` call.
#[derive(Debug, Clone)]
pub enum MockResult {
    /// Partial hypothesis.
    Partial { text: String },
    /// Final result with native offsets in 100ns ticks, converted at the
    /// boundary like a cloud backend's payload.
    FinalTicks {
        text: String,
        offset_ticks: u64,
        duration_ticks: u64,
        language: String,
    },
    /// Final result without native offsets.
    Final { text: String },
    /// Backend failure.
    Error { code: ErrorCode },
}

/// Mock recognition backend for testing the engine and orchestrator.
pub struct MockProvider {
    profile: ProviderProfile,
    script: Vec<MockResult>,
    next: usize,
    tx: mpsc::Sender<ProviderEvent>,
    rx: Option<mpsc::Receiver<ProviderEvent>>,
    received: Vec<Vec<u8>>,
    fail_start: bool,
}

impl MockProvider {
    pub fn new(profile: ProviderProfile) -> Self {
        let (tx, rx) = mpsc::channel(256);
        Self {
            profile,
            script: Vec::new(),
            next: 0,
            tx,
            rx: Some(rx),
            received: Vec::new(),
            fail_start: false,
        }
    }

    /// Configures the reactions to successive `transcribe` calls. Calls
    /// beyond the script fall back to a default final result.
    pub fn with_script(mut self, script: Vec<MockResult>) -> Self {
        self.script = script;
        self
    }

    /// Makes `start` fail with a connection error.
    pub fn with_start_failure(mut self) -> Self {
        self.fail_start = true;
        self
    }

    /// PCM chunks received so far.
    pub fn received(&self) -> &[Vec<u8>] {
        &self.received
    }

    fn detected_language(&self) -> String {
        self.profile
            .languages
            .first()
            .cloned()
            .unwrap_or_else(|| "en".to_string())
    }

    fn translations_for(&self, text: &str) -> HashMap<String, String> {
        self.profile
            .target_languages
            .iter()
            .map(|lang| (lang.clone(), format!("[{}] {}", lang, text)))
            .collect()
    }

    async fn emit(&self, event: ProviderEvent) {
        let _ = self.tx.send(event).await;
    }
}

#[async_trait]
impl RecognitionProvider for MockProvider {
    async fn start(&mut self) -> Result<()> {
        self.emit(ProviderEvent::Connecting).await;
        if self.fail_start {
            self.emit(ProviderEvent::Error {
                code: ErrorCode::ConnectionFailure,
            })
            .await;
            return Err(StreamscribeError::Recognition {
                message: "mock start failure".to_string(),
            });
        }
        self.emit(ProviderEvent::Ready).await;
        Ok(())
    }

    async fn stop(&mut self) {
        self.emit(ProviderEvent::Closed {
            code: 0,
            reason: "stopped".to_string(),
        })
        .await;
    }

    async fn transcribe(&mut self, pcm: &[u8]) -> Result<()> {
        self.received.push(pcm.to_vec());

        let result = if self.next < self.script.len() {
            let result = self.script[self.next].clone();
            self.next += 1;
            result
        } else {
            MockResult::Final {
                text: "mock transcription".to_string(),
            }
        };

        match result {
            MockResult::Partial { text } => {
                let translations = self.translations_for(&text);
                self.emit(ProviderEvent::Transcribing { text, translations }).await;
            }
            MockResult::FinalTicks {
                text,
                offset_ticks,
                duration_ticks,
                language,
            } => {
                let translations = self.translations_for(&text);
                let start = ticks_to_secs(offset_ticks);
                let end = ticks_to_secs(offset_ticks + duration_ticks);
                self.emit(ProviderEvent::Transcribed {
                    text,
                    start: Some(start),
                    end: Some(end),
                    language,
                    translations,
                })
                .await;
            }
            MockResult::Final { text } => {
                let translations = self.translations_for(&text);
                let language = self.detected_language();
                self.emit(ProviderEvent::Transcribed {
                    text,
                    start: None,
                    end: None,
                    language,
                    translations,
                })
                .await;
            }
            MockResult::Error { code } => {
                self.emit(ProviderEvent::Error { code }).await;
            }
        }
        Ok(())
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<ProviderEvent>> {
        self.rx.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> ProviderProfile {
        ProviderProfile {
            provider: "mock".to_string(),
            languages: vec!["en".to_string()],
            target_languages: Vec::new(),
            model_path: None,
        }
    }

    #[test]
    fn test_error_code_roundtrip() {
        for code in 1..=8u8 {
            let parsed = ErrorCode::from_code(code).expect("known code");
            assert_eq!(parsed.code(), code);
        }
        assert_eq!(ErrorCode::from_code(0), None);
        assert_eq!(ErrorCode::from_code(9), None);
    }

    #[test]
    fn test_trust_failures_are_not_retriable() {
        assert!(!ErrorCode::AuthenticationFailure.retriable());
        assert!(!ErrorCode::Forbidden.retriable());
        assert!(ErrorCode::ConnectionFailure.retriable());
        assert!(ErrorCode::ServiceTimeout.retriable());
    }

    #[test]
    fn test_ticks_to_secs() {
        assert_eq!(ticks_to_secs(10_000_000), 1.0);
        assert_eq!(ticks_to_secs(2_500_000), 0.25);
        assert_eq!(ticks_to_secs(0), 0.0);
    }

    #[test]
    fn test_unknown_provider_fails_fast() {
        let mut bad = profile();
        bad.provider = "acme".to_string();
        assert!(matches!(
            build_provider(&bad),
            Err(StreamscribeError::UnknownProvider { .. })
        ));
    }

    #[tokio::test]
    async fn test_mock_provider_start_emits_connecting_then_ready() {
        let mut provider = MockProvider::new(profile());
        let mut events = provider.take_events().expect("events");
        provider.start().await.expect("start");

        assert_eq!(events.recv().await, Some(ProviderEvent::Connecting));
        assert_eq!(events.recv().await, Some(ProviderEvent::Ready));
    }

    #[tokio::test]
    async fn test_mock_provider_converts_ticks_at_boundary() {
        let mut provider = MockProvider::new(profile()).with_script(vec![MockResult::FinalTicks {
            text: "hello".to_string(),
            offset_ticks: 10_000_000,
            duration_ticks: 5_000_000,
            language: "en".to_string(),
        }]);
        let mut events = provider.take_events().expect("events");
        provider.start().await.expect("start");
        provider.transcribe(&[0u8; 64]).await.expect("transcribe");

        // Skip Connecting/Ready
        events.recv().await;
        events.recv().await;
        match events.recv().await {
            Some(ProviderEvent::Transcribed { start, end, .. }) => {
                assert_eq!(start, Some(1.0));
                assert_eq!(end, Some(1.5));
            }
            other => panic!("expected transcribed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_mock_provider_translation_map() {
        let mut p = profile();
        p.target_languages = vec!["de".to_string(), "fr".to_string()];
        let mut provider = MockProvider::new(p);
        let mut events = provider.take_events().expect("events");
        provider.transcribe(&[0u8; 8]).await.expect("transcribe");

        match events.recv().await {
            Some(ProviderEvent::Transcribed { translations, .. }) => {
                assert_eq!(translations.len(), 2);
                assert_eq!(translations.get("de"), Some(&"[de] mock transcription".to_string()));
            }
            other => panic!("expected transcribed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_mock_provider_empty_translations_without_targets() {
        let mut provider = MockProvider::new(profile());
        let mut events = provider.take_events().expect("events");
        provider.transcribe(&[0u8; 8]).await.expect("transcribe");

        match events.recv().await {
            Some(ProviderEvent::Transcribed { translations, .. }) => {
                assert!(translations.is_empty());
            }
            other => panic!("expected transcribed, got {:?}", other),
        }
    }
}
