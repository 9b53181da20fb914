//! Local Whisper recognition backend.
//!
//! Wraps `whisper-rs` behind the provider contract. Whisper has no native
//! stream offsets, so finals carry `None` and the engine computes wall-clock
//! spans. Requires the `whisper` feature and cmake to build:
//!
//! ```bash
//! cargo build --features whisper
//! ```

use crate::error::{Result, StreamscribeError};
use crate::transcription::provider::{ProviderEvent, ProviderProfile, RecognitionProvider};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Once};
use tokio::sync::mpsc;
use whisper_rs::{
    FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters, install_logging_hooks,
};

static LOGGING_HOOKS_INSTALLED: Once = Once::new();

/// Recognition provider backed by a local Whisper model.
///
/// The context is shared behind a mutex; inference runs on the blocking
/// pool so a long decode never stalls the channel runtime.
pub struct WhisperProvider {
    context: Arc<Mutex<WhisperContext>>,
    /// `None` enables Whisper's own language detection.
    language: Option<String>,
    tx: mpsc::Sender<ProviderEvent>,
    rx: Option<mpsc::Receiver<ProviderEvent>>,
}

impl WhisperProvider {
    pub fn new(profile: ProviderProfile) -> Result<Self> {
        // Route whisper.cpp's native logging through tracing (once).
        LOGGING_HOOKS_INSTALLED.call_once(|| {
            install_logging_hooks();
        });

        let model_path = PathBuf::from(profile.model_path.clone().ok_or_else(|| {
            StreamscribeError::ConfigInvalidValue {
                key: "recognition.model_path".to_string(),
                message: "whisper provider requires a model path".to_string(),
            }
        })?);
        if !model_path.exists() {
            return Err(StreamscribeError::ModelNotFound {
                path: model_path.to_string_lossy().to_string(),
            });
        }

        let context = WhisperContext::new_with_params(
            model_path
                .to_str()
                .ok_or_else(|| StreamscribeError::Recognition {
                    message: "invalid UTF-8 in model path".to_string(),
                })?,
            WhisperContextParameters::default(),
        )
        .map_err(|e| StreamscribeError::Recognition {
            message: format!("failed to load Whisper model: {}", e),
        })?;

        // One candidate fixes the language; several defer to detection.
        let language = match profile.languages.as_slice() {
            [single] if single != "auto" => Some(single.clone()),
            _ => None,
        };

        let (tx, rx) = mpsc::channel(256);
        Ok(Self {
            context: Arc::new(Mutex::new(context)),
            language,
            tx,
            rx: Some(rx),
        })
    }

    /// Converts 16-bit LE PCM bytes to the normalized f32 samples Whisper
    /// consumes.
    fn convert_audio(pcm: &[u8]) -> Vec<f32> {
        pcm.chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
            .collect()
    }

    fn run_inference(
        context: &Mutex<WhisperContext>,
        language: Option<&str>,
        samples: &[f32],
    ) -> Result<(String, String)> {
        let context = context.lock().map_err(|e| StreamscribeError::Recognition {
            message: format!("failed to acquire context lock: {}", e),
        })?;
        let mut state = context
            .create_state()
            .map_err(|e| StreamscribeError::Recognition {
                message: format!("failed to create Whisper state: {}", e),
            })?;

        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
        params.set_language(language);
        params.set_print_special(false);
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_timestamps(false);

        state
            .full(params, samples)
            .map_err(|e| StreamscribeError::Recognition {
                message: format!("Whisper inference failed: {}", e),
            })?;

        let lang_id = state.full_lang_id_from_state();
        let detected = whisper_rs::get_lang_str(lang_id).unwrap_or("").to_string();

        let mut text = String::new();
        for segment in state.as_iter() {
            text.push_str(&segment.to_string());
        }
        Ok((text.trim().to_string(), detected))
    }
}

#[async_trait]
impl RecognitionProvider for WhisperProvider {
    async fn start(&mut self) -> Result<()> {
        let _ = self.tx.send(ProviderEvent::Connecting).await;
        // The model is already loaded; there is no remote session.
        let _ = self.tx.send(ProviderEvent::Ready).await;
        Ok(())
    }

    async fn stop(&mut self) {
        let _ = self
            .tx
            .send(ProviderEvent::Closed {
                code: 0,
                reason: "stopped".to_string(),
            })
            .await;
    }

    async fn transcribe(&mut self, pcm: &[u8]) -> Result<()> {
        let samples = Self::convert_audio(pcm);
        let context = self.context.clone();
        let language = self.language.clone();
        let tx = self.tx.clone();

        tokio::task::spawn_blocking(move || {
            match WhisperProvider::run_inference(&context, language.as_deref(), &samples) {
                Ok((text, detected)) => {
                    if text.is_empty() {
                        return;
                    }
                    let _ = tx.blocking_send(ProviderEvent::Transcribing {
                        text: text.clone(),
                        translations: Default::default(),
                    });
                    let _ = tx.blocking_send(ProviderEvent::Transcribed {
                        text,
                        start: None,
                        end: None,
                        language: detected,
                        translations: Default::default(),
                    });
                }
                Err(e) => {
                    tracing::error!(error = %e, "whisper inference failed");
                    let _ = tx.blocking_send(ProviderEvent::Error {
                        code: crate::transcription::provider::ErrorCode::RuntimeError,
                    });
                }
            }
        });
        Ok(())
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<ProviderEvent>> {
        self.rx.take()
    }
}
