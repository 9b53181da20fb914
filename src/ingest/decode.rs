//! Native media-decode pipeline boundary.
//!
//! Demuxing and resampling are an external collaborator: the core hands a
//! transport URI in and takes 16-bit LE mono PCM at 16kHz out. The default
//! implementation shells out to a decoder command (ffmpeg by default) in its
//! own child process — a decoder crash takes down only that process.

use crate::error::{Result, StreamscribeError};
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};

/// Read size for decoder stdout. 4096 bytes is 128ms of audio at
/// 16kHz/16-bit, small enough to keep ingestion latency low.
const READ_CHUNK_BYTES: usize = 4096;

/// Events produced by a running decode pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    /// The pipeline is listening and accepts publisher data.
    Ready,
    /// One decoded PCM chunk.
    Pcm(Vec<u8>),
    /// The upstream publisher disconnected cleanly.
    Eos,
    /// The pipeline failed.
    Error(String),
}

/// One attached decode pipeline instance.
///
/// Implementations deliver their events through the receiver returned by
/// `start`; `shutdown` is best-effort and idempotent.
pub trait DecodePipeline: Send + Sync {
    /// Starts decoding the given transport URI.
    fn start(&mut self, uri: &str) -> Result<mpsc::Receiver<PipelineEvent>>;

    /// Tears the pipeline down. Safe to call more than once.
    fn shutdown(&mut self);
}

/// Builds fresh pipeline instances; a worker consumes one per (re)start.
pub trait PipelineFactory: Send + Sync {
    fn build(&self) -> Box<dyn DecodePipeline>;
}

impl PipelineFactory for Box<dyn PipelineFactory> {
    fn build(&self) -> Box<dyn DecodePipeline> {
        (**self).build()
    }
}

/// Decode pipeline that spawns an external decoder command.
///
/// The command template has `{uri}` substituted and is split on
/// whitespace; raw s16le PCM is read from the child's stdout.
pub struct CommandPipeline {
    command_template: String,
    stop_tx: Option<oneshot::Sender<()>>,
}

impl CommandPipeline {
    pub fn new(command_template: String) -> Self {
        Self {
            command_template,
            stop_tx: None,
        }
    }
}

impl DecodePipeline for CommandPipeline {
    fn start(&mut self, uri: &str) -> Result<mpsc::Receiver<PipelineEvent>> {
        let rendered = self.command_template.replace("{uri}", uri);
        let mut parts = rendered.split_whitespace();
        let program = parts.next().ok_or_else(|| {
            StreamscribeError::ConfigInvalidValue {
                key: "ingest.decoder_command".to_string(),
                message: "empty command".to_string(),
            }
        })?;

        let mut child = Command::new(program)
            .args(parts)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| StreamscribeError::PipelineFailed {
                message: format!("failed to spawn decoder: {}", e),
            })?;

        let mut stdout = child.stdout.take().ok_or_else(|| {
            StreamscribeError::PipelineFailed {
                message: "decoder stdout not captured".to_string(),
            }
        })?;

        let (tx, rx) = mpsc::channel(64);
        let (stop_tx, mut stop_rx) = oneshot::channel();
        self.stop_tx = Some(stop_tx);

        tokio::spawn(async move {
            // Listening starts as soon as the decoder process is up.
            if tx.send(PipelineEvent::Ready).await.is_err() {
                return;
            }

            let mut buf = vec![0u8; READ_CHUNK_BYTES];
            loop {
                tokio::select! {
                    _ = &mut stop_rx => {
                        let _ = child.kill().await;
                        return;
                    }
                    read = stdout.read(&mut buf) => match read {
                        Ok(0) => break,
                        Ok(n) => {
                            if tx.send(PipelineEvent::Pcm(buf[..n].to_vec())).await.is_err() {
                                let _ = child.kill().await;
                                return;
                            }
                        }
                        Err(e) => {
                            let _ = tx
                                .send(PipelineEvent::Error(format!("decoder read failed: {}", e)))
                                .await;
                            let _ = child.kill().await;
                            return;
                        }
                    }
                }
            }

            // Stdout closed: a clean decoder exit is end-of-stream, anything
            // else is a pipeline failure.
            match child.wait().await {
                Ok(status) if status.success() => {
                    let _ = tx.send(PipelineEvent::Eos).await;
                }
                Ok(status) => {
                    let _ = tx
                        .send(PipelineEvent::Error(format!("decoder exited: {}", status)))
                        .await;
                }
                Err(e) => {
                    let _ = tx
                        .send(PipelineEvent::Error(format!("decoder wait failed: {}", e)))
                        .await;
                }
            }
        });

        Ok(rx)
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop_tx.take() {
            let _ = stop.send(());
        }
    }
}

/// Factory for [`CommandPipeline`] instances sharing one command template.
pub struct CommandPipelineFactory {
    command_template: String,
}

impl CommandPipelineFactory {
    pub fn new(command_template: String) -> Self {
        Self { command_template }
    }
}

impl PipelineFactory for CommandPipelineFactory {
    fn build(&self) -> Box<dyn DecodePipeline> {
        Box::new(CommandPipeline::new(self.command_template.clone()))
    }
}

/// Scripted decode pipeline for driving worker state machine tests.
#[derive(Debug, Clone)]
pub struct MockDecodePipeline {
    script: Vec<PipelineEvent>,
    fail_start: bool,
    started_uris: std::sync::Arc<std::sync::Mutex<Vec<String>>>,
}

impl MockDecodePipeline {
    /// Pipeline that emits the given events once started.
    pub fn with_script(script: Vec<PipelineEvent>) -> Self {
        Self {
            script,
            fail_start: false,
            started_uris: std::sync::Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    /// Pipeline whose `start` fails outright.
    pub fn failing() -> Self {
        Self {
            script: Vec::new(),
            fail_start: true,
            started_uris: std::sync::Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    /// URIs this pipeline (or clones sharing its recorder) was started with.
    pub fn started_uris(&self) -> Vec<String> {
        self.started_uris
            .lock()
            .map(|uris| uris.clone())
            .unwrap_or_default()
    }
}

impl DecodePipeline for MockDecodePipeline {
    fn start(&mut self, uri: &str) -> Result<mpsc::Receiver<PipelineEvent>> {
        if let Ok(mut uris) = self.started_uris.lock() {
            uris.push(uri.to_string());
        }
        if self.fail_start {
            return Err(StreamscribeError::PipelineFailed {
                message: "mock pipeline start failure".to_string(),
            });
        }

        let (tx, rx) = mpsc::channel(64);
        let script = self.script.clone();
        tokio::spawn(async move {
            for event in script {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    fn shutdown(&mut self) {}
}

/// Factory handing out clones of one mock pipeline.
pub struct MockPipelineFactory {
    pipeline: MockDecodePipeline,
}

impl MockPipelineFactory {
    pub fn new(pipeline: MockDecodePipeline) -> Self {
        Self { pipeline }
    }
}

impl PipelineFactory for MockPipelineFactory {
    fn build(&self) -> Box<dyn DecodePipeline> {
        Box::new(self.pipeline.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_pipeline_replays_script() {
        let mut pipeline = MockDecodePipeline::with_script(vec![
            PipelineEvent::Ready,
            PipelineEvent::Pcm(vec![1, 2, 3, 4]),
            PipelineEvent::Eos,
        ]);

        let mut rx = pipeline.start("srt://0.0.0.0:9001").expect("start");
        assert_eq!(rx.recv().await, Some(PipelineEvent::Ready));
        assert_eq!(rx.recv().await, Some(PipelineEvent::Pcm(vec![1, 2, 3, 4])));
        assert_eq!(rx.recv().await, Some(PipelineEvent::Eos));
        assert_eq!(rx.recv().await, None);
        assert_eq!(pipeline.started_uris(), vec!["srt://0.0.0.0:9001"]);
    }

    #[tokio::test]
    async fn test_failing_mock_pipeline() {
        let mut pipeline = MockDecodePipeline::failing();
        assert!(pipeline.start("rtmp://0.0.0.0:1935/live").is_err());
    }

    #[test]
    fn test_empty_decoder_command_is_config_error() {
        let mut pipeline = CommandPipeline::new("   ".to_string());
        let runtime = tokio::runtime::Runtime::new().expect("runtime");
        let _guard = runtime.enter();
        let err = pipeline.start("ws://0.0.0.0:8100").unwrap_err();
        assert!(matches!(
            err,
            StreamscribeError::ConfigInvalidValue { .. }
        ));
    }
}
