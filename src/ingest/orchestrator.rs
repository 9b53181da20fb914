//! Channel orchestration: worker supervision, flush policy, diarization glue.
//!
//! The orchestrator owns one channel runtime per active session. A channel in
//! stream mode supervises one ingestion worker process per transport, feeds
//! decoded audio through the circular buffer into the transcription engine,
//! and restarts crashed workers. A channel in conference mode runs the audio
//! mixer and speaker tracker instead of transport workers.
//!
//! Each runtime is single-threaded with respect to its channel: it reacts to
//! worker messages, mixer output, and engine events in one select loop, so
//! channel state is never mutated concurrently.

use crate::audio::CircularAudioBuffer;
use crate::clock::SystemClock;
use crate::config::Config;
use crate::defaults;
use crate::diarization::mixer::{AudioMixer, MixerConfig, MixerHandle, MixerOutput};
use crate::diarization::tracker::{ParticipantUpdate, SpeakerTracker};
use crate::error::{Result, StreamscribeError};
use crate::ingest::ports::TransportKind;
use crate::ingest::protocol::{WorkerCommand, WorkerEvent};
use crate::transcription::engine::{EngineState, TranscriptEvent, TranscriptionEngine};
use crate::transcription::provider::ProviderProfile;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};

/// What a channel ingests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMode {
    /// One ingestion worker process per transport.
    Streams(Vec<TransportKind>),
    /// Per-participant PCM through the mixer, with speaker tracking.
    Conference,
}

/// Worker lifecycle and failure notifications leaving a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChannelStatus {
    PortSelected {
        transport: TransportKind,
        port: u16,
        uri: String,
    },
    WorkerReady {
        transport: TransportKind,
    },
    WorkerStreaming {
        transport: TransportKind,
    },
    WorkerEos {
        transport: TransportKind,
    },
    WorkerRestarted {
        transport: TransportKind,
    },
    Failed {
        message: String,
    },
    Stopped,
}

/// Everything a channel emits toward the control plane.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelOutput {
    Transcript(TranscriptEvent),
    Status(ChannelStatus),
}

/// A live connection to one spawned worker.
pub struct WorkerConnection {
    pub commands: mpsc::Sender<WorkerCommand>,
    pub events: mpsc::Receiver<WorkerEvent>,
}

/// Spawns ingestion workers. The production implementation forks worker
/// processes; tests substitute in-process workers with mock pipelines.
#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    async fn spawn(&self, transport: TransportKind) -> Result<WorkerConnection>;
}

/// Spawns each worker as a child OS process running the `worker`
/// subcommand of this binary. Process isolation is load-bearing: the
/// native decode pipeline can crash its host, and a crash must only take
/// down the one worker.
pub struct ProcessSpawner {
    exe: PathBuf,
    config_path: PathBuf,
    kill_grace: Duration,
}

impl ProcessSpawner {
    pub fn new(config_path: PathBuf) -> Result<Self> {
        Ok(Self {
            exe: std::env::current_exe()?,
            config_path,
            kill_grace: Duration::from_millis(defaults::WORKER_KILL_GRACE_MS),
        })
    }
}

#[async_trait]
impl WorkerSpawner for ProcessSpawner {
    async fn spawn(&self, transport: TransportKind) -> Result<WorkerConnection> {
        let mut child = tokio::process::Command::new(&self.exe)
            .arg("worker")
            .arg("--transport")
            .arg(transport.label())
            .arg("--config")
            .arg(&self.config_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdin = child.stdin.take().ok_or_else(|| StreamscribeError::WorkerFailed {
            id: transport.label().to_string(),
            message: "worker stdin not captured".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| StreamscribeError::WorkerFailed {
            id: transport.label().to_string(),
            message: "worker stdout not captured".to_string(),
        })?;

        let (cmd_tx, mut cmd_rx) = mpsc::channel::<WorkerCommand>(16);
        let (event_tx, event_rx) = mpsc::channel::<WorkerEvent>(256);

        // Commands → child stdin. Forwarding terminate (or losing the
        // command sender) closes the child's stdin and signals the
        // babysitter, which arms the force-kill grace window. A wedged
        // worker that ignores stdin-close and holds its stdout open must
        // still die inside the grace window.
        let (exit_tx, exit_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                let terminate = matches!(cmd, WorkerCommand::Terminate);
                if let Ok(json) = cmd.to_json() {
                    if stdin.write_all(json.as_bytes()).await.is_err()
                        || stdin.write_all(b"\n").await.is_err()
                        || stdin.flush().await.is_err()
                    {
                        break;
                    }
                }
                if terminate {
                    break;
                }
            }
            drop(stdin);
            let _ = exit_tx.send(());
        });

        // Child stdout → events; on terminate or EOF, grace window, then
        // force-kill.
        let grace = self.kill_grace;
        let label = transport.label();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut exit_rx = exit_rx;
            loop {
                tokio::select! {
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => match WorkerEvent::from_json(&line) {
                            Ok(event) => {
                                if event_tx.send(event).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => tracing::warn!(worker = label, error = %e, "bad event line"),
                        },
                        _ => break,
                    },
                    _ = &mut exit_rx => break,
                }
            }
            if tokio::time::timeout(grace, child.wait()).await.is_err() {
                tracing::warn!(worker = label, "worker did not exit in grace window, killing");
                let _ = child.kill().await;
            }
        });

        Ok(WorkerConnection {
            commands: cmd_tx,
            events: event_rx,
        })
    }
}

/// Runs workers as in-process tasks with a caller-supplied pipeline
/// factory. Used by tests; keeps the exact worker state machine.
pub struct LocalSpawner<F>
where
    F: Fn(TransportKind) -> Box<dyn crate::ingest::decode::PipelineFactory> + Send + Sync,
{
    config: Arc<Config>,
    factory: F,
}

impl<F> LocalSpawner<F>
where
    F: Fn(TransportKind) -> Box<dyn crate::ingest::decode::PipelineFactory> + Send + Sync,
{
    pub fn new(config: Arc<Config>, factory: F) -> Self {
        Self { config, factory }
    }
}

#[async_trait]
impl<F> WorkerSpawner for LocalSpawner<F>
where
    F: Fn(TransportKind) -> Box<dyn crate::ingest::decode::PipelineFactory> + Send + Sync,
{
    async fn spawn(&self, transport: TransportKind) -> Result<WorkerConnection> {
        use crate::ingest::worker::{IngestionWorker, WorkerConfig};

        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = mpsc::channel(256);
        let worker = IngestionWorker::new(
            WorkerConfig::from_config(transport, &self.config),
            (self.factory)(transport),
            event_tx,
        );
        tokio::spawn(worker.run(cmd_rx));
        Ok(WorkerConnection {
            commands: cmd_tx,
            events: event_rx,
        })
    }
}

/// Control-plane commands accepted by a running channel.
enum ChannelCommand {
    Stop,
    Participant(ParticipantUpdate),
    ParticipantAudio {
        id: String,
        pcm: Vec<u8>,
        name: Option<String>,
    },
}

/// Handle used to drive one running channel.
#[derive(Clone)]
pub struct ChannelHandle {
    commands: mpsc::Sender<ChannelCommand>,
}

impl ChannelHandle {
    /// Requests best-effort teardown of the channel.
    pub async fn stop(&self) {
        let _ = self.commands.send(ChannelCommand::Stop).await;
    }

    /// Forwards a participant join/leave from the conferencing collaborator.
    pub async fn update_participant(&self, update: ParticipantUpdate) {
        let _ = self.commands.send(ChannelCommand::Participant(update)).await;
    }

    /// Forwards one chunk of per-participant PCM to the mixer.
    pub async fn add_participant_audio(&self, id: &str, pcm: Vec<u8>, name: Option<&str>) {
        let _ = self
            .commands
            .send(ChannelCommand::ParticipantAudio {
                id: id.to_string(),
                pcm,
                name: name.map(str::to_string),
            })
            .await;
    }
}

/// Per-worker supervision state inside a channel.
struct WorkerSlot {
    commands: mpsc::Sender<WorkerCommand>,
    respawns: u32,
    failed: bool,
}

enum WorkerSignal {
    Event(WorkerEvent),
    Gone,
}

enum Input {
    Control(Option<ChannelCommand>),
    Worker(Option<(TransportKind, WorkerSignal)>),
    Engine(Option<TranscriptEvent>),
    Mixer(Option<MixerOutput>),
}

/// State owned by one channel's event loop.
struct ChannelRuntime {
    id: String,
    config: Arc<Config>,
    spawner: Arc<dyn WorkerSpawner>,
    control: mpsc::Receiver<ChannelCommand>,
    workers: HashMap<TransportKind, WorkerSlot>,
    worker_events: mpsc::Receiver<(TransportKind, WorkerSignal)>,
    worker_events_tx: mpsc::Sender<(TransportKind, WorkerSignal)>,
    buffer: CircularAudioBuffer,
    flush_threshold: usize,
    engine: TranscriptionEngine<SystemClock>,
    tracker: SpeakerTracker<SystemClock>,
    mixer: Option<MixerHandle>,
    mixer_rx: Option<mpsc::Receiver<MixerOutput>>,
    outputs: mpsc::Sender<ChannelOutput>,
    engine_restarts: u32,
    failed: bool,
}

impl ChannelRuntime {
    async fn run(mut self) {
        loop {
            let mixer_rx = self.mixer_rx.as_mut();
            let input = tokio::select! {
                cmd = self.control.recv() => Input::Control(cmd),
                event = self.worker_events.recv() => Input::Worker(event),
                transcript = self.engine.next_event() => Input::Engine(transcript),
                output = async {
                    match mixer_rx {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => Input::Mixer(output),
            };

            match input {
                Input::Control(None) | Input::Control(Some(ChannelCommand::Stop)) => break,
                Input::Control(Some(ChannelCommand::Participant(update))) => {
                    if let (ParticipantUpdate::Leave { id }, Some(mixer)) = (&update, &self.mixer) {
                        mixer.remove_participant(id).await;
                    }
                    self.tracker.update_participant(update);
                }
                Input::Control(Some(ChannelCommand::ParticipantAudio { id, pcm, name })) => {
                    if let Some(mixer) = &self.mixer {
                        mixer.add_audio(&id, pcm, name.as_deref()).await;
                    }
                }
                Input::Worker(None) => break,
                Input::Worker(Some((transport, signal))) => {
                    self.handle_worker_signal(transport, signal).await;
                }
                Input::Engine(None) => {}
                Input::Engine(Some(transcript)) => {
                    if !self.emit_transcript(transcript).await {
                        break;
                    }
                }
                Input::Mixer(None) => {
                    self.mixer_rx = None;
                }
                Input::Mixer(Some(output)) => {
                    self.handle_mixer_output(output).await;
                }
            }
        }

        self.teardown().await;
    }

    async fn handle_worker_signal(&mut self, transport: TransportKind, signal: WorkerSignal) {
        match signal {
            WorkerSignal::Event(WorkerEvent::PortSelected { port, uri }) => {
                tracing::info!(channel = %self.id, transport = transport.label(), port, "port selected");
                self.emit_status(ChannelStatus::PortSelected {
                    transport,
                    port,
                    uri,
                })
                .await;
            }
            WorkerSignal::Event(WorkerEvent::Ready) => {
                self.emit_status(ChannelStatus::WorkerReady { transport }).await;
            }
            WorkerSignal::Event(WorkerEvent::Streaming) => {
                self.emit_status(ChannelStatus::WorkerStreaming { transport }).await;
            }
            WorkerSignal::Event(WorkerEvent::Audio { pcm }) => {
                self.ingest_audio(&pcm).await;
            }
            WorkerSignal::Event(WorkerEvent::Eos) => {
                // The worker re-arms itself; nothing to supervise here.
                self.emit_status(ChannelStatus::WorkerEos { transport }).await;
            }
            WorkerSignal::Event(WorkerEvent::Error { message, fatal }) => {
                if fatal {
                    if let Some(slot) = self.workers.get_mut(&transport) {
                        slot.failed = true;
                    }
                    self.fail_channel(format!(
                        "{} ingestion failed: {}",
                        transport.label(),
                        message
                    ))
                    .await;
                } else {
                    tracing::warn!(
                        channel = %self.id,
                        transport = transport.label(),
                        error = %message,
                        "transient worker error"
                    );
                }
            }
            WorkerSignal::Event(WorkerEvent::Closed) => {}
            WorkerSignal::Gone => {
                self.handle_worker_exit(transport).await;
            }
        }
    }

    /// A worker process died without reporting a fatal error: restart it
    /// from scratch up to the respawn ceiling.
    async fn handle_worker_exit(&mut self, transport: TransportKind) {
        let Some(slot) = self.workers.get_mut(&transport) else {
            return;
        };
        if slot.failed || self.failed {
            return;
        }

        if slot.respawns >= self.config.ingest.respawn_ceiling {
            slot.failed = true;
            self.fail_channel(format!(
                "{} worker crashed {} times, giving up",
                transport.label(),
                self.config.ingest.respawn_ceiling + 1
            ))
            .await;
            return;
        }
        slot.respawns += 1;

        tracing::warn!(
            channel = %self.id,
            transport = transport.label(),
            attempt = slot.respawns,
            "worker exited, respawning"
        );
        match spawn_worker(
            self.spawner.as_ref(),
            transport,
            &self.worker_events_tx,
        )
        .await
        {
            Ok(commands) => {
                let respawns = slot.respawns;
                self.workers.insert(
                    transport,
                    WorkerSlot {
                        commands,
                        respawns,
                        failed: false,
                    },
                );
                self.emit_status(ChannelStatus::WorkerRestarted { transport }).await;
            }
            Err(e) => {
                slot.failed = true;
                self.fail_channel(format!(
                    "failed to respawn {} worker: {}",
                    transport.label(),
                    e
                ))
                .await;
            }
        }
    }

    /// Flush policy: accumulate until the buffer holds at least
    /// `min_buffer_duration_ms` worth of audio, then hand off and flush.
    async fn ingest_audio(&mut self, pcm: &[u8]) {
        self.buffer.add(pcm);
        if self.buffer.filled_bytes() >= self.flush_threshold {
            let chunk = self.buffer.audio_buffer();
            self.buffer.flush();
            if let Err(e) = self.engine.transcribe(&chunk).await {
                tracing::warn!(channel = %self.id, error = %e, "transcribe hand-off failed");
            }
        }
    }

    async fn handle_mixer_output(&mut self, output: MixerOutput) {
        match output {
            MixerOutput::Audio { pcm, .. } => {
                self.ingest_audio(&pcm).await;
            }
            MixerOutput::SpeakerChanged(change) => {
                self.tracker.add_speaker_change(change);
            }
        }
    }

    /// Enriches a transcript with the segment's speaker and keeps the
    /// tracker index bounded by clearing finalized segments.
    async fn emit_transcript(&mut self, mut transcript: TranscriptEvent) -> bool {
        self.tracker.assign_speaker_to_segment(transcript.segment_id);
        transcript.speaker = self
            .tracker
            .speaker_for_segment(transcript.segment_id)
            .map(|speaker| speaker.id);
        if transcript.kind == crate::transcription::engine::TranscriptKind::Final {
            self.tracker.clear_segment(transcript.segment_id);
        }
        let delivered = self
            .outputs
            .send(ChannelOutput::Transcript(transcript))
            .await
            .is_ok();
        if self.engine.state() == EngineState::Error {
            self.handle_recognition_error().await;
        }
        delivered
    }

    /// Propagation policy for recognition errors, applied after the
    /// engine has emitted its mapped final: retriable codes get a bounded
    /// engine restart; trust failures (authentication, forbidden) and
    /// exhausted restarts mark the channel failed with no further
    /// terminal transcript.
    async fn handle_recognition_error(&mut self) {
        let Some(code) = self.engine.last_error_code() else {
            return;
        };
        if code.retriable() && self.engine_restarts < defaults::ENGINE_RESTART_CEILING {
            self.engine_restarts += 1;
            tracing::warn!(
                channel = %self.id,
                code = code.code(),
                attempt = self.engine_restarts,
                "recognition error, restarting engine"
            );
            if self.engine.restart().await.is_ok() {
                return;
            }
        }
        if !self.failed {
            self.failed = true;
            tracing::error!(channel = %self.id, code = code.code(), "recognition failed");
            self.emit_status(ChannelStatus::Failed {
                message: code.message().to_string(),
            })
            .await;
        }
    }

    /// Marks the channel failed and emits the terminal transcript the
    /// stream-never-ends-silently invariant requires.
    async fn fail_channel(&mut self, message: String) {
        if self.failed {
            return;
        }
        self.failed = true;
        tracing::error!(channel = %self.id, error = %message, "channel failed");

        let transcript = self.engine.synthesize_failure(&message);
        let _ = self.outputs.send(ChannelOutput::Transcript(transcript)).await;
        self.emit_status(ChannelStatus::Failed { message }).await;
    }

    async fn emit_status(&self, status: ChannelStatus) {
        let _ = self.outputs.send(ChannelOutput::Status(status)).await;
    }

    /// Best-effort, idempotent teardown. Workers already dead, a stopped
    /// engine, or a dropped output receiver must not derail it.
    async fn teardown(&mut self) {
        for (transport, slot) in self.workers.drain() {
            tracing::debug!(channel = %self.id, transport = transport.label(), "terminating worker");
            let _ = slot.commands.send(WorkerCommand::Terminate).await;
            // Terminate closes the worker's stdin and arms the spawner's
            // force-kill grace window.
        }
        if let Some(mixer) = self.mixer.take() {
            mixer.shutdown().await;
        }
        self.mixer_rx = None;
        self.engine.stop_transcription().await;
        self.tracker.clear();
        self.buffer.flush();
        self.emit_status(ChannelStatus::Stopped).await;
    }
}

/// Spawns one worker via the spawner and forwards its events into the
/// channel's merged stream, tagging them with the transport. Sends
/// `Gone` when the worker's event stream ends.
async fn spawn_worker(
    spawner: &dyn WorkerSpawner,
    transport: TransportKind,
    merged: &mpsc::Sender<(TransportKind, WorkerSignal)>,
) -> Result<mpsc::Sender<WorkerCommand>> {
    let mut connection = spawner.spawn(transport).await?;

    connection
        .commands
        .send(WorkerCommand::Init)
        .await
        .map_err(|_| StreamscribeError::WorkerFailed {
            id: transport.label().to_string(),
            message: "worker rejected init".to_string(),
        })?;
    connection
        .commands
        .send(WorkerCommand::Start { force: false })
        .await
        .map_err(|_| StreamscribeError::WorkerFailed {
            id: transport.label().to_string(),
            message: "worker rejected start".to_string(),
        })?;

    let merged = merged.clone();
    let commands = connection.commands.clone();
    tokio::spawn(async move {
        while let Some(event) = connection.events.recv().await {
            if merged.send((transport, WorkerSignal::Event(event))).await.is_err() {
                return;
            }
        }
        let _ = merged.send((transport, WorkerSignal::Gone)).await;
    });

    Ok(commands)
}

/// Supervises all channels of one streamscribe instance.
pub struct StreamOrchestrator {
    config: Arc<Config>,
    spawner: Arc<dyn WorkerSpawner>,
    channels: HashMap<String, ChannelHandle>,
}

impl StreamOrchestrator {
    /// Production orchestrator forking worker processes from this binary.
    pub fn new(config: Config, config_path: PathBuf) -> Result<Self> {
        let spawner = Arc::new(ProcessSpawner::new(config_path)?);
        Ok(Self::with_spawner(config, spawner))
    }

    /// Orchestrator with a custom worker spawner.
    pub fn with_spawner(config: Config, spawner: Arc<dyn WorkerSpawner>) -> Self {
        Self {
            config: Arc::new(config),
            spawner,
            channels: HashMap::new(),
        }
    }

    /// Ids of currently active channels.
    pub fn active_channels(&self) -> Vec<String> {
        self.channels.keys().cloned().collect()
    }

    /// Starts a channel: configures its engine (fail fast on a bad
    /// profile), spawns its workers or mixer, and begins streaming
    /// channel output to the returned receiver.
    pub async fn start_channel(
        &mut self,
        id: &str,
        mode: ChannelMode,
    ) -> Result<(ChannelHandle, mpsc::Receiver<ChannelOutput>)> {
        if self.channels.contains_key(id) {
            return Err(StreamscribeError::ChannelActive { id: id.to_string() });
        }

        let mut engine = TranscriptionEngine::new(self.config.audio.min_buffer_duration_ms);
        engine
            .configure(ProviderProfile::from_config(&self.config.recognition))
            .await?;
        engine.start_transcription().await?;

        let (control_tx, control_rx) = mpsc::channel(256);
        let (output_tx, output_rx) = mpsc::channel(256);
        let (worker_events_tx, worker_events_rx) = mpsc::channel(1024);

        let mut workers = HashMap::new();
        let mut mixer = None;
        let mut mixer_rx = None;
        match &mode {
            ChannelMode::Streams(transports) => {
                for &transport in transports {
                    let commands =
                        spawn_worker(self.spawner.as_ref(), transport, &worker_events_tx).await?;
                    workers.insert(
                        transport,
                        WorkerSlot {
                            commands,
                            respawns: 0,
                            failed: false,
                        },
                    );
                }
            }
            ChannelMode::Conference => {
                let (handle, rx) = AudioMixer::spawn(MixerConfig {
                    speech_energy_threshold: self.config.diarization.speech_energy_threshold,
                    ..MixerConfig::default()
                });
                mixer = Some(handle);
                mixer_rx = Some(rx);
            }
        }

        let flush_threshold = defaults::ms_to_bytes(
            self.config.audio.min_buffer_duration_ms,
            self.config.audio.sample_rate,
        );
        let capacity = defaults::ms_to_bytes(
            self.config.audio.ring_capacity_ms,
            self.config.audio.sample_rate,
        );

        let runtime = ChannelRuntime {
            id: id.to_string(),
            config: self.config.clone(),
            spawner: self.spawner.clone(),
            control: control_rx,
            workers,
            worker_events: worker_events_rx,
            worker_events_tx,
            buffer: CircularAudioBuffer::new(capacity),
            flush_threshold,
            engine,
            tracker: SpeakerTracker::new(self.config.diarization.grace_period_ms),
            mixer,
            mixer_rx,
            outputs: output_tx,
            engine_restarts: 0,
            failed: false,
        };
        tokio::spawn(runtime.run());

        let handle = ChannelHandle {
            commands: control_tx,
        };
        self.channels.insert(id.to_string(), handle.clone());
        tracing::info!(channel = id, ?mode, "channel started");
        Ok((handle, output_rx))
    }

    /// Stops a channel. Teardown is best-effort and idempotent; stopping
    /// an unknown channel is an error, stopping a dying one is not.
    pub async fn stop_channel(&mut self, id: &str) -> Result<()> {
        let handle = self
            .channels
            .remove(id)
            .ok_or_else(|| StreamscribeError::UnknownChannel { id: id.to_string() })?;
        handle.stop().await;
        tracing::info!(channel = id, "channel stopped");
        Ok(())
    }

    /// Stops every channel.
    pub async fn shutdown(&mut self) {
        let ids: Vec<String> = self.channels.keys().cloned().collect();
        for id in ids {
            let _ = self.stop_channel(&id).await;
        }
    }
}
