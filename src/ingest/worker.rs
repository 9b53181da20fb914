//! Per-transport ingestion worker.
//!
//! One worker terminates one wire transport: it claims a dynamic port, runs
//! the decode pipeline, and streams decoded PCM to its parent as `audio`
//! events. The worker runs in its own OS process (see [`run_worker_process`])
//! so a decode pipeline crash is contained to that process; the orchestrator
//! respawns it without touching sibling sessions.

use crate::config::{Config, PortRange};
use crate::ingest::decode::{DecodePipeline, PipelineEvent, PipelineFactory};
use crate::ingest::ports::{self, PortProbe, TransportKind};
use crate::ingest::protocol::{WorkerCommand, WorkerEvent};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

/// Ingestion worker lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// No port claimed, nothing running.
    Closed,
    /// Port claimed and held by the probe.
    Initialized,
    /// Decode pipeline attached and accepting publisher data.
    Ready,
    /// Decoded audio is flowing.
    Streaming,
    /// Stopped on request; the process stays alive.
    Stopped,
    /// Unrecoverable failure; only `terminate` is honored.
    Error,
}

/// Worker-side configuration, carved out of the full [`Config`].
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub transport: TransportKind,
    pub ports: PortRange,
    pub retry_ceiling: u32,
    pub decoder_command: String,
}

impl WorkerConfig {
    /// Extracts the worker configuration for one transport.
    pub fn from_config(transport: TransportKind, config: &Config) -> Self {
        let ports = match transport {
            TransportKind::Srt => config.ingest.srt_ports,
            TransportKind::Rtmp => config.ingest.rtmp_ports,
            TransportKind::WebSocket => config.ingest.websocket_ports,
        };
        Self {
            transport,
            ports,
            retry_ceiling: config.ingest.retry_ceiling,
            decoder_command: config.ingest.decoder_command.clone(),
        }
    }
}

/// Input multiplexed by the worker run loop.
enum Input {
    Command(Option<WorkerCommand>),
    Pipeline(Option<PipelineEvent>),
}

/// State machine driving one transport's ingestion.
pub struct IngestionWorker<F: PipelineFactory> {
    config: WorkerConfig,
    factory: F,
    state: WorkerState,
    port: Option<u16>,
    probe: Option<PortProbe>,
    pipeline: Option<Box<dyn DecodePipeline>>,
    error_count: u32,
    events: mpsc::Sender<WorkerEvent>,
}

impl<F: PipelineFactory> IngestionWorker<F> {
    pub fn new(config: WorkerConfig, factory: F, events: mpsc::Sender<WorkerEvent>) -> Self {
        Self {
            config,
            factory,
            state: WorkerState::Closed,
            port: None,
            probe: None,
            pipeline: None,
            error_count: 0,
            events,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Runs the worker until `terminate` arrives or the command channel
    /// closes. Emits `closed` on the way out.
    pub async fn run(mut self, mut commands: mpsc::Receiver<WorkerCommand>) {
        let mut pipeline_rx: Option<mpsc::Receiver<PipelineEvent>> = None;

        loop {
            let input = tokio::select! {
                cmd = commands.recv() => Input::Command(cmd),
                event = async {
                    match pipeline_rx.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => Input::Pipeline(event),
            };

            match input {
                Input::Command(None) | Input::Command(Some(WorkerCommand::Terminate)) => break,
                Input::Command(Some(cmd)) => {
                    self.handle_command(cmd, &mut pipeline_rx).await;
                }
                Input::Pipeline(event) => {
                    self.handle_pipeline_event(event, &mut pipeline_rx).await;
                }
            }
        }

        self.shutdown_pipeline();
        self.emit(WorkerEvent::Closed).await;
    }

    async fn handle_command(
        &mut self,
        cmd: WorkerCommand,
        pipeline_rx: &mut Option<mpsc::Receiver<PipelineEvent>>,
    ) {
        if self.state == WorkerState::Error {
            tracing::warn!(?cmd, "ignoring command in error state");
            return;
        }

        match cmd {
            WorkerCommand::Init => {
                if let Err(e) = self.claim_and_report().await {
                    // Port exhaustion is fatal: the worker must never
                    // reach ready and must not be restarted.
                    self.fail_fatal(e.to_string()).await;
                }
            }
            WorkerCommand::Start { force } => {
                if self.port.is_none() && !force {
                    // Out-of-order start; claim a port first.
                    if let Err(e) = self.claim_and_report().await {
                        self.fail_fatal(e.to_string()).await;
                        return;
                    }
                }
                if let Err(e) = self.attach_pipeline(pipeline_rx) {
                    self.handle_pipeline_failure(e.to_string(), pipeline_rx).await;
                }
            }
            WorkerCommand::Stop => {
                self.shutdown_pipeline();
                *pipeline_rx = None;
                self.state = WorkerState::Stopped;
            }
            WorkerCommand::Terminate => unreachable!("terminate handled by run loop"),
        }
    }

    async fn handle_pipeline_event(
        &mut self,
        event: Option<PipelineEvent>,
        pipeline_rx: &mut Option<mpsc::Receiver<PipelineEvent>>,
    ) {
        match event {
            Some(PipelineEvent::Ready) => {
                self.state = WorkerState::Ready;
                self.emit(WorkerEvent::Ready).await;
            }
            Some(PipelineEvent::Pcm(pcm)) => {
                if self.state != WorkerState::Streaming {
                    self.state = WorkerState::Streaming;
                    self.emit(WorkerEvent::Streaming).await;
                }
                self.emit(WorkerEvent::Audio { pcm }).await;
            }
            Some(PipelineEvent::Eos) => {
                // Publisher disconnect: re-arm on the claimed port so a
                // reconnecting publisher lands on the same URI.
                self.emit(WorkerEvent::Eos).await;
                self.shutdown_pipeline();
                *pipeline_rx = None;
                tracing::info!(
                    protocol = self.config.transport.label(),
                    "end of stream, re-arming"
                );
                if let Err(e) = self.attach_pipeline(pipeline_rx) {
                    self.handle_pipeline_failure(e.to_string(), pipeline_rx).await;
                }
            }
            Some(PipelineEvent::Error(message)) => {
                self.handle_pipeline_failure(message, pipeline_rx).await;
            }
            None => {
                // Pipeline task ended without a terminal event.
                self.shutdown_pipeline();
                *pipeline_rx = None;
            }
        }
    }

    /// Scans the configured range, holds the claimed port with a probe,
    /// and reports `port_selected`.
    async fn claim_and_report(&mut self) -> crate::error::Result<()> {
        ports::settle_jitter().await;
        let (port, probe) = ports::claim_port(self.config.transport, self.config.ports)?;
        self.port = Some(port);
        self.probe = Some(probe);
        self.state = WorkerState::Initialized;
        self.emit(WorkerEvent::PortSelected {
            port,
            uri: self.config.transport.uri(port),
        })
        .await;
        Ok(())
    }

    /// Releases the probe and starts a fresh decode pipeline on the
    /// claimed port.
    fn attach_pipeline(
        &mut self,
        pipeline_rx: &mut Option<mpsc::Receiver<PipelineEvent>>,
    ) -> crate::error::Result<()> {
        let port = self.port.ok_or_else(|| crate::error::StreamscribeError::WorkerFailed {
            id: self.config.transport.label().to_string(),
            message: "no port claimed".to_string(),
        })?;

        // The decoder binds the port itself; the probe must let go first.
        self.probe = None;
        self.shutdown_pipeline();

        let uri = self.config.transport.uri(port);
        let mut pipeline = self.factory.build();
        let rx = pipeline.start(&uri)?;
        self.pipeline = Some(pipeline);
        *pipeline_rx = Some(rx);
        Ok(())
    }

    /// Transient failures re-initialize from scratch (fresh port scan and
    /// pipeline) until the retry ceiling; at the ceiling the error is
    /// fatal and the worker parks in `Error`.
    async fn handle_pipeline_failure(
        &mut self,
        message: String,
        pipeline_rx: &mut Option<mpsc::Receiver<PipelineEvent>>,
    ) {
        let mut message = message;
        loop {
            self.error_count += 1;
            self.shutdown_pipeline();
            *pipeline_rx = None;

            if self.error_count >= self.config.retry_ceiling {
                self.fail_fatal(message).await;
                return;
            }

            tracing::warn!(
                protocol = self.config.transport.label(),
                error = %message,
                attempt = self.error_count,
                "pipeline failure, re-initializing"
            );
            self.emit(WorkerEvent::Error {
                message: message.clone(),
                fatal: false,
            })
            .await;

            // Full re-initialize: the old port may be what's poisoned.
            self.probe = None;
            self.port = None;
            self.state = WorkerState::Closed;

            if let Err(e) = self.claim_and_report().await {
                self.fail_fatal(e.to_string()).await;
                return;
            }
            match self.attach_pipeline(pipeline_rx) {
                Ok(()) => return,
                Err(e) => {
                    message = e.to_string();
                }
            }
        }
    }

    async fn fail_fatal(&mut self, message: String) {
        tracing::error!(
            protocol = self.config.transport.label(),
            error = %message,
            "unrecoverable worker error"
        );
        self.state = WorkerState::Error;
        self.emit(WorkerEvent::Error {
            message,
            fatal: true,
        })
        .await;
    }

    fn shutdown_pipeline(&mut self) {
        if let Some(mut pipeline) = self.pipeline.take() {
            pipeline.shutdown();
        }
    }

    async fn emit(&self, event: WorkerEvent) {
        if self.events.send(event).await.is_err() {
            tracing::debug!("event receiver dropped");
        }
    }
}

/// Entry point for the worker child process.
///
/// Reads `WorkerCommand` JSON lines from stdin and writes `WorkerEvent`
/// JSON lines to stdout. Stdout is protocol — the process logs to stderr.
pub async fn run_worker_process(transport: TransportKind, config: &Config) -> crate::error::Result<()> {
    let worker_config = WorkerConfig::from_config(transport, config);
    let decoder_command = worker_config.decoder_command.clone();
    let factory = crate::ingest::decode::CommandPipelineFactory::new(decoder_command);

    let (event_tx, mut event_rx) = mpsc::channel::<WorkerEvent>(256);
    let (cmd_tx, cmd_rx) = mpsc::channel::<WorkerCommand>(16);

    // stdin → commands
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match WorkerCommand::from_json(&line) {
                Ok(cmd) => {
                    if cmd_tx.send(cmd).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "unparseable command line"),
            }
        }
    });

    // events → stdout
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(event) = event_rx.recv().await {
            let Ok(json) = event.to_json() else { continue };
            if stdout.write_all(json.as_bytes()).await.is_err()
                || stdout.write_all(b"\n").await.is_err()
                || stdout.flush().await.is_err()
            {
                break;
            }
        }
    });

    IngestionWorker::new(worker_config, factory, event_tx).run(cmd_rx).await;
    let _ = writer.await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::decode::{MockDecodePipeline, MockPipelineFactory};

    fn test_config(transport: TransportKind, ports: PortRange, retry_ceiling: u32) -> WorkerConfig {
        WorkerConfig {
            transport,
            ports,
            retry_ceiling,
            decoder_command: String::new(),
        }
    }

    fn spawn_worker(
        config: WorkerConfig,
        factory: MockPipelineFactory,
    ) -> (
        mpsc::Sender<WorkerCommand>,
        mpsc::Receiver<WorkerEvent>,
        tokio::task::JoinHandle<()>,
    ) {
        let (event_tx, event_rx) = mpsc::channel(256);
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let worker = IngestionWorker::new(config, factory, event_tx);
        let handle = tokio::spawn(worker.run(cmd_rx));
        (cmd_tx, event_rx, handle)
    }

    #[tokio::test]
    async fn test_happy_path_init_start_stream() {
        let factory = MockPipelineFactory::new(MockDecodePipeline::with_script(vec![
            PipelineEvent::Ready,
            PipelineEvent::Pcm(vec![1, 2, 3, 4]),
        ]));
        let config = test_config(TransportKind::WebSocket, PortRange::new(18100, 18150), 3);
        let (cmd_tx, mut event_rx, handle) = spawn_worker(config, factory);

        cmd_tx.send(WorkerCommand::Init).await.expect("send init");
        let selected = event_rx.recv().await.expect("port_selected");
        let port = match selected {
            WorkerEvent::PortSelected { port, ref uri } => {
                assert_eq!(uri, &format!("ws://0.0.0.0:{}", port));
                port
            }
            other => panic!("expected port_selected, got {:?}", other),
        };
        assert!((18100..=18150).contains(&port));

        cmd_tx
            .send(WorkerCommand::Start { force: false })
            .await
            .expect("send start");
        assert_eq!(event_rx.recv().await, Some(WorkerEvent::Ready));
        assert_eq!(event_rx.recv().await, Some(WorkerEvent::Streaming));
        assert_eq!(
            event_rx.recv().await,
            Some(WorkerEvent::Audio {
                pcm: vec![1, 2, 3, 4]
            })
        );

        cmd_tx
            .send(WorkerCommand::Terminate)
            .await
            .expect("send terminate");
        assert_eq!(event_rx.recv().await, Some(WorkerEvent::Closed));
        handle.await.expect("worker task");
    }

    #[tokio::test]
    async fn test_eos_rearms_without_rescanning_port() {
        let pipeline = MockDecodePipeline::with_script(vec![
            PipelineEvent::Ready,
            PipelineEvent::Pcm(vec![0; 4]),
            PipelineEvent::Eos,
        ]);
        let recorder = pipeline.clone();
        let factory = MockPipelineFactory::new(pipeline);
        let config = test_config(TransportKind::Rtmp, PortRange::new(18200, 18250), 3);
        let (cmd_tx, mut event_rx, handle) = spawn_worker(config, factory);

        cmd_tx.send(WorkerCommand::Init).await.expect("init");
        let first_port = match event_rx.recv().await {
            Some(WorkerEvent::PortSelected { port, .. }) => port,
            other => panic!("expected port_selected, got {:?}", other),
        };

        cmd_tx
            .send(WorkerCommand::Start { force: false })
            .await
            .expect("start");
        assert_eq!(event_rx.recv().await, Some(WorkerEvent::Ready));
        assert_eq!(event_rx.recv().await, Some(WorkerEvent::Streaming));
        assert!(matches!(
            event_rx.recv().await,
            Some(WorkerEvent::Audio { .. })
        ));
        assert_eq!(event_rx.recv().await, Some(WorkerEvent::Eos));

        // Re-armed automatically: the script replays on the same port,
        // with no new port_selected in between.
        assert_eq!(event_rx.recv().await, Some(WorkerEvent::Ready));

        cmd_tx.send(WorkerCommand::Terminate).await.expect("terminate");
        while let Some(event) = event_rx.recv().await {
            if event == WorkerEvent::Closed {
                break;
            }
        }
        handle.await.expect("worker task");

        let uris = recorder.started_uris();
        assert!(uris.len() >= 2, "expected re-arm start, got {:?}", uris);
        assert!(uris.iter().all(|u| u.contains(&first_port.to_string())));
    }

    #[tokio::test]
    async fn test_stop_tears_down_and_start_force_rearms_on_claimed_port() {
        let pipeline = MockDecodePipeline::with_script(vec![PipelineEvent::Ready]);
        let recorder = pipeline.clone();
        let factory = MockPipelineFactory::new(pipeline);
        let config = test_config(TransportKind::WebSocket, PortRange::new(18400, 18450), 3);
        let (cmd_tx, mut event_rx, handle) = spawn_worker(config, factory);

        cmd_tx.send(WorkerCommand::Init).await.expect("init");
        let port = match event_rx.recv().await {
            Some(WorkerEvent::PortSelected { port, .. }) => port,
            other => panic!("expected port_selected, got {:?}", other),
        };
        cmd_tx
            .send(WorkerCommand::Start { force: false })
            .await
            .expect("start");
        assert_eq!(event_rx.recv().await, Some(WorkerEvent::Ready));

        cmd_tx.send(WorkerCommand::Stop).await.expect("stop");

        // Stopped is not terminal: start(force) resumes on the claimed
        // port with a fresh pipeline, no new port_selected in between.
        cmd_tx
            .send(WorkerCommand::Start { force: true })
            .await
            .expect("restart");
        assert_eq!(event_rx.recv().await, Some(WorkerEvent::Ready));

        cmd_tx.send(WorkerCommand::Terminate).await.expect("terminate");
        assert_eq!(event_rx.recv().await, Some(WorkerEvent::Closed));
        handle.await.expect("worker task");

        let uris = recorder.started_uris();
        assert_eq!(uris.len(), 2, "stop must tear down, restart must rebuild");
        assert!(uris.iter().all(|u| u.contains(&port.to_string())));
    }

    #[tokio::test]
    async fn test_retry_ceiling_promotes_to_fatal() {
        let factory = MockPipelineFactory::new(MockDecodePipeline::failing());
        let config = test_config(TransportKind::WebSocket, PortRange::new(18300, 18350), 2);
        let (cmd_tx, mut event_rx, handle) = spawn_worker(config, factory);

        cmd_tx.send(WorkerCommand::Init).await.expect("init");
        assert!(matches!(
            event_rx.recv().await,
            Some(WorkerEvent::PortSelected { .. })
        ));

        cmd_tx
            .send(WorkerCommand::Start { force: false })
            .await
            .expect("start");

        // First failure is below the ceiling of 2: transient, reinit with
        // a fresh port. Second failure hits the ceiling: fatal.
        assert_eq!(
            event_rx.recv().await,
            Some(WorkerEvent::Error {
                message: "Decode pipeline failed: mock pipeline start failure".to_string(),
                fatal: false
            })
        );
        assert!(matches!(
            event_rx.recv().await,
            Some(WorkerEvent::PortSelected { .. })
        ));
        assert!(matches!(
            event_rx.recv().await,
            Some(WorkerEvent::Error { fatal: true, .. })
        ));

        cmd_tx.send(WorkerCommand::Terminate).await.expect("terminate");
        assert_eq!(event_rx.recv().await, Some(WorkerEvent::Closed));
        handle.await.expect("worker task");
    }

    #[tokio::test]
    async fn test_port_exhaustion_is_fatal_and_never_ready() {
        // Occupy a single-port range so the scan must exhaust.
        let taken = std::net::TcpListener::bind(("0.0.0.0", 0)).expect("bind");
        let port = taken.local_addr().expect("addr").port();
        let factory = MockPipelineFactory::new(MockDecodePipeline::with_script(vec![
            PipelineEvent::Ready,
        ]));
        let config = test_config(TransportKind::Rtmp, PortRange::new(port, port), 3);
        let (cmd_tx, mut event_rx, handle) = spawn_worker(config, factory);

        cmd_tx.send(WorkerCommand::Init).await.expect("init");
        assert!(matches!(
            event_rx.recv().await,
            Some(WorkerEvent::Error { fatal: true, .. })
        ));

        // Start in the error state is ignored; no ready ever follows.
        cmd_tx
            .send(WorkerCommand::Start { force: false })
            .await
            .expect("start");
        cmd_tx.send(WorkerCommand::Terminate).await.expect("terminate");
        assert_eq!(event_rx.recv().await, Some(WorkerEvent::Closed));
        handle.await.expect("worker task");
    }
}
