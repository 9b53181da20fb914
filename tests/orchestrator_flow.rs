//! Channel lifecycle: flush policy, worker supervision, failure surfacing,
//! and teardown, driven through in-process workers with scripted pipelines.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use streamscribe::config::{Config, PortRange};
use streamscribe::error::{Result, StreamscribeError};
use streamscribe::ingest::decode::{
    MockDecodePipeline, MockPipelineFactory, PipelineEvent, PipelineFactory,
};
use streamscribe::ingest::orchestrator::{
    ChannelMode, ChannelOutput, ChannelStatus, LocalSpawner, StreamOrchestrator, WorkerConnection,
    WorkerSpawner,
};
use streamscribe::ingest::ports::TransportKind;
use streamscribe::transcription::engine::TranscriptKind;
use tokio::sync::mpsc;
use tokio::time::{Duration, timeout};

/// One second of audio at 16kHz/16-bit is 32000 bytes; 20ms is 640.
const FLUSH_BYTES: usize = 640;

fn test_config(ws_ports: PortRange) -> Config {
    let mut config = Config::default();
    config.audio.min_buffer_duration_ms = 20;
    config.audio.ring_capacity_ms = 1000;
    config.ingest.websocket_ports = ws_ports;
    config.ingest.respawn_ceiling = 1;
    config
}

fn orchestrator_with_pipeline(
    config: Config,
    pipeline: MockDecodePipeline,
) -> StreamOrchestrator {
    let shared = Arc::new(config.clone());
    let spawner = Arc::new(LocalSpawner::new(shared, move |_| {
        Box::new(MockPipelineFactory::new(pipeline.clone())) as Box<dyn PipelineFactory>
    }));
    StreamOrchestrator::with_spawner(config, spawner)
}

async fn next_output(
    outputs: &mut mpsc::Receiver<ChannelOutput>,
) -> Option<ChannelOutput> {
    timeout(Duration::from_secs(5), outputs.recv())
        .await
        .expect("channel output within deadline")
}

#[tokio::test]
async fn buffer_flush_hands_audio_to_recognition() {
    let pipeline = MockDecodePipeline::with_script(vec![
        PipelineEvent::Ready,
        PipelineEvent::Pcm(vec![1u8; FLUSH_BYTES]),
    ]);
    let mut orchestrator = orchestrator_with_pipeline(
        test_config(PortRange::new(28100, 28150)),
        pipeline,
    );

    let (_handle, mut outputs) = orchestrator
        .start_channel("ch1", ChannelMode::Streams(vec![TransportKind::WebSocket]))
        .await
        .expect("start channel");

    let mut saw_port = false;
    let mut saw_ready = false;
    let mut saw_streaming = false;
    loop {
        match next_output(&mut outputs).await.expect("output") {
            ChannelOutput::Status(ChannelStatus::PortSelected { port, uri, .. }) => {
                assert!((28100..=28150).contains(&port));
                assert!(uri.contains(&port.to_string()));
                saw_port = true;
            }
            ChannelOutput::Status(ChannelStatus::WorkerReady { .. }) => saw_ready = true,
            ChannelOutput::Status(ChannelStatus::WorkerStreaming { .. }) => saw_streaming = true,
            ChannelOutput::Transcript(event) => {
                // Exactly one flush threshold of audio arrived, so the
                // mock backend produced its default final.
                assert_eq!(event.kind, TranscriptKind::Final);
                assert_eq!(event.text, "mock transcription");
                assert_eq!(event.speaker, None);
                break;
            }
            ChannelOutput::Status(other) => panic!("unexpected status {:?}", other),
        }
    }
    assert!(saw_port && saw_ready && saw_streaming);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn sub_threshold_audio_is_buffered_not_flushed() {
    let pipeline = MockDecodePipeline::with_script(vec![
        PipelineEvent::Ready,
        PipelineEvent::Pcm(vec![1u8; FLUSH_BYTES / 2]),
    ]);
    let mut orchestrator = orchestrator_with_pipeline(
        test_config(PortRange::new(28200, 28250)),
        pipeline,
    );

    let (_handle, mut outputs) = orchestrator
        .start_channel("ch1", ChannelMode::Streams(vec![TransportKind::WebSocket]))
        .await
        .expect("start channel");

    // Drain until streaming, then expect silence: half a threshold stays
    // in the buffer.
    loop {
        match next_output(&mut outputs).await.expect("output") {
            ChannelOutput::Status(ChannelStatus::WorkerStreaming { .. }) => break,
            ChannelOutput::Transcript(event) => panic!("unexpected transcript {:?}", event),
            ChannelOutput::Status(_) => {}
        }
    }
    let quiet = timeout(Duration::from_millis(300), outputs.recv()).await;
    assert!(quiet.is_err(), "no transcript should arrive below threshold");

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn duplicate_channel_id_is_rejected() {
    let pipeline = MockDecodePipeline::with_script(vec![PipelineEvent::Ready]);
    let mut orchestrator = orchestrator_with_pipeline(
        test_config(PortRange::new(28300, 28350)),
        pipeline,
    );

    let (_handle, _outputs) = orchestrator
        .start_channel("ch1", ChannelMode::Streams(vec![TransportKind::WebSocket]))
        .await
        .expect("start channel");

    let again = orchestrator
        .start_channel("ch1", ChannelMode::Streams(vec![TransportKind::WebSocket]))
        .await;
    assert!(matches!(
        again,
        Err(StreamscribeError::ChannelActive { .. })
    ));

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn stop_channel_tears_down_and_reports_stopped() {
    let pipeline = MockDecodePipeline::with_script(vec![PipelineEvent::Ready]);
    let mut orchestrator = orchestrator_with_pipeline(
        test_config(PortRange::new(28400, 28450)),
        pipeline,
    );

    let (_handle, mut outputs) = orchestrator
        .start_channel("ch1", ChannelMode::Streams(vec![TransportKind::WebSocket]))
        .await
        .expect("start channel");

    orchestrator.stop_channel("ch1").await.expect("stop");
    assert!(matches!(
        orchestrator.stop_channel("ch1").await,
        Err(StreamscribeError::UnknownChannel { .. })
    ));

    // Teardown ends with a stopped status, then the stream closes.
    loop {
        match next_output(&mut outputs).await {
            Some(ChannelOutput::Status(ChannelStatus::Stopped)) => break,
            Some(_) => {}
            None => panic!("stream closed before stopped status"),
        }
    }
    assert!(next_output(&mut outputs).await.is_none());
}

#[tokio::test]
async fn port_exhaustion_fails_channel_with_final_transcript() {
    // Occupy the only port in the range so the worker's claim exhausts.
    let taken = std::net::TcpListener::bind(("0.0.0.0", 0)).expect("bind");
    let port = taken.local_addr().expect("addr").port();

    let pipeline = MockDecodePipeline::with_script(vec![PipelineEvent::Ready]);
    let mut orchestrator = orchestrator_with_pipeline(
        test_config(PortRange::new(port, port)),
        pipeline,
    );

    let (_handle, mut outputs) = orchestrator
        .start_channel("ch1", ChannelMode::Streams(vec![TransportKind::WebSocket]))
        .await
        .expect("start channel");

    let mut saw_transcript = false;
    let mut saw_failed = false;
    while !(saw_transcript && saw_failed) {
        match next_output(&mut outputs).await.expect("output") {
            ChannelOutput::Transcript(event) => {
                // The stream never ends silently: the failure arrives as
                // one final transcript.
                assert_eq!(event.kind, TranscriptKind::Final);
                assert!(event.text.contains("No free"));
                saw_transcript = true;
            }
            ChannelOutput::Status(ChannelStatus::Failed { message }) => {
                assert!(message.contains("No free"));
                saw_failed = true;
            }
            ChannelOutput::Status(_) => {}
        }
    }

    orchestrator.shutdown().await;
}

/// Spawner whose workers die immediately: the event stream closes right
/// after spawn, as if the child process crashed.
struct CrashingSpawner {
    spawns: AtomicUsize,
}

#[async_trait]
impl WorkerSpawner for CrashingSpawner {
    async fn spawn(&self, _transport: TransportKind) -> Result<WorkerConnection> {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        let (cmd_tx, mut cmd_rx) = mpsc::channel(16);
        let (_event_tx, event_rx) = mpsc::channel(16);
        // Accept commands so init/start delivery succeeds, then vanish.
        tokio::spawn(async move { while cmd_rx.recv().await.is_some() {} });
        Ok(WorkerConnection {
            commands: cmd_tx,
            events: event_rx,
        })
    }
}

#[tokio::test]
async fn crashed_worker_is_respawned_up_to_the_ceiling() {
    let spawner = Arc::new(CrashingSpawner {
        spawns: AtomicUsize::new(0),
    });
    let mut orchestrator = StreamOrchestrator::with_spawner(
        test_config(PortRange::new(28500, 28550)),
        spawner.clone(),
    );

    let (_handle, mut outputs) = orchestrator
        .start_channel("ch1", ChannelMode::Streams(vec![TransportKind::WebSocket]))
        .await
        .expect("start channel");

    let mut saw_restart = false;
    let mut saw_failed = false;
    while !(saw_restart && saw_failed) {
        match next_output(&mut outputs).await.expect("output") {
            ChannelOutput::Status(ChannelStatus::WorkerRestarted { .. }) => saw_restart = true,
            ChannelOutput::Status(ChannelStatus::Failed { message }) => {
                assert!(message.contains("crashed"));
                saw_failed = true;
            }
            _ => {}
        }
    }

    // Original spawn plus one respawn (ceiling is 1).
    assert_eq!(spawner.spawns.load(Ordering::SeqCst), 2);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn conference_mode_attributes_transcripts_to_dominant_speaker() {
    let pipeline = MockDecodePipeline::with_script(Vec::new());
    let mut orchestrator = orchestrator_with_pipeline(
        test_config(PortRange::new(28600, 28650)),
        pipeline,
    );

    let (handle, mut outputs) = orchestrator
        .start_channel("conf", ChannelMode::Conference)
        .await
        .expect("start channel");

    let loud_frame: Vec<u8> = std::iter::repeat(8000i16)
        .take(320)
        .flat_map(|s| s.to_le_bytes())
        .collect();
    for _ in 0..10 {
        handle
            .add_participant_audio("alice", loud_frame.clone(), Some("Alice"))
            .await;
    }

    loop {
        match next_output(&mut outputs).await.expect("output") {
            ChannelOutput::Transcript(event) if event.kind == TranscriptKind::Final => {
                assert_eq!(event.text, "mock transcription");
                assert_eq!(event.speaker, Some("alice".to_string()));
                break;
            }
            _ => {}
        }
    }

    orchestrator.shutdown().await;
}
