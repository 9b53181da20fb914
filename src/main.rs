use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use streamscribe::cli::{Cli, Commands, ConfigAction};
use streamscribe::config::Config;
use streamscribe::ingest::orchestrator::{ChannelMode, ChannelOutput, StreamOrchestrator};
use streamscribe::ingest::ports::TransportKind;
use streamscribe::transcription::engine::TranscriptKind;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(Config::default_path);

    match cli.command {
        Commands::Run { channel, transport } => {
            let config = Config::load_or_default(&config_path)?;
            run_service(config, config_path, &channel, &transport).await?;
        }
        Commands::Worker { transport } => {
            let config = Config::load_or_default(&config_path)?;
            let transport: TransportKind = transport.parse()?;
            streamscribe::ingest::worker::run_worker_process(transport, &config).await?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let config = Config::load_or_default(&config_path)?;
                print!("{}", config.to_toml());
            }
            ConfigAction::Path => {
                println!("{}", config_path.display());
            }
        },
    }

    Ok(())
}

/// Install the tracing subscriber.
///
/// Logs always go to stderr: in worker mode stdout carries the event
/// protocol, and the service prints transcripts there.
fn init_tracing(verbose: u8) {
    use tracing_subscriber::EnvFilter;

    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("streamscribe={}", default_level)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Run the transcription service in the foreground until Ctrl+C.
async fn run_service(
    config: Config,
    config_path: PathBuf,
    channel: &str,
    transports: &[String],
) -> Result<()> {
    let transports = transports
        .iter()
        .map(|t| t.parse::<TransportKind>())
        .collect::<streamscribe::error::Result<Vec<_>>>()?;

    let mut orchestrator = StreamOrchestrator::new(config, config_path)?;
    let (_handle, mut outputs) = orchestrator
        .start_channel(channel, ChannelMode::Streams(transports))
        .await?;

    tracing::info!(version = %streamscribe::version_string(), "streamscribe started");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                break;
            }
            output = outputs.recv() => match output {
                Some(ChannelOutput::Transcript(event)) => {
                    let marker = match event.kind {
                        TranscriptKind::Partial => "...",
                        TranscriptKind::Final => "==>",
                    };
                    match &event.speaker {
                        Some(speaker) => {
                            println!("{} [{:.2}-{:.2}] {}: {}", marker, event.start, event.end, speaker, event.text)
                        }
                        None => {
                            println!("{} [{:.2}-{:.2}] {}", marker, event.start, event.end, event.text)
                        }
                    }
                }
                Some(ChannelOutput::Status(status)) => {
                    tracing::info!(?status, "channel status");
                }
                None => {
                    tracing::warn!("channel output closed");
                    break;
                }
            }
        }
    }

    orchestrator.shutdown().await;
    Ok(())
}
