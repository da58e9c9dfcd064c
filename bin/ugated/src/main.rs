//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Binary entrypoint for the UGate daemon."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use ugate_common::config::GatewayConfig;
use ugate_common::logging::init_tracing;
use ugate_core::{replay_from_file, GatewayRuntime, LoopbackLink, PacketDispatcher};
use ugate_metrics::{new_registry, spawn_http_server, DaemonMetrics, GatewayMetrics, SharedRegistry};
use ugate_protocol::{
    ChannelEffectSink, Effect, EffectEnvelope, EffectSink, ImageMetadata, NodeAddress,
    ProtocolError,
};

#[derive(Debug, Parser)]
#[command(author, version, about = "UGate home-security gateway daemon", long_about = None)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the gateway")]
    Run,
    #[command(about = "Replay recorded radio frames and print the resulting effects as JSON lines")]
    Replay {
        #[arg(value_name = "FILE", help = "Newline-delimited JSON frame records")]
        file: PathBuf,
        #[arg(long, value_name = "ADDR", help = "Only replay data frames from this node")]
        source: Option<NodeAddress>,
    },
    #[command(about = "Validate the configuration and exit")]
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/ugate.toml"));
    candidates.push(PathBuf::from("configs/ugate.dev.toml"));

    let load_started = Instant::now();
    let loaded_config = GatewayConfig::load_with_source(&candidates)?;
    let config = loaded_config.config;
    let config_path = loaded_config.source;
    let load_duration = load_started.elapsed();

    let metrics_registry = new_registry();
    let daemon_metrics = DaemonMetrics::new(metrics_registry.clone())?;
    daemon_metrics.observe_config_load(load_duration.as_secs_f64());
    daemon_metrics.inc_start();
    daemon_metrics.set_build_info(env!("CARGO_PKG_VERSION"));

    init_tracing("ugated", &config.logging)?;
    info!(config_path = %config_path.display(), nodes = config.radio.nodes.len(), "configuration loaded");

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_daemon(config, metrics_registry).await?,
        Commands::Replay { file, source } => {
            let dispatcher = PacketDispatcher::from_config(&config)?;
            let replayed = replay_from_file(&dispatcher, &StdoutSink, &file, source)
                .with_context(|| format!("failed to replay {}", file.display()))?;
            info!(frames = replayed, file = %file.display(), "replay finished");
        }
        Commands::CheckConfig => {
            println!("configuration OK: {}", config_path.display());
        }
    }

    Ok(())
}

async fn run_daemon(config: GatewayConfig, registry: SharedRegistry) -> Result<()> {
    let metrics_server = if config.metrics.enabled {
        info!(address = %config.metrics.listen, "metrics exporter enabled");
        Some(spawn_http_server(registry.clone(), config.metrics.listen)?)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };
    let gateway_metrics = GatewayMetrics::new(registry)?;

    let (sink, effects) = ChannelEffectSink::channel();
    // No modem driver is attached; outbound frames go to the loopback link.
    let link = Arc::new(LoopbackLink::new());
    let runtime = Arc::new(GatewayRuntime::from_config(
        &config,
        link,
        Arc::new(sink),
        Some(gateway_metrics),
    )?);

    let (shutdown_tx, _) = broadcast::channel(1);
    let (frames_tx, frames_rx) = mpsc::channel(config.radio.link_buffer);
    let handle = runtime.clone().spawn(frames_rx, shutdown_tx.subscribe());
    let collaborator = tokio::spawn(consume_effects(effects, config.image.output_dir.clone()));

    info!(nodes = ?runtime.dispatcher().nodes(), "gateway running; waiting for termination signal");
    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");
    let _ = shutdown_tx.send(());
    drop(frames_tx);

    let processed = handle.join().await?;
    drop(runtime);
    collaborator.await.context("effect consumer task failed")?;
    info!(frames = processed, "gateway stopped");

    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }
    Ok(())
}

/// Minimal collaborator: saves images and logs every other effect.
async fn consume_effects(mut effects: mpsc::UnboundedReceiver<EffectEnvelope>, output_dir: PathBuf) {
    while let Some(envelope) = effects.recv().await {
        match envelope.effect {
            Effect::PersistImage { bytes, metadata } => {
                if let Err(err) = persist_image(&output_dir, &metadata, &bytes).await {
                    warn!(effect_id = %envelope.id, error = %err, "failed to save image");
                }
            }
            Effect::Notify(notification) => {
                let payload = serde_json::to_string(&notification).unwrap_or_default();
                info!(effect_id = %envelope.id, kind = notification.kind(), payload = %payload, "notification");
            }
            Effect::Warn(message) => warn!(effect_id = %envelope.id, "{message}"),
            Effect::PlaySound(kind) => debug!(effect_id = %envelope.id, ?kind, "sound cue"),
            Effect::Retransmit { address, .. } => {
                debug!(effect_id = %envelope.id, node = %address, "capture resend scheduled")
            }
        }
    }
}

async fn persist_image(dir: &Path, metadata: &ImageMetadata, bytes: &[u8]) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("unable to create image directory {}", dir.display()))?;
    let path = dir.join(format!("{}-{}", metadata.source, metadata.file_name));
    tokio::fs::write(&path, bytes)
        .await
        .with_context(|| format!("unable to write image {}", path.display()))?;
    info!(path = %path.display(), bytes = bytes.len(), "image saved");
    Ok(path)
}

/// Prints each effect envelope as one JSON line.
struct StdoutSink;

impl EffectSink for StdoutSink {
    fn emit(&self, envelope: EffectEnvelope) -> Result<(), ProtocolError> {
        println!("{}", serde_json::to_string(&envelope)?);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "stdout"
    }
}
