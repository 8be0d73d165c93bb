use anyhow::Context;
use clap::Parser;
use room_engine::EngineConfig;
use std::path::PathBuf;

/// Betritt einen Audio-Raum über WebSocket Signaling
#[derive(Parser, Debug)]
#[command(name = "room-engine", version, about)]
struct Args {
    /// WebSocket URL des Signaling-Servers
    #[arg(long, env = "SIGNALING_URL")]
    signaling_url: String,

    #[arg(long, env = "ROOM_ID")]
    room_id: String,

    /// Eigene Peer-ID, sonst eine zufällige UUID
    #[arg(long)]
    peer_id: Option<String>,

    /// JSON-Konfiguration
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    room_engine::init_tracing();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => EngineConfig::default(),
    };
    config.validate().context("invalid configuration")?;

    let peer_id = args
        .peer_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    room_engine::run(&args.signaling_url, &args.room_id, &peer_id, config)
        .await
        .context("room session failed")?;

    Ok(())
}
