//! Capture launcher run by the host as a session's coprocess.
//!
//! stdin carries the session's terminal output and is forwarded to the
//! bridge's capture socket. Bytes coming back on the socket are keystrokes
//! and go to stdout, which the host feeds to the session as input.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tracing::{debug, info};
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(name = "term-bridge-capture")]
#[command(about = "Pump a session's terminal output into a term-bridge capture socket")]
struct Args {
    /// Session this capture belongs to
    session_id: String,

    /// Capture socket the bridge is listening on
    socket_path: PathBuf,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    // stdout is the session's input, so logs must stay on stderr.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let stream = UnixStream::connect(&args.socket_path)
        .await
        .with_context(|| format!("Failed to connect to {}", args.socket_path.display()))?;
    info!(session_id = %args.session_id, "Capture connected");
    let (mut from_bridge, mut to_bridge) = stream.into_split();

    let upstream = async {
        let mut stdin = tokio::io::stdin();
        let copied = tokio::io::copy(&mut stdin, &mut to_bridge).await?;
        to_bridge.shutdown().await?;
        Ok::<u64, std::io::Error>(copied)
    };
    let downstream = async {
        let mut stdout = tokio::io::stdout();
        let copied = tokio::io::copy(&mut from_bridge, &mut stdout).await?;
        stdout.flush().await?;
        Ok::<u64, std::io::Error>(copied)
    };

    tokio::select! {
        result = upstream => {
            let bytes = result.context("Forwarding session output failed")?;
            debug!(session_id = %args.session_id, "Session output closed after {} bytes", bytes);
        }
        result = downstream => {
            let bytes = result.context("Forwarding keystrokes failed")?;
            debug!(session_id = %args.session_id, "Bridge closed the socket after {} input bytes", bytes);
        }
    }
    Ok(())
}
