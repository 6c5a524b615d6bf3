use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::prelude::*;

use term_bridge::bridge::Bridge;
use term_bridge::config::{
    BridgeConfig, CliOverrides, check_launcher, extract_file_config, render_file_config,
    resolve_config_dir,
};
use term_bridge::coprocess::PkillReaper;
use term_bridge::host::Host;
use term_bridge::host::tmux::TmuxHost;
use term_bridge::janitor::SocketJanitor;
use term_bridge::server::{BridgeServer, shutdown_signal};

#[derive(Parser)]
#[command(name = "term-bridge")]
#[command(about = "Bridge terminal multiplexer sessions to a remote client over a Unix socket")]
struct Cli {
    /// Socket the client connects to (overrides bridge.socket_path)
    socket_path: Option<PathBuf>,

    /// Config directory (defaults to ~/.term-bridge)
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// Capture launcher executable
    #[arg(long)]
    launcher: Option<PathBuf>,

    /// tmux server socket name (tmux -L)
    #[arg(long)]
    tmux_socket: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Print the merged configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "term_bridge=debug,screen_render=debug,info"
    } else {
        "term_bridge=info,screen_render=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let config_dir = resolve_config_dir(cli.config_dir.clone())?;
    if cli.print_config {
        let file_config = extract_file_config(&config_dir)?;
        print!("{}", render_file_config(&file_config)?);
        return Ok(());
    }

    let overrides = CliOverrides {
        socket_path: cli.socket_path,
        launcher: cli.launcher,
        tmux_socket: cli.tmux_socket,
    };
    let config = BridgeConfig::load(&config_dir, &overrides)
        .with_context(|| format!("Failed to load config from {}", config_dir.display()))?;
    info!("Config directory: {}", config_dir.display());

    check_launcher(&config.capture.launcher).context("Capture launcher check failed")?;
    info!("Using capture launcher {}", config.capture.launcher.display());

    let host = TmuxHost::start(&config.tmux);
    host.probe().await.context("Cannot reach the terminal host")?;

    let janitor = SocketJanitor::new();
    let bridge = Bridge::new(
        Arc::new(host),
        Arc::new(config),
        janitor.clone(),
        Arc::new(PkillReaper),
    );
    let server = BridgeServer::bind(bridge, janitor).context("Failed to start bridge")?;

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown requested, cleaning up...");
        trigger.cancel();
    });

    server.run(shutdown).await;
    Ok(())
}
