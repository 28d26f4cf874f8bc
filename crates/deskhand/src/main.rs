use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use deskconf::DeskConfig;
use liveosc::{LiveBridge, OscTransport};
use tokio_util::sync::CancellationToken;
use tracing::info;

use deskhand::agent::AgentLoop;
use deskhand::channel::{self, AppState};
use deskhand::sessions::SessionRegistry;
use deskhand::{telemetry, web};

/// The Deskhand server
///
/// Mediates between a live DAW session and a chat agent: mirrors the mixer,
/// observes parameter changes, and drives the DAW through agent tool calls.
///
/// Configuration is loaded from (in order, later wins):
/// 1. Compiled defaults
/// 2. /etc/deskhand/config.toml
/// 3. ~/.config/deskhand/config.toml
/// 4. ./deskhand.toml (or --config path)
/// 5. Environment variables (DESKHAND_*)
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to config file (overrides ./deskhand.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Show loaded configuration and exit
    #[arg(long)]
    show_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config, sources) = DeskConfig::load_with_sources_from(cli.config.as_deref())
        .context("Failed to load configuration")?;

    if cli.show_config {
        println!("# Configuration sources:");
        for path in &sources.files {
            println!("#   - {}", path.display());
        }
        if !sources.env_overrides.is_empty() {
            println!("# Environment overrides:");
            for var in &sources.env_overrides {
                println!("#   - {}", var);
            }
        }
        println!();
        println!("{}", config.to_toml());
        return Ok(());
    }

    telemetry::init(&config.telemetry.log_level);

    info!("📋 Configuration loaded from:");
    for path in &sources.files {
        info!("   - {}", path.display());
    }
    if !sources.env_overrides.is_empty() {
        info!("   Environment overrides: {:?}", sources.env_overrides);
    }

    // --- OSC transport ---
    let remote_addr = config.osc.remote_addr();
    let remote: SocketAddr = tokio::net::lookup_host(&remote_addr)
        .await
        .with_context(|| format!("Failed to resolve DAW endpoint {}", remote_addr))?
        .next()
        .with_context(|| format!("DAW endpoint {} resolved to nothing", remote_addr))?;

    info!("🎛️  Binding OSC transport on port {}...", config.osc.local_port);
    let transport = Arc::new(
        OscTransport::bind(config.osc.local_port, remote)
            .await
            .context("Failed to bind local OSC port")?,
    );
    let bridge = Arc::new(LiveBridge::new(
        transport,
        config.osc.liveness_timeout(),
        config.osc.query_timeout(),
    ));

    // --- Liveness probe (one retry) ---
    info!("🔌 Probing DAW at {}...", remote_addr);
    let mut live = bridge.is_live().await;
    if !live {
        info!("   No reply, retrying once...");
        live = bridge.is_live().await;
    }
    if !live {
        anyhow::bail!(
            "DAW unreachable at {} (no reply to the liveness probe within {} ms). \
             Is the remote script loaded and listening?",
            remote_addr,
            config.osc.liveness_timeout_ms
        );
    }
    info!("   DAW answered");

    // --- Sessions and agent ---
    let registry = Arc::new(SessionRegistry::new(
        bridge.clone(),
        config.observer.clone(),
    ));
    let agent = Arc::new(
        AgentLoop::new(&config.agent, bridge.clone())
            .context("Failed to initialize the chat agent")?,
    );
    info!("🤖 Agent ready (model: {})", config.agent.model);

    // --- HTTP server ---
    let app_state = AppState {
        registry: registry.clone(),
        agent,
        bridge: bridge.clone(),
    };
    let health_state = web::HealthState {
        registry: registry.clone(),
        daw_host: config.osc.remote_host.clone(),
        daw_port: config.osc.remote_port,
        started_at: Instant::now(),
    };
    let app = channel::router(app_state).merge(web::router(health_state));

    let http_addr = config.bind.http_bind_addr();
    let bind_addr: SocketAddr = http_addr.parse().context("Failed to parse bind address")?;
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", http_addr))?;

    info!("🎚️  Deskhand starting on http://{}", http_addr);
    info!("   Client channel: ws://{}/ws?sessionId=...&projectId=...", http_addr);
    info!("   Health: GET http://{}/health", http_addr);

    let shutdown_token = CancellationToken::new();
    let server_token = shutdown_token.clone();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        server_token.cancelled().await;
        info!("Server shutdown signal received");
    });
    tokio::spawn(async move {
        if let Err(e) = server.await {
            tracing::error!("Server shutdown with error: {:?}", e);
        }
    });

    info!("🎚️  Server ready.");

    // Handle both SIGINT (Ctrl+C) and SIGTERM
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT (Ctrl+C), shutting down gracefully...");
        }
        _ = async {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut sigterm = signal(SignalKind::terminate()).expect("Failed to setup SIGTERM handler");
                sigterm.recv().await;
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
    }

    shutdown_token.cancel();

    // Unsubscribe every observed parameter best-effort before the transport
    // goes away.
    registry.shutdown().await;

    info!("Shutdown complete");
    Ok(())
}
