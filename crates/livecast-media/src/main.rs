//! Livecast media server
//!
//! Accepts browser producer connections over WebSocket and relays each one
//! into its own encoder subprocess publishing to the RTMP ingest.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use livecast_core::config::load_config;
use livecast_media::readiness::{ReadinessGate, RetryPolicy};
use livecast_media::server::{AppState, build_router};
use livecast_media::session::{ManagerConfig, SessionManager};
use livecast_media::streams::{StreamStore, StreamUrls};
use livecast_media::transcoder::{SupervisorConfig, TranscoderSupervisor};

#[derive(Parser, Debug)]
#[command(name = "livecast-media")]
#[command(version, about = "Livecast media server - WebSocket ingest to RTMP")]
struct Args {
    /// Config file (JSON). Defaults to the global settings file when present.
    #[arg(long, env = "LIVECAST_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP/WebSocket bind address (overrides config)
    #[arg(long)]
    addr: Option<SocketAddr>,

    /// RTMP ingest host (overrides config)
    #[arg(long)]
    downstream_host: Option<String>,

    /// Path to the encoder binary (overrides config)
    #[arg(long)]
    ffmpeg_bin: Option<PathBuf>,

    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long, default_value = "info", env = "LIVECAST_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "LIVECAST_LOG_JSON")]
    log_json: bool,

    /// Seconds to wait for sessions to close on shutdown.
    #[arg(long, default_value_t = 10, env = "LIVECAST_SHUTDOWN_TIMEOUT")]
    shutdown_timeout: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_filter = format!("livecast_media={}", args.log_level);
    livecast_core::tracing_init::init_tracing(&log_filter, args.log_json);

    let mut config = load_config(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.server.bind_addr = addr;
    }
    if let Some(host) = args.downstream_host {
        config.downstream.host = host;
    }
    if let Some(bin) = args.ffmpeg_bin {
        config.transcoder.program = bin;
    }
    livecast_core::config::validate(&config)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.server.bind_addr,
        downstream = %config.downstream.endpoint(),
        encoder = %config.transcoder.program.display(),
        "Starting livecast-media"
    );

    let gate = ReadinessGate::tcp(
        RetryPolicy {
            max_attempts: config.downstream.readiness_max_attempts,
            retry_delay: config.downstream.readiness_retry_delay(),
        },
        config.downstream.readiness_connect_timeout(),
    );
    let supervisor = TranscoderSupervisor::new(SupervisorConfig::from_config(
        &config.transcoder,
        &config.downstream,
    ));
    let manager = SessionManager::new(
        gate,
        supervisor,
        ManagerConfig {
            downstream_endpoint: config.downstream.endpoint(),
            relay_capacity: config.relay.capacity_chunks,
            drain_timeout: config.transcoder.drain_timeout(),
            ..ManagerConfig::default()
        },
    );
    let streams = StreamStore::new(
        &config.server.stream_key_secret,
        StreamUrls {
            public_host: config.server.public_host.clone(),
            rtmp_port: config.downstream.port,
            rtmp_app: config.downstream.app.clone(),
            playback_port: config.downstream.playback_port,
            ws_port: config.server.bind_addr.port(),
        },
    );

    let app = build_router(AppState {
        manager: manager.clone(),
        streams,
        max_message_bytes: config.server.max_message_bytes,
    });
    let listener = tokio::net::TcpListener::bind(config.server.bind_addr).await?;
    info!(addr = %config.server.bind_addr, "Media server ready");

    let shutdown_timeout = Duration::from_secs(args.shutdown_timeout);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Close producer sockets first; upgraded connections outlive the listener.
            stop_sessions(&manager, shutdown_timeout).await;
        })
        .await?;

    info!("Media server stopped");
    Ok(())
}

async fn stop_sessions(manager: &SessionManager, timeout: Duration) {
    if !manager.shutdown(timeout).await {
        let remaining = manager.registry().len().await;
        warn!(remaining, "Some sessions did not close before exit");
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        () = sigterm => {
            info!("Received SIGTERM shutdown signal");
        }
    }
}
