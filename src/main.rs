//! Forward HTTP proxy.
//!
//! # Architecture Overview
//!
//! ```text
//!                       ┌──────────────────────────────────────────────────┐
//!                       │                  FORWARD PROXY                   │
//!   Client              │  ┌──────────┐   ┌──────────┐   ┌──────────────┐  │
//!   ────────────────────┼─▶│   net    │──▶│   http   │──▶│   dispatch   │  │
//!                       │  │ listener │   │  server  │   └──┬────┬───┬──┘  │
//!                       │  └──────────┘   └──────────┘      │    │   │     │
//!                       │                    /health ◀──────┘    │   │     │
//!                       │                                        │   │     │
//!                       │   ┌─────────────┐     plaintext        │   │     │
//!                       │   │   forward   │◀─────────────────────┘   │     │
//!                       │   │ hyper client│──────────────────────────┼─────┼──▶ Origin
//!                       │   └─────────────┘                CONNECT   │     │
//!                       │   ┌─────────────┐◀─────────────────────────┘     │
//!                       │   │   tunnel    │  dial + upgrade + relay        │
//!                       │   └─────────────┘────────────────────────────────┼──▶ Destination
//!                       └──────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

use forward_proxy::config::{load_config, validation::validate_config, ConfigError, ProxyConfig};
use forward_proxy::lifecycle::{signals, Shutdown};
use forward_proxy::net::listener::Listener;
use forward_proxy::observability::{logging, metrics};
use forward_proxy::HttpServer;

#[derive(Parser)]
#[command(name = "forward-proxy", version)]
#[command(about = "Forward HTTP proxy with CONNECT tunneling", long_about = None)]
struct Cli {
    /// TOML configuration file; defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overriding `listener.bind_address`.
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.listener.bind_address = bind;
        validate_config(&config).map_err(ConfigError::Validation)?;
    }

    logging::init_logging(&config.observability);

    tracing::info!("forward-proxy v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        bind_address = %config.listener.bind_address,
        max_connections = config.listener.max_connections,
        connect_timeout_secs = config.timeouts.connect_secs,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse::<SocketAddr>() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let listener = Listener::bind(&config.listener).await?;

    let shutdown = Shutdown::new();
    let server = HttpServer::new(config);
    let mut server_task = tokio::spawn(server.run(listener, shutdown.subscribe()));

    tokio::select! {
        result = &mut server_task => {
            result??;
            return Ok(());
        }
        reason = signals::wait_for_signal() => shutdown.trigger(reason),
    }

    server_task.await??;

    tracing::info!("Shutdown complete");
    Ok(())
}
