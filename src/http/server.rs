//! HTTP server setup and the connection loop.
//!
//! # Responsibilities
//! - Create the Axum Router with the dispatcher and tracing middleware
//! - Accept connections under the connection limit
//! - Serve each connection on its own task, HTTP/1.1 and HTTP/2, upgrades on
//! - Drain connections on shutdown

use axum::{extract::ConnectInfo, http::Request, Router};
use hyper::{body::Incoming, service::service_fn};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tower::ServiceExt;
use tower_http::trace::TraceLayer;
use tracing::Instrument;

use crate::config::ProxyConfig;
use crate::http::dispatch::dispatch;
use crate::http::forward::{upstream_client, UpstreamClient};
use crate::lifecycle::ShutdownReason;
use crate::net::connection::ConnectionTracker;
use crate::net::listener::{ConnectionPermit, Listener, ListenerError};

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub client: UpstreamClient,
    pub connect_timeout: Duration,
    pub tracker: ConnectionTracker,
}

impl AppState {
    pub fn new(config: &ProxyConfig, tracker: ConnectionTracker) -> Self {
        Self {
            client: upstream_client(),
            connect_timeout: config.timeouts.connect(),
            tracker,
        }
    }
}

/// HTTP server for the forward proxy.
pub struct HttpServer {
    router: Router,
    config: ProxyConfig,
    tracker: ConnectionTracker,
}

impl HttpServer {
    /// Create a new HTTP server with the given configuration.
    pub fn new(config: ProxyConfig) -> Self {
        let tracker = ConnectionTracker::new();
        let state = AppState::new(&config, tracker.clone());
        let router = Self::build_router(state);

        Self {
            router,
            config,
            tracker,
        }
    }

    /// Build the Axum router. Everything goes through the dispatcher, which
    /// also sees CONNECT requests whose target has no path at all.
    fn build_router(state: AppState) -> Router {
        Router::new()
            .fallback(dispatch)
            .with_state(state)
            .layer(TraceLayer::new_for_http())
    }

    /// Run the server until `shutdown` fires, then drain open connections.
    pub async fn run(
        self,
        listener: Listener,
        mut shutdown: broadcast::Receiver<ShutdownReason>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(
            address = %addr,
            max_connections = listener.max_connections(),
            "HTTP server starting"
        );

        let builder = auto::Builder::new(TokioExecutor::new());

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer, permit)) => self.spawn_connection(stream, peer, permit, &builder),
                    Err(ListenerError::Closed) => break,
                    Err(e) => {
                        // Typically fd exhaustion; back off instead of spinning.
                        tracing::warn!(error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
                reason = shutdown.recv() => {
                    let reason = reason.unwrap_or(ShutdownReason::Requested);
                    tracing::info!(
                        %reason,
                        open_connections = listener.max_connections() - listener.available_permits(),
                        "Shutdown requested, no longer accepting connections"
                    );
                    break;
                }
            }
        }
        drop(listener);

        self.tracker.drain();
        let grace = self.config.timeouts.shutdown_grace();
        if tokio::time::timeout(grace, self.tracker.wait_for_shutdown())
            .await
            .is_err()
        {
            tracing::warn!(
                remaining = self.tracker.active_count(),
                grace_secs = grace.as_secs(),
                "Grace period elapsed with connections still open"
            );
        }

        tracing::info!("HTTP server stopped");
        Ok(())
    }

    /// Serve one client connection on its own task.
    fn spawn_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        permit: ConnectionPermit,
        builder: &auto::Builder<TokioExecutor>,
    ) {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
        }

        let guard = self.tracker.track();
        let span = tracing::info_span!("connection", id = %guard.id(), peer = %peer);
        let router = self.router.clone();
        let tracker = self.tracker.clone();
        let builder = builder.clone();

        tokio::spawn(
            async move {
                let _permit = permit;
                let _guard = guard;

                let service = service_fn(move |mut request: Request<Incoming>| {
                    request.extensions_mut().insert(ConnectInfo(peer));
                    router.clone().oneshot(request)
                });

                let conn = builder.serve_connection_with_upgrades(TokioIo::new(stream), service);
                tokio::pin!(conn);

                let result = tokio::select! {
                    result = conn.as_mut() => result,
                    _ = tracker.draining() => {
                        conn.as_mut().graceful_shutdown();
                        conn.await
                    }
                };

                if let Err(e) = result {
                    tracing::debug!(error = %e, "Connection ended with error");
                }
            }
            .instrument(span),
        );
    }
}
