//! CONNECT tunneling.
//!
//! # Data Flow
//! ```text
//! CONNECT host:port
//!     → dial destination (bounded by timeouts.connect_secs)
//!     → 503 + error text on failure, connection stays plain HTTP
//!     → 200, then hyper hands over the raw client connection
//!     → relay.rs copies both directions until both are done
//! ```
//!
//! # States
//! ```text
//! Dialing → (Failed | Connected) → Hijacking → (HijackFailed | Relaying) → Closed
//! ```

pub mod relay;

use std::net::SocketAddr;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    response::{IntoResponse, Response},
};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::Instrument;

use crate::http::server::AppState;
use crate::net::dial::{dial, DialError};
use crate::observability::metrics;

pub use relay::{relay, Direction, RelayStats, Transfer};

/// Where a tunnel is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Dialing,
    Failed,
    Connected,
    Hijacking,
    HijackFailed,
    Relaying,
    Closed,
}

impl std::fmt::Display for TunnelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TunnelState::Dialing => "dialing",
            TunnelState::Failed => "failed",
            TunnelState::Connected => "connected",
            TunnelState::Hijacking => "hijacking",
            TunnelState::HijackFailed => "hijack_failed",
            TunnelState::Relaying => "relaying",
            TunnelState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Failure to open a tunnel. Each maps to the response the client gets.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("CONNECT must be to a host:port")]
    MissingAuthority,

    #[error(transparent)]
    Dial(#[from] DialError),

    #[error("webserver doesn't support hijacking")]
    HijackUnsupported,
}

impl IntoResponse for TunnelError {
    fn into_response(self) -> Response {
        let status = match self {
            TunnelError::MissingAuthority => StatusCode::BAD_REQUEST,
            TunnelError::Dial(_) => StatusCode::SERVICE_UNAVAILABLE,
            TunnelError::HijackUnsupported => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

/// The `host:port` a CONNECT request asks for.
pub fn requested_authority<B>(request: &Request<B>) -> Option<String> {
    request
        .uri()
        .authority()
        .map(|authority| authority.to_string())
        .or_else(|| {
            request
                .headers()
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .filter(|host| !host.is_empty())
                .map(str::to_string)
        })
}

/// Dial the destination and, once connected, answer 200 and take over the
/// client connection in the background.
pub async fn establish(
    state: &AppState,
    peer: SocketAddr,
    authority: String,
    mut request: Request<Body>,
) -> Response {
    tracing::debug!(state = %TunnelState::Dialing, %authority, "Opening tunnel");

    let destination = match dial(&authority, state.connect_timeout).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(state = %TunnelState::Failed, %authority, error = %e, "Tunnel dial failed");
            metrics::record_upstream_error("dial");
            metrics::record_tunnel("dial_failed");
            return TunnelError::from(e).into_response();
        }
    };

    tracing::debug!(state = %TunnelState::Connected, %authority, "Tunnel destination connected");

    let Some(on_upgrade) = request.extensions_mut().remove::<OnUpgrade>() else {
        tracing::error!(state = %TunnelState::HijackFailed, %authority, "Connection cannot be taken over");
        metrics::record_tunnel("hijack_unsupported");
        return TunnelError::HijackUnsupported.into_response();
    };

    let version = request.version();
    let guard = state.tracker.track();

    tokio::spawn(
        async move {
            let _guard = guard;
            tracing::debug!(state = %TunnelState::Hijacking, %authority, "Waiting for connection handover");

            match on_upgrade.await {
                Ok(upgraded) => {
                    run(TokioIo::new(upgraded), destination, peer, &authority, version).await;
                }
                Err(e) => {
                    tracing::warn!(
                        state = %TunnelState::HijackFailed,
                        %authority,
                        error = %e,
                        "Connection upgrade failed"
                    );
                    metrics::record_upstream_error("upgrade");
                    metrics::record_tunnel("hijack_failed");
                }
            }
        }
        .in_current_span(),
    );

    // Empty 200: the tunnel is ready.
    StatusCode::OK.into_response()
}

async fn run<C>(
    client: C,
    destination: TcpStream,
    peer: SocketAddr,
    authority: &str,
    version: axum::http::Version,
) where
    C: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
{
    let destination_conn = match (destination.local_addr(), destination.peer_addr()) {
        (Ok(local), Ok(remote)) => format!("{local}->{remote}"),
        _ => authority.to_string(),
    };

    tracing::info!(
        state = %TunnelState::Relaying,
        version = ?version,
        client = %peer,
        destination = %destination_conn,
        %authority,
        "Tunnel established"
    );
    metrics::record_tunnel("established");
    metrics::tunnel_opened();

    let stats = relay(client, destination).await;

    metrics::tunnel_closed(stats.upstream.bytes, stats.downstream.bytes);
    tracing::info!(
        state = %TunnelState::Closed,
        client = %peer,
        %authority,
        upstream_bytes = stats.upstream.bytes,
        downstream_bytes = stats.downstream.bytes,
        clean = stats.upstream.error.is_none() && stats.downstream.error.is_none(),
        "Tunnel closed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;
    use crate::http::server::AppState;
    use axum::http::Method;
    use tokio::net::TcpListener;

    fn connect(uri: &str) -> Request<Body> {
        Request::builder()
            .method(Method::CONNECT)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn authority_comes_from_target() {
        assert_eq!(
            requested_authority(&connect("example.com:443")).as_deref(),
            Some("example.com:443")
        );
    }

    #[test]
    fn authority_falls_back_to_host_header() {
        let request = Request::builder()
            .method(Method::CONNECT)
            .uri("/")
            .header("host", "fallback.test:8443")
            .body(())
            .unwrap();
        assert_eq!(
            requested_authority(&request).as_deref(),
            Some("fallback.test:8443")
        );
    }

    #[tokio::test]
    async fn unreachable_destination_is_503_with_error_text() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let state = AppState::new(&ProxyConfig::default(), Default::default());

        let response = establish(
            &state,
            "127.0.0.1:1".parse().unwrap(),
            addr.to_string(),
            connect(&addr.to_string()),
        )
        .await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains(&addr.to_string()), "body was {text:?}");
        assert_eq!(state.tracker.active_count(), 0);
    }

    #[tokio::test]
    async fn request_without_upgrade_handle_is_500() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = AppState::new(&ProxyConfig::default(), Default::default());

        // Built by hand, so hyper never attached an upgrade handle.
        let response = establish(
            &state,
            "127.0.0.1:1".parse().unwrap(),
            addr.to_string(),
            connect(&addr.to_string()),
        )
        .await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"webserver doesn't support hijacking");
        assert_eq!(state.tracker.active_count(), 0);
    }

    #[test]
    fn error_statuses() {
        assert_eq!(
            TunnelError::MissingAuthority.into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            TunnelError::HijackUnsupported.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn state_names() {
        assert_eq!(TunnelState::HijackFailed.to_string(), "hijack_failed");
        assert_eq!(TunnelState::Relaying.to_string(), "relaying");
    }
}
