//! Request classification and routing.
//!
//! Every request lands here. CONNECT opens a tunnel, `/health` answers
//! locally, anything else is relayed upstream. Classification is checked in
//! that order, so a CONNECT never reaches the probe and the probe never
//! touches the network.

use std::net::SocketAddr;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Method, Request, StatusCode},
    response::{IntoResponse, Response},
};

use crate::http::forward;
use crate::http::server::AppState;
use crate::tunnel::{self, TunnelError};

/// Reserved liveness path.
pub const HEALTH_PATH: &str = "/health";

/// Where a request is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Tunnel,
    Health,
    Forward,
}

pub fn classify<B>(request: &Request<B>) -> Route {
    if request.method() == Method::CONNECT {
        Route::Tunnel
    } else if request.uri().path() == HEALTH_PATH {
        Route::Health
    } else {
        Route::Forward
    }
}

/// Router fallback: the single entry point for every request.
pub async fn dispatch(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    match classify(&request) {
        Route::Tunnel => match tunnel::requested_authority(&request) {
            Some(authority) => tunnel::establish(&state, peer, authority, request).await,
            None => TunnelError::MissingAuthority.into_response(),
        },
        Route::Health => health().await.into_response(),
        Route::Forward => forward::forward(&state.client, request).await,
    }
}

async fn health() -> (StatusCode, &'static str) {
    tracing::debug!("Health check");
    (StatusCode::OK, "OK")
}
