//! Relay for everything that is not CONNECT.
//!
//! # Responsibilities
//! - Resolve the absolute-form request target (`http` or `https`)
//! - Copy method and every header value (duplicates, order, empty values)
//! - Stream the inbound body upstream without buffering
//! - Propagate upstream status, headers and body back to the client
//!
//! # Design Decisions
//! - One attempt, no retries, no redirects
//! - Every failure before response headers exist becomes a bare 500

use axum::{
    body::Body,
    http::{header, request::Parts, uri::Scheme, Request, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use thiserror::Error;

use crate::http::body::{AccessRecord, MeteredBody};
use crate::observability::metrics;

/// Client used for relayed plaintext requests. Speaks both `http` and
/// `https` to the origin.
pub type UpstreamClient = Client<HttpsConnector<HttpConnector>, Body>;

/// Build the shared upstream client. Certificates are checked against the
/// bundled webpki roots.
pub fn upstream_client() -> UpstreamClient {
    let https = HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .build();

    Client::builder(TokioExecutor::new()).build(https)
}

/// Failure to relay a plaintext request.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// The target has no scheme or authority (origin-form).
    #[error("request target '{0}' is not an absolute URL")]
    RelativeTarget(Uri),

    /// Only `http` and `https` targets are relayed.
    #[error("unsupported scheme '{0}' in request target")]
    UnsupportedScheme(String),

    #[error("invalid upstream request: {0}")]
    Build(#[from] axum::http::Error),

    #[error("upstream request failed: {0}")]
    Upstream(#[from] hyper_util::client::legacy::Error),
}

impl ForwardError {
    fn kind(&self) -> &'static str {
        match self {
            ForwardError::Upstream(_) => "call",
            _ => "build",
        }
    }
}

impl IntoResponse for ForwardError {
    fn into_response(self) -> Response {
        StatusCode::INTERNAL_SERVER_ERROR.into_response()
    }
}

/// The absolute URL a plaintext request should be sent to.
pub fn resolve_target(uri: &Uri) -> Result<Uri, ForwardError> {
    match (uri.scheme(), uri.authority()) {
        (Some(scheme), Some(_)) if *scheme == Scheme::HTTP || *scheme == Scheme::HTTPS => {
            Ok(uri.clone())
        }
        (Some(scheme), Some(_)) => Err(ForwardError::UnsupportedScheme(scheme.to_string())),
        _ => Err(ForwardError::RelativeTarget(uri.clone())),
    }
}

/// Build the upstream copy of an inbound request around its body stream.
pub fn build_outbound(parts: &Parts, body: Body) -> Result<Request<Body>, ForwardError> {
    let target = resolve_target(&parts.uri)?;

    let mut builder = Request::builder().method(parts.method.clone()).uri(target);
    if let Some(headers) = builder.headers_mut() {
        // append, not insert: repeated names must all survive
        for (name, value) in parts.headers.iter() {
            headers.append(name.clone(), value.clone());
        }
    }

    Ok(builder.body(body)?)
}

/// Host the request is aimed at, for logging.
fn target_host(parts: &Parts) -> String {
    parts
        .uri
        .authority()
        .map(|authority| authority.to_string())
        .or_else(|| {
            parts
                .headers
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .unwrap_or_else(|| "-".to_string())
}

/// Relay one plaintext request and stream the upstream response back.
pub async fn forward(client: &UpstreamClient, request: Request<Body>) -> Response {
    let (parts, body) = request.into_parts();

    let outbound = match build_outbound(&parts, body) {
        Ok(outbound) => outbound,
        Err(e) => return fail(&parts, e),
    };

    let upstream = match client.request(outbound).await {
        Ok(response) => response,
        Err(e) => return fail(&parts, e.into()),
    };

    let record = AccessRecord {
        version: parts.version,
        method: parts.method.clone(),
        host: target_host(&parts),
        status: upstream.status(),
    };

    // Status and headers go out before the first body byte.
    let (upstream_parts, upstream_body) = upstream.into_parts();
    Response::from_parts(upstream_parts, Body::new(MeteredBody::new(upstream_body, record)))
}

fn fail(parts: &Parts, error: ForwardError) -> Response {
    tracing::error!(
        method = %parts.method,
        uri = %parts.uri,
        error = %error,
        details = ?error,
        "Failed to relay request"
    );
    metrics::record_upstream_error(error.kind());
    error.into_response()
}
