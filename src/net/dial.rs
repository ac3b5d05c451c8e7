//! Outbound TCP connects with a deadline.

use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;

/// Failure to reach a tunnel destination.
#[derive(Debug, Error)]
pub enum DialError {
    /// Name resolution or the TCP handshake failed.
    #[error("dial tcp {authority}: {source}")]
    Connect {
        authority: String,
        #[source]
        source: std::io::Error,
    },

    /// The destination did not accept within the deadline.
    #[error("dial tcp {authority}: i/o timeout after {timeout:?}")]
    Timeout { authority: String, timeout: Duration },
}

/// Connect to `authority` (`host:port`), giving up after `timeout`.
///
/// The deadline covers resolution and the handshake together.
pub async fn dial(authority: &str, timeout: Duration) -> Result<TcpStream, DialError> {
    match tokio::time::timeout(timeout, TcpStream::connect(authority)).await {
        Ok(Ok(stream)) => {
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(authority, error = %e, "Failed to set TCP_NODELAY");
            }
            Ok(stream)
        }
        Ok(Err(source)) => Err(DialError::Connect {
            authority: authority.to_string(),
            source,
        }),
        Err(_) => Err(DialError::Timeout {
            authority: authority.to_string(),
            timeout,
        }),
    }
}
