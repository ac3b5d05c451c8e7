//! Bidirectional byte relay.
//!
//! Two independent copies, one per direction, each on its own task. The relay
//! finishes only when both have finished: a direction that reaches EOF
//! half-closes its destination and leaves the other direction running.
//! Bytes are never inspected.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinError;
use tracing::Instrument;

/// Largest amount of data held in flight per direction.
pub const CHUNK_SIZE: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToDestination,
    DestinationToClient,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::ClientToDestination => write!(f, "client->destination"),
            Direction::DestinationToClient => write!(f, "destination->client"),
        }
    }
}

/// Outcome of one copy direction.
#[derive(Debug)]
pub struct Transfer {
    pub direction: Direction,
    /// Bytes fully written to the destination.
    pub bytes: u64,
    /// Why the copy stopped, if not a clean EOF.
    pub error: Option<io::Error>,
}

/// Outcome of a whole tunnel.
#[derive(Debug)]
pub struct RelayStats {
    pub upstream: Transfer,
    pub downstream: Transfer,
}

/// Relay between `client` and `destination` until both directions finish.
///
/// Both streams are dropped, and therefore closed, before this returns.
pub async fn relay<C, D>(client: C, destination: D) -> RelayStats
where
    C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    D: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (destination_read, destination_write) = tokio::io::split(destination);

    let upstream = tokio::spawn(
        transfer(client_read, destination_write, Direction::ClientToDestination).in_current_span(),
    );
    let downstream = tokio::spawn(
        transfer(destination_read, client_write, Direction::DestinationToClient).in_current_span(),
    );

    let (upstream, downstream) = tokio::join!(upstream, downstream);

    RelayStats {
        upstream: joined(upstream, Direction::ClientToDestination),
        downstream: joined(downstream, Direction::DestinationToClient),
    }
}

fn joined(result: Result<Transfer, JoinError>, direction: Direction) -> Transfer {
    result.unwrap_or_else(|e| {
        tracing::error!(%direction, error = %e, "Transfer task did not complete");
        Transfer {
            direction,
            bytes: 0,
            error: Some(io::Error::other(e)),
        }
    })
}

/// Copy `source` into `destination` until EOF or error, then shut the
/// destination's write side down.
pub async fn transfer<R, W>(mut source: R, mut destination: W, direction: Direction) -> Transfer
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut bytes = 0u64;

    let error = loop {
        let n = match source.read(&mut buf).await {
            Ok(0) => break None,
            Ok(n) => n,
            Err(e) => break Some(e),
        };
        if let Err(e) = destination.write_all(&buf[..n]).await {
            break Some(e);
        }
        bytes += n as u64;
    };

    if let Err(e) = destination.shutdown().await {
        tracing::trace!(%direction, error = %e, "Half-close failed");
    }

    match &error {
        None => tracing::debug!(%direction, bytes, "Transfer finished"),
        // Resets and broken pipes are how tunnels usually end.
        Some(e) => tracing::warn!(%direction, bytes, error = %e, "Transfer failed"),
    }

    Transfer {
        direction,
        bytes,
        error,
    }
}
