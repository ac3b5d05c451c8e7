//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits)
//!     → connection.rs (lifecycle tracking, connection IDs)
//!     → Hand off to HTTP layer
//!
//! Outgoing tunnel connection
//!     → dial.rs (connect with deadline)
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Each connection tracked for graceful shutdown
//! - Only the tunnel dial carries a deadline

pub mod connection;
pub mod dial;
pub mod listener;
