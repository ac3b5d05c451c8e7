//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (hyper connection, upgrades enabled, Axum router)
//!     → dispatch.rs (CONNECT? /health? everything else)
//!         → tunnel (CONNECT)
//!         → forward.rs (plaintext relay)
//!             → body.rs (count and log the streamed response)
//!     → Send to client
//! ```

pub mod body;
pub mod dispatch;
pub mod forward;
pub mod server;

pub use dispatch::{classify, Route, HEALTH_PATH};
pub use server::{AppState, HttpServer};
