//! VLESS-over-WebSocket tunnel server
//!
//! Tunnels arbitrary TCP sessions (and DNS-over-UDP, re-framed through DoH)
//! through a single WebSocket byte stream using the compact VLESS binary
//! handshake.
//!
//! ## Features
//!
//! - **Binary handshake**: byte-exact VLESS header parsing with a 128-bit token
//! - **One-shot failover**: transparent retry via a fallback address when the
//!   first outbound attempt yields no data
//! - **Bidirectional bridge**: ordered relay of both flows with a single
//!   response preamble
//! - **DNS over DoH**: length-prefixed UDP datagrams answered through an
//!   HTTPS resolver
//! - **Early data**: zero-round-trip start via the upgrade request
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use vless_tunnel::{TunnelConfig, TunnelServer};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = TunnelConfig::default();
//!     config.secret = "d342d11ed24e4107a10c8f2e7fa6dd11".to_string();
//!     config.fallback_addr = "relay.example.net".to_string();
//!
//!     TunnelServer::new(&config)?.run().await
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! WebSocket ──▶ stream ──▶ protocol ──▶ session ──▶ bridge ──▶ destination
//!     ▲           │                        │
//!     │           │                        ├──▶ outbound (failover)
//!     └───────────┴────────────────────────┴──▶ dns (DoH re-framing)
//! ```

pub mod bridge;
pub mod config;
pub mod dns;
pub mod outbound;
pub mod protocol;
pub mod server;
pub mod session;
pub mod stream;

// Re-export core types
pub use bridge::{RelayEnd, RelayReport};
pub use config::TunnelConfig;
pub use dns::{DatagramDecoder, DohClient};
pub use outbound::{Attempt, ConnectorAction, ConnectorEvent, ConnectorState};
pub use protocol::{parse_header, response_preamble, AddressType, Command, TunnelRequest};
pub use server::TunnelServer;
pub use session::{run_session, SessionContext, SharedState};
pub use stream::{parse_early_data, ClientStream, TransportLink};

/// Tunnel error taxonomy
///
/// Everything except `Connection` is terminal for its session; connection
/// failures first feed the one-shot failover policy in [`outbound`].
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    /// Malformed or too-short handshake header
    #[error("Protocol error: {0}")]
    Protocol(&'static str),

    /// Secret token mismatch
    #[error("Authentication failed")]
    Auth,

    /// MUX, or UDP on a non-DNS port
    #[error("Unsupported command: {0:#04x}")]
    UnsupportedCommand(u8),

    /// Bad address type, length, or encoding
    #[error("Address error: {0}")]
    Address(String),

    /// Outbound connect or first write failed
    #[error("Connection error: {0}")]
    Connection(#[source] std::io::Error),

    /// DoH call failed or returned a non-success status
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Transport-level abort or error
    #[error("Stream error: {0}")]
    Stream(String),
}
