//! Outbound destination connector with one-shot failover
//!
//! The retry decision is kept out of the socket code: [`ConnectorState`] is a
//! pure `(state, event) -> (state, action)` machine that the session drives,
//! so the policy is testable without a live connection. The rule it encodes:
//! a first attempt that produced nothing for the client (connect failure, or
//! a connection that closed having delivered zero bytes) is retried exactly
//! once against the configured fallback address with the original port; any
//! attempt that delivered at least one byte is never retried.

use std::net::{IpAddr, SocketAddr};

use tokio::io::AsyncWriteExt;
use tokio::net::{lookup_host, TcpStream};

use crate::session::SessionContext;
use crate::TunnelError;

/// Which address a connection attempt dials
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    /// The address parsed from the handshake
    Primary,
    /// The configured fallback address, original port
    Fallback,
}

/// Connector lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    /// Dialing the destination
    Connecting(Attempt),
    /// Connected, nothing delivered to the client yet
    Connected(Attempt),
    /// At least one byte reached the client; failover is off the table
    Relaying,
    /// Both attempts ended without delivering a byte
    FailedNoData,
    /// Relay finished after data flowed
    Done,
}

/// Events fed to the state machine by the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorEvent {
    ConnectFailed,
    ConnectSucceeded,
    /// First byte delivered to the client
    BytesDelivered,
    /// The destination connection ended (EOF or error)
    Closed,
}

/// What the session should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorAction {
    Dial(Attempt),
    Continue,
    Finish,
}

impl ConnectorState {
    /// Pure transition function.
    pub fn on_event(self, event: ConnectorEvent) -> (ConnectorState, ConnectorAction) {
        use ConnectorAction::*;
        use ConnectorEvent::*;
        use ConnectorState::*;

        match (self, event) {
            (Connecting(attempt), ConnectSucceeded) => (Connected(attempt), Continue),
            (Connecting(Attempt::Primary), ConnectFailed) => {
                (Connecting(Attempt::Fallback), Dial(Attempt::Fallback))
            }
            (Connecting(Attempt::Fallback), ConnectFailed) => (FailedNoData, Finish),

            (Connected(_), BytesDelivered) => (Relaying, Continue),
            (Connected(Attempt::Primary), Closed) => {
                (Connecting(Attempt::Fallback), Dial(Attempt::Fallback))
            }
            (Connected(Attempt::Fallback), Closed) => (FailedNoData, Finish),

            (Relaying, Closed) => (Done, Finish),

            // Anything else is a stale event; hold position
            (state, _) => (state, Continue),
        }
    }
}

/// Open the destination connection and write the handshake payload as the
/// first outbound bytes. The payload must precede any further client data on
/// this connection, which holds because the bridge only starts afterwards.
pub async fn connect_with_payload(
    host: &str,
    port: u16,
    payload: &[u8],
    ctx: &SessionContext,
) -> Result<TcpStream, TunnelError> {
    let mut stream = connect(host, port).await.map_err(TunnelError::Connection)?;
    log::debug!("{ctx} connected to {host}:{port}");

    if !payload.is_empty() {
        stream
            .write_all(payload)
            .await
            .map_err(TunnelError::Connection)?;
    }

    Ok(stream)
}

/// Dial a destination given as either an IP literal or a hostname.
///
/// IPv6 literals arrive uncompressed and unbracketed from the header parser,
/// so they are parsed directly rather than round-tripped through `host:port`
/// string resolution.
async fn connect(host: &str, port: u16) -> Result<TcpStream, std::io::Error> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return TcpStream::connect(SocketAddr::new(ip, port)).await;
    }

    let mut addrs = lookup_host((host, port)).await?;
    match addrs.next() {
        Some(addr) => TcpStream::connect(addr).await,
        None => Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no addresses found for {host}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use Attempt::*;
    use ConnectorEvent::*;
    use ConnectorState::*;

    #[test]
    fn test_primary_connect_failure_dials_fallback() {
        let (state, action) = Connecting(Primary).on_event(ConnectFailed);
        assert_eq!(state, Connecting(Fallback));
        assert_eq!(action, ConnectorAction::Dial(Fallback));
    }

    #[test]
    fn test_fallback_connect_failure_gives_up() {
        let (state, action) = Connecting(Fallback).on_event(ConnectFailed);
        assert_eq!(state, FailedNoData);
        assert_eq!(action, ConnectorAction::Finish);
    }

    #[test]
    fn test_zero_byte_close_on_primary_retries_once() {
        let (state, _) = Connecting(Primary).on_event(ConnectSucceeded);
        assert_eq!(state, Connected(Primary));

        let (state, action) = state.on_event(Closed);
        assert_eq!(state, Connecting(Fallback));
        assert_eq!(action, ConnectorAction::Dial(Fallback));
    }

    #[test]
    fn test_zero_byte_close_on_fallback_ends_session() {
        let (state, action) = Connected(Fallback).on_event(Closed);
        assert_eq!(state, FailedNoData);
        assert_eq!(action, ConnectorAction::Finish);
    }

    #[test]
    fn test_no_retry_after_bytes_delivered() {
        let (state, _) = Connected(Primary).on_event(BytesDelivered);
        assert_eq!(state, Relaying);

        let (state, action) = state.on_event(Closed);
        assert_eq!(state, Done);
        assert_eq!(action, ConnectorAction::Finish);
    }

    #[test]
    fn test_retry_fires_at_most_once() {
        // Walk the longest possible path: primary zero-byte close, fallback
        // zero-byte close. No state on that path dials a third time.
        let (state, _) = Connecting(Primary).on_event(ConnectSucceeded);
        let (state, action) = state.on_event(Closed);
        assert_eq!(action, ConnectorAction::Dial(Fallback));

        let (state, _) = state.on_event(ConnectSucceeded);
        assert_eq!(state, Connected(Fallback));
        let (state, action) = state.on_event(Closed);
        assert_eq!(state, FailedNoData);
        assert_eq!(action, ConnectorAction::Finish);
    }

    #[test]
    fn test_stale_events_hold_position() {
        let (state, action) = Relaying.on_event(ConnectSucceeded);
        assert_eq!(state, Relaying);
        assert_eq!(action, ConnectorAction::Continue);

        let (state, action) = Done.on_event(Closed);
        assert_eq!(state, Done);
        assert_eq!(action, ConnectorAction::Continue);
    }

    #[tokio::test]
    async fn test_connect_refused_is_connection_error() {
        // Bind then drop to get a port with nothing listening
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let ctx = SessionContext::new("127.0.0.1:9".parse().unwrap());
        let err = connect_with_payload("127.0.0.1", port, b"", &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::Connection(_)));
    }

    #[tokio::test]
    async fn test_payload_written_before_anything_else() {
        use tokio::io::AsyncReadExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let accept = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            sock.read_exact(&mut buf).await.unwrap();
            buf
        });

        let ctx = SessionContext::new("127.0.0.1:9".parse().unwrap());
        let _stream = connect_with_payload("127.0.0.1", port, b"hello", &ctx)
            .await
            .unwrap();

        assert_eq!(&accept.await.unwrap(), b"hello");
    }
}
