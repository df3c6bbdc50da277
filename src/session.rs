//! Per-connection tunnel session
//!
//! One session exists per accepted transport. It reads the first inbound
//! frame, parses the handshake exactly once, then hands the stream to the
//! TCP bridge (with one-shot failover) or the DNS relay. All session state
//! is confined to the session task; the only shared data is the read-only
//! [`SharedState`] built at startup.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::bridge::{relay_tcp, RelayEnd};
use crate::dns::{relay_dns, DohClient};
use crate::outbound::{connect_with_payload, Attempt, ConnectorAction, ConnectorEvent, ConnectorState};
use crate::protocol::{parse_header, Command, TunnelRequest, SECRET_LEN};
use crate::stream::ClientStream;
use crate::TunnelError;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Read-only process configuration shared by every session.
pub struct SharedState {
    /// 128-bit token compared byte-for-byte against the handshake
    pub secret: [u8; SECRET_LEN],
    /// Host dialed for the single failover attempt, original port kept
    pub fallback_addr: String,
    pub doh: DohClient,
}

/// Identifies a session in log lines, threaded explicitly into every log
/// call instead of living in process-wide mutable state.
#[derive(Debug, Clone)]
pub struct SessionContext {
    id: u64,
    peer: SocketAddr,
}

impl SessionContext {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            peer,
        }
    }
}

impl fmt::Display for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[session {} {}]", self.id, self.peer)
    }
}

/// Drive one session to completion.
///
/// Terminal errors surface here; the caller closes the transport via the
/// idempotent close path regardless of outcome.
pub async fn run_session(
    mut client: ClientStream,
    shared: &SharedState,
    ctx: &SessionContext,
) -> Result<(), TunnelError> {
    let first = match client.recv().await {
        Some(Ok(chunk)) => chunk,
        Some(Err(e)) => return Err(e),
        None => {
            return Err(TunnelError::Stream(
                "transport closed before handshake".to_string(),
            ))
        }
    };

    let request = parse_header(&first, &shared.secret)?;
    log::info!(
        "{ctx} {:?} tunnel to {}:{} ({} payload bytes)",
        request.command,
        request.address,
        request.port,
        request.payload.len()
    );

    let mut preamble_sent = false;
    match request.command {
        Command::Tcp => run_tcp(&mut client, shared, &request, ctx, &mut preamble_sent).await,
        Command::Udp => {
            relay_dns(
                &mut client,
                &shared.doh,
                &request.payload,
                request.version,
                &mut preamble_sent,
            )
            .await
        }
    }
}

/// TCP leg: dial, relay, and apply the failover policy between attempts.
async fn run_tcp(
    client: &mut ClientStream,
    shared: &SharedState,
    request: &TunnelRequest,
    ctx: &SessionContext,
    preamble_sent: &mut bool,
) -> Result<(), TunnelError> {
    let mut state = ConnectorState::Connecting(Attempt::Primary);
    let mut last_err: Option<TunnelError> = None;

    loop {
        let attempt = match state {
            ConnectorState::Connecting(attempt) => attempt,
            _ => break,
        };
        let host = match attempt {
            Attempt::Primary => request.address.as_str(),
            Attempt::Fallback => shared.fallback_addr.as_str(),
        };

        let dest = match connect_with_payload(host, request.port, &request.payload, ctx).await {
            Ok(dest) => {
                state = state.on_event(ConnectorEvent::ConnectSucceeded).0;
                dest
            }
            Err(e) => {
                log::warn!("{ctx} connect to {host}:{} failed: {e}", request.port);
                last_err = Some(e);
                let (next, action) = state.on_event(ConnectorEvent::ConnectFailed);
                state = next;
                match action {
                    ConnectorAction::Dial(_) => continue,
                    _ => break,
                }
            }
        };

        let report = relay_tcp(client, dest, request.version, preamble_sent).await?;
        if report.delivered {
            state = state.on_event(ConnectorEvent::BytesDelivered).0;
        }

        match report.end {
            RelayEnd::Client => {
                log::debug!("{ctx} client closed the tunnel");
                return Ok(());
            }
            RelayEnd::Destination(dest_err) => {
                if let Some(e) = &dest_err {
                    log::debug!("{ctx} destination {host}:{} ended: {e}", request.port);
                }
                let (next, action) = state.on_event(ConnectorEvent::Closed);
                state = next;
                match action {
                    ConnectorAction::Dial(fallback) => {
                        log::info!(
                            "{ctx} no data from {}:{}, retrying via fallback {:?}",
                            request.address,
                            request.port,
                            fallback
                        );
                        continue;
                    }
                    _ => {
                        if let Some(e) = dest_err {
                            last_err = Some(TunnelError::Connection(e));
                        }
                        break;
                    }
                }
            }
        }
    }

    match state {
        ConnectorState::FailedNoData => Err(last_err.unwrap_or_else(|| {
            TunnelError::Connection(std::io::Error::new(
                std::io::ErrorKind::ConnectionAborted,
                "destination closed without returning data",
            ))
        })),
        _ => {
            log::debug!("{ctx} tunnel finished");
            Ok(())
        }
    }
}
