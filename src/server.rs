//! WebSocket accept loop and transport pump tasks
//!
//! Each accepted connection is upgraded to a WebSocket, bridged onto the
//! channel pair from [`crate::stream`], and driven by one session task.
//! Early data rides on the `Sec-WebSocket-Protocol` header of the upgrade
//! request and is injected ahead of any live frame.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::Message;

use crate::config::TunnelConfig;
use crate::dns::DohClient;
use crate::session::{run_session, SessionContext, SharedState};
use crate::stream::{self, parse_early_data, TransportLink};
use crate::TunnelError;

/// Upgrade-request header that carries pre-handshake early data
const EARLY_DATA_HEADER: &str = "sec-websocket-protocol";

/// The tunnel server: owns the listener address and the shared read-only
/// session state.
pub struct TunnelServer {
    listen_addr: SocketAddr,
    shared: Arc<SharedState>,
}

impl TunnelServer {
    /// Build a server from a validated configuration.
    pub fn new(config: &TunnelConfig) -> anyhow::Result<Self> {
        config.validate().map_err(anyhow::Error::msg)?;
        let secret = config.secret_bytes().map_err(anyhow::Error::msg)?;
        let doh = DohClient::new(config.doh_url.as_str())?;

        Ok(Self {
            listen_addr: config.listen_addr,
            shared: Arc::new(SharedState {
                secret,
                fallback_addr: config.fallback_addr.clone(),
                doh,
            }),
        })
    }

    /// Bind the configured address and serve until ctrl-c.
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.listen_addr).await?;
        log::info!("VLESS tunnel listening on {}", self.listen_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (socket, peer_addr) = accepted?;
                    let shared = Arc::clone(&self.shared);
                    tokio::spawn(async move {
                        let ctx = SessionContext::new(peer_addr);
                        log::debug!("{ctx} accepted transport");
                        match handle_transport(socket, shared, &ctx).await {
                            Ok(()) => log::debug!("{ctx} session finished"),
                            Err(e) => log::warn!("{ctx} session ended: {e}"),
                        }
                    });
                }
                _ = tokio::signal::ctrl_c() => {
                    log::info!("Shutdown signal received, stopping accept loop");
                    return Ok(());
                }
            }
        }
    }
}

/// Upgrade one TCP connection and run its session to completion.
///
/// The transport is closed exactly once on every path: the writer pump sends
/// the close frame when the session drops its stream half, and a failed
/// close against an already-gone peer is ignored.
async fn handle_transport(
    socket: TcpStream,
    shared: Arc<SharedState>,
    ctx: &SessionContext,
) -> Result<(), TunnelError> {
    let mut early_header: Option<String> = None;
    let mut ws = tokio_tungstenite::accept_hdr_async(socket, |req: &Request, mut resp: Response| {
        if let Some(value) = req.headers().get(EARLY_DATA_HEADER) {
            if let Ok(text) = value.to_str() {
                early_header = Some(text.to_string());
                // Clients that name a subprotocol expect it echoed back
                resp.headers_mut().insert(EARLY_DATA_HEADER, value.clone());
            }
        }
        Ok(resp)
    })
    .await
    .map_err(|e| TunnelError::Stream(format!("websocket handshake failed: {e}")))?;

    // Decode before reading any live frame; undecodable early data aborts
    // the session here
    let early_data = match parse_early_data(early_header.as_deref()) {
        Ok(data) => data,
        Err(e) => {
            let _ = ws.close(None).await;
            return Err(e);
        }
    };

    let (client, link) = stream::channel();
    let TransportLink {
        inbound,
        mut outbound,
    } = link;
    let (mut ws_sink, mut ws_source) = ws.split();

    // Client-bound pump; owns the sink and closes it exactly once
    let writer = tokio::spawn(async move {
        while let Some(chunk) = outbound.recv().await {
            if ws_sink.send(Message::Binary(chunk.to_vec())).await.is_err() {
                break;
            }
        }
        // Failure here means the peer is already gone
        let _ = ws_sink.send(Message::Close(None)).await;
        let _ = ws_sink.close().await;
    });

    // Inbound pump: early data first, then live frames in arrival order
    let reader = tokio::spawn(async move {
        if let Some(chunk) = early_data {
            if inbound.send(Ok(chunk)).await.is_err() {
                return;
            }
        }
        while let Some(frame) = ws_source.next().await {
            match frame {
                Ok(Message::Binary(data)) => {
                    if inbound.send(Ok(Bytes::from(data))).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Text(text)) => {
                    if inbound.send(Ok(Bytes::from(text.into_bytes()))).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) => break,
                // Ping/pong are answered by the protocol layer
                Ok(_) => {}
                Err(e) => {
                    let _ = inbound
                        .send(Err(TunnelError::Stream(format!("websocket error: {e}"))))
                        .await;
                    break;
                }
            }
        }
    });

    let result = run_session(client, &shared, ctx).await;

    // The session dropped its stream half, so the writer drains and sends
    // the close frame; reap it, then stop the reader with the socket
    let _ = writer.await;
    reader.abort();

    result
}
