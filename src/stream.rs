//! Channel-backed byte stream between the transport and the session
//!
//! The WebSocket side of a session is modelled as a pair of ordered queues
//! instead of callback listeners: one task feeds inbound frames into the
//! session, one task drains outbound frames back to the transport. The
//! session consumes a [`ClientStream`]; the transport glue holds the
//! matching [`TransportLink`]. End-of-sequence is signalled by closing a
//! channel, errors travel in-band as `Err` items, and dropping either half
//! closes the other side exactly once.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::TunnelError;

/// Queue depth per relay direction
const CHANNEL_CAPACITY: usize = 32;

/// Session-side handle: pull inbound chunks, push client-bound chunks.
pub struct ClientStream {
    inbound: mpsc::Receiver<Result<Bytes, TunnelError>>,
    outbound: mpsc::Sender<Bytes>,
}

/// Transport-side handle, held by the WebSocket pump tasks.
pub struct TransportLink {
    /// Frames arriving from the client, in arrival order
    pub inbound: mpsc::Sender<Result<Bytes, TunnelError>>,
    /// Frames to deliver back to the client
    pub outbound: mpsc::Receiver<Bytes>,
}

/// Create a connected stream/link pair.
pub fn channel() -> (ClientStream, TransportLink) {
    let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_CAPACITY);

    (
        ClientStream {
            inbound: inbound_rx,
            outbound: outbound_tx,
        },
        TransportLink {
            inbound: inbound_tx,
            outbound: outbound_rx,
        },
    )
}

impl ClientStream {
    /// Receive the next inbound chunk. `None` means the transport closed
    /// cleanly; an `Err` item means it failed.
    pub async fn recv(&mut self) -> Option<Result<Bytes, TunnelError>> {
        self.inbound.recv().await
    }

    /// Send a chunk back to the client.
    pub async fn send(&self, chunk: Bytes) -> Result<(), TunnelError> {
        self.outbound
            .send(chunk)
            .await
            .map_err(|_| TunnelError::Stream("client transport closed".to_string()))
    }

    /// Clone of the client-bound sender, for pump tasks that only write.
    pub fn sender(&self) -> mpsc::Sender<Bytes> {
        self.outbound.clone()
    }

    /// Mutable access to the inbound queue, for pump tasks that only read.
    pub fn receiver_mut(&mut self) -> &mut mpsc::Receiver<Result<Bytes, TunnelError>> {
        &mut self.inbound
    }
}

/// Decode the out-of-band early-data blob carried on the transport upgrade
/// request.
///
/// The value is URL-safe base64 without padding; standard-alphabet input
/// (`+`, `/`, trailing `=`) is tolerated and normalized. A present but
/// undecodable value is a stream error: the session must abort before any
/// live frame is read.
pub fn parse_early_data(data: Option<&str>) -> Result<Option<Bytes>, TunnelError> {
    let Some(data) = data else {
        return Ok(None);
    };
    if data.is_empty() {
        return Ok(None);
    }

    let normalized = data.replace('+', "-").replace('/', "_").replace('=', "");
    URL_SAFE_NO_PAD
        .decode(normalized)
        .map(|d| Some(Bytes::from(d)))
        .map_err(|e| TunnelError::Stream(format!("invalid early data: {e}")))
}
