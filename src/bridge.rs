//! Bidirectional relay between the client stream and a destination
//!
//! Once a destination connection exists the bridge pumps two independent
//! flows: every post-handshake inbound chunk is written verbatim to the
//! destination, and destination bytes are delivered back to the client with
//! the two-byte response preamble prepended to the very first chunk. Either
//! side closing or erroring ends the relay; retry decisions belong to the
//! connector, not here.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::response_preamble;
use crate::stream::ClientStream;
use crate::TunnelError;

const READ_BUF_SIZE: usize = 16 * 1024;

/// Which side ended the relay
#[derive(Debug)]
pub enum RelayEnd {
    /// Destination EOF (`None`) or destination I/O error (`Some`)
    Destination(Option<std::io::Error>),
    /// The client stream reached end-of-sequence
    Client,
}

/// Outcome of one relay attempt
#[derive(Debug)]
pub struct RelayReport {
    /// Whether at least one destination byte reached the client
    pub delivered: bool,
    pub end: RelayEnd,
}

/// Pump bytes in both directions until one side ends.
///
/// `preamble_sent` persists across failover attempts so the preamble is sent
/// exactly once per session, as the first bytes of the first
/// destination-to-client delivery.
///
/// Returns `Err` only for client transport failures; destination-side ends,
/// clean or not, are reported in the [`RelayReport`] so the caller can apply
/// the failover policy.
pub async fn relay_tcp<D>(
    client: &mut ClientStream,
    dest: D,
    version: u8,
    preamble_sent: &mut bool,
) -> Result<RelayReport, TunnelError>
where
    D: AsyncRead + AsyncWrite,
{
    let tx = client.sender();
    let rx = client.receiver_mut();
    let (mut dest_rd, mut dest_wr) = tokio::io::split(dest);

    let mut delivered = false;

    let to_dest = async {
        loop {
            match rx.recv().await {
                Some(Ok(chunk)) => {
                    if let Err(e) = dest_wr.write_all(&chunk).await {
                        return Ok(RelayEnd::Destination(Some(e)));
                    }
                }
                Some(Err(e)) => return Err(e),
                None => {
                    // Client went away cleanly; half-close toward the
                    // destination so it sees EOF
                    let _ = dest_wr.shutdown().await;
                    return Ok(RelayEnd::Client);
                }
            }
        }
    };

    let delivered_ref = &mut delivered;
    let to_client = async {
        let mut buf = vec![0u8; READ_BUF_SIZE];
        loop {
            match dest_rd.read(&mut buf).await {
                Ok(0) => return Ok(RelayEnd::Destination(None)),
                Ok(n) => {
                    let chunk = if *preamble_sent {
                        Bytes::copy_from_slice(&buf[..n])
                    } else {
                        *preamble_sent = true;
                        let mut framed = BytesMut::with_capacity(2 + n);
                        framed.extend_from_slice(&response_preamble(version));
                        framed.extend_from_slice(&buf[..n]);
                        framed.freeze()
                    };
                    tx.send(chunk).await.map_err(|_| {
                        TunnelError::Stream("client transport closed".to_string())
                    })?;
                    *delivered_ref = true;
                }
                Err(e) => return Ok(RelayEnd::Destination(Some(e))),
            }
        }
    };

    let end = tokio::select! {
        r = to_dest => r?,
        r = to_client => r?,
    };

    Ok(RelayReport { delivered, end })
}
