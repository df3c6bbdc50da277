//! DNS-over-HTTPS re-framing for tunneled UDP port 53 traffic
//!
//! The inbound byte stream of a DNS session is a concatenation of datagrams,
//! each framed as a 2-byte big-endian length followed by that many payload
//! bytes. Frame boundaries carry no relation to chunk boundaries: a length
//! prefix or payload may straddle chunks, and [`DatagramDecoder`] buffers
//! partials until a full datagram is available. Each query is resolved with
//! one DoH POST and the raw answer is re-emitted under the same framing,
//! with the response preamble prepended to the first emitted frame only.
//!
//! Queries are resolved sequentially, so answers return in query order.

use bytes::{BufMut, Bytes, BytesMut};
use reqwest::header::CONTENT_TYPE;

use crate::protocol::response_preamble;
use crate::stream::ClientStream;
use crate::TunnelError;

const DNS_MESSAGE_MIME: &str = "application/dns-message";
const DOH_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Incremental `{u16 BE length, payload}` datagram slicer.
#[derive(Debug, Default)]
pub struct DatagramDecoder {
    buf: BytesMut,
}

impl DatagramDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk of tunnel bytes.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pop the next complete datagram payload, if one is buffered.
    pub fn next_datagram(&mut self) -> Option<Bytes> {
        if self.buf.len() < 2 {
            return None;
        }
        let len = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
        if self.buf.len() < 2 + len {
            return None;
        }
        let mut datagram = self.buf.split_to(2 + len);
        let _ = datagram.split_to(2);
        Some(datagram.freeze())
    }

    /// Bytes held back waiting for the rest of a datagram.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Frame an answer as `{u16 BE length, answer}` for the return path.
pub fn encode_datagram(answer: &[u8]) -> Result<Bytes, TunnelError> {
    let len = u16::try_from(answer.len())
        .map_err(|_| TunnelError::Upstream("DNS answer exceeds datagram framing".to_string()))?;
    let mut framed = BytesMut::with_capacity(2 + answer.len());
    framed.put_u16(len);
    framed.extend_from_slice(answer);
    Ok(framed.freeze())
}

/// DNS-over-HTTPS resolver client.
///
/// Built once at startup and shared read-only across sessions.
pub struct DohClient {
    http: reqwest::Client,
    url: String,
}

impl DohClient {
    pub fn new(url: impl Into<String>) -> Result<Self, TunnelError> {
        let http = reqwest::Client::builder()
            .timeout(DOH_TIMEOUT)
            .build()
            .map_err(|e| TunnelError::Upstream(format!("DoH client init failed: {e}")))?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }

    /// Resolve one raw DNS query, returning the raw answer bytes.
    pub async fn resolve(&self, query: Bytes) -> Result<Bytes, TunnelError> {
        let response = self
            .http
            .post(&self.url)
            .header(CONTENT_TYPE, DNS_MESSAGE_MIME)
            .body(query)
            .send()
            .await
            .map_err(|e| TunnelError::Upstream(format!("DoH request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TunnelError::Upstream(format!(
                "DoH endpoint returned {status}"
            )));
        }

        response
            .bytes()
            .await
            .map_err(|e| TunnelError::Upstream(format!("DoH response read failed: {e}")))
    }
}

/// Run the DNS leg of a session: slice datagrams out of the inbound stream,
/// resolve each through DoH, and return framed answers.
///
/// `initial` is the handshake payload that followed the header in the first
/// frame. A failed DoH round-trip terminates the session; empty answers are
/// skipped without emitting a frame.
pub async fn relay_dns(
    client: &mut ClientStream,
    doh: &DohClient,
    initial: &[u8],
    version: u8,
    preamble_sent: &mut bool,
) -> Result<(), TunnelError> {
    let mut decoder = DatagramDecoder::new();
    decoder.push(initial);

    loop {
        while let Some(query) = decoder.next_datagram() {
            let answer = doh.resolve(query).await?;
            if answer.is_empty() {
                continue;
            }

            let framed = encode_datagram(&answer)?;
            let framed = if *preamble_sent {
                framed
            } else {
                *preamble_sent = true;
                let mut first = BytesMut::with_capacity(2 + framed.len());
                first.extend_from_slice(&response_preamble(version));
                first.extend_from_slice(&framed);
                first.freeze()
            };
            client.send(framed).await?;
        }

        match client.recv().await {
            Some(Ok(chunk)) => decoder.push(&chunk),
            Some(Err(e)) => return Err(e),
            None => return Ok(()),
        }
    }
}
