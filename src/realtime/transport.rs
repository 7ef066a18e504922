//! Channel transports.
//!
//! A transport opens one multiplexed subscription over a list of tables and
//! hands back a [`ChannelConnection`]: an inbound message queue fed by a
//! background reader task. Dropping the connection stops the reader.

use futures_util::StreamExt;
use reqwest::Client;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::protocol::{decode_line, ChannelMessage};
use crate::api::friendly_error;
use crate::error::ChannelError;

const INBOUND_CAPACITY: usize = 256;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Longest line accepted from the change stream before it is treated as a
/// protocol error.
const MAX_LINE_BYTES: usize = 1024 * 1024;

pub type Inbound = Result<ChannelMessage, ChannelError>;

pub struct ChannelConnection {
    inbound: mpsc::Receiver<Inbound>,
    reader: CancellationToken,
}

impl ChannelConnection {
    pub fn new(inbound: mpsc::Receiver<Inbound>, reader: CancellationToken) -> Self {
        Self { inbound, reader }
    }

    /// Next inbound message; `None` once the reader has stopped.
    pub async fn recv(&mut self) -> Option<Inbound> {
        self.inbound.recv().await
    }
}

impl Drop for ChannelConnection {
    fn drop(&mut self) {
        self.reader.cancel();
    }
}

pub trait ChannelTransport: Send + Sync {
    fn open(
        &self,
        tables: &[&'static str],
    ) -> impl Future<Output = Result<ChannelConnection, ChannelError>> + Send;
}

/// Change feed over a long-lived HTTP response carrying NDJSON frames.
pub struct HttpStreamTransport {
    http: Client,
    base_url: String,
    api_key: Zeroizing<String>,
}

impl HttpStreamTransport {
    pub fn new(base_url: &str, api_key: Zeroizing<String>) -> Result<Self, ChannelError> {
        // No overall request timeout: the response body is the stream.
        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ChannelError::Connect(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: crate::api::normalize_base_url(base_url),
            api_key,
        })
    }
}

impl ChannelTransport for HttpStreamTransport {
    async fn open(&self, tables: &[&'static str]) -> Result<ChannelConnection, ChannelError> {
        let url = format!("{}/v1/changes", self.base_url);
        let resp = self
            .http
            .get(&url)
            .query(&[("tables", tables.join(","))])
            .header("apikey", self.api_key.as_str())
            .header("Accept", "application/x-ndjson")
            .send()
            .await
            .map_err(|e| ChannelError::Connect(friendly_error(&self.base_url, &e)))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ChannelError::Connect(format!(
                "change feed refused subscription (HTTP {})",
                status.as_u16()
            )));
        }

        info!(tables = tables.len(), "change feed connected");
        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        let reader = CancellationToken::new();
        let stop = reader.clone();

        tokio::spawn(async move {
            let mut stream = std::pin::pin!(resp.bytes_stream());
            let mut buf: Vec<u8> = Vec::new();

            loop {
                let chunk = tokio::select! {
                    _ = stop.cancelled() => break,
                    chunk = stream.next() => chunk,
                };
                let bytes = match chunk {
                    Some(Ok(bytes)) => bytes,
                    Some(Err(e)) => {
                        let _ = tx.send(Err(ChannelError::Stream(e.to_string()))).await;
                        break;
                    }
                    None => {
                        let _ = tx.send(Err(ChannelError::Closed)).await;
                        break;
                    }
                };

                buf.extend_from_slice(bytes.as_ref());
                if !forward_lines(&mut buf, &tx).await {
                    break;
                }
            }
            debug!("change feed reader stopped");
        });

        Ok(ChannelConnection::new(rx, reader))
    }
}

/// Decode every complete line in `buf` and forward it. Returns `false` once
/// the receiving side is gone or the unterminated tail exceeds
/// `MAX_LINE_BYTES`; the latter is reported as a protocol error.
async fn forward_lines(buf: &mut Vec<u8>, tx: &mpsc::Sender<Inbound>) -> bool {
    while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
        let line: Vec<u8> = buf.drain(..=pos).collect();
        let text = String::from_utf8_lossy(&line);
        if text.trim().is_empty() {
            continue;
        }
        let msg = decode_line(&text);
        if let Err(e) = &msg {
            warn!(error = %e, "dropping undecodable change frame");
            continue;
        }
        if tx.send(msg).await.is_err() {
            return false;
        }
    }
    if buf.len() > MAX_LINE_BYTES {
        let _ = tx
            .send(Err(ChannelError::Protocol("frame too large".to_string())))
            .await;
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_forward_lines_splits_and_keeps_partial_tail() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut buf = b"{\"type\":\"SUBSCRIBED\"}\n\n{\"type\":\"HEARTBEAT\"}\nnot json\n{\"type\":\"HEA".to_vec();

        assert!(forward_lines(&mut buf, &tx).await);
        assert_eq!(rx.recv().await.unwrap().unwrap(), ChannelMessage::Subscribed);
        assert_eq!(rx.recv().await.unwrap().unwrap(), ChannelMessage::Heartbeat);
        assert!(rx.try_recv().is_err());
        assert_eq!(buf, b"{\"type\":\"HEA".to_vec());
    }

    #[tokio::test]
    async fn test_oversized_tail_stops_reader_with_protocol_error() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut buf = b"{\"type\":\"HEARTBEAT\"}\n".to_vec();
        buf.extend(std::iter::repeat(b'x').take(MAX_LINE_BYTES + 1));

        assert!(!forward_lines(&mut buf, &tx).await);
        assert_eq!(rx.recv().await.unwrap().unwrap(), ChannelMessage::Heartbeat);
        assert!(matches!(rx.recv().await.unwrap(), Err(ChannelError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_tail_at_limit_is_kept() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut buf = vec![b'x'; MAX_LINE_BYTES];

        assert!(forward_lines(&mut buf, &tx).await);
        assert!(rx.try_recv().is_err());
        assert_eq!(buf.len(), MAX_LINE_BYTES);
    }

    #[tokio::test]
    async fn test_dropping_connection_cancels_reader() {
        let (_tx, rx) = mpsc::channel(1);
        let token = CancellationToken::new();
        let conn = ChannelConnection::new(rx, token.clone());
        drop(conn);
        assert!(token.is_cancelled());
    }
}
