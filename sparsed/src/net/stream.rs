//! Framed protocol stream over TCP.

use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use super::buffer::MessageBuffer;
use super::messages::{FromBytes, Message, ToBytes};
use super::Error;

const CONNECT_ATTEMPTS: usize = 30;
const CONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// A buffered connection speaking the framed protocol. One RPC at a
/// time: send, flush, read.
#[derive(Debug)]
pub struct Stream {
    inner: BufStream<TcpStream>,
    buffer: MessageBuffer,
    peer: String,
}

impl Stream {
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "<unknown>".into());
        let _ = stream.set_nodelay(true);
        Self {
            inner: BufStream::new(stream),
            buffer: MessageBuffer::new(),
            peer,
        }
    }

    pub async fn connect(addr: &str) -> Result<Self, Error> {
        Ok(Self::new(TcpStream::connect(addr).await?))
    }

    /// Connect with startup retries; peers may come up in any order.
    pub async fn connect_retry(addr: &str) -> Result<Self, Error> {
        let mut last = None;
        for attempt in 1..=CONNECT_ATTEMPTS {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    debug!(addr, attempt, "connected");
                    return Ok(Self::new(stream));
                }
                Err(err) => {
                    warn!(addr, attempt, %err, "connect failed, retrying");
                    last = Some(err);
                    tokio::time::sleep(CONNECT_BACKOFF).await;
                }
            }
        }
        Err(Error::ConnectRetry {
            addr: addr.into(),
            attempts: CONNECT_ATTEMPTS,
            source: last.unwrap_or_else(|| std::io::Error::other("no attempt made")),
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Queue a message into the write buffer.
    pub async fn send(&mut self, message: &impl ToBytes) -> Result<(), Error> {
        let bytes = message.to_bytes()?;
        self.send_bytes(&bytes).await
    }

    pub async fn send_bytes(&mut self, bytes: &Bytes) -> Result<(), Error> {
        self.inner.write_all(bytes).await?;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), Error> {
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn send_flush(&mut self, message: &impl ToBytes) -> Result<(), Error> {
        self.send(message).await?;
        self.flush().await
    }

    /// Read the next frame.
    pub async fn read(&mut self) -> Result<Message, Error> {
        self.buffer.read(&mut self.inner).await
    }

    /// One request→response exchange, decoded.
    pub async fn rpc<R: FromBytes>(&mut self, message: &impl ToBytes) -> Result<R, Error> {
        self.send_flush(message).await?;
        let reply = self.read().await?;
        R::from_bytes(reply.to_bytes())
    }
}
