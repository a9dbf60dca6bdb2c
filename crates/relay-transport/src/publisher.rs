use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, warn};

use relay_settings::TransportSettings;

use crate::channel::Channel;
use crate::codec;
use crate::error::{Result, TransportError};

#[derive(Clone, Debug)]
pub struct PublisherConfig {
    /// Send attempts per message, including the first.
    pub max_attempts: u32,
    pub ack_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            ack_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&TransportSettings> for PublisherConfig {
    fn from(settings: &TransportSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            ack_timeout: settings.ack_timeout(),
            ..Self::default()
        }
    }
}

/// Sending side of a channel. Each `publish` blocks until the receiver acknowledges.
///
/// The socket is opened lazily and is owned by the process that opened it; a
/// publisher that finds itself in a different process drops the inherited
/// socket and reconnects.
pub struct Publisher {
    channel: Channel,
    addr: String,
    config: PublisherConfig,
    framed: Option<Framed<TcpStream, LengthDelimitedCodec>>,
    owner_pid: Option<u32>,
}

impl Publisher {
    pub fn new(channel: Channel, addr: impl Into<String>, config: PublisherConfig) -> Self {
        Self {
            channel,
            addr: addr.into(),
            config,
            framed: None,
            owner_pid: None,
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn is_connected(&self) -> bool {
        self.framed.is_some()
    }

    /// Establish the socket if needed. Idempotent within one process.
    pub async fn connect(&mut self) -> Result<()> {
        let pid = std::process::id();
        if self.framed.is_some() {
            if self.owner_pid == Some(pid) {
                return Ok(());
            }
            debug!(channel = %self.channel, old_pid = ?self.owner_pid, pid, "publisher changed process, reconnecting");
            self.framed = None;
        }

        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| TransportError::Timeout("connect"))?
            .map_err(|source| TransportError::Connect {
                addr: self.addr.clone(),
                source,
            })?;
        stream.set_nodelay(true)?;

        self.framed = Some(Framed::new(stream, codec::frame_codec()));
        self.owner_pid = Some(pid);
        debug!(channel = %self.channel, addr = %self.addr, "publisher connected");
        Ok(())
    }

    /// Send one message and wait for its acknowledgment.
    ///
    /// Transport failures drop the socket and retry up to `max_attempts`; the
    /// last error is returned once attempts are exhausted.
    pub async fn publish<T: Serialize>(&mut self, message: &T) -> Result<()> {
        let payload = codec::encode(message)?;
        let mut attempt = 1;
        loop {
            match self.send_and_wait(payload.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    self.framed = None;
                    if !e.is_retryable() || attempt >= self.config.max_attempts {
                        return Err(e);
                    }
                    warn!(channel = %self.channel, attempt, error = %e, "publish failed, retrying");
                    attempt += 1;
                }
            }
        }
    }

    async fn send_and_wait(&mut self, payload: Bytes) -> Result<()> {
        self.connect().await?;
        let ack_timeout = self.config.ack_timeout;
        let framed = self.framed.as_mut().ok_or(TransportError::Closed)?;

        tokio::time::timeout(ack_timeout, framed.send(payload))
            .await
            .map_err(|_| TransportError::Timeout("send"))??;

        let frame = tokio::time::timeout(ack_timeout, framed.next())
            .await
            .map_err(|_| TransportError::Timeout("acknowledgment"))?
            .ok_or(TransportError::Closed)??;

        if codec::is_ack(&frame) {
            Ok(())
        } else {
            Err(TransportError::UnexpectedAck(frame.len()))
        }
    }

    /// Release the socket. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.framed.take().is_some() {
            debug!(channel = %self.channel, "publisher closed");
        }
        self.owner_pid = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;

    fn fast_config() -> PublisherConfig {
        PublisherConfig {
            max_attempts: 2,
            ack_timeout: Duration::from_millis(200),
            connect_timeout: Duration::from_millis(200),
        }
    }

    /// Accept connections and acknowledge every frame, counting connections.
    async fn acking_server() -> (String, tokio::sync::mpsc::UnboundedReceiver<usize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut connections = 0;
            while let Ok((stream, _)) = listener.accept().await {
                connections += 1;
                let _ = tx.send(connections);
                tokio::spawn(async move {
                    let mut framed = Framed::new(stream, codec::frame_codec());
                    while let Some(Ok(_)) = framed.next().await {
                        if framed.send(codec::ack_frame()).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        (addr, rx)
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let (addr, mut conns) = acking_server().await;
        let mut publisher = Publisher::new(Channel::Callbacks, addr, fast_config());
        publisher.connect().await.unwrap();
        publisher.connect().await.unwrap();
        publisher.publish(&json!({"n": 1})).await.unwrap();

        assert_eq!(conns.recv().await, Some(1));
        assert!(conns.try_recv().is_err());
    }

    #[tokio::test]
    async fn foreign_owner_forces_reconnect() {
        let (addr, mut conns) = acking_server().await;
        let mut publisher = Publisher::new(Channel::Callbacks, addr, fast_config());
        publisher.connect().await.unwrap();
        assert_eq!(conns.recv().await, Some(1));

        publisher.owner_pid = Some(std::process::id().wrapping_add(1));
        publisher.connect().await.unwrap();
        assert_eq!(conns.recv().await, Some(2));
        assert_eq!(publisher.owner_pid, Some(std::process::id()));
    }

    #[tokio::test]
    async fn missing_ack_times_out_after_retries() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (tx, mut accepted) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
                let _ = tx.send(());
            }
        });

        let mut publisher = Publisher::new(Channel::Notifications, addr, fast_config());
        let err = publisher.publish(&json!({"event": "x"})).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout("acknowledgment")));
        assert!(!publisher.is_connected());

        accepted.recv().await.unwrap();
        accepted.recv().await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_endpoint_surfaces_connect_error() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let mut publisher = Publisher::new(Channel::FactCache, addr, fast_config());
        let err = publisher.publish(&json!({})).await.unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. } | TransportError::Timeout(_)));
    }

    #[test]
    fn close_is_idempotent() {
        let mut publisher = Publisher::new(Channel::Callbacks, "127.0.0.1:1", PublisherConfig::default());
        publisher.close();
        publisher.close();
        assert!(!publisher.is_connected());
    }
}
