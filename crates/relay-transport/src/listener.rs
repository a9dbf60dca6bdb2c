use std::net::SocketAddr;

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::channel::Channel;
use crate::codec;
use crate::error::Result;

/// A frame waiting to be consumed, paired with the handle that acknowledges it.
struct Inbound {
    frame: BytesMut,
    ack: oneshot::Sender<()>,
}

/// Receiving side of a channel.
///
/// Every accepted connection gets its own task that forwards one frame at a
/// time and holds the next read until the frame is acknowledged. Messages from
/// different connections interleave; messages from one connection never do.
pub struct Listener {
    channel: Channel,
    local_addr: SocketAddr,
    incoming: mpsc::Receiver<Inbound>,
    pending_ack: Option<oneshot::Sender<()>>,
    cancel: CancellationToken,
}

impl Listener {
    pub async fn bind(channel: Channel, addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (tx, incoming) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        tokio::spawn(accept_loop(channel, listener, tx, cancel.clone()));
        info!(channel = %channel, addr = %local_addr, "listening");

        Ok(Self {
            channel,
            local_addr,
            incoming,
            pending_ack: None,
            cancel,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Acknowledge the previous message, then wait for the next one.
    ///
    /// Frames that do not decode as `T` are acknowledged and skipped.
    /// Returns `None` once the listener is closed. Cancel-safe.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Option<T> {
        self.ack();
        loop {
            let inbound = self.incoming.recv().await?;
            match codec::decode(&inbound.frame) {
                Ok(message) => {
                    self.pending_ack = Some(inbound.ack);
                    return Some(message);
                }
                Err(e) => {
                    trace!(channel = %self.channel, error = %e, "dropping undecodable frame");
                    let _ = inbound.ack.send(());
                }
            }
        }
    }

    /// Acknowledge the most recently returned message, if not already done.
    pub fn ack(&mut self) {
        if let Some(ack) = self.pending_ack.take() {
            let _ = ack.send(());
        }
    }

    /// Stop accepting and drop every connection. Safe to call repeatedly.
    pub fn close(&mut self) {
        self.ack();
        if !self.cancel.is_cancelled() {
            self.cancel.cancel();
            self.incoming.close();
            debug!(channel = %self.channel, "listener closed");
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(
    channel: Channel,
    listener: TcpListener,
    tx: mpsc::Sender<Inbound>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(channel = %channel, %peer, "connection accepted");
                    tokio::spawn(serve_connection(stream, tx.clone(), cancel.clone()));
                }
                Err(e) => warn!(channel = %channel, error = %e, "accept failed"),
            }
        }
    }
}

async fn serve_connection(stream: TcpStream, tx: mpsc::Sender<Inbound>, cancel: CancellationToken) {
    let mut framed = Framed::new(stream, codec::frame_codec());
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            next = framed.next() => match next {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    debug!(error = %e, "dropping connection on frame error");
                    break;
                }
                None => break,
            },
        };

        let (ack, acked) = oneshot::channel();
        if tx.send(Inbound { frame, ack }).await.is_err() {
            break;
        }
        // The listener dropped the frame without acknowledging: it is closing.
        if acked.await.is_err() {
            break;
        }
        if framed.send(codec::ack_frame()).await.is_err() {
            break;
        }
    }
}
