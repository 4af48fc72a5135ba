//! Transport: Tor-mediated request/response over hidden services, with
//! the dual delivery paths named in the contract — reuse an open
//! outbound circuit when one is fresh enough, otherwise fall back to the
//! peer's listener. Concretely this is a hand-rolled SOCKS5 `CONNECT`
//! dialer (grounded on the teacher's `network::socks5_client`) paired
//! with a local TCP listener standing in for the hidden service's
//! forwarded port (grounded on `network::tor::TorManager`'s accept loop).
//! Every frame is padded to a fixed size before it touches the wire
//! (`transport::padding`).

pub mod listener;
pub mod padding;
pub mod socks5;

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Duration;

use listener::{InboundFrame, Listener};
use padding::{pad_to_fixed_size, strip_padding, PaddingError};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("operation timed out")]
    Timeout,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("socks5 error: {0}")]
    Socks5(String),
    #[error("connection handle is stale (age > reuse window)")]
    HandleStale,
    #[error("listener connection no longer exists")]
    ListenerConnectionGone,
    #[error(transparent)]
    Padding(#[from] PaddingError),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// A still-open outbound circuit to a recipient, usable for
/// `send_pong_reuse` while its age is under the reuse window.
pub struct ConnectionHandle {
    stream: Arc<Mutex<TcpStream>>,
    opened_at: i64,
}

impl ConnectionHandle {
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms - self.opened_at
    }
}

pub const REUSE_WINDOW_MS: i64 = 30_000;

pub struct Transport {
    proxy_addr: String,
    listener: Listener,
}

impl Transport {
    pub async fn bind(
        local_listen_addr: SocketAddr,
        socks5_proxy_addr: String,
    ) -> Result<(Self, mpsc::UnboundedReceiver<InboundFrame>)> {
        let (listener, rx) = Listener::bind(local_listen_addr).await?;
        Ok((Self { proxy_addr: socks5_proxy_addr, listener }, rx))
    }

    /// Dial the recipient and send a signed PING, returning a handle to
    /// the still-open circuit for an immediate `send_pong_reuse` style
    /// follow-up if the peer replies quickly over the same socket.
    pub async fn send_ping(
        &self,
        recipient_onion: &str,
        port: u16,
        ping_bytes: &[u8],
        now_ms: i64,
        deadline: Duration,
    ) -> Result<ConnectionHandle> {
        let mut stream =
            socks5::connect_socks5(&self.proxy_addr, recipient_onion, port, deadline).await?;
        let framed = pad_to_fixed_size(ping_bytes)?;
        tokio::time::timeout(deadline, stream.write_all(&framed))
            .await
            .map_err(|_| TransportError::Timeout)??;
        Ok(ConnectionHandle { stream: Arc::new(Mutex::new(stream)), opened_at: now_ms })
    }

    /// Send a PONG down an already-open circuit and await the MESSAGE
    /// that follows. Only valid while `handle.age_ms(now_ms) < REUSE_WINDOW_MS`.
    pub async fn send_pong_reuse(
        &self,
        handle: &ConnectionHandle,
        pong_bytes: &[u8],
        now_ms: i64,
        deadline: Duration,
    ) -> Result<Vec<u8>> {
        if handle.age_ms(now_ms) >= REUSE_WINDOW_MS {
            return Err(TransportError::HandleStale);
        }
        let mut stream = handle.stream.lock().await;
        let framed = pad_to_fixed_size(pong_bytes)?;
        tokio::time::timeout(deadline, stream.write_all(&framed))
            .await
            .map_err(|_| TransportError::Timeout)??;
        let mut buf = vec![0u8; padding::FIXED_PACKET_SIZE];
        tokio::time::timeout(deadline, stream.read_exact(&mut buf))
            .await
            .map_err(|_| TransportError::Timeout)??;
        Ok(strip_padding(&buf)?)
    }

    /// Read the next frame off a handle this side dialed out on (the PING
    /// sender waiting for the PONG, then waiting for the MSG_ACK, both
    /// ride the same outbound socket `send_ping` opened).
    pub async fn recv_on_handle(&self, handle: &ConnectionHandle, deadline: Duration) -> Result<Vec<u8>> {
        let mut stream = handle.stream.lock().await;
        let mut buf = vec![0u8; padding::FIXED_PACKET_SIZE];
        tokio::time::timeout(deadline, stream.read_exact(&mut buf))
            .await
            .map_err(|_| TransportError::Timeout)??;
        Ok(strip_padding(&buf)?)
    }

    /// Write a frame on a handle this side dialed out on.
    pub async fn send_on_handle(&self, handle: &ConnectionHandle, payload: &[u8], deadline: Duration) -> Result<()> {
        let mut stream = handle.stream.lock().await;
        let framed = pad_to_fixed_size(payload)?;
        tokio::time::timeout(deadline, stream.write_all(&framed))
            .await
            .map_err(|_| TransportError::Timeout)??;
        Ok(())
    }

    /// Mandatory fallback path: reply on the listener connection that
    /// delivered the original PING (identified by `connection_id`, which
    /// the caller resolved from the sender's onion address when the PING
    /// arrived), then read the MESSAGE that follows.
    pub async fn send_pong_listener(&self, connection_id: u64, pong_bytes: &[u8]) -> Result<Vec<u8>> {
        self.listener.reply(connection_id, pong_bytes).await?;
        self.listener.read_next(connection_id).await
    }

    pub async fn send_ack(&self, connection_id: u64, ack_bytes: &[u8]) -> Result<()> {
        self.listener.reply(connection_id, ack_bytes).await
    }

    pub async fn close_listener_connection(&self, connection_id: u64) {
        self.listener.close(connection_id).await
    }
}
