//! Local TCP listener standing in for the hidden service's forwarded
//! port. Grounded on the teacher's `network::tor::TorManager::start_listener`
//! / `PENDING_CONNECTIONS` / `send_pong_response` trio: an accept loop reads
//! one inbound frame per connection, stashes the still-open socket keyed
//! by a connection id, and hands the frame to the caller over a channel;
//! the caller replies later by connection id, which is how
//! `send_pong_listener` delivers a PONG (and then a MESSAGE) back down
//! the same socket the PING arrived on.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};

use super::padding::{pad_to_fixed_size, strip_padding, FIXED_PACKET_SIZE};
use super::TransportError;

pub struct InboundFrame {
    pub connection_id: u64,
    pub peer_addr: SocketAddr,
    pub payload: Vec<u8>,
}

struct PendingConnection {
    socket: TcpStream,
}

pub struct Listener {
    pending: Arc<Mutex<HashMap<u64, PendingConnection>>>,
    next_id: Arc<AtomicU64>,
    handle: tokio::task::JoinHandle<()>,
}

impl Listener {
    pub async fn bind(local_addr: SocketAddr) -> Result<(Self, mpsc::UnboundedReceiver<InboundFrame>), TransportError> {
        let listener = TokioTcpListener::bind(local_addr).await?;
        let pending: Arc<Mutex<HashMap<u64, PendingConnection>>> = Arc::new(Mutex::new(HashMap::new()));
        let next_id = Arc::new(AtomicU64::new(1));
        let (tx, rx) = mpsc::unbounded_channel();

        let pending_for_task = pending.clone();
        let next_id_for_task = next_id.clone();
        let handle = tokio::spawn(async move {
            loop {
                let (mut socket, peer_addr) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(e) => {
                        log::error!("listener accept error: {e}");
                        continue;
                    }
                };
                let tx = tx.clone();
                let pending = pending_for_task.clone();
                let next_id = next_id_for_task.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; FIXED_PACKET_SIZE];
                    match socket.read_exact(&mut buf).await {
                        Ok(_) => {
                            let payload = match strip_padding(&buf) {
                                Ok(p) => p,
                                Err(e) => {
                                    log::warn!("dropping malformed inbound frame from {peer_addr}: {e}");
                                    return;
                                }
                            };
                            let connection_id = next_id.fetch_add(1, Ordering::Relaxed);
                            pending.lock().await.insert(connection_id, PendingConnection { socket });
                            if tx.send(InboundFrame { connection_id, peer_addr, payload }).is_err() {
                                pending.lock().await.remove(&connection_id);
                            }
                        }
                        Err(e) => {
                            log::debug!("connection from {peer_addr} closed before a full frame arrived: {e}");
                        }
                    }
                });
            }
        });

        Ok((Self { pending, next_id, handle }, rx))
    }

    /// Reply on the still-open socket that delivered `connection_id`'s
    /// inbound frame, then read one more fixed-size frame as the
    /// response (used for the PING -> PONG -> MESSAGE -> ACK chain all
    /// riding the same accepted connection).
    pub async fn reply(&self, connection_id: u64, payload: &[u8]) -> Result<(), TransportError> {
        let mut pending = self.pending.lock().await;
        let conn = pending
            .get_mut(&connection_id)
            .ok_or(TransportError::ListenerConnectionGone)?;
        let framed = pad_to_fixed_size(payload)?;
        conn.socket.write_all(&framed).await?;
        Ok(())
    }

    /// Read the next fixed-size frame from an already-replied-to
    /// connection (e.g. the MESSAGE that follows our PONG).
    pub async fn read_next(&self, connection_id: u64) -> Result<Vec<u8>, TransportError> {
        let mut pending = self.pending.lock().await;
        let conn = pending
            .get_mut(&connection_id)
            .ok_or(TransportError::ListenerConnectionGone)?;
        let mut buf = vec![0u8; FIXED_PACKET_SIZE];
        conn.socket.read_exact(&mut buf).await?;
        Ok(strip_padding(&buf)?)
    }

    pub async fn close(&self, connection_id: u64) {
        self.pending.lock().await.remove(&connection_id);
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
