//! EDI/TCP listener with per-client fan-out
//!
//! Every connected client gets its own bounded queue and writer task; a
//! client that cannot keep up loses frames rather than stalling the
//! output path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::SinkError;

/// Frames queued per client before it starts losing them.
const CLIENT_QUEUE: usize = 64;

struct Client {
    id: u64,
    tx: mpsc::Sender<Bytes>,
}

/// State shared between the accept loop and the sender.
pub struct TcpServerShared {
    pub listen_port: u16,
    clients: Mutex<Vec<Client>>,
    next_id: AtomicU64,
}

impl TcpServerShared {
    pub fn num_connections(&self) -> usize {
        self.clients.lock().len()
    }
}

/// One `-T` listener destination.
pub struct TcpServerDestination {
    shared: Arc<TcpServerShared>,
}

impl TcpServerDestination {
    /// Bind the listener and spawn its accept loop.
    pub async fn open(listen_port: u16, cancel: CancellationToken) -> Result<Self, SinkError> {
        let listener = TcpListener::bind(("0.0.0.0", listen_port))
            .await
            .map_err(|e| SinkError::Open {
                destination: format!("tcp listen port {listen_port}"),
                source: e,
            })?;
        // port 0 in tests resolves at bind time
        let listen_port = listener.local_addr().map(|a| a.port()).unwrap_or(listen_port);

        let shared = Arc::new(TcpServerShared {
            listen_port,
            clients: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        });

        tokio::spawn(accept_loop(listener, Arc::clone(&shared), cancel));
        tracing::info!(port = listen_port, "EDI/TCP output listening");

        Ok(Self { shared })
    }

    pub fn shared(&self) -> Arc<TcpServerShared> {
        Arc::clone(&self.shared)
    }

    pub fn listen_port(&self) -> u16 {
        self.shared.listen_port
    }

    /// Queue a packet towards every connected client.
    pub fn write(&self, packet: &Bytes) {
        let clients = self.shared.clients.lock();
        for client in clients.iter() {
            if client.tx.try_send(packet.clone()).is_err() {
                tracing::trace!(client = client.id, "slow EDI/TCP client, frame dropped");
            }
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<TcpServerShared>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(ok) => ok,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept error");
                        continue;
                    }
                };
                let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = mpsc::channel(CLIENT_QUEUE);
                shared.clients.lock().push(Client { id, tx });
                tracing::info!(port = shared.listen_port, %peer, "EDI/TCP client connected");

                let shared = Arc::clone(&shared);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    serve_client(stream, rx, cancel).await;
                    shared.clients.lock().retain(|c| c.id != id);
                    tracing::info!(port = shared.listen_port, %peer, "EDI/TCP client disconnected");
                });
            }
        }
    }
}

async fn serve_client(
    mut stream: tokio::net::TcpStream,
    mut rx: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            packet = rx.recv() => match packet {
                Some(packet) => {
                    if stream.write_all(&packet).await.is_err() {
                        break;
                    }
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
#[path = "tcp_server_test.rs"]
mod tests;
