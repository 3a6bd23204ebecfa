//! Inter-process link: best-effort delivery of envelopes between processes.
//!
//! Each process listens for peers on its own address and publishes that
//! address in the coordination store under its process id. Outgoing
//! traffic uses one lazily opened TCP connection per peer, carrying
//! newline-delimited JSON. Delivery is at most once: a message queued on a
//! connection that fails is dropped, never retried.

use crate::error::{Error, Result};
use crate::handler::Sender;
use crate::network::ServerMessage;
use crate::session::ConnectionId;
use crate::store::SharedStore;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use shared::{EntityId, Envelope, ProcessId, Response};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Store map holding `process id -> peer address`
pub const PROCESS_MAP: &str = "processes";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerMessage {
    /// A message for an entity owned by the receiving process
    Forward { envelope: Envelope, sender: Sender },
    /// A handler's reply, routed back to the originating connection
    Reply {
        connection_id: ConnectionId,
        response: Response,
    },
    /// A server push for a user owned by the receiving process
    Deliver { user_id: EntityId, response: Response },
}

struct PeerChannel {
    generation: u64,
    tx: mpsc::UnboundedSender<PeerMessage>,
}

struct LinkInner {
    process_id: ProcessId,
    store: SharedStore,
    peers: Mutex<HashMap<ProcessId, PeerChannel>>,
    generations: AtomicU64,
    forwarded: AtomicU64,
}

#[derive(Clone)]
pub struct PeerLink {
    inner: Arc<LinkInner>,
}

impl PeerLink {
    pub fn new(process_id: ProcessId, store: SharedStore) -> Self {
        Self {
            inner: Arc::new(LinkInner {
                process_id,
                store,
                peers: Mutex::new(HashMap::new()),
                generations: AtomicU64::new(0),
                forwarded: AtomicU64::new(0),
            }),
        }
    }

    /// Makes this process reachable by its peers
    pub async fn publish(&self, addr: SocketAddr) -> Result<()> {
        self.inner
            .store
            .set_field(
                PROCESS_MAP,
                &self.inner.process_id.to_string(),
                &addr.to_string(),
            )
            .await
    }

    /// Forwards a message to the process that owns its target
    pub fn forward(&self, target: ProcessId, envelope: Envelope, sender: Sender) {
        self.inner.forwarded.fetch_add(1, Ordering::SeqCst);
        debug!(
            "Forwarding '{}' from user {} to process {}",
            envelope.name, sender.user_id, target
        );
        self.send(target, PeerMessage::Forward { envelope, sender });
    }

    /// Number of envelopes handed to [`forward`](Self::forward)
    pub fn forwarded(&self) -> u64 {
        self.inner.forwarded.load(Ordering::SeqCst)
    }

    pub fn send(&self, target: ProcessId, message: PeerMessage) {
        let mut peers = self
            .inner
            .peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let message = match peers.get(&target) {
            Some(channel) => match channel.tx.send(message) {
                Ok(()) => return,
                Err(mpsc::error::SendError(message)) => message,
            },
            None => message,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let generation = self.inner.generations.fetch_add(1, Ordering::SeqCst);
        // The receiver is alive until the task below drops it
        let _ = tx.send(message);
        peers.insert(target, PeerChannel { generation, tx });

        tokio::spawn(run_peer_connection(
            Arc::clone(&self.inner),
            target,
            generation,
            rx,
        ));
    }
}

async fn run_peer_connection(
    inner: Arc<LinkInner>,
    target: ProcessId,
    generation: u64,
    mut rx: mpsc::UnboundedReceiver<PeerMessage>,
) {
    if let Err(e) = drain_to_peer(&inner, target, &mut rx).await {
        warn!("Link to process {} failed: {}", target, e);
    }

    let mut peers = inner.peers.lock().unwrap_or_else(PoisonError::into_inner);
    if peers.get(&target).map(|channel| channel.generation) == Some(generation) {
        peers.remove(&target);
    }
}

async fn drain_to_peer(
    inner: &LinkInner,
    target: ProcessId,
    rx: &mut mpsc::UnboundedReceiver<PeerMessage>,
) -> Result<()> {
    let addr = inner
        .store
        .get_field(PROCESS_MAP, &target.to_string())
        .await?
        .ok_or_else(|| Error::TargetNotFound(format!("process {} has no address", target)))?;

    let mut stream = TcpStream::connect(addr.as_str()).await?;
    stream.set_nodelay(true)?;
    debug!("Linked process {} to process {} at {}", inner.process_id, target, addr);

    while let Some(message) = rx.recv().await {
        stream.write_all(&encode_line(&message)?).await?;
    }
    Ok(())
}

/// Accepts peer connections and feeds their messages into the run loop
pub async fn accept_peers(listener: TcpListener, server_tx: mpsc::UnboundedSender<ServerMessage>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let server_tx = server_tx.clone();
                tokio::spawn(async move {
                    if let Err(e) = read_peer(stream, addr, server_tx).await {
                        warn!("Peer connection from {} closed with error: {}", addr, e);
                    }
                });
            }
            Err(e) => {
                warn!("Failed to accept peer connection: {}", e);
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        }
    }
}

async fn read_peer<R>(
    reader: R,
    peer: SocketAddr,
    server_tx: mpsc::UnboundedSender<ServerMessage>,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    info!("Peer connected from {}", peer);
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let message = match serde_json::from_str::<PeerMessage>(&line) {
            Ok(message) => message,
            Err(e) => {
                warn!("Skipping malformed message from peer {}: {}", peer, e);
                continue;
            }
        };
        if server_tx.send(ServerMessage::Peer(message)).is_err() {
            break;
        }
    }
    Ok(())
}

/// One peer message per line
fn encode_line(message: &PeerMessage) -> Result<Vec<u8>> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;
    use shared::Scope;
    use std::time::Duration;
    use tokio::time::timeout;

    fn forward_message() -> PeerMessage {
        PeerMessage::Forward {
            envelope: Envelope::new("fire", json!({"power": 3}))
                .with_scope(Scope::room(5))
                .with_correlation(7),
            sender: Sender {
                user_id: 11,
                process_id: 2,
                connection_id: 4,
            },
        }
    }

    #[tokio::test]
    async fn test_peer_lines_reach_the_loop() {
        let (mut writer, reader) = tokio::io::duplex(4096);
        let (server_tx, mut server_rx) = mpsc::unbounded_channel();
        let message = forward_message();

        writer.write_all(&encode_line(&message).unwrap()).await.unwrap();
        writer.write_all(b"\r\n").await.unwrap();
        drop(writer);
        read_peer(reader, "127.0.0.1:1".parse().unwrap(), server_tx)
            .await
            .unwrap();

        match server_rx.try_recv().unwrap() {
            ServerMessage::Peer(received) => assert_eq!(received, message),
            _ => panic!("expected a peer message"),
        }
        assert!(server_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_malformed_line_is_skipped() {
        let (mut writer, reader) = tokio::io::duplex(4096);
        let (server_tx, mut server_rx) = mpsc::unbounded_channel();
        let message = forward_message();

        writer.write_all(b"{\"type\":\"forward\",\n").await.unwrap();
        writer.write_all(b"not json at all\n").await.unwrap();
        writer.write_all(&encode_line(&message).unwrap()).await.unwrap();
        drop(writer);
        read_peer(reader, "127.0.0.1:1".parse().unwrap(), server_tx)
            .await
            .unwrap();

        match server_rx.try_recv().unwrap() {
            ServerMessage::Peer(received) => assert_eq!(received, message),
            _ => panic!("expected a peer message"),
        }
        assert!(server_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_forward_reaches_published_peer() {
        let store = MemoryStore::new();
        let shared: SharedStore = Arc::new(store.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let receiver = PeerLink::new(1, shared.clone());
        receiver.publish(listener.local_addr().unwrap()).await.unwrap();

        let (server_tx, mut server_rx) = mpsc::unbounded_channel();
        tokio::spawn(accept_peers(listener, server_tx));

        let link = PeerLink::new(2, shared);
        let PeerMessage::Forward { envelope, sender } = forward_message() else {
            unreachable!()
        };
        link.forward(1, envelope.clone(), sender);

        let received = timeout(Duration::from_secs(2), server_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match received {
            ServerMessage::Peer(PeerMessage::Forward { envelope: e, sender: s }) => {
                assert_eq!(e, envelope);
                assert_eq!(s, sender);
            }
            _ => panic!("expected a forwarded message"),
        }
        assert_eq!(link.forwarded(), 1);
    }

    #[tokio::test]
    async fn test_unknown_peer_is_dropped() {
        let link = PeerLink::new(2, Arc::new(MemoryStore::new()));
        let PeerMessage::Forward { envelope, sender } = forward_message() else {
            unreachable!()
        };

        link.forward(9, envelope, sender);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(link.forwarded(), 1);
        let peers = link.inner.peers.lock().unwrap();
        assert!(peers.get(&9).is_none());
    }
}
