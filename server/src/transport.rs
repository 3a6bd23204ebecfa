//! WebSocket transport bridged into the run loop.
//!
//! Every accepted connection becomes an `Opened` event carrying the channel
//! its outbound frames are written from, followed by one `Frame` per text
//! message and a final `Closed`. The transport never interprets frames.

use crate::network::ServerMessage;
use crate::session::{ConnectionId, Outbound};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, warn};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};

/// Accepts client connections on an already listening socket
pub async fn accept_clients(listener: TcpListener, server_tx: mpsc::UnboundedSender<ServerMessage>) {
    let next_id = Arc::new(AtomicU64::new(1));

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let connection_id = next_id.fetch_add(1, Ordering::SeqCst);
                let server_tx = server_tx.clone();
                tokio::spawn(serve_connection(stream, addr, connection_id, server_tx));
            }
            Err(e) => {
                error!("Error accepting connection: {}", e);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    addr: SocketAddr,
    connection_id: ConnectionId,
    server_tx: mpsc::UnboundedSender<ServerMessage>,
) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake with {} failed: {}", addr, e);
            return;
        }
    };
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();

    let opened = ServerMessage::Opened {
        connection_id,
        addr: Some(addr),
        outbound: outbound_tx,
    };
    if server_tx.send(opened).is_err() {
        return;
    }

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let result = match frame {
                Outbound::Text(text) => ws_tx.send(Message::Text(text)).await,
                Outbound::Close => break,
            };
            if let Err(e) = result {
                debug!("Write to connection {} failed: {}", connection_id, e);
                return;
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
    });

    while let Some(message) = ws_rx.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    warn!("Dropping non UTF-8 frame from connection {}", connection_id);
                    continue;
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("Read from connection {} failed: {}", connection_id, e);
                break;
            }
        };
        if server_tx.send(ServerMessage::Frame { connection_id, text }).is_err() {
            break;
        }
    }

    let _ = server_tx.send(ServerMessage::Closed { connection_id });
    let _ = writer.await;
}
