//! WebSocket connection to one cluster process

use futures_util::{SinkExt, StreamExt};
use log::{debug, warn};
use serde_json::Value;
use shared::{CorrelationId, EntityId, Envelope, Response, Scope, AUTHENTICATE};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("connection closed")]
    Closed,

    #[error("no reply within {0:?}")]
    Timeout(Duration),

    #[error("server rejected '{name}': {message}")]
    Rejected { name: String, message: String },

    #[error("unexpected reply to '{0}'")]
    UnexpectedReply(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;

type PendingTable = Arc<Mutex<HashMap<CorrelationId, oneshot::Sender<Response>>>>;

/// A client connection with a sender-side correlation table.
///
/// Replies carrying an id complete the matching [`request`](Self::request);
/// responses without one are server pushes, read with
/// [`next_push`](Self::next_push).
pub struct Connection {
    outgoing: mpsc::UnboundedSender<Message>,
    pending: PendingTable,
    pushes: mpsc::UnboundedReceiver<Response>,
    next_id: AtomicU64,
    request_timeout: Duration,
    user_id: Option<EntityId>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Connection {
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws, _) = connect_async(url).await?;
        let (mut ws_tx, mut ws_rx) = ws.split();
        debug!("Connected to {}", url);

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        let writer = tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                if let Err(e) = ws_tx.send(message).await {
                    debug!("Write failed: {}", e);
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
        let (pushes_tx, pushes) = mpsc::unbounded_channel();
        let reader = {
            let pending = Arc::clone(&pending);
            tokio::spawn(async move {
                while let Some(message) = ws_rx.next().await {
                    let text = match message {
                        Ok(Message::Text(text)) => text,
                        Ok(Message::Close(_)) => break,
                        Ok(_) => continue,
                        Err(e) => {
                            debug!("Read failed: {}", e);
                            break;
                        }
                    };
                    match Response::parse(&text) {
                        Ok(response) => route_response(&pending, &pushes_tx, response),
                        Err(e) => warn!("Dropping unparseable response: {}", e),
                    }
                }
                // Waiters see the connection as closed
                pending.lock().unwrap_or_else(PoisonError::into_inner).clear();
            })
        };

        Ok(Self {
            outgoing,
            pending,
            pushes,
            next_id: AtomicU64::new(1),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            user_id: None,
            reader,
            writer,
        })
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn user_id(&self) -> Option<EntityId> {
        self.user_id
    }

    /// Sends `_authenticate` and returns the user id the server bound
    pub async fn authenticate(&mut self, payload: Value) -> Result<EntityId> {
        let response = self.request(AUTHENTICATE, None, payload).await?;
        if let Some(message) = response.error_message() {
            return Err(ClientError::Rejected {
                name: AUTHENTICATE.to_string(),
                message: message.to_string(),
            });
        }

        let user_id = response
            .data
            .get("userId")
            .and_then(Value::as_u64)
            .ok_or_else(|| ClientError::UnexpectedReply(AUTHENTICATE.to_string()))?;
        self.user_id = Some(user_id);
        Ok(user_id)
    }

    /// Sends a correlated message and waits for its reply, error replies
    /// included
    pub async fn request(&self, name: &str, scope: Option<Scope>, data: Value) -> Result<Response> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);

        let mut envelope = Envelope::new(name, data).with_correlation(id);
        envelope.scope = scope;
        if let Err(e) = self.transmit(&envelope) {
            self.forget(id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => {
                self.forget(id);
                Err(ClientError::Timeout(self.request_timeout))
            }
        }
    }

    /// Like [`request`](Self::request), with error replies turned into
    /// [`ClientError::Rejected`]
    pub async fn call(&self, name: &str, scope: Option<Scope>, data: Value) -> Result<Value> {
        let response = self.request(name, scope, data).await?;
        match response.error_message() {
            Some(message) => Err(ClientError::Rejected {
                name: response.name.clone(),
                message: message.to_string(),
            }),
            None => Ok(response.data),
        }
    }

    /// Fire-and-forget: no correlation id, so no reply on success
    pub fn send(&self, name: &str, scope: Option<Scope>, data: Value) -> Result<()> {
        let mut envelope = Envelope::new(name, data);
        envelope.scope = scope;
        self.transmit(&envelope)
    }

    /// Next server push; `None` once the connection is closed
    pub async fn next_push(&mut self) -> Option<Response> {
        self.pushes.recv().await
    }

    pub async fn close(self) {
        let _ = self.outgoing.send(Message::Close(None));
        drop(self.outgoing);
        let _ = self.writer.await;
        self.reader.abort();
    }

    fn transmit(&self, envelope: &Envelope) -> Result<()> {
        let text = envelope.encode()?;
        self.outgoing
            .send(Message::Text(text))
            .map_err(|_| ClientError::Closed)
    }

    fn forget(&self, id: CorrelationId) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }
}

fn route_response(pending: &PendingTable, pushes: &mpsc::UnboundedSender<Response>, response: Response) {
    let Some(id) = response.id else {
        let _ = pushes.send(response);
        return;
    };

    let waiter = pending
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&id);
    match waiter {
        Some(waiter) => {
            let _ = waiter.send(response);
        }
        None => debug!("Reply {} has no waiting request", id),
    }
}
