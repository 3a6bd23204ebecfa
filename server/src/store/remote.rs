use super::protocol::{read_frame, write_frame, StoreRequest, StoreResponse};
use super::{CoordinationStore, StoreFuture};
use crate::error::{Error, Result};
use futures_util::FutureExt;
use log::{info, warn};
use rand::Rng;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

const CONNECT_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_MS: u64 = 50;
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Client for a store hosted by the `coordinator` binary.
///
/// Requests are serialized over one connection. A request whose connection
/// fails midway is not replayed (an increment might already have been
/// applied); the caller sees `CoordinationUnavailable` and the next request
/// reconnects. The stream is taken out of its slot for the duration of a
/// roundtrip, so a request abandoned before its reply was read leaves no
/// stale reply behind for the next caller.
pub struct RemoteStore {
    addr: String,
    connection: Mutex<Option<TcpStream>>,
    request_timeout: Duration,
}

impl RemoteStore {
    /// Connects to the coordinator, failing if it cannot be reached
    pub async fn connect(addr: impl Into<String>) -> Result<Self> {
        let addr = addr.into();
        let stream = open_connection(&addr).await?;
        info!("Connected to coordination store at {}", addr);

        Ok(Self {
            addr,
            connection: Mutex::new(Some(stream)),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    /// Bounds each roundtrip; an unanswered request drops the connection
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    async fn call(&self, request: StoreRequest) -> Result<StoreResponse> {
        let mut connection = self.connection.lock().await;
        let mut stream = match connection.take() {
            Some(stream) => stream,
            None => open_connection(&self.addr).await?,
        };

        let result = match timeout(self.request_timeout, roundtrip(&mut stream, &request)).await {
            Ok(result) => result,
            Err(_) => Err(Error::CoordinationUnavailable(format!(
                "no reply within {:?}",
                self.request_timeout
            ))),
        };
        match result {
            Ok(StoreResponse::Failed(message)) => {
                *connection = Some(stream);
                Err(Error::CoordinationUnavailable(message))
            }
            Ok(response) => {
                *connection = Some(stream);
                Ok(response)
            }
            Err(e) => {
                warn!("Coordination store request failed: {}", e);
                match e {
                    Error::CoordinationUnavailable(_) => Err(e),
                    other => Err(Error::CoordinationUnavailable(other.to_string())),
                }
            }
        }
    }
}

async fn open_connection(addr: &str) -> Result<TcpStream> {
    let mut last_error = String::new();

    for attempt in 0..CONNECT_ATTEMPTS {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) => {
                last_error = e.to_string();
                let jitter = rand::thread_rng().gen_range(0..BACKOFF_BASE_MS);
                let delay = BACKOFF_BASE_MS * (1 << attempt) + jitter;
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
        }
    }

    Err(Error::CoordinationUnavailable(format!(
        "cannot reach {}: {}",
        addr, last_error
    )))
}

async fn roundtrip(stream: &mut TcpStream, request: &StoreRequest) -> Result<StoreResponse> {
    write_frame(stream, request).await?;
    read_frame(stream).await?.ok_or_else(|| {
        Error::CoordinationUnavailable("coordinator closed the connection".into())
    })
}

fn unexpected(response: StoreResponse) -> Error {
    Error::CoordinationUnavailable(format!("unexpected response {:?}", response))
}

impl CoordinationStore for RemoteStore {
    fn increment<'a>(&'a self, key: &'a str) -> StoreFuture<'a, u64> {
        async move {
            match self.call(StoreRequest::Increment { key: key.into() }).await? {
                StoreResponse::Counter(value) => Ok(value),
                other => Err(unexpected(other)),
            }
        }
        .boxed()
    }

    fn set_field<'a>(
        &'a self,
        map: &'a str,
        field: &'a str,
        value: &'a str,
    ) -> StoreFuture<'a, ()> {
        async move {
            let request = StoreRequest::SetField {
                map: map.into(),
                field: field.into(),
                value: value.into(),
            };
            match self.call(request).await? {
                StoreResponse::Done => Ok(()),
                other => Err(unexpected(other)),
            }
        }
        .boxed()
    }

    fn get_field<'a>(&'a self, map: &'a str, field: &'a str) -> StoreFuture<'a, Option<String>> {
        async move {
            let request = StoreRequest::GetField {
                map: map.into(),
                field: field.into(),
            };
            match self.call(request).await? {
                StoreResponse::Value(value) => Ok(value),
                other => Err(unexpected(other)),
            }
        }
        .boxed()
    }

    fn remove_field<'a>(&'a self, map: &'a str, field: &'a str) -> StoreFuture<'a, ()> {
        async move {
            let request = StoreRequest::RemoveField {
                map: map.into(),
                field: field.into(),
            };
            match self.call(request).await? {
                StoreResponse::Done => Ok(()),
                other => Err(unexpected(other)),
            }
        }
        .boxed()
    }
}
