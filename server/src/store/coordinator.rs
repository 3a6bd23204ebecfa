use super::protocol::{read_frame, write_frame, StoreRequest, StoreResponse};
use super::MemoryStore;
use crate::error::Result;
use log::{debug, info, warn};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};

/// Serves `store` to [`RemoteStore`](super::RemoteStore) clients until the
/// listener fails.
pub async fn serve(listener: TcpListener, store: MemoryStore) -> Result<()> {
    info!("Coordinator listening on {}", listener.local_addr()?);

    loop {
        let (stream, addr) = listener.accept().await?;
        let store = store.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, addr, store).await {
                warn!("Coordinator connection {} closed with error: {}", addr, e);
            }
        });
    }
}

async fn serve_connection(mut stream: TcpStream, addr: SocketAddr, store: MemoryStore) -> Result<()> {
    debug!("Store client connected from {}", addr);
    stream.set_nodelay(true)?;

    while let Some(request) = read_frame::<_, StoreRequest>(&mut stream).await? {
        let response = apply(&store, request);
        write_frame(&mut stream, &response).await?;
    }

    debug!("Store client {} disconnected", addr);
    Ok(())
}

fn apply(store: &MemoryStore, request: StoreRequest) -> StoreResponse {
    let result = match request {
        StoreRequest::Increment { key } => store.increment_now(&key).map(StoreResponse::Counter),
        StoreRequest::SetField { map, field, value } => store
            .set_field_now(&map, &field, &value)
            .map(|_| StoreResponse::Done),
        StoreRequest::GetField { map, field } => {
            store.get_field_now(&map, &field).map(StoreResponse::Value)
        }
        StoreRequest::RemoveField { map, field } => store
            .remove_field_now(&map, &field)
            .map(|_| StoreResponse::Done),
    };
    result.unwrap_or_else(|e| StoreResponse::Failed(e.to_string()))
}
