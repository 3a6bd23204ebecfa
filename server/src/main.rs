use clap::Parser;
use log::{error, info};
use serde_json::json;
use server::config::Args;
use server::network::Server;
use server::store::RemoteStore;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Runs one cluster process.
/// Settings are validated before the store or any socket is touched.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();
    let store_addr = args.store_addr()?;
    let listen_addr = args.listen_addr()?;
    let config = args.server_config()?;

    let store = Arc::new(RemoteStore::connect(store_addr).await?);
    let listener = TcpListener::bind(listen_addr).await?;

    let mut server = Server::new(config, store, listener).await?;
    let process_id = server.process_id();

    server.on_server("ping", move |request| {
        request.reply.ok(json!({ "processId": process_id }));
        Ok(())
    })?;

    let handle = server.handle();
    let run = tokio::spawn(async move { server.run().await });

    tokio::select! {
        result = run => {
            match result {
                Ok(Err(e)) => error!("Server stopped with error: {}", e),
                Err(e) => error!("Server task panicked: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            handle.shutdown()?;
        }
    }

    Ok(())
}
