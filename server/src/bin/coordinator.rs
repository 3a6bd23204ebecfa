use clap::Parser;
use log::info;
use server::store::{serve, MemoryStore};
use tokio::net::TcpListener;

/// Hosts the coordination store shared by every cluster process.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Address to accept store clients on
        #[clap(short, long, env = "SESSION_STORE_ADDR", default_value = "127.0.0.1:7000")]
        listen: String,
    }

    env_logger::init();
    let args = Args::parse();

    let listener = TcpListener::bind(&args.listen).await?;
    let store = MemoryStore::new();

    tokio::select! {
        result = serve(listener, store) => result?,
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, shutting down"),
    }

    Ok(())
}
