use clap::Parser;
use client::Connection;
use serde_json::{json, Value};
use shared::{Scope, ScopeKind};
use std::time::Duration;

/// Connects to a cluster process, authenticates, sends one message and
/// prints the reply.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// WebSocket URL of a cluster process
        #[clap(short, long, env = "SESSION_SERVER_URL", default_value = "ws://127.0.0.1:9000")]
        url: String,
        /// JSON payload for `_authenticate`
        #[clap(short, long, default_value = "{}")]
        auth: String,
        /// Message name
        #[clap(short, long, default_value = "ping")]
        name: String,
        /// Scope type: server, user, room or networkEntity
        #[clap(short, long)]
        scope: Option<String>,
        /// Scope id
        #[clap(short, long)]
        id: Option<u64>,
        /// JSON payload for the message
        #[clap(short, long, default_value = "null")]
        data: String,
        /// Seconds to wait for the reply
        #[clap(short, long, default_value = "10")]
        timeout: u64,
    }

    env_logger::init();
    let args = Args::parse();

    let auth: Value = serde_json::from_str(&args.auth)?;
    let data: Value = serde_json::from_str(&args.data)?;
    let scope = match args.scope {
        Some(kind) => Some(Scope {
            kind: serde_json::from_value::<ScopeKind>(json!(kind))?,
            id: args.id,
        }),
        None => None,
    };

    let mut connection = Connection::connect(&args.url)
        .await?
        .with_request_timeout(Duration::from_secs(args.timeout));
    let user_id = connection.authenticate(auth).await?;
    println!("Authenticated as user {}", user_id);

    let response = connection.request(&args.name, scope, data).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);

    connection.close().await;
    Ok(())
}
