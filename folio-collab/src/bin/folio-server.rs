//! Folio page server binary.
//!
//! Usage:
//!   # In-memory pages (lost on exit)
//!   cargo run -p folio-collab --bin folio-server
//!
//!   # Persist snapshots under ./pages, flushing every 10 seconds
//!   cargo run -p folio-collab --bin folio-server -- --storage-path ./pages --flush-interval-secs 10
//!
//! Clients connect to `ws://<bind>/<page-uuid>`. Log level comes from
//! `RUST_LOG` (default `info`).

use std::path::PathBuf;

use clap::Parser;
use folio_collab::{ServerConfig, SyncServer};

/// WebSocket server for collaborative page editing.
#[derive(Parser, Debug)]
#[command(name = "folio-server")]
#[command(about = "WebSocket server for collaborative page editing")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:9090")]
    bind: String,

    /// Maximum connections per page
    #[arg(long, default_value_t = 100)]
    max_peers: usize,

    /// Frames buffered per connection before new ones are dropped
    #[arg(long, default_value_t = 256)]
    outbox_capacity: usize,

    /// Seconds between saves of changed pages (0 saves only on last disconnect)
    #[arg(long, default_value_t = 5)]
    flush_interval_secs: u64,

    /// Directory for page snapshots (in-memory when omitted)
    #[arg(long)]
    storage_path: Option<PathBuf>,
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            bind_addr: args.bind,
            max_peers_per_session: args.max_peers,
            outbox_capacity: args.outbox_capacity,
            flush_interval_secs: args.flush_interval_secs,
            storage_path: args.storage_path,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let server = SyncServer::new(args.into())?;

    tokio::select! {
        result = server.run() => {
            result.inspect_err(|e| log::error!("Server stopped: {e}"))?;
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("Shutting down");
        }
    }

    let saved = server.flush().await;
    log::info!("Saved {saved} pages on shutdown");
    Ok(())
}
