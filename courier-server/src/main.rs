//! Courier server binary.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:8000
//! cargo run --bin courier-server
//!
//! # Custom address, in-memory queues
//! cargo run --bin courier-server -- --bind 127.0.0.1:8080 --ephemeral
//! ```

use std::sync::Arc;

use clap::Parser;
use courier_server::config::{ServerCliArgs, ServerConfig};
use courier_server::router::Router;
use courier_server::server::{self, AppState};
use courier_server::store::{MemoryStore, PendingStore, SqliteStore};

#[tokio::main]
async fn main() {
    let cli = ServerCliArgs::parse();

    let config = match ServerConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let store: Arc<dyn PendingStore> = match &config.database_path {
        Some(path) => match SqliteStore::open(path, config.max_queue_size) {
            Ok(s) => {
                tracing::info!(path = %path.display(), "opened pending-queue database");
                Arc::new(s)
            }
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "failed to open database");
                std::process::exit(1);
            }
        },
        None => {
            tracing::warn!("running with in-memory queues; pending messages are lost on restart");
            Arc::new(MemoryStore::with_max_queue_size(config.max_queue_size))
        }
    };

    let tokens = config.token_table();
    if tokens.is_empty() {
        tracing::warn!("no tokens configured under [auth.tokens]; every connection will be refused");
    }

    let router = Router::new(store, config.router_config());
    let state = Arc::new(AppState::new(router, Arc::new(tokens)));

    tracing::info!(addr = %config.bind_addr, "starting courier server");

    match server::start_server_with_state(&config.bind_addr, state).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "server listening");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "server task failed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start server");
            std::process::exit(1);
        }
    }
}
