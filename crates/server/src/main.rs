// Main entry point for the session sync relay

use anyhow::Result;
use server::database::Database;
use server::{FileStore, ServerState, Storage};
use std::net::SocketAddr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,server=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting session sync relay...");

    // Configuration
    let database_url = std::env::var("DATABASE_URL").ok();
    let file_store_path =
        std::env::var("FILE_STORE_PATH").unwrap_or_else(|_| "./file_store".to_string());
    let addr: SocketAddr = std::env::var("BIND_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:9001".to_string())
        .parse()?;

    // Initialize storage
    let storage = match database_url {
        Some(url) => {
            tracing::info!("Connecting to database: {}", url);
            Storage::Database(Database::new(&url).await?)
        }
        None => {
            tracing::info!("Initializing file store: {}", file_store_path);
            let files = FileStore::new(&file_store_path).await?;
            tracing::info!("{} stored session(s) found", files.list_sessions().await?.len());
            Storage::Files(files)
        }
    };
    tracing::info!("Session documents kept in the {}", storage.describe());

    // Create server state
    let state = ServerState::new(storage);

    // Start server
    server::create_server(state, addr).await?;

    Ok(())
}
