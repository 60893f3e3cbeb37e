//! wagate-server - chat gateway process
//!
//! Restores persisted sessions on startup and keeps them connected. Set
//! `WAGATE_SEND_TO` to issue one sample send through the default session
//! shortly after boot.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use wagate_core::{Config, Messenger, SessionManager, SessionStore};

mod transport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("wagate=info".parse()?))
        .init();

    info!("wagate-server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env();
    if let Some(parent) = config.database_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = Arc::new(SessionStore::open(&config.database_path)?);
    info!(path = %config.database_path.display(), "Session store opened");

    let manager = SessionManager::new(store, transport::LoopbackFactory::new(), config.clone());
    manager.init().await?;

    for (id, status) in manager.list_sessions().await {
        info!(session_id = %id, status = status.as_str(), "Session restored");
    }

    if let Ok(to) = std::env::var("WAGATE_SEND_TO") {
        let messenger = Messenger::new(Arc::clone(manager.registry()));
        let session_id = config.default_session_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(6)).await;
            match messenger.send_text(&session_id, "Hello world", &to).await {
                Ok(Some(receipt)) => {
                    info!(message_id = %receipt.message_id, "Sample message delivered")
                }
                Ok(None) => warn!(session_id, to, "Sample message was not sent"),
                Err(e) => error!(error = %e, "Sample send failed"),
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    Ok(())
}
