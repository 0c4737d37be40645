//! HTTP and WebSocket gateway over the `chatcore` synchronization core,
//! journaled to SQLite.

pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod housekeeping;
pub mod media;
pub mod sessions;
pub mod ws;

pub use api::{build_router, AppState};

use anyhow::Result;
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Serve until Ctrl-C.
pub async fn run(config: config::Config) -> Result<()> {
    let state = AppState::new(config).await?;
    let shutdown = CancellationToken::new();
    let sweeper = housekeeping::spawn_housekeeping(state.clone(), shutdown.clone());
    let addr: SocketAddr = state.config.bind.parse()?;
    info!(%addr, data_dir = %state.config.data_dir.display(), "chat server listening");
    axum::Server::bind(&addr)
        .serve(build_router(state).into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    shutdown.cancel();
    let _ = sweeper.await;
    info!("chat server stopped");
    Ok(())
}
