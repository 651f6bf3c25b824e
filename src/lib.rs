//! Lookout - distributed uptime and latency monitor
//!
//! Regional probe workers measure HTTP(S) and TCP targets with per-phase
//! timings and publish observations to a central store; an aggregator fuses
//! them by majority vote, tracks incidents, and sends notifications; a
//! read-only HTTP API serves the results. The three roles are subcommands of
//! one binary and share nothing but the store.

pub mod aggregator;
pub mod config;
pub mod error;
pub mod io;
pub mod maintenance;
pub mod model;
pub mod notifier;
pub mod probe;
mod property_tests;
pub mod query;
pub mod store;
pub mod webhook;

pub use error::{LookoutError, Result};

use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::store::Store;

/// Run the query API until interrupted.
pub async fn serve(config: Arc<AppConfig>, store: Arc<dyn Store>, port: u16) -> Result<()> {
    let cancel = CancellationToken::new();
    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for ctrl-c");
        tracing::info!("Shutdown signal received");
        cancel_for_signal.cancel();
    });

    let router = query::build_router(config, store);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Query API listening on http://{}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
        })
        .await?;

    tracing::info!("Query API stopped");
    Ok(())
}
