//! Lookout CLI
//!
//! One binary, three roles: `probe` runs a single regional probe tick,
//! `aggregate` runs a single aggregation tick, `serve` runs the read-only
//! query API. An external scheduler invokes the first two once per minute.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::Level;

use lookout::aggregator;
use lookout::config::AppConfig;
use lookout::io::ReqwestHttpClient;
use lookout::model::epoch_ms;
use lookout::notifier::{NoopNotifier, Notifier};
use lookout::probe;
use lookout::store::{SqliteStore, Store};
use lookout::webhook::WebhookNotifier;

#[derive(Parser)]
#[command(name = "lookout")]
#[command(about = "Distributed uptime and latency monitor")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Path to the central SQLite store
    #[arg(long, env = "LOOKOUT_DB", default_value = "lookout.db")]
    db: PathBuf,

    /// Log level
    #[arg(short, long, default_value = "info", value_parser = parse_log_level)]
    log_level: Level,
}

#[derive(Subcommand)]
enum Command {
    /// Run one probe tick for a region
    Probe {
        /// Region identifier this worker probes from
        #[arg(long, env = "LOOKOUT_REGION")]
        region: String,
    },
    /// Run one aggregation tick
    Aggregate,
    /// Serve the read-only query API
    Serve {
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
}

fn parse_log_level(s: &str) -> Result<Level, String> {
    s.parse().map_err(|_| {
        format!(
            "Invalid log level: {}. Use: trace, debug, info, warn, error",
            s
        )
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .init();

    let config = Arc::new(AppConfig::from_env()?);
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&args.db)?);
    tracing::debug!(
        "Loaded {} monitor(s), store at {:?}",
        config.monitors.len(),
        args.db
    );

    match args.command {
        Command::Probe { region } => {
            let summary = probe::run_region(&region, &config, store).await?;
            if summary.failures > 0 {
                tracing::warn!(
                    "{} of {} check(s) failed to run or persist",
                    summary.failures,
                    summary.checked
                );
            }
        }
        Command::Aggregate => {
            let notifier: Arc<dyn Notifier> = match &config.notification.webhook {
                Some(webhook) => Arc::new(WebhookNotifier::new(
                    webhook.clone(),
                    Arc::new(ReqwestHttpClient::new()),
                )),
                None => Arc::new(NoopNotifier),
            };
            aggregator::run_tick(epoch_ms(), &config, store, notifier).await?;
        }
        Command::Serve { port } => {
            lookout::serve(config, store, port).await?;
        }
    }

    Ok(())
}
