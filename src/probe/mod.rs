//! Regional probe driver
//!
//! One invocation per region per tick: select the monitors assigned to this
//! region, run every check as its own task, and persist each outcome to the
//! central store. A failing check is a normal observation; a failing task or
//! write is logged and counted without disturbing its siblings.

pub mod http;
pub mod tcp;

use std::sync::Arc;

use crate::config::{AppConfig, MonitorTarget, ProbeMethod};
use crate::model::{
    check_pk, check_sk, epoch_ms, latency_pk, ts13, CheckResult, CheckStatus, LatencyRecord,
    TimingMetrics, CHECK_TTL_SECS, LATENCY_TTL_SECS,
};
use crate::store::{Item, Store};

/// Outcome of a single probe, before it is stamped with identity and time.
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub status: CheckStatus,
    pub latency_ms: u64,
    pub timing: TimingMetrics,
    pub error: Option<String>,
}

/// What one regional tick did, for the scheduler's benefit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeSummary {
    pub region: String,
    pub checked: usize,
    pub up: usize,
    pub down: usize,
    /// Tasks that panicked or could not persist their observation.
    pub failures: usize,
}

/// Run all checks assigned to `region` and persist the observations.
pub async fn run_region(
    region: &str,
    config: &AppConfig,
    store: Arc<dyn Store>,
) -> crate::Result<ProbeSummary> {
    let monitors: Vec<MonitorTarget> = config
        .monitors
        .iter()
        .filter(|m| m.regions.iter().any(|r| r == region))
        .cloned()
        .collect();

    tracing::info!(
        "Probe tick for region '{}': {} monitor(s)",
        region,
        monitors.len()
    );

    let prober = Arc::new(http::HttpProber::new()?);
    let mut handles = Vec::new();
    for monitor in monitors {
        let region = region.to_string();
        let store = Arc::clone(&store);
        let prober = Arc::clone(&prober);
        handles.push(tokio::spawn(async move {
            check_and_persist(&monitor, &region, prober, store).await
        }));
    }

    let mut summary = ProbeSummary {
        region: region.to_string(),
        checked: 0,
        up: 0,
        down: 0,
        failures: 0,
    };
    for handle in handles {
        match handle.await {
            Ok((status, persisted)) => {
                summary.checked += 1;
                match status {
                    CheckStatus::Up => summary.up += 1,
                    CheckStatus::Down => summary.down += 1,
                }
                if !persisted {
                    summary.failures += 1;
                }
            }
            Err(e) => {
                tracing::error!("Probe task failed: {}", e);
                summary.failures += 1;
            }
        }
    }

    tracing::info!(
        "Probe tick for region '{}' done: {} up, {} down, {} failure(s)",
        region,
        summary.up,
        summary.down,
        summary.failures
    );
    Ok(summary)
}

/// Run one check and write its `CHECK#` and `LATENCY#` records. The two
/// writes are not atomic; the aggregator tolerates either being absent.
async fn check_and_persist(
    monitor: &MonitorTarget,
    region: &str,
    prober: Arc<http::HttpProber>,
    store: Arc<dyn Store>,
) -> (CheckStatus, bool) {
    let outcome = match monitor.method {
        ProbeMethod::TcpPing => tcp::check(monitor).await,
        _ => prober.check(monitor).await,
    };
    let timestamp_ms = epoch_ms();

    match &outcome.error {
        None => tracing::info!(
            "Check {} [{}]: up in {} ms",
            monitor.id,
            region,
            outcome.latency_ms
        ),
        Some(error) => tracing::info!(
            "Check {} [{}]: down after {} ms: {}",
            monitor.id,
            region,
            outcome.latency_ms,
            error
        ),
    }

    let result = CheckResult {
        monitor_id: monitor.id.clone(),
        region: region.to_string(),
        timestamp_ms,
        status: outcome.status,
        latency_ms: outcome.latency_ms,
        timing: outcome.timing,
        error: outcome.error,
    };

    let persisted = persist(&result, &store).await;
    if !persisted {
        tracing::warn!("Failed to persist observation for {} [{}]", monitor.id, region);
    }
    (result.status, persisted)
}

async fn persist(result: &CheckResult, store: &Arc<dyn Store>) -> bool {
    let check_item = match Item::new(
        check_pk(&result.monitor_id),
        check_sk(result.timestamp_ms, &result.region),
        result,
    ) {
        Ok(item) => item
            .with_ttl(result.timestamp_ms, CHECK_TTL_SECS)
            .with_version(result.timestamp_ms),
        Err(e) => {
            tracing::error!("Encoding check record: {}", e);
            return false;
        }
    };
    if let Err(e) = store.put(check_item).await {
        tracing::error!("Writing check record: {}", e);
        return false;
    }

    let latency = LatencyRecord {
        monitor_id: result.monitor_id.clone(),
        region: result.region.clone(),
        timestamp_ms: result.timestamp_ms,
        latency_ms: result.latency_ms,
        timing: result.timing,
    };
    let latency_item = match Item::new(
        latency_pk(&result.monitor_id, &result.region),
        ts13(result.timestamp_ms),
        &latency,
    ) {
        Ok(item) => item
            .with_ttl(result.timestamp_ms, LATENCY_TTL_SECS)
            .with_version(result.timestamp_ms),
        Err(e) => {
            tracing::error!("Encoding latency record: {}", e);
            return false;
        }
    };
    if let Err(e) = store.put(latency_item).await {
        tracing::error!("Writing latency record: {}", e);
        return false;
    }
    true
}
