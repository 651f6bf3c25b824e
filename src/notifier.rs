//! Notifier trait and user-visible message formatting

use async_trait::async_trait;
use chrono::{FixedOffset, TimeZone, Utc};

/// A notification to be delivered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub monitor_id: String,
    pub message: String,
}

/// Trait for delivering notifications
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver a notification. Best-effort; callers log and swallow errors.
    async fn notify(&self, notification: &Notification) -> crate::Result<()>;
}

/// Notifier used when no webhook is configured.
#[derive(Debug, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, notification: &Notification) -> crate::Result<()> {
        tracing::info!(
            "No webhook configured, dropping notification for '{}': {}",
            notification.monitor_id,
            notification.message
        );
        Ok(())
    }
}

/// Render an epoch-millisecond timestamp in the configured fixed UTC offset
/// (e.g. "+08:00"). Unparseable or missing offsets fall back to UTC.
pub fn format_timestamp(timestamp_ms: u64, timezone: Option<&str>) -> String {
    let utc = Utc
        .timestamp_millis_opt(timestamp_ms as i64)
        .single()
        .unwrap_or_default();
    match timezone.and_then(|tz| tz.parse::<FixedOffset>().ok()) {
        Some(offset) => utc
            .with_timezone(&offset)
            .format("%Y-%m-%d %H:%M:%S %:z")
            .to_string(),
        None => utc.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    }
}

/// Humanize a duration for recovery messages.
pub fn format_duration(duration_ms: u64) -> String {
    let minutes = duration_ms / 60_000;
    match minutes {
        0 => format!("{} second(s)", duration_ms / 1000),
        1..=119 => format!("{} minute(s)", minutes),
        _ => format!("{} hour(s) {} minute(s)", minutes / 60, minutes % 60),
    }
}

pub fn down_message(
    name: &str,
    since_ms: u64,
    error: &str,
    timezone: Option<&str>,
) -> String {
    format!(
        "{} is DOWN since {}: {}",
        name,
        format_timestamp(since_ms, timezone),
        error
    )
}

pub fn up_message(name: &str, downtime_ms: u64) -> String {
    format!(
        "{} is UP again after {} of downtime",
        name,
        format_duration(downtime_ms)
    )
}

pub fn slow_message(name: &str, latency_ms: u64, threshold_ms: u64) -> String {
    format!(
        "{} is responding slowly: {} ms exceeds the {} ms threshold",
        name, latency_ms, threshold_ms
    )
}

pub fn fast_message(name: &str, latency_ms: u64, threshold_ms: u64) -> String {
    format!(
        "{} latency is back under {} ms ({} ms)",
        name, threshold_ms, latency_ms
    )
}

pub fn spike_message(name: &str, latency_ms: u64, baseline_ms: u64, phase: &str) -> String {
    format!(
        "{} latency spike: {} ms against a {} ms baseline (suspected {} phase)",
        name, latency_ms, baseline_ms, phase
    )
}
