//! Shared data model and store key schema
//!
//! The probe workers and the aggregator never talk to each other directly;
//! everything they exchange goes through the central store using the keys
//! defined here. Probes own the `CHECK#` and `LATENCY#` key spaces, the
//! aggregator owns `STATE#` and `INCIDENT#`. Keeping one writer per key
//! space is what lets both sides run without any locking.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// How long raw check observations are kept.
pub const CHECK_TTL_SECS: u64 = 12 * 60 * 60;

/// How long per-region latency history is kept.
pub const LATENCY_TTL_SECS: u64 = 12 * 60 * 60;

/// How long incidents are kept.
pub const INCIDENT_TTL_SECS: u64 = 90 * 24 * 60 * 60;

/// Lookback window when collecting observations, generous enough to absorb
/// clock drift between probe workers and the aggregator.
pub const OBSERVATION_WINDOW_MS: u64 = 90_000;

/// Outcome of a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Up,
    Down,
}

/// Aggregated status of a monitor after majority voting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorStatus {
    Up,
    Degraded,
    Down,
}

impl fmt::Display for MonitorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorStatus::Up => write!(f, "up"),
            MonitorStatus::Degraded => write!(f, "degraded"),
            MonitorStatus::Down => write!(f, "down"),
        }
    }
}

/// Per-phase wall-clock timings for one check, in milliseconds.
///
/// `total` covers the whole exchange, so it is approximately the sum of the
/// individual phases; `tls_handshake` is zero for cleartext targets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimingMetrics {
    #[serde(default)]
    pub dns_lookup: u64,
    #[serde(default)]
    pub tcp_connect: u64,
    #[serde(default)]
    pub tls_handshake: u64,
    #[serde(default)]
    pub ttfb: u64,
    #[serde(default)]
    pub content_download: u64,
    #[serde(default)]
    pub total: u64,
}

/// One probe observation as written by a regional worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    pub monitor_id: String,
    pub region: String,
    pub timestamp_ms: u64,
    pub status: CheckStatus,
    pub latency_ms: u64,
    pub timing: TimingMetrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One point of per-region latency history, a decoupled copy of the check
/// outcome kept under its own key for chart reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyRecord {
    pub monitor_id: String,
    pub region: String,
    pub timestamp_ms: u64,
    pub latency_ms: u64,
    pub timing: TimingMetrics,
}

/// Status of one region as seen in the latest aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionStatus {
    pub status: CheckStatus,
    pub latency: u64,
}

/// Mutable current state of a monitor, owned by the aggregator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorState {
    pub status: MonitorStatus,
    pub primary_latency: u64,
    pub primary_timing: TimingMetrics,
    #[serde(default)]
    pub region_statuses: BTreeMap<String, RegionStatus>,
    pub last_check_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub down_since_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slow_since_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_notified_down_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_notified_slow_ms: Option<u64>,
}

/// A downtime episode. At most one incident per monitor is open (without
/// `end_ms`) at any time, and closure is one-way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Incident {
    pub monitor_id: String,
    pub start_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub regions_down: BTreeSet<String>,
}

/// Derived counters written once per aggregator tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalSummary {
    pub overall_up: u32,
    pub overall_down: u32,
    pub overall_degraded: u32,
    pub last_update_ms: u64,
}

/// Current wall-clock time as UTC milliseconds since the epoch.
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Millisecond timestamp as a 13-digit zero-padded decimal, so that
/// lexicographic sort-key order equals chronological order.
pub fn ts13(timestamp_ms: u64) -> String {
    format!("{:013}", timestamp_ms)
}

pub fn check_pk(monitor_id: &str) -> String {
    format!("CHECK#{}", monitor_id)
}

pub fn check_sk(timestamp_ms: u64, region: &str) -> String {
    format!("{}#{}", ts13(timestamp_ms), region)
}

pub fn latency_pk(monitor_id: &str, region: &str) -> String {
    format!("LATENCY#{}#{}", monitor_id, region)
}

pub fn state_pk(monitor_id: &str) -> String {
    format!("STATE#{}", monitor_id)
}

/// Sort key for the single current-state row under `STATE#<id>`.
pub const STATE_SK: &str = "CURRENT";

pub fn incident_pk(monitor_id: &str) -> String {
    format!("INCIDENT#{}", monitor_id)
}

pub const GLOBAL_PK: &str = "STATE#GLOBAL";
pub const GLOBAL_SK: &str = "SUMMARY";
