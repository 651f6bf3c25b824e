//! Configuration types for the lookout services
//!
//! All configuration is injected at startup as JSON strings in environment
//! variables (`MONITORS_CONFIG`, `NOTIFICATION_CONFIG`, `MAINTENANCES_CONFIG`,
//! `PAGE_CONFIG`, `PASSWORD_PROTECTION`), mirroring how the original system
//! receives its deployment-time settings. Unknown fields are ignored so old
//! binaries keep working against newer config.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Probe method. Everything except `TcpPing` is an HTTP exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeMethod {
    #[serde(rename = "GET")]
    Get,
    #[serde(rename = "POST")]
    Post,
    #[serde(rename = "PUT")]
    Put,
    #[serde(rename = "PATCH")]
    Patch,
    #[serde(rename = "DELETE")]
    Delete,
    #[serde(rename = "HEAD")]
    Head,
    #[serde(rename = "OPTIONS")]
    Options,
    #[serde(rename = "TCP_PING")]
    TcpPing,
}

impl ProbeMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeMethod::Get => "GET",
            ProbeMethod::Post => "POST",
            ProbeMethod::Put => "PUT",
            ProbeMethod::Patch => "PATCH",
            ProbeMethod::Delete => "DELETE",
            ProbeMethod::Head => "HEAD",
            ProbeMethod::Options => "OPTIONS",
            ProbeMethod::TcpPing => "TCP_PING",
        }
    }

    /// Methods that carry a request body.
    pub fn allows_body(&self) -> bool {
        matches!(
            self,
            ProbeMethod::Post | ProbeMethod::Put | ProbeMethod::Patch
        )
    }
}

/// Spike-detection parameters relative to a rolling median baseline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpikeConfig {
    #[serde(default = "default_baseline_window_minutes")]
    pub baseline_window_minutes: u64,
    #[serde(default = "default_spike_threshold_percent")]
    pub threshold_percent: f64,
}

/// Per-monitor alerting overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertingConfig {
    /// Regions that must report down before the monitor counts as down.
    /// Defaults to a strict majority of the monitor's regions.
    #[serde(default)]
    pub down_vote_threshold: Option<u32>,
    /// Minutes a monitor must stay down before the down notification fires.
    #[serde(default)]
    pub grace_down_minutes: Option<u64>,
    /// Minutes the primary latency must stay above the threshold before the
    /// slow notification fires.
    #[serde(default)]
    pub grace_slow_minutes: Option<u64>,
    #[serde(default)]
    pub spike: Option<SpikeConfig>,
}

/// One monitored target. Immutable for the lifetime of a deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorTarget {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub method: ProbeMethod,
    /// URL for HTTP methods, `host:port` for TCP_PING.
    pub target: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Acceptable HTTP status codes; defaults to 200-206.
    #[serde(default)]
    pub expected_codes: Option<Vec<u16>>,
    #[serde(default)]
    pub headers: Option<BTreeMap<String, String>>,
    /// Request body, only honored for POST/PUT/PATCH.
    #[serde(default)]
    pub body: Option<String>,
    /// Substring the response body must contain.
    #[serde(default)]
    pub response_keyword: Option<String>,
    /// Substring the response body must not contain.
    #[serde(default)]
    pub response_forbidden_keyword: Option<String>,
    pub regions: Vec<String>,
    pub primary_region: String,
    #[serde(default)]
    pub latency_threshold_ms: Option<u64>,
    #[serde(default)]
    pub alerting: Option<AlertingConfig>,
    #[serde(default)]
    pub group: Option<String>,
}

impl MonitorTarget {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Effective timeout: explicit value, else 10 s for HTTP, 5 s for TCP.
    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms.unwrap_or(match self.method {
            ProbeMethod::TcpPing => 5_000,
            _ => 10_000,
        })
    }

    pub fn expected_codes(&self) -> Vec<u16> {
        self.expected_codes
            .clone()
            .unwrap_or_else(|| (200..=206).collect())
    }

    /// Regions that must report down for the monitor to count as down.
    pub fn down_vote_threshold(&self) -> usize {
        self.alerting
            .as_ref()
            .and_then(|a| a.down_vote_threshold)
            .map(|t| t as usize)
            .unwrap_or_else(|| self.regions.len().div_ceil(2))
    }

    pub fn grace_down_ms(&self, notification: &NotificationConfig) -> u64 {
        self.alerting
            .as_ref()
            .and_then(|a| a.grace_down_minutes)
            .or(notification.grace_period)
            .unwrap_or(0)
            * 60_000
    }

    pub fn grace_slow_ms(&self, notification: &NotificationConfig) -> u64 {
        self.alerting
            .as_ref()
            .and_then(|a| a.grace_slow_minutes)
            .or(notification.grace_period)
            .unwrap_or(0)
            * 60_000
    }

    pub fn spike(&self) -> Option<&SpikeConfig> {
        self.alerting.as_ref().and_then(|a| a.spike.as_ref())
    }
}

/// How the webhook body is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadType {
    #[serde(rename = "json")]
    Json,
    #[serde(rename = "x-www-form-urlencoded")]
    FormUrlencoded,
    #[serde(rename = "param")]
    Param,
}

/// Webhook endpoint for user-visible notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default = "default_webhook_method")]
    pub method: String,
    #[serde(default = "default_payload_type")]
    pub payload_type: PayloadType,
    /// Template whose string values may contain `$MSG`.
    #[serde(default = "default_payload")]
    pub payload: serde_json::Value,
    #[serde(default = "default_webhook_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub headers: Option<BTreeMap<String, String>>,
}

/// Notification behavior shared by all monitors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default)]
    pub webhook: Option<WebhookConfig>,
    /// Fixed UTC offset used when rendering timestamps, e.g. "+08:00".
    #[serde(default)]
    pub timezone: Option<String>,
    /// Default grace period in minutes for down and slow notifications.
    #[serde(default)]
    pub grace_period: Option<u64>,
    /// Monitors that never notify. They still update state and incidents.
    #[serde(default)]
    pub skip_ids: Vec<String>,
    /// Suppress the repeat notification fired when a down monitor's error
    /// message changes mid-incident.
    #[serde(default)]
    pub skip_error_change_notification: bool,
}

/// A scheduled maintenance window. `start`/`end` are RFC 3339 timestamps;
/// a missing `end` means open-ended, a missing `monitors` list applies the
/// window to every monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceWindow {
    #[serde(default)]
    pub monitors: Option<Vec<String>>,
    #[serde(default)]
    pub title: Option<String>,
    pub body: String,
    pub start: String,
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
}

/// Full runtime configuration assembled from the environment.
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub monitors: Vec<MonitorTarget>,
    pub notification: NotificationConfig,
    pub maintenances: Vec<MaintenanceWindow>,
    /// Opaque UI metadata, passed through by the query layer.
    pub page: serde_json::Value,
    /// Optional `user:pass` guarding the query API.
    pub password_protection: Option<String>,
}

impl AppConfig {
    /// Load configuration from the standard environment variables.
    pub fn from_env() -> crate::Result<Self> {
        let monitors = parse_env_json("MONITORS_CONFIG")?.unwrap_or_default();
        let notification = parse_env_json("NOTIFICATION_CONFIG")?.unwrap_or_default();
        let maintenances = parse_env_json("MAINTENANCES_CONFIG")?.unwrap_or_default();
        let page =
            parse_env_json("PAGE_CONFIG")?.unwrap_or(serde_json::Value::Object(Default::default()));
        let password_protection = std::env::var("PASSWORD_PROTECTION").ok();

        let mut config = Self {
            monitors,
            notification,
            maintenances,
            page,
            password_protection,
        };
        config.validate()?;
        Ok(config)
    }

    /// Build a config from already-parsed pieces, applying the same
    /// validation as [`AppConfig::from_env`].
    pub fn new(
        monitors: Vec<MonitorTarget>,
        notification: NotificationConfig,
        maintenances: Vec<MaintenanceWindow>,
    ) -> crate::Result<Self> {
        let mut config = Self {
            monitors,
            notification,
            maintenances,
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn monitor(&self, id: &str) -> Option<&MonitorTarget> {
        self.monitors.iter().find(|m| m.id == id)
    }

    fn validate(&mut self) -> crate::Result<()> {
        let mut seen = std::collections::BTreeSet::new();
        for monitor in &mut self.monitors {
            if monitor.id.is_empty() || !monitor.id.is_ascii() {
                return Err(crate::LookoutError::Config(format!(
                    "Monitor id {:?} must be a non-empty ASCII identifier",
                    monitor.id
                )));
            }
            if !seen.insert(monitor.id.clone()) {
                return Err(crate::LookoutError::Config(format!(
                    "Duplicate monitor id {:?}",
                    monitor.id
                )));
            }
            if monitor.regions.is_empty() {
                return Err(crate::LookoutError::Config(format!(
                    "Monitor {:?} has no regions",
                    monitor.id
                )));
            }
            // A primary region declared outside the region set joins it.
            if !monitor.regions.contains(&monitor.primary_region) {
                monitor.regions.push(monitor.primary_region.clone());
            }
            if monitor.body.is_some() && !monitor.method.allows_body() {
                return Err(crate::LookoutError::Config(format!(
                    "Monitor {:?} declares a body but method {} does not carry one",
                    monitor.id,
                    monitor.method.as_str()
                )));
            }
        }
        Ok(())
    }
}

fn parse_env_json<T: serde::de::DeserializeOwned>(var: &str) -> crate::Result<Option<T>> {
    match std::env::var(var) {
        Ok(raw) if !raw.trim().is_empty() => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| crate::LookoutError::Config(format!("Invalid {}: {}", var, e))),
        _ => Ok(None),
    }
}

fn default_baseline_window_minutes() -> u64 {
    30
}

fn default_spike_threshold_percent() -> f64 {
    200.0
}

fn default_webhook_method() -> String {
    "POST".to_string()
}

fn default_payload_type() -> PayloadType {
    PayloadType::Json
}

fn default_payload() -> serde_json::Value {
    serde_json::json!({ "text": "$MSG" })
}

fn default_webhook_timeout_ms() -> u64 {
    5_000
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor_json(id: &str) -> MonitorTarget {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "method": "GET",
            "target": format!("https://{}.example.com", id),
            "regions": ["eu", "us"],
            "primary_region": "eu"
        }))
        .unwrap()
    }

    #[test]
    fn parse_full_monitor() {
        let json = serde_json::json!({
            "id": "api",
            "name": "Public API",
            "method": "POST",
            "target": "https://api.example.com/health",
            "timeout_ms": 4000,
            "expected_codes": [200, 401],
            "headers": { "Authorization": "Bearer token" },
            "body": "{\"ping\":true}",
            "response_keyword": "pong",
            "response_forbidden_keyword": "error",
            "regions": ["eu", "us", "ap"],
            "primary_region": "eu",
            "latency_threshold_ms": 500,
            "alerting": {
                "down_vote_threshold": 2,
                "grace_down_minutes": 5,
                "spike": { "baseline_window_minutes": 30, "threshold_percent": 200.0 }
            },
            "group": "core"
        });

        let monitor: MonitorTarget = serde_json::from_value(json).unwrap();
        assert_eq!(monitor.display_name(), "Public API");
        assert_eq!(monitor.timeout_ms(), 4000);
        assert_eq!(monitor.expected_codes(), vec![200, 401]);
        assert_eq!(monitor.down_vote_threshold(), 2);
        assert_eq!(monitor.spike().unwrap().baseline_window_minutes, 30);
    }

    #[test]
    fn monitor_defaults() {
        let monitor = monitor_json("web");
        assert_eq!(monitor.display_name(), "web");
        assert_eq!(monitor.timeout_ms(), 10_000);
        assert_eq!(monitor.expected_codes(), (200..=206).collect::<Vec<_>>());
        // two regions, strict majority
        assert_eq!(monitor.down_vote_threshold(), 1);
    }

    #[test]
    fn tcp_monitor_default_timeout() {
        let monitor: MonitorTarget = serde_json::from_value(serde_json::json!({
            "id": "ssh",
            "method": "TCP_PING",
            "target": "example.com:22",
            "regions": ["eu"],
            "primary_region": "eu"
        }))
        .unwrap();
        assert_eq!(monitor.timeout_ms(), 5_000);
    }

    #[test]
    fn vote_threshold_defaults_to_strict_majority() {
        let mut monitor = monitor_json("web");
        monitor.regions = vec!["a".into(), "b".into(), "c".into()];
        assert_eq!(monitor.down_vote_threshold(), 2);
        monitor.regions.push("d".into());
        assert_eq!(monitor.down_vote_threshold(), 2);
        monitor.regions.push("e".into());
        assert_eq!(monitor.down_vote_threshold(), 3);
    }

    #[test]
    fn grace_periods_fall_back_to_global() {
        let monitor = monitor_json("web");
        let notification = NotificationConfig {
            grace_period: Some(5),
            ..NotificationConfig::default()
        };
        assert_eq!(monitor.grace_down_ms(&notification), 5 * 60_000);
        assert_eq!(monitor.grace_slow_ms(&notification), 5 * 60_000);

        let mut overridden = monitor.clone();
        overridden.alerting = Some(AlertingConfig {
            grace_down_minutes: Some(1),
            ..AlertingConfig::default()
        });
        assert_eq!(overridden.grace_down_ms(&notification), 60_000);
        assert_eq!(overridden.grace_slow_ms(&notification), 5 * 60_000);
    }

    #[test]
    fn validate_rejects_duplicate_ids() {
        let result = AppConfig::new(
            vec![monitor_json("web"), monitor_json("web")],
            NotificationConfig::default(),
            Vec::new(),
        );
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Duplicate monitor id"));
    }

    #[test]
    fn validate_inserts_primary_region() {
        let mut monitor = monitor_json("web");
        monitor.primary_region = "ap".to_string();
        let config =
            AppConfig::new(vec![monitor], NotificationConfig::default(), Vec::new()).unwrap();
        assert!(config.monitors[0].regions.contains(&"ap".to_string()));
    }

    #[test]
    fn validate_rejects_body_on_get() {
        let mut monitor = monitor_json("web");
        monitor.body = Some("nope".to_string());
        let result = AppConfig::new(vec![monitor], NotificationConfig::default(), Vec::new());
        assert!(result.is_err());
    }

    #[test]
    fn validate_rejects_empty_regions() {
        let mut monitor = monitor_json("web");
        monitor.regions.clear();
        monitor.primary_region = String::new();
        let result = AppConfig::new(vec![monitor], NotificationConfig::default(), Vec::new());
        assert!(result.is_err());
    }

    #[test]
    fn parse_notification_config() {
        let json = serde_json::json!({
            "webhook": {
                "url": "https://hooks.example.com/T000/B000",
                "payload_type": "json",
                "payload": { "text": "$MSG" }
            },
            "timezone": "+08:00",
            "grace_period": 5,
            "skip_ids": ["internal"],
            "skip_error_change_notification": true
        });

        let config: NotificationConfig = serde_json::from_value(json).unwrap();
        let webhook = config.webhook.unwrap();
        assert_eq!(webhook.method, "POST");
        assert_eq!(webhook.payload_type, PayloadType::Json);
        assert_eq!(webhook.timeout_ms, 5_000);
        assert_eq!(config.skip_ids, vec!["internal"]);
        assert!(config.skip_error_change_notification);
    }

    #[test]
    fn parse_maintenance_window() {
        let json = serde_json::json!({
            "monitors": ["web"],
            "title": "DB upgrade",
            "body": "Planned database maintenance",
            "start": "2026-01-01T00:00:00Z",
            "end": "2026-01-01T02:00:00Z",
            "color": "gray"
        });

        let window: MaintenanceWindow = serde_json::from_value(json).unwrap();
        assert_eq!(window.monitors.as_deref().unwrap(), ["web".to_string()]);
        assert!(window.end.is_some());
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let monitor: MonitorTarget = serde_json::from_value(serde_json::json!({
            "id": "web",
            "method": "GET",
            "target": "https://example.com",
            "regions": ["eu"],
            "primary_region": "eu",
            "someFutureKnob": 42
        }))
        .unwrap();
        assert_eq!(monitor.id, "web");
    }
}
