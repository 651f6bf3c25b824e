//! Handlers for the query API

use std::collections::BTreeMap;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{FixedOffset, TimeZone, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use super::ApiState;
use crate::maintenance;
use crate::model::{
    epoch_ms, incident_pk, latency_pk, state_pk, ts13, GlobalSummary, Incident, LatencyRecord,
    MonitorState, MonitorStatus, GLOBAL_PK, GLOBAL_SK, STATE_SK,
};
use crate::store::{Order, SortRange};

/// Charts read at most this far back, matching the latency-history TTL.
const HISTORY_WINDOW_MS: u64 = 12 * 3_600_000;

pub(super) enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(crate::LookoutError),
}

impl From<crate::LookoutError> for ApiError {
    fn from(error: crate::LookoutError) -> Self {
        ApiError::Internal(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Internal(error) => {
                tracing::error!("Query handler failed: {}", error);
                (StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub(super) async fn health() -> &'static str {
    "OK"
}

async fn monitor_state(state: &ApiState, monitor_id: &str) -> ApiResult<Option<MonitorState>> {
    match state.store.get(&state_pk(monitor_id), STATE_SK).await? {
        Some(item) => Ok(Some(item.decode()?)),
        None => Ok(None),
    }
}

/// Current global counters plus the full per-monitor state map.
pub(super) async fn status(State(state): State<ApiState>) -> ApiResult<Json<Value>> {
    let now = epoch_ms();
    let summary: Option<GlobalSummary> = match state.store.get(GLOBAL_PK, GLOBAL_SK).await? {
        Some(item) => Some(item.decode()?),
        None => None,
    };
    let active = maintenance::active_windows(&state.config.maintenances, now);

    let mut monitors = serde_json::Map::new();
    for monitor in &state.config.monitors {
        let current = monitor_state(&state, &monitor.id).await?;
        let in_maintenance =
            maintenance::monitor_in_maintenance(&state.config.maintenances, &monitor.id, now);
        let status_text = if in_maintenance {
            "maintenance".to_string()
        } else {
            current
                .as_ref()
                .map(|s| s.status.to_string())
                .unwrap_or_else(|| "unknown".to_string())
        };

        monitors.insert(
            monitor.id.clone(),
            json!({
                "name": monitor.display_name(),
                "status": status_text,
                "primaryRegion": monitor.primary_region,
                "latency": current.as_ref().map(|s| s.primary_latency).unwrap_or(0),
                "timing": current.as_ref().map(|s| s.primary_timing).unwrap_or_default(),
                "regionStatuses": current.as_ref().map(|s| s.region_statuses.clone()).unwrap_or_default(),
                "lastCheck": current.as_ref().map(|s| s.last_check_ms),
                "downSince": current.as_ref().and_then(|s| s.down_since_ms),
                "slowSince": current.as_ref().and_then(|s| s.slow_since_ms),
                "maintenance": in_maintenance,
            }),
        );
    }

    Ok(Json(json!({
        "up": summary.map(|s| s.overall_up).unwrap_or(0),
        "down": summary.map(|s| s.overall_down).unwrap_or(0),
        "degraded": summary.map(|s| s.overall_degraded).unwrap_or(0),
        "updatedAt": summary.map(|s| s.last_update_ms),
        "maintenances": active,
        "monitors": monitors,
    })))
}

/// Compatibility projection: one flat record per monitor.
pub(super) async fn data(State(state): State<ApiState>) -> ApiResult<Json<Value>> {
    let summary: Option<GlobalSummary> = match state.store.get(GLOBAL_PK, GLOBAL_SK).await? {
        Some(item) => Some(item.decode()?),
        None => None,
    };
    let now = epoch_ms();
    let active = maintenance::active_windows(&state.config.maintenances, now);

    let mut monitors = serde_json::Map::new();
    for monitor in &state.config.monitors {
        let current = monitor_state(&state, &monitor.id).await?;
        let (up, message) = match current.as_ref() {
            None => (true, "No data yet".to_string()),
            Some(s) => match s.status {
                MonitorStatus::Up => (true, "OK".to_string()),
                MonitorStatus::Degraded => (true, "Degraded".to_string()),
                MonitorStatus::Down => {
                    let error = open_incident_error(&state, &monitor.id).await?;
                    (false, error.unwrap_or_else(|| "down".to_string()))
                }
            },
        };
        monitors.insert(
            monitor.id.clone(),
            json!({
                "up": up,
                "latency": current.as_ref().map(|s| s.primary_latency).unwrap_or(0),
                "location": monitor.primary_region,
                "message": message,
            }),
        );
    }

    Ok(Json(json!({
        "up": summary.map(|s| s.overall_up).unwrap_or(0),
        "down": summary.map(|s| s.overall_down).unwrap_or(0),
        "updatedAt": summary.map(|s| s.last_update_ms),
        "maintenances": active,
        "monitors": monitors,
    })))
}

async fn open_incident_error(state: &ApiState, monitor_id: &str) -> ApiResult<Option<String>> {
    let newest = state
        .store
        .query(&incident_pk(monitor_id), SortRange::All, Order::Desc, Some(1))
        .await?;
    match newest.into_iter().next() {
        Some(item) => {
            let incident: Incident = item.decode()?;
            Ok(incident.error.filter(|_| incident.end_ms.is_none()))
        }
        None => Ok(None),
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct HistoryQuery {
    region: Option<String>,
}

async fn region_history(
    state: &ApiState,
    monitor_id: &str,
    region: &str,
    now_ms: u64,
) -> ApiResult<Vec<Value>> {
    let items = state
        .store
        .query(
            &latency_pk(monitor_id, region),
            SortRange::AtLeast(ts13(now_ms.saturating_sub(HISTORY_WINDOW_MS))),
            Order::Asc,
            None,
        )
        .await?;
    let mut points = Vec::with_capacity(items.len());
    for item in items {
        let record: LatencyRecord = item.decode()?;
        points.push(json!({
            "time": record.timestamp_ms,
            "latency": record.latency_ms,
            "timing": record.timing,
        }));
    }
    Ok(points)
}

/// Latency history for one region (the primary by default), ascending.
pub(super) async fn history(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Value>> {
    let monitor = state
        .config
        .monitor(&id)
        .ok_or_else(|| ApiError::NotFound(format!("Unknown monitor {:?}", id)))?;
    let region = query
        .region
        .unwrap_or_else(|| monitor.primary_region.clone());
    let data = region_history(&state, &id, &region, epoch_ms()).await?;
    Ok(Json(json!({
        "monitorId": id,
        "region": region,
        "data": data,
    })))
}

/// Latency history for every region of the monitor.
pub(super) async fn history_all(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let monitor = state
        .config
        .monitor(&id)
        .ok_or_else(|| ApiError::NotFound(format!("Unknown monitor {:?}", id)))?;
    let now = epoch_ms();

    let mut regions = serde_json::Map::new();
    for region in &monitor.regions {
        let data = region_history(&state, &id, region, now).await?;
        regions.insert(region.clone(), Value::Array(data));
    }
    Ok(Json(json!({
        "monitorId": id,
        "primaryRegion": monitor.primary_region,
        "regions": regions,
    })))
}

#[derive(Debug, Deserialize)]
pub(super) struct IncidentsQuery {
    #[serde(rename = "monitorId")]
    monitor_id: Option<String>,
}

/// Incident log, newest first, with a year-month grouping for the UI.
pub(super) async fn incidents(
    State(state): State<ApiState>,
    Query(query): Query<IncidentsQuery>,
) -> ApiResult<Json<Value>> {
    let mut incidents: Vec<Incident> = Vec::new();
    match &query.monitor_id {
        Some(monitor_id) => {
            for item in state
                .store
                .query(&incident_pk(monitor_id), SortRange::All, Order::Desc, None)
                .await?
            {
                incidents.push(item.decode()?);
            }
        }
        None => {
            for item in state.store.scan_pk_prefix("INCIDENT#").await? {
                incidents.push(item.decode()?);
            }
            incidents.sort_by(|a, b| b.start_ms.cmp(&a.start_ms));
        }
    }

    let timezone = state
        .config
        .notification
        .timezone
        .as_deref()
        .and_then(|tz| tz.parse::<FixedOffset>().ok());
    let mut by_month: BTreeMap<String, Vec<&Incident>> = BTreeMap::new();
    for incident in &incidents {
        by_month
            .entry(year_month(incident.start_ms, timezone))
            .or_default()
            .push(incident);
    }

    Ok(Json(json!({
        "incidents": incidents,
        "byMonth": by_month,
    })))
}

fn year_month(timestamp_ms: u64, timezone: Option<FixedOffset>) -> String {
    let utc = Utc
        .timestamp_millis_opt(timestamp_ms as i64)
        .single()
        .unwrap_or_default();
    match timezone {
        Some(offset) => utc.with_timezone(&offset).format("%Y-%m").to_string(),
        None => utc.format("%Y-%m").to_string(),
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct BadgeQuery {
    id: Option<String>,
    label: Option<String>,
    up: Option<String>,
    down: Option<String>,
    #[serde(rename = "colorUp")]
    color_up: Option<String>,
    #[serde(rename = "colorDown")]
    color_down: Option<String>,
}

/// shields.io-compatible badge JSON, cacheable for a minute.
pub(super) async fn badge(
    State(state): State<ApiState>,
    Query(query): Query<BadgeQuery>,
) -> ApiResult<Response> {
    let id = query
        .id
        .ok_or_else(|| ApiError::BadRequest("Missing required parameter: id".to_string()))?;
    let monitor = state
        .config
        .monitor(&id)
        .ok_or_else(|| ApiError::NotFound(format!("Unknown monitor {:?}", id)))?;

    let current = monitor_state(&state, &id).await?;
    let is_down = current
        .as_ref()
        .map(|s| s.status == MonitorStatus::Down)
        .unwrap_or(false);

    let (message, color) = if is_down {
        (
            query.down.unwrap_or_else(|| "down".to_string()),
            query.color_down.unwrap_or_else(|| "red".to_string()),
        )
    } else {
        (
            query.up.unwrap_or_else(|| "up".to_string()),
            query.color_up.unwrap_or_else(|| "brightgreen".to_string()),
        )
    };

    let body = json!({
        "schemaVersion": 1,
        "label": query.label.unwrap_or_else(|| monitor.display_name().to_string()),
        "message": message,
        "color": color,
    });
    Ok((
        [(header::CACHE_CONTROL, "public, max-age=60")],
        Json(body),
    )
        .into_response())
}

/// Non-sensitive configuration echo for the status page: identity and
/// topology only, never headers or bodies.
pub(super) async fn config(State(state): State<ApiState>) -> ApiResult<Json<Value>> {
    let now = epoch_ms();
    let monitors: Vec<Value> = state
        .config
        .monitors
        .iter()
        .map(|m| {
            json!({
                "id": m.id,
                "name": m.display_name(),
                "method": m.method.as_str(),
                "group": m.group,
                "regions": m.regions,
                "primaryRegion": m.primary_region,
                "latencyThresholdMs": m.latency_threshold_ms,
            })
        })
        .collect();

    Ok(Json(json!({
        "page": state.config.page,
        "monitors": monitors,
        "maintenances": maintenance::active_windows(&state.config.maintenances, now),
    })))
}
