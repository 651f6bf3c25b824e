//! Central aggregator
//!
//! Runs once per tick: for every monitor, fuse the latest per-region
//! observations by majority vote, advance the per-monitor state machine,
//! keep the incident log current, and emit edge-triggered notifications.
//! The aggregator only reads what the probes wrote; it never probes.

pub mod spike;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::config::{AppConfig, MonitorTarget, NotificationConfig};
use crate::model::{
    check_pk, incident_pk, state_pk, ts13, CheckResult, CheckStatus, GlobalSummary, Incident,
    MonitorState, MonitorStatus, RegionStatus, TimingMetrics, GLOBAL_PK, GLOBAL_SK,
    INCIDENT_TTL_SECS, OBSERVATION_WINDOW_MS, STATE_SK,
};
use crate::notifier::{self, Notification, Notifier};
use crate::store::{Item, Order, SortRange, Store};

/// What one aggregator tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregateSummary {
    pub monitors: usize,
    pub up: usize,
    pub degraded: usize,
    pub down: usize,
    /// Monitors skipped this tick because their aggregation errored.
    pub skipped: usize,
    pub notifications: usize,
}

/// Notification-worthy happenings for one monitor in one tick.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Event {
    Down { since_ms: u64, error: String },
    Up { downtime_ms: u64 },
    Slow { latency_ms: u64, threshold_ms: u64 },
    Fast { latency_ms: u64, threshold_ms: u64 },
    Spike { latency_ms: u64, baseline_ms: u64, phase: &'static str },
    ErrorChanged { since_ms: u64, error: String },
}

/// Run one aggregation tick at wall-clock time `now_ms`.
pub async fn run_tick(
    now_ms: u64,
    config: &AppConfig,
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
) -> crate::Result<AggregateSummary> {
    let mut summary = AggregateSummary::default();

    for monitor in &config.monitors {
        match aggregate_monitor(now_ms, monitor, config, &store, notifier.as_ref()).await {
            Ok((status, notifications)) => {
                summary.monitors += 1;
                summary.notifications += notifications;
                match status {
                    MonitorStatus::Up => summary.up += 1,
                    MonitorStatus::Degraded => summary.degraded += 1,
                    MonitorStatus::Down => summary.down += 1,
                }
            }
            Err(e) => {
                tracing::error!("Aggregating monitor '{}' failed: {}", monitor.id, e);
                summary.skipped += 1;
            }
        }
    }

    let global = GlobalSummary {
        overall_up: summary.up as u32,
        overall_down: summary.down as u32,
        overall_degraded: summary.degraded as u32,
        last_update_ms: now_ms,
    };
    store
        .put(
            Item::new(GLOBAL_PK.to_string(), GLOBAL_SK.to_string(), &global)?
                .with_version(now_ms),
        )
        .await?;

    tracing::info!(
        "Aggregated {} monitor(s): {} up, {} degraded, {} down, {} skipped, {} notification(s)",
        summary.monitors,
        summary.up,
        summary.degraded,
        summary.down,
        summary.skipped,
        summary.notifications
    );
    Ok(summary)
}

async fn aggregate_monitor(
    now_ms: u64,
    monitor: &MonitorTarget,
    config: &AppConfig,
    store: &Arc<dyn Store>,
    notifier: &dyn Notifier,
) -> crate::Result<(MonitorStatus, usize)> {
    let observations = collect_observations(now_ms, monitor, store).await?;
    let evaluation = evaluate(monitor, &observations);

    let previous: Option<MonitorState> = match store.get(&state_pk(&monitor.id), STATE_SK).await? {
        Some(item) => Some(item.decode()?),
        None => None,
    };

    let (state, mut events) = transition(
        now_ms,
        monitor,
        &config.notification,
        &evaluation,
        previous.as_ref(),
    );

    let down_announced = events
        .iter()
        .any(|e| matches!(e, Event::Down { .. }));
    if let Some(event) = update_incidents(
        now_ms,
        monitor,
        &config.notification,
        &evaluation,
        previous.as_ref(),
        &state,
        down_announced,
        store,
    )
    .await?
    {
        events.push(event);
    }

    if let Some(event) = spike::detect(monitor, &evaluation, store).await? {
        events.push(event);
    }

    // A rejected write means a newer tick already owns this monitor; its
    // notifications are not ours to send.
    let applied = store
        .put_if_newer(
            Item::new(state_pk(&monitor.id), STATE_SK.to_string(), &state)?
                .with_version(now_ms),
        )
        .await?;
    if !applied {
        tracing::warn!(
            "Skipping notifications for '{}': a newer aggregation already ran",
            monitor.id
        );
        return Ok((state.status, 0));
    }

    let dispatched = dispatch(monitor, config, &events, notifier).await;
    Ok((state.status, dispatched))
}

/// Most recent observation per region within the lookback window. All
/// regions share one partition key, so a single range query collects the
/// whole tally at once.
async fn collect_observations(
    now_ms: u64,
    monitor: &MonitorTarget,
    store: &Arc<dyn Store>,
) -> crate::Result<BTreeMap<String, CheckResult>> {
    let window_start = now_ms.saturating_sub(OBSERVATION_WINDOW_MS);
    let items = store
        .query(
            &check_pk(&monitor.id),
            SortRange::AtLeast(ts13(window_start)),
            Order::Asc,
            None,
        )
        .await?;

    let mut latest: BTreeMap<String, CheckResult> = BTreeMap::new();
    for item in items {
        let result: CheckResult = item.decode()?;
        if !monitor.regions.contains(&result.region) {
            continue;
        }
        match latest.get(&result.region) {
            Some(existing) if existing.timestamp_ms >= result.timestamp_ms => {}
            _ => {
                latest.insert(result.region.clone(), result);
            }
        }
    }
    Ok(latest)
}

/// Pure vote and status derivation for one monitor.
#[derive(Debug, Clone)]
pub(crate) struct Evaluation {
    pub status: MonitorStatus,
    pub regions_down: BTreeSet<String>,
    pub region_statuses: BTreeMap<String, RegionStatus>,
    pub primary: Option<CheckResult>,
    pub primary_latency: u64,
    pub primary_timing: TimingMetrics,
    /// Representative error while down: the primary region's if it is down,
    /// otherwise the first down region's.
    pub error: Option<String>,
}

pub(crate) fn evaluate(
    monitor: &MonitorTarget,
    observations: &BTreeMap<String, CheckResult>,
) -> Evaluation {
    let mut regions_down = BTreeSet::new();
    let mut region_statuses = BTreeMap::new();
    for (region, observation) in observations {
        region_statuses.insert(
            region.clone(),
            RegionStatus {
                status: observation.status,
                latency: observation.latency_ms,
            },
        );
        if observation.status == CheckStatus::Down {
            regions_down.insert(region.clone());
        }
    }

    let threshold = monitor.down_vote_threshold().max(1);
    let status = if regions_down.len() >= threshold {
        MonitorStatus::Down
    } else if !regions_down.is_empty() {
        MonitorStatus::Degraded
    } else {
        MonitorStatus::Up
    };

    let primary = observations.get(&monitor.primary_region).cloned();
    let (primary_latency, primary_timing) = primary
        .as_ref()
        .map(|p| (p.latency_ms, p.timing))
        .unwrap_or((0, TimingMetrics::default()));

    let error = primary
        .as_ref()
        .filter(|p| p.status == CheckStatus::Down)
        .and_then(|p| p.error.clone())
        .or_else(|| {
            regions_down
                .iter()
                .find_map(|region| observations.get(region).and_then(|o| o.error.clone()))
        });

    Evaluation {
        status,
        regions_down,
        region_statuses,
        primary,
        primary_latency,
        primary_timing,
        error,
    }
}

/// Advance the state machine and collect edge-triggered events.
///
/// Notification bookkeeping lives in the state itself: `last_notified_down`
/// older than `down_since` means the current episode has not been announced,
/// and `last_notified_slow` is cleared the moment latency recovers.
pub(crate) fn transition(
    now_ms: u64,
    monitor: &MonitorTarget,
    notification: &NotificationConfig,
    evaluation: &Evaluation,
    previous: Option<&MonitorState>,
) -> (MonitorState, Vec<Event>) {
    let mut events = Vec::new();
    let mut state = MonitorState {
        status: evaluation.status,
        primary_latency: evaluation.primary_latency,
        primary_timing: evaluation.primary_timing,
        region_statuses: evaluation.region_statuses.clone(),
        last_check_ms: now_ms,
        down_since_ms: None,
        slow_since_ms: None,
        last_notified_down_ms: previous.and_then(|p| p.last_notified_down_ms),
        last_notified_slow_ms: previous.and_then(|p| p.last_notified_slow_ms),
    };

    match evaluation.status {
        MonitorStatus::Down => {
            let since = previous
                .filter(|p| p.status == MonitorStatus::Down)
                .and_then(|p| p.down_since_ms)
                .unwrap_or(now_ms);
            state.down_since_ms = Some(since);

            let grace = monitor.grace_down_ms(notification);
            let announced = state
                .last_notified_down_ms
                .is_some_and(|notified| notified >= since);
            if now_ms.saturating_sub(since) >= grace && !announced {
                events.push(Event::Down {
                    since_ms: since,
                    error: evaluation
                        .error
                        .clone()
                        .unwrap_or_else(|| "unknown error".to_string()),
                });
                state.last_notified_down_ms = Some(now_ms);
            }
        }
        MonitorStatus::Up => {
            if let Some(previous) = previous.filter(|p| p.status == MonitorStatus::Down) {
                // Recovery is only worth announcing if the outage was.
                if previous.last_notified_down_ms.is_some() {
                    let downtime = now_ms.saturating_sub(
                        previous.down_since_ms.unwrap_or(now_ms),
                    );
                    events.push(Event::Up {
                        downtime_ms: downtime,
                    });
                }
            }
            state.last_notified_down_ms = None;
        }
        MonitorStatus::Degraded => {}
    }

    if let Some(threshold) = monitor.latency_threshold_ms {
        if evaluation.primary_latency > threshold {
            let since = previous.and_then(|p| p.slow_since_ms).unwrap_or(now_ms);
            state.slow_since_ms = Some(since);

            let grace = monitor.grace_slow_ms(notification);
            if now_ms.saturating_sub(since) >= grace && state.last_notified_slow_ms.is_none() {
                events.push(Event::Slow {
                    latency_ms: evaluation.primary_latency,
                    threshold_ms: threshold,
                });
                state.last_notified_slow_ms = Some(now_ms);
            }
        } else {
            let was_slow = previous.is_some_and(|p| p.slow_since_ms.is_some());
            let was_announced = previous.is_some_and(|p| p.last_notified_slow_ms.is_some());
            if was_slow && was_announced {
                events.push(Event::Fast {
                    latency_ms: evaluation.primary_latency,
                    threshold_ms: threshold,
                });
            }
            state.last_notified_slow_ms = None;
        }
    } else {
        state.last_notified_slow_ms = None;
    }

    (state, events)
}

/// Keep the incident log in step with the new state.
///
/// While down, the incident keyed by `down_since` is upserted with the
/// current error and down-region set. On recovery the incident to close is
/// found by the previous state's `down_since`, so a TTL-expired historical
/// record can never be closed by mistake; the most-recent-open fallback only
/// covers states that lost their `down_since`.
#[allow(clippy::too_many_arguments)]
async fn update_incidents(
    now_ms: u64,
    monitor: &MonitorTarget,
    notification: &NotificationConfig,
    evaluation: &Evaluation,
    previous: Option<&MonitorState>,
    state: &MonitorState,
    down_announced_this_tick: bool,
    store: &Arc<dyn Store>,
) -> crate::Result<Option<Event>> {
    match state.status {
        MonitorStatus::Down => {
            let Some(since) = state.down_since_ms else {
                return Ok(None);
            };
            let pk = incident_pk(&monitor.id);
            let sk = ts13(since);
            let existing: Option<Incident> = match store.get(&pk, &sk).await? {
                Some(item) => Some(item.decode()?),
                None => None,
            };

            let error_changed = existing
                .as_ref()
                .is_some_and(|incident| incident.error != evaluation.error);

            let incident = Incident {
                monitor_id: monitor.id.clone(),
                start_ms: since,
                end_ms: existing.as_ref().and_then(|i| i.end_ms),
                error: evaluation.error.clone(),
                regions_down: evaluation.regions_down.clone(),
            };
            store
                .put(
                    Item::new(pk, sk, &incident)?
                        .with_ttl(now_ms, INCIDENT_TTL_SECS)
                        .with_version(now_ms),
                )
                .await?;

            let already_announced = state
                .last_notified_down_ms
                .is_some_and(|notified| notified >= since);
            if error_changed
                && already_announced
                && !down_announced_this_tick
                && !notification.skip_error_change_notification
            {
                return Ok(Some(Event::ErrorChanged {
                    since_ms: since,
                    error: evaluation
                        .error
                        .clone()
                        .unwrap_or_else(|| "unknown error".to_string()),
                }));
            }
            Ok(None)
        }
        MonitorStatus::Up => {
            let pk = incident_pk(&monitor.id);
            let candidate = match previous
                .filter(|p| p.status == MonitorStatus::Down)
                .and_then(|p| p.down_since_ms)
            {
                Some(since) => store.get(&pk, &ts13(since)).await?,
                None => store
                    .query(&pk, SortRange::All, Order::Desc, Some(1))
                    .await?
                    .into_iter()
                    .next(),
            };

            if let Some(item) = candidate {
                let mut incident: Incident = item.decode()?;
                if incident.end_ms.is_none() {
                    incident.end_ms = Some(now_ms);
                    store
                        .put(
                            Item::new(pk, ts13(incident.start_ms), &incident)?
                                .with_ttl(now_ms, INCIDENT_TTL_SECS)
                                .with_version(now_ms),
                        )
                        .await?;
                }
            }
            Ok(None)
        }
        MonitorStatus::Degraded => Ok(None),
    }
}

/// Format and deliver events, honoring the skip list. Delivery failures are
/// logged and swallowed; returns the number of attempted notifications.
async fn dispatch(
    monitor: &MonitorTarget,
    config: &AppConfig,
    events: &[Event],
    notifier: &dyn Notifier,
) -> usize {
    if events.is_empty() {
        return 0;
    }
    if config.notification.skip_ids.contains(&monitor.id) {
        tracing::debug!(
            "Monitor '{}' is on the notification skip list, dropping {} event(s)",
            monitor.id,
            events.len()
        );
        return 0;
    }

    let name = monitor.display_name();
    let timezone = config.notification.timezone.as_deref();
    let mut dispatched = 0;
    for event in events {
        let message = match event {
            Event::Down { since_ms, error } => {
                notifier::down_message(name, *since_ms, error, timezone)
            }
            Event::Up { downtime_ms } => notifier::up_message(name, *downtime_ms),
            Event::Slow {
                latency_ms,
                threshold_ms,
            } => notifier::slow_message(name, *latency_ms, *threshold_ms),
            Event::Fast {
                latency_ms,
                threshold_ms,
            } => notifier::fast_message(name, *latency_ms, *threshold_ms),
            Event::Spike {
                latency_ms,
                baseline_ms,
                phase,
            } => notifier::spike_message(name, *latency_ms, *baseline_ms, phase),
            Event::ErrorChanged { since_ms, error } => {
                notifier::down_message(name, *since_ms, error, timezone)
            }
        };

        let notification = Notification {
            monitor_id: monitor.id.clone(),
            message,
        };
        if let Err(e) = notifier.notify(&notification).await {
            tracing::warn!(
                "Notification for '{}' failed: {}",
                monitor.id,
                e
            );
        }
        dispatched += 1;
    }
    dispatched
}
