//! Latency spike detection against a rolling baseline
//!
//! The baseline is the median of the primary region's latency history over
//! the configured window, excluding the observation under test. Too few
//! samples means no verdict: a fresh monitor does not spike.

use std::sync::Arc;

use super::{Evaluation, Event};
use crate::config::MonitorTarget;
use crate::model::{latency_pk, ts13, LatencyRecord, TimingMetrics};
use crate::store::{Order, SortRange, Store};

/// Minimum history before a baseline is trusted.
const MIN_BASELINE_SAMPLES: usize = 6;

/// Latency attribution heuristics: phase thresholds beyond which a phase is
/// named as the likely culprit in the spike message.
const DNS_SUSPECT_MS: u64 = 100;
const TLS_SUSPECT_MS: u64 = 200;
const TTFB_SUSPECT_SHARE: f64 = 0.7;

/// Check the current primary observation against the rolling baseline.
pub(crate) async fn detect(
    monitor: &MonitorTarget,
    evaluation: &Evaluation,
    store: &Arc<dyn Store>,
) -> crate::Result<Option<Event>> {
    let Some(spike) = monitor.spike() else {
        return Ok(None);
    };
    let Some(primary) = evaluation.primary.as_ref() else {
        return Ok(None);
    };

    let window_ms = spike.baseline_window_minutes * 60_000;
    let window_start = primary.timestamp_ms.saturating_sub(window_ms);
    let items = store
        .query(
            &latency_pk(&monitor.id, &monitor.primary_region),
            SortRange::AtLeast(ts13(window_start)),
            Order::Asc,
            None,
        )
        .await?;

    let mut samples = Vec::with_capacity(items.len());
    for item in items {
        let record: LatencyRecord = item.decode()?;
        if record.timestamp_ms < primary.timestamp_ms {
            samples.push(record.latency_ms);
        }
    }
    if samples.len() < MIN_BASELINE_SAMPLES {
        return Ok(None);
    }

    let baseline = median(&mut samples);
    let cutoff = baseline as f64 * (1.0 + spike.threshold_percent / 100.0);
    if (primary.latency_ms as f64) <= cutoff {
        return Ok(None);
    }

    Ok(Some(Event::Spike {
        latency_ms: primary.latency_ms,
        baseline_ms: baseline,
        phase: attribute_phase(&primary.timing),
    }))
}

/// Name the phase most likely responsible for a slow sample.
pub(crate) fn attribute_phase(timing: &TimingMetrics) -> &'static str {
    if timing.dns_lookup > DNS_SUSPECT_MS {
        "DNS"
    } else if timing.tls_handshake > TLS_SUSPECT_MS {
        "TLS"
    } else if timing.total > 0 && timing.ttfb as f64 > TTFB_SUSPECT_SHARE * timing.total as f64 {
        "TTFB"
    } else {
        "overall"
    }
}

fn median(samples: &mut [u64]) -> u64 {
    samples.sort_unstable();
    let mid = samples.len() / 2;
    if samples.len() % 2 == 1 {
        samples[mid]
    } else {
        (samples[mid - 1] + samples[mid]) / 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::evaluate;
    use crate::model::{CheckResult, CheckStatus};
    use crate::store::{Item, MemoryStore};
    use std::collections::BTreeMap;

    const T0: u64 = 1_700_000_000_000;
    const MINUTE: u64 = 60_000;

    fn monitor() -> MonitorTarget {
        serde_json::from_value(serde_json::json!({
            "id": "web",
            "method": "GET",
            "target": "https://example.com",
            "regions": ["eu"],
            "primary_region": "eu",
            "alerting": {
                "spike": { "baseline_window_minutes": 30, "threshold_percent": 200.0 }
            }
        }))
        .unwrap()
    }

    async fn seed_history(store: &MemoryStore, latencies: &[u64]) {
        for (i, latency) in latencies.iter().enumerate() {
            let ts = T0 - (latencies.len() - i) as u64 * MINUTE;
            let record = LatencyRecord {
                monitor_id: "web".to_string(),
                region: "eu".to_string(),
                timestamp_ms: ts,
                latency_ms: *latency,
                timing: TimingMetrics {
                    total: *latency,
                    ..TimingMetrics::default()
                },
            };
            store
                .put(Item::new(latency_pk("web", "eu"), ts13(ts), &record).unwrap())
                .await
                .unwrap();
        }
    }

    fn eval_with_latency(latency: u64, ttfb: u64) -> Evaluation {
        let mut obs = BTreeMap::new();
        obs.insert(
            "eu".to_string(),
            CheckResult {
                monitor_id: "web".to_string(),
                region: "eu".to_string(),
                timestamp_ms: T0,
                status: CheckStatus::Up,
                latency_ms: latency,
                timing: TimingMetrics {
                    ttfb,
                    total: latency,
                    ..TimingMetrics::default()
                },
                error: None,
            },
        );
        evaluate(&monitor(), &obs)
    }

    #[tokio::test]
    async fn spike_fires_above_threshold_with_phase() {
        let store = MemoryStore::new();
        seed_history(&store, &[100; 20]).await;
        let store: Arc<dyn Store> = Arc::new(store);

        // 350 > 100 * (1 + 200/100) = 300, and ttfb 280 > 0.7 * 350.
        let event = detect(&monitor(), &eval_with_latency(350, 280), &store)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            event,
            Event::Spike { latency_ms: 350, baseline_ms: 100, phase: "TTFB" }
        ));
    }

    #[tokio::test]
    async fn no_spike_at_or_below_threshold() {
        let store = MemoryStore::new();
        seed_history(&store, &[100; 20]).await;
        let store: Arc<dyn Store> = Arc::new(store);

        let event = detect(&monitor(), &eval_with_latency(300, 10), &store)
            .await
            .unwrap();
        assert!(event.is_none());
    }

    #[tokio::test]
    async fn too_few_samples_means_no_verdict() {
        let store = MemoryStore::new();
        seed_history(&store, &[100; 5]).await;
        let store: Arc<dyn Store> = Arc::new(store);

        let event = detect(&monitor(), &eval_with_latency(10_000, 10), &store)
            .await
            .unwrap();
        assert!(event.is_none());
    }

    #[tokio::test]
    async fn current_sample_is_excluded_from_its_own_baseline() {
        let store = MemoryStore::new();
        seed_history(&store, &[100; 6]).await;
        // A record at exactly the observation's timestamp must not count.
        let record = LatencyRecord {
            monitor_id: "web".to_string(),
            region: "eu".to_string(),
            timestamp_ms: T0,
            latency_ms: 10_000,
            timing: TimingMetrics::default(),
        };
        store
            .put(Item::new(latency_pk("web", "eu"), ts13(T0), &record).unwrap())
            .await
            .unwrap();
        let store: Arc<dyn Store> = Arc::new(store);

        let event = detect(&monitor(), &eval_with_latency(10_000, 10), &store)
            .await
            .unwrap();
        assert!(matches!(event, Some(Event::Spike { baseline_ms: 100, .. })));
    }

    #[tokio::test]
    async fn disabled_spike_detection_is_inert() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let mut plain = monitor();
        plain.alerting = None;
        let event = detect(&plain, &eval_with_latency(10_000, 10), &store)
            .await
            .unwrap();
        assert!(event.is_none());
    }

    #[test]
    fn phase_attribution_order() {
        let t = |dns, tls, ttfb, total| TimingMetrics {
            dns_lookup: dns,
            tls_handshake: tls,
            ttfb,
            total,
            ..TimingMetrics::default()
        };
        assert_eq!(attribute_phase(&t(150, 300, 900, 1000)), "DNS");
        assert_eq!(attribute_phase(&t(50, 300, 900, 1000)), "TLS");
        assert_eq!(attribute_phase(&t(50, 100, 900, 1000)), "TTFB");
        assert_eq!(attribute_phase(&t(50, 100, 200, 1000)), "overall");
        assert_eq!(attribute_phase(&TimingMetrics::default()), "overall");
    }

    #[test]
    fn median_handles_odd_and_even() {
        assert_eq!(median(&mut [3, 1, 2]), 2);
        assert_eq!(median(&mut [4, 1, 2, 3]), 2);
        assert_eq!(median(&mut [7]), 7);
    }
}
