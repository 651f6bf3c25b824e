#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use proptest::prelude::*;

    use crate::aggregator::spike::attribute_phase;
    use crate::aggregator::{evaluate, transition, Event};
    use crate::config::{MonitorTarget, NotificationConfig};
    use crate::model::{CheckResult, CheckStatus, MonitorState, MonitorStatus, TimingMetrics};

    const T0: u64 = 1_700_000_000_000;
    const MINUTE: u64 = 60_000;

    fn monitor_with_regions(count: usize) -> MonitorTarget {
        let regions: Vec<String> = (0..count).map(|i| format!("r{}", i)).collect();
        serde_json::from_value(serde_json::json!({
            "id": "m",
            "method": "GET",
            "target": "https://m.example.com",
            "regions": regions,
            "primary_region": "r0"
        }))
        .unwrap()
    }

    fn observations(count: usize, down_mask: &[bool]) -> BTreeMap<String, CheckResult> {
        (0..count)
            .map(|i| {
                let region = format!("r{}", i);
                let down = down_mask.get(i).copied().unwrap_or(false);
                let result = CheckResult {
                    monitor_id: "m".to_string(),
                    region: region.clone(),
                    timestamp_ms: T0,
                    status: if down {
                        CheckStatus::Down
                    } else {
                        CheckStatus::Up
                    },
                    latency_ms: 100,
                    timing: TimingMetrics {
                        total: 100,
                        ..TimingMetrics::default()
                    },
                    error: down.then(|| "Connection refused".to_string()),
                };
                (region, result)
            })
            .collect()
    }

    proptest! {
        #[test]
        fn vote_matches_the_threshold_rule(
            count in 1usize..=7,
            mask in prop::collection::vec(any::<bool>(), 7)
        ) {
            let monitor = monitor_with_regions(count);
            let down = mask.iter().take(count).filter(|d| **d).count();
            let threshold = count.div_ceil(2);

            let evaluation = evaluate(&monitor, &observations(count, &mask));
            let expected = if down >= threshold {
                MonitorStatus::Down
            } else if down > 0 {
                MonitorStatus::Degraded
            } else {
                MonitorStatus::Up
            };
            prop_assert_eq!(evaluation.status, expected);
            prop_assert_eq!(evaluation.regions_down.len(), down);
        }

        #[test]
        fn continuous_down_notifies_exactly_once(
            grace_minutes in 0u64..10,
            ticks in 1u64..30
        ) {
            let monitor = monitor_with_regions(1);
            let notification = NotificationConfig {
                grace_period: Some(grace_minutes),
                ..NotificationConfig::default()
            };
            let evaluation = evaluate(&monitor, &observations(1, &[true]));

            let mut state: Option<MonitorState> = None;
            let mut down_events = 0usize;
            for tick in 0..ticks {
                let now = T0 + tick * MINUTE;
                let (next, events) =
                    transition(now, &monitor, &notification, &evaluation, state.as_ref());
                down_events += events
                    .iter()
                    .filter(|e| matches!(e, Event::Down { .. }))
                    .count();
                state = Some(next);
            }

            // The first tick at or past the grace period fires, none after.
            let expected = if ticks > grace_minutes { 1 } else { 0 };
            prop_assert_eq!(down_events, expected);
        }

        #[test]
        fn recovery_never_fires_without_an_announced_outage(
            grace_minutes in 1u64..10,
            down_ticks in 1u64..5
        ) {
            // Outage shorter than the grace period, then recovery.
            prop_assume!(down_ticks <= grace_minutes);
            let monitor = monitor_with_regions(1);
            let notification = NotificationConfig {
                grace_period: Some(grace_minutes),
                ..NotificationConfig::default()
            };
            let down_eval = evaluate(&monitor, &observations(1, &[true]));
            let up_eval = evaluate(&monitor, &observations(1, &[false]));

            let mut state: Option<MonitorState> = None;
            let mut events_seen = 0usize;
            for tick in 0..down_ticks {
                let (next, events) = transition(
                    T0 + tick * MINUTE,
                    &monitor,
                    &notification,
                    &down_eval,
                    state.as_ref(),
                );
                events_seen += events.len();
                state = Some(next);
            }
            let (_, events) = transition(
                T0 + down_ticks * MINUTE,
                &monitor,
                &notification,
                &up_eval,
                state.as_ref(),
            );
            events_seen += events.len();

            prop_assert_eq!(events_seen, 0);
        }

        #[test]
        fn phase_attribution_is_total_and_prefers_dns(
            dns in 0u64..500,
            tls in 0u64..500,
            ttfb in 0u64..2000,
            download in 0u64..2000
        ) {
            let timing = TimingMetrics {
                dns_lookup: dns,
                tcp_connect: 10,
                tls_handshake: tls,
                ttfb,
                content_download: download,
                total: dns + 10 + tls + ttfb + download,
            };
            let phase = attribute_phase(&timing);
            prop_assert!(["DNS", "TLS", "TTFB", "overall"].contains(&phase));
            if dns > 100 {
                prop_assert_eq!(phase, "DNS");
            }
        }
    }
}
