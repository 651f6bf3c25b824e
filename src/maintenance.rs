//! Maintenance-window matching

use chrono::DateTime;

use crate::config::MaintenanceWindow;

/// Parse an RFC 3339 timestamp into epoch milliseconds.
fn parse_ms(raw: &str) -> Option<u64> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.timestamp_millis().max(0) as u64)
}

/// Whether the window covers `now_ms`. Windows with unparseable timestamps
/// never match.
pub fn window_active(window: &MaintenanceWindow, now_ms: u64) -> bool {
    let Some(start) = parse_ms(&window.start) else {
        return false;
    };
    if now_ms < start {
        return false;
    }
    match window.end.as_deref() {
        None => true,
        Some(end) => match parse_ms(end) {
            Some(end) => now_ms <= end,
            None => false,
        },
    }
}

/// Maintenance windows active at `now_ms`.
pub fn active_windows(windows: &[MaintenanceWindow], now_ms: u64) -> Vec<&MaintenanceWindow> {
    windows.iter().filter(|w| window_active(w, now_ms)).collect()
}

/// A monitor is in maintenance iff some active window either names it or
/// names no monitors at all.
pub fn monitor_in_maintenance(
    windows: &[MaintenanceWindow],
    monitor_id: &str,
    now_ms: u64,
) -> bool {
    active_windows(windows, now_ms).iter().any(|w| {
        w.monitors
            .as_ref()
            .map(|ids| ids.iter().any(|id| id == monitor_id))
            .unwrap_or(true)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(start: &str, end: Option<&str>, monitors: Option<&[&str]>) -> MaintenanceWindow {
        MaintenanceWindow {
            monitors: monitors.map(|ids| ids.iter().map(|s| s.to_string()).collect()),
            title: None,
            body: "maintenance".to_string(),
            start: start.to_string(),
            end: end.map(|s| s.to_string()),
            color: None,
        }
    }

    // 2023-11-14T22:13:20Z
    const NOW: u64 = 1_700_000_000_000;

    #[test]
    fn window_bounds_are_inclusive() {
        let w = window(
            "2023-11-14T22:00:00Z",
            Some("2023-11-14T23:00:00Z"),
            None,
        );
        assert!(window_active(&w, NOW));
        assert!(!window_active(&w, NOW - 3_600_000));
        assert!(!window_active(&w, NOW + 3_600_000));
    }

    #[test]
    fn open_ended_window_never_stops() {
        let w = window("2023-11-14T22:00:00Z", None, None);
        assert!(window_active(&w, NOW));
        assert!(window_active(&w, NOW + 365 * 24 * 3_600_000));
    }

    #[test]
    fn future_window_is_inactive() {
        let w = window("2030-01-01T00:00:00Z", None, None);
        assert!(!window_active(&w, NOW));
    }

    #[test]
    fn unparseable_timestamps_never_match() {
        assert!(!window_active(&window("soon", None, None), NOW));
        assert!(!window_active(
            &window("2023-11-14T22:00:00Z", Some("later"), None),
            NOW
        ));
    }

    #[test]
    fn window_without_monitor_list_covers_everything() {
        let windows = vec![window("2023-11-14T22:00:00Z", None, None)];
        assert!(monitor_in_maintenance(&windows, "anything", NOW));
    }

    #[test]
    fn window_with_monitor_list_is_selective() {
        let windows = vec![window("2023-11-14T22:00:00Z", None, Some(&["db"]))];
        assert!(monitor_in_maintenance(&windows, "db", NOW));
        assert!(!monitor_in_maintenance(&windows, "web", NOW));
    }

    #[test]
    fn inactive_windows_do_not_cover() {
        let windows = vec![window("2030-01-01T00:00:00Z", None, None)];
        assert!(!monitor_in_maintenance(&windows, "web", NOW));
    }
}
