//! Timed TCP connect prober
//!
//! For `TCP_PING` monitors: resolve, connect, close. No bytes are exchanged;
//! reachability and connect latency are the whole measurement.

use std::io;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;

use super::ProbeOutcome;
use crate::config::MonitorTarget;
use crate::model::{CheckStatus, TimingMetrics};

/// Execute one connect-only check against a `host:port` target.
pub async fn check(monitor: &MonitorTarget) -> ProbeOutcome {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(monitor.timeout_ms());
    let mut timing = TimingMetrics::default();

    let error = match connect(&monitor.target, deadline, &mut timing).await {
        Ok(()) => None,
        Err(error) => Some(error),
    };
    timing.total = timing.dns_lookup + timing.tcp_connect;

    ProbeOutcome {
        status: if error.is_none() {
            CheckStatus::Up
        } else {
            CheckStatus::Down
        },
        latency_ms: timing.total,
        timing,
        error,
    }
}

async fn connect(
    target: &str,
    deadline: tokio::time::Instant,
    timing: &mut TimingMetrics,
) -> Result<(), String> {
    let (host, port) = target
        .rsplit_once(':')
        .ok_or_else(|| format!("Connection failed: invalid target {:?}, expected host:port", target))?;
    let port: u16 = port
        .parse()
        .map_err(|_| format!("Connection failed: invalid port in {:?}", target))?;

    let phase = Instant::now();
    let resolved = match tokio::time::timeout_at(deadline, tokio::net::lookup_host((host, port))).await
    {
        Err(_) => {
            timing.dns_lookup = elapsed_ms(phase);
            return Err("Request timeout".to_string());
        }
        Ok(Err(e)) => {
            timing.dns_lookup = elapsed_ms(phase);
            return Err(categorize_dns_error(&e));
        }
        Ok(Ok(addrs)) => addrs.into_iter().next(),
    };
    timing.dns_lookup = elapsed_ms(phase);
    let addr = resolved.ok_or_else(|| "DNS resolution failed".to_string())?;

    let phase = Instant::now();
    let stream = match tokio::time::timeout_at(deadline, TcpStream::connect(addr)).await {
        Err(_) => {
            timing.tcp_connect = elapsed_ms(phase);
            return Err("Request timeout".to_string());
        }
        Ok(Err(e)) => {
            timing.tcp_connect = elapsed_ms(phase);
            return Err(categorize_connect_error(&e));
        }
        Ok(Ok(stream)) => stream,
    };
    timing.tcp_connect = elapsed_ms(phase);
    drop(stream);
    Ok(())
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

fn categorize_dns_error(error: &io::Error) -> String {
    let message = error.to_string();
    if message.contains("Name or service not known")
        || message.contains("nodename nor servname")
        || message.contains("No address associated with hostname")
    {
        "Host not found".to_string()
    } else {
        "DNS resolution failed".to_string()
    }
}

fn categorize_connect_error(error: &io::Error) -> String {
    match error.kind() {
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted => "Connection refused".to_string(),
        io::ErrorKind::TimedOut => "Request timeout".to_string(),
        _ => format!("Connection failed: {}", error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn monitor(target: &str) -> MonitorTarget {
        serde_json::from_value(serde_json::json!({
            "id": "tcp-test",
            "method": "TCP_PING",
            "target": target,
            "regions": ["local"],
            "primary_region": "local"
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn successful_connect_is_up_with_summed_total() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let outcome = check(&monitor(&addr.to_string())).await;
        assert_eq!(outcome.status, CheckStatus::Up);
        assert!(outcome.error.is_none());
        assert_eq!(
            outcome.timing.total,
            outcome.timing.dns_lookup + outcome.timing.tcp_connect
        );
        assert_eq!(outcome.timing.tls_handshake, 0);
        assert_eq!(outcome.timing.ttfb, 0);
        assert_eq!(outcome.timing.content_download, 0);
    }

    #[tokio::test]
    async fn refused_connect_is_down() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let outcome = check(&monitor(&addr.to_string())).await;
        assert_eq!(outcome.status, CheckStatus::Down);
        assert_eq!(outcome.error.as_deref(), Some("Connection refused"));
    }

    #[tokio::test]
    async fn malformed_target_is_down_without_probing() {
        let outcome = check(&monitor("no-port-here")).await;
        assert_eq!(outcome.status, CheckStatus::Down);
        assert!(outcome.error.unwrap().starts_with("Connection failed: invalid target"));
        assert_eq!(outcome.timing.total, 0);
    }

    #[tokio::test]
    async fn bad_port_is_down() {
        let outcome = check(&monitor("example.com:notaport")).await;
        assert_eq!(outcome.status, CheckStatus::Down);
        assert!(outcome.error.unwrap().contains("invalid port"));
    }
}
