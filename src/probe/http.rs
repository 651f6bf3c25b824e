//! Timed HTTP(S) client
//!
//! Executes exactly one request over a raw socket so every connection phase
//! can be measured against the wall clock: DNS, TCP connect, TLS handshake,
//! time-to-first-byte, and body download. A general-purpose client pools
//! connections and hides these boundaries, which is exactly what a latency
//! monitor cannot afford. The request/response framing is plain HTTP/1.1
//! with `Connection: close`; redirects are not followed.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use url::Url;

use super::ProbeOutcome;
use crate::config::MonitorTarget;
use crate::model::{CheckStatus, TimingMetrics};

/// Stable identifier sent with every probe request.
pub const USER_AGENT: &str = concat!("lookout-monitor/", env!("CARGO_PKG_VERSION"));

const READ_CHUNK: usize = 16 * 1024;

/// HTTP prober with a shared TLS client configuration.
///
/// Building the root store walks the system trust store, so construct one
/// prober per probe run and reuse it across monitors.
pub struct HttpProber {
    tls: TlsConnector,
}

impl HttpProber {
    pub fn new() -> crate::Result<Self> {
        let mut roots = rustls::RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        for error in &native.errors {
            tracing::warn!("Skipping unreadable system root certificate: {}", error);
        }
        roots.add_parsable_certificates(native.certs);
        if roots.is_empty() {
            tracing::warn!("No usable root certificates; HTTPS checks will fail verification");
        }

        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Self {
            tls: TlsConnector::from(Arc::new(config)),
        })
    }

    /// Execute one check against an HTTP(S) monitor.
    pub async fn check(&self, monitor: &MonitorTarget) -> ProbeOutcome {
        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(monitor.timeout_ms());
        let started = Instant::now();
        let mut timing = TimingMetrics::default();

        let result = self.exchange(monitor, deadline, &mut timing).await;
        timing.total = elapsed_ms(started);

        match result {
            Ok((code, body)) => match validate_response(monitor, code, &body) {
                None => ProbeOutcome {
                    status: CheckStatus::Up,
                    latency_ms: timing.total,
                    timing,
                    error: None,
                },
                Some(error) => ProbeOutcome {
                    status: CheckStatus::Down,
                    latency_ms: timing.total,
                    timing,
                    error: Some(error),
                },
            },
            Err(error) => ProbeOutcome {
                status: CheckStatus::Down,
                latency_ms: timing.total,
                timing,
                error: Some(error),
            },
        }
    }

    /// Run the wire exchange, recording phase timings as they complete.
    /// Returns the parsed status code and decoded body, or an error category.
    async fn exchange(
        &self,
        monitor: &MonitorTarget,
        deadline: tokio::time::Instant,
        timing: &mut TimingMetrics,
    ) -> Result<(u16, String), String> {
        let url = Url::parse(&monitor.target)
            .map_err(|e| format!("Connection failed: invalid URL: {}", e))?;
        let https = match url.scheme() {
            "https" => true,
            "http" => false,
            other => return Err(format!("Connection failed: unsupported scheme {:?}", other)),
        };
        let host = url
            .host_str()
            .ok_or_else(|| "Connection failed: URL has no host".to_string())?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| "Connection failed: URL has no port".to_string())?;

        // Phase 1: DNS.
        let phase = Instant::now();
        let resolved = match tokio::time::timeout_at(
            deadline,
            tokio::net::lookup_host((host.as_str(), port)),
        )
        .await
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

        // Phase 2: TCP connect.
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
        stream.set_nodelay(true).ok();

        // Phase 3: TLS handshake, https only. Timings are exact because we
        // hold the socket through both phases.
        let request = build_request(monitor, &url, https);
        if https {
            let server_name = ServerName::try_from(host.clone())
                .map_err(|e| format!("TLS/SSL error: invalid server name: {}", e))?;
            let phase = Instant::now();
            let tls_stream =
                match tokio::time::timeout_at(deadline, self.tls.connect(server_name, stream))
                    .await
                {
                    Err(_) => {
                        timing.tls_handshake = elapsed_ms(phase);
                        return Err("Request timeout".to_string());
                    }
                    Ok(Err(e)) => {
                        timing.tls_handshake = elapsed_ms(phase);
                        return Err(format!("TLS/SSL error: {}", e));
                    }
                    Ok(Ok(stream)) => stream,
                };
            timing.tls_handshake = elapsed_ms(phase);
            request_response(tls_stream, &request, monitor, deadline, timing).await
        } else {
            request_response(stream, &request, monitor, deadline, timing).await
        }
    }
}

/// Phases 4 and 5: write the request, then time TTFB and body download.
async fn request_response<S: AsyncRead + AsyncWrite + Unpin>(
    mut stream: S,
    request: &[u8],
    monitor: &MonitorTarget,
    deadline: tokio::time::Instant,
    timing: &mut TimingMetrics,
) -> Result<(u16, String), String> {
    let write = async {
        stream.write_all(request).await?;
        stream.flush().await
    };
    match tokio::time::timeout_at(deadline, write).await {
        Err(_) => return Err("Request timeout".to_string()),
        Ok(Err(e)) => return Err(format!("Connection failed: {}", e)),
        Ok(Ok(())) => {}
    }

    let sent = Instant::now();
    let mut raw = Vec::new();
    let mut chunk = vec![0u8; READ_CHUNK];

    let n = match tokio::time::timeout_at(deadline, stream.read(&mut chunk)).await {
        Err(_) => {
            timing.ttfb = elapsed_ms(sent);
            return Err("Request timeout".to_string());
        }
        Ok(Err(e)) => {
            timing.ttfb = elapsed_ms(sent);
            return Err(format!("Connection failed: {}", e));
        }
        Ok(Ok(0)) => {
            timing.ttfb = elapsed_ms(sent);
            return Err("Connection failed: server closed without response".to_string());
        }
        Ok(Ok(n)) => n,
    };
    timing.ttfb = elapsed_ms(sent);
    raw.extend_from_slice(&chunk[..n]);

    let body_phase = Instant::now();
    while !response_complete(&raw, monitor) {
        match tokio::time::timeout_at(deadline, stream.read(&mut chunk)).await {
            Err(_) => {
                timing.content_download = elapsed_ms(body_phase);
                return Err("Request timeout".to_string());
            }
            Ok(Err(e)) => {
                timing.content_download = elapsed_ms(body_phase);
                return Err(format!("Connection failed: {}", e));
            }
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => raw.extend_from_slice(&chunk[..n]),
        }
    }
    timing.content_download = elapsed_ms(body_phase);

    parse_response(&raw)
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

/// Serialize the request. Body is only attached for methods that carry one;
/// configured headers win over the defaults.
fn build_request(monitor: &MonitorTarget, url: &Url, https: bool) -> Vec<u8> {
    let mut path = url.path().to_string();
    if let Some(query) = url.query() {
        path.push('?');
        path.push_str(query);
    }

    let default_port = if https { 443 } else { 80 };
    let host_header = match url.port_or_known_default() {
        Some(port) if port != default_port => {
            format!("{}:{}", url.host_str().unwrap_or_default(), port)
        }
        _ => url.host_str().unwrap_or_default().to_string(),
    };

    let custom = monitor.headers.clone().unwrap_or_default();
    let has_custom = |name: &str| custom.keys().any(|k| k.eq_ignore_ascii_case(name));

    let mut request = format!("{} {} HTTP/1.1\r\n", monitor.method.as_str(), path);
    request.push_str(&format!("Host: {}\r\n", host_header));
    if !has_custom("user-agent") {
        request.push_str(&format!("User-Agent: {}\r\n", USER_AGENT));
    }
    if !has_custom("accept") {
        request.push_str("Accept: */*\r\n");
    }
    request.push_str("Connection: close\r\n");

    let body = monitor
        .body
        .as_deref()
        .filter(|_| monitor.method.allows_body());
    if let Some(body) = body {
        request.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    for (name, value) in &custom {
        request.push_str(&format!("{}: {}\r\n", name, value));
    }
    request.push_str("\r\n");

    let mut bytes = request.into_bytes();
    if let Some(body) = body {
        bytes.extend_from_slice(body.as_bytes());
    }
    bytes
}

/// True once enough bytes have arrived to stop reading. Servers honoring
/// `Connection: close` end the exchange with EOF anyway; this cuts the wait
/// for the ones that do not.
fn response_complete(raw: &[u8], monitor: &MonitorTarget) -> bool {
    let Some(header_end) = find_header_end(raw) else {
        return false;
    };
    let headers = &raw[..header_end];
    let body = &raw[header_end..];

    let code = parse_status_code(headers).unwrap_or(0);
    if monitor.method == crate::config::ProbeMethod::Head || code == 204 || code == 304 {
        return true;
    }
    if header_value(headers, "transfer-encoding")
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false)
    {
        return body.windows(5).rev().any(|w| w == b"0\r\n\r\n");
    }
    if let Some(length) = header_value(headers, "content-length").and_then(|v| v.parse::<usize>().ok())
    {
        return body.len() >= length;
    }
    false
}

fn find_header_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

fn parse_status_code(headers: &[u8]) -> Option<u16> {
    let line = headers.split(|&b| b == b'\r').next()?;
    let line = std::str::from_utf8(line).ok()?;
    line.split_whitespace().nth(1)?.parse().ok()
}

fn header_value(headers: &[u8], name: &str) -> Option<String> {
    let text = String::from_utf8_lossy(headers);
    for line in text.lines().skip(1) {
        if let Some((key, value)) = line.split_once(':') {
            if key.trim().eq_ignore_ascii_case(name) {
                return Some(value.trim().to_string());
            }
        }
    }
    None
}

/// Split a raw HTTP/1.1 response into status code and decoded body text.
fn parse_response(raw: &[u8]) -> Result<(u16, String), String> {
    let header_end =
        find_header_end(raw).ok_or_else(|| "Connection failed: malformed response".to_string())?;
    let headers = &raw[..header_end];
    let code = parse_status_code(headers)
        .ok_or_else(|| "Connection failed: malformed status line".to_string())?;

    let mut body = raw[header_end..].to_vec();
    if header_value(headers, "transfer-encoding")
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false)
    {
        body = decode_chunked(&body);
    } else if let Some(length) =
        header_value(headers, "content-length").and_then(|v| v.parse::<usize>().ok())
    {
        body.truncate(length);
    }

    Ok((code, String::from_utf8_lossy(&body).into_owned()))
}

/// Strip chunked transfer framing. Tolerates a truncated trailer: everything
/// decoded so far is returned.
fn decode_chunked(raw: &[u8]) -> Vec<u8> {
    let mut decoded = Vec::new();
    let mut rest = raw;
    loop {
        let Some(line_end) = rest.windows(2).position(|w| w == b"\r\n") else {
            break;
        };
        let size_line = String::from_utf8_lossy(&rest[..line_end]);
        let size_hex = size_line.split(';').next().unwrap_or("").trim();
        let Ok(size) = usize::from_str_radix(size_hex, 16) else {
            break;
        };
        if size == 0 {
            break;
        }
        let data_start = line_end + 2;
        let data_end = data_start + size;
        if data_end > rest.len() {
            decoded.extend_from_slice(&rest[data_start..]);
            break;
        }
        decoded.extend_from_slice(&rest[data_start..data_end]);
        rest = rest.get(data_end + 2..).unwrap_or(&[]);
    }
    decoded
}

/// Apply the response checks in order; the first failure wins.
fn validate_response(monitor: &MonitorTarget, code: u16, body: &str) -> Option<String> {
    let expected = monitor.expected_codes();
    if !expected.contains(&code) {
        let expected = expected
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        return Some(format!("HTTP {} (expected {})", code, expected));
    }
    if let Some(keyword) = &monitor.response_keyword {
        if !body.contains(keyword.as_str()) {
            return Some(format!("Response missing required keyword: {}", keyword));
        }
    }
    if let Some(keyword) = &monitor.response_forbidden_keyword {
        if body.contains(keyword.as_str()) {
            return Some(format!("Response contains forbidden keyword: {}", keyword));
        }
    }
    None
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
