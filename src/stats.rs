// Session counters exposed over a small HTTP endpoint in Prometheus text
// format, plus a JSON snapshot for ad-hoc inspection.

use anyhow::{Context, Result};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{error, info};

/// Lock-free counters shared by every session. Synthetic service binds count
/// like wire binds.
#[derive(Debug, Default)]
pub struct Stats {
    connections: AtomicU64,
    binds: AtomicU64,
    searches: AtomicU64,
    unbinds: AtomicU64,
}

/// Point-in-time copy of the counters, serialized as the /stats body.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub connections: u64,
    pub binds: u64,
    pub searches: u64,
    pub unbinds: u64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn count_connection(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn count_bind(&self) {
        self.binds.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn count_search(&self) {
        self.searches.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn count_unbind(&self) {
        self.unbinds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections: self.connections.load(Ordering::Relaxed),
            binds: self.binds.load(Ordering::Relaxed),
            searches: self.searches.load(Ordering::Relaxed),
            unbinds: self.unbinds.load(Ordering::Relaxed),
        }
    }

    /// Prometheus exposition format.
    pub fn render(&self) -> String {
        let snap = self.snapshot();
        let mut out = String::new();
        out.push_str(
            "# HELP ldap_front_connections_total Total number of client connections accepted.\n",
        );
        out.push_str("# TYPE ldap_front_connections_total counter\n");
        out.push_str(&format!(
            "ldap_front_connections_total {}\n",
            snap.connections
        ));

        out.push_str("# HELP ldap_front_requests_total Total LDAP requests by operation.\n");
        out.push_str("# TYPE ldap_front_requests_total counter\n");
        for (op, val) in [
            ("bind", snap.binds),
            ("search", snap.searches),
            ("unbind", snap.unbinds),
        ] {
            out.push_str(&format!(
                "ldap_front_requests_total{{op=\"{}\"}} {}\n",
                op, val
            ));
        }
        out
    }
}

/// Path from the first HTTP request line ("GET /health HTTP/1.1" -> "/health").
fn request_path(first_line: &str) -> &str {
    let line = first_line.trim();
    let mut parts = line.split_ascii_whitespace();
    let _method = parts.next();
    let path = parts.next().unwrap_or("");
    if path.starts_with('/') {
        path
    } else {
        ""
    }
}

/// Minimal HTTP server for GET /metrics (Prometheus), GET /health (liveness)
/// and GET /stats (JSON snapshot).
pub async fn run_stats_server(addr: &str, stats: Arc<Stats>) -> Result<()> {
    let socket_addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("Invalid stats listen address: {}", addr))?;

    let listener = TcpListener::bind(&socket_addr)
        .await
        .with_context(|| format!("Failed to bind stats server to {}", socket_addr))?;

    info!(
        "Stats server listening on http://{} (GET /metrics, /health, /stats)",
        socket_addr
    );

    loop {
        let (mut stream, _peer) = match listener.accept().await {
            Ok(accept) => accept,
            Err(e) => {
                error!("Stats accept error: {}", e);
                continue;
            }
        };

        let stats = Arc::clone(&stats);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            let mut total = 0usize;
            loop {
                match stream.read(&mut buf[total..]).await {
                    Ok(0) => break,
                    Ok(n) => {
                        total += n;
                        if total >= 4 && buf[..total].windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                        if total >= buf.len() {
                            break;
                        }
                    }
                    Err(_) => return,
                }
            }

            let request = String::from_utf8_lossy(&buf[..total]);
            let path = request.lines().next().map(request_path).unwrap_or("");

            let (status, body, content_type) = match path {
                "/health" => ("200 OK", "ok".to_string(), "text/plain; charset=utf-8"),
                "/metrics" => ("200 OK", stats.render(), "text/plain; charset=utf-8"),
                "/stats" => {
                    let body = serde_json::to_string(&stats.snapshot())
                        .unwrap_or_else(|_| r#"{"error":"serialize"}"#.to_string());
                    ("200 OK", body, "application/json")
                }
                _ => (
                    "404 Not Found",
                    "Not found. Supported: GET /metrics, GET /health, GET /stats.\n".to_string(),
                    "text/plain; charset=utf-8",
                ),
            };
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: {}\r\nConnection: close\r\nContent-Length: {}\r\n\r\n{}",
                status,
                content_type,
                body.len(),
                body
            );

            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_path() {
        assert_eq!(request_path("GET /health HTTP/1.1"), "/health");
        assert_eq!(request_path("GET /metrics HTTP/1.1"), "/metrics");
        assert_eq!(request_path(""), "");
        assert_eq!(request_path("GET  HTTP/1.1"), "");
    }

    #[test]
    fn test_counters_accumulate() {
        let stats = Stats::new();
        stats.count_connection();
        stats.count_bind();
        stats.count_bind();
        stats.count_search();
        let snap = stats.snapshot();
        assert_eq!(snap.connections, 1);
        assert_eq!(snap.binds, 2);
        assert_eq!(snap.searches, 1);
        assert_eq!(snap.unbinds, 0);
    }

    #[test]
    fn test_render_prometheus_text() {
        let stats = Stats::new();
        stats.count_connection();
        stats.count_search();
        let out = stats.render();
        assert!(out.contains("ldap_front_connections_total 1"));
        assert!(out.contains("ldap_front_requests_total{op=\"search\"} 1"));
        assert!(out.contains("ldap_front_requests_total{op=\"bind\"} 0"));
    }

    #[test]
    fn test_snapshot_serializes_to_json() {
        let stats = Stats::new();
        stats.count_unbind();
        let json = serde_json::to_string(&stats.snapshot()).unwrap();
        assert!(json.contains("\"unbinds\":1"));
        assert!(json.contains("\"connections\":0"));
    }
}
