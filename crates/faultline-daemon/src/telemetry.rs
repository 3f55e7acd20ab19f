use std::collections::HashMap;
use std::fmt::Write as _;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("metrics server failed: {0}")]
    Server(std::io::Error),
}

#[derive(Debug, Default)]
struct TelemetryState {
    /// Keyed by `<layer>.<v2|v3>` scope.
    resources_served_total: HashMap<String, u64>,
    stream_errors_total: HashMap<String, u64>,
    active_streams: HashMap<String, i64>,
    active_monitoring_routines: u64,
    terminations_total: u64,
}

#[derive(Debug, Clone, Default)]
pub struct Telemetry {
    state: Arc<Mutex<TelemetryState>>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_resources_served(&self, scope: &str, count: u64) {
        let mut guard = self.state.lock();
        let entry = guard
            .resources_served_total
            .entry(scope.to_string())
            .or_insert(0);
        *entry = entry.saturating_add(count);
    }

    pub fn record_stream_error(&self, scope: &str) {
        let mut guard = self.state.lock();
        let entry = guard
            .stream_errors_total
            .entry(scope.to_string())
            .or_insert(0);
        *entry = entry.saturating_add(1);
    }

    pub fn record_termination(&self) {
        let mut guard = self.state.lock();
        guard.terminations_total = guard.terminations_total.saturating_add(1);
    }

    fn stream_opened(&self, scope: &str) {
        let mut guard = self.state.lock();
        *guard.active_streams.entry(scope.to_string()).or_insert(0) += 1;
    }

    fn stream_closed(&self, scope: &str) {
        let mut guard = self.state.lock();
        *guard.active_streams.entry(scope.to_string()).or_insert(0) -= 1;
    }

    fn routine_started(&self) {
        self.state.lock().active_monitoring_routines += 1;
    }

    fn routine_stopped(&self) {
        let mut guard = self.state.lock();
        guard.active_monitoring_routines = guard.active_monitoring_routines.saturating_sub(1);
    }

    pub fn resources_served(&self, scope: &str) -> u64 {
        self.state
            .lock()
            .resources_served_total
            .get(scope)
            .copied()
            .unwrap_or(0)
    }

    pub fn stream_errors(&self, scope: &str) -> u64 {
        self.state
            .lock()
            .stream_errors_total
            .get(scope)
            .copied()
            .unwrap_or(0)
    }

    pub fn active_streams(&self, scope: &str) -> i64 {
        self.state
            .lock()
            .active_streams
            .get(scope)
            .copied()
            .unwrap_or(0)
    }

    pub fn active_monitoring_routines(&self) -> u64 {
        self.state.lock().active_monitoring_routines
    }

    pub fn terminations(&self) -> u64 {
        self.state.lock().terminations_total
    }

    pub fn render(&self) -> String {
        let guard = self.state.lock();
        let mut out = String::new();
        out.push_str("# TYPE runtime_resources_served_total counter\n");
        for (scope, value) in &guard.resources_served_total {
            let _ = writeln!(
                out,
                "runtime_resources_served_total{{scope=\"{}\"}} {}",
                scope, value
            );
        }
        out.push_str("# TYPE runtime_stream_errors_total counter\n");
        for (scope, value) in &guard.stream_errors_total {
            let _ = writeln!(
                out,
                "runtime_stream_errors_total{{scope=\"{}\"}} {}",
                scope, value
            );
        }
        out.push_str("# TYPE runtime_active_streams gauge\n");
        for (scope, value) in &guard.active_streams {
            let _ = writeln!(
                out,
                "runtime_active_streams{{scope=\"{}\"}} {}",
                scope, value
            );
        }
        out.push_str("# TYPE active_monitoring_routines gauge\n");
        let _ = writeln!(
            out,
            "active_monitoring_routines {}",
            guard.active_monitoring_routines
        );
        out.push_str("# TYPE terminations_total counter\n");
        let _ = writeln!(out, "terminations_total {}", guard.terminations_total);
        out
    }

    /// Serves the Prometheus text exposition on `addr`. Scrapes are the only
    /// supported request; anything but `GET /metrics` gets an empty 404.
    pub async fn spawn_metrics_server(
        self: Arc<Self>,
        addr: SocketAddr,
    ) -> Result<tokio::task::JoinHandle<()>, TelemetryError> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(TelemetryError::Server)?;
        Ok(tokio::spawn(async move {
            loop {
                let (socket, peer) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                    Err(err) => {
                        tracing::error!(error = %err, "metrics listener failed");
                        return;
                    }
                };
                let telemetry = Arc::clone(&self);
                tokio::spawn(async move {
                    if let Err(err) = telemetry.serve_scrape(socket).await {
                        tracing::debug!(peer = %peer, error = %err, "metrics scrape failed");
                    }
                });
            }
        }))
    }

    async fn serve_scrape(&self, mut socket: tokio::net::TcpStream) -> std::io::Result<()> {
        let mut request = [0_u8; 1024];
        let n = socket.read(&mut request).await?;
        let head = String::from_utf8_lossy(&request[..n]);
        let is_scrape = head
            .lines()
            .next()
            .is_some_and(|line| line.starts_with("GET /metrics"));

        let reply = if is_scrape {
            let body = self.render();
            format!(
                "HTTP/1.1 200 OK\r\ncontent-type: text/plain; version=0.0.4\r\ncontent-length: {}\r\n\r\n{body}",
                body.len()
            )
        } else {
            "HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\n\r\n".to_string()
        };
        socket.write_all(reply.as_bytes()).await
    }
}

/// RAII handle for the active-monitoring-routines gauge. Holding one inside
/// the spawned task guarantees the decrement on every exit path, including
/// cancellation.
#[derive(Debug)]
pub struct RoutineGuard {
    telemetry: Telemetry,
}

impl RoutineGuard {
    pub fn new(telemetry: &Telemetry) -> Self {
        telemetry.routine_started();
        Self {
            telemetry: telemetry.clone(),
        }
    }
}

impl Drop for RoutineGuard {
    fn drop(&mut self) {
        self.telemetry.routine_stopped();
    }
}

/// RAII handle for the per-protocol active-streams gauge.
#[derive(Debug)]
pub struct StreamGuard {
    telemetry: Telemetry,
    scope: String,
}

impl StreamGuard {
    pub fn new(telemetry: &Telemetry, scope: &str) -> Self {
        telemetry.stream_opened(scope);
        Self {
            telemetry: telemetry.clone(),
            scope: scope.to_string(),
        }
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.telemetry.stream_closed(&self.scope);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_per_scope() {
        let telemetry = Telemetry::new();
        telemetry.record_resources_served("tests.v3", 1);
        telemetry.record_resources_served("tests.v3", 2);
        telemetry.record_resources_served("tests.v2", 1);
        telemetry.record_stream_error("tests.v3");

        assert_eq!(telemetry.resources_served("tests.v3"), 3);
        assert_eq!(telemetry.resources_served("tests.v2"), 1);
        assert_eq!(telemetry.stream_errors("tests.v3"), 1);
        assert_eq!(telemetry.stream_errors("tests.v2"), 0);
    }

    #[test]
    fn guards_decrement_on_drop() {
        let telemetry = Telemetry::new();
        {
            let _a = RoutineGuard::new(&telemetry);
            let _b = RoutineGuard::new(&telemetry);
            assert_eq!(telemetry.active_monitoring_routines(), 2);
        }
        assert_eq!(telemetry.active_monitoring_routines(), 0);

        {
            let _s = StreamGuard::new(&telemetry, "tests.v3");
            assert_eq!(telemetry.active_streams("tests.v3"), 1);
        }
        assert_eq!(telemetry.active_streams("tests.v3"), 0);
    }

    #[test]
    fn render_exposes_all_series() {
        let telemetry = Telemetry::new();
        telemetry.record_resources_served("tests.v3", 4);
        telemetry.record_termination();

        let rendered = telemetry.render();
        assert!(rendered.contains("runtime_resources_served_total{scope=\"tests.v3\"} 4"));
        assert!(rendered.contains("terminations_total 1"));
        assert!(rendered.contains("active_monitoring_routines 0"));
    }
}
