//! Prometheus metrics for the relay
//!
//! Exposed in Prometheus text format via a small HTTP endpoint.

use prometheus::{
    Encoder, IntCounter, IntGauge, Registry as MetricsRegistry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{error, info};

/// Relay metrics collector
#[derive(Clone)]
pub struct Metrics {
    registry: MetricsRegistry,

    pub connections_total: IntCounter,
    pub connections_active: IntGauge,
    pub documents_open: IntGauge,
    pub presence_entries: IntGauge,
    pub frames_received: IntCounter,
    pub frames_forwarded: IntCounter,
    pub bytes_received: IntCounter,
    pub bytes_sent: IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = MetricsRegistry::new();

        let connections_total = IntCounter::new(
            "docrelay_connections_total", "Total number of websocket connections"
        ).unwrap();

        let connections_active = IntGauge::new(
            "docrelay_connections_active", "Number of active websocket connections"
        ).unwrap();

        let documents_open = IntGauge::new(
            "docrelay_documents_open", "Number of documents open in memory"
        ).unwrap();

        let presence_entries = IntGauge::new(
            "docrelay_presence_entries", "Number of live awareness entries"
        ).unwrap();

        let frames_received = IntCounter::new(
            "docrelay_frames_received_total", "Total frames received from peers"
        ).unwrap();

        let frames_forwarded = IntCounter::new(
            "docrelay_frames_forwarded_total", "Total frames forwarded to peers"
        ).unwrap();

        let bytes_received = IntCounter::new(
            "docrelay_bytes_received_total", "Total payload bytes received"
        ).unwrap();

        let bytes_sent = IntCounter::new(
            "docrelay_bytes_sent_total", "Total payload bytes forwarded"
        ).unwrap();

        registry.register(Box::new(connections_total.clone())).unwrap();
        registry.register(Box::new(connections_active.clone())).unwrap();
        registry.register(Box::new(documents_open.clone())).unwrap();
        registry.register(Box::new(presence_entries.clone())).unwrap();
        registry.register(Box::new(frames_received.clone())).unwrap();
        registry.register(Box::new(frames_forwarded.clone())).unwrap();
        registry.register(Box::new(bytes_received.clone())).unwrap();
        registry.register(Box::new(bytes_sent.clone())).unwrap();

        Self {
            registry,
            connections_total,
            connections_active,
            documents_open,
            presence_entries,
            frames_received,
            frames_forwarded,
            bytes_received,
            bytes_sent,
        }
    }

    pub fn record_connection(&self) {
        self.connections_total.inc();
        self.connections_active.inc();
    }

    pub fn record_disconnection(&self) {
        self.connections_active.dec();
    }

    pub fn record_frame_received(&self, bytes: usize) {
        self.frames_received.inc();
        self.bytes_received.inc_by(bytes as u64);
    }

    pub fn record_frame_forwarded(&self, bytes: usize) {
        self.frames_forwarded.inc();
        self.bytes_sent.inc_by(bytes as u64);
    }

    /// Export metrics in Prometheus text format
    pub fn export(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// HTTP server for the metrics endpoint
pub struct MetricsServer {
    metrics: Arc<Metrics>,
    addr: SocketAddr,
}

impl MetricsServer {
    pub fn new(metrics: Arc<Metrics>, addr: SocketAddr) -> Self {
        Self { metrics, addr }
    }

    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "Metrics server listening on http://{}/metrics", self.addr);

        loop {
            match listener.accept().await {
                Ok((mut stream, _)) => {
                    let metrics = self.metrics.clone();

                    tokio::spawn(async move {
                        let mut buf = [0u8; 1024];
                        if let Ok(n) = stream.read(&mut buf).await {
                            if n > 0 {
                                let request = String::from_utf8_lossy(&buf[..n]);

                                if request.starts_with("GET /metrics") || request.starts_with("GET / ") {
                                    let body = metrics.export();
                                    let response = format!(
                                        "HTTP/1.1 200 OK\r\n\
                                         Content-Type: text/plain; version=0.0.4; charset=utf-8\r\n\
                                         Content-Length: {}\r\n\
                                         \r\n\
                                         {}",
                                        body.len(),
                                        body
                                    );
                                    let _ = stream.write_all(response.as_bytes()).await;
                                } else if request.starts_with("GET /health") {
                                    let response = "HTTP/1.1 200 OK\r\n\
                                                   Content-Type: text/plain\r\n\
                                                   Content-Length: 2\r\n\
                                                   \r\n\
                                                   OK";
                                    let _ = stream.write_all(response.as_bytes()).await;
                                } else {
                                    let response = "HTTP/1.1 404 Not Found\r\n\
                                                   Content-Length: 0\r\n\
                                                   \r\n";
                                    let _ = stream.write_all(response.as_bytes()).await;
                                }
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept metrics connection");
                }
            }
        }
    }
}
