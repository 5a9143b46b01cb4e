//! Docrelay daemon
//!
//! The relay server process: accepts y-protocol WebSocket connections,
//! synchronizes peers editing the same document, and persists every update
//! to an append-only log.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (WebSocket on 1234, in-memory persistence)
//! docrelayd
//!
//! # With durable persistence
//! docrelayd --db /var/lib/docrelay/updates.db
//!
//! # Restrict browser origins
//! docrelayd --allowed-origin https://app.example --allowed-origin https://staging.example
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use docrelay_core::{Registry, UpdateStore};
use docrelay_storage::{MemoryStore, SqliteStore};
use docrelay_transport::RelayServer;

/// Docrelay - CRDT document synchronization relay
#[derive(Parser, Debug)]
#[command(name = "docrelayd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Bind address
    #[arg(long, env = "DOCRELAY_BIND", default_value = "0.0.0.0")]
    bind: String,

    /// WebSocket port to listen on
    #[arg(long, env = "DOCRELAY_PORT", default_value = "1234")]
    port: u16,

    /// SQLite database path for persistence (default: in-memory only)
    #[arg(long, env = "DOCRELAY_DB")]
    db: Option<PathBuf>,

    /// Allowed browser Origin (repeatable; default: any)
    #[arg(long = "allowed-origin", env = "DOCRELAY_ALLOWED_ORIGINS", value_delimiter = ',')]
    allowed_origins: Vec<String>,

    /// Seconds of awareness silence before a peer is considered gone
    #[arg(long, env = "DOCRELAY_PRESENCE_TIMEOUT", default_value = "30")]
    presence_timeout_secs: u64,

    /// Compact a document's update log once this many updates accumulate
    #[arg(long, env = "DOCRELAY_COMPACT_AFTER", default_value = "512")]
    compact_after: usize,

    /// Port for the Prometheus metrics endpoint (default: disabled)
    #[cfg(feature = "metrics")]
    #[arg(long, env = "DOCRELAY_METRICS_PORT")]
    metrics_port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "DOCRELAY_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .init();

    print_banner();

    let store: Arc<dyn UpdateStore> = if let Some(db_path) = &args.db {
        info!(path = %db_path.display(), "Initializing SQLite persistence");
        match SqliteStore::new(db_path) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                warn!(error = %e, "Failed to open SQLite database, running in-memory only");
                Arc::new(MemoryStore::new())
            }
        }
    } else {
        info!("Running in-memory only (no --db specified)");
        Arc::new(MemoryStore::new())
    };

    let registry = Arc::new(Registry::new(store));

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    info!(
        addr = %addr,
        origins = args.allowed_origins.len(),
        presence_timeout_secs = args.presence_timeout_secs,
        compact_after = args.compact_after,
        "Starting docrelay daemon"
    );

    #[allow(unused_mut)]
    let mut server = RelayServer::new(registry.clone(), addr)
        .with_allowed_origins(args.allowed_origins.clone());

    #[cfg(feature = "metrics")]
    if let Some(metrics_port) = args.metrics_port {
        use docrelay_transport::{Metrics, MetricsServer};

        let metrics = Arc::new(Metrics::new());
        server = server.with_metrics(metrics.clone());

        let metrics_addr: SocketAddr = format!("{}:{}", args.bind, metrics_port).parse()?;
        let metrics_server = MetricsServer::new(metrics.clone(), metrics_addr);
        tokio::spawn(async move {
            if let Err(e) = metrics_server.run().await {
                tracing::error!(error = %e, "Metrics server error");
            }
        });

        // Gauges track the registry, sampled periodically
        let gauge_registry = registry.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(10));
            loop {
                interval.tick().await;
                let stats = gauge_registry.stats();
                metrics.documents_open.set(stats.room_count as i64);
                metrics.presence_entries.set(stats.presence_count as i64);
            }
        });
    }

    tokio::spawn(async move {
        if let Err(e) = server.run().await {
            tracing::error!(error = %e, "Relay server error");
        }
    });

    // Presence sweep: drop awareness entries from peers that went silent
    let presence_timeout = Duration::from_secs(args.presence_timeout_secs);
    let sweep_registry = registry.clone();
    tokio::spawn(async move {
        let sweep_every = (presence_timeout / 2).max(Duration::from_secs(1));
        let mut interval = tokio::time::interval(sweep_every);
        loop {
            interval.tick().await;
            sweep_registry.sweep_presence(presence_timeout);
        }
    });

    // Compaction: fold long update logs into a single snapshot row
    let compact_after = args.compact_after;
    let compact_registry = registry.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            let compacted = compact_registry.compact(compact_after).await;
            if compacted > 0 {
                info!(compacted, "Compacted document logs");
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    let stats = registry.stats();
    info!(
        rooms = stats.room_count,
        connections = stats.connection_count,
        "Shutting down"
    );
    if let Ok(store_stats) = registry.store_stats().await {
        info!(
            documents = store_stats.document_count,
            updates = store_stats.update_count,
            bytes = store_stats.total_size_bytes,
            "Update log at shutdown"
        );
    }

    Ok(())
}

fn print_banner() {
    println!(
        r#"
  docrelayd {}
  CRDT document synchronization relay
"#,
        env!("CARGO_PKG_VERSION")
    );
}
