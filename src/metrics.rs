//! Process and domain metrics (C10, ambient): a Prometheus exporter plus
//! background process gauges, following the corpus's `init_metrics` /
//! `process_metrics_task` shape. Not named in §2's component table — the
//! spec's scope excludes observability layers as a *feature*, but the
//! corpus always carries a metrics exporter, so this does too.

use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initializes the Prometheus exporter. Idempotent-by-construction: call
/// once at process startup and keep the returned handle only if a
/// caller needs to render it outside the standalone metrics server.
pub fn init_metrics() -> PrometheusHandle {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Full("scan_bus_publish_latency_seconds".to_string()),
            &[0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0],
        )
        .expect("failed to set buckets for scan_bus_publish_latency_seconds")
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Background task updating process-wide gauges (uptime, RSS), the same
/// ambient metric set the corpus keeps regardless of domain.
pub async fn process_metrics_task() {
    let start_time = Instant::now();

    loop {
        let uptime_seconds = start_time.elapsed().as_secs() as f64;
        metrics::gauge!("process.uptime.seconds").set(uptime_seconds);
        metrics::gauge!("process.is_up").set(1.0);

        #[cfg(target_os = "linux")]
        {
            if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
                for line in status.lines() {
                    if line.starts_with("VmRSS:") {
                        if let Some(kb_str) = line.split_whitespace().nth(1)
                            && let Ok(kb) = kb_str.parse::<f64>()
                        {
                            metrics::gauge!("process.memory.bytes").set(kb * 1024.0);
                        }
                        break;
                    }
                }
            }
        }

        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}

/// Zeroes every scan-domain metric so they appear in Prometheus queries
/// before the first event, mirroring the corpus's `initialize_*_metrics`
/// convention.
pub fn initialize_scan_metrics() {
    metrics::counter!("scan_subtiles_sampled_total", "source" => "real").absolute(0);
    metrics::counter!("scan_subtiles_sampled_total", "source" => "synthetic_fallback").absolute(0);
    metrics::counter!("scan_subtiles_failed_total").absolute(0);
    metrics::counter!("scan_cache_hits_total").absolute(0);
    metrics::counter!("scan_cache_misses_total").absolute(0);
    metrics::gauge!("scan_active_sessions").set(0.0);
    metrics::counter!("scan_sessions_dropped_slow_total").absolute(0);
    metrics::counter!("scan_snapshot_regenerations_total").absolute(0);
    metrics::gauge!("scan_tasks_running").set(0.0);
}

/// Runs a standalone metrics HTTP server exposing `/metrics` for
/// Prometheus scraping, for deployments that split it from the main
/// viewer-facing server.
pub async fn start_metrics_server(port: u16) {
    let handle = init_metrics();
    METRICS_HANDLE.set(handle).expect("metrics handle already initialized");
    initialize_scan_metrics();

    tokio::spawn(process_metrics_task());

    let app = Router::new().route(
        "/metrics",
        get(|| async {
            let handle = METRICS_HANDLE.get().expect("metrics handle not initialized");
            handle.render()
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("starting metrics server on http://{addr}/metrics");

    let listener = tokio::net::TcpListener::bind(addr).await.expect("failed to bind metrics server");
    axum::serve(listener, app).await.expect("metrics server failed");
}

/// Returns the Prometheus render handle for embedding `/metrics` into
/// the main viewer-facing router instead of a standalone server.
pub fn metrics_handle() -> &'static PrometheusHandle {
    METRICS_HANDLE.get_or_init(|| {
        let handle = init_metrics();
        initialize_scan_metrics();
        handle
    })
}
