use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tracing::info;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize Prometheus metrics exporter.
/// Returns a handle that can be used to render metrics for scraping.
pub fn init_metrics() -> PrometheusHandle {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Full("http_request_duration_seconds".to_string()),
            &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
        )
        .expect("failed to set buckets for http_request_duration_seconds")
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Background task to update process metrics.
/// Updates uptime and memory usage metrics every 5 seconds.
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

/// Zero out every counter/gauge this backend emits so they appear in
/// Prometheus queries immediately on startup, before any packet arrives.
pub fn initialize_ingest_metrics() {
    metrics::counter!("ingest.parse_errors").absolute(0);
    metrics::counter!("hot_cache.flush_count").absolute(0);
    metrics::gauge!("hot_cache.batch_size_ema").set(0.0);
    metrics::counter!("broadcast.dropped_producer_side").absolute(0);
    metrics::counter!("broadcast.dropped_per_client").absolute(0);
    metrics::gauge!("broadcast.active_groups").set(0.0);
}

/// Start a standalone metrics server on the specified port.
/// Used by the `serve-metrics` subcommand to expose metrics independently
/// of the query web server.
pub async fn start_metrics_server(port: u16) {
    let handle = init_metrics();
    METRICS_HANDLE.set(handle).expect("metrics handle already initialized");
    initialize_ingest_metrics();

    tokio::spawn(process_metrics_task());

    let app = Router::new().route(
        "/metrics",
        get(|| async {
            let handle = METRICS_HANDLE.get().expect("metrics handle not initialized");
            handle.render()
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting metrics server on http://{}/metrics", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.expect("failed to bind metrics server");
    axum::serve(listener, app).await.expect("metrics server failed");
}
