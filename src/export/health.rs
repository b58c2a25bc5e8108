use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::sink::report::Report;
use crate::tracer::event::CounterSnapshot;
use crate::tracer::stats::DropReason;

const NAMESPACE: &str = "blkwatch";

/// Prometheus metrics for the monitor itself.
///
/// Window counters are reset by every report; the lifetime totals here are
/// never reset.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Records delivered to the aggregator.
    pub records_received: Counter,
    /// Agent-side drops by reason.
    pub records_dropped: CounterVec,
    /// Ring-buffer samples that failed to parse.
    pub parse_errors: CounterVec,
    /// Empty ring-buffer samples.
    pub ringbuf_overflows: Counter,
    /// Window reports written.
    pub reports_emitted: Counter,
    /// Lifetime completions, summed from every report.
    pub completions: Counter,
    /// Lifetime dispatch samples, summed from every report.
    pub issue_samples: Counter,
    /// Lifetime bytes, summed from every report.
    pub bytes: Counter,
    /// Utilization of the last closed window, in percent.
    pub last_utilization: Gauge,
    /// Average queue depth of the last window that had samples.
    pub last_queue_depth: Gauge,
    /// Ring-buffer capacity in bytes.
    pub ringbuf_capacity_bytes: Gauge,
    /// Programs attached by type (kprobe/tracepoint).
    pub programs_attached: GaugeVec,
    /// Length of the closed windows (4-10s buckets).
    pub window_duration: Histogram,
}

impl HealthMetrics {
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let records_received = Counter::with_opts(
            Opts::new(
                "records_received_total",
                "Total request records delivered to the aggregator.",
            )
            .namespace(NAMESPACE),
        )?;
        let records_dropped = CounterVec::new(
            Opts::new(
                "records_dropped_total",
                "Total request events dropped by the agent, by reason.",
            )
            .namespace(NAMESPACE),
            &["reason"],
        )?;
        let parse_errors = CounterVec::new(
            Opts::new(
                "parse_errors_total",
                "Total ring buffer samples that failed to parse.",
            )
            .namespace(NAMESPACE),
            &["error_type"],
        )?;
        let ringbuf_overflows = Counter::with_opts(
            Opts::new(
                "ringbuf_overflows_total",
                "Total empty ring buffer samples.",
            )
            .namespace(NAMESPACE),
        )?;
        let reports_emitted = Counter::with_opts(
            Opts::new("reports_emitted_total", "Total window reports written.")
                .namespace(NAMESPACE),
        )?;
        let completions = Counter::with_opts(
            Opts::new(
                "completions_total",
                "Total request completions across all windows.",
            )
            .namespace(NAMESPACE),
        )?;
        let issue_samples = Counter::with_opts(
            Opts::new(
                "issue_samples_total",
                "Total queue depth samples across all windows.",
            )
            .namespace(NAMESPACE),
        )?;
        let bytes = Counter::with_opts(
            Opts::new("bytes_total", "Total bytes across all closed windows.")
                .namespace(NAMESPACE),
        )?;
        let last_utilization = Gauge::with_opts(
            Opts::new(
                "utilization_percent",
                "Disk utilization of the last closed window.",
            )
            .namespace(NAMESPACE),
        )?;
        let last_queue_depth = Gauge::with_opts(
            Opts::new(
                "queue_depth_average",
                "Average queue depth of the last window with samples.",
            )
            .namespace(NAMESPACE),
        )?;
        let ringbuf_capacity_bytes = Gauge::with_opts(
            Opts::new(
                "ringbuf_capacity_bytes",
                "Total ring buffer capacity in bytes.",
            )
            .namespace(NAMESPACE),
        )?;
        let programs_attached = GaugeVec::new(
            Opts::new(
                "programs_attached",
                "Number of successfully attached programs by type.",
            )
            .namespace(NAMESPACE),
            &["type"],
        )?;
        let window_duration = Histogram::with_opts(
            HistogramOpts::new(
                "window_duration_seconds",
                "Observed length of closed windows.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![4.0, 5.0, 5.5, 6.0, 8.0, 10.0]),
        )?;

        registry.register(Box::new(records_received.clone()))?;
        registry.register(Box::new(records_dropped.clone()))?;
        registry.register(Box::new(parse_errors.clone()))?;
        registry.register(Box::new(ringbuf_overflows.clone()))?;
        registry.register(Box::new(reports_emitted.clone()))?;
        registry.register(Box::new(completions.clone()))?;
        registry.register(Box::new(issue_samples.clone()))?;
        registry.register(Box::new(bytes.clone()))?;
        registry.register(Box::new(last_utilization.clone()))?;
        registry.register(Box::new(last_queue_depth.clone()))?;
        registry.register(Box::new(ringbuf_capacity_bytes.clone()))?;
        registry.register(Box::new(programs_attached.clone()))?;
        registry.register(Box::new(window_duration.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            records_received,
            records_dropped,
            parse_errors,
            ringbuf_overflows,
            reports_emitted,
            completions,
            issue_samples,
            bytes,
            last_utilization,
            last_queue_depth,
            ringbuf_capacity_bytes,
            programs_attached,
            window_duration,
        })
    }

    /// Fold an emitted report into the lifetime totals.
    pub fn observe_report(&self, report: &Report, counters: &CounterSnapshot) {
        self.reports_emitted.inc();
        self.completions.inc_by(f64::from(counters.completions));
        self.issue_samples
            .inc_by(f64::from(counters.issue.event_count));
        self.bytes.inc_by(report.bytes as f64);
        self.last_utilization.set(report.utilization_percent);
        if let Some(depth) = report.average_queue_depth {
            self.last_queue_depth.set(depth);
        }
        self.window_duration
            .observe(report.elapsed_ns as f64 / 1_000_000_000.0);
    }

    /// Add a drained drop snapshot to the per-reason counters.
    pub fn observe_drops(&self, drops: &[(DropReason, u64)]) {
        for (reason, count) in drops {
            self.records_dropped
                .with_label_values(&[reason.as_str()])
                .inc_by(*count as f64);
        }
    }

    /// Prometheus text exposition of the registry.
    pub fn render(&self) -> Result<String> {
        encode(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // ":port" shorthand binds all interfaces.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

fn encode(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracer::event::IssueSample;

    #[test]
    fn test_observe_report_accumulates_lifetime_totals() {
        let metrics = HealthMetrics::new(":0").unwrap();
        let counters = CounterSnapshot {
            completions: 10,
            issue: IssueSample {
                queue_depth_sum: 40,
                event_count: 4,
            },
        };
        let report = Report {
            bytes: 4096,
            utilization_percent: 12.5,
            completions: 10,
            average_queue_depth: Some(10.0),
            elapsed_ns: 5_000_000_000,
        };

        metrics.observe_report(&report, &counters);
        metrics.observe_report(&report, &counters);

        assert_eq!(metrics.reports_emitted.get(), 2.0);
        assert_eq!(metrics.completions.get(), 20.0);
        assert_eq!(metrics.issue_samples.get(), 8.0);
        assert_eq!(metrics.bytes.get(), 8192.0);
        assert_eq!(metrics.last_utilization.get(), 12.5);
        assert_eq!(metrics.last_queue_depth.get(), 10.0);
    }

    #[test]
    fn test_render_includes_namespace_and_reasons() {
        let metrics = HealthMetrics::new(":0").unwrap();
        metrics.observe_drops(&[(DropReason::ChannelFull, 3), (DropReason::TableFull, 1)]);
        metrics.records_received.inc();

        let text = metrics.render().unwrap();
        assert!(text.contains("blkwatch_records_received_total 1"));
        assert!(text.contains("blkwatch_records_dropped_total{reason=\"channel_full\"} 3"));
        assert!(text.contains("blkwatch_records_dropped_total{reason=\"table_full\"} 1"));
    }

    #[tokio::test]
    async fn test_server_start_and_stop() {
        let metrics = HealthMetrics::new("127.0.0.1:0").unwrap();
        metrics.start().await.unwrap();
        metrics.stop().await.unwrap();
        assert!(metrics.shutdown.lock().is_none());
    }
}
