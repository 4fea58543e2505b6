use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::engine::{CollectionState, PollReport};
use crate::source::MetricsCallback;

/// Prometheus metrics for agent health.
///
/// All metrics use the "statsync" namespace and carry a `cluster` label
/// where they describe one poll driver.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Poll cycles by cluster and outcome (idle/processed/stalled/timeout).
    pub polls_total: CounterVec,
    /// Poll cycle duration.
    pub poll_duration: HistogramVec,
    /// Newest epoch consumed in forward order.
    pub current_epoch: GaugeVec,
    /// Epochs waiting for catch-up.
    pub backlog_depth: GaugeVec,
    /// Backlog epochs recovered by replay.
    pub backlog_recovered: CounterVec,
    /// Backlog epochs dropped without ever becoming complete.
    pub backlog_evicted: CounterVec,
    /// Listing entries that did not match the dump naming grammar.
    pub malformed_identifiers: CounterVec,
    /// Leaves with no storage group parent in the last poll.
    pub unassigned_leaves: GaugeVec,
    /// Metric records emitted by entity kind.
    pub records_emitted: CounterVec,
    /// Export errors by sink.
    pub export_errors: CounterVec,
    /// Source requests by operation and status.
    pub source_requests: CounterVec,
    /// Source request duration by operation.
    pub source_request_duration: HistogramVec,
}

impl HealthMetrics {
    /// Creates and registers all health metrics.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let polls_total = CounterVec::new(
            Opts::new("polls_total", "Total poll cycles by cluster and outcome.")
                .namespace("statsync"),
            &["cluster", "outcome"],
        )?;
        let poll_duration = HistogramVec::new(
            HistogramOpts::new("poll_duration_seconds", "Poll cycle duration by cluster.")
                .namespace("statsync")
                .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 45.0]),
            &["cluster"],
        )?;
        let current_epoch = GaugeVec::new(
            Opts::new(
                "current_epoch",
                "Newest sampling epoch consumed, in unix seconds.",
            )
            .namespace("statsync"),
            &["cluster"],
        )?;
        let backlog_depth = GaugeVec::new(
            Opts::new("backlog_depth", "Incomplete epochs waiting for catch-up.")
                .namespace("statsync"),
            &["cluster"],
        )?;
        let backlog_recovered = CounterVec::new(
            Opts::new(
                "backlog_recovered_total",
                "Total backlog epochs recovered by replay.",
            )
            .namespace("statsync"),
            &["cluster"],
        )?;
        let backlog_evicted = CounterVec::new(
            Opts::new(
                "backlog_evicted_total",
                "Total backlog epochs evicted without recovery.",
            )
            .namespace("statsync"),
            &["cluster"],
        )?;
        let malformed_identifiers = CounterVec::new(
            Opts::new(
                "malformed_identifiers_total",
                "Total listing entries not matching the dump naming grammar.",
            )
            .namespace("statsync"),
            &["cluster"],
        )?;
        let unassigned_leaves = GaugeVec::new(
            Opts::new(
                "unassigned_leaves",
                "Leaves excluded from storage group aggregation in the last poll.",
            )
            .namespace("statsync"),
            &["cluster"],
        )?;
        let records_emitted = CounterVec::new(
            Opts::new(
                "records_emitted_total",
                "Total metric records emitted by entity kind.",
            )
            .namespace("statsync"),
            &["cluster", "kind"],
        )?;
        let export_errors = CounterVec::new(
            Opts::new("export_errors_total", "Total batch export errors by sink.")
                .namespace("statsync"),
            &["sink"],
        )?;
        let source_requests = CounterVec::new(
            Opts::new(
                "source_requests_total",
                "Total dump source requests by operation and status.",
            )
            .namespace("statsync"),
            &["operation", "status"],
        )?;
        let source_request_duration = HistogramVec::new(
            HistogramOpts::new(
                "source_request_duration_seconds",
                "Dump source request duration by operation.",
            )
            .namespace("statsync")
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["operation"],
        )?;

        registry.register(Box::new(polls_total.clone()))?;
        registry.register(Box::new(poll_duration.clone()))?;
        registry.register(Box::new(current_epoch.clone()))?;
        registry.register(Box::new(backlog_depth.clone()))?;
        registry.register(Box::new(backlog_recovered.clone()))?;
        registry.register(Box::new(backlog_evicted.clone()))?;
        registry.register(Box::new(malformed_identifiers.clone()))?;
        registry.register(Box::new(unassigned_leaves.clone()))?;
        registry.register(Box::new(records_emitted.clone()))?;
        registry.register(Box::new(export_errors.clone()))?;
        registry.register(Box::new(source_requests.clone()))?;
        registry.register(Box::new(source_request_duration.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            polls_total,
            poll_duration,
            current_epoch,
            backlog_depth,
            backlog_recovered,
            backlog_evicted,
            malformed_identifiers,
            unassigned_leaves,
            records_emitted,
            export_errors,
            source_requests,
            source_request_duration,
        })
    }

    /// Records the result of one poll and the state it left behind.
    pub fn record_poll(&self, cluster: &str, report: &PollReport, state: &CollectionState) {
        self.polls_total
            .with_label_values(&[cluster, report.outcome.as_str()])
            .inc();
        self.poll_duration
            .with_label_values(&[cluster])
            .observe(report.elapsed.as_secs_f64());
        self.current_epoch
            .with_label_values(&[cluster])
            .set(state.current_epoch() as f64);
        self.backlog_depth
            .with_label_values(&[cluster])
            .set(state.backlog().len() as f64);
        self.unassigned_leaves
            .with_label_values(&[cluster])
            .set(report.unassigned as f64);

        if report.recovered.is_some() {
            self.backlog_recovered.with_label_values(&[cluster]).inc();
        }
        let evicted = report.evicted.len() as u64 + report.overflowed;
        if evicted > 0 {
            self.backlog_evicted
                .with_label_values(&[cluster])
                .inc_by(evicted as f64);
        }
        if report.malformed > 0 {
            self.malformed_identifiers
                .with_label_values(&[cluster])
                .inc_by(report.malformed as f64);
        }

        for batch in &report.batches {
            for (kind, count) in batch.counts() {
                self.records_emitted
                    .with_label_values(&[cluster, kind.as_str()])
                    .inc_by(count as f64);
            }
        }
    }

    /// Records a poll abandoned after exceeding the cycle timeout.
    pub fn record_timeout(&self, cluster: &str, elapsed: Duration) {
        self.polls_total
            .with_label_values(&[cluster, "timeout"])
            .inc();
        self.poll_duration
            .with_label_values(&[cluster])
            .observe(elapsed.as_secs_f64());
    }

    /// Builds a source metrics callback feeding the request counters.
    pub fn source_callback(&self) -> MetricsCallback {
        let requests = self.source_requests.clone();
        let duration = self.source_request_duration.clone();
        Box::new(move |operation: &str, status: &str, elapsed: Duration| {
            requests.with_label_values(&[operation, status]).inc();
            duration
                .with_label_values(&[operation])
                .observe(elapsed.as_secs_f64());
        })
    }

    /// Renders all metrics in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode_registry(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
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

fn encode_registry(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode_registry(&state.registry) {
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
