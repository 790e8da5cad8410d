//! ---
//! luo_section: "03-persistence-logging"
//! luo_subsection: "module"
//! luo_type: "source"
//! luo_scope: "code"
//! luo_description: "Metrics collection and export utilities."
//! luo_version: "v0.0.0-prealpha"
//! luo_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across services.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Spawn an HTTP server that exposes the registry at `/metrics`.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new().route(
        "/metrics",
        get({
            let registry = registry.clone();
            move || metrics_handler(registry.clone())
        }),
    );

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    std_listener
        .set_nonblocking(true)
        .with_context(|| "failed to configure metrics listener as non-blocking")?;
    let listener = TcpListener::from_std(std_listener)
        .with_context(|| "failed to convert std listener into tokio listener")?;
    let addr = listener
        .local_addr()
        .with_context(|| "failed to read metrics listener address")?;

    info!(address = %addr, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let service = app.into_make_service();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, service)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

/// Prometheus scrape endpoint.
async fn metrics_handler(registry: SharedRegistry) -> Response {
    let families = registry.gather();
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&families) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(prometheus::TEXT_FORMAT),
            )],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                String::from("metrics encoding error"),
            )
                .into_response()
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Return the bound address for convenience.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

/// Metrics recorded by the daemon process itself.
#[derive(Clone)]
pub struct DaemonMetrics {
    registry: SharedRegistry,
    starts_total: IntCounter,
    config_load_seconds: Histogram,
}

impl DaemonMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let starts_total = IntCounter::with_opts(Opts::new(
            "r_luod_starts_total",
            "Total number of times the R-LUO daemon has initialised",
        ))?;
        registry.register(Box::new(starts_total.clone()))?;

        let buckets = prometheus::exponential_buckets(0.001, 2.0, 16)
            .context("failed to construct histogram buckets")?;
        let config_load_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "r_luod_config_load_seconds",
                "Time spent loading and validating configuration",
            )
            .buckets(buckets),
        )?;
        registry.register(Box::new(config_load_seconds.clone()))?;

        Ok(Self {
            registry,
            starts_total,
            config_load_seconds,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn inc_start(&self) {
        self.starts_total.inc();
    }

    pub fn observe_config_load(&self, seconds: f64) {
        self.config_load_seconds.observe(seconds);
    }
}

impl std::fmt::Debug for DaemonMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonMetrics").finish_non_exhaustive()
    }
}

/// Reload pipeline metrics shared by the coordinator, broadcaster and cluster listener.
#[derive(Clone, Debug)]
pub struct ReloadMetrics {
    registry: SharedRegistry,
    attempts: IntCounterVec,
    outcomes: IntCounterVec,
    generation: IntGauge,
    apply_duration: HistogramVec,
    sync_failures: IntCounterVec,
    rollbacks: IntCounter,
}

impl ReloadMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let attempts = IntCounterVec::new(
            Opts::new(
                "r_luo_reload_attempts_total",
                "Reload attempts by trigger (scheduled, manual, signal, cluster)",
            ),
            &["trigger"],
        )?;
        registry.register(Box::new(attempts.clone()))?;

        let outcomes = IntCounterVec::new(
            Opts::new(
                "r_luo_module_outcomes_total",
                "Per-module reload outcomes by status",
            ),
            &["module", "status"],
        )?;
        registry.register(Box::new(outcomes.clone()))?;

        let generation = IntGauge::with_opts(Opts::new(
            "r_luo_generation",
            "Highest generation committed by this process",
        ))?;
        registry.register(Box::new(generation.clone()))?;

        let buckets = prometheus::exponential_buckets(0.0005, 2.0, 14)
            .context("failed to construct histogram buckets")?;
        let apply_duration = HistogramVec::new(
            HistogramOpts::new(
                "r_luo_apply_duration_seconds",
                "Time spent in a module's reload function",
            )
            .buckets(buckets),
            &["module"],
        )?;
        registry.register(Box::new(apply_duration.clone()))?;

        let sync_failures = IntCounterVec::new(
            Opts::new(
                "r_luo_sync_propagation_failures_total",
                "Sync propagation failures by channel (process, cluster)",
            ),
            &["channel"],
        )?;
        registry.register(Box::new(sync_failures.clone()))?;

        let rollbacks = IntCounter::with_opts(Opts::new(
            "r_luo_rollbacks_total",
            "Modules restored from a backup",
        ))?;
        registry.register(Box::new(rollbacks.clone()))?;

        Ok(Self {
            registry,
            attempts,
            outcomes,
            generation,
            apply_duration,
            sync_failures,
            rollbacks,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn record_attempt(&self, trigger: &str) {
        self.attempts.with_label_values(&[trigger]).inc();
    }

    pub fn record_outcome(&self, module: &str, status: &str) {
        self.outcomes.with_label_values(&[module, status]).inc();
    }

    pub fn set_generation(&self, generation: u64) {
        self.generation.set(generation as i64);
    }

    pub fn observe_apply(&self, module: &str, seconds: f64) {
        self.apply_duration
            .with_label_values(&[module])
            .observe(seconds);
    }

    pub fn record_sync_failure(&self, channel: &str) {
        self.sync_failures.with_label_values(&[channel]).inc();
    }

    pub fn inc_rollback(&self) {
        self.rollbacks.inc();
    }
}

pub use prometheus;

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn exporter_serves_registered_metrics() {
        let registry = new_registry();
        let reload = ReloadMetrics::new(registry.clone()).unwrap();
        reload.record_attempt("manual");
        reload.set_generation(3);

        let server =
            spawn_http_server(registry, SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).unwrap();
        let response = reqwest::get(format!("http://{}/metrics", server.addr()))
            .await
            .unwrap();
        assert_eq!(
            response.headers()[reqwest::header::CONTENT_TYPE],
            prometheus::TEXT_FORMAT
        );
        let body = response.text().await.unwrap();
        assert!(body.contains("r_luo_reload_attempts_total{trigger=\"manual\"} 1"));
        assert!(body.contains("r_luo_generation 3"));
        server.shutdown().await.unwrap();
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = new_registry();
        DaemonMetrics::new(registry.clone()).unwrap();
        assert!(DaemonMetrics::new(registry).is_err());
    }
}
