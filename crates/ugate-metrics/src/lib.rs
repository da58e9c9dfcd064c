//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Metrics collection and export for the gateway."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Router};
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
    TEXT_FORMAT,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across the gateway.
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
    let bound = std_listener
        .local_addr()
        .with_context(|| "failed to read metrics listener address")?;
    let listener = TcpListener::from_std(std_listener)
        .with_context(|| "failed to convert std listener into tokio listener")?;

    info!(address = %bound, "metrics server starting");

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
        addr: bound,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

async fn metrics_handler(registry: SharedRegistry) -> impl IntoResponse {
    let families = registry.gather();
    match TextEncoder::new().encode_to_string(&families) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, HeaderValue::from_static(TEXT_FORMAT))],
            body,
        ),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"))],
                String::from("metrics encoding error"),
            )
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
    starts_total: IntCounter,
    config_load_seconds: Histogram,
    build_info: IntGaugeVec,
}

impl DaemonMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let starts_total = IntCounter::with_opts(Opts::new(
            "ugated_starts_total",
            "Total number of times the gateway daemon has initialised",
        ))?;
        registry.register(Box::new(starts_total.clone()))?;

        let buckets = prometheus::exponential_buckets(0.001, 2.0, 16)
            .context("failed to construct histogram buckets")?;
        let config_load_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "ugated_config_load_seconds",
                "Time spent loading and validating configuration",
            )
            .buckets(buckets),
        )?;
        registry.register(Box::new(config_load_seconds.clone()))?;

        let build_info = IntGaugeVec::new(
            Opts::new("ugated_build_info", "Version of the running daemon binary"),
            &["version"],
        )?;
        registry.register(Box::new(build_info.clone()))?;

        Ok(Self {
            starts_total,
            config_load_seconds,
            build_info,
        })
    }

    pub fn inc_start(&self) {
        self.starts_total.inc();
    }

    pub fn observe_config_load(&self, seconds: f64) {
        self.config_load_seconds.observe(seconds);
    }

    pub fn set_build_info(&self, version: &str) {
        self.build_info.with_label_values(&[version]).set(1);
    }
}

/// Protocol-level counters for frames, image transfers and mail decisions.
#[derive(Clone, Debug)]
pub struct GatewayMetrics {
    frames: IntCounterVec,
    malformed: IntCounter,
    images: IntCounter,
    retries: IntCounter,
    images_lost: IntCounter,
    timeouts: IntCounter,
    mail_decisions: IntCounterVec,
    transfer_seconds: Histogram,
}

impl GatewayMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let frames = IntCounterVec::new(
            Opts::new("ugate_frames_total", "Radio frames dispatched by kind"),
            &["kind"],
        )?;
        registry.register(Box::new(frames.clone()))?;

        let malformed = IntCounter::with_opts(Opts::new(
            "ugate_malformed_frames_total",
            "Data frames dropped because their payload was too short or out of range",
        ))?;
        registry.register(Box::new(malformed.clone()))?;

        let images = IntCounter::with_opts(Opts::new(
            "ugate_images_materialized_total",
            "Images reassembled from chunk transfers",
        ))?;
        registry.register(Box::new(images.clone()))?;

        let retries = IntCounter::with_opts(Opts::new(
            "ugate_image_retries_total",
            "Capture commands resent after a corrupted transfer",
        ))?;
        registry.register(Box::new(retries.clone()))?;

        let images_lost = IntCounter::with_opts(Opts::new(
            "ugate_images_lost_total",
            "Captures abandoned after exhausting retries",
        ))?;
        registry.register(Box::new(images_lost.clone()))?;

        let timeouts = IntCounter::with_opts(Opts::new(
            "ugate_image_timeouts_total",
            "Stale transfers replaced by a new capture",
        ))?;
        registry.register(Box::new(timeouts.clone()))?;

        let mail_decisions = IntCounterVec::new(
            Opts::new("ugate_mail_decisions_total", "Inbound mail decisions by outcome"),
            &["decision"],
        )?;
        registry.register(Box::new(mail_decisions.clone()))?;

        let buckets = prometheus::exponential_buckets(0.25, 2.0, 10)
            .context("failed to construct histogram buckets")?;
        let transfer_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "ugate_image_transfer_seconds",
                "Time between the first and last chunk of a materialized image",
            )
            .buckets(buckets),
        )?;
        registry.register(Box::new(transfer_seconds.clone()))?;

        Ok(Self {
            frames,
            malformed,
            images,
            retries,
            images_lost,
            timeouts,
            mail_decisions,
            transfer_seconds,
        })
    }

    pub fn observe_frame(&self, kind: &str) {
        self.frames.with_label_values(&[kind]).inc();
    }

    pub fn observe_malformed(&self) {
        self.malformed.inc();
    }

    pub fn observe_image(&self, elapsed: Duration) {
        self.images.inc();
        self.transfer_seconds.observe(elapsed.as_secs_f64());
    }

    pub fn observe_retry(&self) {
        self.retries.inc();
    }

    pub fn observe_image_lost(&self) {
        self.images_lost.inc();
    }

    pub fn observe_timeout(&self) {
        self.timeouts.inc();
    }

    pub fn observe_mail_decision(&self, decision: &str) {
        self.mail_decisions.with_label_values(&[decision]).inc();
    }
}

pub use prometheus;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_metrics_register_and_count() {
        let registry = new_registry();
        let metrics = GatewayMetrics::new(registry.clone()).expect("register metrics");
        metrics.observe_frame("data");
        metrics.observe_frame("data");
        metrics.observe_retry();
        metrics.observe_image(Duration::from_secs(3));
        metrics.observe_mail_decision("reply");

        let families = registry.gather();
        let frames = families
            .iter()
            .find(|f| f.get_name() == "ugate_frames_total")
            .expect("frames family");
        assert_eq!(frames.get_metric()[0].get_counter().get_value(), 2.0);
        assert!(families
            .iter()
            .any(|f| f.get_name() == "ugate_image_transfer_seconds"));
    }

    #[test]
    fn duplicate_registration_fails() {
        let registry = new_registry();
        GatewayMetrics::new(registry.clone()).expect("first registration");
        assert!(GatewayMetrics::new(registry).is_err());
    }

    #[tokio::test]
    async fn scrape_uses_prometheus_text_format() {
        let registry = new_registry();
        let metrics = GatewayMetrics::new(registry.clone()).expect("register metrics");
        metrics.observe_malformed();

        let response = metrics_handler(registry).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE),
            Some(&HeaderValue::from_static(TEXT_FORMAT))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn http_server_binds_and_shuts_down() {
        let registry = new_registry();
        let daemon = DaemonMetrics::new(registry.clone()).expect("daemon metrics");
        daemon.inc_start();
        daemon.set_build_info("0.1.0");
        daemon.observe_config_load(0.01);

        let server = spawn_http_server(registry, SocketAddr::from(([127, 0, 0, 1], 0)))
            .expect("server starts");
        assert_ne!(server.addr().port(), 0);
        server.shutdown().await.expect("server stops");
    }
}
