//! ---
//! apm_section: "03-persistence-logging"
//! apm_subsection: "module"
//! apm_type: "source"
//! apm_scope: "code"
//! apm_description: "Self-telemetry collection and export utilities."
//! apm_version: "v0.0.0-prealpha"
//! apm_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across the workspace.
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
    let local_addr = std_listener
        .local_addr()
        .with_context(|| "failed to read metrics listener address")?;
    let listener = TcpListener::from_std(std_listener)
        .with_context(|| "failed to convert std listener into tokio listener")?;

    info!(address = %local_addr, "metrics server starting");

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
        addr: local_addr,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

/// Prometheus scrape endpoint.
async fn metrics_handler(registry: SharedRegistry) -> impl IntoResponse {
    let families = registry.gather();
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&families) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_str(encoder.format_type()).expect("valid header value"),
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

/// Instruments recorded by the agent uplink subsystems.
#[derive(Clone)]
pub struct AgentMetrics {
    channel_connected: IntGauge,
    channel_rebuilds: IntCounter,
    network_errors: IntCounter,
    commands_received: IntCounter,
    commands_deduplicated: IntCounter,
    commands_dropped: IntCounter,
    commands_executed: IntCounterVec,
    command_failures: IntCounterVec,
    config_syncs: IntCounter,
    config_sync_failures: IntCounter,
    watcher_notifications: IntCounterVec,
}

impl AgentMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let channel_connected = IntGauge::with_opts(Opts::new(
            "r_apm_channel_connected",
            "Indicator (0/1) whether the collector channel is currently connected",
        ))?;
        registry.register(Box::new(channel_connected.clone()))?;

        let channel_rebuilds = IntCounter::with_opts(Opts::new(
            "r_apm_channel_rebuilds_total",
            "Number of collector channels built since start",
        ))?;
        registry.register(Box::new(channel_rebuilds.clone()))?;

        let network_errors = IntCounter::with_opts(Opts::new(
            "r_apm_channel_network_errors_total",
            "Reported upstream errors classified as network failures",
        ))?;
        registry.register(Box::new(network_errors.clone()))?;

        let commands_received = IntCounter::with_opts(Opts::new(
            "r_apm_commands_received_total",
            "Commands accepted into the scheduler queue",
        ))?;
        registry.register(Box::new(commands_received.clone()))?;

        let commands_deduplicated = IntCounter::with_opts(Opts::new(
            "r_apm_commands_deduplicated_total",
            "Commands dropped because their serial number was already executed",
        ))?;
        registry.register(Box::new(commands_deduplicated.clone()))?;

        let commands_dropped = IntCounter::with_opts(Opts::new(
            "r_apm_commands_dropped_total",
            "Commands dropped because the scheduler queue was full",
        ))?;
        registry.register(Box::new(commands_dropped.clone()))?;

        let commands_executed = IntCounterVec::new(
            Opts::new(
                "r_apm_commands_executed_total",
                "Commands successfully dispatched to an executor, by kind",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(commands_executed.clone()))?;

        let command_failures = IntCounterVec::new(
            Opts::new(
                "r_apm_command_failures_total",
                "Executor failures, by command kind",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(command_failures.clone()))?;

        let config_syncs = IntCounter::with_opts(Opts::new(
            "r_apm_config_syncs_total",
            "Completed configuration sync round trips",
        ))?;
        registry.register(Box::new(config_syncs.clone()))?;

        let config_sync_failures = IntCounter::with_opts(Opts::new(
            "r_apm_config_sync_failures_total",
            "Configuration sync attempts that ended in an upstream error",
        ))?;
        registry.register(Box::new(config_sync_failures.clone()))?;

        let watcher_notifications = IntCounterVec::new(
            Opts::new(
                "r_apm_watcher_notifications_total",
                "Configuration change notifications delivered to watchers, by change kind",
            ),
            &["change"],
        )?;
        registry.register(Box::new(watcher_notifications.clone()))?;

        Ok(Self {
            channel_connected,
            channel_rebuilds,
            network_errors,
            commands_received,
            commands_deduplicated,
            commands_dropped,
            commands_executed,
            command_failures,
            config_syncs,
            config_sync_failures,
            watcher_notifications,
        })
    }

    pub fn set_channel_connected(&self, connected: bool) {
        self.channel_connected.set(if connected { 1 } else { 0 });
    }

    pub fn inc_channel_rebuild(&self) {
        self.channel_rebuilds.inc();
    }

    pub fn inc_network_error(&self) {
        self.network_errors.inc();
    }

    pub fn inc_command_received(&self) {
        self.commands_received.inc();
    }

    pub fn inc_command_deduplicated(&self) {
        self.commands_deduplicated.inc();
    }

    pub fn inc_command_dropped(&self) {
        self.commands_dropped.inc();
    }

    pub fn inc_command_executed(&self, kind: &str) {
        self.commands_executed.with_label_values(&[kind]).inc();
    }

    pub fn inc_command_failure(&self, kind: &str) {
        self.command_failures.with_label_values(&[kind]).inc();
    }

    pub fn inc_config_sync(&self) {
        self.config_syncs.inc();
    }

    pub fn inc_config_sync_failure(&self) {
        self.config_sync_failures.inc();
    }

    pub fn inc_watcher_notification(&self, change: &str) {
        self.watcher_notifications.with_label_values(&[change]).inc();
    }
}

pub use prometheus;
