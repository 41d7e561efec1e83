//! ---
//! apm_section: "05-networking-external-interfaces"
//! apm_subsection: "module"
//! apm_type: "source"
//! apm_scope: "code"
//! apm_description: "Collector uplink: managed channel, decorators, health state machine."
//! apm_version: "v0.0.0-prealpha"
//! apm_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use r_apm_common::config::{split_endpoint, AgentConfig};
use r_apm_common::guard::spawn_periodic;
use r_apm_common::identity::AgentIdentity;
use r_apm_metrics::AgentMetrics;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tonic::{Code, Status};
use tracing::{debug, error, info, warn};

use crate::boot::{BootService, ServiceKind, ServiceRole};
use crate::remote::channel::{
    AgentIdDecorator, AuthenticationDecorator, CallableChannel, ChannelError, GrpcChannel,
};

/// Connection state of the collector uplink, broadcast to listeners on every
/// transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Connected,
    Disconnect,
}

/// Observer of uplink state transitions. Notified synchronously, in
/// registration order; a failing listener is logged and skipped.
pub trait ChannelListener: Send + Sync {
    fn status_changed(&self, status: ChannelStatus) -> Result<()>;
}

/// Endpoint selection strategy: given the server-list length, yield an index.
/// Uniform random by default; injectable for deterministic failover tests.
pub type IndexPicker = Box<dyn FnMut(usize) -> usize + Send>;

/// Classify an upstream error. Only these codes indicate the channel itself
/// is unusable; anything else is an application-level failure that leaves
/// the connection state alone.
pub fn is_network_error(status: &Status) -> bool {
    matches!(
        status.code(),
        Code::Unavailable
            | Code::PermissionDenied
            | Code::Unauthenticated
            | Code::ResourceExhausted
            | Code::Unknown
    )
}

struct UplinkState {
    servers: Vec<String>,
    selected_idx: Option<usize>,
    reconnect: bool,
    reconnect_count: u32,
    channel: Option<Arc<GrpcChannel>>,
}

/// Maintains the single collector channel: periodic health checks, DNS
/// refresh, endpoint failover, and listener fan-out.
pub struct ChannelManager {
    config: Arc<AgentConfig>,
    identity: Arc<AgentIdentity>,
    state: Mutex<UplinkState>,
    listeners: RwLock<Vec<Arc<dyn ChannelListener>>>,
    picker: Mutex<IndexPicker>,
    worker: Mutex<Option<JoinHandle<()>>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    metrics: Option<AgentMetrics>,
}

impl ChannelManager {
    pub const KIND: ServiceKind = ServiceKind("grpc-channel-manager");

    pub fn new(
        config: Arc<AgentConfig>,
        identity: Arc<AgentIdentity>,
        metrics: Option<AgentMetrics>,
    ) -> Arc<Self> {
        let mut rng = StdRng::from_entropy();
        Arc::new(Self {
            config,
            identity,
            state: Mutex::new(UplinkState {
                servers: Vec::new(),
                selected_idx: None,
                reconnect: true,
                reconnect_count: 0,
                channel: None,
            }),
            listeners: RwLock::new(Vec::new()),
            picker: Mutex::new(Box::new(move |len| rng.gen_range(0..len))),
            worker: Mutex::new(None),
            shutdown: Mutex::new(None),
            metrics,
        })
    }

    /// Replace the endpoint selection strategy.
    pub fn set_index_picker(&self, picker: IndexPicker) {
        *self.picker.lock() = picker;
    }

    /// Register a state-transition observer. Listeners added after a
    /// transition only see subsequent ones.
    pub fn add_listener(&self, listener: Arc<dyn ChannelListener>) {
        self.listeners.write().push(listener);
    }

    /// Snapshot of the current decorated channel, if one is established.
    pub fn callable(&self) -> Option<CallableChannel> {
        self.state.lock().channel.as_ref().map(|c| c.callable())
    }

    /// Report an upstream failure observed by a caller. Network-class errors
    /// flip the uplink to `Disconnect` and schedule reconnection; anything
    /// else is ignored here.
    pub fn report_error(&self, status: &Status) {
        if !is_network_error(status) {
            return;
        }
        warn!(
            code = ?status.code(),
            message = %status.message(),
            "upstream network error reported; scheduling reconnect"
        );
        if let Some(metrics) = &self.metrics {
            metrics.inc_network_error();
        }
        self.state.lock().reconnect = true;
        self.broadcast(ChannelStatus::Disconnect);
    }

    async fn tick(&self) -> Result<()> {
        let reconnect = self.state.lock().reconnect;
        debug!(reconnect, "collector channel health check");

        if self.config.collector.is_resolve_dns_periodically && reconnect {
            self.refresh_server_list().await;
        }
        if !reconnect {
            return Ok(());
        }

        let servers = self.state.lock().servers.clone();
        if servers.is_empty() {
            debug!("no collector endpoints available; waiting for the next health check");
            return Ok(());
        }

        let index = {
            let mut picker = self.picker.lock();
            (*picker)(servers.len())
        };
        let selected = self.state.lock().selected_idx;

        if selected != Some(index) {
            let target = servers[index].clone();
            let (host, port) = split_endpoint(&target)?;
            // Commit the selection and retire the old channel before dialling.
            {
                let mut state = self.state.lock();
                state.selected_idx = Some(index);
                if let Some(old) = state.channel.take() {
                    old.shut_down();
                }
            }
            match self.build_channel(&host, port).await {
                Ok(channel) => {
                    info!(endpoint = %target, "collector channel established");
                    {
                        let mut state = self.state.lock();
                        state.channel = Some(Arc::new(channel));
                        state.reconnect = false;
                        state.reconnect_count = 0;
                    }
                    if let Some(metrics) = &self.metrics {
                        metrics.inc_channel_rebuild();
                    }
                    self.broadcast(ChannelStatus::Connected);
                }
                Err(err) => {
                    error!(endpoint = %target, error = %err, "failed to establish collector channel");
                    // un-commit the selection: with no channel to probe, the
                    // same index must stay eligible for a fresh dial
                    self.state.lock().selected_idx = None;
                    debug!(
                        retry_in = ?self.config.collector.grpc_channel_check_interval,
                        "collector endpoint unavailable"
                    );
                }
            }
        } else {
            // Same endpoint drawn again. Reconnecting it is the transport's
            // own job; once enough ticks pass, probe it for real and
            // re-announce so listeners that missed the transition recover.
            let (channel, force) = {
                let mut state = self.state.lock();
                state.reconnect_count += 1;
                (
                    state.channel.clone(),
                    state.reconnect_count > self.config.agent.force_reconnection_period,
                )
            };
            if let Some(channel) = channel {
                if channel.probe(force).await {
                    {
                        let mut state = self.state.lock();
                        state.reconnect = false;
                        state.reconnect_count = 0;
                    }
                    self.broadcast(ChannelStatus::Connected);
                }
            }
        }
        Ok(())
    }

    /// Re-expand the first configured endpoint into one `addr:port` entry per
    /// resolved address, replacing the in-memory server list.
    async fn refresh_server_list(&self) {
        let Some(first) = self.config.collector.backend_servers().into_iter().next() else {
            return;
        };
        let (host, port) = match split_endpoint(&first) {
            Ok(parts) => parts,
            Err(err) => {
                error!(endpoint = %first, error = %err, "cannot refresh an unparseable backend endpoint");
                return;
            }
        };
        let lookup_result = tokio::net::lookup_host((host.as_str(), port)).await;
        match lookup_result {
            Ok(addrs) => {
                let resolved: Vec<String> =
                    addrs.map(|addr| format!("{}:{}", addr.ip(), port)).collect();
                if resolved.is_empty() {
                    warn!(endpoint = %first, "dns refresh produced no addresses; keeping previous list");
                    return;
                }
                debug!(endpoint = %first, addresses = resolved.len(), "refreshed collector server list from dns");
                self.state.lock().servers = resolved;
            }
            Err(err) => {
                error!(endpoint = %first, error = %err, "failed to resolve backend service");
            }
        }
    }

    async fn build_channel(&self, host: &str, port: u16) -> Result<GrpcChannel, ChannelError> {
        GrpcChannel::builder(host, port)
            .tls(self.config.collector.tls.clone())
            .connect_timeout(self.config.collector.grpc_upstream_timeout)
            .decorator(Arc::new(AgentIdDecorator::new(self.identity.clone())))
            .decorator(Arc::new(AuthenticationDecorator::new(
                self.config.agent.authentication.clone(),
            )))
            .connect()
            .await
    }

    fn broadcast(&self, status: ChannelStatus) {
        if let Some(metrics) = &self.metrics {
            metrics.set_channel_connected(status == ChannelStatus::Connected);
        }
        let listeners: Vec<_> = self.listeners.read().clone();
        for listener in listeners {
            if let Err(err) = listener.status_changed(status) {
                error!(?status, error = %err, "failed to notify channel listener");
            }
        }
    }
}

#[async_trait]
impl BootService for ChannelManager {
    fn kind(&self) -> ServiceKind {
        Self::KIND
    }

    fn role(&self) -> ServiceRole {
        ServiceRole::Default
    }

    async fn prepare(self: Arc<Self>) -> Result<()> {
        Ok(())
    }

    async fn start(self: Arc<Self>) -> Result<()> {
        let servers = self.config.collector.backend_servers();
        if servers.is_empty() {
            error!("collector backend service addresses are not set");
            error!("agent will not uplink any data");
            return Ok(());
        }
        self.state.lock().servers = servers;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.shutdown.lock() = Some(shutdown_tx);
        let this = self.clone();
        let worker = spawn_periodic(
            "grpc-channel-manager",
            Duration::ZERO,
            self.config.collector.grpc_channel_check_interval,
            shutdown_rx,
            move || {
                let this = this.clone();
                async move { this.tick().await }
            },
        );
        *self.worker.lock() = Some(worker);
        Ok(())
    }

    async fn on_complete(self: Arc<Self>) -> Result<()> {
        Ok(())
    }

    async fn shutdown(self: Arc<Self>) -> Result<()> {
        if let Some(shutdown) = self.shutdown.lock().take() {
            let _ = shutdown.send(true);
        }
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
        if let Some(channel) = self.state.lock().channel.take() {
            channel.shut_down();
        }
        debug!("collector channel manager stopped");
        Ok(())
    }
}
