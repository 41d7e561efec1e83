//! ---
//! apm_section: "02-commands-scheduling"
//! apm_subsection: "module"
//! apm_type: "source"
//! apm_scope: "code"
//! apm_description: "Dynamic configuration discovery and watcher fan-out."
//! apm_version: "v0.0.0-prealpha"
//! apm_owner: "tbd"
//! ---
//! Dynamic configuration discovery: a polling loop keeps a versioned
//! configuration set in sync with the collector, and observed value
//! transitions fan out to per-key watchers.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use indexmap::IndexMap;
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use r_apm_common::config::AgentConfig;
use r_apm_common::guard::spawn_periodic;
use r_apm_metrics::AgentMetrics;
use r_apm_proto::{
    ConfigurationDiscoveryCommand, ConfigurationDiscoveryServiceClient, ConfigurationSyncRequest,
    KeyStringValuePair,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::boot::{BootService, ServiceKind, ServiceRole};
use crate::commands::CommandService;
use crate::remote::{CallableChannel, ChannelListener, ChannelManager, ChannelStatus};

/// How an observed configuration value changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Add,
    Modify,
    Delete,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChangeKind::Add => "add",
            ChangeKind::Modify => "modify",
            ChangeKind::Delete => "delete",
        })
    }
}

/// A single observed transition delivered to a watcher. `new_value` is
/// absent exactly when the kind is [`ChangeKind::Delete`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigChangeEvent {
    pub new_value: Option<String>,
    pub kind: ChangeKind,
}

/// In-process subscriber for one configuration key.
///
/// `value` must reflect what the subscriber currently holds; the diff against
/// it decides whether a notification fires at all.
pub trait ConfigChangeWatcher: Send + Sync {
    fn property_key(&self) -> &str;

    fn value(&self) -> Option<String>;

    fn notify(&self, event: ConfigChangeEvent);
}

/// Registration failures; a duplicate key is a caller bug.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("duplicate configuration watcher registered for key {0:?}")]
    DuplicateWatcher(String),
}

type DiscoveryClient = ConfigurationDiscoveryServiceClient<CallableChannel>;

/// Periodically syncs the versioned configuration set from the collector and
/// fans observed changes out to registered watchers.
pub struct ConfigurationDiscoveryService {
    config: Arc<AgentConfig>,
    channel: Arc<ChannelManager>,
    scheduler: OnceCell<Arc<CommandService>>,
    watchers: RwLock<IndexMap<String, Arc<dyn ConfigChangeWatcher>>>,
    /// Sync cursor: version token of the last ingested configuration set.
    uuid: Mutex<Option<String>>,
    last_watcher_count: Mutex<usize>,
    status: Mutex<ChannelStatus>,
    stub: Mutex<Option<DiscoveryClient>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    metrics: Option<AgentMetrics>,
}

impl ConfigurationDiscoveryService {
    pub const KIND: ServiceKind = ServiceKind("configuration-discovery");

    pub fn new(
        config: Arc<AgentConfig>,
        channel: Arc<ChannelManager>,
        metrics: Option<AgentMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            channel,
            scheduler: OnceCell::new(),
            watchers: RwLock::new(IndexMap::new()),
            uuid: Mutex::new(None),
            last_watcher_count: Mutex::new(0),
            status: Mutex::new(ChannelStatus::Disconnect),
            stub: Mutex::new(None),
            worker: Mutex::new(None),
            shutdown: Mutex::new(None),
            metrics,
        })
    }

    /// Late-bind the command scheduler that sync responses are handed to.
    /// Wiring calls this once before boot.
    pub fn attach_scheduler(&self, scheduler: Arc<CommandService>) {
        if self.scheduler.set(scheduler).is_err() {
            warn!("command scheduler already attached to configuration discovery");
        }
    }

    /// Register a watcher under its property key. Registration after boot is
    /// tolerated: the next poll drops the sync cursor so the server answers
    /// with a full configuration set.
    pub fn register_watcher(
        &self,
        watcher: Arc<dyn ConfigChangeWatcher>,
    ) -> Result<(), DiscoveryError> {
        let key = watcher.property_key().to_owned();
        let mut watchers = self.watchers.write();
        if watchers.contains_key(&key) {
            return Err(DiscoveryError::DuplicateWatcher(key));
        }
        debug!(key = %key, "configuration watcher registered");
        watchers.insert(key, watcher);
        Ok(())
    }

    /// The last ingested configuration version, if any.
    pub fn sync_cursor(&self) -> Option<String> {
        self.uuid.lock().clone()
    }

    /// Apply a configuration snapshot delivered through the command path.
    ///
    /// A snapshot carrying the previously ingested version token is a no-op.
    /// Keys registered but absent from the snapshot are reified as blank
    /// values, turning server-side removals into `Delete` notifications.
    pub fn handle_discovery_command(&self, command: &ConfigurationDiscoveryCommand) {
        if let Some(uuid) = &command.uuid {
            if self.uuid.lock().as_ref() == Some(uuid) {
                debug!(uuid = %uuid, "configuration unchanged, nothing to apply");
                return;
            }
        }

        for pair in self.effective_config(&command.config) {
            let watcher = self.watchers.read().get(&pair.key).cloned();
            let Some(watcher) = watcher else {
                warn!(key = %pair.key, "configuration entry matches no watcher, ignored");
                continue;
            };
            if pair.value.trim().is_empty() {
                if watcher.value().is_some() {
                    self.notify_watcher(&watcher, None, ChangeKind::Delete);
                }
            } else if watcher.value().as_deref() != Some(pair.value.as_str()) {
                self.notify_watcher(&watcher, Some(pair.value.clone()), ChangeKind::Modify);
            }
        }

        *self.uuid.lock() = command.uuid.clone();
        trace!(registry = %self.describe_watchers(), "configurations after sync");
    }

    /// Merge the incoming snapshot over the registered keys: a registered key
    /// missing from the snapshot yields a blank entry.
    fn effective_config(&self, incoming: &[KeyStringValuePair]) -> Vec<KeyStringValuePair> {
        let by_key: HashMap<&str, &KeyStringValuePair> =
            incoming.iter().map(|pair| (pair.key.as_str(), pair)).collect();
        self.watchers
            .read()
            .keys()
            .map(|key| match by_key.get(key.as_str()) {
                Some(pair) => (*pair).clone(),
                None => KeyStringValuePair {
                    key: key.clone(),
                    value: String::new(),
                },
            })
            .collect()
    }

    fn notify_watcher(
        &self,
        watcher: &Arc<dyn ConfigChangeWatcher>,
        new_value: Option<String>,
        kind: ChangeKind,
    ) {
        info!(key = %watcher.property_key(), change = %kind, "configuration change");
        if let Some(metrics) = &self.metrics {
            metrics.inc_watcher_notification(&kind.to_string());
        }
        watcher.notify(ConfigChangeEvent { new_value, kind });
    }

    /// Build the next sync request. A change in the number of registered
    /// keys drops the cursor: behind an unchanged-version short circuit a
    /// freshly registered key would never be answered.
    fn build_sync_request(&self) -> ConfigurationSyncRequest {
        let count = self.watchers.read().len();
        {
            let mut last = self.last_watcher_count.lock();
            if *last != count {
                *self.uuid.lock() = None;
                *last = count;
            }
        }
        ConfigurationSyncRequest {
            service: self.config.agent.service_name.clone(),
            uuid: self.uuid.lock().clone().unwrap_or_default(),
        }
    }

    async fn sync_tick(&self) -> Result<()> {
        let status = *self.status.lock();
        debug!(?status, "configuration discovery poll");
        if status != ChannelStatus::Connected {
            return Ok(());
        }
        let Some(mut client) = self.stub.lock().clone() else {
            return Ok(());
        };

        let mut request = tonic::Request::new(self.build_sync_request());
        request.set_timeout(self.config.collector.grpc_upstream_timeout);

        match client.fetch_configurations(request).await {
            Ok(response) => {
                if let Some(metrics) = &self.metrics {
                    metrics.inc_config_sync();
                }
                match self.scheduler.get() {
                    Some(scheduler) => scheduler.receive(&response.into_inner()),
                    None => warn!("no command scheduler attached; sync response discarded"),
                }
            }
            Err(status) => {
                error!(code = ?status.code(), message = %status.message(), "configuration sync failed");
                if let Some(metrics) = &self.metrics {
                    metrics.inc_config_sync_failure();
                }
                self.channel.report_error(&status);
            }
        }
        Ok(())
    }

    fn describe_watchers(&self) -> String {
        let watchers = self.watchers.read();
        let mut description = String::from("[");
        for (index, (key, watcher)) in watchers.iter().enumerate() {
            if index > 0 {
                description.push(',');
            }
            description.push_str(&format!(
                "key:{} value(current):{:?}",
                key,
                watcher.value()
            ));
        }
        description.push(']');
        description
    }
}

impl ChannelListener for ConfigurationDiscoveryService {
    fn status_changed(&self, status: ChannelStatus) -> Result<()> {
        if status == ChannelStatus::Connected {
            *self.stub.lock() = self
                .channel
                .callable()
                .map(ConfigurationDiscoveryServiceClient::new);
        } else {
            *self.stub.lock() = None;
        }
        *self.status.lock() = status;
        Ok(())
    }
}

#[async_trait]
impl BootService for ConfigurationDiscoveryService {
    fn kind(&self) -> ServiceKind {
        Self::KIND
    }

    fn role(&self) -> ServiceRole {
        ServiceRole::Default
    }

    async fn prepare(self: Arc<Self>) -> Result<()> {
        self.channel.add_listener(self.clone());
        Ok(())
    }

    async fn start(self: Arc<Self>) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.shutdown.lock() = Some(shutdown_tx);
        let interval = self.config.collector.get_agent_dynamic_config_interval;
        let this = self.clone();
        let worker = spawn_periodic(
            "configuration-discovery",
            interval,
            interval,
            shutdown_rx,
            move || {
                let this = this.clone();
                async move { this.sync_tick().await }
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
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use r_apm_common::identity::AgentIdentity;

    use super::*;

    struct TestWatcher {
        key: String,
        current: Mutex<Option<String>>,
        events: Mutex<Vec<ConfigChangeEvent>>,
    }

    impl TestWatcher {
        fn new(key: &str) -> Arc<Self> {
            Arc::new(Self {
                key: key.to_owned(),
                current: Mutex::new(None),
                events: Mutex::new(Vec::new()),
            })
        }

        fn events(&self) -> Vec<ConfigChangeEvent> {
            self.events.lock().clone()
        }
    }

    impl ConfigChangeWatcher for TestWatcher {
        fn property_key(&self) -> &str {
            &self.key
        }

        fn value(&self) -> Option<String> {
            self.current.lock().clone()
        }

        fn notify(&self, event: ConfigChangeEvent) {
            *self.current.lock() = event.new_value.clone();
            self.events.lock().push(event);
        }
    }

    fn service() -> Arc<ConfigurationDiscoveryService> {
        let config = Arc::new(AgentConfig::default());
        let identity = Arc::new(AgentIdentity::new("svc", None));
        let channel = ChannelManager::new(config.clone(), identity, None);
        ConfigurationDiscoveryService::new(config, channel, None)
    }

    fn pair(key: &str, value: &str) -> KeyStringValuePair {
        KeyStringValuePair {
            key: key.to_owned(),
            value: value.to_owned(),
        }
    }

    fn snapshot(uuid: &str, config: Vec<KeyStringValuePair>) -> ConfigurationDiscoveryCommand {
        ConfigurationDiscoveryCommand {
            serial_number: format!("serial-{uuid}"),
            uuid: Some(uuid.to_owned()),
            config,
        }
    }

    #[test]
    fn first_observation_fires_modify() {
        let service = service();
        let watcher = TestWatcher::new("agent.sample_rate");
        service.register_watcher(watcher.clone()).unwrap();

        service.handle_discovery_command(&snapshot("u-1", vec![pair("agent.sample_rate", "500")]));

        assert_eq!(
            watcher.events(),
            vec![ConfigChangeEvent {
                new_value: Some("500".to_owned()),
                kind: ChangeKind::Modify,
            }]
        );
        assert_eq!(service.sync_cursor().as_deref(), Some("u-1"));
    }

    #[test]
    fn an_unchanged_version_token_is_a_no_op() {
        let service = service();
        let watcher = TestWatcher::new("agent.sample_rate");
        service.register_watcher(watcher.clone()).unwrap();

        service.handle_discovery_command(&snapshot("u-1", vec![pair("agent.sample_rate", "500")]));
        service.handle_discovery_command(&snapshot("u-1", vec![pair("agent.sample_rate", "999")]));

        assert_eq!(watcher.events().len(), 1, "second snapshot short-circuits");
        assert_eq!(service.sync_cursor().as_deref(), Some("u-1"));
    }

    #[test]
    fn identical_values_do_not_renotify() {
        let service = service();
        let watcher = TestWatcher::new("agent.sample_rate");
        service.register_watcher(watcher.clone()).unwrap();

        service.handle_discovery_command(&snapshot("u-1", vec![pair("agent.sample_rate", "500")]));
        service.handle_discovery_command(&snapshot("u-2", vec![pair("agent.sample_rate", "500")]));

        assert_eq!(watcher.events().len(), 1);
        assert_eq!(service.sync_cursor().as_deref(), Some("u-2"));
    }

    #[test]
    fn a_key_absent_from_the_snapshot_is_a_deletion() {
        let service = service();
        let watcher = TestWatcher::new("agent.sample_rate");
        service.register_watcher(watcher.clone()).unwrap();

        service.handle_discovery_command(&snapshot("u-1", vec![pair("agent.sample_rate", "500")]));
        service.handle_discovery_command(&snapshot("u-2", Vec::new()));

        assert_eq!(
            watcher.events().last().unwrap(),
            &ConfigChangeEvent {
                new_value: None,
                kind: ChangeKind::Delete,
            }
        );

        // a second empty snapshot finds the value already null: no event
        service.handle_discovery_command(&snapshot("u-3", Vec::new()));
        assert_eq!(watcher.events().len(), 2);
    }

    #[test]
    fn unknown_keys_in_the_snapshot_are_ignored() {
        let service = service();
        let watcher = TestWatcher::new("agent.sample_rate");
        service.register_watcher(watcher.clone()).unwrap();

        service.handle_discovery_command(&snapshot("u-1", vec![pair("agent.unrelated", "x")]));
        assert!(watcher.events().is_empty());
    }

    #[test]
    fn duplicate_watcher_keys_are_rejected() {
        let service = service();
        service
            .register_watcher(TestWatcher::new("agent.sample_rate"))
            .unwrap();
        let err = service
            .register_watcher(TestWatcher::new("agent.sample_rate"))
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::DuplicateWatcher(key) if key == "agent.sample_rate"));
    }

    #[test]
    fn registering_a_watcher_drops_the_sync_cursor() {
        let service = service();
        service
            .register_watcher(TestWatcher::new("agent.sample_rate"))
            .unwrap();

        // first request observes the new watcher count and carries no cursor
        let request = service.build_sync_request();
        assert_eq!(request.service, "unnamed-service");
        assert!(request.uuid.is_empty());

        service.handle_discovery_command(&snapshot("u-1", vec![pair("agent.sample_rate", "500")]));
        assert_eq!(service.build_sync_request().uuid, "u-1");

        // late registration resets the cursor again
        service
            .register_watcher(TestWatcher::new("agent.span_limit"))
            .unwrap();
        assert!(service.build_sync_request().uuid.is_empty());
    }
}
