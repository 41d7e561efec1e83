//! ---
//! apm_section: "05-networking-external-interfaces"
//! apm_subsection: "module"
//! apm_type: "source"
//! apm_scope: "code"
//! apm_description: "End-to-end uplink scenarios against an in-process collector."
//! apm_version: "v0.0.0-prealpha"
//! apm_owner: "tbd"
//! ---
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use r_apm_common::config::AgentConfig;
use r_apm_common::identity::AgentIdentity;
use r_apm_core::{
    AgentIdDecorator, AuthenticationDecorator, BootService, ChangeKind, ChannelListener,
    ChannelManager, ChannelStatus, CommandExecutorService, CommandService, ConfigChangeEvent,
    ConfigChangeWatcher, ConfigurationDiscoveryCommandExecutor, ConfigurationDiscoveryService,
    InstanceNameGenerator, ServiceManager,
};
use r_apm_proto::proto::configuration_discovery_service_server::{
    ConfigurationDiscoveryService as DiscoveryRpc, ConfigurationDiscoveryServiceServer,
};
use r_apm_proto::{
    AgentCommand, Command, Commands, ConfigurationDiscoveryCommand, ConfigurationSyncRequest,
    ConfigurationDiscoveryServiceClient, KeyStringValuePair,
};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tonic::transport::server::TcpIncoming;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

#[derive(Debug, Clone)]
struct RecordedRequest {
    service: String,
    uuid: String,
    instance: Option<String>,
    authentication: Option<String>,
}

#[derive(Default)]
struct ScriptedCollector {
    responses: Mutex<VecDeque<Commands>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedCollector {
    fn push_response(&self, commands: Commands) {
        self.responses.lock().push_back(commands);
    }

    fn pending_responses(&self) -> usize {
        self.responses.lock().len()
    }

    fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }
}

struct CollectorSvc(Arc<ScriptedCollector>);

#[tonic::async_trait]
impl DiscoveryRpc for CollectorSvc {
    async fn fetch_configurations(
        &self,
        request: Request<ConfigurationSyncRequest>,
    ) -> Result<Response<Commands>, Status> {
        let metadata = request.metadata();
        let instance = metadata
            .get(AgentIdDecorator::INSTANCE_ID_KEY)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let authentication = metadata
            .get(AuthenticationDecorator::AUTHENTICATION_KEY)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let inner = request.into_inner();
        self.0.requests.lock().push(RecordedRequest {
            service: inner.service,
            uuid: inner.uuid,
            instance,
            authentication,
        });
        let next = self.0.responses.lock().pop_front().unwrap_or_default();
        Ok(Response::new(next))
    }
}

async fn spawn_collector(
    collector: Arc<ScriptedCollector>,
) -> (SocketAddr, oneshot::Sender<()>, JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let incoming = TcpIncoming::from_listener(listener, true, None).unwrap();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        Server::builder()
            .add_service(ConfigurationDiscoveryServiceServer::new(CollectorSvc(
                collector,
            )))
            .serve_with_incoming_shutdown(incoming, async move {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("collector server runs");
    });
    (addr, shutdown_tx, task)
}

fn agent_config(backends: &str) -> Arc<AgentConfig> {
    let mut config = AgentConfig::default();
    config.agent.service_name = "it-service".to_owned();
    config.agent.authentication = "secret-token".to_owned();
    config.collector.backend_service = backends.to_owned();
    config.collector.grpc_channel_check_interval = Duration::from_millis(100);
    config.collector.get_agent_dynamic_config_interval = Duration::from_millis(100);
    config.collector.grpc_upstream_timeout = Duration::from_secs(2);
    Arc::new(config)
}

fn discovery_response(serial: &str, uuid: &str, config: &[(&str, &str)]) -> Commands {
    Commands {
        commands: vec![Command::from(ConfigurationDiscoveryCommand {
            serial_number: serial.to_owned(),
            uuid: Some(uuid.to_owned()),
            config: config
                .iter()
                .map(|(key, value)| KeyStringValuePair {
                    key: (*key).to_owned(),
                    value: (*value).to_owned(),
                })
                .collect(),
        })],
    }
}

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

async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}

fn boot_wiring(
    config: Arc<AgentConfig>,
) -> (
    ServiceManager,
    Arc<ChannelManager>,
    Arc<ConfigurationDiscoveryService>,
) {
    let identity = Arc::new(AgentIdentity::from_settings(&config.agent));
    let channel = ChannelManager::new(config.clone(), identity.clone(), None);
    let discovery = ConfigurationDiscoveryService::new(config.clone(), channel.clone(), None);
    let executors = Arc::new(CommandExecutorService::new().with_executor(
        AgentCommand::CONFIGURATION_DISCOVERY,
        Arc::new(ConfigurationDiscoveryCommandExecutor::new(discovery.clone())),
    ));
    let commands = CommandService::new(executors.clone(), None);
    discovery.attach_scheduler(commands.clone());

    let manager = ServiceManager::new();
    manager.register(Arc::new(InstanceNameGenerator::new(identity)));
    manager.register(channel.clone());
    manager.register(executors);
    manager.register(commands);
    manager.register(discovery.clone());
    (manager, channel, discovery)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn configuration_sync_drives_watchers_end_to_end() {
    let collector = Arc::new(ScriptedCollector::default());
    collector.push_response(discovery_response("s-1", "u-1", &[("k1", "v1")]));
    let (addr, stop_collector, server) = spawn_collector(collector.clone()).await;

    let config = agent_config(&addr.to_string());
    let (manager, _channel, discovery) = boot_wiring(config);

    let w1 = TestWatcher::new("k1");
    discovery.register_watcher(w1.clone()).unwrap();

    manager.boot().await.unwrap();

    // fresh sync: the initial snapshot lands as a modify
    wait_until("first modify on k1", || !w1.events().is_empty()).await;
    assert_eq!(
        w1.events(),
        vec![ConfigChangeEvent {
            new_value: Some("v1".to_owned()),
            kind: ChangeKind::Modify,
        }]
    );
    wait_until("cursor reaches u-1", || {
        discovery.sync_cursor().as_deref() == Some("u-1")
    })
    .await;

    // every request carries the decorated identity and token
    let first_requests = collector.requests();
    assert!(!first_requests.is_empty());
    assert_eq!(first_requests[0].service, "it-service");
    assert_eq!(first_requests[0].authentication.as_deref(), Some("secret-token"));
    let instance = first_requests[0].instance.clone().expect("instance header");
    assert!(instance.contains('@'), "synthesised name: {instance}");

    // an identical version token short-circuits, even with changed values
    collector.push_response(discovery_response("s-2", "u-1", &[("k1", "v9")]));
    let requests_before = collector.requests().len();
    wait_until("idempotent snapshot consumed", || {
        collector.pending_responses() == 0 && collector.requests().len() > requests_before
    })
    .await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(w1.events().len(), 1, "no notification for unchanged version");
    assert_eq!(discovery.sync_cursor().as_deref(), Some("u-1"));

    // a snapshot omitting the key reifies the deletion
    collector.push_response(discovery_response("s-3", "u-2", &[]));
    wait_until("delete lands on k1", || w1.events().len() == 2).await;
    assert_eq!(
        w1.events()[1],
        ConfigChangeEvent {
            new_value: None,
            kind: ChangeKind::Delete,
        }
    );
    wait_until("cursor reaches u-2", || {
        discovery.sync_cursor().as_deref() == Some("u-2")
    })
    .await;

    // late watcher registration drops the cursor and forces a full response
    let requests_before = collector.requests().len();
    let w2 = TestWatcher::new("k2");
    discovery.register_watcher(w2.clone()).unwrap();
    collector.push_response(discovery_response("s-4", "u-3", &[("k1", "v1"), ("k2", "v2")]));

    wait_until("k2 sees its first value", || !w2.events().is_empty()).await;
    assert_eq!(
        w2.events(),
        vec![ConfigChangeEvent {
            new_value: Some("v2".to_owned()),
            kind: ChangeKind::Modify,
        }]
    );
    wait_until("k1 is repopulated", || w1.events().len() == 3).await;
    assert_eq!(
        w1.events()[2],
        ConfigChangeEvent {
            new_value: Some("v1".to_owned()),
            kind: ChangeKind::Modify,
        }
    );
    assert_eq!(discovery.sync_cursor().as_deref(), Some("u-3"));

    let later_requests: Vec<_> = collector.requests().split_off(requests_before);
    assert!(
        later_requests.iter().any(|request| request.uuid.is_empty()),
        "a request after late registration must carry no cursor"
    );

    manager.shutdown().await;
    let _ = stop_collector.send(());
    let _ = server.await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn channel_failover_selects_a_different_endpoint() {
    let collector_a = Arc::new(ScriptedCollector::default());
    let collector_b = Arc::new(ScriptedCollector::default());
    let (addr_a, stop_a, server_a) = spawn_collector(collector_a.clone()).await;
    let (addr_b, stop_b, server_b) = spawn_collector(collector_b.clone()).await;

    let config = agent_config(&format!("{addr_a},{addr_b}"));
    let identity = Arc::new(AgentIdentity::new("it-service", Some("pinned-instance".to_owned())));
    let channel = ChannelManager::new(config, identity, None);

    // deterministic endpoint selection: first tick lands on A, the
    // post-failure tick on B
    let picks = Arc::new(Mutex::new(VecDeque::from(vec![0usize, 1usize])));
    let scripted = picks.clone();
    channel.set_index_picker(Box::new(move |len| {
        scripted.lock().pop_front().unwrap_or(1) % len
    }));

    struct StatusRecorder {
        label: &'static str,
        events: Arc<Mutex<Vec<(&'static str, ChannelStatus)>>>,
    }
    impl ChannelListener for StatusRecorder {
        fn status_changed(&self, status: ChannelStatus) -> anyhow::Result<()> {
            self.events.lock().push((self.label, status));
            Ok(())
        }
    }

    let events = Arc::new(Mutex::new(Vec::new()));
    channel.add_listener(Arc::new(StatusRecorder {
        label: "first",
        events: events.clone(),
    }));
    channel.add_listener(Arc::new(StatusRecorder {
        label: "second",
        events: events.clone(),
    }));

    channel.clone().start().await.unwrap();
    wait_until("initial connection", || events.lock().len() == 2).await;

    channel.report_error(&Status::unavailable("collector gone"));
    wait_until("failover completes", || events.lock().len() == 6).await;

    assert_eq!(
        events.lock().clone(),
        vec![
            ("first", ChannelStatus::Connected),
            ("second", ChannelStatus::Connected),
            ("first", ChannelStatus::Disconnect),
            ("second", ChannelStatus::Disconnect),
            ("first", ChannelStatus::Connected),
            ("second", ChannelStatus::Connected),
        ]
    );

    // the rebuilt channel points at the second endpoint and still carries
    // both decorator headers
    let callable = channel.callable().expect("channel established");
    let mut client = ConfigurationDiscoveryServiceClient::new(callable);
    client
        .fetch_configurations(Request::new(ConfigurationSyncRequest {
            service: "it-service".to_owned(),
            uuid: String::new(),
        }))
        .await
        .unwrap();

    let seen = collector_b.requests();
    assert_eq!(seen.len(), 1, "call lands on the failover endpoint");
    assert_eq!(seen[0].instance.as_deref(), Some("pinned-instance"));
    assert_eq!(seen[0].authentication.as_deref(), Some("secret-token"));
    assert!(collector_a.requests().is_empty());

    channel.clone().shutdown().await.unwrap();
    let _ = stop_a.send(());
    let _ = stop_b.send(());
    let _ = server_a.await;
    let _ = server_b.await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn upstream_failure_flips_the_uplink_and_recovers() {
    // a collector that is not yet listening: first build fails, the manager
    // keeps retrying until the endpoint appears
    let collector = Arc::new(ScriptedCollector::default());
    collector.push_response(discovery_response("s-1", "u-1", &[("k1", "v1")]));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let config = agent_config(&addr.to_string());
    let (manager, channel, discovery) = boot_wiring(config);
    let w1 = TestWatcher::new("k1");
    discovery.register_watcher(w1.clone()).unwrap();

    manager.boot().await.unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(channel.callable().is_none(), "endpoint is down, no channel yet");

    // bring the collector up on the very address the agent is probing
    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    let incoming = TcpIncoming::from_listener(listener, true, None).unwrap();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let collector_for_server = collector.clone();
    let server = tokio::spawn(async move {
        Server::builder()
            .add_service(ConfigurationDiscoveryServiceServer::new(CollectorSvc(
                collector_for_server,
            )))
            .serve_with_incoming_shutdown(incoming, async move {
                let _ = stop_rx.await;
            })
            .await
            .expect("collector server runs");
    });

    wait_until("sync lands once the endpoint exists", || {
        !w1.events().is_empty()
    })
    .await;
    assert_eq!(
        w1.events()[0],
        ConfigChangeEvent {
            new_value: Some("v1".to_owned()),
            kind: ChangeKind::Modify,
        }
    );

    manager.shutdown().await;
    let _ = stop_tx.send(());
    let _ = server.await;
}
