//! ---
//! apm_section: "05-networking-external-interfaces"
//! apm_subsection: "module"
//! apm_type: "source"
//! apm_scope: "code"
//! apm_description: "Collector uplink: managed channel, decorators, health state machine."
//! apm_version: "v0.0.0-prealpha"
//! apm_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use r_apm_common::config::TlsSettings;
use r_apm_common::identity::AgentIdentity;
use tonic::metadata::{Ascii, MetadataMap, MetadataValue};
use tonic::service::interceptor::InterceptedService;
use tonic::service::Interceptor;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint};
use tonic::Status;
use tracing::debug;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A channel with the decorator chain applied; what client stubs are built
/// from.
pub type CallableChannel = InterceptedService<Channel, DecoratorStack>;

/// Failures while building a collector channel.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("invalid collector endpoint {endpoint:?}: {source}")]
    InvalidEndpoint {
        endpoint: String,
        #[source]
        source: tonic::transport::Error,
    },
    #[error("failed to read trusted ca bundle {path:?}: {source}")]
    TrustedCa {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
}

/// Attaches per-call metadata to every outgoing request.
pub trait ChannelDecorator: Send + Sync {
    fn decorate(&self, metadata: &mut MetadataMap) -> Result<(), Status>;
}

/// The decorator chain, applied in registration order on every call.
///
/// A decorator producing non-ASCII metadata fails the call with a `Status`
/// instead of panicking inside the transport stack.
#[derive(Clone)]
pub struct DecoratorStack {
    decorators: Arc<Vec<Arc<dyn ChannelDecorator>>>,
}

impl DecoratorStack {
    pub fn new(decorators: Vec<Arc<dyn ChannelDecorator>>) -> Self {
        Self {
            decorators: Arc::new(decorators),
        }
    }
}

impl Interceptor for DecoratorStack {
    fn call(&mut self, mut request: tonic::Request<()>) -> Result<tonic::Request<()>, Status> {
        for decorator in self.decorators.iter() {
            decorator.decorate(request.metadata_mut())?;
        }
        Ok(request)
    }
}

/// Stamps the agent's service identity and instance name on every call.
///
/// The instance name is read per call: a name synthesised during boot becomes
/// visible without rebuilding the channel.
pub struct AgentIdDecorator {
    identity: Arc<AgentIdentity>,
}

impl AgentIdDecorator {
    pub const SERVICE_NAME_KEY: &'static str = "agent-service-name";
    pub const INSTANCE_ID_KEY: &'static str = "agent-instance-id";

    pub fn new(identity: Arc<AgentIdentity>) -> Self {
        Self { identity }
    }
}

impl ChannelDecorator for AgentIdDecorator {
    fn decorate(&self, metadata: &mut MetadataMap) -> Result<(), Status> {
        metadata.insert(
            Self::SERVICE_NAME_KEY,
            ascii_value(self.identity.service_name())?,
        );
        if let Some(instance) = self.identity.instance_name() {
            metadata.insert(Self::INSTANCE_ID_KEY, ascii_value(&instance)?);
        }
        Ok(())
    }
}

/// Stamps the configured authentication token; a blank token leaves calls
/// undecorated.
pub struct AuthenticationDecorator {
    token: String,
}

impl AuthenticationDecorator {
    pub const AUTHENTICATION_KEY: &'static str = "authentication";

    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl ChannelDecorator for AuthenticationDecorator {
    fn decorate(&self, metadata: &mut MetadataMap) -> Result<(), Status> {
        if self.token.trim().is_empty() {
            return Ok(());
        }
        metadata.insert(Self::AUTHENTICATION_KEY, ascii_value(&self.token)?);
        Ok(())
    }
}

fn ascii_value(value: &str) -> Result<MetadataValue<Ascii>, Status> {
    MetadataValue::try_from(value)
        .map_err(|_| Status::internal(format!("metadata value {value:?} is not valid ascii")))
}

/// An owned handle to one active transport connection.
///
/// At most one of these exists at any moment; the channel manager retires the
/// previous one before dialling a replacement.
pub struct GrpcChannel {
    target: String,
    endpoint: Endpoint,
    channel: Mutex<Channel>,
    decorators: DecoratorStack,
    terminated: AtomicBool,
}

impl GrpcChannel {
    pub fn builder(host: impl Into<String>, port: u16) -> GrpcChannelBuilder {
        GrpcChannelBuilder {
            host: host.into(),
            port,
            tls: TlsSettings::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            decorators: Vec::new(),
        }
    }

    /// The `host:port` this channel was dialled against.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Snapshot of the decorated channel for building client stubs.
    pub fn callable(&self) -> CallableChannel {
        InterceptedService::new(self.channel.lock().clone(), self.decorators.clone())
    }

    /// Report confirmed readiness.
    ///
    /// The transport exposes no passive connectivity state, so readiness can
    /// only be confirmed by re-dialling; without `request_connection` this
    /// conservatively reports not-ready and leaves the decision to a later,
    /// forced probe. A successful forced dial replaces the inner transport.
    pub async fn probe(&self, request_connection: bool) -> bool {
        if self.terminated.load(Ordering::Acquire) {
            return false;
        }
        if !request_connection {
            return false;
        }
        match self.endpoint.connect().await {
            Ok(fresh) => {
                *self.channel.lock() = fresh;
                true
            }
            Err(err) => {
                debug!(target = %self.target, error = %err, "connectivity probe failed");
                false
            }
        }
    }

    /// Mark this channel retired. Outstanding clones of the inner transport
    /// drain on their own; the flag keeps probes from resurrecting it.
    pub fn shut_down(&self) {
        self.terminated.store(true, Ordering::Release);
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }
}

/// Builder assembling transport mode and the decorator chain before dialling.
pub struct GrpcChannelBuilder {
    host: String,
    port: u16,
    tls: TlsSettings,
    connect_timeout: Duration,
    decorators: Vec<Arc<dyn ChannelDecorator>>,
}

impl GrpcChannelBuilder {
    /// Transport security; plaintext when disabled.
    pub fn tls(mut self, settings: TlsSettings) -> Self {
        self.tls = settings;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Append a decorator; decoration runs in registration order.
    pub fn decorator(mut self, decorator: Arc<dyn ChannelDecorator>) -> Self {
        self.decorators.push(decorator);
        self
    }

    /// Dial the endpoint and wrap it with the decorator chain.
    pub async fn connect(self) -> Result<GrpcChannel, ChannelError> {
        let target = format!("{}:{}", self.host, self.port);
        let scheme = if self.tls.enabled { "https" } else { "http" };
        let mut endpoint = Endpoint::from_shared(format!("{scheme}://{target}"))
            .map_err(|source| ChannelError::InvalidEndpoint {
                endpoint: target.clone(),
                source,
            })?
            .connect_timeout(self.connect_timeout);

        if self.tls.enabled {
            let mut tls = ClientTlsConfig::new().domain_name(self.host.clone());
            if let Some(path) = &self.tls.trusted_ca_path {
                if !path.as_os_str().is_empty() {
                    let pem =
                        std::fs::read(path).map_err(|source| ChannelError::TrustedCa {
                            path: path.display().to_string(),
                            source,
                        })?;
                    tls = tls.ca_certificate(Certificate::from_pem(pem));
                }
            }
            endpoint = endpoint.tls_config(tls)?;
        }

        let channel = endpoint.connect().await?;
        Ok(GrpcChannel {
            target,
            endpoint,
            channel: Mutex::new(channel),
            decorators: DecoratorStack::new(self.decorators),
            terminated: AtomicBool::new(false),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decorators_apply_in_registration_order() {
        struct Tagger(&'static str, &'static str);
        impl ChannelDecorator for Tagger {
            fn decorate(&self, metadata: &mut MetadataMap) -> Result<(), Status> {
                metadata.insert(self.0, MetadataValue::from_static(self.1));
                // later decorators can observe earlier ones
                metadata.insert("last-writer", MetadataValue::from_static(self.1));
                Ok(())
            }
        }

        let mut stack = DecoratorStack::new(vec![
            Arc::new(Tagger("first", "a")),
            Arc::new(Tagger("second", "b")),
        ]);
        let request = stack.call(tonic::Request::new(())).unwrap();
        assert_eq!(request.metadata().get("first").unwrap(), "a");
        assert_eq!(request.metadata().get("second").unwrap(), "b");
        assert_eq!(request.metadata().get("last-writer").unwrap(), "b");
    }

    #[test]
    fn agent_id_decorator_reads_identity_late() {
        let identity = Arc::new(AgentIdentity::new("checkout", None));
        let decorator = AgentIdDecorator::new(identity.clone());

        let mut metadata = MetadataMap::new();
        decorator.decorate(&mut metadata).unwrap();
        assert_eq!(
            metadata.get(AgentIdDecorator::SERVICE_NAME_KEY).unwrap(),
            "checkout"
        );
        assert!(metadata.get(AgentIdDecorator::INSTANCE_ID_KEY).is_none());

        identity.set_instance_name("pod-42");
        let mut metadata = MetadataMap::new();
        decorator.decorate(&mut metadata).unwrap();
        assert_eq!(
            metadata.get(AgentIdDecorator::INSTANCE_ID_KEY).unwrap(),
            "pod-42"
        );
    }

    #[test]
    fn blank_token_skips_the_authentication_header() {
        let mut metadata = MetadataMap::new();
        AuthenticationDecorator::new("  ")
            .decorate(&mut metadata)
            .unwrap();
        assert!(metadata
            .get(AuthenticationDecorator::AUTHENTICATION_KEY)
            .is_none());

        AuthenticationDecorator::new("token-1")
            .decorate(&mut metadata)
            .unwrap();
        assert_eq!(
            metadata
                .get(AuthenticationDecorator::AUTHENTICATION_KEY)
                .unwrap(),
            "token-1"
        );
    }

    #[test]
    fn non_ascii_metadata_becomes_a_status_error() {
        let mut metadata = MetadataMap::new();
        let err = AuthenticationDecorator::new("jeton-privé")
            .decorate(&mut metadata)
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::Internal);
    }
}
