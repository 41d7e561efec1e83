//! ---
//! apm_section: "01-core-functionality"
//! apm_subsection: "module"
//! apm_type: "source"
//! apm_scope: "code"
//! apm_description: "Agent runtime core: lifecycle, uplink, commands, dynamic configuration."
//! apm_version: "v0.0.0-prealpha"
//! apm_owner: "tbd"
//! ---
//! Runtime core of the R-APM agent.
//!
//! Four subsystems cooperate here: the [`boot`] service manager discovers and
//! orders long-lived services; the [`remote`] channel manager maintains the
//! collector uplink and fans out its state transitions; the [`commands`]
//! scheduler dispatches collector-issued commands with at-most-once
//! semantics; and the [`discovery`] service keeps registered watchers in sync
//! with collector-side configuration.

pub mod boot;
pub mod commands;
pub mod discovery;
pub mod instance;
pub mod remote;

pub use boot::{BootError, BootService, ServiceKind, ServiceManager, ServiceRole};
pub use commands::{
    CommandExecutionError, CommandExecutor, CommandExecutorService, CommandService,
    ConfigurationDiscoveryCommandExecutor, SerialNumberCache,
};
pub use discovery::{
    ChangeKind, ConfigChangeEvent, ConfigChangeWatcher, ConfigurationDiscoveryService,
    DiscoveryError,
};
pub use instance::InstanceNameGenerator;
pub use remote::{
    is_network_error, AgentIdDecorator, AuthenticationDecorator, CallableChannel, ChannelError,
    ChannelListener, ChannelManager, ChannelStatus, GrpcChannel,
};
