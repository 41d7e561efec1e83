//! ---
//! apm_section: "05-networking-external-interfaces"
//! apm_subsection: "module"
//! apm_type: "source"
//! apm_scope: "code"
//! apm_description: "Wire protocol definitions for the collector uplink."
//! apm_version: "v0.0.0-prealpha"
//! apm_owner: "tbd"
//! ---
//! Generated wire types for the collector control plane, plus the typed
//! command model the runtime dispatches on.

pub mod command;

#[allow(missing_docs)]
pub mod proto {
    tonic::include_proto!("apm");
}

pub use command::{
    AgentCommand, CommandDecodeError, ConfigurationDiscoveryCommand, SERIAL_NUMBER_KEY, UUID_KEY,
};
pub use proto::configuration_discovery_service_client::ConfigurationDiscoveryServiceClient;
pub use proto::{Command, Commands, ConfigurationSyncRequest, KeyStringValuePair};
