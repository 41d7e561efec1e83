//! ---
//! apm_section: "01-core-functionality"
//! apm_subsection: "module"
//! apm_type: "source"
//! apm_scope: "code"
//! apm_description: "Shared primitives and utilities for the agent runtime."
//! apm_version: "v0.0.0-prealpha"
//! apm_owner: "tbd"
//! ---
use std::net::{IpAddr, Ipv4Addr, UdpSocket};

use parking_lot::RwLock;
use uuid::Uuid;

use crate::config::AgentSettings;

/// Identity of this agent instance: the logical service name from
/// configuration plus a late-bound instance name.
///
/// The instance name stays absent until either configuration supplies one or
/// the boot sequence synthesises it; channel decorators read it per call, so
/// a name set during boot is picked up without rebuilding the channel.
#[derive(Debug)]
pub struct AgentIdentity {
    service_name: String,
    instance_name: RwLock<Option<String>>,
}

impl AgentIdentity {
    pub fn new(service_name: impl Into<String>, instance_name: Option<String>) -> Self {
        let instance_name = instance_name.filter(|name| !name.trim().is_empty());
        Self {
            service_name: service_name.into(),
            instance_name: RwLock::new(instance_name),
        }
    }

    pub fn from_settings(settings: &AgentSettings) -> Self {
        Self::new(settings.service_name.clone(), settings.instance_name.clone())
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn instance_name(&self) -> Option<String> {
        self.instance_name.read().clone()
    }

    pub fn set_instance_name(&self, name: impl Into<String>) {
        *self.instance_name.write() = Some(name.into());
    }
}

/// Synthesise an instance name of the form `<uuid-without-dashes>@<ipv4>`.
pub fn generate_instance_name() -> String {
    format!("{}@{}", Uuid::new_v4().simple(), local_ipv4())
}

/// Best-effort local IPv4 discovery: a connected UDP socket exposes the
/// address the OS would route outbound traffic from, without sending
/// anything. Falls back to loopback on airgapped hosts.
fn local_ipv4() -> IpAddr {
    let probe = || -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("8.8.8.8:53")?;
        Ok(socket.local_addr()?.ip())
    };
    probe().unwrap_or_else(|_| IpAddr::V4(Ipv4Addr::LOCALHOST))
}
