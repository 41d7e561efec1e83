//! ---
//! apm_section: "01-core-functionality"
//! apm_subsection: "module"
//! apm_type: "source"
//! apm_scope: "code"
//! apm_description: "Agent runtime core: lifecycle, uplink, commands, dynamic configuration."
//! apm_version: "v0.0.0-prealpha"
//! apm_owner: "tbd"
//! ---
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use r_apm_common::identity::{generate_instance_name, AgentIdentity};
use tracing::info;

use crate::boot::{BootService, ServiceKind};

/// Synthesises the agent instance name when configuration leaves it absent.
///
/// Boots before everything else so the identity is complete by the time the
/// channel decorators first read it.
pub struct InstanceNameGenerator {
    identity: Arc<AgentIdentity>,
}

impl InstanceNameGenerator {
    pub const KIND: ServiceKind = ServiceKind("instance-name-generator");

    pub fn new(identity: Arc<AgentIdentity>) -> Self {
        Self { identity }
    }
}

#[async_trait]
impl BootService for InstanceNameGenerator {
    fn kind(&self) -> ServiceKind {
        Self::KIND
    }

    fn priority(&self) -> i32 {
        i32::MIN
    }

    async fn prepare(self: Arc<Self>) -> Result<()> {
        if self.identity.instance_name().is_none() {
            let name = generate_instance_name();
            info!(instance_name = %name, "synthesised agent instance name");
            self.identity.set_instance_name(name);
        }
        Ok(())
    }

    async fn start(self: Arc<Self>) -> Result<()> {
        Ok(())
    }

    async fn on_complete(self: Arc<Self>) -> Result<()> {
        Ok(())
    }

    async fn shutdown(self: Arc<Self>) -> Result<()> {
        Ok(())
    }
}
