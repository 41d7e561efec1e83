//! ---
//! apm_section: "02-commands-scheduling"
//! apm_subsection: "module"
//! apm_type: "source"
//! apm_scope: "code"
//! apm_description: "Command scheduling: queue, dedup cache, executor dispatch."
//! apm_version: "v0.0.0-prealpha"
//! apm_owner: "tbd"
//! ---
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use indexmap::IndexMap;
use r_apm_proto::AgentCommand;
use tracing::warn;

use crate::boot::{BootService, ServiceKind, ServiceRole};
use crate::discovery::ConfigurationDiscoveryService;

/// Error surfaced by a command executor. The scheduler logs it and moves on.
#[derive(Debug, thiserror::Error)]
#[error("command {kind} execution failed: {message}")]
pub struct CommandExecutionError {
    pub kind: &'static str,
    pub message: String,
}

impl CommandExecutionError {
    pub fn new(kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Handles one kind of collector-issued command.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, command: &AgentCommand) -> Result<(), CommandExecutionError>;
}

/// Maps command kinds to their executors.
///
/// Executors are registered directly at wiring time; the map is immutable
/// afterwards. A kind without an executor is logged and skipped so the rest
/// of the queue keeps flowing.
pub struct CommandExecutorService {
    executors: IndexMap<&'static str, Arc<dyn CommandExecutor>>,
}

impl CommandExecutorService {
    pub const KIND: ServiceKind = ServiceKind("command-executor");

    pub fn new() -> Self {
        Self {
            executors: IndexMap::new(),
        }
    }

    pub fn with_executor(
        mut self,
        kind: &'static str,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        self.executors.insert(kind, executor);
        self
    }

    pub async fn execute(&self, command: &AgentCommand) -> Result<(), CommandExecutionError> {
        match self.executors.get(command.kind()) {
            Some(executor) => executor.execute(command).await,
            None => {
                warn!(kind = command.kind(), "no executor registered for command kind, skipped");
                Ok(())
            }
        }
    }
}

impl Default for CommandExecutorService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BootService for CommandExecutorService {
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
        Ok(())
    }

    async fn on_complete(self: Arc<Self>) -> Result<()> {
        Ok(())
    }

    async fn shutdown(self: Arc<Self>) -> Result<()> {
        Ok(())
    }
}

/// Routes configuration discovery commands back into the discovery service.
pub struct ConfigurationDiscoveryCommandExecutor {
    discovery: Arc<ConfigurationDiscoveryService>,
}

impl ConfigurationDiscoveryCommandExecutor {
    pub fn new(discovery: Arc<ConfigurationDiscoveryService>) -> Self {
        Self { discovery }
    }
}

#[async_trait]
impl CommandExecutor for ConfigurationDiscoveryCommandExecutor {
    async fn execute(&self, command: &AgentCommand) -> Result<(), CommandExecutionError> {
        let AgentCommand::ConfigurationDiscovery(command) = command;
        self.discovery.handle_discovery_command(command);
        Ok(())
    }
}
