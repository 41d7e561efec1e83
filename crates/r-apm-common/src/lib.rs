//! ---
//! apm_section: "01-core-functionality"
//! apm_subsection: "module"
//! apm_type: "source"
//! apm_scope: "code"
//! apm_description: "Shared primitives and utilities for the agent runtime."
//! apm_version: "v0.0.0-prealpha"
//! apm_owner: "tbd"
//! ---
//! Core shared primitives for the R-APM agent workspace.
//! This crate exposes configuration loading, tracing initialisation,
//! agent identity management, and guarded worker helpers consumed
//! across the workspace.

pub mod config;
pub mod guard;
pub mod identity;
pub mod logging;

pub use config::{
    AgentConfig, AgentSettings, CollectorSettings, LoggingConfig, MetricsConfig, TlsSettings,
};
pub use guard::spawn_periodic;
pub use identity::{generate_instance_name, AgentIdentity};
pub use logging::{init_tracing, LogFormat};
