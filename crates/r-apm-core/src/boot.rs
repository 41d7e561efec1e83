//! ---
//! apm_section: "01-core-functionality"
//! apm_subsection: "module"
//! apm_type: "source"
//! apm_scope: "code"
//! apm_description: "Agent runtime core: lifecycle, uplink, commands, dynamic configuration."
//! apm_version: "v0.0.0-prealpha"
//! apm_owner: "tbd"
//! ---
use std::cmp::Reverse;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::RwLock;
use tracing::{debug, error, info};

/// Static identity of a boot-participating service, used for registration,
/// resolution, and lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceKind(pub &'static str);

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Role a discovered service plays during resolution.
///
/// A `Default` yields to any other implementation of its kind. A `Sole`
/// implementation must be the only one of its kind. An `Override` replaces
/// the default for the named kind, and also pre-empts any default discovered
/// after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceRole {
    Sole,
    Default,
    Override(ServiceKind),
}

/// A long-lived in-process service participating in the boot sequence.
///
/// `prepare` and `start` run in ascending priority order (lower boots
/// earlier), `on_complete` in discovery order, `shutdown` in descending
/// priority order. Lifecycle methods receive `Arc<Self>` so a service can
/// hand itself out as a listener during its own boot phases.
#[async_trait]
pub trait BootService: Send + Sync + 'static {
    fn kind(&self) -> ServiceKind;

    fn role(&self) -> ServiceRole {
        ServiceRole::Sole
    }

    fn priority(&self) -> i32 {
        0
    }

    async fn prepare(self: Arc<Self>) -> Result<()>;

    async fn start(self: Arc<Self>) -> Result<()>;

    async fn on_complete(self: Arc<Self>) -> Result<()>;

    async fn shutdown(self: Arc<Self>) -> Result<()>;
}

/// Fatal resolution failures raised by [`ServiceManager::boot`].
#[derive(Debug, thiserror::Error)]
pub enum BootError {
    #[error("duplicate service registered for kind {0}")]
    DuplicateService(ServiceKind),
    #[error("override conflict for kind {0}: the active entry is not a default implementation")]
    OverrideConflict(ServiceKind),
}

#[derive(Default)]
struct ManagerInner {
    discovered: Vec<Arc<dyn BootService>>,
    active: IndexMap<ServiceKind, Arc<dyn BootService>>,
}

/// Owns the set of long-lived services: discovery, resolution into one
/// active instance per kind, boot-ordered startup, and reverse-ordered
/// shutdown.
///
/// Lifecycle failures are logged per service and never abort the remaining
/// services in a phase; only resolution conflicts abort `boot`.
#[derive(Default)]
pub struct ServiceManager {
    inner: RwLock<ManagerInner>,
}

impl ServiceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a discovered service. Order of registration is the discovery
    /// order used by resolution and `on_complete`.
    pub fn register(&self, service: Arc<dyn BootService>) {
        debug!(service = %service.kind(), role = ?service.role(), "discovered service");
        self.inner.write().discovered.push(service);
    }

    /// Resolve the active service set, then run `prepare`, `start`, and
    /// `on_complete` across it.
    pub async fn boot(&self) -> Result<(), BootError> {
        let active = {
            let mut inner = self.inner.write();
            let active = resolve(&inner.discovered)?;
            inner.active = active.clone();
            active
        };
        info!(services = active.len(), "booting agent services");

        let mut by_priority: Vec<_> = active.values().cloned().collect();
        by_priority.sort_by_key(|service| service.priority());

        for service in &by_priority {
            if let Err(err) = service.clone().prepare().await {
                error!(service = %service.kind(), error = %err, "service prepare failed");
            }
        }
        for service in &by_priority {
            if let Err(err) = service.clone().start().await {
                error!(service = %service.kind(), error = %err, "service start failed");
            }
        }
        for service in active.values() {
            if let Err(err) = service.clone().on_complete().await {
                error!(service = %service.kind(), error = %err, "service post-boot hook failed");
            }
        }
        Ok(())
    }

    /// Stop every active service in descending priority order.
    pub async fn shutdown(&self) {
        let mut by_priority: Vec<_> = self.inner.read().active.values().cloned().collect();
        by_priority.sort_by_key(|service| Reverse(service.priority()));
        for service in by_priority {
            if let Err(err) = service.clone().shutdown().await {
                error!(service = %service.kind(), error = %err, "service shutdown failed");
            }
        }
        info!("agent services stopped");
    }

    /// Look up the active service for a kind.
    pub fn find(&self, kind: ServiceKind) -> Option<Arc<dyn BootService>> {
        self.inner.read().active.get(&kind).cloned()
    }
}

/// Resolve discovered services into one active instance per kind.
fn resolve(
    discovered: &[Arc<dyn BootService>],
) -> Result<IndexMap<ServiceKind, Arc<dyn BootService>>, BootError> {
    let mut active: IndexMap<ServiceKind, Arc<dyn BootService>> = IndexMap::new();

    for service in discovered {
        match service.role() {
            ServiceRole::Default => {
                // Yields to whatever is already installed, including an
                // override discovered earlier.
                active.entry(service.kind()).or_insert_with(|| service.clone());
            }
            ServiceRole::Sole => {
                if active.contains_key(&service.kind()) {
                    return Err(BootError::DuplicateService(service.kind()));
                }
                active.insert(service.kind(), service.clone());
            }
            ServiceRole::Override(target) => {
                let occupant_role = active.get(&target).map(|occupant| occupant.role());
                match occupant_role {
                    // Replaces the default in place; an override that arrived
                    // first also pre-empts any default discovered later.
                    Some(ServiceRole::Default) | None => {
                        active.insert(target, service.clone());
                    }
                    Some(_) => return Err(BootError::OverrideConflict(target)),
                }
            }
        }
    }

    Ok(active)
}
