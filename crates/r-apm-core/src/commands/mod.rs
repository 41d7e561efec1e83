//! ---
//! apm_section: "02-commands-scheduling"
//! apm_subsection: "module"
//! apm_type: "source"
//! apm_scope: "code"
//! apm_description: "Command scheduling: queue, dedup cache, executor dispatch."
//! apm_version: "v0.0.0-prealpha"
//! apm_owner: "tbd"
//! ---
//! The command scheduler: collects command batches pulled off the wire,
//! suppresses duplicates, and feeds a dedicated dispatch worker.

mod cache;
mod executor;

pub use cache::SerialNumberCache;
pub use executor::{
    CommandExecutionError, CommandExecutor, CommandExecutorService,
    ConfigurationDiscoveryCommandExecutor,
};

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use r_apm_metrics::AgentMetrics;
use r_apm_proto::{AgentCommand, Commands};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::boot::{BootService, ServiceKind, ServiceRole};

/// Pending commands the queue will hold before overflowing producers start
/// dropping.
pub const COMMAND_QUEUE_CAPACITY: usize = 64;

/// Receives command batches, de-duplicates them, and dispatches each command
/// to its executor on a dedicated worker.
///
/// Duplicate serials are suppressed at two gates: on `receive` (against the
/// executed-serial cache and within the incoming batch) and again after
/// dequeue, which closes the race with a duplicate that was enqueued before
/// its twin finished executing. A serial enters the cache only after its
/// dispatch returned cleanly.
pub struct CommandService {
    executors: Arc<CommandExecutorService>,
    serials: SerialNumberCache,
    queue_tx: mpsc::Sender<AgentCommand>,
    queue_rx: Mutex<Option<mpsc::Receiver<AgentCommand>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    metrics: Option<AgentMetrics>,
}

impl CommandService {
    pub const KIND: ServiceKind = ServiceKind("command-scheduler");

    pub fn new(executors: Arc<CommandExecutorService>, metrics: Option<AgentMetrics>) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        Arc::new(Self {
            executors,
            serials: SerialNumberCache::new(),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            worker: Mutex::new(None),
            shutdown: Mutex::new(None),
            metrics,
        })
    }

    /// Ingest a batch pulled off the wire. Never blocks the caller: commands
    /// that do not fit, do not decode, or were already executed are logged
    /// and dropped.
    pub fn receive(&self, batch: &Commands) {
        let mut batch_serials: HashSet<String> = HashSet::new();
        for raw in &batch.commands {
            let command = match AgentCommand::try_from(raw) {
                Ok(command) => command,
                Err(err) => {
                    warn!(error = %err, "received undispatchable command");
                    continue;
                }
            };

            let duplicate = self.serials.contains(command.serial_number())
                || !batch_serials.insert(command.serial_number().to_owned());
            if duplicate {
                warn!(
                    kind = command.kind(),
                    serial = command.serial_number(),
                    "command already executed, ignored"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.inc_command_deduplicated();
                }
                continue;
            }

            match self.queue_tx.try_send(command) {
                Ok(()) => {
                    if let Some(metrics) = &self.metrics {
                        metrics.inc_command_received();
                    }
                }
                Err(TrySendError::Full(command)) => {
                    warn!(
                        kind = command.kind(),
                        serial = command.serial_number(),
                        "command queue full, dropping command"
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.inc_command_dropped();
                    }
                }
                Err(TrySendError::Closed(command)) => {
                    warn!(
                        kind = command.kind(),
                        "command scheduler stopped, dropping command"
                    );
                }
            }
        }
    }
}

#[async_trait]
impl BootService for CommandService {
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
        let Some(mut queue) = self.queue_rx.lock().take() else {
            warn!("command scheduler already started");
            return Ok(());
        };

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        *self.shutdown.lock() = Some(shutdown_tx);

        let executors = self.executors.clone();
        let serials = self.serials.clone();
        let metrics = self.metrics.clone();
        let worker = tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    received = queue.recv() => {
                        let Some(command) = received else { break };
                        if serials.contains(command.serial_number()) {
                            debug!(
                                kind = command.kind(),
                                serial = command.serial_number(),
                                "command already executed, skipped after dequeue"
                            );
                            continue;
                        }
                        match executors.execute(&command).await {
                            Ok(()) => {
                                serials.add(command.serial_number());
                                if let Some(metrics) = &metrics {
                                    metrics.inc_command_executed(command.kind());
                                }
                            }
                            Err(err) => {
                                error!(kind = command.kind(), error = %err, "command execution failed");
                                if let Some(metrics) = &metrics {
                                    metrics.inc_command_failure(command.kind());
                                }
                            }
                        }
                    }
                }
            }
            // Drain whatever is still queued so producers observe the close
            // instead of a silently full queue.
            queue.close();
            while queue.try_recv().is_ok() {}
            debug!(worker = "command-scheduler", "worker stopped");
        });
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
