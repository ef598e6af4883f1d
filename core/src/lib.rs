// Switchboard Core Library
// Agent coordination layer: capability discovery, prioritized delivery, compliance

pub mod config;
pub mod directory;
pub mod envelope;
pub mod monitor;
pub mod queue;
pub mod router;
pub mod storage;
pub mod transport;
pub mod types;

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

// Export core types
pub use config::CoordinatorConfig;
pub use directory::{AgentDirectory, DirectoryConfig, RegistryEvent};
pub use envelope::{MessageEnvelope, MessageType, Priority, Recipient};
pub use monitor::{
    ComplianceEvent, ComplianceMonitor, ComplianceSnapshot, ComplianceSummary, SlaPolicy,
    Violation, ViolationKind,
};
pub use router::{
    DeliveryHandle, DeliveryOutcome, DeliveryRecord, DeliveryStatus, FailureReason,
    MessageRouter, PendingReply, ReplyOutcome, RouterConfig, SendReceipt,
};
pub use storage::{SnapshotStore, StateSnapshot};
pub use transport::{
    AlwaysOnline, CallOutcome, ConnectivityProbe, DeliveryTransport, HttpTransport,
    ResilientClient, RetryPolicy, TransportError,
};
pub use types::{AgentDescriptor, AgentRegistration, DiscoveryQuery, HealthState};

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SwitchboardError {
    /// Malformed envelope or descriptor, rejected at admission.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unknown agent id, or a discovery query that matched nothing.
    #[error("Not found: {0}")]
    NotFound(String),

    /// TTL lapsed, or the agent's registration expired.
    #[error("Expired: {0}")]
    Expired(String),

    /// Network/timeout-class failure that survived the retry policy.
    #[error("Transient error: {0}")]
    Transient(String),

    /// Authorization/format-class failure; never retried.
    #[error("Fatal error: {0}")]
    Fatal(String),

    /// Recipient queue is full; the caller decides when to retry.
    #[error("Overloaded: {0}")]
    Overload(String),

    /// The network is unreachable; retries were short-circuited.
    #[error("Offline: {0}")]
    Offline(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SwitchboardError {
    /// Short machine-readable name used in API bodies and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            SwitchboardError::Validation(_) => "validation",
            SwitchboardError::NotFound(_) => "not_found",
            SwitchboardError::Expired(_) => "expired",
            SwitchboardError::Transient(_) => "transient",
            SwitchboardError::Fatal(_) => "fatal",
            SwitchboardError::Overload(_) => "overload",
            SwitchboardError::Offline(_) => "offline",
            SwitchboardError::Config(_) => "config",
            SwitchboardError::Storage(_) => "storage",
            SwitchboardError::Io(_) => "io",
            SwitchboardError::Serialization(_) => "serialization",
        }
    }

    /// Only transient failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SwitchboardError::Transient(_))
    }
}

pub type Result<T> = std::result::Result<T, SwitchboardError>;

/// Counts produced by [`Coordinator::restore`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub agents: usize,
    pub requeued: usize,
    pub dropped: usize,
}

/// Coordinator runtime: one registry, router and monitor wired together.
///
/// Every component is constructed explicitly and shared by `Arc`, so several
/// independent coordinators can live in one process (and in one test binary).
pub struct Coordinator {
    config: CoordinatorConfig,
    pub directory: Arc<AgentDirectory>,
    pub router: MessageRouter,
    pub monitor: Arc<ComplianceMonitor>,
    store: Option<SnapshotStore>,
    monitor_rx: Option<mpsc::Receiver<ComplianceEvent>>,
    registry_rx: Option<broadcast::Receiver<RegistryEvent>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig, transport: Arc<dyn DeliveryTransport>) -> Result<Self> {
        config.validate()?;

        let directory = Arc::new(AgentDirectory::new(config.directory_config()));
        // Subscribe before anything can register so the monitor sees every event.
        let registry_rx = directory.subscribe();

        let (monitor_tx, monitor_rx) = mpsc::channel(config.monitor_buffer);
        let router = MessageRouter::new(
            config.router_config(),
            Arc::clone(&directory),
            transport,
        )
        .with_monitor(monitor_tx);
        let monitor = Arc::new(ComplianceMonitor::new(
            config.sla_policy(),
            Arc::clone(&directory),
        ));
        let store = config.snapshot_path.clone().map(SnapshotStore::new);

        Ok(Self {
            config,
            directory,
            router,
            monitor,
            store,
            monitor_rx: Some(monitor_rx),
            registry_rx: Some(registry_rx),
            tasks: Vec::new(),
        })
    }

    /// Builds a coordinator that delivers over HTTP.
    pub fn with_http_transport(config: CoordinatorConfig) -> Result<Self> {
        let transport = HttpTransport::new(config.transport_timeout)?;
        Self::new(config, Arc::new(transport))
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub async fn start(&mut self) -> Result<()> {
        info!("Starting Switchboard coordinator...");

        if let Some(store) = &self.store {
            if let Some(snapshot) = store.load().await? {
                let report = self.restore(snapshot);
                info!(
                    agents = report.agents,
                    requeued = report.requeued,
                    dropped = report.dropped,
                    "Recovered state from snapshot"
                );
            }
        }

        if let (Some(deliveries), Some(registry)) = (self.monitor_rx.take(), self.registry_rx.take())
        {
            let monitor = Arc::clone(&self.monitor);
            self.tasks.push(tokio::spawn(async move {
                monitor.run(deliveries, registry).await;
            }));
        }

        let directory = Arc::clone(&self.directory);
        let router = self.router.clone();
        let sweep_interval = self.config.sweep_interval;
        self.tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            loop {
                interval.tick().await;
                directory.sweep();
                router.expire_queued();
                router.reap_departed();
            }
        }));

        if let (Some(store), Some(every)) = (self.store.clone(), self.config.snapshot_interval) {
            let directory = Arc::clone(&self.directory);
            let router = self.router.clone();
            self.tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(every);
                // First tick fires immediately; skip it so startup does not rewrite the file.
                interval.tick().await;
                loop {
                    interval.tick().await;
                    let snapshot = StateSnapshot::capture(&directory, &router);
                    if let Err(e) = store.save(&snapshot).await {
                        warn!(error = %e, "Periodic snapshot failed");
                    }
                }
            }));
        }

        info!("Switchboard coordinator started successfully");
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        info!("Shutting down Switchboard coordinator...");

        // Capture before the router closes its queues so pending work survives.
        if let Some(store) = &self.store {
            store.save(&self.snapshot()).await?;
        }
        self.router.shutdown();
        for task in self.tasks.drain(..) {
            task.abort();
        }

        info!("Switchboard coordinator shut down successfully");
        Ok(())
    }

    /// Captures live agents and non-terminal delivery records.
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot::capture(&self.directory, &self.router)
    }

    /// Rebuilds registry and queues from a snapshot; expired entries are dropped.
    pub fn restore(&self, snapshot: StateSnapshot) -> RestoreReport {
        let agents = self.directory.restore(snapshot.agents);
        let (requeued, dropped) = self.router.restore(snapshot.in_flight);
        RestoreReport {
            agents,
            requeued,
            dropped,
        }
    }
}
