//! Snapshot persistence for restart recovery.
//!
//! The whole coordinator state worth keeping (live agents plus non-terminal
//! delivery records) fits in one JSON document. Writes go to a sibling temp
//! file that is renamed over the target, so a crash mid-write leaves the
//! previous snapshot intact.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::directory::AgentDirectory;
use crate::router::{DeliveryRecord, MessageRouter};
use crate::types::AgentDescriptor;
use crate::{Result, SwitchboardError};

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub version: u32,
    pub taken_at: DateTime<Utc>,
    pub agents: Vec<AgentDescriptor>,
    pub in_flight: Vec<DeliveryRecord>,
}

impl StateSnapshot {
    pub fn capture(directory: &AgentDirectory, router: &MessageRouter) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            taken_at: Utc::now(),
            agents: directory.live_agents(),
            in_flight: router.in_flight_records(),
        }
    }
}

/// JSON file store for [`StateSnapshot`]s.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn save(&self, snapshot: &StateSnapshot) -> Result<()> {
        let body = serde_json::to_vec_pretty(snapshot)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(
            target: "storage",
            path = %self.path.display(),
            agents = snapshot.agents.len(),
            in_flight = snapshot.in_flight.len(),
            "Snapshot written"
        );
        Ok(())
    }

    /// `Ok(None)` when no snapshot has been written yet.
    pub async fn load(&self) -> Result<Option<StateSnapshot>> {
        let body = match tokio::fs::read(&self.path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let snapshot: StateSnapshot = serde_json::from_slice(&body)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(SwitchboardError::Storage(format!(
                "unsupported snapshot version {} in {}",
                snapshot.version,
                self.path.display()
            )));
        }
        info!(target: "storage", path = %self.path.display(), taken_at = %snapshot.taken_at, "Snapshot loaded");
        Ok(Some(snapshot))
    }
}
