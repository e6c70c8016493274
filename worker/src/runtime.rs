use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use db::dtos::UnitState;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::RuntimeError;

/// Label marking units owned by this deployment. Its value is the deployment label.
pub const LABEL_MANAGED_BY: &str = "simulation.managed-by";
pub const LABEL_JOB: &str = "simulation.job";
pub const LABEL_UNIT: &str = "simulation.unit";
pub const LABEL_STAGE: &str = "simulation.stage";

/// What to run for one execution unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitSpec {
    pub name: String,
    /// Container image or workflow definition reference.
    pub image: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// `host:container[:mode]` bindings.
    pub binds: Vec<String>,
    pub labels: BTreeMap<String, String>,
}

impl UnitSpec {
    pub fn unit_id(&self) -> Option<Uuid> {
        self.labels.get(LABEL_UNIT)?.parse().ok()
    }
}

/// One unit as reported by the runtime's listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub external_id: String,
    pub observed_state: UnitState,
    pub exit_code: Option<i64>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub log_tail: Option<String>,
    pub labels: BTreeMap<String, String>,
}

impl SnapshotEntry {
    pub fn new(external_id: impl Into<String>, observed_state: UnitState) -> Self {
        Self {
            external_id: external_id.into(),
            observed_state,
            exit_code: None,
            started_at: None,
            stopped_at: None,
            log_tail: None,
            labels: BTreeMap::new(),
        }
    }

    pub fn with_exit_code(mut self, exit_code: i64) -> Self {
        self.exit_code = Some(exit_code);
        self
    }

    pub fn with_label(mut self, key: &str, value: impl Into<String>) -> Self {
        self.labels.insert(key.to_string(), value.into());
        self
    }

    /// Local unit this entry was created for, according to its labels.
    pub fn claimed_unit(&self) -> Option<Uuid> {
        self.labels.get(LABEL_UNIT)?.parse().ok()
    }
}

/// Contract every compute backend (Docker, workflow engine) implements.
///
/// Mutating calls are idempotent: stopping a stopped unit or removing a
/// removed one succeeds.
#[async_trait]
pub trait RuntimeClient: Send + Sync {
    async fn list_units(&self) -> Result<Vec<SnapshotEntry>, RuntimeError>;

    async fn create_unit(&self, spec: &UnitSpec) -> Result<String, RuntimeError>;

    async fn start_unit(&self, external_id: &str) -> Result<(), RuntimeError>;

    async fn stop_unit(&self, external_id: &str, timeout: Duration) -> Result<(), RuntimeError>;

    async fn remove_unit(&self, external_id: &str, force: bool) -> Result<(), RuntimeError>;

    async fn fetch_log(&self, external_id: &str, tail_lines: usize) -> Result<String, RuntimeError>;
}
