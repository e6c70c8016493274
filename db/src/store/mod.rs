mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgJobStore;

use async_trait::async_trait;
use uuid::Uuid;

use crate::dtos::{ExecutionUnit, Job, JobSignal, Phase};
use crate::entities::{JobRow, UnitRow};
use crate::StoreError;

/// Persistence boundary for jobs and execution units.
///
/// Reads hand back raw rows so callers decide what to do with values that fail
/// to decode; writes take the typed model.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Non-terminal jobs ordered by `started_at` (unset last), then submission key.
    async fn jobs_in_run_order(&self) -> Result<Vec<JobRow>, StoreError>;

    /// Units that are not retired yet.
    async fn active_units(&self) -> Result<Vec<UnitRow>, StoreError>;

    /// Units with a non-empty task handle.
    async fn units_with_task_handle(&self) -> Result<Vec<UnitRow>, StoreError>;

    async fn find_job(&self, id: Uuid) -> Result<Option<JobRow>, StoreError>;

    /// Inserts a new job and returns it with its numeric key assigned.
    async fn insert_job(&self, job: &Job) -> Result<Job, StoreError>;

    async fn save_job(&self, job: &Job) -> Result<(), StoreError>;

    async fn insert_unit(&self, unit: &ExecutionUnit) -> Result<(), StoreError>;

    async fn save_unit(&self, unit: &ExecutionUnit) -> Result<(), StoreError>;

    /// Records a pending signal. Returns `false` when the job does not exist.
    async fn set_signal(&self, id: Uuid, signal: Option<JobSignal>) -> Result<bool, StoreError>;

    /// Overwrites the stored phase code. Used for explicit repairs only.
    async fn set_phase(&self, id: Uuid, phase: Phase) -> Result<bool, StoreError>;
}

pub(crate) fn terminal_codes() -> [i16; 4] {
    Phase::TERMINAL.map(Phase::code)
}
