use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{terminal_codes, JobStore};
use crate::dtos::{ExecutionUnit, Job, JobSignal, Phase, UnitState};
use crate::entities::{JobRow, UnitRow};
use crate::StoreError;

#[derive(Default)]
struct Tables {
    jobs: Vec<JobRow>,
    units: Vec<UnitRow>,
    next_key: i64,
}

/// Row store kept in process memory. Behaves like [`super::PgJobStore`],
/// including storing raw rows, so corrupted values can be planted in tests.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a raw row as-is.
    pub async fn insert_job_row(&self, row: JobRow) {
        self.tables.lock().await.jobs.push(row);
    }

    pub async fn job_row(&self, id: Uuid) -> Option<JobRow> {
        let tables = self.tables.lock().await;
        tables.jobs.iter().find(|row| row.id == id).cloned()
    }

    pub async fn job(&self, id: Uuid) -> Option<Job> {
        self.job_row(id).await.and_then(|row| Job::try_from(row).ok())
    }

    /// All units of a job, retired ones included, in creation order.
    pub async fn units_of(&self, job_id: Uuid) -> Vec<ExecutionUnit> {
        let tables = self.tables.lock().await;
        tables
            .units
            .iter()
            .filter(|row| row.job_id == job_id)
            .filter_map(|row| ExecutionUnit::try_from(row.clone()).ok())
            .collect()
    }

    pub async fn unit_count(&self) -> usize {
        self.tables.lock().await.units.len()
    }
}

fn is_active(row: &UnitRow) -> bool {
    let non_existent = UnitState::NonExistent.as_str();
    row.observed_state != non_existent
        || (row.desired_state != non_existent && row.desired_state != UnitState::Exited.as_str())
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn jobs_in_run_order(&self) -> Result<Vec<JobRow>, StoreError> {
        let terminal = terminal_codes();
        let tables = self.tables.lock().await;
        let mut rows: Vec<JobRow> = tables
            .jobs
            .iter()
            .filter(|row| !terminal.contains(&row.phase))
            .cloned()
            .collect();

        rows.sort_by(|a, b| match (a.started_at, b.started_at) {
            (Some(left), Some(right)) => left.cmp(&right).then(a.key.cmp(&b.key)),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.key.cmp(&b.key),
        });

        Ok(rows)
    }

    async fn active_units(&self) -> Result<Vec<UnitRow>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.units.iter().filter(|row| is_active(row)).cloned().collect())
    }

    async fn units_with_task_handle(&self) -> Result<Vec<UnitRow>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .units
            .iter()
            .filter(|row| row.task_handle.is_some())
            .cloned()
            .collect())
    }

    async fn find_job(&self, id: Uuid) -> Result<Option<JobRow>, StoreError> {
        Ok(self.job_row(id).await)
    }

    async fn insert_job(&self, job: &Job) -> Result<Job, StoreError> {
        let mut tables = self.tables.lock().await;
        tables.next_key += 1;

        let mut job = job.clone();
        job.key = tables.next_key;
        tables.jobs.push(JobRow::from(&job));

        Ok(job)
    }

    async fn save_job(&self, job: &Job) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let Some(row) = tables.jobs.iter_mut().find(|row| row.id == job.id) else {
            return Err(StoreError::NotFound {
                entity: "job",
                id: job.id.to_string(),
            });
        };
        *row = JobRow::from(job);

        Ok(())
    }

    async fn insert_unit(&self, unit: &ExecutionUnit) -> Result<(), StoreError> {
        self.tables.lock().await.units.push(UnitRow::from(unit));
        Ok(())
    }

    async fn save_unit(&self, unit: &ExecutionUnit) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let Some(row) = tables.units.iter_mut().find(|row| row.id == unit.id) else {
            return Err(StoreError::NotFound {
                entity: "execution unit",
                id: unit.id.to_string(),
            });
        };
        *row = UnitRow::from(unit);

        Ok(())
    }

    async fn set_signal(&self, id: Uuid, signal: Option<JobSignal>) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        let Some(row) = tables.jobs.iter_mut().find(|row| row.id == id) else {
            return Ok(false);
        };
        row.signal = signal.map(|signal| signal.as_str().to_string());

        Ok(true)
    }

    async fn set_phase(&self, id: Uuid, phase: Phase) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        let Some(row) = tables.jobs.iter_mut().find(|row| row.id == id) else {
            return Ok(false);
        };
        row.phase = phase.code();

        Ok(true)
    }
}
