use async_trait::async_trait;
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use super::{terminal_codes, JobStore};
use crate::dtos::{ExecutionUnit, Job, JobSignal, Phase, UnitState};
use crate::entities::{JobRow, UnitRow};
use crate::StoreError;

const JOB_COLUMNS: &str = "id, key, name, phase, execution_kind, stage, idle_after, signal, \
     progress, failure, created_at, started_at, finished_at";

const UNIT_COLUMNS: &str = "id, job_id, stage, backend, external_id, desired_state, \
     observed_state, task_handle, started_at, stopped_at, exit_code, progress, log, fault, \
     mismatch_cycles, remediation, created_at";

#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn jobs_in_run_order(&self) -> Result<Vec<JobRow>, StoreError> {
        let rows = sqlx::query_as::<Postgres, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE phase <> ALL($1) \
             ORDER BY started_at ASC NULLS LAST, key ASC"
        ))
        .bind(terminal_codes().to_vec())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn active_units(&self) -> Result<Vec<UnitRow>, StoreError> {
        let rows = sqlx::query_as::<Postgres, UnitRow>(&format!(
            "SELECT {UNIT_COLUMNS} FROM execution_units \
             WHERE observed_state <> $1 \
                OR desired_state NOT IN ($1, $2) \
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(UnitState::NonExistent.as_str())
        .bind(UnitState::Exited.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn units_with_task_handle(&self) -> Result<Vec<UnitRow>, StoreError> {
        let rows = sqlx::query_as::<Postgres, UnitRow>(&format!(
            "SELECT {UNIT_COLUMNS} FROM execution_units WHERE task_handle IS NOT NULL"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn find_job(&self, id: Uuid) -> Result<Option<JobRow>, StoreError> {
        let row = sqlx::query_as::<Postgres, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn insert_job(&self, job: &Job) -> Result<Job, StoreError> {
        let row = JobRow::from(job);
        let key: i64 = sqlx::query_scalar(
            "INSERT INTO jobs (id, name, phase, execution_kind, stage, idle_after, signal, \
             progress, failure, created_at, started_at, finished_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) RETURNING key",
        )
        .bind(row.id)
        .bind(&row.name)
        .bind(row.phase)
        .bind(&row.execution_kind)
        .bind(&row.stage)
        .bind(&row.idle_after)
        .bind(&row.signal)
        .bind(row.progress)
        .bind(&row.failure)
        .bind(row.created_at)
        .bind(row.started_at)
        .bind(row.finished_at)
        .fetch_one(&self.pool)
        .await?;

        let mut job = job.clone();
        job.key = key;
        Ok(job)
    }

    async fn save_job(&self, job: &Job) -> Result<(), StoreError> {
        let row = JobRow::from(job);
        let result = sqlx::query(
            "UPDATE jobs SET name = $2, phase = $3, execution_kind = $4, stage = $5, \
             idle_after = $6, signal = $7, progress = $8, failure = $9, started_at = $10, \
             finished_at = $11 WHERE id = $1",
        )
        .bind(row.id)
        .bind(&row.name)
        .bind(row.phase)
        .bind(&row.execution_kind)
        .bind(&row.stage)
        .bind(&row.idle_after)
        .bind(&row.signal)
        .bind(row.progress)
        .bind(&row.failure)
        .bind(row.started_at)
        .bind(row.finished_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "job",
                id: job.id.to_string(),
            });
        }

        Ok(())
    }

    async fn insert_unit(&self, unit: &ExecutionUnit) -> Result<(), StoreError> {
        let row = UnitRow::from(unit);
        sqlx::query(&format!(
            "INSERT INTO execution_units ({UNIT_COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)"
        ))
        .bind(row.id)
        .bind(row.job_id)
        .bind(&row.stage)
        .bind(&row.backend)
        .bind(&row.external_id)
        .bind(&row.desired_state)
        .bind(&row.observed_state)
        .bind(row.task_handle)
        .bind(row.started_at)
        .bind(row.stopped_at)
        .bind(row.exit_code)
        .bind(row.progress)
        .bind(&row.log)
        .bind(&row.fault)
        .bind(row.mismatch_cycles)
        .bind(&row.remediation)
        .bind(row.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn save_unit(&self, unit: &ExecutionUnit) -> Result<(), StoreError> {
        let row = UnitRow::from(unit);
        let result = sqlx::query(
            "UPDATE execution_units SET external_id = $2, desired_state = $3, \
             observed_state = $4, task_handle = $5, started_at = $6, stopped_at = $7, \
             exit_code = $8, progress = $9, log = $10, fault = $11, mismatch_cycles = $12, \
             remediation = $13 WHERE id = $1",
        )
        .bind(row.id)
        .bind(&row.external_id)
        .bind(&row.desired_state)
        .bind(&row.observed_state)
        .bind(row.task_handle)
        .bind(row.started_at)
        .bind(row.stopped_at)
        .bind(row.exit_code)
        .bind(row.progress)
        .bind(&row.log)
        .bind(&row.fault)
        .bind(row.mismatch_cycles)
        .bind(&row.remediation)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "execution unit",
                id: unit.id.to_string(),
            });
        }

        Ok(())
    }

    async fn set_signal(&self, id: Uuid, signal: Option<JobSignal>) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE jobs SET signal = $2 WHERE id = $1")
            .bind(id)
            .bind(signal.map(JobSignal::as_str))
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_phase(&self, id: Uuid, phase: Phase) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE jobs SET phase = $2 WHERE id = $1")
            .bind(id)
            .bind(phase.code())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
