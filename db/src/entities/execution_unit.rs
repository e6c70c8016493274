use chrono::{DateTime, Utc};
use sqlx::types::Uuid;

use crate::dtos::{ExecutionUnit, TaskRef};
use crate::DecodeError;

#[derive(sqlx::FromRow, Debug, Clone, PartialEq)]
pub struct UnitRow {
    pub id: Uuid,
    pub job_id: Uuid,
    pub stage: String,
    pub backend: String,
    pub external_id: String,
    pub desired_state: String,
    pub observed_state: String,
    pub task_handle: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i64>,
    pub progress: i16,
    pub log: String,
    pub fault: Option<String>,
    pub mismatch_cycles: i32,
    pub remediation: String,
    pub created_at: DateTime<Utc>,
}

impl From<&ExecutionUnit> for UnitRow {
    fn from(unit: &ExecutionUnit) -> Self {
        Self {
            id: unit.id,
            job_id: unit.job_id,
            stage: unit.stage.as_str().to_string(),
            backend: unit.backend.as_str().to_string(),
            external_id: unit.external_id.clone(),
            desired_state: unit.desired_state.as_str().to_string(),
            observed_state: unit.observed_state.as_str().to_string(),
            // A requested-but-undispatched command is not a handle worth keeping.
            task_handle: match unit.task_handle {
                Some(TaskRef::Dispatched(id)) => Some(id),
                Some(TaskRef::Requested) | None => None,
            },
            started_at: unit.started_at,
            stopped_at: unit.stopped_at,
            exit_code: unit.exit_code,
            progress: i16::from(unit.progress),
            log: unit.log.clone(),
            fault: unit.fault.clone(),
            mismatch_cycles: i32::try_from(unit.mismatch_cycles).unwrap_or(i32::MAX),
            remediation: unit.remediation.as_str().to_string(),
            created_at: unit.created_at,
        }
    }
}

impl TryFrom<UnitRow> for ExecutionUnit {
    type Error = DecodeError;

    fn try_from(row: UnitRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            job_id: row.job_id,
            stage: row.stage.parse()?,
            backend: row.backend.parse()?,
            external_id: row.external_id,
            desired_state: row.desired_state.parse()?,
            observed_state: row.observed_state.parse()?,
            task_handle: row.task_handle.map(TaskRef::Dispatched),
            started_at: row.started_at,
            stopped_at: row.stopped_at,
            exit_code: row.exit_code,
            progress: u8::try_from(row.progress.clamp(0, 100)).unwrap_or(0),
            log: row.log,
            fault: row.fault,
            mismatch_cycles: u32::try_from(row.mismatch_cycles).unwrap_or(0),
            remediation: row.remediation.parse()?,
            created_at: row.created_at,
        })
    }
}
