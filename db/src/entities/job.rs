use chrono::{DateTime, Utc};
use sqlx::types::Uuid;

use crate::dtos::{Job, Phase};
use crate::DecodeError;

#[derive(sqlx::FromRow, Debug, Clone, PartialEq)]
pub struct JobRow {
    pub id: Uuid,
    pub key: i64,
    pub name: String,
    pub phase: i16,
    pub execution_kind: String,
    pub stage: Option<String>,
    pub idle_after: Option<String>,
    pub signal: Option<String>,
    pub progress: i16,
    pub failure: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&Job> for JobRow {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            key: job.key,
            name: job.name.clone(),
            phase: job.phase.code(),
            execution_kind: job.execution_kind.as_str().to_string(),
            stage: job.stage.map(|stage| stage.as_str().to_string()),
            idle_after: job.idle_after.map(|stage| stage.as_str().to_string()),
            signal: job.signal.map(|signal| signal.as_str().to_string()),
            progress: i16::from(job.progress),
            failure: job.failure.clone(),
            created_at: job.created_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
        }
    }
}

impl TryFrom<JobRow> for Job {
    type Error = DecodeError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            key: row.key,
            name: row.name,
            phase: Phase::from_code(row.phase)?,
            execution_kind: row.execution_kind.parse()?,
            stage: row.stage.as_deref().map(str::parse).transpose()?,
            idle_after: row.idle_after.as_deref().map(str::parse).transpose()?,
            signal: row.signal.as_deref().map(str::parse).transpose()?,
            progress: u8::try_from(row.progress.clamp(0, 100)).unwrap_or(0),
            failure: row.failure,
            created_at: row.created_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
        })
    }
}
