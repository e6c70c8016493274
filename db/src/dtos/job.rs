use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ExecutionKind, Phase, Stage};
use crate::DecodeError;

/// Pending user request, consumed by the phase state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobSignal {
    Abort,
    Resume,
    Stop,
}

impl JobSignal {
    pub fn as_str(self) -> &'static str {
        match self {
            JobSignal::Abort => "abort",
            JobSignal::Resume => "resume",
            JobSignal::Stop => "stop",
        }
    }
}

impl fmt::Display for JobSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobSignal {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "abort" => Ok(JobSignal::Abort),
            "resume" => Ok(JobSignal::Resume),
            "stop" => Ok(JobSignal::Stop),
            _ => Err(DecodeError::unknown("signal", s)),
        }
    }
}

/// A single simulation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    /// Local numeric key, assigned by the store.
    pub key: i64,
    pub name: String,
    pub phase: Phase,
    pub execution_kind: ExecutionKind,
    /// Last stage the job entered.
    pub stage: Option<Stage>,
    /// Pause in `Idle` once this stage has finished.
    pub idle_after: Option<Stage>,
    pub signal: Option<JobSignal>,
    pub progress: u8,
    /// Diagnostic payload of a `Failed` job.
    pub failure: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(name: impl Into<String>, execution_kind: ExecutionKind, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            key: 0,
            name: name.into(),
            phase: Phase::New,
            execution_kind,
            stage: None,
            idle_after: None,
            signal: None,
            progress: 0,
            failure: None,
            created_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn with_idle_after(mut self, stage: Stage) -> Self {
        self.idle_after = Some(stage);
        self
    }
}
