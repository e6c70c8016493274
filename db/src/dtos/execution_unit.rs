use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Stage, UnitState};
use crate::DecodeError;

/// Upper bound of the retained log, in bytes. The tail is kept.
pub const LOG_LIMIT: usize = 64 * 1024;

/// Runtime family a unit is executed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitBackend {
    Container,
    Workflow,
}

impl UnitBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            UnitBackend::Container => "container",
            UnitBackend::Workflow => "workflow",
        }
    }
}

impl fmt::Display for UnitBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UnitBackend {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "container" => Ok(UnitBackend::Container),
            "workflow" => Ok(UnitBackend::Workflow),
            _ => Err(DecodeError::unknown("backend", s)),
        }
    }
}

/// Reference to an in-flight runtime operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskRef {
    /// A command was emitted this cycle and awaits dispatch. Never persisted.
    Requested,
    Dispatched(Uuid),
}

/// Corrective action taken for a persistent desired/observed disagreement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Remediation {
    #[default]
    None,
    Reissued,
    Escalated,
}

impl Remediation {
    pub fn as_str(self) -> &'static str {
        match self {
            Remediation::None => "none",
            Remediation::Reissued => "reissued",
            Remediation::Escalated => "escalated",
        }
    }
}

impl FromStr for Remediation {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Remediation::None),
            "reissued" => Ok(Remediation::Reissued),
            "escalated" => Ok(Remediation::Escalated),
            _ => Err(DecodeError::unknown("remediation", s)),
        }
    }
}

/// A backing compute unit (container or workflow) running one stage of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionUnit {
    pub id: Uuid,
    pub job_id: Uuid,
    pub stage: Stage,
    pub backend: UnitBackend,
    /// Empty until the runtime has assigned an id.
    pub external_id: String,
    pub desired_state: UnitState,
    pub observed_state: UnitState,
    pub task_handle: Option<TaskRef>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i64>,
    pub progress: u8,
    pub log: String,
    /// Error reported by a lost task. Survives later snapshots.
    pub fault: Option<String>,
    pub mismatch_cycles: u32,
    pub remediation: Remediation,
    pub created_at: DateTime<Utc>,
}

impl ExecutionUnit {
    pub fn new(job_id: Uuid, stage: Stage, backend: UnitBackend, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            stage,
            backend,
            external_id: String::new(),
            desired_state: UnitState::Created,
            observed_state: UnitState::NonExistent,
            task_handle: None,
            started_at: None,
            stopped_at: None,
            exit_code: None,
            progress: 0,
            log: String::new(),
            fault: None,
            mismatch_cycles: 0,
            remediation: Remediation::None,
            created_at: now,
        }
    }

    pub fn has_external_id(&self) -> bool {
        !self.external_id.is_empty()
    }

    pub fn task_in_flight(&self) -> bool {
        self.task_handle.is_some()
    }

    pub fn succeeded(&self) -> bool {
        self.fault.is_none() && self.observed_state == UnitState::Exited && self.exit_code == Some(0)
    }

    pub fn has_failed(&self) -> bool {
        self.fault.is_some()
            || self.observed_state == UnitState::Failed
            || (self.observed_state == UnitState::Exited && self.exit_code != Some(0))
    }

    /// Nothing is left to reconcile: the unit is gone and wanted gone.
    pub fn is_retired(&self) -> bool {
        self.task_handle.is_none()
            && self.observed_state == UnitState::NonExistent
            && matches!(
                self.desired_state,
                UnitState::NonExistent | UnitState::Exited
            )
    }

    /// Replaces the log, keeping at most [`LOG_LIMIT`] bytes of its tail.
    pub fn set_log(&mut self, log: &str) {
        self.log = bounded_tail(log, LOG_LIMIT).to_string();
    }

    /// Appends a line unless the log already ends with it.
    pub fn append_log_line(&mut self, line: &str) {
        if self.log.trim_end().ends_with(line) {
            return;
        }
        let mut log = std::mem::take(&mut self.log);
        if !log.is_empty() && !log.ends_with('\n') {
            log.push('\n');
        }
        log.push_str(line);
        log.push('\n');
        self.set_log(&log);
    }

    /// The last `lines` lines of the log.
    pub fn log_tail(&self, lines: usize) -> String {
        let all: Vec<&str> = self.log.lines().collect();
        let start = all.len().saturating_sub(lines);
        all[start..].join("\n")
    }
}

fn bounded_tail(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut start = text.len() - limit;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit() -> ExecutionUnit {
        ExecutionUnit::new(Uuid::new_v4(), Stage::Simulate, UnitBackend::Container, Utc::now())
    }

    #[test]
    fn failure_requires_fault_or_bad_exit() {
        let mut unit = unit();
        unit.observed_state = UnitState::Exited;
        unit.exit_code = Some(0);
        assert!(unit.succeeded());
        assert!(!unit.has_failed());

        unit.exit_code = Some(3);
        assert!(!unit.succeeded());
        assert!(unit.has_failed());

        unit.exit_code = Some(0);
        unit.fault = Some("lost".to_string());
        assert!(unit.has_failed());
    }

    #[test]
    fn log_keeps_tail_within_limit() {
        let mut unit = unit();
        let long = "é".repeat(LOG_LIMIT);
        unit.set_log(&long);
        assert!(unit.log.len() <= LOG_LIMIT);
        assert!(unit.log.chars().all(|c| c == 'é'));
    }

    #[test]
    fn appending_the_same_line_twice_is_a_noop() {
        let mut unit = unit();
        unit.append_log_line("task failed: boom");
        let once = unit.log.clone();
        unit.append_log_line("task failed: boom");
        assert_eq!(unit.log, once);
        assert_eq!(unit.log_tail(1), "task failed: boom");
    }
}
