//! Lifecycle operations on a single execution unit.

use chrono::{DateTime, Utc};
use db::dtos::{ExecutionUnit, Job, Stage, TaskRef, UnitState};
use tracing::warn;
use worker::{RuntimeCommand, SnapshotEntry, TaskOutcome, TaskResult};

use crate::templates::StageTemplates;

/// Naming and placement inputs for new units.
#[derive(Debug, Clone)]
pub struct UnitPlacement<'a> {
    pub templates: &'a StageTemplates,
    pub runtime_label: &'a str,
    pub data_root: Option<&'a str>,
}

/// What applying a snapshot entry did to a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotApplied {
    Observed,
    /// The unit was already known to be gone.
    Unchanged,
    /// The runtime stopped reporting a unit we still wanted alive.
    Vanished,
    /// The runtime stopped reporting a unit we no longer needed.
    Gone,
}

/// Allocates the local record for `stage` and the command creating it.
///
/// Returns `None` when no template exists for the stage.
pub fn allocate(
    job: &Job,
    stage: Stage,
    placement: &UnitPlacement<'_>,
    now: DateTime<Utc>,
) -> Option<(ExecutionUnit, RuntimeCommand)> {
    let template = placement.templates.get(stage)?;
    let mut unit = ExecutionUnit::new(job.id, stage, template.backend, now);
    let command = create_command(job, &mut unit, placement)?;

    Some((unit, command))
}

/// Re-requests creation for a unit whose earlier create never round-tripped.
pub fn create_command(
    job: &Job,
    unit: &mut ExecutionUnit,
    placement: &UnitPlacement<'_>,
) -> Option<RuntimeCommand> {
    let template = placement.templates.get(unit.stage)?;
    let spec = template.unit_spec(job, unit, placement.runtime_label, placement.data_root);

    unit.desired_state = UnitState::Created;
    unit.task_handle = Some(TaskRef::Requested);

    Some(RuntimeCommand::Create {
        unit_id: unit.id,
        backend: unit.backend,
        spec,
    })
}

/// Marks `unit` as being removed and returns the forced remove for it.
pub fn remove_command(unit: &mut ExecutionUnit) -> RuntimeCommand {
    unit.task_handle = Some(TaskRef::Requested);
    RuntimeCommand::Remove {
        unit_id: Some(unit.id),
        backend: unit.backend,
        external_id: unit.external_id.clone(),
        force: true,
    }
}

/// Folds the runtime's report for the unit's external id into the record.
/// `None` means the id was absent from the snapshot.
pub fn apply_snapshot(
    unit: &mut ExecutionUnit,
    entry: Option<&SnapshotEntry>,
    now: DateTime<Utc>,
) -> SnapshotApplied {
    let Some(entry) = entry else {
        if !unit.observed_state.exists() {
            return SnapshotApplied::Unchanged;
        }

        unit.observed_state = UnitState::NonExistent;
        unit.stopped_at.get_or_insert(now);

        return if matches!(
            unit.desired_state,
            UnitState::NonExistent | UnitState::Exited
        ) {
            SnapshotApplied::Gone
        } else {
            SnapshotApplied::Vanished
        };
    };

    unit.observed_state = entry.observed_state;
    if entry.exit_code.is_some() {
        unit.exit_code = entry.exit_code;
    }
    if entry.started_at.is_some() {
        unit.started_at = entry.started_at;
    }
    if entry.observed_state.is_terminal() {
        unit.stopped_at = entry.stopped_at.or(unit.stopped_at).or(Some(now));
    }
    if let Some(tail) = entry.log_tail.as_deref().filter(|tail| !tail.is_empty()) {
        unit.set_log(tail);
        if let Some(progress) = parse_progress(tail) {
            unit.progress = progress;
        }
    }

    SnapshotApplied::Observed
}

/// Merges a finished task result into the unit and clears its handle.
/// Applying the same result twice leaves the record as after the first time.
pub fn fold_task_result(unit: &mut ExecutionUnit, result: &TaskResult) -> bool {
    unit.task_handle = None;

    match result {
        Ok(TaskOutcome::Created { external_id }) => {
            let assigned = !unit.has_external_id();
            if assigned {
                unit.external_id = external_id.clone();
            } else if unit.external_id != *external_id {
                warn!(
                    unit_id = %unit.id,
                    external_id = %unit.external_id,
                    "Ignoring second external id {external_id} for unit"
                );
            }
            if unit.observed_state == UnitState::NonExistent {
                unit.observed_state = UnitState::Created;
            }
            assigned
        }
        Ok(TaskOutcome::Started | TaskOutcome::Stopped | TaskOutcome::Removed) => false,
        Err(error) => {
            let message = error.to_string();
            unit.observed_state = UnitState::Failed;
            unit.append_log_line(&format!("task failed: {message}"));
            unit.fault = Some(message);
            false
        }
    }
}

/// Last `NN%` figure in `log`, clamped to 100.
pub fn parse_progress(log: &str) -> Option<u8> {
    log.lines().rev().find_map(|line| {
        line.split_whitespace().rev().find_map(|token| {
            let digits = token
                .trim_end_matches(|c: char| !c.is_ascii_digit() && c != '%')
                .strip_suffix('%')?;
            let number = &digits[digits.trim_end_matches(|c: char| c.is_ascii_digit()).len()..];
            let value: u32 = number.parse().ok()?;
            Some(value.min(100) as u8)
        })
    })
}
