use std::collections::{HashMap, HashSet};

use db::dtos::{ExecutionUnit, TaskRef, UnitState};
use tracing::{debug, warn};
use uuid::Uuid;
use worker::{RuntimeCommand, TaskHandle};

use crate::execution_unit::{fold_task_result, remove_command};

/// What one collection pass folded into the records.
#[derive(Debug, Default)]
pub struct Collected {
    pub folded: usize,
    /// Tasks that finished with an error.
    pub lost: usize,
    /// Units that received their external id in this pass.
    pub fresh: HashSet<Uuid>,
    /// Removes owed to units torn down while a task was in flight.
    pub removals: Vec<RuntimeCommand>,
}

/// Holds the handles of dispatched runtime tasks and folds finished ones
/// back into their units. Never waits on a task.
#[derive(Debug, Default)]
pub struct TaskResultCollector {
    handles: HashMap<Uuid, TaskHandle>,
    /// Ids removed by tasks collected in the latest pass. The snapshot of the
    /// same cycle may predate the removal.
    just_removed: HashSet<String>,
}

impl TaskResultCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, handle: TaskHandle) {
        self.handles.insert(handle.id(), handle);
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Whether a remove for `external_id` is running or finished during the
    /// latest collection.
    pub fn removal_in_flight(&self, external_id: &str) -> bool {
        self.just_removed.contains(external_id)
            || self.handles.values().any(|handle| {
                handle.verb() == "remove" && handle.external_id() == Some(external_id)
            })
    }

    /// Polls every handle once.
    pub fn collect(&mut self, units: &mut [ExecutionUnit]) -> Collected {
        let mut collected = Collected::default();
        let mut claimed = HashSet::new();
        self.just_removed.clear();

        for unit in units.iter_mut() {
            let Some(TaskRef::Dispatched(task_id)) = unit.task_handle else {
                continue;
            };
            claimed.insert(task_id);

            let Some(handle) = self.handles.get_mut(&task_id) else {
                // Dispatched by an earlier process; its result is gone.
                warn!(unit_id = %unit.id, "Task {task_id} is unknown to this process, clearing it");
                unit.task_handle = None;
                continue;
            };
            let Some(result) = handle.try_take() else {
                continue;
            };
            let verb = handle.verb();
            self.handles.remove(&task_id);

            if let Err(error) = &result {
                warn!(
                    unit_id = %unit.id,
                    external_id = %unit.external_id,
                    "Runtime {verb} failed: {error}"
                );
                collected.lost += 1;
            }
            if fold_task_result(unit, &result) {
                debug!(unit_id = %unit.id, external_id = %unit.external_id, "Unit received its external id");
                collected.fresh.insert(unit.id);
            }
            collected.folded += 1;

            if verb != "remove"
                && unit.desired_state == UnitState::NonExistent
                && unit.has_external_id()
            {
                debug!(
                    unit_id = %unit.id,
                    external_id = %unit.external_id,
                    "Unit was torn down during its {verb}, removing it"
                );
                collected.removals.push(remove_command(unit));
            }
        }

        // Orphan removals and handles whose unit is no longer loaded.
        let just_removed = &mut self.just_removed;
        self.handles.retain(|task_id, handle| {
            if claimed.contains(task_id) {
                return true;
            }
            match handle.try_take() {
                None => true,
                Some(Ok(_)) => {
                    debug!(external_id = ?handle.external_id(), "Runtime {} finished", handle.verb());
                    if let (Some(external_id), "remove") = (handle.external_id(), handle.verb()) {
                        just_removed.insert(external_id.to_string());
                    }
                    false
                }
                Some(Err(error)) => {
                    warn!(external_id = ?handle.external_id(), "Runtime {} failed: {error}", handle.verb());
                    false
                }
            }
        });

        collected
    }
}
