//! One reconciliation cycle: snapshot, collect, match, advance, remediate,
//! dispatch, persist.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use db::dtos::{ExecutionUnit, JobEvent, Remediation, TaskRef, UnitBackend, UnitState};
use db::{JobStore, StoreError};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use worker::{RuntimeClient, RuntimeCommand, RuntimeError, SnapshotEntry, TaskDispatcher};

use crate::collector::TaskResultCollector;
use crate::config::Config;
use crate::events::EventSink;
use crate::execution_unit::{apply_snapshot, remove_command, SnapshotApplied, UnitPlacement};
use crate::ledger::{CorruptedRecord, Ledger};
use crate::matrix::MatchingMatrix;
use crate::phase::{advance, AdvanceContext, SlotBudget, Transition};
use crate::templates::StageTemplates;

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("{backend} snapshot did not arrive within {timeout:?}")]
    SnapshotTimeout {
        backend: UnitBackend,
        timeout: Duration,
    },

    #[error("{backend} runtime unavailable: {source}")]
    RuntimeUnavailable {
        backend: UnitBackend,
        source: RuntimeError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    /// Compute slots shared by all jobs.
    pub max_concurrent_jobs: usize,
    pub snapshot_timeout: Duration,
    pub log_fetch_timeout: Duration,
    pub stop_timeout: Duration,
    pub log_tail_lines: usize,
    pub runtime_label: String,
    pub data_root: Option<String>,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 4,
            snapshot_timeout: Duration::from_secs(30),
            log_fetch_timeout: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(30),
            log_tail_lines: 200,
            runtime_label: "simulation-manager".to_string(),
            data_root: None,
        }
    }
}

impl From<&Config> for ReconcileSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_concurrent_jobs: config.max_concurrent_jobs,
            snapshot_timeout: config.snapshot_timeout,
            log_fetch_timeout: config.snapshot_timeout.min(Duration::from_secs(5)),
            stop_timeout: config.stop_timeout,
            log_tail_lines: config.log_tail_lines,
            runtime_label: config.runtime_label.clone(),
            data_root: config.data_root.clone(),
        }
    }
}

/// Outcome of one cycle. Per-job results live in the persisted records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub jobs_advanced: usize,
    pub transitions: Vec<Transition>,
    pub tasks_folded: usize,
    pub tasks_lost: usize,
    pub orphans_removed: Vec<String>,
    pub commands_dispatched: usize,
    pub dispatch_failures: usize,
    pub escalations: usize,
    pub corrupted: Vec<CorruptedRecord>,
    pub records_written: usize,
}

/// Result of checking one unit for a persistent desired/observed disagreement.
#[derive(Debug, Clone, PartialEq)]
pub enum MismatchOutcome {
    /// Not a teardown target, or something is still in flight.
    Untracked,
    Consistent,
    /// First disagreeing cycle; the runtime may simply be slow.
    Tolerated,
    Reissued(RuntimeCommand),
    Escalated(JobEvent),
    /// Already escalated; nothing more is attempted.
    Abandoned,
}

/// Re-issues the corrective call once for a unit that keeps disagreeing with
/// its desired teardown state, then escalates to an alert.
pub fn fix_mismatch_or_log(
    unit: &mut ExecutionUnit,
    stop_timeout: Duration,
    now: DateTime<Utc>,
) -> MismatchOutcome {
    if !matches!(unit.desired_state, UnitState::Exited | UnitState::NonExistent)
        || !unit.has_external_id()
        || unit.task_in_flight()
    {
        return MismatchOutcome::Untracked;
    }

    let agrees = match unit.desired_state {
        UnitState::Exited => matches!(
            unit.observed_state,
            UnitState::Exited | UnitState::Failed | UnitState::NonExistent
        ),
        _ => unit.observed_state == UnitState::NonExistent,
    };
    if agrees {
        unit.mismatch_cycles = 0;
        unit.remediation = Remediation::None;
        return MismatchOutcome::Consistent;
    }

    unit.mismatch_cycles += 1;
    if unit.mismatch_cycles < 2 {
        debug!(
            unit_id = %unit.id,
            external_id = %unit.external_id,
            "Unit is {} but should be {}, waiting a cycle",
            unit.observed_state,
            unit.desired_state
        );
        return MismatchOutcome::Tolerated;
    }

    match unit.remediation {
        Remediation::None => {
            warn!(
                unit_id = %unit.id,
                external_id = %unit.external_id,
                "Unit stayed {} instead of {}, re-issuing the corrective call",
                unit.observed_state,
                unit.desired_state
            );
            unit.remediation = Remediation::Reissued;

            let command = if unit.desired_state == UnitState::NonExistent {
                remove_command(unit)
            } else {
                unit.task_handle = Some(TaskRef::Requested);
                RuntimeCommand::Stop {
                    unit_id: Some(unit.id),
                    backend: unit.backend,
                    external_id: unit.external_id.clone(),
                    timeout: stop_timeout,
                }
            };
            MismatchOutcome::Reissued(command)
        }
        Remediation::Reissued => {
            error!(
                job_id = %unit.job_id,
                unit_id = %unit.id,
                external_id = %unit.external_id,
                "Unit is still {} instead of {} after a corrective call, giving up",
                unit.observed_state,
                unit.desired_state
            );
            unit.remediation = Remediation::Escalated;
            MismatchOutcome::Escalated(JobEvent::MismatchEscalated {
                job_id: unit.job_id,
                unit_id: unit.id,
                external_id: unit.external_id.clone(),
                desired: unit.desired_state,
                observed: unit.observed_state,
                at: now,
            })
        }
        Remediation::Escalated => MismatchOutcome::Abandoned,
    }
}

/// Work produced while a cycle runs, applied once every pass is done.
#[derive(Default)]
struct Plan {
    commands: Vec<RuntimeCommand>,
    events: Vec<JobEvent>,
    report: CycleReport,
}

pub struct Reconciler {
    store: Arc<dyn JobStore>,
    containers: Arc<dyn RuntimeClient>,
    workflows: Option<Arc<dyn RuntimeClient>>,
    dispatcher: Arc<dyn TaskDispatcher>,
    events: Arc<dyn EventSink>,
    templates: StageTemplates,
    settings: ReconcileSettings,
    collector: TaskResultCollector,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn JobStore>,
        containers: Arc<dyn RuntimeClient>,
        dispatcher: Arc<dyn TaskDispatcher>,
        events: Arc<dyn EventSink>,
        templates: StageTemplates,
        settings: ReconcileSettings,
    ) -> Self {
        Self {
            store,
            containers,
            workflows: None,
            dispatcher,
            events,
            templates,
            settings,
            collector: TaskResultCollector::new(),
        }
    }

    /// Enables the workflow matching pass.
    pub fn with_workflows(mut self, workflows: Arc<dyn RuntimeClient>) -> Self {
        self.workflows = Some(workflows);
        self
    }

    /// Runs one cycle. Fails only when the snapshot or the store is unusable;
    /// in that case nothing has been changed.
    pub async fn run_cycle(&mut self) -> Result<CycleReport, ReconcileError> {
        let mut ledger = Ledger::load(self.store.as_ref()).await?;

        let containers = self
            .fetch_snapshot(UnitBackend::Container, self.containers.as_ref())
            .await?;
        let workflows = match &self.workflows {
            Some(client) => Some(self.fetch_snapshot(UnitBackend::Workflow, client.as_ref()).await?),
            None => None,
        };

        let now = Utc::now();
        let mut plan = Plan::default();
        plan.report.corrupted = ledger.corrupted.clone();

        let mut collected = self.collector.collect(&mut ledger.units);
        plan.report.tasks_folded = collected.folded;
        plan.report.tasks_lost = collected.lost;
        plan.commands.append(&mut collected.removals);

        self.sync_execution_units(&mut ledger, &containers, &collected.fresh, now, &mut plan)
            .await;
        self.advance_jobs(&mut ledger, now, &mut plan);
        if let Some(workflows) = &workflows {
            self.sync_workflows(&mut ledger, workflows, &collected.fresh, now, &mut plan)
                .await;
        }

        for unit in &mut ledger.units {
            match fix_mismatch_or_log(unit, self.settings.stop_timeout, now) {
                MismatchOutcome::Reissued(command) => plan.commands.push(command),
                MismatchOutcome::Escalated(event) => {
                    plan.report.escalations += 1;
                    plan.events.push(event);
                }
                _ => {}
            }
        }

        let commands = std::mem::take(&mut plan.commands);
        self.dispatch(&mut ledger.units, commands, now, &mut plan);

        plan.report.records_written = ledger.persist(self.store.as_ref()).await?;

        for event in &plan.events {
            self.events.publish(event).await;
        }

        info!(
            transitions = plan.report.transitions.len(),
            dispatched = plan.report.commands_dispatched,
            orphans = plan.report.orphans_removed.len(),
            "Reconciliation cycle finished"
        );
        Ok(plan.report)
    }

    async fn fetch_snapshot(
        &self,
        backend: UnitBackend,
        client: &dyn RuntimeClient,
    ) -> Result<Vec<SnapshotEntry>, ReconcileError> {
        let timeout = self.settings.snapshot_timeout;
        match tokio::time::timeout(timeout, client.list_units()).await {
            Ok(Ok(entries)) => Ok(entries),
            Ok(Err(source)) => {
                error!("Failed to list {backend} units: {source}");
                Err(ReconcileError::RuntimeUnavailable { backend, source })
            }
            Err(_) => {
                error!("Listing {backend} units timed out after {timeout:?}, skipping cycle");
                Err(ReconcileError::SnapshotTimeout { backend, timeout })
            }
        }
    }

    async fn sync_execution_units(
        &self,
        ledger: &mut Ledger,
        snapshot: &[SnapshotEntry],
        fresh: &HashSet<Uuid>,
        now: DateTime<Utc>,
        plan: &mut Plan,
    ) {
        let client = self.containers.clone();
        self.sync_backend(UnitBackend::Container, client.as_ref(), ledger, snapshot, fresh, now, plan)
            .await;
    }

    async fn sync_workflows(
        &self,
        ledger: &mut Ledger,
        snapshot: &[SnapshotEntry],
        fresh: &HashSet<Uuid>,
        now: DateTime<Utc>,
        plan: &mut Plan,
    ) {
        let Some(client) = self.workflows.clone() else {
            return;
        };
        self.sync_backend(UnitBackend::Workflow, client.as_ref(), ledger, snapshot, fresh, now, plan)
            .await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn sync_backend(
        &self,
        backend: UnitBackend,
        client: &dyn RuntimeClient,
        ledger: &mut Ledger,
        snapshot: &[SnapshotEntry],
        fresh: &HashSet<Uuid>,
        now: DateTime<Utc>,
        plan: &mut Plan,
    ) {
        let matrix = {
            let members: Vec<&ExecutionUnit> = ledger
                .units
                .iter()
                .filter(|unit| unit.backend == backend)
                .collect();
            MatchingMatrix::compute(&members, snapshot, fresh, &ledger.reserved_external_ids)
        };
        debug!(
            present = matrix.matched_present.len(),
            absent = matrix.matched_absent.len(),
            orphans = matrix.orphans.len(),
            awaiting = matrix.awaiting_creation.len(),
            "Matched {backend} snapshot"
        );

        let entries: HashMap<&str, &SnapshotEntry> = snapshot
            .iter()
            .map(|entry| (entry.external_id.as_str(), entry))
            .collect();

        for unit in ledger.units.iter_mut().filter(|unit| unit.backend == backend) {
            if matrix.matched_present.contains(&unit.external_id) {
                let Some(entry) = entries.get(unit.external_id.as_str()) else {
                    continue;
                };
                let mut entry = (*entry).clone();
                if entry.log_tail.is_none() && wants_log(unit, &entry) {
                    entry.log_tail = self.fetch_log(client, &entry.external_id).await;
                }
                apply_snapshot(unit, Some(&entry), now);
            } else if matrix.matched_absent.contains(&unit.external_id)
                && apply_snapshot(unit, None, now) == SnapshotApplied::Vanished
            {
                warn!(
                    job_id = %unit.job_id,
                    unit_id = %unit.id,
                    external_id = %unit.external_id,
                    "Unit disappeared from the {backend} runtime"
                );
            }
        }

        for external_id in &matrix.orphans {
            if self.collector.removal_in_flight(external_id) {
                debug!(%external_id, "Orphan removal already in flight");
                continue;
            }
            warn!(%external_id, "Found {backend} unit without a local record, removing it");
            plan.commands.push(RuntimeCommand::Remove {
                unit_id: None,
                backend,
                external_id: external_id.clone(),
                force: true,
            });
        }
    }

    async fn fetch_log(&self, client: &dyn RuntimeClient, external_id: &str) -> Option<String> {
        let fetch = client.fetch_log(external_id, self.settings.log_tail_lines);
        match tokio::time::timeout(self.settings.log_fetch_timeout, fetch).await {
            Ok(Ok(log)) => Some(log),
            Ok(Err(error)) => {
                debug!(%external_id, "Could not fetch log: {error}");
                None
            }
            Err(_) => {
                debug!(%external_id, "Fetching log timed out");
                None
            }
        }
    }

    fn advance_jobs(&self, ledger: &mut Ledger, now: DateTime<Utc>, plan: &mut Plan) {
        let in_use = ledger.jobs.iter().filter(|job| job.phase.holds_slot()).count();
        let mut slots = SlotBudget::new(self.settings.max_concurrent_jobs, in_use);
        let placement = UnitPlacement {
            templates: &self.templates,
            runtime_label: &self.settings.runtime_label,
            data_root: self.settings.data_root.as_deref(),
        };

        for job in &mut ledger.jobs {
            let (mut units, rest): (Vec<ExecutionUnit>, Vec<ExecutionUnit>) =
                std::mem::take(&mut ledger.units)
                    .into_iter()
                    .partition(|unit| unit.job_id == job.id);

            let mut ctx = AdvanceContext {
                now,
                slots: &mut slots,
                placement: placement.clone(),
                log_tail_lines: self.settings.log_tail_lines,
            };
            let outcome = advance(job, &mut units, &mut ctx);

            ledger.units = rest;
            ledger.units.extend(units);

            if !outcome.transitions.is_empty() {
                plan.report.jobs_advanced += 1;
            }
            for transition in &outcome.transitions {
                plan.events.push(JobEvent::PhaseChanged {
                    job_id: transition.job_id,
                    from: transition.from,
                    to: transition.to,
                    at: transition.at,
                });
            }
            plan.report.transitions.extend(outcome.transitions);
            plan.commands.extend(outcome.commands);
        }
    }

    fn dispatch(
        &mut self,
        units: &mut [ExecutionUnit],
        commands: Vec<RuntimeCommand>,
        now: DateTime<Utc>,
        plan: &mut Plan,
    ) {
        let positions: HashMap<Uuid, usize> = units
            .iter()
            .enumerate()
            .map(|(position, unit)| (unit.id, position))
            .collect();

        for command in commands {
            let position = command.unit_id().and_then(|unit_id| positions.get(&unit_id).copied());

            match self.dispatcher.dispatch(command.clone()) {
                Ok(handle) => {
                    plan.report.commands_dispatched += 1;
                    if let Some(position) = position {
                        units[position].task_handle = Some(TaskRef::Dispatched(handle.id()));
                    } else if let RuntimeCommand::Remove {
                        backend,
                        external_id,
                        ..
                    } = &command
                    {
                        plan.report.orphans_removed.push(external_id.clone());
                        plan.events.push(JobEvent::OrphanRemoved {
                            backend: *backend,
                            external_id: external_id.clone(),
                            at: now,
                        });
                    }
                    self.collector.track(handle);
                }
                Err(error) => {
                    plan.report.dispatch_failures += 1;
                    warn!(
                        unit_id = ?command.unit_id(),
                        external_id = ?command.external_id(),
                        "Failed to dispatch {}, retrying next cycle: {error}",
                        command.verb()
                    );
                    if let Some(position) = position {
                        units[position].task_handle = None;
                    }
                }
            }
        }
    }
}

/// Logs are fetched for units that are running or have just stopped.
fn wants_log(unit: &ExecutionUnit, entry: &SnapshotEntry) -> bool {
    if unit.desired_state == UnitState::NonExistent {
        return false;
    }
    entry.observed_state == UnitState::Running
        || (entry.observed_state.is_terminal() && unit.observed_state != entry.observed_state)
}

#[cfg(test)]
mod tests {
    use db::dtos::Stage;

    use super::*;

    fn retiring_unit(observed: UnitState) -> ExecutionUnit {
        let mut unit = ExecutionUnit::new(Uuid::new_v4(), Stage::Export, UnitBackend::Workflow, Utc::now());
        unit.external_id = "wf-1".to_string();
        unit.desired_state = UnitState::NonExistent;
        unit.observed_state = observed;
        unit
    }

    #[test]
    fn reissues_once_then_escalates() {
        let mut unit = retiring_unit(UnitState::Running);
        let timeout = Duration::from_secs(30);

        assert_eq!(fix_mismatch_or_log(&mut unit, timeout, Utc::now()), MismatchOutcome::Tolerated);

        let outcome = fix_mismatch_or_log(&mut unit, timeout, Utc::now());
        assert!(matches!(
            outcome,
            MismatchOutcome::Reissued(RuntimeCommand::Remove { force: true, .. })
        ));
        assert_eq!(unit.remediation, Remediation::Reissued);

        // In flight: not counted.
        assert_eq!(fix_mismatch_or_log(&mut unit, timeout, Utc::now()), MismatchOutcome::Untracked);
        unit.task_handle = None;

        assert!(matches!(
            fix_mismatch_or_log(&mut unit, timeout, Utc::now()),
            MismatchOutcome::Escalated(JobEvent::MismatchEscalated { .. })
        ));
        assert_eq!(fix_mismatch_or_log(&mut unit, timeout, Utc::now()), MismatchOutcome::Abandoned);
        assert!(unit.task_handle.is_none());
    }

    #[test]
    fn agreement_resets_tracking() {
        let mut unit = retiring_unit(UnitState::Running);
        fix_mismatch_or_log(&mut unit, Duration::from_secs(1), Utc::now());
        assert_eq!(unit.mismatch_cycles, 1);

        unit.observed_state = UnitState::NonExistent;
        assert_eq!(
            fix_mismatch_or_log(&mut unit, Duration::from_secs(1), Utc::now()),
            MismatchOutcome::Consistent
        );
        assert_eq!(unit.mismatch_cycles, 0);
    }

    #[test]
    fn exited_target_is_corrected_with_stop() {
        let mut unit = retiring_unit(UnitState::Running);
        unit.desired_state = UnitState::Exited;
        fix_mismatch_or_log(&mut unit, Duration::from_secs(10), Utc::now());

        assert!(matches!(
            fix_mismatch_or_log(&mut unit, Duration::from_secs(10), Utc::now()),
            MismatchOutcome::Reissued(RuntimeCommand::Stop { .. })
        ));
    }

    #[test]
    fn running_units_are_not_tracked() {
        let mut unit = retiring_unit(UnitState::NonExistent);
        unit.desired_state = UnitState::Running;
        assert_eq!(
            fix_mismatch_or_log(&mut unit, Duration::from_secs(1), Utc::now()),
            MismatchOutcome::Untracked
        );
    }
}
