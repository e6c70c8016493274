//! Phase state machine.
//!
//! [`advance`] is a pure function of the job, its units and the context: it
//! mutates the in-memory records and returns the runtime commands the new
//! state requires. Nothing here talks to the runtime or the store.

use chrono::{DateTime, Utc};
use db::dtos::{ExecutionUnit, Job, JobSignal, Phase, Stage, Step, TaskRef, UnitState};
use tracing::{debug, info, warn};
use uuid::Uuid;
use worker::RuntimeCommand;

use crate::execution_unit::{self, UnitPlacement};

/// Upper bound on checkpoints crossed in one call.
const MAX_STEPS: usize = 32;

/// Global compute slots shared by every job in a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotBudget {
    capacity: usize,
    in_use: usize,
}

impl SlotBudget {
    pub fn new(capacity: usize, in_use: usize) -> Self {
        Self { capacity, in_use }
    }

    pub fn available(&self) -> bool {
        self.in_use < self.capacity
    }

    pub fn in_use(&self) -> usize {
        self.in_use
    }

    fn take(&mut self) {
        self.in_use += 1;
    }

    fn release(&mut self) {
        self.in_use = self.in_use.saturating_sub(1);
    }
}

pub struct AdvanceContext<'a> {
    pub now: DateTime<Utc>,
    pub slots: &'a mut SlotBudget,
    pub placement: UnitPlacement<'a>,
    pub log_tail_lines: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub job_id: Uuid,
    pub from: Phase,
    pub to: Phase,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct Advance {
    pub transitions: Vec<Transition>,
    pub commands: Vec<RuntimeCommand>,
}

impl Advance {
    pub fn is_noop(&self) -> bool {
        self.transitions.is_empty() && self.commands.is_empty()
    }
}

/// Moves `job` forward as far as the current unit states allow.
///
/// Calling it again without any intervening change is a no-op: commands are
/// only emitted together with a record change that suppresses them next time.
pub fn advance(job: &mut Job, units: &mut Vec<ExecutionUnit>, ctx: &mut AdvanceContext<'_>) -> Advance {
    let mut out = Advance::default();

    for _ in 0..MAX_STEPS {
        let from = job.phase;
        let Some(to) = step(job, units, ctx, &mut out) else {
            break;
        };
        if to == from {
            break;
        }

        enter(job, to, ctx);
        info!(job_id = %job.id, "Job moved from {from} to {to}");
        out.transitions.push(Transition {
            job_id: job.id,
            from,
            to,
            at: ctx.now,
        });
    }

    update_progress(job, units);
    out
}

fn enter(job: &mut Job, to: Phase, ctx: &mut AdvanceContext<'_>) {
    let from = job.phase;
    if !from.holds_slot() && to.holds_slot() {
        ctx.slots.take();
    } else if from.holds_slot() && !to.holds_slot() {
        ctx.slots.release();
    }

    if let Some(stage) = to.stage() {
        job.stage = Some(stage);
    }
    if to.is_terminal() {
        job.finished_at.get_or_insert(ctx.now);
    }
    job.phase = to;
}

/// One checkpoint. Returns the next phase, or `None` to stay.
fn step(
    job: &mut Job,
    units: &mut Vec<ExecutionUnit>,
    ctx: &mut AdvanceContext<'_>,
    out: &mut Advance,
) -> Option<Phase> {
    if job.phase.is_terminal() {
        return None;
    }

    if job.signal == Some(JobSignal::Abort) && !job.phase.is_aborting() {
        job.signal = None;
        return Some(Phase::StartingAbort);
    }

    match job.phase {
        Phase::New => {
            job.started_at.get_or_insert(ctx.now);
            Some(Phase::Queued)
        }
        Phase::Queued => {
            if !ctx.slots.available() {
                debug!(job_id = %job.id, "No free slot, staying queued");
                return None;
            }
            Some(Phase::Stage(job.execution_kind.first_stage(), Step::Allocating))
        }
        Phase::Stage(stage, Step::Allocating) => allocating(job, stage, units, ctx, out),
        Phase::Stage(stage, Step::Starting) => starting(job, stage, units, ctx, out),
        Phase::Stage(stage, Step::Running) => running(job, stage, units, ctx, out),
        Phase::Stage(stage, Step::Finished) => {
            if job.idle_after == Some(stage) {
                return Some(Phase::Idle);
            }
            Some(next_stage_or_teardown(job, stage))
        }
        Phase::Idle => match job.signal {
            Some(JobSignal::Resume) => {
                job.signal = None;
                let stage = job.stage?;
                Some(next_stage_or_teardown(job, stage))
            }
            Some(JobSignal::Stop) => {
                job.signal = None;
                teardown(units, out);
                Some(Phase::Stopped)
            }
            _ => None,
        },
        Phase::RemovingUnits => {
            teardown(units, out);
            units.iter().all(ExecutionUnit::is_retired).then_some(Phase::Finished)
        }
        Phase::StartingAbort => {
            teardown(units, out);
            Some(Phase::Aborting)
        }
        Phase::Aborting => units
            .iter()
            .all(ExecutionUnit::is_retired)
            .then_some(Phase::FinishedAbort),
        Phase::Finished | Phase::Failed | Phase::Stopped | Phase::FinishedAbort => None,
    }
}

fn next_stage_or_teardown(job: &Job, stage: Stage) -> Phase {
    match job.execution_kind.next_stage(stage) {
        Some(next) => Phase::Stage(next, Step::Allocating),
        None => Phase::RemovingUnits,
    }
}

fn allocating(
    job: &mut Job,
    stage: Stage,
    units: &mut Vec<ExecutionUnit>,
    ctx: &mut AdvanceContext<'_>,
    out: &mut Advance,
) -> Option<Phase> {
    let Some(index) = current_unit(units, stage) else {
        let Some((unit, command)) = execution_unit::allocate(job, stage, &ctx.placement, ctx.now)
        else {
            return Some(fail(job, units, None, format!("no template for stage {stage}"), ctx, out));
        };
        debug!(job_id = %job.id, unit_id = %unit.id, "Requesting {stage} unit");
        units.push(unit);
        out.commands.push(command);
        return None;
    };

    let unit = &mut units[index];
    if unit.has_failed() {
        return Some(fail(job, units, Some(index), String::new(), ctx, out));
    }

    if unit.observed_state.exists() {
        unit.desired_state = UnitState::Running;
        return Some(Phase::Stage(stage, Step::Starting));
    }

    if unit.has_external_id() && !unit.task_in_flight() {
        return Some(fail(
            job,
            units,
            Some(index),
            format!("{stage} unit vanished before it started"),
            ctx,
            out,
        ));
    }

    if !unit.task_in_flight() {
        if let Some(command) = execution_unit::create_command(job, unit, &ctx.placement) {
            debug!(job_id = %job.id, unit_id = %unit.id, "Re-requesting {stage} unit");
            out.commands.push(command);
        }
    }
    None
}

fn starting(
    job: &mut Job,
    stage: Stage,
    units: &mut Vec<ExecutionUnit>,
    ctx: &mut AdvanceContext<'_>,
    out: &mut Advance,
) -> Option<Phase> {
    let Some(index) = current_unit(units, stage) else {
        return Some(fail(job, units, None, format!("{stage} unit is missing"), ctx, out));
    };

    let unit = &mut units[index];
    if unit.has_failed() {
        return Some(fail(job, units, Some(index), String::new(), ctx, out));
    }

    let observed = unit.observed_state;
    match observed {
        UnitState::Running if unit.desired_state == UnitState::Running => {
            Some(Phase::Stage(stage, Step::Running))
        }
        state if state.is_terminal() => Some(Phase::Stage(stage, Step::Running)),
        UnitState::NonExistent if unit.has_external_id() && !unit.task_in_flight() => Some(fail(
            job,
            units,
            Some(index),
            format!("{stage} unit vanished before it started"),
            ctx,
            out,
        )),
        UnitState::Created if !unit.task_in_flight() => {
            unit.task_handle = Some(TaskRef::Requested);
            out.commands.push(RuntimeCommand::Start {
                unit_id: unit.id,
                backend: unit.backend,
                external_id: unit.external_id.clone(),
            });
            None
        }
        _ => None,
    }
}

fn running(
    job: &mut Job,
    stage: Stage,
    units: &mut Vec<ExecutionUnit>,
    ctx: &mut AdvanceContext<'_>,
    out: &mut Advance,
) -> Option<Phase> {
    let Some(index) = current_unit(units, stage) else {
        return Some(fail(job, units, None, format!("{stage} unit is missing"), ctx, out));
    };

    let unit = &mut units[index];
    if unit.succeeded() {
        unit.desired_state = UnitState::Exited;
        unit.progress = 100;
        return Some(Phase::Stage(stage, Step::Finished));
    }

    if unit.has_failed() {
        return Some(fail(job, units, Some(index), String::new(), ctx, out));
    }

    if unit.observed_state == UnitState::NonExistent && !unit.task_in_flight() {
        return Some(fail(
            job,
            units,
            Some(index),
            format!("{stage} unit vanished while running"),
            ctx,
            out,
        ));
    }
    None
}

/// Records the failure diagnostic and tears the job's units down.
fn fail(
    job: &mut Job,
    units: &mut [ExecutionUnit],
    culprit: Option<usize>,
    reason: String,
    ctx: &AdvanceContext<'_>,
    out: &mut Advance,
) -> Phase {
    let mut diagnostic = reason;
    if let Some(unit) = culprit.map(|index| &units[index]) {
        let tail = unit.log_tail(ctx.log_tail_lines);
        let detail = if tail.is_empty() {
            unit.fault.clone().unwrap_or_default()
        } else {
            tail
        };
        if !detail.is_empty() {
            if !diagnostic.is_empty() {
                diagnostic.push('\n');
            }
            diagnostic.push_str(&detail);
        }
        if diagnostic.is_empty() {
            diagnostic = format!(
                "{} unit ended as {} with exit code {:?}",
                unit.stage, unit.observed_state, unit.exit_code
            );
        }
    }

    warn!(job_id = %job.id, phase = %job.phase, "Job failed: {diagnostic}");
    job.failure = Some(diagnostic);
    teardown(units, out);

    Phase::Failed
}

/// Marks every unit for removal, issuing a remove for each live one.
///
/// A remove goes out only when the desired state flips, so repeating the
/// teardown is free. Later disagreement is left to mismatch remediation.
fn teardown(units: &mut [ExecutionUnit], out: &mut Advance) {
    for unit in units.iter_mut() {
        if unit.desired_state == UnitState::NonExistent {
            continue;
        }
        unit.desired_state = UnitState::NonExistent;
        unit.mismatch_cycles = 0;

        if unit.task_in_flight() {
            continue;
        }
        if unit.has_external_id() && unit.observed_state.exists() {
            out.commands.push(execution_unit::remove_command(unit));
        } else if !unit.has_external_id() {
            unit.observed_state = UnitState::NonExistent;
        }
    }
}

/// Index of the live unit backing `stage`, the most recent one if several.
fn current_unit(units: &[ExecutionUnit], stage: Stage) -> Option<usize> {
    units
        .iter()
        .rposition(|unit| unit.stage == stage && unit.desired_state != UnitState::NonExistent)
}

fn update_progress(job: &mut Job, units: &[ExecutionUnit]) {
    if job.phase == Phase::Finished {
        job.progress = 100;
        return;
    }
    let Some(stage) = job.stage else {
        return;
    };

    let stages = job.execution_kind.stages().len().max(1);
    let completed = job.execution_kind.completed_before(stage);
    let current = match job.phase {
        Phase::Stage(_, Step::Finished) | Phase::Idle | Phase::RemovingUnits => 100,
        _ => current_unit(units, stage).map_or(0, |index| units[index].progress),
    };

    let progress = (completed * 100 + usize::from(current)) / stages;
    job.progress = u8::try_from(progress.min(100)).unwrap_or(100);
}
