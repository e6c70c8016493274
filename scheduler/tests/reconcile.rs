mod common;

use std::time::Duration;

use chrono::Utc;
use common::{job_in, settle, unit_of, Harness};
use db::dtos::{
    ExecutionKind, ExecutionUnit, Job, JobEvent, JobSignal, Phase, Remediation, Stage, Step,
    UnitBackend, UnitState,
};
use db::entities::JobRow;
use db::{DecodeError, JobStore};
use scheduler::{ReconcileError, StageTemplate, StageTemplates};
use worker::runtime::{LABEL_MANAGED_BY, LABEL_UNIT};
use worker::testing::RuntimeCall;
use worker::SnapshotEntry;

#[tokio::test]
async fn allocating_unit_seen_running_moves_job_to_running() {
    let mut harness = Harness::new();
    let job = harness
        .insert_job(job_in(
            Phase::Stage(Stage::Simulate, Step::Allocating),
            ExecutionKind::Main,
            Utc::now(),
        ))
        .await;
    let unit = unit_of(&job, Stage::Simulate, "ctr-sim");
    harness.insert_unit(&unit).await;
    harness
        .containers
        .insert(SnapshotEntry::new("ctr-sim", UnitState::Running));

    let report = harness.cycle().await;

    let units = harness.units(&job).await;
    assert_eq!(units[0].observed_state, UnitState::Running);
    assert_eq!(
        harness.job(&job).await.phase,
        Phase::Stage(Stage::Simulate, Step::Running)
    );
    assert_eq!(report.jobs_advanced, 1);
    assert_eq!(harness.containers.creations(), 0);
}

#[tokio::test]
async fn vanished_unit_is_marked_gone_without_a_remove() {
    let mut harness = Harness::new();
    let job = harness
        .insert_job(job_in(
            Phase::Stage(Stage::Simulate, Step::Running),
            ExecutionKind::Main,
            Utc::now(),
        ))
        .await;
    let mut unit = unit_of(&job, Stage::Simulate, "abc123");
    unit.desired_state = UnitState::Running;
    unit.observed_state = UnitState::Running;
    harness.insert_unit(&unit).await;

    harness.cycle_and_settle().await;

    let units = harness.units(&job).await;
    assert_eq!(units[0].observed_state, UnitState::NonExistent);
    assert!(units[0].stopped_at.is_some());
    assert!(harness.containers.removals().is_empty());

    let job = harness.job(&job).await;
    assert_eq!(job.phase, Phase::Failed);
    assert!(job.failure.unwrap().contains("vanished"));
}

#[tokio::test]
async fn orphan_is_removed_exactly_once_and_never_adopted() {
    let mut harness = Harness::new();
    harness.containers.insert(
        SnapshotEntry::new("zzz999", UnitState::Running)
            .with_label(LABEL_MANAGED_BY, "simulation-manager"),
    );

    let report = harness.cycle().await;
    assert_eq!(report.orphans_removed, ["zzz999"]);
    // Second cycle before the removal could have been observed.
    harness.cycle().await;
    settle().await;
    harness.cycle_and_settle().await;
    harness.cycle().await;

    assert_eq!(harness.containers.removals(), [("zzz999".to_string(), true)]);
    assert_eq!(harness.store.unit_count().await, 0);
    assert!(harness.events.events().iter().any(|event| matches!(
        event,
        JobEvent::OrphanRemoved { external_id, .. } if external_id == "zzz999"
    )));
}

#[tokio::test]
async fn snapshot_timeout_leaves_every_record_untouched() {
    let mut harness = Harness::builder()
        .snapshot_timeout(Duration::from_millis(50))
        .build();
    let queued = harness
        .insert_job(job_in(Phase::Queued, ExecutionKind::Main, Utc::now()))
        .await;
    let running = harness
        .insert_job(job_in(
            Phase::Stage(Stage::Simulate, Step::Running),
            ExecutionKind::Main,
            Utc::now(),
        ))
        .await;
    let mut unit = unit_of(&running, Stage::Simulate, "ctr-1");
    unit.desired_state = UnitState::Running;
    unit.observed_state = UnitState::Running;
    harness.insert_unit(&unit).await;
    harness.containers.set_list_delay(Some(Duration::from_millis(300)));

    let before = (
        harness.store.job_row(queued.id).await,
        harness.store.job_row(running.id).await,
        harness.units(&running).await,
    );

    let result = harness.try_cycle().await;

    assert!(matches!(result, Err(ReconcileError::SnapshotTimeout { .. })));
    settle().await;
    let after = (
        harness.store.job_row(queued.id).await,
        harness.store.job_row(running.id).await,
        harness.units(&running).await,
    );
    assert_eq!(before, after);
    assert_eq!(harness.containers.calls(), [RuntimeCall::List]);
}

#[tokio::test]
async fn unreachable_runtime_aborts_the_cycle() {
    let mut harness = Harness::new();
    let job = harness
        .insert_job(Job::new("wing", ExecutionKind::Main, Utc::now()))
        .await;
    harness.containers.set_unavailable(true);

    let result = harness.try_cycle().await;

    assert!(matches!(result, Err(ReconcileError::RuntimeUnavailable { .. })));
    assert_eq!(harness.job(&job).await.phase, Phase::New);
}

#[tokio::test]
async fn clean_exit_finishes_the_stage_within_one_cycle() {
    let mut harness = Harness::new();
    let job = harness
        .insert_job(
            job_in(
                Phase::Stage(Stage::Simulate, Step::Running),
                ExecutionKind::Main,
                Utc::now(),
            )
            .with_idle_after(Stage::Simulate),
        )
        .await;
    let mut unit = unit_of(&job, Stage::Simulate, "ctr-1");
    unit.desired_state = UnitState::Running;
    unit.observed_state = UnitState::Running;
    harness.insert_unit(&unit).await;
    harness
        .containers
        .insert(SnapshotEntry::new("ctr-1", UnitState::Exited).with_exit_code(0));
    harness.containers.set_log("ctr-1", "solving 50%\nsolving 100%\n");

    let report = harness.cycle().await;

    assert!(report.transitions.iter().any(|transition| {
        transition.from == Phase::Stage(Stage::Simulate, Step::Running)
            && transition.to == Phase::Stage(Stage::Simulate, Step::Finished)
    }));
    let job = harness.job(&job).await;
    assert_eq!(job.phase, Phase::Idle);
    assert_eq!(job.progress, 33);
    let units = harness.units(&job).await;
    assert_eq!(units[0].desired_state, UnitState::Exited);
    assert!(units[0].log.contains("solving 100%"));
}

#[tokio::test]
async fn only_the_first_queued_job_gets_the_slot() {
    let mut harness = Harness::builder().capacity(1).build();
    let t1 = Utc::now() - chrono::Duration::minutes(5);
    let t2 = Utc::now();
    let second = harness
        .insert_job(job_in(Phase::Queued, ExecutionKind::Main, t2))
        .await;
    let first = harness
        .insert_job(job_in(Phase::Queued, ExecutionKind::Main, t1))
        .await;

    harness.cycle_and_settle().await;

    assert_eq!(
        harness.job(&first).await.phase,
        Phase::Stage(Stage::Preprocess, Step::Allocating)
    );
    assert_eq!(harness.job(&second).await.phase, Phase::Queued);
    assert_eq!(harness.containers.creations(), 1);
}

#[tokio::test]
async fn job_runs_every_stage_and_cleans_up() {
    let mut harness = Harness::new();
    let job = harness
        .insert_job(Job::new("wing", ExecutionKind::Reprocess, Utc::now()))
        .await;

    for _ in 0..20 {
        harness.cycle_and_settle().await;
        if harness.job(&job).await.phase == Phase::Finished {
            break;
        }
        harness.finish_running_containers();
    }

    let done = harness.job(&job).await;
    assert_eq!(done.phase, Phase::Finished);
    assert_eq!(done.progress, 100);
    assert!(done.finished_at.is_some());
    assert!(harness.containers.ids().is_empty());
    assert_eq!(harness.containers.creations(), 3);

    let stages: Vec<Stage> = harness.units(&job).await.iter().map(|unit| unit.stage).collect();
    assert_eq!(stages, [Stage::Process, Stage::Export, Stage::Synchronize]);

    let phases: Vec<Phase> = harness
        .events
        .events()
        .into_iter()
        .filter_map(|event| match event {
            JobEvent::PhaseChanged { to, .. } => Some(to),
            _ => None,
        })
        .collect();
    assert_eq!(phases.first(), Some(&Phase::Queued));
    assert_eq!(phases.last(), Some(&Phase::Finished));
    assert!(phases.contains(&Phase::RemovingUnits));
}

#[tokio::test]
async fn repeated_cycles_in_a_steady_state_change_nothing() {
    let mut harness = Harness::new();
    let job = harness
        .insert_job(Job::new("wing", ExecutionKind::Main, Utc::now()))
        .await;
    for _ in 0..3 {
        harness.cycle_and_settle().await;
    }
    assert_eq!(
        harness.job(&job).await.phase,
        Phase::Stage(Stage::Preprocess, Step::Running)
    );

    let rows_before = (harness.store.job_row(job.id).await, harness.units(&job).await);
    let report = harness.cycle_and_settle().await;

    assert!(report.transitions.is_empty());
    assert_eq!(report.commands_dispatched, 0);
    assert_eq!(report.records_written, 0);
    assert_eq!(
        (harness.store.job_row(job.id).await, harness.units(&job).await),
        rows_before
    );
    assert_eq!(harness.containers.creations(), 1);
}

#[tokio::test]
async fn abort_removes_units_and_finishes_aborted() {
    let mut harness = Harness::new();
    let job = harness
        .insert_job(Job::new("wing", ExecutionKind::Main, Utc::now()))
        .await;
    harness.cycle_and_settle().await;
    harness.cycle_and_settle().await;
    let external_id = harness.units(&job).await[0].external_id.clone();
    assert!(!external_id.is_empty());

    harness
        .store
        .set_signal(job.id, Some(JobSignal::Abort))
        .await
        .unwrap();
    harness.cycle_and_settle().await;
    assert_eq!(harness.job(&job).await.phase, Phase::Aborting);
    assert_eq!(harness.containers.removals(), [(external_id, true)]);

    harness.cycle_and_settle().await;

    let job = harness.job(&job).await;
    assert_eq!(job.phase, Phase::FinishedAbort);
    assert_eq!(job.signal, None);
    assert!(harness.containers.ids().is_empty());
    assert!(harness.units(&job).await.iter().all(ExecutionUnit::is_retired));
}

#[tokio::test]
async fn stuck_workflow_is_reissued_once_then_escalated() {
    let mut harness = Harness::builder().with_workflows().build();
    let mut job = Job::new("wing", ExecutionKind::Main, Utc::now());
    job.phase = Phase::Failed;
    let job = harness.insert_job(job).await;

    let mut unit = ExecutionUnit::new(job.id, Stage::Export, UnitBackend::Workflow, Utc::now());
    unit.external_id = "wf-7".to_string();
    unit.desired_state = UnitState::NonExistent;
    unit.observed_state = UnitState::Running;
    harness.insert_unit(&unit).await;
    harness
        .workflows
        .insert(SnapshotEntry::new("wf-7", UnitState::Running).with_label(LABEL_UNIT, unit.id.to_string()));
    harness.workflows.set_stuck("wf-7", true);

    for _ in 0..6 {
        harness.cycle_and_settle().await;
    }

    assert_eq!(harness.workflows.removals(), [("wf-7".to_string(), true)]);
    let units = harness.units(&job).await;
    assert_eq!(units[0].remediation, Remediation::Escalated);
    let escalations = harness
        .events
        .events()
        .into_iter()
        .filter(|event| matches!(event, JobEvent::MismatchEscalated { .. }))
        .count();
    assert_eq!(escalations, 1);
}

#[tokio::test]
async fn corrupted_phase_is_skipped_and_its_units_are_kept() {
    let mut harness = Harness::new();
    let mut row = JobRow::from(&Job::new("legacy", ExecutionKind::Main, Utc::now()));
    row.phase = 47;
    harness.store.insert_job_row(row.clone()).await;

    let owner = Job {
        id: row.id,
        ..Job::new("legacy", ExecutionKind::Main, Utc::now())
    };
    let mut unit = unit_of(&owner, Stage::Postprocess, "ctr-legacy");
    unit.desired_state = UnitState::Running;
    unit.observed_state = UnitState::Running;
    harness.insert_unit(&unit).await;
    harness
        .containers
        .insert(SnapshotEntry::new("ctr-legacy", UnitState::Running));
    let healthy = harness
        .insert_job(Job::new("healthy", ExecutionKind::Main, Utc::now()))
        .await;

    let report = harness.cycle().await;

    assert_eq!(report.corrupted.len(), 1);
    assert_eq!(report.corrupted[0].id, row.id);
    assert_eq!(
        report.corrupted[0].error,
        DecodeError::PhaseDataCorruption { code: 47 }
    );
    assert_eq!(harness.store.job_row(row.id).await, Some(row));
    assert!(harness.containers.removals().is_empty());
    assert_ne!(harness.job(&healthy).await.phase, Phase::New);
}

#[tokio::test]
async fn failed_task_fails_the_job_with_its_error() {
    let mut harness = Harness::new();
    harness.containers.fail_creates(true);
    let job = harness
        .insert_job(Job::new("wing", ExecutionKind::Main, Utc::now()))
        .await;

    harness.cycle_and_settle().await;
    let report = harness.cycle().await;

    assert_eq!(report.tasks_lost, 1);
    let job = harness.job(&job).await;
    assert_eq!(job.phase, Phase::Failed);
    assert!(job.failure.as_ref().unwrap().contains("task failed"));
    let units = harness.units(&job).await;
    assert_eq!(units[0].observed_state, UnitState::NonExistent);
    assert_eq!(units[0].desired_state, UnitState::NonExistent);
    assert!(units[0].fault.is_some());
}

#[tokio::test]
async fn undispatchable_create_is_retried_next_cycle() {
    let templates = StageTemplates::default()
        .with(Stage::Process, StageTemplate::workflow("process-template"))
        .with(Stage::Export, StageTemplate::container("exporter"))
        .with(Stage::Synchronize, StageTemplate::container("sync"));
    let mut harness = Harness::builder().templates(templates).build();
    let job = harness
        .insert_job(Job::new("wing", ExecutionKind::Reprocess, Utc::now()))
        .await;

    let first = harness.cycle_and_settle().await;
    let second = harness.cycle_and_settle().await;

    assert_eq!(first.dispatch_failures, 1);
    assert_eq!(second.dispatch_failures, 1);
    assert_eq!(
        harness.job(&job).await.phase,
        Phase::Stage(Stage::Process, Step::Allocating)
    );
    let units = harness.units(&job).await;
    assert_eq!(units.len(), 1);
    assert!(units[0].external_id.is_empty());
    assert!(units[0].task_handle.is_none());
}

#[tokio::test]
async fn abort_during_pending_create_removes_the_unit_once_it_lands() {
    let mut harness = Harness::new();
    let job = harness
        .insert_job(Job::new("wing", ExecutionKind::Main, Utc::now()))
        .await;

    // The create is dispatched but has not run yet.
    harness.cycle().await;
    harness
        .store
        .set_signal(job.id, Some(JobSignal::Abort))
        .await
        .unwrap();
    harness.cycle_and_settle().await;
    harness.cycle_and_settle().await;

    assert_eq!(harness.containers.creations(), 1);
    assert_eq!(harness.containers.removals(), [("ctr-1".to_string(), true)]);
    assert!(harness.containers.ids().is_empty());

    harness.cycle_and_settle().await;

    let units = harness.units(&job).await;
    assert_eq!(units[0].remediation, Remediation::None);
    assert_eq!(units[0].mismatch_cycles, 0);
    assert_eq!(harness.job(&job).await.phase, Phase::FinishedAbort);
    assert_eq!(harness.containers.removals().len(), 1);
}

#[tokio::test]
async fn progress_is_read_from_logs_with_multibyte_text() {
    let mut harness = Harness::new();
    let job = harness
        .insert_job(job_in(
            Phase::Stage(Stage::Simulate, Step::Running),
            ExecutionKind::Main,
            Utc::now(),
        ))
        .await;
    let mut unit = unit_of(&job, Stage::Simulate, "ctr-1");
    unit.desired_state = UnitState::Running;
    unit.observed_state = UnitState::Running;
    harness.insert_unit(&unit).await;
    harness
        .containers
        .insert(SnapshotEntry::new("ctr-1", UnitState::Running));
    harness.containers.set_log("ctr-1", "solver step 3 ▸50%\n");

    harness.cycle().await;

    assert_eq!(harness.units(&job).await[0].progress, 50);
    assert_eq!(
        harness.job(&job).await.phase,
        Phase::Stage(Stage::Simulate, Step::Running)
    );
}
