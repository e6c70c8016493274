#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use db::dtos::{ExecutionKind, ExecutionUnit, Job, JobEvent, Phase, Stage, UnitBackend, UnitState};
use db::{JobStore, MemoryStore};
use scheduler::{CycleReport, EventSink, ReconcileError, ReconcileSettings, Reconciler, StageTemplates};
use tokio::runtime::Handle;
use worker::testing::FakeRuntime;
use worker::WorkerPool;

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<JobEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<JobEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn publish(&self, event: &JobEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

pub struct Harness {
    pub store: MemoryStore,
    pub containers: Arc<FakeRuntime>,
    pub workflows: Arc<FakeRuntime>,
    pub events: Arc<RecordingSink>,
    pub reconciler: Reconciler,
}

pub struct HarnessBuilder {
    settings: ReconcileSettings,
    templates: StageTemplates,
    workflows: bool,
}

impl HarnessBuilder {
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.settings.max_concurrent_jobs = capacity;
        self
    }

    pub fn snapshot_timeout(mut self, timeout: Duration) -> Self {
        self.settings.snapshot_timeout = timeout;
        self
    }

    pub fn templates(mut self, templates: StageTemplates) -> Self {
        self.templates = templates;
        self
    }

    pub fn with_workflows(mut self) -> Self {
        self.workflows = true;
        self
    }

    pub fn build(self) -> Harness {
        let store = MemoryStore::new();
        let containers = Arc::new(FakeRuntime::new("ctr"));
        let workflows = Arc::new(FakeRuntime::new("wf"));
        let events = Arc::new(RecordingSink::default());

        let mut pool = WorkerPool::new(Handle::current(), 4)
            .with_client(UnitBackend::Container, containers.clone());
        if self.workflows {
            pool = pool.with_client(UnitBackend::Workflow, workflows.clone());
        }

        let mut reconciler = Reconciler::new(
            Arc::new(store.clone()),
            containers.clone(),
            Arc::new(pool),
            events.clone(),
            self.templates,
            self.settings,
        );
        if self.workflows {
            reconciler = reconciler.with_workflows(workflows.clone());
        }

        Harness {
            store,
            containers,
            workflows,
            events,
            reconciler,
        }
    }
}

impl Harness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder {
            settings: ReconcileSettings {
                log_fetch_timeout: Duration::from_millis(200),
                ..ReconcileSettings::default()
            },
            templates: StageTemplates::uniform("solver:latest"),
            workflows: false,
        }
    }

    pub fn new() -> Self {
        Self::builder().build()
    }

    pub async fn try_cycle(&mut self) -> Result<CycleReport, ReconcileError> {
        self.reconciler.run_cycle().await
    }

    pub async fn cycle(&mut self) -> CycleReport {
        self.reconciler.run_cycle().await.expect("cycle failed")
    }

    /// Cycle, then let the dispatched runtime tasks finish.
    pub async fn cycle_and_settle(&mut self) -> CycleReport {
        let report = self.cycle().await;
        settle().await;
        report
    }

    pub async fn insert_job(&self, job: Job) -> Job {
        self.store.insert_job(&job).await.unwrap()
    }

    pub async fn insert_unit(&self, unit: &ExecutionUnit) {
        self.store.insert_unit(unit).await.unwrap();
    }

    pub async fn job(&self, job: &Job) -> Job {
        self.store.job(job.id).await.expect("job not found")
    }

    pub async fn units(&self, job: &Job) -> Vec<ExecutionUnit> {
        self.store.units_of(job.id).await
    }

    /// Every running container exits with code 0.
    pub fn finish_running_containers(&self) {
        for id in self.containers.ids() {
            if self.containers.entry(&id).map(|entry| entry.observed_state) == Some(UnitState::Running) {
                self.containers.set_state(&id, UnitState::Exited, Some(0));
            }
        }
    }
}

pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

pub fn job_in(phase: Phase, kind: ExecutionKind, started_at: DateTime<Utc>) -> Job {
    let mut job = Job::new("wing-load-case", kind, started_at);
    job.phase = phase;
    job.stage = phase.stage();
    job.started_at = Some(started_at);
    job
}

pub fn unit_of(job: &Job, stage: Stage, external_id: &str) -> ExecutionUnit {
    let mut unit = ExecutionUnit::new(job.id, stage, UnitBackend::Container, Utc::now());
    unit.external_id = external_id.to_string();
    unit
}
