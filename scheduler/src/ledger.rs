//! Cycle-local copy of the persisted records.

use std::collections::{HashMap, HashSet};

use db::dtos::{ExecutionUnit, Job};
use db::{DecodeError, JobStore, StoreError};
use tracing::error;
use uuid::Uuid;

/// A stored record that failed to decode and is excluded from processing
/// until it is migrated by hand.
#[derive(Debug, Clone, PartialEq)]
pub struct CorruptedRecord {
    pub entity: &'static str,
    pub id: Uuid,
    pub error: DecodeError,
}

/// Jobs in run order and their active units, as loaded at the start of a cycle.
pub struct Ledger {
    pub jobs: Vec<Job>,
    pub units: Vec<ExecutionUnit>,
    pub corrupted: Vec<CorruptedRecord>,
    /// External ids of units that could not be decoded. They still exist and
    /// must never be taken for orphans.
    pub reserved_external_ids: HashSet<String>,
    loaded_jobs: HashMap<Uuid, Job>,
    loaded_units: HashMap<Uuid, ExecutionUnit>,
}

impl Ledger {
    pub async fn load(store: &dyn JobStore) -> Result<Self, StoreError> {
        let mut corrupted = Vec::new();

        let mut jobs = Vec::new();
        for row in store.jobs_in_run_order().await? {
            let id = row.id;
            match Job::try_from(row) {
                Ok(job) => jobs.push(job),
                Err(error) => {
                    error!(job_id = %id, "Skipping job until it is migrated: {error}");
                    corrupted.push(CorruptedRecord {
                        entity: "job",
                        id,
                        error,
                    });
                }
            }
        }
        jobs.sort_by_key(|job| (job.started_at.is_none(), job.started_at, job.key));

        let mut rows = store.active_units().await?;
        let mut seen: HashSet<Uuid> = rows.iter().map(|row| row.id).collect();
        // A retired unit can still hold a task whose result must be collected.
        for row in store.units_with_task_handle().await? {
            if seen.insert(row.id) {
                rows.push(row);
            }
        }
        rows.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));

        let mut units = Vec::new();
        let mut reserved_external_ids = HashSet::new();
        for row in rows {
            let (id, external_id) = (row.id, row.external_id.clone());
            match ExecutionUnit::try_from(row) {
                Ok(unit) => units.push(unit),
                Err(error) => {
                    error!(unit_id = %id, %external_id, "Skipping execution unit until it is migrated: {error}");
                    if !external_id.is_empty() {
                        reserved_external_ids.insert(external_id);
                    }
                    corrupted.push(CorruptedRecord {
                        entity: "execution unit",
                        id,
                        error,
                    });
                }
            }
        }

        Ok(Self {
            loaded_jobs: jobs.iter().map(|job| (job.id, job.clone())).collect(),
            loaded_units: units.iter().map(|unit| (unit.id, unit.clone())).collect(),
            jobs,
            units,
            corrupted,
            reserved_external_ids,
        })
    }

    /// Writes back every record that changed since [`Ledger::load`] and inserts
    /// new units. Returns the number of records written.
    pub async fn persist(&self, store: &dyn JobStore) -> Result<usize, StoreError> {
        let mut written = 0;

        for unit in &self.units {
            match self.loaded_units.get(&unit.id) {
                None => store.insert_unit(unit).await?,
                Some(loaded) if loaded == unit => continue,
                Some(_) => store.save_unit(unit).await?,
            }
            written += 1;
        }

        for job in &self.jobs {
            if self.loaded_jobs.get(&job.id) == Some(job) {
                continue;
            }
            store.save_job(job).await?;
            written += 1;
        }

        Ok(written)
    }

    pub fn corrupted_jobs(&self) -> impl Iterator<Item = &CorruptedRecord> {
        self.corrupted.iter().filter(|record| record.entity == "job")
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use db::dtos::{ExecutionKind, Phase, Stage, TaskRef, UnitBackend, UnitState};
    use db::entities::JobRow;
    use db::MemoryStore;

    use super::*;

    #[tokio::test]
    async fn corrupted_jobs_are_reported_not_loaded() {
        let store = MemoryStore::new();
        let good = store
            .insert_job(&Job::new("good", ExecutionKind::Main, Utc::now()))
            .await
            .unwrap();
        let mut row = JobRow::from(&Job::new("broken", ExecutionKind::Main, Utc::now()));
        row.phase = 47;
        store.insert_job_row(row).await;

        let ledger = Ledger::load(&store).await.unwrap();

        assert!(ledger.jobs.iter().any(|job| job.id == good.id));
        let corrupted: Vec<_> = ledger.corrupted_jobs().collect();
        assert_eq!(corrupted.len(), 1);
        assert_eq!(corrupted[0].error, DecodeError::PhaseDataCorruption { code: 47 });
    }

    #[tokio::test]
    async fn loads_retired_units_only_while_they_hold_a_task() {
        let store = MemoryStore::new();
        let job = store
            .insert_job(&Job::new("wing", ExecutionKind::Main, Utc::now()))
            .await
            .unwrap();

        let mut pending = ExecutionUnit::new(job.id, Stage::Export, UnitBackend::Container, Utc::now());
        pending.desired_state = UnitState::NonExistent;
        pending.task_handle = Some(TaskRef::Dispatched(Uuid::new_v4()));
        let mut retired = ExecutionUnit::new(job.id, Stage::Simulate, UnitBackend::Container, Utc::now());
        retired.desired_state = UnitState::NonExistent;
        let live = ExecutionUnit::new(job.id, Stage::Synchronize, UnitBackend::Container, Utc::now());
        for unit in [&pending, &retired, &live] {
            store.insert_unit(unit).await.unwrap();
        }

        let ledger = Ledger::load(&store).await.unwrap();

        let ids: HashSet<Uuid> = ledger.units.iter().map(|unit| unit.id).collect();
        assert_eq!(ids, HashSet::from([pending.id, live.id]));
    }

    #[tokio::test]
    async fn jobs_started_together_keep_submission_order() {
        let store = MemoryStore::new();
        let started_at = Utc::now();
        let mut keys = Vec::new();
        for name in ["first", "second", "third"] {
            let mut job = Job::new(name, ExecutionKind::Main, started_at);
            job.phase = Phase::Queued;
            job.started_at = Some(started_at);
            keys.push(store.insert_job(&job).await.unwrap().key);
        }

        let ledger = Ledger::load(&store).await.unwrap();

        let names: Vec<&str> = ledger.jobs.iter().map(|job| job.name.as_str()).collect();
        assert_eq!(names, ["first", "second", "third"]);
        assert!(keys.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[tokio::test]
    async fn persists_only_changes() {
        let store = MemoryStore::new();
        let job = store
            .insert_job(&Job::new("wing", ExecutionKind::Main, Utc::now()))
            .await
            .unwrap();

        let mut ledger = Ledger::load(&store).await.unwrap();
        assert_eq!(ledger.persist(&store).await.unwrap(), 0);

        ledger.jobs[0].phase = Phase::Queued;
        ledger
            .units
            .push(ExecutionUnit::new(job.id, Stage::Preprocess, UnitBackend::Container, Utc::now()));
        assert_eq!(ledger.persist(&store).await.unwrap(), 2);

        assert_eq!(store.job(job.id).await.map(|job| job.phase), Some(Phase::Queued));
        assert_eq!(store.unit_count().await, 1);
    }
}
