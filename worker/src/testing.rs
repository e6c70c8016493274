//! In-memory runtime for tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use db::dtos::UnitState;
use uuid::Uuid;

use crate::{RuntimeClient, RuntimeError, SnapshotEntry, UnitSpec};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    List,
    Create { name: String, unit: Option<Uuid> },
    Start(String),
    Stop(String),
    Remove { external_id: String, force: bool },
    FetchLog(String),
}

#[derive(Default)]
struct FakeState {
    units: BTreeMap<String, SnapshotEntry>,
    logs: HashMap<String, String>,
    stuck: HashSet<String>,
    calls: Vec<RuntimeCall>,
    next_id: u64,
    list_delay: Option<Duration>,
    unavailable: bool,
    fail_creates: bool,
}

/// Runtime double that keeps its units in memory and records every call.
pub struct FakeRuntime {
    prefix: String,
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            state: Mutex::new(FakeState::default()),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut FakeState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut state)
    }

    pub fn insert(&self, entry: SnapshotEntry) {
        self.with_state(|state| {
            state.units.insert(entry.external_id.clone(), entry);
        });
    }

    pub fn set_state(&self, external_id: &str, observed: UnitState, exit_code: Option<i64>) {
        self.with_state(|state| {
            if let Some(entry) = state.units.get_mut(external_id) {
                entry.observed_state = observed;
                entry.exit_code = exit_code;
            }
        });
    }

    /// Drops a unit without recording a call, as if it vanished on its own.
    pub fn forget(&self, external_id: &str) {
        self.with_state(|state| {
            state.units.remove(external_id);
        });
    }

    pub fn set_log(&self, external_id: &str, log: impl Into<String>) {
        self.with_state(|state| {
            state.logs.insert(external_id.to_string(), log.into());
        });
    }

    /// A stuck unit accepts stop and remove calls but stays as it is.
    pub fn set_stuck(&self, external_id: &str, stuck: bool) {
        self.with_state(|state| {
            if stuck {
                state.stuck.insert(external_id.to_string());
            } else {
                state.stuck.remove(external_id);
            }
        });
    }

    pub fn set_list_delay(&self, delay: Option<Duration>) {
        self.with_state(|state| state.list_delay = delay);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.with_state(|state| state.unavailable = unavailable);
    }

    pub fn fail_creates(&self, fail: bool) {
        self.with_state(|state| state.fail_creates = fail);
    }

    pub fn entry(&self, external_id: &str) -> Option<SnapshotEntry> {
        self.with_state(|state| state.units.get(external_id).cloned())
    }

    pub fn ids(&self) -> Vec<String> {
        self.with_state(|state| state.units.keys().cloned().collect())
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.with_state(|state| state.calls.clone())
    }

    pub fn clear_calls(&self) {
        self.with_state(|state| state.calls.clear());
    }

    pub fn creations(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, RuntimeCall::Create { .. }))
            .count()
    }

    pub fn removals(&self) -> Vec<(String, bool)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                RuntimeCall::Remove { external_id, force } => Some((external_id, force)),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl RuntimeClient for FakeRuntime {
    async fn list_units(&self) -> Result<Vec<SnapshotEntry>, RuntimeError> {
        let (delay, unavailable) = self.with_state(|state| {
            state.calls.push(RuntimeCall::List);
            (state.list_delay, state.unavailable)
        });

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if unavailable {
            return Err(RuntimeError::Unavailable("fake runtime is down".to_string()));
        }

        Ok(self.with_state(|state| state.units.values().cloned().collect()))
    }

    async fn create_unit(&self, spec: &UnitSpec) -> Result<String, RuntimeError> {
        self.with_state(|state| {
            state.calls.push(RuntimeCall::Create {
                name: spec.name.clone(),
                unit: spec.unit_id(),
            });
            if state.unavailable {
                return Err(RuntimeError::Unavailable("fake runtime is down".to_string()));
            }
            if state.fail_creates {
                return Err(RuntimeError::Rejected(format!("cannot create {}", spec.name)));
            }

            state.next_id += 1;
            let external_id = format!("{}-{}", self.prefix, state.next_id);
            let mut entry = SnapshotEntry::new(external_id.clone(), UnitState::Created);
            entry.labels = spec.labels.clone();
            state.units.insert(external_id.clone(), entry);

            Ok(external_id)
        })
    }

    async fn start_unit(&self, external_id: &str) -> Result<(), RuntimeError> {
        self.with_state(|state| {
            state.calls.push(RuntimeCall::Start(external_id.to_string()));
            let entry = state
                .units
                .get_mut(external_id)
                .ok_or_else(|| RuntimeError::NotFound(external_id.to_string()))?;
            if entry.observed_state == UnitState::Created {
                entry.observed_state = UnitState::Running;
            }
            Ok(())
        })
    }

    async fn stop_unit(&self, external_id: &str, _timeout: Duration) -> Result<(), RuntimeError> {
        self.with_state(|state| {
            state.calls.push(RuntimeCall::Stop(external_id.to_string()));
            if state.stuck.contains(external_id) {
                return Ok(());
            }
            if let Some(entry) = state.units.get_mut(external_id) {
                if matches!(
                    entry.observed_state,
                    UnitState::Running | UnitState::Paused | UnitState::Pending
                ) {
                    entry.observed_state = UnitState::Exited;
                    entry.exit_code = Some(137);
                }
            }
            Ok(())
        })
    }

    async fn remove_unit(&self, external_id: &str, force: bool) -> Result<(), RuntimeError> {
        self.with_state(|state| {
            state.calls.push(RuntimeCall::Remove {
                external_id: external_id.to_string(),
                force,
            });
            if !state.stuck.contains(external_id) {
                state.units.remove(external_id);
            }
            Ok(())
        })
    }

    async fn fetch_log(&self, external_id: &str, tail_lines: usize) -> Result<String, RuntimeError> {
        self.with_state(|state| {
            state.calls.push(RuntimeCall::FetchLog(external_id.to_string()));
            let log = state
                .logs
                .get(external_id)
                .ok_or_else(|| RuntimeError::NotFound(external_id.to_string()))?;
            let lines: Vec<&str> = log.lines().collect();
            let start = lines.len().saturating_sub(tail_lines);
            Ok(lines[start..].join("\n"))
        })
    }
}
