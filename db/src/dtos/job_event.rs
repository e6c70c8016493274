use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Phase, UnitBackend, UnitState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum JobEvent {
    #[serde(rename_all = "camelCase")]
    PhaseChanged {
        job_id: Uuid,
        from: Phase,
        to: Phase,
        at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    OrphanRemoved {
        backend: UnitBackend,
        external_id: String,
        at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    MismatchEscalated {
        job_id: Uuid,
        unit_id: Uuid,
        external_id: String,
        desired: UnitState,
        observed: UnitState,
        at: DateTime<Utc>,
    },
}
