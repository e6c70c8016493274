pub mod collector;
pub mod config;
pub mod driver;
pub mod events;
pub mod execution_unit;
pub mod ledger;
pub mod lease;
pub mod matrix;
pub mod phase;
pub mod reconciler;
pub mod templates;

pub use collector::TaskResultCollector;
pub use config::{Config, ConfigError};
pub use driver::{run_once, CycleError, RECONCILE_LEASE};
pub use events::{EventSink, LogEventSink, NatsEventSink};
pub use lease::{CycleLease, InProcessLease, LeaseError, LeaseGuard, RedisLease};
pub use matrix::MatchingMatrix;
pub use phase::{advance, AdvanceContext, SlotBudget, Transition};
pub use reconciler::{fix_mismatch_or_log, CycleReport, ReconcileError, ReconcileSettings, Reconciler};
pub use templates::{StageTemplate, StageTemplates};
