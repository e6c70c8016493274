mod execution_kind;
mod execution_unit;
mod job;
mod job_event;
mod phase;
mod stage;
mod unit_state;

pub use execution_kind::*;
pub use execution_unit::*;
pub use job::*;
pub use job_event::*;
pub use phase::*;
pub use stage::*;
pub use unit_state::*;
