mod execution_unit;
mod job;

pub use execution_unit::UnitRow;
pub use job::JobRow;
