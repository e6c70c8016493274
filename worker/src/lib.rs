pub mod dispatch;
pub mod docker;
pub mod error;
pub mod runtime;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use dispatch::{
    RuntimeCommand, TaskDispatcher, TaskHandle, TaskOutcome, TaskResult, WorkerPool, WorkerRuntime,
};
pub use docker::DockerRuntime;
pub use error::RuntimeError;
pub use runtime::{RuntimeClient, SnapshotEntry, UnitSpec};
