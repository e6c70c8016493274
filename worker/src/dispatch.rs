use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use db::dtos::UnitBackend;
use futures::FutureExt;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{RuntimeClient, RuntimeError, UnitSpec};

/// A runtime call issued by the reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCommand {
    /// Create the unit and start it right away.
    Create {
        unit_id: Uuid,
        backend: UnitBackend,
        spec: UnitSpec,
    },
    Start {
        unit_id: Uuid,
        backend: UnitBackend,
        external_id: String,
    },
    Stop {
        unit_id: Option<Uuid>,
        backend: UnitBackend,
        external_id: String,
        timeout: Duration,
    },
    Remove {
        unit_id: Option<Uuid>,
        backend: UnitBackend,
        external_id: String,
        force: bool,
    },
}

impl RuntimeCommand {
    pub fn backend(&self) -> UnitBackend {
        match self {
            RuntimeCommand::Create { backend, .. }
            | RuntimeCommand::Start { backend, .. }
            | RuntimeCommand::Stop { backend, .. }
            | RuntimeCommand::Remove { backend, .. } => *backend,
        }
    }

    /// Local unit the result belongs to. `None` for orphan cleanup.
    pub fn unit_id(&self) -> Option<Uuid> {
        match self {
            RuntimeCommand::Create { unit_id, .. } | RuntimeCommand::Start { unit_id, .. } => {
                Some(*unit_id)
            }
            RuntimeCommand::Stop { unit_id, .. } | RuntimeCommand::Remove { unit_id, .. } => {
                *unit_id
            }
        }
    }

    pub fn external_id(&self) -> Option<&str> {
        match self {
            RuntimeCommand::Create { .. } => None,
            RuntimeCommand::Start { external_id, .. }
            | RuntimeCommand::Stop { external_id, .. }
            | RuntimeCommand::Remove { external_id, .. } => Some(external_id),
        }
    }

    pub fn verb(&self) -> &'static str {
        match self {
            RuntimeCommand::Create { .. } => "create",
            RuntimeCommand::Start { .. } => "start",
            RuntimeCommand::Stop { .. } => "stop",
            RuntimeCommand::Remove { .. } => "remove",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Created { external_id: String },
    Started,
    Stopped,
    Removed,
}

pub type TaskResult = Result<TaskOutcome, RuntimeError>;

/// Handle on a command running in the worker pool.
#[derive(Debug)]
pub struct TaskHandle {
    id: Uuid,
    verb: &'static str,
    unit_id: Option<Uuid>,
    external_id: Option<String>,
    /// Dropped once the result has been taken.
    join: Option<JoinHandle<TaskResult>>,
}

impl TaskHandle {
    pub fn new(command: &RuntimeCommand, join: JoinHandle<TaskResult>) -> Self {
        Self {
            id: Uuid::new_v4(),
            verb: command.verb(),
            unit_id: command.unit_id(),
            external_id: command.external_id().map(str::to_string),
            join: Some(join),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn verb(&self) -> &'static str {
        self.verb
    }

    pub fn unit_id(&self) -> Option<Uuid> {
        self.unit_id
    }

    pub fn external_id(&self) -> Option<&str> {
        self.external_id.as_deref()
    }

    /// Returns the result if the task has finished, without waiting.
    ///
    /// The result is handed out once; later calls return `None`.
    pub fn try_take(&mut self) -> Option<TaskResult> {
        let join = self.join.as_mut()?;
        if !join.is_finished() {
            return None;
        }

        let joined = join.now_or_never()?;
        self.join = None;

        match joined {
            Ok(result) => Some(result),
            Err(error) => Some(Err(RuntimeError::TaskPanicked(error.to_string()))),
        }
    }
}

/// Issues runtime commands without waiting for them.
pub trait TaskDispatcher: Send + Sync {
    fn dispatch(&self, command: RuntimeCommand) -> Result<TaskHandle, RuntimeError>;
}

/// Runs runtime commands on a dedicated tokio runtime, at most `concurrency` at a time.
pub struct WorkerPool {
    runtime: Handle,
    clients: HashMap<UnitBackend, Arc<dyn RuntimeClient>>,
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(runtime: Handle, concurrency: usize) -> Self {
        Self {
            runtime,
            clients: HashMap::new(),
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    pub fn with_client(mut self, backend: UnitBackend, client: Arc<dyn RuntimeClient>) -> Self {
        self.clients.insert(backend, client);
        self
    }

    /// Stops accepting commands. Tasks already spawned run to completion.
    pub fn close(&self) {
        self.permits.close();
    }
}

/// Multi-thread runtime backing a [`WorkerPool`].
///
/// Shut down in the background on drop, so it may be dropped from async code.
pub struct WorkerRuntime {
    handle: Handle,
    runtime: Option<Runtime>,
}

impl WorkerRuntime {
    pub fn new(threads: usize) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(threads.max(1))
            .thread_name("runtime-worker")
            .enable_all()
            .build()?;

        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
        })
    }

    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }
}

impl Drop for WorkerRuntime {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl TaskDispatcher for WorkerPool {
    fn dispatch(&self, command: RuntimeCommand) -> Result<TaskHandle, RuntimeError> {
        let backend = command.backend();
        let client = self.clients.get(&backend).cloned().ok_or_else(|| {
            RuntimeError::Unavailable(format!("no runtime configured for {backend} units"))
        })?;

        if self.permits.is_closed() {
            return Err(RuntimeError::Unavailable("worker pool is closed".to_string()));
        }

        let permits = self.permits.clone();
        let task_command = command.clone();
        let join = self.runtime.spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|_| RuntimeError::Unavailable("worker pool is closed".to_string()))?;

            execute(client.as_ref(), task_command).await
        });

        Ok(TaskHandle::new(&command, join))
    }
}

async fn execute(client: &dyn RuntimeClient, command: RuntimeCommand) -> TaskResult {
    match command {
        RuntimeCommand::Create { unit_id, spec, .. } => {
            let external_id = client.create_unit(&spec).await?;
            debug!(%unit_id, %external_id, "Created unit");

            // The unit exists now; a failed start is retried from the Starting phase.
            if let Err(error) = client.start_unit(&external_id).await {
                warn!(%unit_id, %external_id, "Failed to start freshly created unit: {error}");
            }

            Ok(TaskOutcome::Created { external_id })
        }
        RuntimeCommand::Start { external_id, .. } => {
            client.start_unit(&external_id).await?;
            Ok(TaskOutcome::Started)
        }
        RuntimeCommand::Stop {
            external_id,
            timeout,
            ..
        } => {
            client.stop_unit(&external_id, timeout).await?;
            Ok(TaskOutcome::Stopped)
        }
        RuntimeCommand::Remove {
            external_id, force, ..
        } => {
            client.remove_unit(&external_id, force).await?;
            Ok(TaskOutcome::Removed)
        }
    }
}
