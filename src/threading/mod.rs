pub mod context;
pub mod dispatcher;
pub mod lock;
pub mod pool;
pub mod task;
pub mod worker;

pub use context::{EngineContext, HostContext, ThreadKind};
pub use dispatcher::{JobHandle, JobStatus, LockFreeDispatcher};
pub use lock::ScriptLock;
pub use pool::{DrainReport, TaskPool};
pub use task::{OwnerHandle, OwnerId, Task, TaskContext, TaskKind};
pub use worker::ScriptingWorker;
