//! Priority task queues and the thread-aware routing that decides whether a
//! requested task runs right away or waits for the scripting worker.

use crate::config::EngineConfig;
use crate::runtime::error::{ErrorKind, ScriptError};
use crate::threading::context::{EngineContext, ThreadKind};
use crate::threading::lock::ScriptLock;
use crate::threading::task::{OwnerHandle, OwnerId, Task, TaskContext, TaskKind};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::{debug, error, warn};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread::{self, Thread, ThreadId};
use std::time::Duration;

/// Outcome of one [`TaskPool::run_pending`] pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Tasks that ran and returned `Ok`.
    pub executed: usize,
    /// Tasks dropped because their owner was recompiled after they were queued.
    pub skipped: usize,
    pub failed: usize,
}

impl DrainReport {
    pub fn is_empty(&self) -> bool {
        self.executed == 0 && self.skipped == 0 && self.failed == 0
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

#[derive(Clone, Copy, Debug)]
struct RunningTask {
    kind: TaskKind,
    owner: OwnerId,
}

struct TaskQueue {
    tx: Sender<Task>,
    rx: Receiver<Task>,
}

impl TaskQueue {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self { tx, rx }
    }
}

pub struct TaskPool {
    compilation: TaskQueue,
    high: TaskQueue,
    low: TaskQueue,
    running: Mutex<HashMap<ThreadId, Vec<RunningTask>>>,
    owners: Mutex<Vec<Weak<OwnerHandle>>>,
    worker: Mutex<Option<Thread>>,
    lock: ScriptLock,
    max_reentrancy_depth: usize,
    compilation_extension: Duration,
}

/// Pops the running-stack entry when a task finishes, whichever way it exits.
struct RunningGuard<'a> {
    pool: &'a TaskPool,
    thread: ThreadId,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        let mut running = self.pool.running.lock();
        if let Some(stack) = running.get_mut(&self.thread) {
            stack.pop();
            if stack.is_empty() {
                running.remove(&self.thread);
            }
        }
    }
}

impl TaskPool {
    pub fn new(config: &EngineConfig) -> Self {
        Self::with_lock(config, ScriptLock::new())
    }

    pub fn with_lock(config: &EngineConfig, lock: ScriptLock) -> Self {
        let capacity = config.task_queue_capacity.max(1);
        Self {
            compilation: TaskQueue::new(capacity),
            high: TaskQueue::new(capacity),
            low: TaskQueue::new(capacity),
            running: Mutex::new(HashMap::new()),
            owners: Mutex::new(Vec::new()),
            worker: Mutex::new(None),
            lock,
            max_reentrancy_depth: config.max_reentrancy_depth,
            compilation_extension: config.compilation_timeout_extension(),
        }
    }

    pub fn script_lock(&self) -> &ScriptLock {
        &self.lock
    }

    fn queue(&self, kind: TaskKind) -> &TaskQueue {
        match kind {
            TaskKind::Compilation => &self.compilation,
            TaskKind::HighPriorityCallback => &self.high,
            TaskKind::LowPriorityCallback => &self.low,
        }
    }

    pub fn pending(&self) -> usize {
        TaskKind::ALL.iter().map(|kind| self.pending_of(*kind)).sum()
    }

    pub fn pending_of(&self, kind: TaskKind) -> usize {
        self.queue(kind).rx.len()
    }

    /// Priority of the innermost task running on the calling thread.
    pub fn current_kind(&self) -> Option<TaskKind> {
        self.running
            .lock()
            .get(&thread::current().id())
            .and_then(|stack| stack.last())
            .map(|entry| entry.kind)
    }

    /// Number of tasks nested on the calling thread.
    pub fn depth(&self) -> usize {
        self.running
            .lock()
            .get(&thread::current().id())
            .map_or(0, Vec::len)
    }

    fn running_on_this_thread(&self, owner: OwnerId) -> bool {
        self.running
            .lock()
            .get(&thread::current().id())
            .is_some_and(|stack| stack.iter().any(|entry| entry.owner == owner))
    }

    /// Routes `task` according to the calling thread. Never returns an error:
    /// failures of synchronously executed tasks are logged.
    ///
    /// # Panics
    /// When called from the audio thread.
    pub fn add_job(&self, ctx: &dyn EngineContext, task: Task) {
        let thread_kind = ctx.current_thread();
        assert!(
            thread_kind != ThreadKind::Audio,
            "the task pool must never be called from the audio thread"
        );
        self.track_owner(task.owner());

        match thread_kind {
            ThreadKind::SampleLoading => {
                if task.kind() == TaskKind::LowPriorityCallback {
                    self.enqueue(task);
                } else {
                    self.run_now(ctx, task, thread_kind);
                }
            }
            ThreadKind::Scripting => match self.current_kind() {
                None => {
                    self.enqueue(task);
                    self.notify();
                }
                Some(running) if task.kind() < running => {
                    debug!(
                        "deferring {} task for `{}` while {running} code runs",
                        task.kind(),
                        task.owner().name()
                    );
                    self.enqueue(task);
                }
                Some(_) => {
                    if self.depth() >= self.max_reentrancy_depth {
                        warn!(
                            "re-entrancy depth {} reached, deferring {} task for `{}`",
                            self.max_reentrancy_depth,
                            task.kind(),
                            task.owner().name()
                        );
                        self.enqueue(task);
                    } else if self.running_on_this_thread(task.owner().id()) {
                        warn!(
                            "`{}` is already executing on this thread, deferring {} task",
                            task.owner().name(),
                            task.kind()
                        );
                        self.enqueue(task);
                    } else {
                        self.run_now(ctx, task, thread_kind);
                    }
                }
            },
            ThreadKind::Message => {
                if ctx.is_initialised() {
                    self.enqueue(task);
                    self.notify();
                } else {
                    self.run_now(ctx, task, thread_kind);
                }
            }
            ThreadKind::Other | ThreadKind::Audio => {
                self.enqueue(task);
                self.notify();
            }
        }
    }

    fn enqueue(&self, task: Task) {
        let kind = task.kind();
        match self.queue(kind).tx.try_send(task) {
            Ok(()) => debug!("queued {kind} task"),
            Err(TrySendError::Full(task)) => error!(
                "{kind} queue is full, dropping task for `{}`",
                task.owner().name()
            ),
            Err(TrySendError::Disconnected(task)) => error!(
                "{kind} queue is closed, dropping task for `{}`",
                task.owner().name()
            ),
        }
    }

    fn run_now(&self, ctx: &dyn EngineContext, task: Task, thread: ThreadKind) {
        let kind = task.kind();
        let owner = Arc::clone(task.owner());
        if kind == TaskKind::Compilation {
            ctx.suspend_voices_and_extend_timeout(self.compilation_extension);
        }
        if let Err(err) = self.execute(task, thread) {
            error!("{kind} task for `{}` failed: {err}", owner.name());
        }
    }

    /// Runs one task under the script lock. A compilation invalidates every
    /// task of the same owner queued before it and is handed the timeout
    /// extension for its deadline. A panicking task is reported as a failure.
    fn execute(&self, task: Task, thread: ThreadKind) -> Result<(), ScriptError> {
        let _lock = self.lock.acquire();
        let kind = task.kind();
        if kind == TaskKind::Compilation {
            let generation = task.owner().invalidate();
            debug!(
                "`{}` advanced to generation {generation}",
                task.owner().name()
            );
        }
        let thread_id = thread::current().id();
        self.running
            .lock()
            .entry(thread_id)
            .or_default()
            .push(RunningTask {
                kind,
                owner: task.owner().id(),
            });
        let _running = RunningGuard {
            pool: self,
            thread: thread_id,
        };
        let timeout_extension = if kind == TaskKind::Compilation {
            self.compilation_extension
        } else {
            Duration::ZERO
        };
        let task_ctx = TaskContext {
            kind,
            thread,
            timeout_extension,
        };
        panic::catch_unwind(AssertUnwindSafe(|| task.run(&task_ctx))).unwrap_or_else(|payload| {
            Err(ScriptError::new(
                ErrorKind::Runtime,
                format!("task panicked: {}", panic_message(payload.as_ref())),
            ))
        })
    }

    fn next_task(&self) -> Option<Task> {
        TaskKind::ALL
            .iter()
            .find_map(|kind| self.queue(*kind).rx.try_recv().ok())
    }

    /// One drain pass: compilation first, then high, then low priority. The
    /// queues are re-checked before every pop so work queued by a running task
    /// is ordered correctly. Ends by flushing deferred repaints.
    pub fn run_pending(&self, ctx: &dyn EngineContext) -> DrainReport {
        let mut report = DrainReport::default();
        let thread = ctx.current_thread();
        let budget = self.pending();

        for _ in 0..budget {
            let Some(task) = self.next_task() else {
                break;
            };
            let kind = task.kind();
            if kind != TaskKind::Compilation && task.is_stale() {
                debug!(
                    "skipping stale {kind} task for `{}`",
                    task.owner().name()
                );
                report.skipped += 1;
                continue;
            }
            if kind == TaskKind::Compilation {
                ctx.suspend_voices_and_extend_timeout(self.compilation_extension);
            }
            let owner = Arc::clone(task.owner());
            match self.execute(task, thread) {
                Ok(()) => report.executed += 1,
                Err(err) => {
                    error!("{kind} task for `{}` failed: {err}", owner.name());
                    report.failed += 1;
                }
            }
        }

        self.flush_repaints(ctx);
        report
    }

    fn track_owner(&self, owner: &Arc<OwnerHandle>) {
        let mut owners = self.owners.lock();
        owners.retain(|known| known.strong_count() > 0);
        if !owners
            .iter()
            .any(|known| std::ptr::eq(known.as_ptr(), Arc::as_ptr(owner)))
        {
            owners.push(Arc::downgrade(owner));
        }
    }

    /// Delivers pending repaint requests of every owner the pool has seen.
    pub fn flush_repaints(&self, ctx: &dyn EngineContext) -> usize {
        let owners: Vec<Arc<OwnerHandle>> = self
            .owners
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        let mut flushed = 0;
        for owner in owners {
            if owner.take_repaint() {
                ctx.repaint(&owner);
                flushed += 1;
            }
        }
        flushed
    }

    pub fn attach_worker(&self, worker: Thread) {
        *self.worker.lock() = Some(worker);
    }

    pub fn detach_worker(&self) {
        self.worker.lock().take();
    }

    /// Wakes the scripting worker if one is attached.
    pub fn notify(&self) {
        if let Some(worker) = self.worker.lock().as_ref() {
            worker.unpark();
        }
    }
}
