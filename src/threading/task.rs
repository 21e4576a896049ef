//! Units of work handed to the [`TaskPool`](crate::threading::pool::TaskPool).
//! A task remembers the owner generation it was created under so work queued
//! before a recompilation can be recognised and dropped.

use crate::runtime::error::ScriptError;
use crate::threading::context::ThreadKind;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Stable identity of an [`OwnerHandle`] for as long as it is alive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OwnerId(usize);

/// Shared handle to whatever a task acts on behalf of (usually a script
/// processor). Outlives the tasks that reference it.
#[derive(Debug)]
pub struct OwnerHandle {
    name: String,
    generation: AtomicU64,
    repaint_pending: AtomicBool,
}

impl OwnerHandle {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            generation: AtomicU64::new(0),
            repaint_pending: AtomicBool::new(false),
        })
    }

    pub fn id(self: &Arc<Self>) -> OwnerId {
        OwnerId(Arc::as_ptr(self) as usize)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Marks every task created before this call as stale.
    pub fn invalidate(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn request_repaint(&self) {
        self.repaint_pending.store(true, Ordering::Release);
    }

    /// Clears the repaint flag, returning whether it was set.
    pub fn take_repaint(&self) -> bool {
        self.repaint_pending.swap(false, Ordering::AcqRel)
    }

    pub fn repaint_flag(&self) -> &AtomicBool {
        &self.repaint_pending
    }
}

/// Priority class. Ordering follows priority: compilation beats high which
/// beats low.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskKind {
    LowPriorityCallback,
    HighPriorityCallback,
    Compilation,
}

impl TaskKind {
    pub const ALL: [TaskKind; 3] = [
        TaskKind::Compilation,
        TaskKind::HighPriorityCallback,
        TaskKind::LowPriorityCallback,
    ];

    pub fn name(self) -> &'static str {
        match self {
            TaskKind::LowPriorityCallback => "low-priority",
            TaskKind::HighPriorityCallback => "high-priority",
            TaskKind::Compilation => "compilation",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a running task can see about where it runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaskContext {
    pub kind: TaskKind,
    pub thread: ThreadKind,
    /// Extra execution time granted by the scheduler; non-zero for compilations.
    pub timeout_extension: Duration,
}

pub type TaskFn = Box<dyn FnOnce(&TaskContext) -> Result<(), ScriptError> + Send>;

pub struct Task {
    kind: TaskKind,
    owner: Arc<OwnerHandle>,
    generation: u64,
    callable: TaskFn,
}

impl Task {
    pub fn new<F>(kind: TaskKind, owner: &Arc<OwnerHandle>, f: F) -> Self
    where
        F: FnOnce(&TaskContext) -> Result<(), ScriptError> + Send + 'static,
    {
        Self {
            kind,
            owner: Arc::clone(owner),
            generation: owner.generation(),
            callable: Box::new(f),
        }
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn owner(&self) -> &Arc<OwnerHandle> {
        &self.owner
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// True once the owner was recompiled after this task was created.
    pub fn is_stale(&self) -> bool {
        self.owner.generation() != self.generation
    }

    pub fn run(self, ctx: &TaskContext) -> Result<(), ScriptError> {
        (self.callable)(ctx)
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.owner.id() == other.owner.id()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("kind", &self.kind)
            .field("owner", &self.owner.name())
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priorities_are_ordered() {
        assert!(TaskKind::Compilation > TaskKind::HighPriorityCallback);
        assert!(TaskKind::HighPriorityCallback > TaskKind::LowPriorityCallback);
    }

    #[test]
    fn invalidation_makes_earlier_tasks_stale() {
        let owner = OwnerHandle::new("synth");
        let before = Task::new(TaskKind::LowPriorityCallback, &owner, |_| Ok(()));
        assert!(!before.is_stale());
        owner.invalidate();
        let after = Task::new(TaskKind::LowPriorityCallback, &owner, |_| Ok(()));
        assert!(before.is_stale());
        assert!(!after.is_stale());
    }

    #[test]
    fn tasks_compare_by_owner() {
        let a = OwnerHandle::new("a");
        let b = OwnerHandle::new("b");
        let first = Task::new(TaskKind::Compilation, &a, |_| Ok(()));
        let second = Task::new(TaskKind::LowPriorityCallback, &a, |_| Ok(()));
        let third = Task::new(TaskKind::Compilation, &b, |_| Ok(()));
        assert_eq!(first, second);
        assert_ne!(first, third);
    }

    #[test]
    fn repaint_flag_is_taken_once() {
        let owner = OwnerHandle::new("ui");
        assert!(!owner.take_repaint());
        owner.request_repaint();
        assert!(owner.take_repaint());
        assert!(!owner.take_repaint());
    }
}
