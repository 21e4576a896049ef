use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use std::fmt;
use std::sync::Arc;

/// The advisory lock held while a callback interprets. Re-entrant so a task
/// that synchronously runs a nested task on the same thread does not block
/// itself.
#[derive(Clone, Default)]
pub struct ScriptLock(Arc<ReentrantMutex<()>>);

impl ScriptLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self) -> ReentrantMutexGuard<'_, ()> {
        self.0.lock()
    }

    pub fn is_locked(&self) -> bool {
        self.0.is_locked()
    }

    pub fn same_lock(&self, other: &ScriptLock) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for ScriptLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptLock")
            .field("locked", &self.is_locked())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn reentrant_on_the_same_thread() {
        let lock = ScriptLock::new();
        let outer = lock.acquire();
        let inner = lock.acquire();
        assert!(lock.is_locked());
        drop(inner);
        drop(outer);
        assert!(!lock.is_locked());
    }

    #[test]
    fn excludes_other_threads() {
        let lock = ScriptLock::new();
        let guard = lock.acquire();
        let other = lock.clone();
        let contended = thread::spawn(move || other.0.try_lock().is_none())
            .join()
            .unwrap();
        assert!(contended);
        drop(guard);
    }
}
