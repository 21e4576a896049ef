use crate::threading::context::{EngineContext, ThreadKind};
use crate::threading::pool::TaskPool;
use log::{debug, error, info};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Stack of the scripting thread; deep script recursion is bounded by
/// `EngineConfig::max_call_depth` well inside it.
const WORKER_STACK_SIZE: usize = 8 * 1024 * 1024;

/// The dedicated scripting thread: drains the pool, then sleeps for a fixed
/// interval or until [`TaskPool::notify`] wakes it.
pub struct ScriptingWorker {
    stop: Arc<AtomicBool>,
    pool: Arc<TaskPool>,
    handle: Option<JoinHandle<()>>,
}

impl ScriptingWorker {
    pub fn spawn(
        pool: Arc<TaskPool>,
        ctx: Arc<dyn EngineContext>,
        interval: Duration,
    ) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let handle = thread::Builder::new()
            .name("script-worker".into())
            .stack_size(WORKER_STACK_SIZE)
            .spawn({
                let stop = Arc::clone(&stop);
                let pool = Arc::clone(&pool);
                move || {
                    ctx.register_current_thread(ThreadKind::Scripting);
                    pool.attach_worker(thread::current());
                    info!("scripting worker started");
                    while !stop.load(Ordering::Acquire) {
                        let report = pool.run_pending(ctx.as_ref());
                        if !report.is_empty() {
                            debug!("drain pass: {report:?}");
                        }
                        thread::park_timeout(interval);
                    }
                    pool.detach_worker();
                    ctx.unregister_current_thread();
                    info!("scripting worker stopped");
                }
            })?;
        Ok(Self {
            stop,
            pool,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stops the loop after the current pass and waits for the thread.
    pub fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.stop.store(true, Ordering::Release);
        handle.thread().unpark();
        if handle.join().is_err() {
            error!("scripting worker panicked");
        }
        // Work queued after the last pass stays in the pool.
        if self.pool.pending() > 0 {
            debug!("{} task(s) left queued at shutdown", self.pool.pending());
        }
    }
}

impl Drop for ScriptingWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AudioSettings, EngineConfig};
    use crate::threading::context::HostContext;
    use crate::threading::task::{OwnerHandle, Task, TaskKind};
    use std::sync::mpsc;

    #[test]
    fn worker_runs_queued_tasks_on_the_scripting_thread() {
        let ctx = Arc::new(HostContext::new(AudioSettings::default()));
        ctx.set_initialised(true);
        let pool = Arc::new(TaskPool::new(&EngineConfig::default()));
        let mut worker = ScriptingWorker::spawn(
            Arc::clone(&pool),
            ctx.clone() as Arc<dyn EngineContext>,
            Duration::from_millis(5),
        )
        .unwrap();

        let owner = OwnerHandle::new("a");
        let (tx, rx) = mpsc::channel();
        pool.add_job(
            ctx.as_ref(),
            Task::new(TaskKind::HighPriorityCallback, &owner, move |task| {
                tx.send((task.thread, thread::current().name().map(String::from)))
                    .unwrap();
                Ok(())
            }),
        );
        let (kind, name) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(kind, ThreadKind::Scripting);
        assert_eq!(name.as_deref(), Some("script-worker"));

        assert!(worker.is_running());
        worker.shutdown();
        assert!(!worker.is_running());
    }
}
