//! Deferred work for the message thread. Units wait in a bounded queue until
//! the audio engine is idle and are retried while they report
//! [`JobStatus::NeedsToRunAgain`].

use crate::threading::context::{EngineContext, ThreadKind};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::{debug, error};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum JobStatus {
    NotExecuted = 0,
    Ok = 1,
    /// Still pending; retried on the next timer tick.
    NeedsToRunAgain = 2,
    Cancelled = 3,
}

impl JobStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => JobStatus::Ok,
            2 => JobStatus::NeedsToRunAgain,
            3 => JobStatus::Cancelled,
            _ => JobStatus::NotExecuted,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Ok | JobStatus::Cancelled)
    }
}

/// Caller-side view of a dispatched job.
#[derive(Clone)]
pub struct JobHandle {
    status: Arc<AtomicU8>,
}

impl JobHandle {
    fn new() -> Self {
        Self {
            status: Arc::new(AtomicU8::new(JobStatus::NotExecuted as u8)),
        }
    }

    pub fn status(&self) -> JobStatus {
        JobStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn is_pending(&self) -> bool {
        !self.status().is_terminal()
    }

    /// Marks the job cancelled unless it already finished. A cancelled job is
    /// never invoked again.
    pub fn cancel(&self) -> bool {
        self.transition(JobStatus::Cancelled)
    }

    fn transition(&self, next: JobStatus) -> bool {
        self.status
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                (!JobStatus::from_u8(raw).is_terminal()).then_some(next as u8)
            })
            .is_ok()
    }
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("status", &self.status())
            .finish()
    }
}

struct Job {
    run: Box<dyn FnMut() -> JobStatus + Send>,
    handle: JobHandle,
}

impl Job {
    /// Runs the callable unless the job was cancelled meanwhile. A callable
    /// answering `NotExecuted` is treated as still pending.
    fn invoke(&mut self) -> JobStatus {
        if self.handle.status() == JobStatus::Cancelled {
            return JobStatus::Cancelled;
        }
        let status = match (self.run)() {
            JobStatus::NotExecuted => JobStatus::NeedsToRunAgain,
            status => status,
        };
        if self.handle.transition(status) {
            status
        } else {
            self.handle.status()
        }
    }
}

pub struct LockFreeDispatcher {
    tx: Sender<Job>,
    rx: Receiver<Job>,
    parked: Mutex<Option<Job>>,
    ticking: AtomicBool,
    shut_down: AtomicBool,
}

/// Clears the tick flag when a tick ends, even by unwinding out of a job.
struct TickGuard<'a>(&'a AtomicBool);

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl LockFreeDispatcher {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self {
            tx,
            rx,
            parked: Mutex::new(None),
            ticking: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Jobs waiting for a timer tick, including one held back for a retry.
    pub fn pending(&self) -> usize {
        self.rx.len() + usize::from(self.parked.lock().is_some())
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Runs `f` on `target` now when called from the message thread while the
    /// engine is idle, otherwise queues it. Returns true if it ran to
    /// completion synchronously.
    pub fn dispatch_after_suspension<T, F>(
        &self,
        ctx: &dyn EngineContext,
        target: &Arc<T>,
        f: F,
    ) -> bool
    where
        T: Send + Sync + 'static,
        F: FnMut(&T) -> JobStatus + Send + 'static,
    {
        self.dispatch_tracked(ctx, target, f).0
    }

    /// Like [`dispatch_after_suspension`](Self::dispatch_after_suspension) but
    /// also hands back the job's status handle. The job only holds a weak
    /// reference to `target` and cancels itself once the target is gone.
    pub fn dispatch_tracked<T, F>(
        &self,
        ctx: &dyn EngineContext,
        target: &Arc<T>,
        mut f: F,
    ) -> (bool, JobHandle)
    where
        T: Send + Sync + 'static,
        F: FnMut(&T) -> JobStatus + Send + 'static,
    {
        let handle = JobHandle::new();
        let weak = Arc::downgrade(target);
        let mut job = Job {
            run: Box::new(move || match weak.upgrade() {
                Some(target) => f(&target),
                None => JobStatus::Cancelled,
            }),
            handle: handle.clone(),
        };

        if self.is_shut_down() {
            handle.cancel();
            return (false, handle);
        }

        if ctx.current_thread() == ThreadKind::Message && ctx.is_audio_idle() {
            return match job.invoke() {
                JobStatus::NeedsToRunAgain => {
                    debug!("synchronous job interrupted, requeueing");
                    self.push(job);
                    (false, handle)
                }
                _ => (true, handle),
            };
        }

        self.push(job);
        (false, handle)
    }

    fn push(&self, job: Job) {
        match self.tx.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(job)) | Err(TrySendError::Disconnected(job)) => {
                error!("deferred job queue is full, cancelling job");
                job.handle.cancel();
            }
        }
    }

    /// Timer callback. Does nothing while the engine renders. Otherwise runs
    /// queued jobs in order and stops at the first one that needs to run
    /// again, holding it at the head for the next tick. Returns how many jobs
    /// completed. Jobs run with no dispatcher lock held, so they may call back
    /// into the dispatcher; a nested tick is a no-op.
    pub fn timer_tick(&self, ctx: &dyn EngineContext) -> usize {
        if !ctx.is_audio_idle() || self.is_shut_down() {
            return 0;
        }
        if self.ticking.swap(true, Ordering::AcqRel) {
            return 0;
        }
        let _ticking = TickGuard(&self.ticking);

        let mut completed = 0;
        let mut next = self.parked.lock().take();
        let mut budget = self.rx.len();
        loop {
            let mut job = match next.take() {
                Some(job) => job,
                None if budget > 0 => {
                    budget -= 1;
                    match self.rx.try_recv() {
                        Ok(job) => job,
                        Err(_) => break,
                    }
                }
                None => break,
            };
            match job.invoke() {
                JobStatus::NeedsToRunAgain => {
                    if self.is_shut_down() {
                        job.handle.cancel();
                    } else {
                        *self.parked.lock() = Some(job);
                    }
                    break;
                }
                JobStatus::Ok => completed += 1,
                JobStatus::Cancelled | JobStatus::NotExecuted => {}
            }
        }
        completed
    }

    /// Cancels every pending job without invoking it. Later dispatches are
    /// cancelled on arrival.
    pub fn shutdown(&self) -> usize {
        self.shut_down.store(true, Ordering::Release);
        let mut cancelled = 0;
        if let Some(job) = self.parked.lock().take() {
            cancelled += usize::from(job.handle.cancel());
        }
        while let Ok(job) = self.rx.try_recv() {
            cancelled += usize::from(job.handle.cancel());
        }
        if cancelled > 0 {
            debug!("cancelled {cancelled} pending job(s) at shutdown");
        }
        cancelled
    }
}

impl Drop for LockFreeDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AudioSettings;
    use crate::threading::context::HostContext;
    use std::sync::atomic::AtomicUsize;

    fn message_context() -> HostContext {
        let ctx = HostContext::new(AudioSettings::default());
        ctx.register_current_thread(ThreadKind::Message);
        ctx
    }

    #[test]
    fn runs_inline_on_idle_message_thread() {
        let ctx = message_context();
        let dispatcher = LockFreeDispatcher::new(4);
        let target = Arc::new(AtomicUsize::new(0));
        let ran = dispatcher.dispatch_after_suspension(&ctx, &target, |count| {
            count.fetch_add(1, Ordering::SeqCst);
            JobStatus::Ok
        });
        assert!(ran);
        assert_eq!(target.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.pending(), 0);
    }

    #[test]
    fn interrupted_inline_job_is_requeued() {
        let ctx = message_context();
        let dispatcher = LockFreeDispatcher::new(4);
        let target = Arc::new(AtomicUsize::new(0));
        let (ran, handle) = dispatcher.dispatch_tracked(&ctx, &target, |count| {
            if count.fetch_add(1, Ordering::SeqCst) == 0 {
                JobStatus::NeedsToRunAgain
            } else {
                JobStatus::Ok
            }
        });
        assert!(!ran);
        assert_eq!(handle.status(), JobStatus::NeedsToRunAgain);
        assert_eq!(dispatcher.timer_tick(&ctx), 1);
        assert_eq!(handle.status(), JobStatus::Ok);
        assert_eq!(target.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn rendering_engine_defers_until_idle() {
        let ctx = message_context();
        ctx.set_rendering(true);
        let dispatcher = LockFreeDispatcher::new(4);
        let target = Arc::new(AtomicUsize::new(0));
        let (ran, handle) = dispatcher.dispatch_tracked(&ctx, &target, |count| {
            count.fetch_add(1, Ordering::SeqCst);
            JobStatus::Ok
        });
        assert!(!ran);
        assert_eq!(dispatcher.pending(), 1);
        assert_eq!(dispatcher.timer_tick(&ctx), 0);
        assert_eq!(handle.status(), JobStatus::NotExecuted);

        ctx.set_rendering(false);
        assert_eq!(dispatcher.timer_tick(&ctx), 1);
        assert_eq!(dispatcher.timer_tick(&ctx), 0);
        assert_eq!(target.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancelled_jobs_are_never_invoked() {
        let ctx = HostContext::new(AudioSettings::default());
        let dispatcher = LockFreeDispatcher::new(4);
        let target = Arc::new(AtomicUsize::new(0));
        let (_, handle) = dispatcher.dispatch_tracked(&ctx, &target, |count| {
            count.fetch_add(1, Ordering::SeqCst);
            JobStatus::Ok
        });
        assert!(handle.cancel());
        assert!(!handle.cancel());
        dispatcher.timer_tick(&ctx);
        assert_eq!(target.load(Ordering::SeqCst), 0);
        assert_eq!(dispatcher.pending(), 0);
    }

    #[test]
    fn dropped_target_cancels_the_job() {
        let ctx = HostContext::new(AudioSettings::default());
        let dispatcher = LockFreeDispatcher::new(4);
        let target = Arc::new(AtomicUsize::new(0));
        let (_, handle) = dispatcher.dispatch_tracked(&ctx, &target, |_| JobStatus::Ok);
        drop(target);
        assert_eq!(dispatcher.timer_tick(&ctx), 0);
        assert_eq!(handle.status(), JobStatus::Cancelled);
    }

    #[test]
    fn overflow_cancels_the_new_job() {
        let ctx = HostContext::new(AudioSettings::default());
        let dispatcher = LockFreeDispatcher::new(1);
        let target = Arc::new(());
        let (_, first) = dispatcher.dispatch_tracked(&ctx, &target, |_| JobStatus::Ok);
        let (_, second) = dispatcher.dispatch_tracked(&ctx, &target, |_| JobStatus::Ok);
        assert_eq!(first.status(), JobStatus::NotExecuted);
        assert_eq!(second.status(), JobStatus::Cancelled);
    }
}
