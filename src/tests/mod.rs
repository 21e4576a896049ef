mod dispatcher;
mod end_to_end;

use crate::config::AudioSettings;
use crate::threading::{EngineContext, OwnerHandle, ThreadKind};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, ThreadId};
use std::time::Duration;

/// Scriptable stand-in for the host.
#[derive(Default)]
pub(crate) struct MockContext {
    threads: RwLock<HashMap<ThreadId, ThreadKind>>,
    initialised: AtomicBool,
    busy: AtomicBool,
    suspensions: AtomicUsize,
    repaints: Mutex<Vec<String>>,
}

impl MockContext {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn initialised() -> Self {
        let ctx = Self::new();
        ctx.initialised.store(true, Ordering::SeqCst);
        ctx
    }

    pub(crate) fn set_initialised(&self, initialised: bool) {
        self.initialised.store(initialised, Ordering::SeqCst);
    }

    pub(crate) fn set_thread(&self, kind: ThreadKind) {
        self.threads.write().insert(thread::current().id(), kind);
    }

    pub(crate) fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::SeqCst);
    }

    pub(crate) fn suspensions(&self) -> usize {
        self.suspensions.load(Ordering::SeqCst)
    }

    pub(crate) fn repaints(&self) -> Vec<String> {
        self.repaints.lock().clone()
    }
}

impl EngineContext for MockContext {
    fn current_thread(&self) -> ThreadKind {
        self.threads
            .read()
            .get(&thread::current().id())
            .copied()
            .unwrap_or(ThreadKind::Other)
    }

    fn is_initialised(&self) -> bool {
        self.initialised.load(Ordering::SeqCst)
    }

    fn is_audio_idle(&self) -> bool {
        !self.busy.load(Ordering::SeqCst)
    }

    fn suspend_voices_and_extend_timeout(&self, _extension: Duration) {
        self.suspensions.fetch_add(1, Ordering::SeqCst);
    }

    fn repaint(&self, owner: &OwnerHandle) {
        self.repaints.lock().push(owner.name().to_string());
    }

    fn audio_settings(&self) -> AudioSettings {
        AudioSettings::default()
    }

    fn register_current_thread(&self, kind: ThreadKind) {
        self.set_thread(kind);
    }

    fn unregister_current_thread(&self) {
        self.threads.write().remove(&thread::current().id());
    }
}

pub(crate) type Log = std::sync::Arc<Mutex<Vec<String>>>;

pub(crate) fn new_log() -> Log {
    std::sync::Arc::new(Mutex::new(Vec::new()))
}
