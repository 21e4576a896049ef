use crate::config::AudioSettings;
use crate::threading::task::OwnerHandle;
use log::debug;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, ThreadId};
use std::time::Duration;

/// Role of the thread a scheduling request comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ThreadKind {
    SampleLoading,
    Scripting,
    Message,
    Audio,
    Other,
}

/// Host services the scheduler consults. Passed explicitly into every
/// scheduling call.
pub trait EngineContext: Send + Sync {
    fn current_thread(&self) -> ThreadKind;
    fn is_initialised(&self) -> bool;
    fn is_audio_idle(&self) -> bool;
    fn suspend_voices_and_extend_timeout(&self, extension: Duration);
    fn repaint(&self, owner: &OwnerHandle);
    fn audio_settings(&self) -> AudioSettings;

    fn register_current_thread(&self, _kind: ThreadKind) {}
    fn unregister_current_thread(&self) {}
}

/// Default [`EngineContext`] backed by a thread-role registry and atomic flags.
#[derive(Debug)]
pub struct HostContext {
    threads: RwLock<HashMap<ThreadId, ThreadKind>>,
    initialised: AtomicBool,
    rendering: AtomicBool,
    suspensions: AtomicUsize,
    extension_ms: AtomicU64,
    repaints: Mutex<Vec<String>>,
    audio: AudioSettings,
}

impl HostContext {
    pub fn new(audio: AudioSettings) -> Self {
        Self {
            threads: RwLock::new(HashMap::new()),
            initialised: AtomicBool::new(false),
            rendering: AtomicBool::new(false),
            suspensions: AtomicUsize::new(0),
            extension_ms: AtomicU64::new(0),
            repaints: Mutex::new(Vec::new()),
            audio,
        }
    }

    pub fn register_thread(&self, id: ThreadId, kind: ThreadKind) {
        self.threads.write().insert(id, kind);
    }

    pub fn unregister_thread(&self, id: ThreadId) {
        self.threads.write().remove(&id);
    }

    pub fn set_initialised(&self, initialised: bool) {
        self.initialised.store(initialised, Ordering::Release);
    }

    pub fn set_rendering(&self, rendering: bool) {
        self.rendering.store(rendering, Ordering::Release);
    }

    /// Number of times voices were suspended for a compilation.
    pub fn suspension_count(&self) -> usize {
        self.suspensions.load(Ordering::Acquire)
    }

    pub fn last_extension(&self) -> Duration {
        Duration::from_millis(self.extension_ms.load(Ordering::Acquire))
    }

    /// Owner names whose repaint was flushed, oldest first.
    pub fn repaints(&self) -> Vec<String> {
        self.repaints.lock().clone()
    }
}

impl EngineContext for HostContext {
    fn current_thread(&self) -> ThreadKind {
        self.threads
            .read()
            .get(&thread::current().id())
            .copied()
            .unwrap_or(ThreadKind::Other)
    }

    fn is_initialised(&self) -> bool {
        self.initialised.load(Ordering::Acquire)
    }

    fn is_audio_idle(&self) -> bool {
        !self.rendering.load(Ordering::Acquire)
    }

    fn suspend_voices_and_extend_timeout(&self, extension: Duration) {
        self.suspensions.fetch_add(1, Ordering::AcqRel);
        let ms = u64::try_from(extension.as_millis()).unwrap_or(u64::MAX);
        self.extension_ms.store(ms, Ordering::Release);
        debug!("voices suspended, timeout extended by {extension:?}");
    }

    fn repaint(&self, owner: &OwnerHandle) {
        self.repaints.lock().push(owner.name().to_string());
    }

    fn audio_settings(&self) -> AudioSettings {
        self.audio
    }

    fn register_current_thread(&self, kind: ThreadKind) {
        self.register_thread(thread::current().id(), kind);
    }

    fn unregister_current_thread(&self) {
        self.unregister_thread(thread::current().id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_threads_are_other() {
        let ctx = HostContext::new(AudioSettings::default());
        assert_eq!(ctx.current_thread(), ThreadKind::Other);
        ctx.register_current_thread(ThreadKind::Message);
        assert_eq!(ctx.current_thread(), ThreadKind::Message);
        let other = thread::scope(|s| s.spawn(|| ctx.current_thread()).join().unwrap());
        assert_eq!(other, ThreadKind::Other);
        ctx.unregister_current_thread();
        assert_eq!(ctx.current_thread(), ThreadKind::Other);
    }

    #[test]
    fn idle_tracks_rendering_flag() {
        let ctx = HostContext::new(AudioSettings::default());
        assert!(ctx.is_audio_idle());
        ctx.set_rendering(true);
        assert!(!ctx.is_audio_idle());
    }
}
