use crate::runtime::error::{RuntimeError, RuntimeResult};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Wall-clock budget of one callback invocation. Clones share the limit, so a
/// scheduler or the script itself can extend a running deadline.
#[derive(Clone, Debug)]
pub struct Deadline {
    started: Instant,
    limit_ms: Arc<AtomicU64>,
}

impl Deadline {
    pub fn new(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            limit_ms: Arc::new(AtomicU64::new(duration_ms(budget))),
        }
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn limit(&self) -> Duration {
        Duration::from_millis(self.limit_ms.load(Ordering::Acquire))
    }

    /// Pushes the limit `extra` further out from the current limit.
    pub fn extend_by(&self, extra: Duration) {
        let extra = duration_ms(extra);
        let _ = self
            .limit_ms
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_add(extra))
            });
    }

    /// Raises the limit to `total` measured from the start; never lowers it.
    pub fn extend_to(&self, total: Duration) {
        self.limit_ms.fetch_max(duration_ms(total), Ordering::AcqRel);
    }

    pub fn is_expired(&self) -> bool {
        self.elapsed() > self.limit()
    }

    pub fn check(&self) -> RuntimeResult<()> {
        if self.is_expired() {
            Err(RuntimeError::Timeout)
        } else {
            Ok(())
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_budget_expires_immediately() {
        let deadline = Deadline::new(Duration::ZERO);
        std::thread::sleep(Duration::from_millis(2));
        assert!(matches!(deadline.check(), Err(RuntimeError::Timeout)));
    }

    #[test]
    fn extend_to_never_shortens() {
        let deadline = Deadline::new(Duration::from_millis(500));
        deadline.extend_to(Duration::from_millis(100));
        assert_eq!(deadline.limit(), Duration::from_millis(500));
        deadline.extend_by(Duration::from_millis(250));
        assert_eq!(deadline.limit(), Duration::from_millis(750));
    }

    #[test]
    fn clones_observe_extensions() {
        let deadline = Deadline::new(Duration::from_millis(10));
        let handle = deadline.clone();
        handle.extend_to(Duration::from_secs(5));
        assert_eq!(deadline.limit(), Duration::from_secs(5));
    }
}
