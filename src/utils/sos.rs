use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

/// Cooperative stop signal shared between threads.
///
/// Cloning shares the same flag. Once cancelled it stays cancelled.
#[derive(Debug, Clone)]
pub struct SignalOfStop {
    shared: Arc<SharedState>,
}

#[derive(Debug)]
struct SharedState {
    closing: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl SignalOfStop {
    pub fn new() -> SignalOfStop {
        SignalOfStop {
            shared: Arc::new(SharedState {
                closing: AtomicBool::new(false),
                mutex: Mutex::new(()),
                condvar: Condvar::new(),
            }),
        }
    }

    pub fn cancel(&self) {
        self.shared.closing.store(true, Ordering::SeqCst);

        // lock briefly so a waiter cannot miss the notification
        let _guard = self
            .shared
            .mutex
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.shared.condvar.notify_all();
    }

    pub fn cancelled(&self) -> bool {
        self.shared.closing.load(Ordering::SeqCst)
    }

    /// Sleep up to `timeout`, returning early (with `true`) once cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self
            .shared
            .mutex
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let (_guard, _result) = self
            .shared
            .condvar
            .wait_timeout_while(guard, timeout, |_| !self.cancelled())
            .unwrap_or_else(PoisonError::into_inner);
        self.cancelled()
    }
}

impl Default for SignalOfStop {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_wait_times_out() {
        let sos = SignalOfStop::new();
        assert!(!sos.wait_timeout(Duration::from_millis(5)));
        assert!(!sos.cancelled());
    }

    #[test]
    fn test_cancel_wakes_waiter() {
        let sos = SignalOfStop::new();
        let waiter = {
            let sos = sos.clone();
            thread::spawn(move || {
                let started = Instant::now();
                let cancelled = sos.wait_timeout(Duration::from_secs(10));
                (cancelled, started.elapsed())
            })
        };

        thread::sleep(Duration::from_millis(20));
        sos.cancel();
        let (cancelled, elapsed) = waiter.join().unwrap();
        assert!(cancelled);
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let sos = SignalOfStop::new();
        sos.cancel();
        sos.cancel();
        assert!(sos.wait_timeout(Duration::from_secs(10)));
    }
}
