use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Shared cancellation flag with a wait that wakes early on `cancel()`.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (flag, cvar) = &*self.inner;
        if let Ok(mut cancelled) = flag.lock() {
            *cancelled = true;
        }
        cvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        let (flag, _) = &*self.inner;
        flag.lock().map(|c| *c).unwrap_or(true)
    }

    /// Sleep for `timeout` unless cancelled first. Returns `true` if cancelled.
    pub fn wait(&self, timeout: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let Ok(mut cancelled) = flag.lock() else {
            return true;
        };
        while !*cancelled {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match cvar.wait_timeout(cancelled, deadline - now) {
                Ok((guard, _)) => cancelled = guard,
                Err(_) => return true,
            }
        }
        *cancelled
    }
}
