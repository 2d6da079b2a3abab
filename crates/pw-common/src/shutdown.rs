//! Cooperative shutdown signal.
//!
//! Every worker sleeps through [`Shutdown::wait_timeout`] instead of
//! `thread::sleep`, so triggering the signal wakes all of them at once.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown and wake every waiter.
    pub fn trigger(&self) {
        let (lock, cvar) = &*self.inner;
        let mut flag = lock.lock().unwrap_or_else(|e| e.into_inner());
        *flag = true;
        cvar.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        let (lock, _) = &*self.inner;
        *lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Sleep for up to `timeout`. Returns `true` if shutdown was requested.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let (lock, cvar) = &*self.inner;
        let mut flag = lock.lock().unwrap_or_else(|e| e.into_inner());
        while !*flag {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _) = cvar
                .wait_timeout(flag, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            flag = guard;
        }
        *flag
    }

    /// Block until shutdown is requested.
    pub fn wait(&self) {
        let (lock, cvar) = &*self.inner;
        let mut flag = lock.lock().unwrap_or_else(|e| e.into_inner());
        while !*flag {
            flag = cvar.wait(flag).unwrap_or_else(|e| e.into_inner());
        }
    }
}

/// Join `handle`, giving up after `timeout`.
///
/// Returns `None` if the thread is still running at the deadline; the
/// thread is then left detached.
pub fn join_timeout<T>(handle: JoinHandle<T>, timeout: Duration) -> Option<thread::Result<T>> {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return None;
        }
        thread::sleep(Duration::from_millis(10));
    }
    Some(handle.join())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn wait_timeout_expires_without_trigger() {
        let shutdown = Shutdown::new();
        let start = Instant::now();
        assert!(!shutdown.wait_timeout(Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn trigger_wakes_sleepers() {
        let shutdown = Shutdown::new();
        let sleeper = {
            let shutdown = shutdown.clone();
            thread::spawn(move || shutdown.wait_timeout(Duration::from_secs(30)))
        };
        thread::sleep(Duration::from_millis(20));
        let start = Instant::now();
        shutdown.trigger();
        assert!(sleeper.join().unwrap());
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(shutdown.is_triggered());
    }

    #[test]
    fn join_timeout_gives_up_on_stuck_thread() {
        let release = Shutdown::new();
        let stuck = {
            let release = release.clone();
            thread::spawn(move || release.wait())
        };
        assert!(join_timeout(stuck, Duration::from_millis(30)).is_none());
        release.trigger();

        let quick = thread::spawn(|| 7);
        assert_eq!(join_timeout(quick, Duration::from_secs(5)).unwrap().unwrap(), 7);
    }

    #[test]
    fn wait_returns_once_triggered() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        shutdown.wait();
        assert!(shutdown.wait_timeout(Duration::from_secs(10)));
    }
}
