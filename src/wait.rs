//! Broadcast wait channel, the `tsleep`/`wakeup` analogue.
//!
//! One `WaitPoint` serves a whole channel: token waiters, blocked readers
//! and blocked writers all park here and every wake is a broadcast, since
//! shutdown must reach all of them at once. The mutex/condvar pair is used
//! purely for parking; no data lives under the lock. Sleepers re-check
//! their predicate while holding the lock and wakers take the lock before
//! notifying, so a flag transition followed by `wake_all` can never slip
//! between a sleeper's check and its wait.

use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::error::{PipeError, PipeResult};

/// Cancellation flag for blocking waits, the `PCATCH` analogue.
/// Raised once, consumed by the next (or current) wait.
#[derive(Debug)]
pub struct InterruptFlag {
    raised: AtomicBool,
}

impl InterruptFlag {
    pub fn new() -> Self {
        Self {
            raised: AtomicBool::new(false),
        }
    }

    pub fn raise(&self) {
        self.raised.store(true, Ordering::SeqCst);
    }

    /// Consume a pending interrupt.
    pub fn take(&self) -> bool {
        self.raised.swap(false, Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct WaitPoint {
    lock: Mutex<()>,
    cond: Condvar,
}

impl WaitPoint {
    pub fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// Wake every sleeper. Taking the lock first orders this wake against
    /// predicate checks of sleepers that are about to park.
    pub fn wake_all(&self) {
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }

    /// Park until `ready()` holds or the interrupt fires.
    ///
    /// Busy-polls the predicate for up to `spin` first; this is a latency
    /// optimization only and behaves identically to parking right away.
    pub fn sleep_until<F>(&self, spin: Duration, interrupt: &InterruptFlag, mut ready: F) -> PipeResult<()>
    where
        F: FnMut() -> bool,
    {
        if ready() {
            return Ok(());
        }
        if interrupt.take() {
            return Err(PipeError::Interrupted);
        }

        if spin != Duration::from_micros(0) {
            let deadline = Instant::now() + spin;
            while Instant::now() < deadline {
                if ready() {
                    return Ok(());
                }
                if interrupt.take() {
                    return Err(PipeError::Interrupted);
                }
                core::hint::spin_loop();
            }
        }

        let mut guard = self.lock.lock();
        loop {
            if ready() {
                return Ok(());
            }
            if interrupt.take() {
                return Err(PipeError::Interrupted);
            }
            self.cond.wait(&mut guard);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_ready_skips_parking() {
        let wp = WaitPoint::new();
        let intr = InterruptFlag::new();
        assert!(wp.sleep_until(Duration::from_micros(0), &intr, || true).is_ok());
    }

    #[test]
    fn test_interrupt_cancels() {
        let wp = WaitPoint::new();
        let intr = InterruptFlag::new();
        intr.raise();
        assert_eq!(
            wp.sleep_until(Duration::from_micros(0), &intr, || false),
            Err(PipeError::Interrupted)
        );
        // consumed, not sticky
        assert!(!intr.take());
    }

    #[test]
    fn test_wake_all_reaches_every_sleeper() {
        let wp = Arc::new(WaitPoint::new());
        let go = Arc::new(AtomicUsize::new(0));

        let sleepers: Vec<_> = (0..4)
            .map(|_| {
                let wp = wp.clone();
                let go = go.clone();
                thread::spawn(move || {
                    let intr = InterruptFlag::new();
                    wp.sleep_until(Duration::from_micros(0), &intr, || {
                        go.load(Ordering::SeqCst) == 1
                    })
                    .unwrap();
                })
            })
            .collect();

        thread::sleep(core::time::Duration::from_millis(50));
        go.store(1, Ordering::SeqCst);
        wp.wake_all();
        for sleeper in sleepers {
            sleeper.join().unwrap();
        }
    }

    #[test]
    fn test_spin_phase_sees_progress() {
        let wp = Arc::new(WaitPoint::new());
        let go = Arc::new(AtomicUsize::new(0));

        let wp2 = wp.clone();
        let go2 = go.clone();
        let waiter = thread::spawn(move || {
            let intr = InterruptFlag::new();
            wp2.sleep_until(Duration::from_secs(5), &intr, || go2.load(Ordering::SeqCst) == 1)
        });

        thread::sleep(core::time::Duration::from_millis(20));
        // No wake_all: the spinning waiter must notice on its own
        go.store(1, Ordering::SeqCst);
        assert!(waiter.join().unwrap().is_ok());
    }
}
