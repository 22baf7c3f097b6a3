//! Per-direction I/O serialization, the `pipelock`/`pipeunlock` analogue.
//!
//! Each channel carries two tokens, one for its reader and one for its
//! writer, so at most one read and one write are in flight per channel.
//! Contended acquires park on the channel's shared wait point; release
//! broadcasts only when someone was actually waiting.

use core::sync::atomic::{AtomicU8, Ordering};
use core::time::Duration;

use crate::error::PipeResult;
use crate::wait::{InterruptFlag, WaitPoint};

const IDLE: u8 = 0;
const OWNED: u8 = 1;
const CONTENDED: u8 = 2;

#[derive(Debug)]
pub struct SerializationToken {
    state: AtomicU8,
}

impl SerializationToken {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(IDLE),
        }
    }

    /// Take the token, parking on `wait` while another caller holds it.
    /// Cancellation during the wait returns `Interrupted`.
    pub fn acquire<'a>(
        &'a self,
        wait: &'a WaitPoint,
        interrupt: &InterruptFlag,
    ) -> PipeResult<TokenGuard<'a>> {
        loop {
            match self
                .state
                .compare_exchange(IDLE, OWNED, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return Ok(TokenGuard { token: self, wait }),
                Err(_) => {
                    // Record the contention so release knows to wake us.
                    // The owner may release in between; the sleep predicate
                    // below is then immediately true.
                    let _ = self.state.compare_exchange(
                        OWNED,
                        CONTENDED,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    );
                    wait.sleep_until(Duration::from_micros(0), interrupt, || {
                        self.state.load(Ordering::SeqCst) == IDLE
                    })?;
                },
            }
        }
    }
}

/// Releases the token on drop, waking waiters if the acquire was contended.
#[derive(Debug)]
pub struct TokenGuard<'a> {
    token: &'a SerializationToken,
    wait: &'a WaitPoint,
}

impl Drop for TokenGuard<'_> {
    fn drop(&mut self) {
        if self.token.state.swap(IDLE, Ordering::SeqCst) == CONTENDED {
            self.wait.wake_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_uncontended_acquire() {
        let token = SerializationToken::new();
        let wait = WaitPoint::new();
        let intr = InterruptFlag::new();

        let guard = token.acquire(&wait, &intr).unwrap();
        assert_eq!(token.state.load(Ordering::SeqCst), OWNED);
        drop(guard);
        assert_eq!(token.state.load(Ordering::SeqCst), IDLE);
    }

    #[test]
    fn test_contended_acquire_blocks_until_release() {
        struct Shared {
            token: SerializationToken,
            wait: WaitPoint,
        }
        let shared = Arc::new(Shared {
            token: SerializationToken::new(),
            wait: WaitPoint::new(),
        });

        let intr = InterruptFlag::new();
        let guard = shared.token.acquire(&shared.wait, &intr).unwrap();

        let shared2 = shared.clone();
        let contender = thread::spawn(move || {
            let intr = InterruptFlag::new();
            let _guard = shared2.token.acquire(&shared2.wait, &intr).unwrap();
        });

        thread::sleep(core::time::Duration::from_millis(50));
        assert!(!contender.is_finished());
        drop(guard);
        contender.join().unwrap();
    }

    #[test]
    fn test_interrupted_acquire() {
        let token = SerializationToken::new();
        let wait = WaitPoint::new();
        let intr = InterruptFlag::new();

        let _guard = token.acquire(&wait, &intr).unwrap();
        intr.raise();
        assert!(token.acquire(&wait, &intr).is_err());
    }
}
