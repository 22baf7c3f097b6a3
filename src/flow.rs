//! Atomic flag word coordinating the two ends of a channel.
//!
//! All mutation goes through a compare-and-swap retry loop, so
//! "test-and-clear, wake if it was set" is observable as a single atomic
//! step and a wakeup request can never be lost between the test and the
//! clear.

use core::sync::atomic::{AtomicU32, Ordering};

bitflags::bitflags! {
    pub struct Flags: u32 {
        /// A reader is (or is about to be) blocked waiting for data
        const WANT_READ    = 1 << 0;
        /// A writer is (or is about to be) blocked waiting for space
        const WANT_WRITE   = 1 << 1;
        /// Deliver `IoPossible` signals to the registered owner
        const ASYNC_NOTIFY = 1 << 2;
        /// No more data will ever arrive; buffered bytes still drain
        const READ_EOF     = 1 << 3;
        /// This channel no longer accepts data
        const WRITE_EOF    = 1 << 4;
        /// Consumer endpoint is gone; terminal, never cleared
        const CLOSED       = 1 << 5;
    }
}

#[derive(Debug)]
pub struct FlowState {
    bits: AtomicU32,
}

impl FlowState {
    pub fn new() -> Self {
        Self {
            bits: AtomicU32::new(0),
        }
    }

    pub fn load(&self) -> Flags {
        Flags::from_bits_truncate(self.bits.load(Ordering::SeqCst))
    }

    pub fn contains(&self, flags: Flags) -> bool {
        self.load().contains(flags)
    }

    pub fn intersects(&self, flags: Flags) -> bool {
        self.load().intersects(flags)
    }

    /// Set `flags`, returning the previous value.
    pub fn set(&self, flags: Flags) -> Flags {
        self.update(|f| f | flags)
    }

    /// Clear `flags`, returning the previous value.
    pub fn clear(&self, flags: Flags) -> Flags {
        self.update(|f| f - flags)
    }

    /// Clear `flags` and report whether any of them were set.
    /// The caller wakes the peer exactly when this returns true.
    pub fn test_and_clear(&self, flags: Flags) -> bool {
        self.clear(flags).intersects(flags)
    }

    /// Rewind to the initial state. Only legal while quiescent
    /// (construction or cache revival); the monotonicity of
    /// `READ_EOF`/`WRITE_EOF`/`CLOSED` applies per channel lifetime.
    pub fn reset(&mut self) {
        *self.bits.get_mut() = 0;
    }

    fn update<F>(&self, mut apply: F) -> Flags
    where
        F: FnMut(Flags) -> Flags,
    {
        let mut current = self.bits.load(Ordering::SeqCst);
        loop {
            let next = apply(Flags::from_bits_truncate(current)).bits();
            match self
                .bits
                .compare_exchange_weak(current, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(previous) => return Flags::from_bits_truncate(previous),
                Err(observed) => current = observed,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_returns_previous() {
        let state = FlowState::new();
        assert_eq!(state.set(Flags::WANT_READ), Flags::empty());
        assert_eq!(state.set(Flags::READ_EOF), Flags::WANT_READ);
        assert!(state.contains(Flags::WANT_READ | Flags::READ_EOF));
    }

    #[test]
    fn test_test_and_clear_fires_once() {
        let state = FlowState::new();
        state.set(Flags::WANT_WRITE);
        assert!(state.test_and_clear(Flags::WANT_WRITE));
        assert!(!state.test_and_clear(Flags::WANT_WRITE));
        assert!(!state.contains(Flags::WANT_WRITE));
    }

    #[test]
    fn test_clear_leaves_other_flags() {
        let state = FlowState::new();
        state.set(Flags::WANT_READ | Flags::CLOSED);
        state.clear(Flags::WANT_READ);
        assert!(state.contains(Flags::CLOSED));
        assert!(!state.contains(Flags::WANT_READ));
    }
}
