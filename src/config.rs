use core::fmt;
use core::time::Duration;
use std::sync::Arc;

use static_assertions::const_assert;

use crate::signal::{BrokenPipePolicy, SignalSink};

/// Largest write that must land contiguously in the stream, or not at all.
pub const PIPE_BUF: usize = 512;

/// Smallest accepted ring capacity.
pub const MIN_PIPE_SIZE: usize = 16 * 1024;
/// Largest accepted ring capacity.
pub const MAX_PIPE_SIZE: usize = 1024 * 1024;
/// Capacity used when the caller does not override it.
pub const DEFAULT_PIPE_SIZE: usize = MIN_PIPE_SIZE;

/// Retired pairs kept per scheduling unit before actually freeing.
pub const DEFAULT_MAX_CACHED_PAIRS: usize = 16;
/// Total live ring storage allowed by default, both channels of
/// every pair counted.
pub const DEFAULT_STORAGE_QUOTA: usize = 8 * 1024 * 1024;

const_assert!(MIN_PIPE_SIZE.is_power_of_two());
const_assert!(MAX_PIPE_SIZE.is_power_of_two());
const_assert!(DEFAULT_PIPE_SIZE >= MIN_PIPE_SIZE && DEFAULT_PIPE_SIZE <= MAX_PIPE_SIZE);
const_assert!(PIPE_BUF <= MIN_PIPE_SIZE / 2);

/// Tunables for pipe creation. Passed explicitly to `create_pipe` and
/// `PairCache::new`; there is no process-global configuration.
#[derive(Clone)]
pub struct PipeConfig {
    /// Requested ring capacity per channel; clamped and rounded up to a
    /// power of two inside `[MIN_PIPE_SIZE, MAX_PIPE_SIZE]`
    pub capacity: usize,
    /// Retired-pair freelist ceiling per scheduling unit
    pub max_cached_pairs: usize,
    /// Total live ring bytes before `create_pipe` fails with
    /// `ResourceExhausted`
    pub storage_quota: usize,
    /// Busy-poll bound before a blocking wait parks; zero disables
    pub busy_poll: Duration,
    /// Broken-pipe signal behavior for writes
    pub broken_pipe_policy: BrokenPipePolicy,
    /// Receiver for async-notify and broken-pipe signals
    pub signal_sink: Option<Arc<dyn SignalSink>>,
}

impl PipeConfig {
    /// Round a requested capacity into the accepted range.
    /// The result is always a power of two, so ring offsets can be
    /// computed with `index & (capacity - 1)`.
    pub fn clamp_capacity(requested: usize) -> usize {
        requested
            .min(MAX_PIPE_SIZE)
            .next_power_of_two()
            .max(MIN_PIPE_SIZE)
    }

    pub fn effective_capacity(&self) -> usize {
        Self::clamp_capacity(self.capacity)
    }
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_PIPE_SIZE,
            max_cached_pairs: DEFAULT_MAX_CACHED_PAIRS,
            storage_quota: DEFAULT_STORAGE_QUOTA,
            busy_poll: Duration::from_micros(0),
            broken_pipe_policy: BrokenPipePolicy::DeliverToOwner,
            signal_sink: None,
        }
    }
}

impl fmt::Debug for PipeConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PipeConfig")
            .field("capacity", &self.capacity)
            .field("max_cached_pairs", &self.max_cached_pairs)
            .field("storage_quota", &self.storage_quota)
            .field("busy_poll", &self.busy_poll)
            .field("broken_pipe_policy", &self.broken_pipe_policy)
            .field("signal_sink", &self.signal_sink.is_some())
            .finish()
    }
}
