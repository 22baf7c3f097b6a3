//! Full-duplex anonymous pipes: transient, memory-backed byte-stream IPC.
//!
//! A pipe pair is two opposed channels, each a ring buffer with atomic
//! flow-control flags and broadcast wakeups. Both endpoints can read and
//! write; writes of at most [`PIPE_BUF`] bytes are atomic. Retired pairs
//! are recycled through a per-scheduling-unit [`PairCache`] instead of
//! hitting the allocator on every create/close cycle.
//!
//! ```
//! use d7pipe::{create_pipe, CreateFlags, PairCache, PipeConfig};
//!
//! let config = PipeConfig::default();
//! let cache = PairCache::new(&config);
//! let (a, b) = create_pipe(CreateFlags::empty(), &config, &cache).unwrap();
//!
//! a.write(b"hello").unwrap();
//! let mut buf = [0; 5];
//! b.read(&mut buf).unwrap();
//! assert_eq!(&buf, b"hello");
//! ```

// Code style
#![deny(unused_must_use)]
#![allow(clippy::new_without_default)]

mod cache;
mod channel;
mod config;
mod error;
mod event;
mod flow;
mod pair;
mod ring;
mod signal;
mod token;
mod wait;

pub use self::cache::{AffinityId, CacheStats, PairCache};
pub use self::channel::ChannelState;
pub use self::config::{
    PipeConfig, DEFAULT_MAX_CACHED_PAIRS, DEFAULT_PIPE_SIZE, DEFAULT_STORAGE_QUOTA,
    MAX_PIPE_SIZE, MIN_PIPE_SIZE, PIPE_BUF,
};
pub use self::error::{PipeError, PipeResult};
pub use self::event::{Interest, Readiness, ReadinessSubscriber, SubscriptionId};
pub use self::pair::{
    create_pipe, CreateFlags, EndpointHandle, Interrupter, PipeStat, Shutdown,
};
pub use self::signal::{BrokenPipePolicy, OwnerId, PipeSignal, SignalSink};
