//! Pipe pairs and their externally visible endpoints.
//!
//! A pair owns two opposed channels. Each endpoint reads from its inbound
//! channel and writes into its outbound one; both endpoints may do both,
//! so the pipe is full-duplex. Closing an endpoint finishes its inbound
//! channel, marks the outbound channel end-of-stream for the peer, and
//! drops the pair into the pair cache when the other endpoint is gone too.

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use crate::cache::{CacheInner, PairCache, Reservation};
use crate::channel::{ChannelState, PipeChannel};
use crate::config::PipeConfig;
use crate::error::{PipeError, PipeResult};
use crate::event::{Interest, Readiness, ReadinessSubscriber, SubscriptionId};
use crate::flow::Flags;
use crate::signal::{BrokenPipePolicy, OwnerId, PipeSignal};
use crate::wait::InterruptFlag;

bitflags::bitflags! {
    pub struct CreateFlags: u8 {
        /// Start both endpoints in non-blocking mode
        const NONBLOCKING   = 1 << 0;
        /// Record the close-on-exec disposition on both endpoints
        const CLOSE_ON_EXEC = 1 << 1;
    }
}

/// Direction selector for `shutdown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// No more reads on this endpoint
    Read,
    /// No more writes on this endpoint
    Write,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum End {
    A,
    B,
}

impl End {
    fn other(self) -> End {
        match self {
            End::A => End::B,
            End::B => End::A,
        }
    }
}

static NEXT_PIPE_ID: AtomicU64 = AtomicU64::new(1);

fn next_pipe_id() -> u64 {
    NEXT_PIPE_ID.fetch_add(1, Ordering::Relaxed)
}

pub(crate) struct PipePair {
    /// `channels[0]` carries A→B, `channels[1]` carries B→A
    channels: [PipeChannel; 2],
    open_count: AtomicU32,
    id: u64,
    created: SystemTime,
    capacity: usize,
    broken_pipe_policy: BrokenPipePolicy,
    /// Storage-quota reservation, returned when the pair is freed
    #[allow(dead_code)]
    reservation: Reservation,
}

impl PipePair {
    pub(crate) fn new(config: &PipeConfig, reservation: Reservation) -> Self {
        let capacity = config.effective_capacity();
        Self {
            channels: [
                PipeChannel::new(capacity, config),
                PipeChannel::new(capacity, config),
            ],
            open_count: AtomicU32::new(2),
            id: next_pipe_id(),
            created: SystemTime::now(),
            capacity,
            broken_pipe_policy: config.broken_pipe_policy,
            reservation,
        }
    }

    /// Rearm a cached pair: fresh identity, timestamps and flag state.
    pub(crate) fn revive(&mut self, config: &PipeConfig) {
        let capacity = config.effective_capacity();
        for channel in self.channels.iter_mut() {
            channel.reset(capacity, config);
        }
        *self.open_count.get_mut() = 2;
        self.id = next_pipe_id();
        self.created = SystemTime::now();
        self.capacity = capacity;
        self.broken_pipe_policy = config.broken_pipe_policy;
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    fn outbound(&self, end: End) -> &PipeChannel {
        match end {
            End::A => &self.channels[0],
            End::B => &self.channels[1],
        }
    }

    fn inbound(&self, end: End) -> &PipeChannel {
        self.outbound(end.other())
    }
}

/// Stat-equivalent snapshot of an endpoint.
#[derive(Debug, Clone, Copy)]
pub struct PipeStat {
    /// Ring capacity of the inbound channel
    pub block_size: usize,
    /// Bytes currently buffered for this endpoint to read
    pub size: usize,
    pub blocks: usize,
    pub accessed: SystemTime,
    pub modified: SystemTime,
    pub created: SystemTime,
    /// Stable identity of the owning pair
    pub id: u64,
}

/// Cancels an endpoint's blocking wait, the signal-delivery analogue.
/// Holds no strong reference, so it never keeps a closed pipe alive.
#[derive(Clone)]
pub struct Interrupter {
    flag: Arc<InterruptFlag>,
    pair: Weak<PipePair>,
}

impl Interrupter {
    /// Cancel the endpoint's current blocking operation, or its next one
    /// if none is in flight. The cancelled call returns `Interrupted`.
    pub fn interrupt(&self) {
        self.flag.raise();
        if let Some(pair) = self.pair.upgrade() {
            pair.channels[0].kick();
            pair.channels[1].kick();
        }
    }
}

/// One end of a pipe pair. Closed exactly once, by `close` or by drop.
pub struct EndpointHandle {
    pair: Option<Arc<PipePair>>,
    end: End,
    nonblocking: AtomicBool,
    close_on_exec: bool,
    interrupt: Arc<InterruptFlag>,
    cache: Arc<CacheInner>,
}

/// Create a connected pair of full-duplex pipe endpoints.
///
/// Storage comes from `cache` when a retired pair of the right capacity
/// is available, otherwise from a fresh allocation against the cache's
/// storage quota (`ResourceExhausted` when spent).
pub fn create_pipe(
    flags: CreateFlags,
    config: &PipeConfig,
    cache: &PairCache,
) -> PipeResult<(EndpointHandle, EndpointHandle)> {
    let pair = cache.obtain(config)?;
    log::trace!("pipe {} created, capacity {}", pair.id(), pair.capacity());
    let a = EndpointHandle::new(pair.clone(), End::A, flags, cache);
    let b = EndpointHandle::new(pair, End::B, flags, cache);
    Ok((a, b))
}

impl EndpointHandle {
    fn new(pair: Arc<PipePair>, end: End, flags: CreateFlags, cache: &PairCache) -> Self {
        Self {
            pair: Some(pair),
            end,
            nonblocking: AtomicBool::new(flags.contains(CreateFlags::NONBLOCKING)),
            close_on_exec: flags.contains(CreateFlags::CLOSE_ON_EXEC),
            interrupt: Arc::new(InterruptFlag::new()),
            cache: cache.inner().clone(),
        }
    }

    fn pair(&self) -> &Arc<PipePair> {
        // The field is only vacated by drop
        self.pair.as_ref().expect("endpoint used after close")
    }

    /// Receive bytes from the peer. `Ok(0)` means end-of-stream once the
    /// peer has shut down or closed its writing side.
    pub fn read(&self, buf: &mut [u8]) -> PipeResult<usize> {
        self.pair()
            .inbound(self.end)
            .read_into(buf, self.nonblocking(), &self.interrupt)
    }

    /// Send bytes to the peer. Writes of at most `PIPE_BUF` bytes are
    /// atomic. On broken pipe the configured signal policy is applied.
    pub fn write(&self, buf: &[u8]) -> PipeResult<usize> {
        let pair = self.pair();
        let result = pair
            .outbound(self.end)
            .write_from(buf, self.nonblocking(), &self.interrupt);
        if result == Err(PipeError::BrokenPipe)
            && pair.broken_pipe_policy == BrokenPipePolicy::DeliverToOwner
        {
            pair.inbound(self.end).deliver_to_owner(PipeSignal::BrokenPipe);
        }
        result
    }

    /// `FIONBIO` equivalent.
    pub fn set_nonblocking(&self, nonblocking: bool) {
        self.nonblocking.store(nonblocking, Ordering::SeqCst);
    }

    pub fn nonblocking(&self) -> bool {
        self.nonblocking.load(Ordering::SeqCst)
    }

    pub fn close_on_exec(&self) -> bool {
        self.close_on_exec
    }

    /// `FIONREAD` equivalent: bytes buffered for this endpoint to read.
    pub fn bytes_available(&self) -> usize {
        self.pair().inbound(self.end).buffered()
    }

    /// `FIOASYNC` equivalent: deliver `IoPossible` to the owner on
    /// readiness transitions of the inbound channel.
    pub fn set_async_notify(&self, enabled: bool) {
        self.pair().inbound(self.end).set_async_notify(enabled);
    }

    /// `FIOSETOWN` equivalent.
    pub fn set_owner(&self, owner: Option<OwnerId>) {
        self.pair().inbound(self.end).set_owner(owner);
    }

    /// `FIOGETOWN` equivalent.
    pub fn owner(&self) -> Option<OwnerId> {
        self.pair().inbound(self.end).owner()
    }

    /// Finish one or both directions without closing the endpoint.
    /// Shutting down a direction that is already fully shut is a usage
    /// error and reports `InvalidArgument`.
    pub fn shutdown(&self, how: Shutdown) -> PipeResult<()> {
        let pair = self.pair();
        let read_side = matches!(how, Shutdown::Read | Shutdown::Both);
        let write_side = matches!(how, Shutdown::Write | Shutdown::Both);

        let mut any_open = false;
        if read_side && pair.inbound(self.end).lifecycle() != ChannelState::FullyClosed {
            any_open = true;
        }
        if write_side && pair.outbound(self.end).lifecycle() != ChannelState::FullyClosed {
            any_open = true;
        }
        if !any_open {
            return Err(PipeError::InvalidArgument);
        }

        if read_side {
            pair.inbound(self.end)
                .set_eof(Flags::READ_EOF | Flags::WRITE_EOF);
        }
        if write_side {
            pair.outbound(self.end)
                .set_eof(Flags::READ_EOF | Flags::WRITE_EOF);
        }
        Ok(())
    }

    pub fn stat(&self) -> PipeStat {
        let pair = self.pair();
        let inbound = pair.inbound(self.end);
        let times = inbound.times();
        let size = inbound.buffered();
        let block_size = inbound.capacity();
        PipeStat {
            block_size,
            size,
            blocks: (size + block_size - 1) / block_size,
            accessed: times.accessed,
            modified: times.modified,
            created: pair.created,
            id: pair.id,
        }
    }

    /// Poll equivalent: inbound readability merged with outbound
    /// writability. `eof` and `broken_pipe` carry the hangup conditions.
    pub fn readiness(&self) -> Readiness {
        let pair = self.pair();
        let inbound = pair.inbound(self.end).readiness();
        let outbound = pair.outbound(self.end).readiness();
        Readiness {
            readable: inbound.readable,
            writable: outbound.writable,
            eof: inbound.eof,
            broken_pipe: outbound.broken_pipe,
            buffered: inbound.buffered,
        }
    }

    /// Lifecycle of the channel this endpoint reads from.
    pub fn inbound_state(&self) -> ChannelState {
        self.pair().inbound(self.end).lifecycle()
    }

    /// Lifecycle of the channel this endpoint writes into.
    pub fn outbound_state(&self) -> ChannelState {
        self.pair().outbound(self.end).lifecycle()
    }

    /// Register for readiness transitions. Readable interest watches the
    /// inbound channel, writable interest the outbound one; end-of-file
    /// and broken-pipe transitions reach every subscriber.
    pub fn subscribe(
        &self,
        interest: Interest,
        subscriber: &Arc<dyn ReadinessSubscriber>,
    ) -> SubscriptionId {
        let id = SubscriptionId::next();
        let pair = self.pair();
        if interest.contains(Interest::READABLE) {
            pair.inbound(self.end)
                .subscribers
                .insert(id, Interest::READABLE, subscriber);
        }
        if interest.contains(Interest::WRITABLE) {
            pair.outbound(self.end)
                .subscribers
                .insert(id, Interest::WRITABLE, subscriber);
        }
        id
    }

    /// Returns whether the id was registered on this endpoint.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let pair = self.pair();
        let inbound = pair.inbound(self.end).subscribers.remove(id);
        let outbound = pair.outbound(self.end).subscribers.remove(id);
        inbound || outbound
    }

    /// Cancellation handle for this endpoint's blocking operations.
    pub fn interrupter(&self) -> Interrupter {
        Interrupter {
            flag: self.interrupt.clone(),
            pair: Arc::downgrade(self.pair()),
        }
    }

    /// Close the endpoint. Dropping the handle does the same; this form
    /// just makes the intent explicit at call sites.
    pub fn close(self) {}
}

impl Drop for EndpointHandle {
    fn drop(&mut self) {
        let pair = match self.pair.take() {
            Some(pair) => pair,
            None => return,
        };

        // Finish our side, then tell the peer the stream is over.
        pair.inbound(self.end)
            .set_eof(Flags::CLOSED | Flags::READ_EOF | Flags::WRITE_EOF);
        pair.outbound(self.end)
            .set_eof(Flags::READ_EOF | Flags::WRITE_EOF);
        log::trace!("pipe {} endpoint {:?} closed", pair.id, self.end);

        if pair.open_count.fetch_sub(1, Ordering::SeqCst) == 1 {
            // The peer endpoint released its reference when it closed, so
            // this cannot fail; the interrupters hold only weak refs.
            if let Ok(retired) = Arc::try_unwrap(pair) {
                self.cache.retire(retired);
            }
        }
    }
}

impl fmt::Debug for EndpointHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("EndpointHandle")
            .field("pipe", &self.pair().id)
            .field("end", &self.end)
            .field("nonblocking", &self.nonblocking())
            .finish()
    }
}
