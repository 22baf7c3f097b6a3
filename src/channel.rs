//! One direction of travel: ring storage, flow flags, serialization
//! tokens and the wait point they all share.
//!
//! The read and write paths are structured as "copy while possible,
//! otherwise wake the peer, then block" loops. Wakeups follow the
//! test-and-clear contract: a `WANT_*` flag is cleared and the broadcast
//! issued only by whoever observed it set, so each blocked party is woken
//! once per transition rather than once per byte.
//!
//! TODO: direct copy path for single writes larger than the ring, so a
//! huge transfer does not have to stream through ring-sized chunks

use core::time::Duration;
use std::sync::Arc;
use std::time::SystemTime;

use crate::config::{PipeConfig, PIPE_BUF};
use crate::error::{PipeError, PipeResult};
use crate::event::{Readiness, SubscriberSet};
use crate::flow::{Flags, FlowState};
use crate::ring::RingBuffer;
use crate::signal::{OwnerId, PipeSignal, SignalSink};
use crate::token::SerializationToken;
use crate::wait::{InterruptFlag, WaitPoint};

/// Lifecycle of a channel, derived from its monotonic flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Open,
    /// Producer side is done (`READ_EOF`); buffered bytes still drain
    ReadHalfClosed,
    /// Consumer side refuses more data (`WRITE_EOF`)
    WriteHalfClosed,
    /// Terminal
    FullyClosed,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ChannelTimes {
    pub accessed: SystemTime,
    pub modified: SystemTime,
}

pub(crate) struct PipeChannel {
    ring: RingBuffer,
    state: FlowState,
    rtoken: SerializationToken,
    wtoken: SerializationToken,
    wait: WaitPoint,
    pub(crate) subscribers: SubscriberSet,
    owner: spin::Mutex<Option<OwnerId>>,
    times: spin::Mutex<ChannelTimes>,
    sink: Option<Arc<dyn SignalSink>>,
    busy_poll: Duration,
}

impl PipeChannel {
    pub fn new(capacity: usize, config: &PipeConfig) -> Self {
        let now = SystemTime::now();
        Self {
            ring: RingBuffer::with_capacity(capacity),
            state: FlowState::new(),
            rtoken: SerializationToken::new(),
            wtoken: SerializationToken::new(),
            wait: WaitPoint::new(),
            subscribers: SubscriberSet::new(),
            owner: spin::Mutex::new(None),
            times: spin::Mutex::new(ChannelTimes {
                accessed: now,
                modified: now,
            }),
            sink: config.signal_sink.clone(),
            busy_poll: config.busy_poll,
        }
    }

    /// Rearm a retired channel for reuse. Exclusive access guarantees
    /// quiescence, so resetting the monotonic flags starts a new channel
    /// lifetime.
    pub fn reset(&mut self, capacity: usize, config: &PipeConfig) {
        if self.ring.capacity() != capacity {
            self.ring.resize(capacity);
        } else {
            self.ring.reset();
        }
        self.state.reset();
        self.subscribers.clear();
        *self.owner.get_mut() = None;
        let now = SystemTime::now();
        *self.times.get_mut() = ChannelTimes {
            accessed: now,
            modified: now,
        };
        self.sink = config.signal_sink.clone();
        self.busy_poll = config.busy_poll;
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    pub fn buffered(&self) -> usize {
        self.ring.read_space()
    }

    pub fn times(&self) -> ChannelTimes {
        *self.times.lock()
    }

    pub fn set_owner(&self, owner: Option<OwnerId>) {
        *self.owner.lock() = owner;
    }

    pub fn owner(&self) -> Option<OwnerId> {
        *self.owner.lock()
    }

    pub fn set_async_notify(&self, enabled: bool) {
        if enabled {
            self.state.set(Flags::ASYNC_NOTIFY);
        } else {
            self.state.clear(Flags::ASYNC_NOTIFY);
        }
    }

    pub fn lifecycle(&self) -> ChannelState {
        let flags = self.state.load();
        match (
            flags.intersects(Flags::READ_EOF),
            flags.intersects(Flags::WRITE_EOF),
        ) {
            (false, false) => ChannelState::Open,
            (true, false) => ChannelState::ReadHalfClosed,
            (false, true) => ChannelState::WriteHalfClosed,
            (true, true) => ChannelState::FullyClosed,
        }
    }

    pub fn readiness(&self) -> Readiness {
        let flags = self.state.load();
        let buffered = self.ring.read_space();
        Readiness {
            readable: buffered > 0 || flags.intersects(Flags::READ_EOF),
            writable: self.ring.write_space() >= PIPE_BUF
                || flags.intersects(Flags::WRITE_EOF | Flags::CLOSED),
            eof: flags.intersects(Flags::READ_EOF),
            broken_pipe: flags.intersects(Flags::WRITE_EOF | Flags::CLOSED),
            buffered,
        }
    }

    /// Mark end-of-stream flags and wake everyone, once per transition.
    pub fn set_eof(&self, flags: Flags) {
        debug_assert!((Flags::READ_EOF | Flags::WRITE_EOF | Flags::CLOSED).contains(flags));
        let previous = self.state.set(flags);
        if previous.contains(flags) {
            return;
        }
        self.wait.wake_all();
        self.select_wakeup();
    }

    /// Wake anything the channel is being waited on for: event
    /// subscribers, plus the owner's async signal when armed.
    fn select_wakeup(&self) {
        let readiness = self.readiness();
        self.subscribers.notify(readiness);
        if self.state.contains(Flags::ASYNC_NOTIFY) {
            self.deliver_to_owner(PipeSignal::IoPossible);
        }
    }

    /// Hand `signal` to the configured sink, addressed to the owner
    /// registered on this channel. No owner or no sink means no delivery.
    pub fn deliver_to_owner(&self, signal: PipeSignal) {
        if let (Some(sink), Some(owner)) = (&self.sink, self.owner()) {
            sink.deliver(owner, signal);
        }
    }

    /// Drain up to `buf.len()` bytes. Returns `Ok(0)` at end-of-stream.
    /// Never blocks once some progress has been made; a transient error
    /// after progress is deferred to the next call.
    pub fn read_into(
        &self,
        buf: &mut [u8],
        nonblocking: bool,
        interrupt: &InterruptFlag,
    ) -> PipeResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let guard = self.rtoken.acquire(&self.wait, interrupt)?;

        let mut nread = 0;
        let mut error = None;
        while nread < buf.len() {
            let avail = self.ring.read_space();
            if avail > 0 {
                // The half-capacity cap bounds a single transfer so a
                // starved writer hears about freed space promptly.
                let chunk = (buf.len() - nread).min(avail).min(self.capacity() / 2);
                self.ring.dequeue(&mut buf[nread..nread + chunk]);
                nread += chunk;
            } else {
                if self.state.contains(Flags::READ_EOF) {
                    break;
                }
                if self.state.test_and_clear(Flags::WANT_WRITE) {
                    self.wait.wake_all();
                }
                if nread > 0 {
                    break;
                }
                if nonblocking {
                    error = Some(PipeError::WouldBlock);
                    break;
                }
                self.state.set(Flags::WANT_READ);
                let woken = self.wait.sleep_until(self.busy_poll, interrupt, || {
                    self.ring.read_space() > 0 || self.state.intersects(Flags::READ_EOF)
                });
                if let Err(e) = woken {
                    error = Some(e);
                    break;
                }
            }
        }

        let result = match error {
            Some(e) if nread == 0 => Err(e),
            _ => Ok(nread),
        };
        if result.is_ok() {
            self.times.lock().accessed = SystemTime::now();
        }

        // Write-blocking hysteresis: only wake the writer once the buffer
        // has meaningfully drained, not on every byte freed.
        if self.ring.read_space() < self.capacity() / 2
            && self.state.test_and_clear(Flags::WANT_WRITE)
        {
            self.wait.wake_all();
        }
        if self.ring.write_space() >= PIPE_BUF {
            self.select_wakeup();
        }

        drop(guard);
        result
    }

    /// Enqueue `buf`, blocking for space unless `nonblocking`. Writes of
    /// at most `PIPE_BUF` bytes land contiguously or not at all.
    pub fn write_from(
        &self,
        buf: &[u8],
        nonblocking: bool,
        interrupt: &InterruptFlag,
    ) -> PipeResult<usize> {
        if self.state.intersects(Flags::WRITE_EOF | Flags::CLOSED) {
            return if buf.is_empty() {
                Ok(0)
            } else {
                log::debug!("write on a finished channel");
                Err(PipeError::BrokenPipe)
            };
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let guard = self.wtoken.acquire(&self.wait, interrupt)?;

        let atomic = buf.len() <= PIPE_BUF;
        let mut written = 0;
        let mut error = None;
        while written < buf.len() {
            if self.state.intersects(Flags::WRITE_EOF | Flags::CLOSED) {
                error = Some(PipeError::BrokenPipe);
                break;
            }
            let mut space = self.ring.write_space();
            if atomic && space < buf.len() {
                // Refuse partial placement of an atomic write
                space = 0;
            }
            if space > 0 {
                let chunk = (buf.len() - written).min(space).min(self.capacity() / 2);
                self.ring.enqueue(&buf[written..written + chunk]);
                written += chunk;
                if self.state.test_and_clear(Flags::WANT_READ) {
                    self.wait.wake_all();
                }
            } else {
                if self.state.test_and_clear(Flags::WANT_READ) {
                    self.wait.wake_all();
                }
                if nonblocking {
                    error = Some(PipeError::WouldBlock);
                    break;
                }
                // A full buffer is the readable case poll waiters care about
                self.select_wakeup();
                self.state.set(Flags::WANT_WRITE);
                let need = if atomic { buf.len() } else { 1 };
                let woken = self.wait.sleep_until(self.busy_poll, interrupt, || {
                    self.ring.write_space() >= need
                        || self.state.intersects(Flags::WRITE_EOF | Flags::CLOSED)
                });
                if let Err(e) = woken {
                    error = Some(e);
                    break;
                }
            }
        }

        // Completed work is never discarded: report the partial count and
        // leave the error for the next call.
        let result = match error {
            Some(e) if written == 0 => Err(e),
            _ => Ok(written),
        };
        if result.is_ok() {
            self.times.lock().modified = SystemTime::now();
        }

        if self.ring.read_space() > 0 {
            if self.state.test_and_clear(Flags::WANT_READ) {
                self.wait.wake_all();
            }
            self.select_wakeup();
        }

        drop(guard);
        result
    }

    /// Broadcast wake for waiters that are not parked on flow conditions,
    /// e.g. a blocked caller being cancelled.
    pub fn kick(&self) {
        self.wait.wake_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn channel() -> PipeChannel {
        PipeChannel::new(16 * 1024, &PipeConfig::default())
    }

    fn intr() -> InterruptFlag {
        InterruptFlag::new()
    }

    #[test]
    fn test_fifo_order() {
        let ch = channel();
        ch.write_from(b"first ", true, &intr()).unwrap();
        ch.write_from(b"second ", true, &intr()).unwrap();
        ch.write_from(b"third", true, &intr()).unwrap();

        let mut out = [0; 18];
        assert_eq!(ch.read_into(&mut out, true, &intr()), Ok(18));
        assert_eq!(&out, b"first second third");
    }

    #[test]
    fn test_round_trip_up_to_capacity() {
        let ch = channel();
        let data: Vec<u8> = (0..16 * 1024).map(|i| (i % 251) as u8).collect();
        assert_eq!(ch.write_from(&data, true, &intr()), Ok(data.len()));

        let mut out = vec![0; data.len()];
        assert_eq!(ch.read_into(&mut out, true, &intr()), Ok(data.len()));
        assert_eq!(out, data);
    }

    #[test]
    fn test_eof_drains_then_reports_end() {
        let ch = channel();
        ch.write_from(b"abcdef", true, &intr()).unwrap();
        ch.set_eof(Flags::READ_EOF | Flags::WRITE_EOF);

        let mut out = [0; 64];
        assert_eq!(ch.read_into(&mut out, false, &intr()), Ok(6));
        assert_eq!(&out[..6], b"abcdef");
        // End-of-stream, not an error
        assert_eq!(ch.read_into(&mut out, false, &intr()), Ok(0));
    }

    #[test]
    fn test_nonblocking_empty_and_full() {
        let ch = channel();
        let mut out = [0; 8];
        assert_eq!(
            ch.read_into(&mut out, true, &intr()),
            Err(PipeError::WouldBlock)
        );

        let fill = vec![3; ch.capacity()];
        assert_eq!(ch.write_from(&fill, true, &intr()), Ok(fill.len()));
        assert_eq!(
            ch.write_from(&[1], true, &intr()),
            Err(PipeError::WouldBlock)
        );
    }

    #[test]
    fn test_partial_write_reported_as_success() {
        let ch = channel();
        let data = vec![9; ch.capacity() + 1000];
        // Non-blocking large write fills the ring and stops
        assert_eq!(ch.write_from(&data, true, &intr()), Ok(ch.capacity()));
    }

    #[test]
    fn test_atomic_write_refuses_partial_placement() {
        let ch = channel();
        let fill = vec![0; ch.capacity() - 100];
        ch.write_from(&fill, true, &intr()).unwrap();

        // 100 bytes free, but a 512-byte atomic write must not split
        assert_eq!(
            ch.write_from(&[1; PIPE_BUF], true, &intr()),
            Err(PipeError::WouldBlock)
        );
        // A non-atomic write takes the partial space
        assert_eq!(ch.write_from(&[2; PIPE_BUF + 1], true, &intr()), Ok(100));
    }

    #[test]
    fn test_broken_channel_write() {
        let ch = channel();
        ch.set_eof(Flags::WRITE_EOF | Flags::READ_EOF);
        assert_eq!(
            ch.write_from(b"data", false, &intr()),
            Err(PipeError::BrokenPipe)
        );
        // Zero-length writes succeed even then
        assert_eq!(ch.write_from(b"", false, &intr()), Ok(0));
    }

    #[test]
    fn test_interrupt_blocked_read() {
        let ch = Arc::new(channel());
        let ch2 = ch.clone();
        let intr = Arc::new(InterruptFlag::new());
        let intr2 = intr.clone();

        let reader = thread::spawn(move || {
            let mut out = [0; 8];
            ch2.read_into(&mut out, false, &intr2)
        });

        thread::sleep(core::time::Duration::from_millis(50));
        intr.raise();
        ch.kick();
        assert_eq!(reader.join().unwrap(), Err(PipeError::Interrupted));
    }

    #[test]
    fn test_blocked_writer_wakes_on_drain() {
        let ch = Arc::new(channel());
        let fill = vec![1; ch.capacity()];
        ch.write_from(&fill, true, &intr()).unwrap();

        let ch2 = ch.clone();
        let writer = thread::spawn(move || ch2.write_from(&[2; 100], false, &intr()));

        thread::sleep(core::time::Duration::from_millis(50));
        // Drain past the hysteresis threshold
        let mut out = vec![0; ch.capacity()];
        ch.read_into(&mut out, false, &intr()).unwrap();

        assert_eq!(writer.join().unwrap(), Ok(100));
    }

    #[test]
    fn test_concurrent_transfer_is_lossless() {
        let ch = Arc::new(channel());
        let data: Vec<u8> = (0..20_000).map(|i| (i % 241) as u8).collect();

        let ch2 = ch.clone();
        let expected = data.clone();
        let writer = thread::spawn(move || {
            assert_eq!(ch2.write_from(&expected, false, &intr()), Ok(20_000));
        });

        let mut received = Vec::new();
        let mut chunk = [0; 4096];
        while received.len() < 20_000 {
            let n = ch.read_into(&mut chunk, false, &intr()).unwrap();
            received.extend_from_slice(&chunk[..n]);
        }
        writer.join().unwrap();
        assert_eq!(received, data);
    }

    #[test]
    fn test_lifecycle_states() {
        let ch = channel();
        assert_eq!(ch.lifecycle(), ChannelState::Open);
        ch.set_eof(Flags::READ_EOF);
        assert_eq!(ch.lifecycle(), ChannelState::ReadHalfClosed);
        ch.set_eof(Flags::WRITE_EOF);
        assert_eq!(ch.lifecycle(), ChannelState::FullyClosed);
    }
}
