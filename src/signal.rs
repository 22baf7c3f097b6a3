//! Signal-delivery interface for async notification and broken-pipe
//! reporting. The pipe layer never delivers signals itself; it hands
//! them to an injected sink so the embedding process/scheduler layer
//! decides what delivery means.

/// Signal-delivery target registered on an endpoint (`FIOSETOWN` analogue).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerId(pub u64);

/// Conditions forwarded to a [`SignalSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipeSignal {
    /// I/O became possible on an async-notify endpoint (`SIGIO` analogue)
    IoPossible,
    /// A write hit a channel whose consumer is gone (`SIGPIPE` analogue)
    BrokenPipe,
}

/// Receiver for out-of-band pipe signals.
pub trait SignalSink: Send + Sync {
    fn deliver(&self, owner: OwnerId, signal: PipeSignal);
}

/// What to do when a write fails with broken pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokenPipePolicy {
    /// Deliver [`PipeSignal::BrokenPipe`] to the writing endpoint's owner,
    /// if one is registered
    DeliverToOwner,
    /// Report the error only
    Ignore,
}
