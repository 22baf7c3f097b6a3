/// Status values for pipe operations.
///
/// End-of-stream is not represented here: a read past `READ_EOF`
/// returns `Ok(0)`, matching the "EOF is not an error" contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipeError {
    /// Non-blocking operation could not make any progress
    WouldBlock,
    /// Write side reached a channel whose consumer is gone
    BrokenPipe,
    /// A blocking wait was cancelled
    Interrupted,
    /// Pair creation exceeded the storage quota
    ResourceExhausted,
    /// Contract misuse, e.g. shutting down an already fully-shut direction
    InvalidArgument,
}

pub type PipeResult<T> = Result<T, PipeError>;

impl core::fmt::Display for PipeError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        let msg = match self {
            Self::WouldBlock => "operation would block",
            Self::BrokenPipe => "broken pipe",
            Self::Interrupted => "interrupted",
            Self::ResourceExhausted => "pipe storage quota exhausted",
            Self::InvalidArgument => "invalid argument",
        };
        write!(f, "{}", msg)
    }
}
