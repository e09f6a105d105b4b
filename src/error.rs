//! The kernel's unified error type.
//!
//! Every fallible kernel operation returns [`Result<T>`], which is simply
//! `core::result::Result<T, Error>`. Unlike the per-operation error enums
//! found in some kernel designs, a single flat enum is used here: the set of
//! ways an operation can fail is small and mostly orthogonal, and callers
//! that care about a specific failure mode can match on it directly.
use core::fmt;

/// Reasons a kernel operation can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// The operation is not permitted in the calling context (e.g. a
    /// blocking call made from an interrupt handler, or CPU Lock is
    /// already active).
    Permission,
    /// An argument was out of range or otherwise invalid (e.g. a priority
    /// above the ceiling, a zero-sized pool block).
    InvalidArgument,
    /// A non-blocking call (`try_*`) could not be completed immediately.
    WouldBlock,
    /// A timed call did not complete before its deadline elapsed.
    Timeout,
    /// A blocking call was woken up by [`crate::thread::Thread::interrupt`]
    /// before its wait condition was satisfied.
    Interrupted,
    /// A semaphore or event-flag update would exceed its declared maximum.
    WouldOverflow,
    /// Acquiring a mutex would deadlock the calling thread (it already
    /// owns the mutex, or the lock order violates the priority ceiling).
    Deadlock,
    /// The mutex's previous owner terminated while holding it. The mutex
    /// is now locked by the caller but is in an inconsistent state;
    /// [`crate::mutex::Mutex::make_consistent`] must be called before it
    /// is trusted again.
    OwnerDead,
    /// A robust mutex was abandoned and never marked consistent, so it can
    /// no longer be locked by anyone.
    NotRecoverable,
    /// Dynamic allocation of a kernel object or message-queue storage
    /// failed.
    OutOfMemory,
    /// A message was too large to fit in a queue's fixed slot size.
    MessageTooBig,
    /// The requested functionality is not implemented by this port or
    /// kernel configuration.
    NotSupported,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Permission => "operation not permitted in the calling context",
            Self::InvalidArgument => "invalid argument",
            Self::WouldBlock => "operation would block",
            Self::Timeout => "operation timed out",
            Self::Interrupted => "wait was interrupted",
            Self::WouldOverflow => "value would overflow its declared maximum",
            Self::Deadlock => "operation would deadlock the calling thread",
            Self::OwnerDead => "mutex owner terminated while holding the lock",
            Self::NotRecoverable => "mutex is abandoned and not recoverable",
            Self::OutOfMemory => "out of memory",
            Self::MessageTooBig => "message exceeds the queue's slot size",
            Self::NotSupported => "operation not supported",
        };
        f.write_str(s)
    }
}

#[cfg(any(test, feature = "std"))]
impl std::error::Error for Error {}

/// The result type returned by fallible kernel operations.
pub type Result<T> = core::result::Result<T, Error>;
