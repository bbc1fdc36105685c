//! Asynchronous reader/writer locking with writer preference, reentrancy
//! and cooperative cancellation.
//!
//! `relock` serializes access to shared mutable state — an editor tree, a
//! debugger session, a background evaluation — without blocking worker
//! threads. The lock hands out tokens rather than owning the protected
//! data, so it composes with state that lives elsewhere.
//!
//! # Primitives
//!
//! - [`ReaderWriterLock`]: many concurrent readers or one writer; pending
//!   writers cut ahead of later readers (writer preference); nested
//!   acquisitions inside a held write lock share its request via
//!   [`ReentrancyToken`].
//! - [`ExclusiveReaderLock`]: groups readers that must run one at a time
//!   while still counting as ordinary readers toward writers.
//! - [`AsyncSignal`]: a resettable, awaitable boolean event.
//! - [`OneShotGate`]: first caller does the work, everyone else waits for
//!   its release.
//! - [`CancelToken`]: the cancellation signal the waiting primitives accept.
//!
//! # Cancel Safety
//!
//! Every waiting future in this crate is cancel-safe twice over: a fired
//! [`CancelToken`] resolves it as cancelled and removes its queue entry, and
//! simply dropping the future (e.g. losing a `select`) cleans up the same
//! way. Whatever the abandoned request was blocking is released.
//!
//! # Execution contract
//!
//! Acquisition futures suspend until another task releases the lock, so they
//! must be awaited on an executor where that release can actually run;
//! awaiting them from the single thread that would deliver the release is a
//! caller bug.
//!
//! # Example
//!
//! ```ignore
//! use relock::ReaderWriterLock;
//!
//! let lock = ReaderWriterLock::new();
//!
//! // Writer: exclusive.
//! let token = lock.write(None, None).await?;
//! rebuild_tree();
//!
//! // Nested read inside the held write lock shares its request.
//! let proof = token.reentrancy_token();
//! let nested = lock.read(None, Some(&proof)).await?;
//! drop(nested);
//! drop(token); // release on every exit path via Drop
//! ```

#![warn(missing_docs)]

pub mod cancel;
pub mod gate;
mod queue;
pub mod rwlock;
pub mod signal;

#[cfg(test)]
pub(crate) mod test_utils;

pub use cancel::CancelToken;
pub use gate::{Admission, Enter, GateError, OneShotGate};
pub use rwlock::{
    Acquire, AcquireError, ExclusiveReaderLock, LockToken, ReaderWriterLock, ReentrancyToken,
    TryLockError,
};
pub use signal::{AsyncSignal, SignalError, Signaled};
