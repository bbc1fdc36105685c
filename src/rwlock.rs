//! Writer-preferring, reentrancy-aware async reader/writer lock.
//!
//! [`ReaderWriterLock`] serializes access to an external resource: it hands
//! out [`LockToken`]s rather than guards over owned data, so the protected
//! state (a parse tree, a session, an evaluation context) stays with the
//! caller. Many readers may hold tokens concurrently; a writer holds one
//! alone. When a writer is waiting, new read requests queue behind it, which
//! prevents writer starvation under heavy read load.
//!
//! # Reentrancy
//!
//! Every token exposes a [`ReentrancyToken`] that can be threaded through
//! nested calls to prove the caller is already inside a granted lock:
//!
//! - read or write inside a held **write** lock shares the outer request and
//!   releases together with it;
//! - read inside a held **read** lock queues a fresh reader (with the
//!   writer-preference priority of any fresh reader);
//! - write inside a held **read** lock does **not** upgrade: it queues a
//!   fresh writer that waits for the outer reader to release.
//!
//! # Cancel Safety
//!
//! A pending acquisition completes as cancelled when its [`CancelToken`]
//! fires, and dropping a pending [`Acquire`] future cleanly removes the
//! request; either way the requests behind it are re-examined and released.
//! Cancellation after grant is a no-op — a granted request always yields
//! its token.
//!
//! # Execution contract
//!
//! Acquisition futures suspend until another task releases the lock. They
//! must be awaited on a multithreaded executor: a caller that is itself the
//! only thread able to drive the releasing task will deadlock.
//!
//! # Example
//!
//! ```ignore
//! let lock = ReaderWriterLock::new();
//!
//! let token = lock.write(None, None).await?;
//! mutate_shared_state();
//! let nested = lock.read(None, Some(&token.reentrancy_token())).await?;
//! drop(nested);
//! drop(token);
//! ```

use parking_lot::Mutex;
use smallvec::SmallVec;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Waker};

use crate::cancel::CancelToken;
use crate::queue::{Completion, GroupId, NodeId, WaitQueue};

/// Error returned when an asynchronous acquisition fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireError {
    /// Cancelled while waiting for the lock.
    Cancelled,
}

impl std::fmt::Display for AcquireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancelled => write!(f, "lock acquisition cancelled"),
        }
    }
}

impl std::error::Error for AcquireError {}

/// Error returned when trying to acquire without waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TryLockError;

impl std::fmt::Display for TryLockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "lock is busy")
    }
}

impl std::error::Error for TryLockError {}

#[derive(Debug)]
struct Shared {
    queue: Mutex<WaitQueue>,
    next_group: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
enum Request {
    Reader,
    Writer,
    Exclusive(GroupId),
}

/// An async reader/writer lock with writer preference and reentrancy.
#[derive(Debug)]
pub struct ReaderWriterLock {
    shared: Arc<Shared>,
}

impl ReaderWriterLock {
    /// Creates a new, uncontended lock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(WaitQueue::default()),
                next_group: AtomicU64::new(0),
            }),
        }
    }

    /// Requests a read token.
    ///
    /// With a reentrancy token naming a live write request of this lock the
    /// read shares that request and resolves immediately; otherwise it
    /// queues as a fresh reader, granted at once unless a writer is queued
    /// ahead of it.
    pub fn read<'a>(
        &'a self,
        cancel: Option<&'a CancelToken>,
        reentrancy: Option<&ReentrancyToken>,
    ) -> Acquire<'a> {
        acquire(&self.shared, Request::Reader, cancel, reentrancy)
    }

    /// Requests the write token.
    ///
    /// With a reentrancy token naming a live write request of this lock the
    /// write shares that request. A reader's token does not upgrade: the
    /// request queues as a fresh writer, cutting ahead of every reader that
    /// is not yet granted.
    pub fn write<'a>(
        &'a self,
        cancel: Option<&'a CancelToken>,
        reentrancy: Option<&ReentrancyToken>,
    ) -> Acquire<'a> {
        acquire(&self.shared, Request::Writer, cancel, reentrancy)
    }

    /// Acquires a read token only if it would be granted immediately.
    ///
    /// # Errors
    ///
    /// Returns [`TryLockError`] when a writer is queued — a queued writer is
    /// never bypassed.
    pub fn try_read(&self) -> Result<LockToken, TryLockError> {
        let mut queue = self.shared.queue.lock();
        if queue.has_writer() {
            return Err(TryLockError);
        }
        let (node, granted) = queue.add_reader();
        debug_assert!(granted);
        let _ = queue.grant(node);
        drop(queue);
        Ok(LockToken {
            shared: Arc::clone(&self.shared),
            node,
        })
    }

    /// Acquires the write token only if the lock is completely idle.
    ///
    /// # Errors
    ///
    /// Returns [`TryLockError`] when any request, reader or writer, is
    /// queued or held.
    pub fn try_write(&self) -> Result<LockToken, TryLockError> {
        let mut queue = self.shared.queue.lock();
        if !queue.is_empty() {
            return Err(TryLockError);
        }
        let (node, granted) = queue.add_writer();
        debug_assert!(granted);
        let _ = queue.grant(node);
        drop(queue);
        Ok(LockToken {
            shared: Arc::clone(&self.shared),
            node,
        })
    }

    /// Creates a sub-lock whose requests serialize against each other while
    /// behaving as ordinary readers toward writers.
    #[must_use]
    pub fn exclusive_reader_lock(&self) -> ExclusiveReaderLock {
        ExclusiveReaderLock {
            shared: Arc::clone(&self.shared),
            group: self.shared.next_group.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Number of requests currently tracked (granted and pending).
    #[must_use]
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().len()
    }
}

impl Default for ReaderWriterLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Groups a set of reader requests so they run one at a time.
///
/// Each [`wait`](Self::wait) is an ordinary reader with respect to writers,
/// but members of the same sub-lock are granted in strict submission order
/// relative to each other, and the group keeps the queue position of its
/// earliest outstanding member.
#[derive(Debug)]
pub struct ExclusiveReaderLock {
    shared: Arc<Shared>,
    group: GroupId,
}

impl ExclusiveReaderLock {
    /// Requests the next read token of this sub-lock.
    pub fn wait<'a>(&'a self, cancel: Option<&'a CancelToken>) -> Acquire<'a> {
        acquire(&self.shared, Request::Exclusive(self.group), cancel, None)
    }
}

/// A granted lock; dropping it releases the request.
///
/// The token can move across tasks and outlives the [`ReaderWriterLock`]
/// value that produced it. Releasing is idempotent by construction: the
/// token releases exactly once, on drop, and stale reentrancy handles to a
/// released request resolve to nothing.
#[derive(Debug)]
#[must_use = "the lock is released as soon as the token is dropped"]
pub struct LockToken {
    shared: Arc<Shared>,
    node: NodeId,
}

impl LockToken {
    /// An opaque proof of this grant, for nested acquisitions.
    #[must_use]
    pub fn reentrancy_token(&self) -> ReentrancyToken {
        ReentrancyToken {
            shared: Arc::downgrade(&self.shared),
            node: self.node,
        }
    }

    /// True when this token holds the underlying request in write mode.
    ///
    /// A read acquired reentrantly inside a write lock shares the write
    /// request, so its token reports `true` here.
    #[must_use]
    pub fn is_writer(&self) -> bool {
        self.shared
            .queue
            .lock()
            .is_writer(self.node)
            .expect("lock token references a removed request")
    }
}

impl Drop for LockToken {
    fn drop(&mut self) {
        release(&self.shared, self.node);
    }
}

/// Opaque capability proving the holder is inside a granted lock.
///
/// Created only by [`LockToken::reentrancy_token`]; compared by identity.
/// A token whose request has been released, or that belongs to a different
/// lock instance, silently resolves to "no reentrancy".
#[derive(Debug, Clone)]
pub struct ReentrancyToken {
    shared: Weak<Shared>,
    node: NodeId,
}

impl ReentrancyToken {
    fn resolve(&self, target: &Arc<Shared>) -> Option<NodeId> {
        let shared = self.shared.upgrade()?;
        Arc::ptr_eq(&shared, target).then_some(self.node)
    }
}

/// Releases one use of a request and wakes whatever its departure unblocks.
fn release(shared: &Shared, node: NodeId) {
    let wakers: SmallVec<[Waker; 4]> = {
        let mut queue = shared.queue.lock();
        let Some(grantable) = queue.release_claim(node) else {
            return;
        };
        grantable
            .into_iter()
            .filter_map(|id| queue.grant(id))
            .collect()
    };
    // Wake outside the critical section.
    for waker in wakers {
        waker.wake();
    }
}

fn acquire<'a>(
    shared: &'a Arc<Shared>,
    request: Request,
    cancel: Option<&'a CancelToken>,
    reentrancy: Option<&ReentrancyToken>,
) -> Acquire<'a> {
    // A live writer-mode source accepts the nested request outright,
    // bypassing the queue.
    if let Some(token) = reentrancy {
        if let Some(node) = token.resolve(shared) {
            if shared.queue.lock().try_reenter(node) {
                return Acquire {
                    shared,
                    cancel,
                    state: AcquireState::Claimed {
                        node,
                        registered: false,
                    },
                };
            }
        }
    }

    // A signal that has already fired yields a cancelled acquisition
    // without touching the queue.
    if cancel.is_some_and(CancelToken::is_cancelled) {
        return Acquire {
            shared,
            cancel,
            state: AcquireState::PreCancelled,
        };
    }

    // Queue position is fixed here, at request time, not at first poll.
    let mut queue = shared.queue.lock();
    let (node, granted) = match request {
        Request::Reader => queue.add_reader(),
        Request::Writer => queue.add_writer(),
        Request::Exclusive(group) => queue.add_exclusive_reader(group),
    };
    if granted {
        let _ = queue.grant(node);
    }
    drop(queue);

    Acquire {
        shared,
        cancel,
        state: AcquireState::Claimed {
            node,
            registered: false,
        },
    }
}

#[derive(Debug, Clone, Copy)]
enum AcquireState {
    /// The cancel token had fired before the request could be queued.
    PreCancelled,
    /// The request is queued (or shares a reentered node) and this future
    /// owns one reentrant use of it.
    Claimed { node: NodeId, registered: bool },
    Done,
}

/// Future returned by [`ReaderWriterLock::read`], [`ReaderWriterLock::write`]
/// and [`ExclusiveReaderLock::wait`].
///
/// Dropping a pending acquisition releases its queue slot.
#[derive(Debug)]
pub struct Acquire<'a> {
    shared: &'a Arc<Shared>,
    cancel: Option<&'a CancelToken>,
    state: AcquireState,
}

impl Future for Acquire<'_> {
    type Output = Result<LockToken, AcquireError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.state {
            AcquireState::PreCancelled => {
                self.state = AcquireState::Done;
                Poll::Ready(Err(AcquireError::Cancelled))
            }
            AcquireState::Claimed { node, registered } => {
                let mut queue = self.shared.queue.lock();
                match queue
                    .completion(node)
                    .expect("pending acquisition lost its request")
                {
                    // The grant is consulted before the cancel signal, so a
                    // request granted between polls yields its token even if
                    // the signal has since fired.
                    Completion::Granted => {
                        drop(queue);
                        self.state = AcquireState::Done;
                        Poll::Ready(Ok(LockToken {
                            shared: Arc::clone(self.shared),
                            node,
                        }))
                    }
                    Completion::Pending => {
                        if self.cancel.is_some_and(CancelToken::is_cancelled) {
                            let wakers: SmallVec<[Waker; 4]> = match queue.release_claim(node) {
                                Some(grantable) => grantable
                                    .into_iter()
                                    .filter_map(|id| queue.grant(id))
                                    .collect(),
                                None => SmallVec::new(),
                            };
                            drop(queue);
                            tracing::debug!(node = ?node, "pending acquisition cancelled");
                            self.state = AcquireState::Done;
                            for waker in wakers {
                                waker.wake();
                            }
                            return Poll::Ready(Err(AcquireError::Cancelled));
                        }

                        queue.update_waker(node, cx.waker());
                        if registered {
                            queue.refresh_cancel(node, cx.waker());
                        } else {
                            if let Some(token) = self.cancel {
                                let registration = token.register(cx.waker());
                                queue.attach_cancel(node, registration);
                            }
                            drop(queue);
                            self.state = AcquireState::Claimed {
                                node,
                                registered: true,
                            };
                        }
                        Poll::Pending
                    }
                }
            }
            AcquireState::Done => panic!("Acquire polled after completion"),
        }
    }
}

impl Drop for Acquire<'_> {
    fn drop(&mut self) {
        // An abandoned acquisition — cancelled by drop, e.g. in a select —
        // gives up its use of the request like a released token would.
        if let AcquireState::Claimed { node, .. } = self.state {
            release(self.shared, node);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    fn poll_once<F>(fut: &mut F) -> Poll<F::Output>
    where
        F: Future + Unpin,
    {
        let waker = Waker::noop();
        let mut cx = Context::from_waker(waker);
        Pin::new(fut).poll(&mut cx)
    }

    fn grab<F, T, E>(fut: &mut F) -> T
    where
        F: Future<Output = Result<T, E>> + Unpin,
        E: std::fmt::Debug,
    {
        match poll_once(fut) {
            Poll::Ready(result) => result.expect("acquisition failed"),
            Poll::Pending => panic!("acquisition unexpectedly pending"),
        }
    }

    #[test]
    fn multiple_readers_share_the_lock() {
        init_test("multiple_readers_share_the_lock");
        let lock = ReaderWriterLock::new();

        let mut r1 = lock.read(None, None);
        let mut r2 = lock.read(None, None);
        let t1 = grab(&mut r1);
        let t2 = grab(&mut r2);

        crate::assert_with_log!(!t1.is_writer(), "read token", false, t1.is_writer());
        crate::assert_with_log!(!t2.is_writer(), "read token", false, t2.is_writer());
        crate::test_complete!("multiple_readers_share_the_lock");
    }

    #[test]
    fn writer_excludes_everyone() {
        init_test("writer_excludes_everyone");
        let lock = ReaderWriterLock::new();

        let mut w = lock.write(None, None);
        let token = grab(&mut w);
        crate::assert_with_log!(token.is_writer(), "write token", true, token.is_writer());

        let read_blocked = lock.try_read().is_err();
        crate::assert_with_log!(read_blocked, "try_read blocked", true, read_blocked);
        let write_blocked = lock.try_write().is_err();
        crate::assert_with_log!(write_blocked, "try_write blocked", true, write_blocked);

        drop(token);
        let read_ok = lock.try_read().is_ok();
        crate::assert_with_log!(read_ok, "readable after release", true, read_ok);
        crate::test_complete!("writer_excludes_everyone");
    }

    #[test]
    fn reader_after_queued_writer_waits_for_both() {
        init_test("reader_after_queued_writer_waits_for_both");
        let lock = ReaderWriterLock::new();

        // Scenario A: R1 granted, W1 queued, R2 queued after W1.
        let mut r1 = lock.read(None, None);
        let t1 = grab(&mut r1);

        let mut w1 = lock.write(None, None);
        let w1_pending = poll_once(&mut w1).is_pending();
        crate::assert_with_log!(w1_pending, "w1 waits behind r1", true, w1_pending);

        let mut r2 = lock.read(None, None);
        let r2_pending = poll_once(&mut r2).is_pending();
        crate::assert_with_log!(r2_pending, "r2 waits behind w1", true, r2_pending);

        // R1 releases: W1 is granted, R2 still waits.
        drop(t1);
        let w1_token = grab(&mut w1);
        let r2_still_pending = poll_once(&mut r2).is_pending();
        crate::assert_with_log!(r2_still_pending, "r2 waits for w1", true, r2_still_pending);

        // W1 releases: R2 is granted.
        drop(w1_token);
        let _r2_token = grab(&mut r2);
        crate::test_complete!("reader_after_queued_writer_waits_for_both");
    }

    #[test]
    fn cancelling_queued_writer_leaves_reader_behind_earlier_writers() {
        init_test("cancelling_queued_writer_leaves_reader_behind_earlier_writers");
        let lock = ReaderWriterLock::new();
        let cancel = CancelToken::new();

        // Scenario B: W1 granted; W2 queued; R1 queued after W2.
        let mut w1 = lock.write(None, None);
        let w1_token = grab(&mut w1);

        let mut w2 = lock.write(Some(&cancel), None);
        assert!(poll_once(&mut w2).is_pending());

        let mut r1 = lock.read(None, None);
        assert!(poll_once(&mut r1).is_pending());

        // Cancel W2: R1 must still wait for W1.
        cancel.cancel();
        let cancelled = matches!(
            poll_once(&mut w2),
            Poll::Ready(Err(AcquireError::Cancelled))
        );
        crate::assert_with_log!(cancelled, "w2 cancelled", true, cancelled);
        let r1_pending = poll_once(&mut r1).is_pending();
        crate::assert_with_log!(r1_pending, "r1 still behind w1", true, r1_pending);

        drop(w1_token);
        let _r1_token = grab(&mut r1);
        crate::test_complete!("cancelling_queued_writer_leaves_reader_behind_earlier_writers");
    }

    #[test]
    fn exclusive_members_grant_in_submission_order() {
        init_test("exclusive_members_grant_in_submission_order");
        let lock = ReaderWriterLock::new();
        let sub = lock.exclusive_reader_lock();

        // Scenario C: E1, plain R1 interleaved, E2.
        let mut e1 = sub.wait(None);
        let e1_token = grab(&mut e1);

        let mut r1 = lock.read(None, None);
        let _r1_token = grab(&mut r1);

        let mut e2 = sub.wait(None);
        let e2_pending = poll_once(&mut e2).is_pending();
        crate::assert_with_log!(e2_pending, "e2 serializes behind e1", true, e2_pending);

        // Releasing E1 makes E2 the next member; R1 was independent all along.
        drop(e1_token);
        let _e2_token = grab(&mut e2);
        crate::test_complete!("exclusive_members_grant_in_submission_order");
    }

    #[test]
    fn exclusive_members_are_plain_readers_toward_writers() {
        init_test("exclusive_members_are_plain_readers_toward_writers");
        let lock = ReaderWriterLock::new();
        let sub = lock.exclusive_reader_lock();

        let mut w = lock.write(None, None);
        let w_token = grab(&mut w);

        let mut e1 = sub.wait(None);
        let pending = poll_once(&mut e1).is_pending();
        crate::assert_with_log!(pending, "member blocked by writer", true, pending);

        drop(w_token);
        let e1_token = grab(&mut e1);
        crate::assert_with_log!(!e1_token.is_writer(), "member is a reader", false, e1_token.is_writer());
        crate::test_complete!("exclusive_members_are_plain_readers_toward_writers");
    }

    #[test]
    fn write_inside_write_shares_the_request() {
        init_test("write_inside_write_shares_the_request");
        let lock = ReaderWriterLock::new();

        let mut outer = lock.write(None, None);
        let outer_token = grab(&mut outer);
        let proof = outer_token.reentrancy_token();

        let mut inner = lock.write(None, Some(&proof));
        let inner_token = grab(&mut inner);

        // One request, two uses: releasing the outer token keeps the lock.
        drop(outer_token);
        let blocked = lock.try_read().is_err();
        crate::assert_with_log!(blocked, "inner use still holds", true, blocked);

        drop(inner_token);
        let free = lock.try_read().is_ok();
        crate::assert_with_log!(free, "released after last use", true, free);
        crate::test_complete!("write_inside_write_shares_the_request");
    }

    #[test]
    fn read_inside_write_shares_the_request() {
        init_test("read_inside_write_shares_the_request");
        let lock = ReaderWriterLock::new();

        let mut outer = lock.write(None, None);
        let outer_token = grab(&mut outer);
        let proof = outer_token.reentrancy_token();

        let mut inner = lock.read(None, Some(&proof));
        let inner_token = grab(&mut inner);
        crate::assert_with_log!(
            inner_token.is_writer(),
            "nested read shares the write request",
            true,
            inner_token.is_writer()
        );

        drop(outer_token);
        drop(inner_token);
        let free = lock.try_write().is_ok();
        crate::assert_with_log!(free, "fully released", true, free);
        crate::test_complete!("read_inside_write_shares_the_request");
    }

    #[test]
    fn write_inside_read_does_not_upgrade() {
        // Pins the documented behavior: a reader's proof does not upgrade;
        // the nested writer is an independent request that waits for the
        // outer reader.
        init_test("write_inside_read_does_not_upgrade");
        let lock = ReaderWriterLock::new();

        let mut outer = lock.read(None, None);
        let outer_token = grab(&mut outer);
        let proof = outer_token.reentrancy_token();

        let mut inner = lock.write(None, Some(&proof));
        let pending = poll_once(&mut inner).is_pending();
        crate::assert_with_log!(pending, "nested writer queues fresh", true, pending);

        // The nested writer is granted only after the outer reader releases.
        drop(outer_token);
        let inner_token = grab(&mut inner);
        crate::assert_with_log!(inner_token.is_writer(), "writer granted", true, inner_token.is_writer());
        crate::test_complete!("write_inside_read_does_not_upgrade");
    }

    #[test]
    fn read_inside_read_is_a_fresh_reader() {
        init_test("read_inside_read_is_a_fresh_reader");
        let lock = ReaderWriterLock::new();

        let mut outer = lock.read(None, None);
        let outer_token = grab(&mut outer);
        let proof = outer_token.reentrancy_token();

        let mut inner = lock.read(None, Some(&proof));
        let inner_token = grab(&mut inner);

        // Two independent requests: both must release before a writer runs.
        drop(outer_token);
        let blocked = lock.try_write().is_err();
        crate::assert_with_log!(blocked, "inner reader still holds", true, blocked);
        drop(inner_token);
        let free = lock.try_write().is_ok();
        crate::assert_with_log!(free, "released", true, free);
        crate::test_complete!("read_inside_read_is_a_fresh_reader");
    }

    #[test]
    fn stale_reentrancy_token_queues_normally() {
        init_test("stale_reentrancy_token_queues_normally");
        let lock = ReaderWriterLock::new();

        let proof = {
            let mut w = lock.write(None, None);
            let token = grab(&mut w);
            token.reentrancy_token()
            // token released here: the proof is stale
        };

        let mut fresh = lock.write(None, Some(&proof));
        let token = grab(&mut fresh);
        crate::assert_with_log!(token.is_writer(), "fresh request granted", true, token.is_writer());
        crate::test_complete!("stale_reentrancy_token_queues_normally");
    }

    #[test]
    fn foreign_reentrancy_token_is_ignored() {
        init_test("foreign_reentrancy_token_is_ignored");
        let lock_a = ReaderWriterLock::new();
        let lock_b = ReaderWriterLock::new();

        let mut w_a = lock_a.write(None, None);
        let token_a = grab(&mut w_a);
        let proof_a = token_a.reentrancy_token();

        // A proof from lock A carries no authority over lock B.
        let mut w_b = lock_b.write(None, Some(&proof_a));
        let token_b = grab(&mut w_b);
        crate::assert_with_log!(token_b.is_writer(), "independent grant", true, token_b.is_writer());

        drop(token_b);
        drop(token_a);
        crate::test_complete!("foreign_reentrancy_token_is_ignored");
    }

    #[test]
    fn pre_fired_cancel_token_short_circuits() {
        init_test("pre_fired_cancel_token_short_circuits");
        let lock = ReaderWriterLock::new();
        let cancel = CancelToken::new();
        cancel.cancel();

        let mut fut = lock.read(Some(&cancel), None);
        let cancelled = matches!(
            poll_once(&mut fut),
            Poll::Ready(Err(AcquireError::Cancelled))
        );
        crate::assert_with_log!(cancelled, "cancelled without queuing", true, cancelled);
        crate::assert_with_log!(lock.queued() == 0, "queue untouched", 0usize, lock.queued());
        crate::test_complete!("pre_fired_cancel_token_short_circuits");
    }

    #[test]
    fn cancellation_after_grant_is_a_noop() {
        init_test("cancellation_after_grant_is_a_noop");
        let lock = ReaderWriterLock::new();
        let cancel = CancelToken::new();

        // Granted at request time; the signal fires before the first poll.
        let mut fut = lock.read(Some(&cancel), None);
        cancel.cancel();

        let token = grab(&mut fut);
        crate::assert_with_log!(!token.is_writer(), "grant wins over cancel", false, token.is_writer());
        crate::test_complete!("cancellation_after_grant_is_a_noop");
    }

    #[test]
    fn dropping_pending_acquisition_releases_successors() {
        init_test("dropping_pending_acquisition_releases_successors");
        let lock = ReaderWriterLock::new();

        let mut r1 = lock.read(None, None);
        let r1_token = grab(&mut r1);

        let mut w1 = lock.write(None, None);
        assert!(poll_once(&mut w1).is_pending());

        let mut r2 = lock.read(None, None);
        assert!(poll_once(&mut r2).is_pending());

        // Abandon the queued writer: the trailing reader is unblocked as
        // soon as no writer is queued.
        drop(w1);
        let _r2_token = grab(&mut r2);

        drop(r1_token);
        crate::assert_with_log!(lock.queued() == 1, "only r2 remains", 1usize, lock.queued());
        crate::test_complete!("dropping_pending_acquisition_releases_successors");
    }

    #[test]
    fn try_write_requires_an_idle_lock() {
        init_test("try_write_requires_an_idle_lock");
        let lock = ReaderWriterLock::new();

        let mut r1 = lock.read(None, None);
        let r1_token = grab(&mut r1);

        let busy = lock.try_write().is_err();
        crate::assert_with_log!(busy, "reader blocks try_write", true, busy);

        drop(r1_token);
        let token = lock.try_write().expect("idle lock grants");
        crate::assert_with_log!(token.is_writer(), "write token", true, token.is_writer());
        crate::test_complete!("try_write_requires_an_idle_lock");
    }

    #[test]
    fn try_read_never_bypasses_a_queued_writer() {
        init_test("try_read_never_bypasses_a_queued_writer");
        let lock = ReaderWriterLock::new();

        let mut r1 = lock.read(None, None);
        let r1_token = grab(&mut r1);
        let mut w1 = lock.write(None, None);
        assert!(poll_once(&mut w1).is_pending());

        let blocked = lock.try_read().is_err();
        crate::assert_with_log!(blocked, "queued writer blocks try_read", true, blocked);

        drop(r1_token);
        crate::test_complete!("try_read_never_bypasses_a_queued_writer");
    }

    #[test]
    fn tokens_outlive_the_lock_value() {
        init_test("tokens_outlive_the_lock_value");
        let lock = ReaderWriterLock::new();
        let token = {
            let mut w = lock.write(None, None);
            grab(&mut w)
        };
        drop(lock);

        // The shared state stays alive through the token.
        crate::assert_with_log!(token.is_writer(), "token still valid", true, token.is_writer());
        drop(token);
        crate::test_complete!("tokens_outlive_the_lock_value");
    }

    #[test]
    fn cancelled_waiter_leaves_no_registration() {
        init_test("cancelled_waiter_leaves_no_registration");
        let lock = ReaderWriterLock::new();
        let cancel = CancelToken::new();

        let mut w1 = lock.write(None, None);
        let w1_token = grab(&mut w1);

        let mut r1 = lock.read(Some(&cancel), None);
        assert!(poll_once(&mut r1).is_pending());

        cancel.cancel();
        let cancelled = matches!(
            poll_once(&mut r1),
            Poll::Ready(Err(AcquireError::Cancelled))
        );
        crate::assert_with_log!(cancelled, "reader cancelled", true, cancelled);
        crate::assert_with_log!(lock.queued() == 1, "only the writer remains", 1usize, lock.queued());

        drop(w1_token);
        crate::test_complete!("cancelled_waiter_leaves_no_registration");
    }
}
