//! Cooperative cancellation signal for pending lock acquisitions.
//!
//! [`CancelToken`] is a cloneable, one-way signal: once [`CancelToken::cancel`]
//! has been called every clone observes the token as cancelled, and every
//! waiter registered at that moment is woken so it can observe the state on
//! its next poll. Tokens are consulted only while a request is pending;
//! firing a token after a request has been granted has no effect on it.
//!
//! # Registration lifecycle
//!
//! Waiting futures register their waker and hold the returned
//! [`CancelRegistration`]. Dropping the registration removes the waker from
//! the token, so a settled waiter stops listening immediately and leaves no
//! callback behind.

use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::Waker;

/// A cloneable cancellation signal.
///
/// All clones share the same state: cancelling one cancels them all.
///
/// # Example
///
/// ```
/// use relock::CancelToken;
///
/// let token = CancelToken::new();
/// assert!(!token.is_cancelled());
///
/// token.cancel();
/// assert!(token.is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

#[derive(Debug, Default)]
struct TokenInner {
    /// Set exactly once; observed lock-free by `is_cancelled`.
    fired: AtomicBool,
    /// Registered waiter wakers (protected by mutex).
    waiters: Mutex<RegistrationSlab>,
}

/// Slab of registered wakers that reuses freed slots so repeated
/// register/deregister cycles do not grow the backing Vec.
#[derive(Debug, Default)]
struct RegistrationSlab {
    entries: Vec<Option<Waker>>,
    free_slots: SmallVec<[usize; 4]>,
}

impl RegistrationSlab {
    #[inline]
    fn insert(&mut self, waker: Waker) -> usize {
        if let Some(index) = self.free_slots.pop() {
            self.entries[index] = Some(waker);
            index
        } else {
            let index = self.entries.len();
            self.entries.push(Some(waker));
            index
        }
    }

    #[inline]
    fn remove(&mut self, index: usize) {
        if index < self.entries.len() {
            self.entries[index] = None;
            self.free_slots.push(index);
        }

        // Shrink from the end: pop trailing vacant slots so an idle token
        // holds no storage.
        while self.entries.last().is_some_and(Option::is_none) {
            let tail = self.entries.len() - 1;
            self.entries.pop();
            if let Some(pos) = self.free_slots.iter().position(|&i| i == tail) {
                self.free_slots.swap_remove(pos);
            }
        }
    }

    #[inline]
    fn update(&mut self, index: usize, waker: &Waker) {
        if let Some(slot) = self.entries.get_mut(index) {
            match slot {
                Some(existing) if existing.will_wake(waker) => {}
                Some(existing) => existing.clone_from(waker),
                None => *slot = Some(waker.clone()),
            }
        }
    }

    #[inline]
    fn drain(&mut self) -> SmallVec<[Waker; 4]> {
        let wakers = self.entries.drain(..).flatten().collect();
        self.free_slots.clear();
        wakers
    }

    #[cfg(test)]
    fn active(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }
}

impl CancelToken {
    /// Creates a new, uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if [`cancel`](Self::cancel) has been called on any clone.
    #[inline]
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.fired.load(Ordering::Acquire)
    }

    /// Cancels the token, waking every registered waiter.
    ///
    /// Idempotent: only the first call wakes anyone.
    pub fn cancel(&self) {
        let wakers = {
            let mut waiters = self.inner.waiters.lock();
            // The flag flips under the waiter lock so `register` cannot
            // observe an unfired token and then miss the drain (lost wakeup).
            if self.inner.fired.swap(true, Ordering::AcqRel) {
                return;
            }
            waiters.drain()
        };
        for waker in wakers {
            waker.wake();
        }
    }

    /// Registers a waker to be woken when the token fires.
    ///
    /// If the token has already fired the waker is woken immediately and the
    /// returned registration is inert.
    pub(crate) fn register(&self, waker: &Waker) -> CancelRegistration {
        let slot = {
            let mut waiters = self.inner.waiters.lock();
            if self.inner.fired.load(Ordering::Acquire) {
                None
            } else {
                Some(waiters.insert(waker.clone()))
            }
        };
        if slot.is_none() {
            waker.wake_by_ref();
        }
        CancelRegistration {
            token: self.clone(),
            slot,
        }
    }

    /// Number of live registrations (test introspection).
    #[cfg(test)]
    fn registered(&self) -> usize {
        self.inner.waiters.lock().active()
    }
}

/// Handle for a registered waker; deregisters on drop.
#[derive(Debug)]
pub(crate) struct CancelRegistration {
    token: CancelToken,
    slot: Option<usize>,
}

impl CancelRegistration {
    /// Replaces the registered waker if the executor handed out a new one.
    pub(crate) fn refresh(&self, waker: &Waker) {
        if let Some(slot) = self.slot {
            self.token.inner.waiters.lock().update(slot, waker);
        }
    }
}

impl Drop for CancelRegistration {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.token.inner.waiters.lock().remove(slot);
        }
    }
}
