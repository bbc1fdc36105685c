//! Resettable, awaitable boolean signal.
//!
//! [`AsyncSignal`] is a level-triggered event: once [`set`](AsyncSignal::set)
//! every current and future wait completes until the signal is
//! [`reset`](AsyncSignal::reset). Completion is sticky per waiter — a waiter
//! woken by `set` still completes even if another thread resets the signal
//! before the waiter is polled again.
//!
//! # Cancel Safety
//!
//! - `wait()` / `wait_with()`: dropping the future cleanly removes the waiter.
//! - `wait_with(cancel)`: completes as cancelled if the token fires first,
//!   and the wait registration is removed so it does not leak.

use parking_lot::Mutex;
use smallvec::SmallVec;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, Waker};

use crate::cancel::{CancelRegistration, CancelToken};

/// Error returned when a cancellable wait is abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalError {
    /// Cancelled while waiting for the signal.
    Cancelled,
}

impl std::fmt::Display for SignalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancelled => write!(f, "signal wait cancelled"),
        }
    }
}

impl std::error::Error for SignalError {}

/// A resettable signal that many tasks can await.
///
/// # Example
///
/// ```ignore
/// let signal = AsyncSignal::new();
///
/// let fut = async {
///     signal.wait().await.unwrap();
///     println!("signalled!");
/// };
///
/// signal.set();
/// ```
#[derive(Debug, Default)]
pub struct AsyncSignal {
    /// Level flag; observed lock-free on the fast path.
    set: AtomicBool,
    /// Waiters registered before the signal was set (protected by mutex).
    waiters: Mutex<WaiterSlab>,
}

/// Waiter storage that reuses freed slots so cancelled waiters leave no
/// holes behind.
#[derive(Debug, Default)]
struct WaiterSlab {
    entries: Vec<WaiterEntry>,
    free_slots: SmallVec<[usize; 4]>,
}

#[derive(Debug)]
struct WaiterEntry {
    /// Waker for a parked waiter; taken when the waiter is completed.
    waker: Option<Waker>,
    /// Sticky completion mark — survives a racing `reset`.
    notified: bool,
}

impl WaiterSlab {
    #[inline]
    fn insert(&mut self, waker: Waker) -> usize {
        let entry = WaiterEntry {
            waker: Some(waker),
            notified: false,
        };
        if let Some(index) = self.free_slots.pop() {
            self.entries[index] = entry;
            index
        } else {
            let index = self.entries.len();
            self.entries.push(entry);
            index
        }
    }

    #[inline]
    fn remove(&mut self, index: usize) {
        if index < self.entries.len() {
            self.entries[index].waker = None;
            self.entries[index].notified = false;
            self.free_slots.push(index);
        }

        // Shrink trailing vacant slots.
        while self
            .entries
            .last()
            .is_some_and(|e| e.waker.is_none() && !e.notified)
        {
            let tail = self.entries.len() - 1;
            self.entries.pop();
            if let Some(pos) = self.free_slots.iter().position(|&i| i == tail) {
                self.free_slots.swap_remove(pos);
            }
        }
    }

    #[inline]
    fn complete_all(&mut self) -> SmallVec<[Waker; 4]> {
        let mut wakers = SmallVec::new();
        for entry in &mut self.entries {
            if let Some(waker) = entry.waker.take() {
                entry.notified = true;
                wakers.push(waker);
            }
        }
        wakers
    }

    #[inline]
    fn waiting(&self) -> usize {
        self.entries.iter().filter(|e| e.waker.is_some()).count()
    }
}

impl AsyncSignal {
    /// Creates a new signal in the unset state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the signal is currently set.
    #[inline]
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::Acquire)
    }

    /// Sets the signal, completing all current waiters and all future waits
    /// until [`reset`](Self::reset).
    pub fn set(&self) {
        let wakers = {
            let mut waiters = self.waiters.lock();
            // Flip the level under the waiter lock so a waiter cannot
            // observe "unset", then register, and miss this completion.
            self.set.store(true, Ordering::Release);
            waiters.complete_all()
        };
        for waker in wakers {
            waker.wake();
        }
    }

    /// Re-arms the signal if it is currently set.
    ///
    /// Resolved by compare-and-swap: when several resets race, exactly one
    /// observes the set state and wins; the call returns whether this was
    /// the winner. Waiters already completed by `set` stay completed.
    pub fn reset(&self) -> bool {
        self.set
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Returns a future that completes when the signal is set.
    pub fn wait(&self) -> Signaled<'_> {
        Signaled {
            signal: self,
            cancel: None,
            cancel_reg: None,
            state: WaitState::Init,
            entry: None,
        }
    }

    /// Returns a future that completes when the signal is set, or fails
    /// with [`SignalError::Cancelled`] if the token fires first.
    pub fn wait_with<'a>(&'a self, cancel: &'a CancelToken) -> Signaled<'a> {
        Signaled {
            signal: self,
            cancel: Some(cancel),
            cancel_reg: None,
            state: WaitState::Init,
            entry: None,
        }
    }

    /// Number of tasks currently parked on the signal.
    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.waiters.lock().waiting()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitState {
    Init,
    Waiting,
    Done,
    Cancelled,
}

/// Future returned by [`AsyncSignal::wait`] and [`AsyncSignal::wait_with`].
#[derive(Debug)]
pub struct Signaled<'a> {
    signal: &'a AsyncSignal,
    cancel: Option<&'a CancelToken>,
    cancel_reg: Option<CancelRegistration>,
    state: WaitState,
    entry: Option<usize>,
}

impl Future for Signaled<'_> {
    type Output = Result<(), SignalError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.state {
            WaitState::Init => {
                if self.signal.is_set() {
                    self.state = WaitState::Done;
                    return Poll::Ready(Ok(()));
                }
                if self.cancel.is_some_and(CancelToken::is_cancelled) {
                    self.state = WaitState::Cancelled;
                    return Poll::Ready(Err(SignalError::Cancelled));
                }

                {
                    let mut waiters = self.signal.waiters.lock();
                    // Re-check the level while holding the waiter lock; `set`
                    // flips it under the same lock.
                    if self.signal.set.load(Ordering::Acquire) {
                        drop(waiters);
                        self.state = WaitState::Done;
                        return Poll::Ready(Ok(()));
                    }
                    let index = waiters.insert(cx.waker().clone());
                    self.entry = Some(index);
                }

                // Registered after the waiter entry: if the token fired in
                // between, registration wakes us immediately and the next
                // poll observes the cancellation.
                self.cancel_reg = self.cancel.map(|token| token.register(cx.waker()));
                self.state = WaitState::Waiting;
                Poll::Pending
            }
            WaitState::Waiting => {
                let index = self.entry.expect("waiting without an entry");
                {
                    let mut waiters = self.signal.waiters.lock();
                    if waiters.entries[index].notified {
                        waiters.remove(index);
                        drop(waiters);
                        self.entry = None;
                        self.cancel_reg = None;
                        self.state = WaitState::Done;
                        return Poll::Ready(Ok(()));
                    }

                    if self.cancel.is_some_and(CancelToken::is_cancelled) {
                        waiters.remove(index);
                        drop(waiters);
                        self.entry = None;
                        self.cancel_reg = None;
                        self.state = WaitState::Cancelled;
                        return Poll::Ready(Err(SignalError::Cancelled));
                    }

                    // Update the stored waker if the executor changed it.
                    match &mut waiters.entries[index].waker {
                        Some(existing) if existing.will_wake(cx.waker()) => {}
                        Some(existing) => existing.clone_from(cx.waker()),
                        slot @ None => *slot = Some(cx.waker().clone()),
                    }
                }
                if let Some(reg) = &self.cancel_reg {
                    reg.refresh(cx.waker());
                }
                Poll::Pending
            }
            WaitState::Done => Poll::Ready(Ok(())),
            WaitState::Cancelled => Poll::Ready(Err(SignalError::Cancelled)),
        }
    }
}

impl Drop for Signaled<'_> {
    fn drop(&mut self) {
        if self.state == WaitState::Waiting {
            if let Some(index) = self.entry.take() {
                self.signal.waiters.lock().remove(index);
            }
        }
    }
}
