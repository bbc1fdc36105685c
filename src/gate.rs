//! Single-admission async gate.
//!
//! [`OneShotGate`] admits exactly one caller as the holder: the first task to
//! [`enter`](OneShotGate::enter) an empty gate resolves immediately to
//! [`Admission::Holder`], and every later caller parks until the holder calls
//! [`release`](OneShotGate::release), at which point they all resolve to
//! [`Admission::Released`]. [`reset`](OneShotGate::reset) clears the gate,
//! cancelling parked waiters and re-arming it for a new holder.
//!
//! The intended use is double-checked async initialization: the holder
//! performs the expensive work and releases; everyone else is told the work
//! has already been done.
//!
//! # Cancel Safety
//!
//! Dropping a parked [`Enter`] future cleanly removes its waiter entry.

use parking_lot::Mutex;
use smallvec::SmallVec;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};

/// How a caller was admitted through the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// First caller: the gate is yours, do the work and call `release`.
    Holder,
    /// The holder already released: use the result it produced.
    Released,
}

/// Error returned when the gate is reset while a caller is parked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateError {
    /// The gate was reset before the holder released it.
    Cancelled,
}

impl std::fmt::Display for GateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancelled => write!(f, "gate entry cancelled by reset"),
        }
    }
}

impl std::error::Error for GateError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    /// No holder yet; the next `enter` wins.
    Empty,
    /// A holder is doing the work; later callers park.
    Held,
    /// The holder released; later callers pass straight through.
    Released,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Waiting,
    Proceed,
    Cancelled,
}

#[derive(Debug)]
struct GateEntry {
    waker: Waker,
    verdict: Verdict,
}

#[derive(Debug)]
struct GateState {
    slot: Slot,
    entries: Vec<Option<GateEntry>>,
    free_slots: SmallVec<[usize; 4]>,
}

impl GateState {
    #[inline]
    fn insert(&mut self, waker: Waker) -> usize {
        let entry = GateEntry {
            waker,
            verdict: Verdict::Waiting,
        };
        if let Some(index) = self.free_slots.pop() {
            self.entries[index] = Some(entry);
            index
        } else {
            let index = self.entries.len();
            self.entries.push(Some(entry));
            index
        }
    }

    #[inline]
    fn remove(&mut self, index: usize) {
        if index < self.entries.len() {
            self.entries[index] = None;
            self.free_slots.push(index);
        }
        while self.entries.last().is_some_and(Option::is_none) {
            let tail = self.entries.len() - 1;
            self.entries.pop();
            if let Some(pos) = self.free_slots.iter().position(|&i| i == tail) {
                self.free_slots.swap_remove(pos);
            }
        }
    }

    /// Settles every parked waiter with `verdict` and returns their wakers.
    #[inline]
    fn settle_all(&mut self, verdict: Verdict) -> SmallVec<[Waker; 4]> {
        self.entries
            .iter_mut()
            .flatten()
            .filter(|entry| entry.verdict == Verdict::Waiting)
            .map(|entry| {
                entry.verdict = verdict;
                entry.waker.clone()
            })
            .collect()
    }
}

/// A first-caller-wins gate for one-time async work.
///
/// # Example
///
/// ```ignore
/// let gate = OneShotGate::new();
///
/// match gate.enter().await? {
///     Admission::Holder => {
///         expensive_init().await;
///         gate.release();
///     }
///     Admission::Released => { /* result already available */ }
/// }
/// ```
#[derive(Debug)]
pub struct OneShotGate {
    state: Mutex<GateState>,
}

impl OneShotGate {
    /// Creates a new, empty gate.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                slot: Slot::Empty,
                entries: Vec::new(),
                free_slots: SmallVec::new(),
            }),
        }
    }

    /// Returns true once [`release`](Self::release) has been called.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.state.lock().slot == Slot::Released
    }

    /// Requests admission through the gate.
    ///
    /// The first caller on an empty gate resolves to [`Admission::Holder`]
    /// without waiting; everyone else parks until the holder releases.
    pub fn enter(&self) -> Enter<'_> {
        Enter {
            gate: self,
            entry: None,
            done: false,
        }
    }

    /// Marks the gate released, unblocking all parked callers.
    ///
    /// Calling this with no holder still marks the gate released: late
    /// callers are told the work has already been done.
    pub fn release(&self) {
        let wakers = {
            let mut state = self.state.lock();
            state.slot = Slot::Released;
            state.settle_all(Verdict::Proceed)
        };
        tracing::trace!(waiters = wakers.len(), "gate released");
        for waker in wakers {
            waker.wake();
        }
    }

    /// Clears the gate, cancelling parked waiters and re-arming it.
    ///
    /// The next `enter` after a reset becomes the new holder.
    pub fn reset(&self) {
        let wakers = {
            let mut state = self.state.lock();
            state.slot = Slot::Empty;
            state.settle_all(Verdict::Cancelled)
        };
        tracing::trace!(waiters = wakers.len(), "gate reset");
        for waker in wakers {
            waker.wake();
        }
    }

    /// Number of callers currently parked on the gate.
    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.state
            .lock()
            .entries
            .iter()
            .flatten()
            .filter(|e| e.verdict == Verdict::Waiting)
            .count()
    }
}

impl Default for OneShotGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Future returned by [`OneShotGate::enter`].
#[derive(Debug)]
pub struct Enter<'a> {
    gate: &'a OneShotGate,
    entry: Option<usize>,
    done: bool,
}

impl Future for Enter<'_> {
    type Output = Result<Admission, GateError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        assert!(!self.done, "Enter polled after completion");

        let mut state = self.gate.state.lock();

        if let Some(index) = self.entry {
            let verdict = state.entries[index]
                .as_ref()
                .expect("parked entry missing")
                .verdict;
            match verdict {
                Verdict::Proceed => {
                    state.remove(index);
                    drop(state);
                    self.entry = None;
                    self.done = true;
                    Poll::Ready(Ok(Admission::Released))
                }
                Verdict::Cancelled => {
                    state.remove(index);
                    drop(state);
                    self.entry = None;
                    self.done = true;
                    Poll::Ready(Err(GateError::Cancelled))
                }
                Verdict::Waiting => {
                    let entry = state.entries[index]
                        .as_mut()
                        .expect("parked entry missing");
                    if !entry.waker.will_wake(cx.waker()) {
                        entry.waker.clone_from(cx.waker());
                    }
                    Poll::Pending
                }
            }
        } else {
            match state.slot {
                Slot::Empty => {
                    state.slot = Slot::Held;
                    drop(state);
                    self.done = true;
                    Poll::Ready(Ok(Admission::Holder))
                }
                Slot::Released => {
                    drop(state);
                    self.done = true;
                    Poll::Ready(Ok(Admission::Released))
                }
                Slot::Held => {
                    let index = state.insert(cx.waker().clone());
                    drop(state);
                    self.entry = Some(index);
                    Poll::Pending
                }
            }
        }
    }
}

impl Drop for Enter<'_> {
    fn drop(&mut self) {
        if let Some(index) = self.entry.take() {
            self.gate.state.lock().remove(index);
        }
    }
}
