//! Admission queue for reader/writer requests.
//!
//! The queue is a doubly linked list of requests realized as a slot arena:
//! nodes live in a `Vec` of generation-counted slots and link to each other
//! by [`NodeId`] (index + generation), so there is no pointer aliasing and a
//! stale handle can never reach a recycled node. Links are private to this
//! module; the façade manipulates the queue through its methods only, and
//! all of it runs under the façade's single per-lock mutex.
//!
//! # Ordering invariants
//!
//! - `head` is the earliest live request, `tail` the latest.
//! - Writers form one contiguous run ending at `w_tail`; a new writer
//!   splices in directly behind `w_tail`, ahead of readers that arrived
//!   after the last writer. `w_tail` is `None` exactly when no writer is
//!   queued, which answers "is this new reader blocked" in O(1).
//! - Members of one exclusive-reader group chain directly behind their
//!   group's most recent member, so a group always occupies one contiguous
//!   span and inherits the queue position of its earliest member.

use smallvec::SmallVec;
use std::collections::HashMap;
use std::fmt;
use std::task::Waker;

use crate::cancel::CancelRegistration;

/// Identifier of an exclusive-reader group.
pub(crate) type GroupId = u64;

/// Handle to a queued request with a generation counter for ABA safety.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct NodeId {
    index: u32,
    generation: u32,
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({}:{})", self.index, self.generation)
    }
}

/// What a queued request is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    Reader,
    Writer,
    ExclusiveReader(GroupId),
}

impl Kind {
    #[inline]
    pub(crate) fn is_writer(self) -> bool {
        matches!(self, Self::Writer)
    }

    #[inline]
    fn group(self) -> Option<GroupId> {
        match self {
            Self::ExclusiveReader(group) => Some(group),
            _ => None,
        }
    }
}

/// Completion slot of a request; leaves `Pending` exactly once.
///
/// A cancelled request has no terminal completion state — cancellation
/// removes the node from the queue outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Completion {
    Pending,
    Granted,
}

/// One queued request: a reader, writer, or exclusive-group reader.
#[derive(Debug)]
struct LockNode {
    kind: Kind,
    /// Live uses of this node; ≥1 while queued, each reentrant acquisition
    /// adds one. The node leaves the queue only when this reaches zero.
    reentrancy: u32,
    completion: Completion,
    /// Waker of the pending acquisition future, if it has been polled.
    waker: Option<Waker>,
    /// Registration on the caller's cancel token; dropped on settle.
    cancel_reg: Option<CancelRegistration>,
    prev: Option<NodeId>,
    next: Option<NodeId>,
}

#[derive(Debug)]
enum Slot {
    Occupied { node: LockNode, generation: u32 },
    Vacant { next_free: Option<u32>, generation: u32 },
}

/// The wait queue of one reader/writer lock instance.
#[derive(Debug, Default)]
pub(crate) struct WaitQueue {
    slots: Vec<Slot>,
    free_head: Option<u32>,
    head: Option<NodeId>,
    tail: Option<NodeId>,
    /// Tail of the contiguous writer run, `None` when no writer is queued.
    w_tail: Option<NodeId>,
    /// Most recently enqueued live member of each exclusive-reader group.
    group_tails: HashMap<GroupId, NodeId>,
    len: usize,
}

/// Requests that become grantable as a consequence of one removal.
pub(crate) type Grantable = SmallVec<[NodeId; 4]>;

impl WaitQueue {
    /// Number of live requests (granted and pending).
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True when any writer is queued, i.e. a new reader must wait.
    #[inline]
    pub(crate) fn has_writer(&self) -> bool {
        self.w_tail.is_some()
    }

    /// Appends a reader request.
    ///
    /// The reader is immediately grantable unless a writer is queued
    /// anywhere ahead of it (`w_tail` non-empty).
    pub(crate) fn add_reader(&mut self) -> (NodeId, bool) {
        let id = self.insert_node(Kind::Reader);
        self.link_at_tail(id);
        let granted = self.w_tail.is_none();
        tracing::trace!(node = ?id, granted, "reader enqueued");
        (id, granted)
    }

    /// Appends a writer request, extending the writer run.
    ///
    /// When readers trail the current run the writer splices in directly
    /// behind `w_tail`, cutting ahead of every not-yet-granted reader that
    /// arrived after the last writer. Returns true when the writer landed
    /// at the head of an empty queue and is immediately grantable.
    pub(crate) fn add_writer(&mut self) -> (NodeId, bool) {
        let id = self.insert_node(Kind::Writer);
        match self.w_tail {
            Some(run_end) if self.tail != Some(run_end) => {
                let after = self
                    .entry(run_end)
                    .next
                    .expect("writer run tail has trailing readers but no successor");
                self.entry_mut(id).prev = Some(run_end);
                self.entry_mut(id).next = Some(after);
                self.entry_mut(run_end).next = Some(id);
                self.entry_mut(after).prev = Some(id);
            }
            _ => self.link_at_tail(id),
        }
        self.w_tail = Some(id);
        let granted = self.head == Some(id);
        tracing::trace!(node = ?id, granted, "writer enqueued");
        (id, granted)
    }

    /// Appends an exclusive-group reader request.
    ///
    /// A group member chains directly behind the group's previous
    /// outstanding member (keeping the group's queue position) and is
    /// grantable only when no writer is queued and no earlier member of the
    /// same group is still outstanding.
    pub(crate) fn add_exclusive_reader(&mut self, group: GroupId) -> (NodeId, bool) {
        let id = self.insert_node(Kind::ExclusiveReader(group));
        let prior = self.group_tails.get(&group).copied();
        match prior {
            Some(prior) => {
                let after = self.entry(prior).next;
                self.entry_mut(id).prev = Some(prior);
                self.entry_mut(id).next = after;
                self.entry_mut(prior).next = Some(id);
                match after {
                    Some(after) => self.entry_mut(after).prev = Some(id),
                    None => self.tail = Some(id),
                }
            }
            None => self.link_at_tail(id),
        }
        self.group_tails.insert(group, id);
        let granted = self.w_tail.is_none() && prior.is_none();
        tracing::trace!(node = ?id, group, granted, "exclusive reader enqueued");
        (id, granted)
    }

    /// Marks a request granted and returns the waker to notify.
    ///
    /// Idempotent: granting an already granted node is a no-op, which is
    /// what makes duplicate cascade grants harmless. Settling the node
    /// drops its cancellation registration.
    pub(crate) fn grant(&mut self, id: NodeId) -> Option<Waker> {
        let node = self.get_mut(id)?;
        if node.completion != Completion::Pending {
            return None;
        }
        node.completion = Completion::Granted;
        node.cancel_reg = None;
        tracing::trace!(node = ?id, writer = node.kind.is_writer(), "request granted");
        node.waker.take()
    }

    /// Current completion of a live request.
    #[inline]
    pub(crate) fn completion(&self, id: NodeId) -> Option<Completion> {
        self.get(id).map(|node| node.completion)
    }

    /// Whether a live request is a writer.
    #[inline]
    pub(crate) fn is_writer(&self, id: NodeId) -> Option<bool> {
        self.get(id).map(|node| node.kind.is_writer())
    }

    /// Stores or refreshes the waker of a pending request.
    pub(crate) fn update_waker(&mut self, id: NodeId, waker: &Waker) {
        if let Some(node) = self.get_mut(id) {
            match &mut node.waker {
                Some(existing) if existing.will_wake(waker) => {}
                Some(existing) => existing.clone_from(waker),
                slot @ None => *slot = Some(waker.clone()),
            }
        }
    }

    /// Attaches the cancellation registration of a pending request.
    pub(crate) fn attach_cancel(&mut self, id: NodeId, registration: CancelRegistration) {
        if let Some(node) = self.get_mut(id) {
            node.cancel_reg = Some(registration);
        }
    }

    /// Refreshes the waker held by the node's cancellation registration.
    pub(crate) fn refresh_cancel(&self, id: NodeId, waker: &Waker) {
        if let Some(registration) = self.get(id).and_then(|node| node.cancel_reg.as_ref()) {
            registration.refresh(waker);
        }
    }

    /// Adds one reentrant use to a live writer node.
    ///
    /// Reader nodes never accept reentry: a reader asked to serve a nested
    /// request — including the unsupported reader→writer upgrade — queues a
    /// fresh request instead.
    pub(crate) fn try_reenter(&mut self, id: NodeId) -> bool {
        match self.get_mut(id) {
            Some(node) if node.kind.is_writer() && node.reentrancy > 0 => {
                node.reentrancy += 1;
                tracing::trace!(node = ?id, count = node.reentrancy, "reentrant acquisition");
                true
            }
            _ => false,
        }
    }

    /// Releases one use of a request.
    ///
    /// Returns `None` while other reentrant uses keep the node queued (or
    /// when the handle is stale, making double release a no-op). When the
    /// last use releases, the node is removed and the requests that became
    /// grantable are returned for the caller to grant.
    pub(crate) fn release_claim(&mut self, id: NodeId) -> Option<Grantable> {
        let node = self.get_mut(id)?;
        node.reentrancy -= 1;
        if node.reentrancy > 0 {
            return None;
        }
        Some(self.remove(id))
    }

    /// Detaches a node and computes the cascade of newly grantable requests.
    fn remove(&mut self, id: NodeId) -> Grantable {
        let node = self.take_slot(id);
        let (kind, prev, next) = (node.kind, node.prev, node.next);
        tracing::trace!(node = ?id, kind = ?kind, "request removed");

        match prev {
            Some(prev) => self.entry_mut(prev).next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.entry_mut(next).prev = prev,
            None => self.tail = prev,
        }

        // The writer run shrinks only when its tail departs.
        if self.w_tail == Some(id) {
            self.w_tail = match prev {
                Some(p) if self.entry(p).kind.is_writer() => Some(p),
                _ => None,
            };
        }

        // The group tail rolls back to the previous member of the same
        // group, or the group disappears with its last member.
        if let Some(group) = kind.group() {
            if self.group_tails.get(&group) == Some(&id) {
                let mut cursor = prev;
                let mut previous_member = None;
                while let Some(at) = cursor {
                    if self.entry(at).kind.group() == Some(group) {
                        previous_member = Some(at);
                        break;
                    }
                    cursor = self.entry(at).prev;
                }
                match previous_member {
                    Some(member) => {
                        self.group_tails.insert(group, member);
                    }
                    None => {
                        self.group_tails.remove(&group);
                    }
                }
            }
        }

        let was_head = prev.is_none();
        let mut grantable = Grantable::new();

        // A writer reaching the head is granted alone: writers are never
        // granted concurrently with anything.
        if was_head {
            if let Some(head) = self.head {
                if self.entry(head).kind.is_writer() {
                    grantable.push(head);
                    return grantable;
                }
            }
        }

        // With no writer left in the queue, the readers after the removed
        // node all become grantable — except that a chain of same-group
        // members collapses to its first member; later members follow one
        // at a time as their predecessors depart.
        if self.w_tail.is_none() {
            if let Some(start) = next {
                // Seed the collapse from the node now adjacent to the run:
                // removing a middle group member fuses its neighbours, and a
                // successor whose earlier member is still queued stays put.
                let mut previous_group: Option<GroupId> =
                    prev.and_then(|p| self.entry(p).kind.group());
                let mut cursor = Some(start);
                while let Some(at) = cursor {
                    let group = self.entry(at).kind.group();
                    if group.is_none() || group != previous_group {
                        grantable.push(at);
                    }
                    previous_group = group;
                    cursor = self.entry(at).next;
                }
                return grantable;
            }
        }

        // A departing group member may unblock the group's next member,
        // unless a writer still stands between the head and the group.
        if let Some(group) = kind.group() {
            if let Some(&group_tail) = self.group_tails.get(&group) {
                let mut cursor = self.head;
                while let Some(at) = cursor {
                    let entry = self.entry(at);
                    if entry.kind.is_writer() {
                        break;
                    }
                    if entry.kind.group() == Some(group) {
                        grantable.push(at);
                        break;
                    }
                    if at == group_tail {
                        break;
                    }
                    cursor = entry.next;
                }
            }
        }

        grantable
    }

    // ── slot arena ─────────────────────────────────────────────────────

    fn insert_node(&mut self, kind: Kind) -> NodeId {
        let node = LockNode {
            kind,
            reentrancy: 1,
            completion: Completion::Pending,
            waker: None,
            cancel_reg: None,
            prev: None,
            next: None,
        };
        self.len += 1;
        if let Some(free) = self.free_head {
            let slot = &mut self.slots[free as usize];
            match slot {
                Slot::Vacant {
                    next_free,
                    generation,
                } => {
                    let generation = *generation;
                    self.free_head = *next_free;
                    *slot = Slot::Occupied { node, generation };
                    NodeId {
                        index: free,
                        generation,
                    }
                }
                Slot::Occupied { .. } => unreachable!("free list points at an occupied slot"),
            }
        } else {
            let index = u32::try_from(self.slots.len()).expect("wait queue overflow");
            self.slots.push(Slot::Occupied {
                node,
                generation: 0,
            });
            NodeId {
                index,
                generation: 0,
            }
        }
    }

    fn take_slot(&mut self, id: NodeId) -> LockNode {
        let slot = &mut self.slots[id.index as usize];
        match slot {
            Slot::Occupied { generation, .. } if *generation == id.generation => {
                let next_generation = generation.wrapping_add(1);
                let old = std::mem::replace(
                    slot,
                    Slot::Vacant {
                        next_free: self.free_head,
                        generation: next_generation,
                    },
                );
                self.free_head = Some(id.index);
                self.len -= 1;
                match old {
                    Slot::Occupied { node, .. } => node,
                    Slot::Vacant { .. } => unreachable!(),
                }
            }
            _ => unreachable!("removing a request that is not queued"),
        }
    }

    fn get(&self, id: NodeId) -> Option<&LockNode> {
        match self.slots.get(id.index as usize)? {
            Slot::Occupied { node, generation } if *generation == id.generation => Some(node),
            _ => None,
        }
    }

    fn get_mut(&mut self, id: NodeId) -> Option<&mut LockNode> {
        match self.slots.get_mut(id.index as usize)? {
            Slot::Occupied { node, generation } if *generation == id.generation => Some(node),
            _ => None,
        }
    }

    /// Follows a link that the queue invariants guarantee to be live.
    #[inline]
    fn entry(&self, id: NodeId) -> &LockNode {
        self.get(id).expect("queue link to a vacant slot")
    }

    #[inline]
    fn entry_mut(&mut self, id: NodeId) -> &mut LockNode {
        self.get_mut(id).expect("queue link to a vacant slot")
    }

    fn link_at_tail(&mut self, id: NodeId) {
        match self.tail {
            Some(tail) => {
                self.entry_mut(tail).next = Some(id);
                self.entry_mut(id).prev = Some(tail);
            }
            None => self.head = Some(id),
        }
        self.tail = Some(id);
    }

    /// Queue order from head to tail (test introspection).
    #[cfg(test)]
    fn order(&self) -> Vec<NodeId> {
        let mut out = Vec::with_capacity(self.len);
        let mut cursor = self.head;
        while let Some(at) = cursor {
            out.push(at);
            cursor = self.entry(at).next;
        }
        out
    }
}
