//! Node state machine and delivery pump.
//!
//! Every stage of a signal graph is a [`Core<T>`]: the mutex-protected state
//! machine that accepts sends of `T`, serializes them, and hands them to the
//! stage's successor *outside* the mutex on the successor's execution
//! context.
//!
//! ## The pump
//!
//! A send that finds the node idle becomes the pump: it marks the node busy,
//! snapshots the successor slot, releases the mutex, runs the sink, then
//! re-acquires and drains whatever queued up meanwhile — one item at a time,
//! re-snapshotting whenever the successor changed mid-drain. A send that
//! finds the node busy (or held for activation replay) just enqueues and
//! returns: the item is guaranteed to be drained by the pump that is already
//! running. This is what makes reentrant sends from inside a handler legal
//! and FIFO.
//!
//! When the successor's context cannot run in the caller's frame, the pump
//! parks the item back on the queue and posts a single pump run to that
//! context instead; the node is never blocked on foreign work.
//!
//! ## Tokens
//!
//! Every write endpoint (input, forwarding sink, fan-out edge) carries the
//! activation count it was minted under. The node compares it under the
//! mutex on every send; a mismatch means the graph was rewired since, and
//! the stale writer is turned away with [`SendError::Disconnected`].

use std::collections::VecDeque;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_utils::CachePadded;
use parking_lot::{Mutex, MutexGuard};

use crate::defer::DeferredWork;
use crate::exec::Exec;

use super::error::{AttachError, SendError};
use super::input::Input;
use super::result::{End, SignalResult};

static NODE_IDS: CachePadded<AtomicU64> = CachePadded::new(AtomicU64::new(1));
static EDGE_IDS: CachePadded<AtomicU64> = CachePadded::new(AtomicU64::new(1));

pub(crate) fn next_node_id() -> u64 {
    NODE_IDS.fetch_add(1, Ordering::Relaxed)
}

pub(crate) fn next_edge_id() -> u64 {
    EDGE_IDS.fetch_add(1, Ordering::Relaxed)
}

/// Serializes every topology change that could close a cycle: two binds that
/// each look acyclic in isolation must not interleave.
pub(crate) fn bind_lock() -> &'static Mutex<()> {
    static LOCK: Mutex<()> = Mutex::new(());
    &LOCK
}

/// Whether an item is part of the activation prefix replayed to a newly
/// attached successor, or ordinary in-flight delivery.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum DeliveryPhase {
    Activation,
    Normal,
}

/// Policy for whether an end on one edge closes the adjacent node.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ClosePropagation {
    /// Ends never cross this edge; the edge is simply detached.
    None,
    /// Only application errors ([`End::Other`]) cross. `Complete` and
    /// `Cancelled` are lifecycle ends, not errors, and do not propagate.
    Errors,
    /// Every end crosses.
    All,
}

impl ClosePropagation {
    pub(crate) fn allows(&self, end: &End) -> bool {
        match self {
            ClosePropagation::None => false,
            ClosePropagation::Errors => end.is_error(),
            ClosePropagation::All => true,
        }
    }
}

/// Type-erased successor entry: receives one result plus its phase.
pub(crate) type DynSink<T> = Box<dyn FnMut(SignalResult<T>, DeliveryPhase) + Send>;

/// Erased handle to a predecessor stage, held strongly by its successor.
///
/// Ownership runs downstream→upstream through these; the reverse direction
/// (predecessor's sink into us) holds only weak references and tokens.
pub(crate) trait Upstream: Send + Sync {
    /// Downstream gained its first active subscriber: run values this way.
    fn activate(&self);
    /// Downstream lost its last subscriber without closing.
    fn deactivate(&self);
    /// Downstream closed with `end` and the edge policy lets it cross.
    fn propagate_end(&self, end: End);
    /// Downstream is gone; remove the edge without closing the source.
    fn detach(&self);
    /// Loop detection: is `id` this source or any of its ancestors?
    fn reaches(&self, id: u64) -> bool;
    /// Node id of the immediate source.
    fn source_id(&self) -> u64;
    /// Edge id our sink occupies in the source.
    fn source_edge(&self) -> u64;
}

/// The concrete upstream handle: a strong ref to the source plus the edge id
/// our sink occupies in it.
pub(crate) struct EdgeLink<S: Send + 'static> {
    pub(crate) source: Arc<Core<S>>,
    pub(crate) edge: u64,
}

impl<S: Send + 'static> Upstream for EdgeLink<S> {
    fn activate(&self) {
        self.source.activate_edge(self.edge);
    }
    fn deactivate(&self) {
        self.source.deactivate_edge(self.edge);
    }
    fn propagate_end(&self, end: End) {
        self.source.close_with(end);
    }
    fn detach(&self) {
        self.source.detach_edge(self.edge);
    }
    fn reaches(&self, id: u64) -> bool {
        self.source.reaches(id)
    }
    fn source_id(&self) -> u64 {
        self.source.id
    }
    fn source_edge(&self) -> u64 {
        self.edge
    }
}

/// One predecessor edge as seen from the successor.
pub(crate) struct Link {
    pub(crate) upstream: Arc<dyn Upstream>,
    pub(crate) propagation: ClosePropagation,
    /// Merged inputs drop this edge when the node deactivates.
    pub(crate) remove_on_deactivate: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Inactive,
    Active,
    Closed,
}

enum SinkState<T: Send + 'static> {
    Installed(DynSink<T>),
    /// Taken by a pump that is currently running it outside the mutex.
    Running,
    /// Removed while a pump was running it; the pump discards on re-entry.
    Detached,
}

struct SingleSlot<T: Send + 'static> {
    edge: u64,
    context: Exec,
    sink: SinkState<T>,
    active: bool,
}

/// Weak, token-carrying write end used for fan-out and forwarding.
pub(crate) struct ChildSend<T: Send + 'static> {
    pub(crate) core: Weak<Core<T>>,
    pub(crate) token: usize,
}

impl<T: Send + 'static> Clone for ChildSend<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            token: self.token,
        }
    }
}

impl<T: Send + 'static> ChildSend<T> {
    pub(crate) fn send(&self, item: SignalResult<T>, phase: DeliveryPhase) -> Option<SendError> {
        match self.core.upgrade() {
            Some(core) => core.send_phased(item, self.token, phase),
            None => Some(SendError::Disconnected),
        }
    }
}

struct ChildEdge<T: Send + 'static> {
    edge: u64,
    target: ChildSend<T>,
    active: bool,
    /// Second attach to an exclusive node: delivers a duplicate end on
    /// activation instead of the cache.
    poisoned: bool,
}

struct MultiSlot<T: Send + 'static> {
    children: Vec<ChildEdge<T>>,
    /// Duplicates one result for fan-out; created where `T: Clone` is known.
    dup: Box<dyn Fn(&SignalResult<T>) -> SignalResult<T> + Send>,
    /// Context the fan-out (and the cache-update rule) runs on.
    context: Exec,
    /// Keeps this node (and its upstream) running with zero children.
    always_active: bool,
    /// At most one child, ever (cache-until-active).
    exclusive: bool,
    attached_any: bool,
}

enum Delivery<T: Send + 'static> {
    Unattached,
    Single(SingleSlot<T>),
    Multi(MultiSlot<T>),
}

/// Activation-cache machinery, present only on caching variants.
pub(crate) struct CacheMode<T: Send + 'static> {
    /// Folds one incoming result into (values, preclosed-end).
    pub(crate) update: Box<dyn FnMut(&mut Vec<T>, &mut Option<End>, &SignalResult<T>) + Send>,
    /// Clones one cached value for replay; created where `T: Clone` is known.
    pub(crate) dup: Box<dyn Fn(&T) -> T + Send>,
    pub(crate) values: Vec<T>,
    pub(crate) end: Option<End>,
    /// Cache-until-active: emptied and disabled when the first child
    /// activates.
    pub(crate) until_active: bool,
    pub(crate) disabled: bool,
}

struct Generator<T: Send + 'static> {
    context: Exec,
    f: Arc<Mutex<Box<dyn FnMut(Option<Input<T>>) + Send>>>,
}

struct State<T: Send + 'static> {
    phase: Phase,
    terminal: Option<End>,
    activation_count: usize,
    preceding: Vec<Link>,
    delivery: Delivery<T>,
    cache: Option<CacheMode<T>>,
    queue: VecDeque<(SignalResult<T>, DeliveryPhase)>,
    /// A pump currently owns delivery.
    busy: bool,
    /// Activation replays in progress; the pump stays parked while nonzero.
    holds: usize,
    /// A pump run has been posted to an async context and not yet started.
    dispatch_pending: bool,
    generator: Option<Generator<T>>,
}

/// One stage of a signal graph, emitting `T` to its successor(s).
pub(crate) struct Core<T: Send + 'static> {
    pub(crate) id: u64,
    state: Mutex<State<T>>,
}

impl<T: Send + 'static> Core<T> {
    fn new(delivery: Delivery<T>, cache: Option<CacheMode<T>>) -> Arc<Self> {
        Arc::new(Self {
            id: next_node_id(),
            state: Mutex::new(State {
                phase: Phase::Inactive,
                terminal: None,
                activation_count: 1,
                preceding: Vec::new(),
                delivery,
                cache,
                queue: VecDeque::new(),
                busy: false,
                holds: 0,
                dispatch_pending: false,
                generator: None,
            }),
        })
    }

    /// A plain single-subscriber stage.
    pub(crate) fn plain() -> Arc<Self> {
        Self::new(Delivery::Unattached, None)
    }

    /// A fan-out stage; `dup` erases the `T: Clone` the variants require.
    pub(crate) fn multi(
        dup: Box<dyn Fn(&SignalResult<T>) -> SignalResult<T> + Send>,
        context: Exec,
        cache: Option<CacheMode<T>>,
        always_active: bool,
        exclusive: bool,
    ) -> Arc<Self> {
        Self::new(
            Delivery::Multi(MultiSlot {
                children: Vec::new(),
                dup,
                context,
                always_active,
                exclusive,
                attached_any: false,
            }),
            cache,
        )
    }

    pub(crate) fn install_generator(
        self: &Arc<Self>,
        context: Exec,
        f: Box<dyn FnMut(Option<Input<T>>) + Send>,
    ) {
        let mut st = self.state.lock();
        st.generator = Some(Generator {
            context,
            f: Arc::new(Mutex::new(f)),
        });
    }

    /// The token a fresh write end against this node should carry.
    pub(crate) fn current_token(&self) -> usize {
        self.state.lock().activation_count
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    pub(crate) fn send(self: &Arc<Self>, item: SignalResult<T>, token: usize) -> Option<SendError> {
        self.send_phased(item, token, DeliveryPhase::Normal)
    }

    pub(crate) fn send_phased(
        self: &Arc<Self>,
        item: SignalResult<T>,
        token: usize,
        phase: DeliveryPhase,
    ) -> Option<SendError> {
        let mut deferred = DeferredWork::new();
        let rejected = {
            let mut st = self.state.lock();
            if st.phase == Phase::Closed {
                drop(st);
                deferred.release(item);
                deferred.run();
                return Some(SendError::Disconnected);
            }
            if token != st.activation_count {
                drop(st);
                deferred.release(item);
                deferred.run();
                return Some(SendError::Disconnected);
            }
            if st.phase == Phase::Inactive {
                // Caching variants observe values while nobody listens.
                let cached = match &mut st.cache {
                    Some(cache) if !cache.disabled => {
                        (cache.update)(&mut cache.values, &mut cache.end, &item);
                        true
                    }
                    _ => false,
                };
                drop(st);
                deferred.release(item);
                deferred.run();
                return if cached { None } else { Some(SendError::Inactive) };
            }
            st.queue.push_back((item, phase));
            if !st.busy && st.holds == 0 {
                self.pump(st, &mut deferred, None);
            }
            None
        };
        deferred.run();
        rejected
    }

    /// Terminates this node from the downstream side: the end is delivered
    /// through the node's own pump (so it serializes behind in-flight items),
    /// then the node closes and routes the end upstream per edge policy.
    pub(crate) fn close_with(self: &Arc<Self>, end: End) {
        let mut deferred = DeferredWork::new();
        {
            let mut st = self.state.lock();
            if st.phase == Phase::Closed {
                return;
            }
            if st.phase == Phase::Inactive {
                // Nothing to deliver to; close in place.
                self.close_locked(&mut st, end, &mut deferred);
            } else {
                st.queue.push_back((Err(end), DeliveryPhase::Normal));
                if !st.busy && st.holds == 0 {
                    self.pump(st, &mut deferred, None);
                }
            }
        }
        deferred.run();
    }

    // ------------------------------------------------------------------
    // The pump
    // ------------------------------------------------------------------

    /// Drains the queue, running the successor outside the mutex. Consumes
    /// the guard; returns with the mutex released.
    ///
    /// `current_queue` is the identity of the context a dispatched run is
    /// executing on, so the pump recognizes it has arrived where it was
    /// posted (pool and debug contexts have no thread identity to test).
    fn pump<'a>(
        self: &'a Arc<Self>,
        mut st: MutexGuard<'a, State<T>>,
        deferred: &mut DeferredWork,
        current_queue: Option<usize>,
    ) {
        st.busy = true;
        loop {
            if st.phase != Phase::Active {
                break;
            }
            let Some((item, phase)) = st.queue.pop_front() else {
                break;
            };
            if let Some(cache) = &mut st.cache
                && !cache.disabled
            {
                (cache.update)(&mut cache.values, &mut cache.end, &item);
            }
            let end = item.as_ref().err().cloned();
            match &mut st.delivery {
                Delivery::Unattached => {
                    deferred.release(item);
                }
                Delivery::Single(slot) => {
                    let edge = slot.edge;
                    let context = slot.context.clone();
                    if context.can_run_sync() || current_queue == Some(context.queue_id()) {
                        let mut sink = match mem::replace(&mut slot.sink, SinkState::Running) {
                            SinkState::Installed(sink) => sink,
                            SinkState::Detached => {
                                // The successor left; free the slot for a
                                // future attach.
                                let old = mem::replace(&mut st.delivery, Delivery::Unattached);
                                deferred.release(old);
                                deferred.release(item);
                                continue;
                            }
                            SinkState::Running => {
                                // Excluded by `busy`; restore and move on.
                                slot.sink = SinkState::Running;
                                deferred.release(item);
                                continue;
                            }
                        };
                        drop(st);
                        context.run_sync_now(|| sink(item, phase));
                        st = self.state.lock();
                        let restored = match &mut st.delivery {
                            Delivery::Single(slot)
                                if slot.edge == edge
                                    && matches!(slot.sink, SinkState::Running) =>
                            {
                                slot.sink = SinkState::Installed(sink);
                                true
                            }
                            // Successor changed while the sink ran: the item
                            // context is stale, drop the old sink outside the
                            // mutex and re-snapshot on the next iteration.
                            _ => {
                                deferred.release(sink);
                                false
                            }
                        };
                        let left = matches!(
                            &st.delivery,
                            Delivery::Single(slot)
                                if slot.edge == edge && matches!(slot.sink, SinkState::Detached)
                        );
                        if !restored && left {
                            // The successor detached mid-run; free the slot.
                            let old = mem::replace(&mut st.delivery, Delivery::Unattached);
                            deferred.release(old);
                        }
                    } else {
                        st.queue.push_front((item, phase));
                        if !st.dispatch_pending {
                            st.dispatch_pending = true;
                            let this = Arc::clone(self);
                            let queue = context.queue_id();
                            deferred.push(move || {
                                context.invoke_async(move || this.run_dispatched(queue))
                            });
                        }
                        break;
                    }
                }
                Delivery::Multi(multi) => {
                    let context = multi.context.clone();
                    if !(context.can_run_sync() || current_queue == Some(context.queue_id())) {
                        st.queue.push_front((item, phase));
                        if !st.dispatch_pending {
                            st.dispatch_pending = true;
                            let this = Arc::clone(self);
                            let queue = context.queue_id();
                            deferred.push(move || {
                                context.invoke_async(move || this.run_dispatched(queue))
                            });
                        }
                        break;
                    }
                    let targets: Vec<ChildSend<T>> = multi
                        .children
                        .iter()
                        .filter(|c| c.active && !c.poisoned)
                        .map(|c| c.target.clone())
                        .collect();
                    let mut copies = Vec::with_capacity(targets.len());
                    if !targets.is_empty() {
                        for _ in 1..targets.len() {
                            copies.push((multi.dup)(&item));
                        }
                        copies.push(item);
                    } else {
                        deferred.release(item);
                    }
                    drop(st);
                    context.run_sync_now(|| {
                        for (target, copy) in targets.iter().zip(copies) {
                            let _ = target.send(copy, phase);
                        }
                    });
                    st = self.state.lock();
                }
            }
            if let Some(end) = end {
                self.close_locked(&mut st, end, deferred);
                break;
            }
        }
        st.busy = false;
    }

    /// Pump run posted to an async successor context; `queue` identifies the
    /// context it was posted to.
    fn run_dispatched(self: Arc<Self>, queue: usize) {
        let mut deferred = DeferredWork::new();
        {
            let mut st = self.state.lock();
            st.dispatch_pending = false;
            if !st.busy && st.holds == 0 && st.phase == Phase::Active && !st.queue.is_empty() {
                self.pump(st, &mut deferred, Some(queue));
            }
        }
        deferred.run();
    }

    /// Kicks the pump if items queued up while a hold or dispatch was
    /// outstanding. Consumes the guard.
    fn resume_locked<'a>(
        self: &'a Arc<Self>,
        st: MutexGuard<'a, State<T>>,
        deferred: &mut DeferredWork,
    ) {
        if !st.busy && st.holds == 0 && st.phase == Phase::Active && !st.queue.is_empty() {
            self.pump(st, deferred, None);
        }
    }

    // ------------------------------------------------------------------
    // Close
    // ------------------------------------------------------------------

    fn close_locked(&self, st: &mut State<T>, end: End, deferred: &mut DeferredWork) {
        if st.phase == Phase::Closed {
            return;
        }
        st.phase = Phase::Closed;
        st.terminal = Some(end.clone());
        tracing::trace!(target: "segnale::signal", id = self.id, %end, "signal closed");
        // Items past the failure are discarded, and discarded outside the
        // mutex: their Drop impls are user code.
        for (item, _) in st.queue.drain(..) {
            deferred.release(item);
        }
        // Single sinks hold user closures: release them now. Fan-out child
        // lists are kept so a late subscriber can still collect the cache
        // and the terminal.
        if !matches!(st.delivery, Delivery::Multi(_)) {
            let delivery = mem::replace(&mut st.delivery, Delivery::Unattached);
            deferred.release(delivery);
        }
        for link in st.preceding.drain(..) {
            let up = link.upstream;
            if link.propagation.allows(&end) {
                let end = end.clone();
                deferred.push(move || up.propagate_end(end));
            } else {
                deferred.push(move || up.detach());
            }
        }
        if let Some(generator) = st.generator.take() {
            let context = generator.context;
            let f = generator.f;
            deferred.push(move || {
                context.invoke(move || {
                    let mut generate = f.lock();
                    (*generate)(None);
                })
            });
        }
    }

    // ------------------------------------------------------------------
    // Attach / detach
    // ------------------------------------------------------------------

    /// Installs the single successor. `activate_now` is set by terminal
    /// attachments (outputs, captures); intermediate stages stay dormant
    /// until a terminal arrives downstream.
    pub(crate) fn attach_single(
        self: &Arc<Self>,
        context: Exec,
        mut sink: DynSink<T>,
        activate_now: bool,
    ) -> Result<u64, AttachError> {
        let mut deferred = DeferredWork::new();
        let edge = {
            let mut st = self.state.lock();
            if st.phase == Phase::Closed {
                // The stream is over; the newcomer gets exactly the terminal.
                let end = st.terminal.clone().unwrap_or(End::Complete);
                drop(st);
                sink(Err(end), DeliveryPhase::Activation);
                deferred.release(sink);
                deferred.run();
                return Ok(next_edge_id());
            }
            if !matches!(st.delivery, Delivery::Unattached) {
                drop(st);
                deferred.release(sink);
                deferred.run();
                return Err(AttachError::Duplicate);
            }
            let edge = next_edge_id();
            st.delivery = Delivery::Single(SingleSlot {
                edge,
                context,
                sink: SinkState::Installed(sink),
                active: activate_now,
            });
            if activate_now {
                self.activate_locked(&mut st, &mut deferred);
            }
            edge
        };
        deferred.run();
        Ok(edge)
    }

    /// Registers a fan-out child and hands back its write end. The child
    /// receives the activation cache when it activates, not here.
    pub(crate) fn attach_child(
        self: &Arc<Self>,
        target: ChildSend<T>,
    ) -> Result<u64, AttachError> {
        let mut st = self.state.lock();
        let Delivery::Multi(multi) = &mut st.delivery else {
            return Err(AttachError::Duplicate);
        };
        let poisoned = multi.exclusive && multi.attached_any;
        debug_assert!(
            !poisoned,
            "cache-until-active signal attached a second subscriber"
        );
        multi.attached_any = true;
        let edge = next_edge_id();
        multi.children.push(ChildEdge {
            edge,
            target,
            active: false,
            poisoned,
        });
        Ok(edge)
    }

    /// Removes a successor edge entirely (the downstream stage is gone).
    pub(crate) fn detach_edge(self: &Arc<Self>, edge: u64) {
        let mut deferred = DeferredWork::new();
        {
            let mut st = self.state.lock();
            match &mut st.delivery {
                Delivery::Single(slot) if slot.edge == edge => {
                    slot.active = false;
                    if matches!(slot.sink, SinkState::Running) {
                        // A pump holds the sink; let it discard on re-entry.
                        slot.sink = SinkState::Detached;
                    } else {
                        let old = mem::replace(&mut st.delivery, Delivery::Unattached);
                        deferred.release(old);
                    }
                    self.deactivate_locked(&mut st, &mut deferred);
                }
                Delivery::Multi(multi) => {
                    if let Some(i) = multi.children.iter().position(|c| c.edge == edge) {
                        let child = multi.children.swap_remove(i);
                        deferred.release(child.target);
                        let any_active = multi.children.iter().any(|c| c.active);
                        let always = multi.always_active;
                        if !any_active && !always {
                            self.deactivate_locked(&mut st, &mut deferred);
                        }
                    }
                }
                _ => {}
            }
        }
        deferred.run();
    }

    // ------------------------------------------------------------------
    // Activation
    // ------------------------------------------------------------------

    /// A successor edge asks for values. Marks the edge active, replays the
    /// activation cache to fan-out children, and activates this node (and
    /// transitively its predecessors) if it was dormant.
    pub(crate) fn activate_edge(self: &Arc<Self>, edge: u64) {
        let mut deferred = DeferredWork::new();
        {
            let mut st = self.state.lock();
            let phase = st.phase;
            match &mut st.delivery {
                Delivery::Single(slot) if slot.edge == edge => {
                    if phase == Phase::Closed {
                        // The stream ended before this edge woke: hand it the
                        // terminal and free the slot.
                        let end = st.terminal.clone().unwrap_or(End::Complete);
                        let old = mem::replace(&mut st.delivery, Delivery::Unattached);
                        drop(st);
                        if let Delivery::Single(slot) = old
                            && let SinkState::Installed(mut sink) = slot.sink
                        {
                            sink(Err(end), DeliveryPhase::Activation);
                            deferred.release(sink);
                        }
                    } else {
                        slot.active = true;
                        self.activate_locked(&mut st, &mut deferred);
                    }
                }
                Delivery::Multi(multi) => {
                    let Some(i) = multi.children.iter().position(|c| c.edge == edge) else {
                        return;
                    };
                    if multi.children[i].active {
                        return;
                    }
                    multi.children[i].active = true;
                    let target = multi.children[i].target.clone();
                    let poisoned = multi.children[i].poisoned;
                    let replay = self.snapshot_cache_locked(&mut st);
                    // A closed node owes the late edge its terminal even when
                    // the cache did not record one (multicast has no cache).
                    let replayed_end = replay.as_ref().is_some_and(|(_, e)| e.is_some());
                    let closed_end = if st.phase == Phase::Closed && !replayed_end {
                        Some(st.terminal.clone().unwrap_or(End::Complete))
                    } else {
                        None
                    };
                    st.holds += 1;
                    self.activate_locked(&mut st, &mut deferred);
                    drop(st);
                    // Upstream activation first: anything it produces queues
                    // behind the hold, so the new child still sees its replay
                    // strictly before normal-phase items.
                    deferred.run();
                    if poisoned {
                        let _ = target.send(
                            Err(End::other(AttachError::Duplicate)),
                            DeliveryPhase::Activation,
                        );
                    } else {
                        if let Some((values, end)) = replay {
                            for v in values {
                                let _ = target.send(Ok(v), DeliveryPhase::Activation);
                            }
                            if let Some(end) = end {
                                let _ = target.send(Err(end), DeliveryPhase::Activation);
                            }
                        }
                        if let Some(end) = closed_end {
                            let _ = target.send(Err(end), DeliveryPhase::Activation);
                        }
                    }
                    let mut st = self.state.lock();
                    st.holds -= 1;
                    self.resume_locked(st, &mut deferred);
                }
                _ => {}
            }
        }
        deferred.run();
    }

    /// A successor edge no longer needs values (but is not gone).
    pub(crate) fn deactivate_edge(self: &Arc<Self>, edge: u64) {
        let mut deferred = DeferredWork::new();
        {
            let mut st = self.state.lock();
            match &mut st.delivery {
                Delivery::Single(slot) if slot.edge == edge => {
                    slot.active = false;
                    self.deactivate_locked(&mut st, &mut deferred);
                }
                Delivery::Multi(multi) => {
                    if let Some(child) = multi.children.iter_mut().find(|c| c.edge == edge) {
                        child.active = false;
                    }
                    let any_active = multi.children.iter().any(|c| c.active);
                    if !any_active && !multi.always_active {
                        self.deactivate_locked(&mut st, &mut deferred);
                    }
                }
                _ => {}
            }
        }
        deferred.run();
    }

    /// Forces this node active regardless of successors. Used by the
    /// always-active caching variants at construction.
    pub(crate) fn force_activate(self: &Arc<Self>) {
        let mut deferred = DeferredWork::new();
        {
            let mut st = self.state.lock();
            self.activate_locked(&mut st, &mut deferred);
        }
        deferred.run();
    }

    fn activate_locked(self: &Arc<Self>, st: &mut State<T>, deferred: &mut DeferredWork) {
        if st.phase != Phase::Inactive {
            return;
        }
        st.phase = Phase::Active;
        tracing::trace!(target: "segnale::signal", id = self.id, "signal activated");
        let generator = st.generator.as_ref().map(|g| (g.context.clone(), g.f.clone()));
        if let Some((context, f)) = generator {
            // Each activation cycle mints a fresh token, so an input handed
            // to a previous cycle's generator can no longer write.
            st.activation_count += 1;
            let input = Input::new(Arc::downgrade(self), st.activation_count);
            deferred.push(move || {
                context.invoke(move || {
                    let mut generate = f.lock();
                    (*generate)(Some(input));
                })
            });
        }
        for link in &st.preceding {
            let up = link.upstream.clone();
            deferred.push(move || up.activate());
        }
    }

    fn deactivate_locked(self: &Arc<Self>, st: &mut State<T>, deferred: &mut DeferredWork) {
        if st.phase != Phase::Active {
            return;
        }
        let still_active = match &st.delivery {
            Delivery::Unattached => false,
            Delivery::Single(slot) => slot.active,
            Delivery::Multi(multi) => {
                multi.always_active || multi.children.iter().any(|c| c.active)
            }
        };
        if still_active {
            return;
        }
        st.phase = Phase::Inactive;
        tracing::trace!(target: "segnale::signal", id = self.id, "signal deactivated");
        let generator = st.generator.as_ref().map(|g| (g.context.clone(), g.f.clone()));
        if let Some((context, f)) = generator {
            // Invalidate the input handed to the current generator cycle.
            st.activation_count += 1;
            deferred.push(move || {
                context.invoke(move || {
                    let mut generate = f.lock();
                    (*generate)(None);
                })
            });
        }
        let mut kept = Vec::with_capacity(st.preceding.len());
        for link in st.preceding.drain(..) {
            let up = link.upstream.clone();
            if link.remove_on_deactivate {
                deferred.push(move || up.detach());
                deferred.release(link);
            } else {
                deferred.push(move || up.deactivate());
                kept.push(link);
            }
        }
        st.preceding = kept;
    }

    fn snapshot_cache_locked(&self, st: &mut State<T>) -> Option<(Vec<T>, Option<End>)> {
        let cache = st.cache.as_mut()?;
        if cache.disabled {
            return None;
        }
        if cache.until_active {
            // First activation empties and disables the cache: the values
            // move out rather than being cloned.
            cache.disabled = true;
            let values = mem::take(&mut cache.values);
            return Some((values, cache.end.take()));
        }
        let values = cache.values.iter().map(|v| (cache.dup)(v)).collect();
        Some((values, cache.end.clone()))
    }

    // ------------------------------------------------------------------
    // Predecessor management (junction bind / merged add)
    // ------------------------------------------------------------------

    /// Installs a predecessor edge, minting a new activation count. Fails if
    /// the node already has a predecessor (unless `additional`, the merged
    /// case) or the caller's token is stale.
    pub(crate) fn bind_preceding(
        self: &Arc<Self>,
        link: Link,
        expected_token: Option<usize>,
        additional: bool,
    ) -> Result<BindOutcome, SendError> {
        let mut st = self.state.lock();
        if st.phase == Phase::Closed {
            return Err(SendError::Disconnected);
        }
        if let Some(token) = expected_token
            && token != st.activation_count
        {
            return Err(SendError::Disconnected);
        }
        if !additional && !st.preceding.is_empty() {
            return Err(SendError::Duplicate);
        }
        if !additional {
            st.activation_count += 1;
        }
        st.preceding.push(link);
        Ok(BindOutcome {
            token: st.activation_count,
            active: st.phase == Phase::Active,
        })
    }

    /// Severs the predecessor edge `edge`, minting a new activation count,
    /// and reports whether the node was running (so the caller can
    /// deactivate the freed source).
    pub(crate) fn unbind_preceding(self: &Arc<Self>, edge: u64) -> Option<UnbindOutcome> {
        let mut st = self.state.lock();
        if st.phase == Phase::Closed {
            return None;
        }
        let i = st
            .preceding
            .iter()
            .position(|l| l.upstream.source_edge() == edge)?;
        let link = st.preceding.remove(i);
        st.activation_count += 1;
        Some(UnbindOutcome {
            token: st.activation_count,
            link,
        })
    }

    /// Drops one merged-source edge without minting: the remaining sources'
    /// tokens stay valid.
    pub(crate) fn remove_preceding_by_source(self: &Arc<Self>, source_id: u64) -> Option<Link> {
        let mut st = self.state.lock();
        let i = st
            .preceding
            .iter()
            .position(|l| l.upstream.source_id() == source_id)?;
        Some(st.preceding.remove(i))
    }

    /// Appends a predecessor link to a freshly built stage (transform,
    /// variant bridge). The stage is unobservable yet, so no minting.
    pub(crate) fn set_preceding(self: &Arc<Self>, link: Link) {
        let mut st = self.state.lock();
        st.preceding.push(link);
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Loop detection walk: does `id` appear at or above this node?
    pub(crate) fn reaches(self: &Arc<Self>, id: u64) -> bool {
        if self.id == id {
            return true;
        }
        let ups: Vec<Arc<dyn Upstream>> = {
            let st = self.state.lock();
            st.preceding.iter().map(|l| l.upstream.clone()).collect()
        };
        ups.iter().any(|up| up.reaches(id))
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().phase == Phase::Closed
    }

    /// The terminal of a closed node, `None` while the node is live.
    pub(crate) fn closed_end(&self) -> Option<End> {
        let st = self.state.lock();
        if st.phase == Phase::Closed {
            Some(st.terminal.clone().unwrap_or(End::Complete))
        } else {
            None
        }
    }
}

/// Result of [`Core::bind_preceding`].
pub(crate) struct BindOutcome {
    /// Token freshly minted for the new edge's writers.
    pub(crate) token: usize,
    /// The node was active, so the caller must activate the source edge.
    pub(crate) active: bool,
}

/// Result of [`Core::unbind_preceding`].
pub(crate) struct UnbindOutcome {
    /// Token freshly minted for the node's next writer.
    pub(crate) token: usize,
    /// The severed link; the caller deactivates/detaches its source outside
    /// the node mutex.
    pub(crate) link: Link,
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;

    fn recording_sink<T: Send + 'static>(
        into: &Arc<StdMutex<Vec<SignalResult<T>>>>,
    ) -> DynSink<T> {
        let into = into.clone();
        Box::new(move |result, _| into.lock().unwrap().push(result))
    }

    /// A send carrying a stale token is turned away without delivery
    #[test]
    fn test_token_mismatch_rejected() {
        let core = Core::<i32>::plain();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        core.attach_single(Exec::direct(), recording_sink(&seen), true)
            .unwrap();
        let token = core.current_token();
        assert_eq!(core.send(Ok(1), token), None);
        assert_eq!(core.send(Ok(2), token + 1), Some(SendError::Disconnected));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    /// The single-subscriber slot is exclusive
    #[test]
    fn test_attach_duplicate() {
        let core = Core::<i32>::plain();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        core.attach_single(Exec::direct(), recording_sink(&seen), true)
            .unwrap();
        let err = core
            .attach_single(Exec::direct(), recording_sink(&seen), true)
            .expect_err("second attach must fail");
        assert_eq!(err, AttachError::Duplicate);
    }

    /// Attaching to a closed stage delivers exactly its terminal
    #[test]
    fn test_attach_after_close() {
        let core = Core::<i32>::plain();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        core.attach_single(Exec::direct(), recording_sink(&seen), true)
            .unwrap();
        let token = core.current_token();
        assert_eq!(core.send(Err(End::Complete), token), None);
        let late = Arc::new(StdMutex::new(Vec::new()));
        core.attach_single(Exec::direct(), recording_sink(&late), true)
            .unwrap();
        let observed = late.lock().unwrap();
        assert_eq!(observed.len(), 1);
        assert!(matches!(observed[0], Err(End::Complete)));
    }

    /// Items queued past a failure are discarded, not delivered
    #[test]
    fn test_queue_discarded_after_failure() {
        let core = Core::<i32>::plain();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let reentry: Arc<StdMutex<Option<(Arc<Core<i32>>, usize)>>> =
            Arc::new(StdMutex::new(None));
        let reentry_in_sink = reentry.clone();
        let into = seen.clone();
        let sink: DynSink<i32> = Box::new(move |result, _| {
            into.lock().unwrap().push(result);
            // Queue an end plus a value behind it from inside the handler.
            if let Some((core, token)) = reentry_in_sink.lock().unwrap().take() {
                let _ = core.send(Err(End::Complete), token);
                let _ = core.send(Ok(99), token);
            }
        });
        core.attach_single(Exec::direct(), sink, true).unwrap();
        let token = core.current_token();
        *reentry.lock().unwrap() = Some((core.clone(), token));
        assert_eq!(core.send(Ok(1), token), None);
        let observed = seen.lock().unwrap();
        assert_eq!(observed.len(), 2);
        assert!(matches!(observed[0], Ok(1)));
        assert!(matches!(observed[1], Err(End::Complete)));
    }
}
