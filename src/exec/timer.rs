//! Global timer service.
//!
//! One dedicated thread owns a deadline heap. Arming a timer pushes an entry
//! and unparks the thread; the thread parks until the earliest deadline, then
//! hands the firing to the timer's execution context.
//!
//! ## Cancellation guarantee
//!
//! [`TimerHandle::cancel`] (and drop) guarantees that no handler invocation
//! starts afterwards. Firing and cancelling synchronize on the per-timer
//! state: a firing marks itself running under the state mutex before invoking
//! the handler, and `cancel` waits on a condvar until no firing is running —
//! except when cancelled from inside the handler itself, which must not
//! self-deadlock.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_utils::sync::{Parker, Unparker};
use parking_lot::{Condvar, Mutex};

use super::Exec;

/// Cancellation handle for an armed timer.
///
/// Dropping the handle cancels the timer.
#[must_use = "dropping a TimerHandle cancels the timer"]
pub struct TimerHandle {
    inner: HandleInner,
}

pub(crate) enum HandleInner {
    Service(Arc<TimerGate>),
    /// Debug-context timers are sequenced by the coordinator; cancellation is
    /// a flag the coordinator checks before running the task.
    Flag(Arc<std::sync::atomic::AtomicBool>),
}

impl TimerHandle {
    pub(crate) fn service(gate: Arc<TimerGate>) -> Self {
        Self {
            inner: HandleInner::Service(gate),
        }
    }

    pub(crate) fn flag(flag: Arc<std::sync::atomic::AtomicBool>) -> Self {
        Self {
            inner: HandleInner::Flag(flag),
        }
    }

    /// Cancels the timer. Idempotent.
    ///
    /// On return, no handler invocation can start, and none is in flight on
    /// another thread.
    pub fn cancel(&self) {
        match &self.inner {
            HandleInner::Service(gate) => gate.cancel(),
            HandleInner::Flag(flag) => flag.store(true, std::sync::atomic::Ordering::SeqCst),
        }
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Per-timer synchronization between firings and cancellation.
pub(crate) struct TimerGate {
    state: Mutex<GateState>,
    idle: Condvar,
}

struct GateState {
    cancelled: bool,
    /// Thread currently inside the handler, if any.
    running: Option<ThreadId>,
}

impl TimerGate {
    fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                cancelled: false,
                running: None,
            }),
            idle: Condvar::new(),
        }
    }

    fn cancel(&self) {
        let mut st = self.state.lock();
        if st.cancelled && st.running.is_none() {
            return;
        }
        st.cancelled = true;
        let me = thread::current().id();
        while let Some(tid) = st.running {
            if tid == me {
                // Self-cancel from inside the handler; the firing will finish
                // on its own.
                break;
            }
            self.idle.wait(&mut st);
        }
        tracing::trace!(target: "segnale::exec", "timer cancelled");
    }

    /// Runs one firing if the timer is still live. Returns false once
    /// cancelled, so periodic timers stop re-arming.
    fn fire(&self, f: &Mutex<Box<dyn FnMut() + Send>>) -> bool {
        {
            let mut st = self.state.lock();
            if st.cancelled {
                return false;
            }
            st.running = Some(thread::current().id());
        }
        {
            let mut handler = f.lock();
            (*handler)();
        }
        let mut st = self.state.lock();
        st.running = None;
        self.idle.notify_all();
        !st.cancelled
    }
}

struct Entry {
    due: Instant,
    seq: u64,
    period: Option<Duration>,
    gate: Arc<TimerGate>,
    context: Exec,
    handler: Arc<Mutex<Box<dyn FnMut() + Send>>>,
}

// Min-heap on (due, seq): BinaryHeap is a max-heap, so the comparison is
// reversed.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (other.due, other.seq).cmp(&(self.due, self.seq))
    }
}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}
impl Eq for Entry {}

struct TimerService {
    heap: Mutex<BinaryHeap<Entry>>,
    seq: std::sync::atomic::AtomicU64,
    unparker: Unparker,
}

fn service() -> &'static TimerService {
    static SERVICE: OnceLock<TimerService> = OnceLock::new();
    SERVICE.get_or_init(|| {
        let parker = Parker::new();
        let unparker = parker.unparker().clone();
        thread::Builder::new()
            .name("segnale-timer".to_string())
            .spawn(move || run_service(parker))
            .unwrap_or_else(|e| panic!("segnale: failed to spawn timer thread: {e}"));
        TimerService {
            heap: Mutex::new(BinaryHeap::new()),
            seq: std::sync::atomic::AtomicU64::new(0),
            unparker,
        }
    })
}

fn run_service(parker: Parker) {
    loop {
        let mut due_now = Vec::new();
        let next = {
            let mut heap = service().heap.lock();
            let now = Instant::now();
            while let Some(head) = heap.peek() {
                if head.due > now {
                    break;
                }
                // Unwrap is fine: peek just succeeded under the same lock.
                due_now.push(heap.pop().unwrap());
            }
            heap.peek().map(|e| e.due)
        };

        for entry in due_now {
            dispatch(entry);
        }

        match next {
            Some(due) => {
                let now = Instant::now();
                if due > now {
                    parker.park_timeout(due - now);
                }
            }
            None => parker.park(),
        }
    }
}

/// Hands one due entry to its context, re-arming periodic timers.
fn dispatch(entry: Entry) {
    let Entry {
        due,
        seq: _,
        period,
        gate,
        context,
        handler,
    } = entry;
    let fire_gate = gate.clone();
    let fire_handler = handler.clone();
    let fire_context = context.clone();
    context.invoke_async(move || {
        let live = fire_gate.fire(&fire_handler);
        if live {
            if let Some(p) = period {
                arm(due + p, Some(p), fire_gate, fire_context, fire_handler);
            }
        }
    });
}

fn arm(
    due: Instant,
    period: Option<Duration>,
    gate: Arc<TimerGate>,
    context: Exec,
    handler: Arc<Mutex<Box<dyn FnMut() + Send>>>,
) {
    let svc = service();
    let seq = svc.seq.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    let mut heap = svc.heap.lock();
    let earliest = heap.peek().map(|e| e.due > due).unwrap_or(true);
    heap.push(Entry {
        due,
        seq,
        period,
        gate,
        context,
        handler,
    });
    drop(heap);
    if earliest {
        svc.unparker.unpark();
    }
}

/// Arms a timer on the global service. Used by [`Exec::single_timer`] and
/// [`Exec::periodic_timer`] for every non-debug context.
pub(crate) fn schedule(
    after: Duration,
    period: Option<Duration>,
    context: Exec,
    handler: Box<dyn FnMut() + Send>,
) -> TimerHandle {
    let gate = Arc::new(TimerGate::new());
    tracing::trace!(target: "segnale::exec", ?after, periodic = period.is_some(), "timer armed");
    arm(
        Instant::now() + after,
        period,
        gate.clone(),
        context,
        Arc::new(Mutex::new(handler)),
    );
    TimerHandle::service(gate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A single timer fires once, roughly on time
    #[test]
    fn test_single_fires() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let t = schedule(
            Duration::from_millis(10),
            None,
            Exec::direct(),
            Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );
        thread::sleep(Duration::from_millis(200));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        drop(t);
    }

    /// Cancel before the deadline means the handler never runs
    #[test]
    fn test_cancel_before_fire() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let t = schedule(
            Duration::from_millis(50),
            None,
            Exec::direct(),
            Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );
        t.cancel();
        thread::sleep(Duration::from_millis(150));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    /// Dropping the handle cancels too
    #[test]
    fn test_drop_cancels() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let t = schedule(
            Duration::from_millis(50),
            None,
            Exec::direct(),
            Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );
        drop(t);
        thread::sleep(Duration::from_millis(150));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    /// A periodic timer keeps firing until cancelled, then stops for good
    #[test]
    fn test_periodic_stops_on_cancel() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let t = schedule(
            Duration::from_millis(5),
            Some(Duration::from_millis(5)),
            Exec::direct(),
            Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );
        while hits.load(Ordering::SeqCst) < 3 {
            thread::sleep(Duration::from_millis(1));
        }
        t.cancel();
        let snapshot = hits.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(100));
        // At most the firing that was already in flight when cancel returned.
        assert!(hits.load(Ordering::SeqCst) <= snapshot);
    }
}
