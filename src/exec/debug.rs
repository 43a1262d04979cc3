//! Deterministic execution for tests.
//!
//! A [`DebugContext`] replaces real threads and real time with a coordinator:
//! every async post and every timer becomes a task keyed by
//! `(virtual due time, admission sequence)`, and [`DebugContext::run`]
//! executes tasks in exactly that order, advancing the virtual clock as it
//! goes. Two runs of the same program over a debug context interleave
//! identically.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::timer::TimerHandle;

/// Shared coordinator for one simulated timeline.
#[derive(Clone)]
pub struct DebugContext {
    inner: Arc<Mutex<DebugState>>,
}

struct DebugState {
    /// Real instant the timeline is anchored to; virtual timestamps are
    /// offsets from it.
    base: Instant,
    now: Duration,
    seq: u64,
    tasks: BTreeMap<(Duration, u64), DebugTask>,
}

struct DebugTask {
    run: DebugRun,
    /// Set by the owning [`TimerHandle`]; checked immediately before running.
    cancelled: Option<Arc<AtomicBool>>,
}

enum DebugRun {
    Once(Box<dyn FnOnce() + Send>),
    Periodic {
        f: Arc<Mutex<Box<dyn FnMut() + Send>>>,
        period: Duration,
    },
}

impl Default for DebugContext {
    fn default() -> Self {
        Self::new()
    }
}

impl DebugContext {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(DebugState {
                base: Instant::now(),
                now: Duration::ZERO,
                seq: 0,
                tasks: BTreeMap::new(),
            })),
        }
    }

    /// Stable identity shared by every clone of this coordinator.
    pub(crate) fn id(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    /// The virtual clock, as an instant on the timeline's anchor.
    ///
    /// Advances only when [`run`](Self::run) executes a task.
    pub fn timestamp(&self) -> Instant {
        let st = self.inner.lock();
        st.base + st.now
    }

    /// Virtual time elapsed since the timeline started.
    pub fn elapsed(&self) -> Duration {
        self.inner.lock().now
    }

    /// Number of tasks waiting on the timeline.
    pub fn pending(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    /// Runs tasks in timeline order until none remain.
    ///
    /// Tasks scheduled by running tasks join the same timeline, so a chain of
    /// posts drains fully. A periodic timer left uncancelled would keep the
    /// timeline nonempty forever; use [`run_until`](Self::run_until) with
    /// those.
    pub fn run(&self) {
        while self.step(None) {}
    }

    /// Runs tasks in timeline order until the virtual clock passes `until`,
    /// then sets the clock to `until`.
    pub fn run_until(&self, until: Duration) {
        while self.step(Some(until)) {}
        let mut st = self.inner.lock();
        if st.now < until {
            st.now = until;
        }
    }

    /// Pops and runs the earliest task, if any is due. Returns false when the
    /// timeline is drained (or nothing is due before the horizon).
    fn step(&self, horizon: Option<Duration>) -> bool {
        let task = {
            let mut st = self.inner.lock();
            let Some((&key, _)) = st.tasks.iter().next() else {
                return false;
            };
            if let Some(h) = horizon
                && key.0 > h
            {
                return false;
            }
            st.now = key.0;
            // Unwrap is fine: the key was just observed under the same lock.
            Some((key, st.tasks.remove(&key).unwrap()))
        };
        let Some(((due, _), task)) = task else {
            return false;
        };
        if let Some(flag) = &task.cancelled
            && flag.load(Ordering::SeqCst)
        {
            return true;
        }
        match task.run {
            DebugRun::Once(f) => f(),
            DebugRun::Periodic { f, period } => {
                {
                    let mut h = f.lock();
                    (*h)();
                }
                // Re-arm unless the handler cancelled its own timer.
                let live = task
                    .cancelled
                    .as_ref()
                    .map(|c| !c.load(Ordering::SeqCst))
                    .unwrap_or(true);
                if live {
                    self.schedule_at(
                        due + period,
                        DebugTask {
                            run: DebugRun::Periodic { f, period },
                            cancelled: task.cancelled,
                        },
                    );
                }
            }
        }
        true
    }

    fn schedule_at(&self, due: Duration, task: DebugTask) {
        let mut st = self.inner.lock();
        let seq = st.seq;
        st.seq += 1;
        st.tasks.insert((due, seq), task);
    }

    /// Posts `f` at the current virtual time.
    pub(crate) fn post(&self, f: Box<dyn FnOnce() + Send>) {
        let now = self.inner.lock().now;
        self.schedule_at(
            now,
            DebugTask {
                run: DebugRun::Once(f),
                cancelled: None,
            },
        );
    }

    pub(crate) fn timer(
        &self,
        after: Duration,
        period: Option<Duration>,
        handler: Box<dyn FnMut() + Send>,
    ) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let now = self.inner.lock().now;
        let run = match period {
            Some(p) => DebugRun::Periodic {
                f: Arc::new(Mutex::new(handler)),
                period: p,
            },
            None => {
                let f = Arc::new(Mutex::new(handler));
                DebugRun::Once(Box::new(move || {
                    let mut h = f.lock();
                    (*h)();
                }))
            }
        };
        self.schedule_at(
            now + after,
            DebugTask {
                run,
                cancelled: Some(cancelled.clone()),
            },
        );
        TimerHandle::flag(cancelled)
    }
}
