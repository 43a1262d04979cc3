//! Execution contexts
//!
//! Every handler in a signal graph runs on an [`Exec`]: an injected,
//! cloneable handle that abstracts over *where* and *with what reentrancy* a
//! closure runs. The graph core never owns threads; it only asks a context to
//! run things.
//!
//! | Context | `invoke` runs | Reentrant |
//! |---------|---------------|-----------|
//! | [`direct`](Exec::direct) | caller's stack frame | yes |
//! | [`mutex`](Exec::mutex) | caller's frame, under a recursive lock | from owning thread |
//! | [`serial`](Exec::serial) | dedicated worker thread, FIFO | no |
//! | [`concurrent`](Exec::concurrent) | shared pool, parallel | no |
//! | [`thread`](Exec::thread) | inline iff `test()`, else private FIFO | caller-defined |
//! | [`conditionally_async`](Exec::conditionally_async) | frozen at construction | as chosen |
//! | [`debug`](Exec::debug) | coordinator timeline, deterministic | no |
//!
//! ## Contracts
//!
//! - [`invoke`](Exec::invoke) must never be called while a signal node's
//!   mutex is held; the graph core routes such calls through its
//!   deferred-work queue.
//! - [`invoke_sync`](Exec::invoke_sync) runs inline when the caller is
//!   already on the context's thread, so a handler can call back into its
//!   own context without deadlocking.
//! - Timer handles guarantee that after [`cancel`](timer::TimerHandle::cancel)
//!   (or drop) returns, no handler invocation starts.
//!
//! ## Example
//!
//! ```
//! use segnale::exec::Exec;
//!
//! let serial = Exec::serial();
//! let doubled = serial.invoke_sync(|| 21 * 2);
//! assert_eq!(doubled, 42);
//! ```

mod debug;
mod queue;
mod timer;

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_utils::sync::Parker;
use parking_lot::{Mutex, ReentrantMutex};

pub use debug::DebugContext;
pub use timer::TimerHandle;

use queue::{ConcurrentPool, SerialQueue, global_pool};

/// The semantics tag of an [`Exec`], as seen by the graph core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecKind {
    Direct,
    Mutex,
    Serial,
    Concurrent,
    Thread,
    Debug,
}

/// A cloneable execution-context handle.
///
/// Clones share the underlying queue/lock/timeline, so a context handed to
/// several nodes serializes (or parallelizes) them together.
#[derive(Clone)]
pub struct Exec {
    inner: Inner,
}

#[derive(Clone)]
enum Inner {
    Direct,
    Mutex(Arc<ReentrantMutex<()>>),
    Serial(SerialQueue),
    Concurrent(&'static ConcurrentPool),
    Thread {
        test: Arc<dyn Fn() -> bool + Send + Sync>,
        queue: SerialQueue,
    },
    Debug(DebugContext),
}

impl Exec {
    /// Runs in the caller's stack frame. Reentrant.
    pub fn direct() -> Self {
        Self {
            inner: Inner::Direct,
        }
    }

    /// Serializes through a recursive lock: callers from different threads
    /// exclude each other, the owning thread may re-enter freely.
    pub fn mutex() -> Self {
        Self {
            inner: Inner::Mutex(Arc::new(ReentrantMutex::new(()))),
        }
    }

    /// A FIFO drained by its own worker thread. Non-reentrant: `invoke` from
    /// off-thread always posts.
    pub fn serial() -> Self {
        Self {
            inner: Inner::Serial(SerialQueue::new("segnale-serial")),
        }
    }

    /// The shared parallel pool.
    pub fn concurrent() -> Self {
        Self {
            inner: Inner::Concurrent(global_pool()),
        }
    }

    /// Runs inline iff `test()` reports the caller is on the designated
    /// thread; otherwise posts to a private FIFO.
    pub fn thread<F: Fn() -> bool + Send + Sync + 'static>(test: F) -> Self {
        Self {
            inner: Inner::Thread {
                test: Arc::new(test),
                queue: SerialQueue::new("segnale-thread"),
            },
        }
    }

    /// Sync or async, chosen once at construction: `true` behaves like
    /// [`direct`](Self::direct), `false` like [`serial`](Self::serial).
    pub fn conditionally_async(run_sync: bool) -> Self {
        if run_sync { Self::direct() } else { Self::serial() }
    }

    /// Deterministic variant driven by `ctx`'s simulated timeline.
    pub fn debug(ctx: &DebugContext) -> Self {
        Self {
            inner: Inner::Debug(ctx.clone()),
        }
    }

    pub fn kind(&self) -> ExecKind {
        match &self.inner {
            Inner::Direct => ExecKind::Direct,
            Inner::Mutex(_) => ExecKind::Mutex,
            Inner::Serial(_) => ExecKind::Serial,
            Inner::Concurrent(_) => ExecKind::Concurrent,
            Inner::Thread { .. } => ExecKind::Thread,
            Inner::Debug(_) => ExecKind::Debug,
        }
    }

    /// True when `invoke` from the current thread would run in the caller's
    /// stack frame. The delivery pump uses this to choose between inline
    /// handler execution and a dispatched pump run.
    pub(crate) fn can_run_sync(&self) -> bool {
        match &self.inner {
            Inner::Direct | Inner::Mutex(_) => true,
            Inner::Serial(q) => q.is_current(),
            Inner::Concurrent(_) => false,
            Inner::Thread { test, .. } => test(),
            Inner::Debug(_) => false,
        }
    }

    /// Stable identity of the execution queue behind this handle, used by
    /// the delivery pump to recognize that a dispatched run has *arrived*
    /// on its target context (pool and debug queues have no per-thread
    /// identity to test).
    pub(crate) fn queue_id(&self) -> usize {
        match &self.inner {
            // Direct and mutex contexts never dispatch; any constant works.
            Inner::Direct => 0,
            Inner::Mutex(lock) => Arc::as_ptr(lock) as usize,
            Inner::Serial(q) => q.id(),
            Inner::Concurrent(pool) => *pool as *const ConcurrentPool as usize,
            Inner::Thread { queue, .. } => queue.id(),
            Inner::Debug(ctx) => ctx.id(),
        }
    }

    /// Runs `f` in the caller's frame with the context's serialization
    /// applied. Only valid when [`can_run_sync`](Self::can_run_sync) held.
    pub(crate) fn run_sync_now<R>(&self, f: impl FnOnce() -> R) -> R {
        match &self.inner {
            Inner::Mutex(lock) => {
                let _guard = lock.lock();
                f()
            }
            _ => f(),
        }
    }

    /// Runs `f` synchronously when the context permits, otherwise posts it.
    pub fn invoke<F: FnOnce() + Send + 'static>(&self, f: F) {
        if self.can_run_sync() {
            self.run_sync_now(f);
        } else {
            self.post(Box::new(f));
        }
    }

    /// Always escapes the caller's frame where the context has somewhere to
    /// escape to.
    ///
    /// `direct` has no queue, so it runs inline; `mutex` posts to the shared
    /// pool and reacquires its lock there, keeping its serialization while
    /// leaving the caller's frame.
    pub fn invoke_async<F: FnOnce() + Send + 'static>(&self, f: F) {
        match &self.inner {
            Inner::Direct => f(),
            Inner::Mutex(lock) => {
                let lock = lock.clone();
                global_pool().post(Box::new(move || {
                    let _guard = lock.lock();
                    f();
                }));
            }
            Inner::Serial(q) => q.post(Box::new(f)),
            Inner::Concurrent(pool) => pool.post(Box::new(f)),
            Inner::Thread { queue, .. } => queue.post(Box::new(f)),
            Inner::Debug(ctx) => ctx.post(Box::new(f)),
        }
    }

    /// Runs `f` on the context and blocks the caller until it returns.
    ///
    /// Runs inline when the caller is already on the context's thread; a
    /// blocking wait there would never wake.
    pub fn invoke_sync<R, F>(&self, f: F) -> R
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        if self.can_run_sync() {
            return self.run_sync_now(f);
        }
        if let Inner::Debug(_) = &self.inner {
            // The coordinator is single-threaded by design; a blocking wait
            // would stall the timeline, so debug invoke_sync runs inline.
            return f();
        }
        let parker = Parker::new();
        let unparker = parker.unparker().clone();
        let slot: Arc<Mutex<Option<R>>> = Arc::new(Mutex::new(None));
        let out = slot.clone();
        self.post(Box::new(move || {
            *out.lock() = Some(f());
            unparker.unpark();
        }));
        loop {
            if let Some(r) = slot.lock().take() {
                return r;
            }
            parker.park();
        }
    }

    /// Arms a one-shot timer; `f` runs on this context `after` from now.
    pub fn single_timer<F: FnOnce() + Send + 'static>(
        &self,
        after: Duration,
        f: F,
    ) -> TimerHandle {
        match &self.inner {
            Inner::Debug(ctx) => {
                let mut f = Some(f);
                ctx.timer(
                    after,
                    None,
                    Box::new(move || {
                        if let Some(f) = f.take() {
                            f()
                        }
                    }),
                )
            }
            _ => {
                let mut f = Some(f);
                timer::schedule(
                    after,
                    None,
                    self.clone(),
                    Box::new(move || {
                        if let Some(f) = f.take() {
                            f()
                        }
                    }),
                )
            }
        }
    }

    /// Arms a repeating timer; `f` runs on this context every `interval`.
    pub fn periodic_timer<F: FnMut() + Send + 'static>(
        &self,
        interval: Duration,
        f: F,
    ) -> TimerHandle {
        match &self.inner {
            Inner::Debug(ctx) => ctx.timer(interval, Some(interval), Box::new(f)),
            _ => timer::schedule(interval, Some(interval), self.clone(), Box::new(f)),
        }
    }

    /// The context's notion of "now". Real time everywhere except the debug
    /// timeline, whose clock advances only as its coordinator runs tasks.
    pub fn timestamp(&self) -> Instant {
        match &self.inner {
            Inner::Debug(ctx) => ctx.timestamp(),
            _ => Instant::now(),
        }
    }

    fn post(&self, job: Box<dyn FnOnce() + Send>) {
        match &self.inner {
            Inner::Direct => job(),
            Inner::Mutex(lock) => {
                let lock = lock.clone();
                global_pool().post(Box::new(move || {
                    let _guard = lock.lock();
                    job();
                }));
            }
            Inner::Serial(q) => q.post(job),
            Inner::Concurrent(pool) => pool.post(job),
            Inner::Thread { queue, .. } => queue.post(job),
            Inner::Debug(ctx) => ctx.post(job),
        }
    }
}

impl std::fmt::Debug for Exec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Exec").field(&self.kind()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    /// Direct invoke runs before the call returns
    #[test]
    fn test_direct_inline() {
        let hit = AtomicUsize::new(0);
        let hit = Arc::new(hit);
        let h = hit.clone();
        Exec::direct().invoke(move || {
            h.store(1, Ordering::SeqCst);
        });
        assert_eq!(hit.load(Ordering::SeqCst), 1);
    }

    /// invoke_sync round-trips a value off a serial worker
    #[test]
    fn test_serial_invoke_sync() {
        let serial = Exec::serial();
        let answer = serial.invoke_sync(|| 21 * 2);
        assert_eq!(answer, 42);
    }

    /// invoke_sync from the context's own thread runs inline instead of
    /// deadlocking
    #[test]
    fn test_invoke_sync_reentrant_escape() {
        let serial = Exec::serial();
        let inner = serial.clone();
        let nested = serial.invoke_sync(move || inner.invoke_sync(|| 7));
        assert_eq!(nested, 7);
    }

    /// A serial context preserves post order across producer threads
    #[test]
    fn test_serial_orders_across_threads() {
        let serial = Exec::serial();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for t in 0..4 {
            let serial = serial.clone();
            let log = log.clone();
            handles.push(thread::spawn(move || {
                for i in 0..50 {
                    let log = log.clone();
                    serial.invoke(move || log.lock().push((t, i)));
                }
            }));
        }
        for h in handles {
            let _ = h.join();
        }
        let log2 = log.clone();
        serial.invoke_sync(move || {
            let log = log2.lock();
            // Per producer, FIFO.
            for t in 0..4 {
                let seen: Vec<_> = log.iter().filter(|(p, _)| *p == t).map(|(_, i)| *i).collect();
                assert_eq!(seen, (0..50).collect::<Vec<_>>());
            }
        });
    }

    /// The mutex context is reentrant from its owning thread
    #[test]
    fn test_mutex_reentrant() {
        let ctx = Exec::mutex();
        let inner_ctx = ctx.clone();
        let hit = Arc::new(AtomicUsize::new(0));
        let h = hit.clone();
        ctx.invoke(move || {
            inner_ctx.invoke(move || {
                h.store(1, Ordering::SeqCst);
            });
        });
        assert_eq!(hit.load(Ordering::SeqCst), 1);
    }

    /// thread(test) runs inline exactly when the probe says so
    #[test]
    fn test_thread_bound() {
        let designated = thread::current().id();
        let ctx = Exec::thread(move || thread::current().id() == designated);
        assert!(ctx.can_run_sync());
        let off = thread::spawn({
            let ctx = ctx.clone();
            move || ctx.can_run_sync()
        });
        assert!(!off.join().unwrap());
    }

    /// concurrent contexts never claim sync capability
    #[test]
    fn test_concurrent_dispatches() {
        let ctx = Exec::concurrent();
        assert!(!ctx.can_run_sync());
        let answer = ctx.invoke_sync(|| 6 * 7);
        assert_eq!(answer, 42);
    }

    /// Debug timestamps advance only with the coordinator
    #[test]
    fn test_debug_timestamp() {
        let dbg = DebugContext::new();
        let ctx = Exec::debug(&dbg);
        let t0 = ctx.timestamp();
        let _timer = ctx.single_timer(Duration::from_secs(5), || {});
        assert_eq!(ctx.timestamp(), t0);
        dbg.run();
        assert_eq!(ctx.timestamp(), t0 + Duration::from_secs(5));
    }
}
