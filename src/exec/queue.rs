use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};

/// A unit of work posted to a queue-backed context.
pub(crate) type Job = Box<dyn FnOnce() + Send>;

/// FIFO drained by a single dedicated worker thread.
///
/// Jobs posted from any thread run in post order, one at a time, on the
/// worker. The worker exits when the last handle is dropped (the flume
/// sender side closes and `recv` fails).
#[derive(Clone)]
pub(crate) struct SerialQueue {
    tx: flume::Sender<Job>,
    worker: Arc<OnceLock<ThreadId>>,
}

impl SerialQueue {
    pub(crate) fn new(name: &str) -> Self {
        let (tx, rx) = flume::unbounded::<Job>();
        let worker = Arc::new(OnceLock::new());
        let worker_id = worker.clone();
        let builder = thread::Builder::new().name(name.to_string());
        // Builder::spawn only fails when the OS refuses a thread, which is as
        // unrecoverable here as a failed allocation.
        builder
            .spawn(move || {
                let _ = worker_id.set(thread::current().id());
                while let Ok(job) = rx.recv() {
                    job();
                }
            })
            .unwrap_or_else(|e| panic!("segnale: failed to spawn serial worker: {e}"));
        Self { tx, worker }
    }

    pub(crate) fn post(&self, job: Job) {
        // The worker outlives every handle, so the send can only fail during
        // process teardown; a lost job there is indistinguishable from one
        // that never ran.
        let _ = self.tx.send(job);
    }

    /// True iff the caller *is* the worker thread.
    ///
    /// Returns false in the window before the worker has published its id;
    /// the caller then posts instead of running inline, which is always safe.
    pub(crate) fn is_current(&self) -> bool {
        self.worker.get() == Some(&thread::current().id())
    }

    /// Stable identity shared by every clone of this queue.
    pub(crate) fn id(&self) -> usize {
        Arc::as_ptr(&self.worker) as usize
    }
}

/// Shared pool of workers draining one MPMC channel.
///
/// flume hands each job to exactly one worker, so the pool is a work-stealing
/// free-for-all: jobs may run in parallel and completion order is unspecified.
#[derive(Clone)]
pub(crate) struct ConcurrentPool {
    tx: flume::Sender<Job>,
}

impl ConcurrentPool {
    pub(crate) fn post(&self, job: Job) {
        let _ = self.tx.send(job);
    }
}

/// The process-wide pool, sized to the machine, spawned on first use.
pub(crate) fn global_pool() -> &'static ConcurrentPool {
    static POOL: OnceLock<ConcurrentPool> = OnceLock::new();
    POOL.get_or_init(|| {
        let (tx, rx) = flume::unbounded::<Job>();
        let workers = num_cpus::get().max(2);
        for i in 0..workers {
            let rx = rx.clone();
            thread::Builder::new()
                .name(format!("segnale-pool-{i}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                })
                .unwrap_or_else(|e| panic!("segnale: failed to spawn pool worker: {e}"));
        }
        ConcurrentPool { tx }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Jobs on a serial queue run in post order on one thread
    #[test]
    fn test_serial_fifo() {
        let q = SerialQueue::new("test-serial");
        let log = Arc::new(Mutex::new(Vec::new()));
        let ids = Arc::new(Mutex::new(Vec::new()));
        for i in 0..16 {
            let log = log.clone();
            let ids = ids.clone();
            q.post(Box::new(move || {
                log.lock().unwrap().push(i);
                ids.lock().unwrap().push(thread::current().id());
            }));
        }
        // Flush marker: once this runs, everything before it has run.
        let done = Arc::new(AtomicUsize::new(0));
        let d = done.clone();
        q.post(Box::new(move || {
            d.store(1, Ordering::SeqCst);
        }));
        while done.load(Ordering::SeqCst) == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(*log.lock().unwrap(), (0..16).collect::<Vec<_>>());
        let ids = ids.lock().unwrap();
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
    }

    /// `is_current` is true on the worker and false off it
    #[test]
    fn test_serial_is_current() {
        let q = SerialQueue::new("test-current");
        assert!(!q.is_current());
        let q2 = q.clone();
        let hit = Arc::new(AtomicUsize::new(0));
        let h = hit.clone();
        q.post(Box::new(move || {
            if q2.is_current() {
                h.store(1, Ordering::SeqCst);
            }
        }));
        while hit.load(Ordering::SeqCst) == 0 {
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// The global pool runs every job exactly once
    #[test]
    fn test_pool_runs_all() {
        let pool = global_pool();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..64 {
            let h = hits.clone();
            pool.post(Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            }));
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while hits.load(Ordering::SeqCst) < 64 {
            assert!(std::time::Instant::now() < deadline, "pool stalled");
            thread::sleep(Duration::from_millis(1));
        }
    }
}
