//! Fixed worker pool for data-parallel split subtasks.
//!
//! One pool lives for the lifetime of an engine. Work arrives as a *split*:
//! an index range of length V partitioned into W contiguous chunks, one per
//! worker. The caller blocks until every worker has quiesced; panics raised
//! inside a worker are captured per worker and merged into a single
//! [`PoolError`] at the join, first panic by worker index leading.
//!
//! ```text
//! caller ── run_split(V, f) ──► worker 0: f(0, 0..c)
//!        │                      worker 1: f(1, c..2c)
//!        │                      ...
//!        ◄──── latch ───────────worker W-1: f(W-1, .., V)
//! ```
//!
//! Jobs borrow from the caller's stack (the kernels hand workers views into
//! quiz planes and KB rows); the borrow is erased to cross the channel and
//! is sound because `run_split` does not return until all workers are done
//! with it.

use std::cell::UnsafeCell;
use std::ops::Range;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

// ============================================================================
// Split — contiguous chunking of an index range
// ============================================================================

/// Partition of `[0, n_items)` into equal contiguous chunks.
#[derive(Clone, Copy, Debug)]
pub struct Split {
    n_items: usize,
    chunk: usize,
}

impl Split {
    pub fn of(n_items: usize, n_workers: usize) -> Self {
        let chunk = n_items.div_ceil(n_workers.max(1)).max(1);
        Self { n_items, chunk }
    }

    /// The chunk assigned to `worker`; empty for workers past the end.
    #[inline]
    pub fn piece(&self, worker: usize) -> Range<usize> {
        let start = (worker * self.chunk).min(self.n_items);
        let end = (start + self.chunk).min(self.n_items);
        start..end
    }

    /// Number of non-empty chunks.
    #[inline]
    pub fn n_pieces(&self) -> usize {
        self.n_items.div_ceil(self.chunk)
    }
}

// ============================================================================
// WorkerSlots — one cell per worker, written without contention
// ============================================================================

/// Per-worker output slots for split subtasks.
///
/// Each worker writes only the slot at its own index during a split; the
/// caller reads the slots after the join. That protocol is what makes the
/// unsynchronized interior mutability sound.
pub struct WorkerSlots<T> {
    cells: Box<[UnsafeCell<T>]>,
}

// Safety: distinct workers touch distinct cells; the caller reads only after
// the pool join provides the happens-before edge.
unsafe impl<T: Send> Sync for WorkerSlots<T> {}

impl<T: Clone> WorkerSlots<T> {
    pub fn new(n_workers: usize, init: T) -> Self {
        let cells = (0..n_workers)
            .map(|_| UnsafeCell::new(init.clone()))
            .collect();
        Self { cells }
    }
}

impl<T> WorkerSlots<T> {
    /// Store `value` in `worker`'s slot. Called from that worker only.
    #[inline]
    pub fn set(&self, worker: usize, value: T) {
        unsafe { *self.cells[worker].get() = value };
    }

    /// Consume the slots after the join.
    pub fn into_vec(self) -> Vec<T> {
        self.cells
            .into_vec()
            .into_iter()
            .map(UnsafeCell::into_inner)
            .collect()
    }
}

// ============================================================================
// Errors
// ============================================================================

/// A panic captured inside one worker.
#[derive(Debug, Clone)]
pub struct WorkerPanic {
    pub worker: usize,
    pub message: String,
}

/// Merged failure of a split: the first panic by worker index leads, the
/// rest ride along as causes.
#[derive(Debug, Clone)]
pub struct PoolError {
    pub panics: Vec<WorkerPanic>,
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.panics.as_slice() {
            [] => write!(f, "worker pool failed with no recorded panic"),
            [first] => write!(f, "worker {} panicked: {}", first.worker, first.message),
            [first, rest @ ..] => write!(
                f,
                "worker {} panicked: {} (+{} more)",
                first.worker,
                first.message,
                rest.len()
            ),
        }
    }
}

impl std::error::Error for PoolError {}

// ============================================================================
// WorkerPool
// ============================================================================

/// Lifetime-erased reference to an in-flight split task.
#[derive(Clone, Copy)]
struct JobRef(*const (dyn SplitRun + 'static));

// Safety: the referent outlives the job because run_split blocks on the
// latch before the referent leaves scope.
unsafe impl Send for JobRef {}

enum Job {
    Run(JobRef),
    Shutdown,
}

trait SplitRun: Sync {
    fn run(&self, worker: usize);
}

struct Latch {
    remaining: Mutex<usize>,
    cond: Condvar,
}

impl Latch {
    fn new(count: usize) -> Self {
        Self {
            remaining: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    fn count_down(&self) {
        let mut remaining = self.remaining.lock();
        *remaining -= 1;
        if *remaining == 0 {
            self.cond.notify_all();
        }
    }

    fn wait(&self) {
        let mut remaining = self.remaining.lock();
        while *remaining > 0 {
            self.cond.wait(&mut remaining);
        }
    }
}

struct SplitTask<'a, F: Fn(usize, Range<usize>) + Sync> {
    f: &'a F,
    split: Split,
    latch: Latch,
    panics: Mutex<Vec<WorkerPanic>>,
}

impl<F: Fn(usize, Range<usize>) + Sync> SplitRun for SplitTask<'_, F> {
    fn run(&self, worker: usize) {
        let range = self.split.piece(worker);
        if !range.is_empty() {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| (self.f)(worker, range))) {
                self.panics.lock().push(WorkerPanic {
                    worker,
                    message: panic_message(&payload),
                });
            }
        }
        self.latch.count_down();
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// A fixed pool of worker threads executing split subtasks.
pub struct WorkerPool {
    senders: Vec<Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `n_workers` threads (clamped to at least 1).
    pub fn new(n_workers: usize) -> Self {
        let n_workers = n_workers.max(1);
        let mut senders = Vec::with_capacity(n_workers);
        let mut handles = Vec::with_capacity(n_workers);
        for idx in 0..n_workers {
            let (tx, rx) = channel::<Job>();
            let handle = std::thread::Builder::new()
                .name(format!("inferq-worker-{idx}"))
                .spawn(move || worker_loop(idx, rx))
                .expect("spawn worker thread");
            senders.push(tx);
            handles.push(handle);
        }
        log::debug!("worker pool up with {n_workers} workers");
        Self { senders, handles }
    }

    /// Pool sized to the machine's hardware parallelism.
    pub fn with_default_workers() -> Self {
        let n = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::new(n)
    }

    #[inline]
    pub fn n_workers(&self) -> usize {
        self.senders.len()
    }

    /// The chunking `run_split` would use for `n_items`.
    #[inline]
    pub fn split(&self, n_items: usize) -> Split {
        Split::of(n_items, self.n_workers())
    }

    /// Run `f(worker, chunk)` over `[0, n_items)` and block until all
    /// workers quiesce. Captured panics merge into one error.
    pub fn run_split<F>(&self, n_items: usize, f: F) -> Result<(), PoolError>
    where
        F: Fn(usize, Range<usize>) + Sync,
    {
        if n_items == 0 {
            return Ok(());
        }
        let task = SplitTask {
            f: &f,
            split: Split::of(n_items, self.n_workers()),
            latch: Latch::new(self.n_workers()),
            panics: Mutex::new(Vec::new()),
        };
        let dyn_task: *const (dyn SplitRun + '_) = &task;
        // Safety: the latch wait below keeps `task` alive until every worker
        // has finished running it, so erasing the borrow cannot dangle.
        let job = JobRef(unsafe {
            std::mem::transmute::<*const (dyn SplitRun + '_), *const (dyn SplitRun + 'static)>(
                dyn_task,
            )
        });
        for (idx, tx) in self.senders.iter().enumerate() {
            if tx.send(Job::Run(job)).is_err() {
                // The worker thread is gone; account for it so the latch
                // still settles, and report it like a panic.
                task.panics.lock().push(WorkerPanic {
                    worker: idx,
                    message: "worker thread terminated".to_string(),
                });
                task.latch.count_down();
            }
        }
        task.latch.wait();
        let mut panics = task.panics.into_inner();
        if panics.is_empty() {
            Ok(())
        } else {
            panics.sort_by_key(|p| p.worker);
            Err(PoolError { panics })
        }
    }
}

fn worker_loop(idx: usize, rx: Receiver<Job>) {
    log::debug!("worker {idx} started");
    while let Ok(job) = rx.recv() {
        match job {
            // Safety: the sender guarantees the task outlives this call.
            Job::Run(r) => unsafe { (*r.0).run(idx) },
            Job::Shutdown => break,
        }
    }
    log::debug!("worker {idx} shutting down");
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for tx in &self.senders {
            let _ = tx.send(Job::Shutdown);
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_split_covers_range() {
        let split = Split::of(13, 4);
        let mut seen = vec![false; 13];
        for w in 0..4 {
            for i in split.piece(w) {
                assert!(!seen[i], "index {i} assigned twice");
                seen[i] = true;
            }
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn test_split_fewer_items_than_workers() {
        let split = Split::of(2, 8);
        assert_eq!(split.n_pieces(), 2);
        assert_eq!(split.piece(0), 0..1);
        assert_eq!(split.piece(1), 1..2);
        assert!(split.piece(2).is_empty());
    }

    #[test]
    fn test_run_split_touches_every_index() {
        let pool = WorkerPool::new(4);
        let mut data = vec![0u64; 1000];
        let slice = crate::arena::SplitSlice::new(&mut data);
        pool.run_split(1000, |_, range| {
            for v in slice.piece(range) {
                *v += 1;
            }
        })
        .unwrap();
        assert!(data.iter().all(|&v| v == 1));
    }

    #[test]
    fn test_run_split_worker_indices_are_distinct() {
        let pool = WorkerPool::new(4);
        let slots = WorkerSlots::new(4, usize::MAX);
        pool.run_split(4, |w, range| {
            slots.set(w, range.start);
        })
        .unwrap();
        let mut starts = slots.into_vec();
        starts.sort_unstable();
        assert_eq!(starts, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_panic_is_captured_and_pool_survives() {
        let pool = WorkerPool::new(3);
        let err = pool
            .run_split(3, |w, _| {
                if w == 1 {
                    panic!("boom in worker");
                }
            })
            .unwrap_err();
        assert_eq!(err.panics.len(), 1);
        assert_eq!(err.panics[0].worker, 1);
        assert!(err.panics[0].message.contains("boom"));

        // The pool keeps working after a captured panic.
        let counter = AtomicUsize::new(0);
        pool.run_split(100, |_, range| {
            counter.fetch_add(range.len(), Ordering::Relaxed);
        })
        .unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 100);
    }

    #[test]
    fn test_zero_items_is_a_no_op() {
        let pool = WorkerPool::new(2);
        pool.run_split(0, |_, _| panic!("must not run")).unwrap();
    }
}
