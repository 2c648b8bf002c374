//! Bucket summator — numerically stable Σ over many floats.
//!
//! Summands are accumulated into one bucket per IEEE-754 exponent class, so
//! values of similar magnitude collide and cancel or reinforce without
//! catastrophic loss. Each worker owns a private row of buckets — adds are
//! wait-free among distinct workers and the zero sweep before reuse warms
//! that worker's cache. The collective `compute_sum` then reduces bucket
//! columns in ascending magnitude order and stable-sums the per-chunk
//! partials, so the final rounding error is bounded by the number of
//! distinct magnitude classes rather than the summand count.
//!
//! Protocol per summation round:
//!
//! 1. each participating worker calls `zero_row(worker)` once,
//! 2. workers call `add` / `add_quad` freely on their own row,
//! 3. after the add-phase split joins, the caller runs
//!    `compute_sum(pool, n_rows)` with the number of rows that took part.

use std::cell::UnsafeCell;

use crate::arena::{MemPool, PooledBuf};
use crate::parallel::{PoolError, WorkerPool, WorkerSlots};
use crate::simd::{biased_exponent, stable_sum, F64_LANES};

/// One bucket per biased f64 exponent value (11 bits).
pub const BUCKET_COUNT: usize = 1 << 11;

struct Row<'p>(UnsafeCell<PooledBuf<'p, f64>>);

// Safety: during the add phase each worker touches only its own row; during
// the compute phase rows are read-only and the pool join separates the two.
unsafe impl Sync for Row<'_> {}

/// Per-worker exponent-indexed buckets with a collective stable sum.
pub struct BucketSummator<'p> {
    rows: Vec<Row<'p>>,
}

impl<'p> BucketSummator<'p> {
    /// One `BUCKET_COUNT`-wide row per worker, on loan from `mem`.
    pub fn new(mem: &'p MemPool, n_workers: usize) -> Self {
        let rows = (0..n_workers)
            .map(|_| Row(UnsafeCell::new(mem.take::<f64>(BUCKET_COUNT))))
            .collect();
        Self { rows }
    }

    #[inline]
    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    /// Mutable view of `worker`'s row. Caller contract: own row only.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    fn row_mut(&self, worker: usize) -> &mut [f64] {
        unsafe { &mut *self.rows[worker].0.get() }
    }

    /// Read view of a row, valid once the add phase has joined.
    #[inline]
    fn row(&self, worker: usize) -> &[f64] {
        unsafe { &*self.rows[worker].0.get() }
    }

    /// Zero `worker`'s buckets before reuse (also warms its cache).
    pub fn zero_row(&self, worker: usize) {
        self.row_mut(worker).fill(0.0);
    }

    /// Accumulate one value into `worker`'s row.
    #[inline(always)]
    pub fn add(&self, worker: usize, value: f64) {
        let row = self.row_mut(worker);
        row[biased_exponent(value) as usize] += value;
    }

    /// Accumulate the first `n_valid` lanes of a quad into `worker`'s row.
    #[inline(always)]
    pub fn add_quad(&self, worker: usize, vals: [f64; 4], n_valid: usize) {
        debug_assert!(n_valid <= F64_LANES);
        let row = self.row_mut(worker);
        for &v in &vals[..n_valid] {
            row[biased_exponent(v) as usize] += v;
        }
    }

    /// Collective reduction over the first `n_rows` rows.
    ///
    /// `n_rows` is the number of workers that actually zeroed and filled
    /// their row this round (`Split::n_pieces` of the add-phase split);
    /// rows beyond it hold stale garbage and must not be read.
    pub fn compute_sum(&self, pool: &WorkerPool, n_rows: usize) -> Result<f64, PoolError> {
        debug_assert!(n_rows <= self.rows.len());
        let partials = WorkerSlots::new(pool.n_workers(), 0.0f64);
        pool.run_split(BUCKET_COUNT, |w, range| {
            // Ascending bucket index = ascending magnitude class.
            let mut acc = 0.0;
            for bucket in range {
                let mut column = 0.0;
                for r in 0..n_rows {
                    column += self.row(r)[bucket];
                }
                acc += column;
            }
            partials.set(w, acc);
        })?;
        let mut parts = partials.into_vec();
        Ok(stable_sum(&mut parts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parallel::Split;

    fn harness(n_workers: usize) -> (MemPool, WorkerPool) {
        (MemPool::new(), WorkerPool::new(n_workers))
    }

    #[test]
    fn test_single_worker_simple_sum() {
        let (mem, pool) = harness(1);
        let bs = BucketSummator::new(&mem, 1);
        bs.zero_row(0);
        bs.add(0, 1.0);
        bs.add(0, 2.0);
        bs.add(0, 3.0);
        assert_eq!(bs.compute_sum(&pool, 1).unwrap(), 6.0);
    }

    #[test]
    fn test_add_quad_respects_n_valid() {
        let (mem, pool) = harness(1);
        let bs = BucketSummator::new(&mem, 1);
        bs.zero_row(0);
        bs.add_quad(0, [1.0, 2.0, 100.0, 100.0], 2);
        assert_eq!(bs.compute_sum(&pool, 1).unwrap(), 3.0);
    }

    #[test]
    fn test_wide_magnitude_span_stays_exact() {
        let (mem, pool) = harness(2);
        let bs = BucketSummator::new(&mem, 2);
        bs.zero_row(0);
        bs.zero_row(1);
        // Worker 0 adds a huge value and its negation, worker 1 the payload.
        bs.add(0, 1e300);
        bs.add(0, -1e300);
        bs.add(1, 1e-300);
        let sum = bs.compute_sum(&pool, 2).unwrap();
        assert_eq!(sum, 1e-300);
    }

    #[test]
    fn test_parallel_fill_matches_serial() {
        let n_workers = 4;
        let (mem, pool) = harness(n_workers);
        let bs = BucketSummator::new(&mem, n_workers);
        let n = 10_000usize;
        let split = Split::of(n, n_workers);
        pool.run_split(n, |w, range| {
            bs.zero_row(w);
            for i in range {
                // Mix of magnitudes from 2^-40 to 2^40.
                let v = ((i % 81) as f64 - 40.0).exp2();
                bs.add(w, v);
            }
        })
        .unwrap();
        let sum = bs.compute_sum(&pool, split.n_pieces()).unwrap();

        let mut expect: Vec<f64> = (0..n).map(|i| ((i % 81) as f64 - 40.0).exp2()).collect();
        let expect = stable_sum(&mut expect);
        let rel = ((sum - expect) / expect).abs();
        assert!(rel < 1e-12, "sum {sum} vs {expect}, rel {rel}");
    }

    #[test]
    fn test_rows_are_reusable_after_zero() {
        let (mem, pool) = harness(1);
        let bs = BucketSummator::new(&mem, 1);
        bs.zero_row(0);
        bs.add(0, 5.0);
        assert_eq!(bs.compute_sum(&pool, 1).unwrap(), 5.0);
        bs.zero_row(0);
        bs.add(0, 7.0);
        assert_eq!(bs.compute_sum(&pool, 1).unwrap(), 7.0);
    }
}
