//! Atomic f64 cell — compare-exchange add on the u64 bit pattern.
//!
//! The KB mass tables are read concurrently by inference and written
//! concurrently by training under the same shared lock mode. Hardware has no
//! atomic f64 add, so the add is a CAS loop on the bit pattern: lock-free,
//! not wait-free, which is fine at training contention levels.

use std::sync::atomic::{AtomicU64, Ordering};

/// An `f64` with relaxed atomic access and a CAS-loop add.
#[repr(transparent)]
pub struct AtomicF64(AtomicU64);

impl AtomicF64 {
    #[inline]
    pub fn new(v: f64) -> Self {
        Self(AtomicU64::new(v.to_bits()))
    }

    /// Current value. Relaxed — callers tolerate pre- or post-update values.
    #[inline(always)]
    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    /// Plain store. Only used under exclusive access (maintenance rebuilds).
    #[inline(always)]
    pub fn set(&self, v: f64) {
        self.0.store(v.to_bits(), Ordering::Relaxed);
    }

    /// Atomically add `delta`. Concurrent adds never lose an increment.
    #[inline]
    pub fn add(&self, delta: f64) {
        let mut cur = self.0.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(cur) + delta).to_bits();
            match self
                .0
                .compare_exchange_weak(cur, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(seen) => cur = seen,
            }
        }
    }
}

impl std::fmt::Debug for AtomicF64 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_get_set() {
        let c = AtomicF64::new(1.5);
        assert_eq!(c.get(), 1.5);
        c.set(-3.25);
        assert_eq!(c.get(), -3.25);
    }

    #[test]
    fn test_concurrent_adds_sum_exactly() {
        let cell = Arc::new(AtomicF64::new(0.0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let cell = Arc::clone(&cell);
            handles.push(std::thread::spawn(move || {
                for _ in 0..10_000 {
                    cell.add(1.0);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        // 1.0 increments are exact in f64 up to 2^53.
        assert_eq!(cell.get(), 80_000.0);
    }
}
