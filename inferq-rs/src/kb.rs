//! KB store — the three mass tables that define the learned distribution.
//!
//! | Table | Shape            | Cell meaning                                  |
//! |-------|------------------|-----------------------------------------------|
//! | A     | Q × nAnswers × T | mass that target t answers a to question q    |
//! | D     | Q × T            | Σₐ A[q,a,t], kept in sync with A              |
//! | B     | T                | prior mass of target t                        |
//!
//! Cells are `AtomicF64`: inference reads them without per-cell
//! synchronization while training scatter-adds into them under the same
//! shared lock mode — legal because updates only grow cells and the kernels
//! tolerate seeing pre- or post-update values.
//!
//! The T axis is padded to the quad width. Padding cells stay 0.0 and are
//! reported as gaps by the target tracker's quad masks, so no kernel ever
//! feeds them into a sum or a division.

use inferq_core::simd::pad_to_quads;
use inferq_core::AtomicF64;

use crate::config::EngineDimensions;
use crate::gaps::GapTracker;

/// The A, D, B mass tables plus their geometry.
pub struct KbStore {
    dims: EngineDimensions,
    init_amount: f64,
    t_stride: usize,
    a: Box<[AtomicF64]>,
    d: Box<[AtomicF64]>,
    b: Box<[AtomicF64]>,
}

fn zeroed_cells(len: usize) -> Box<[AtomicF64]> {
    (0..len).map(|_| AtomicF64::new(0.0)).collect()
}

impl KbStore {
    /// Fresh store with every cell seeded by the initial amount α₀.
    pub fn new(dims: EngineDimensions, init_amount: f64) -> Self {
        let t_stride = pad_to_quads(dims.n_targets);
        let store = Self {
            dims,
            init_amount,
            t_stride,
            a: zeroed_cells(dims.n_questions * dims.n_answers * t_stride),
            d: zeroed_cells(dims.n_questions * t_stride),
            b: zeroed_cells(t_stride),
        };
        for q in 0..dims.n_questions {
            store.reset_question(q);
        }
        for t in 0..dims.n_targets {
            store.cell_b(t).set(init_amount);
        }
        store
    }

    #[inline]
    pub fn dims(&self) -> EngineDimensions {
        self.dims
    }

    #[inline]
    pub fn init_amount(&self) -> f64 {
        self.init_amount
    }

    /// Padded length of the T axis; quiz planes share this stride.
    #[inline]
    pub fn t_stride(&self) -> usize {
        self.t_stride
    }

    // ------------------------------------------------------------------
    // Row and cell access
    // ------------------------------------------------------------------

    /// The `A[q,a,·]` row, `t_stride` cells.
    #[inline]
    pub fn a_row(&self, q: usize, a: usize) -> &[AtomicF64] {
        let base = (q * self.dims.n_answers + a) * self.t_stride;
        &self.a[base..base + self.t_stride]
    }

    /// All answer rows of question `q`, `n_answers * t_stride` cells laid
    /// out answer-major. The next-question kernel indexes this directly to
    /// avoid per-answer slicing in its hot loop.
    #[inline]
    pub fn a_rows(&self, q: usize) -> &[AtomicF64] {
        let base = q * self.dims.n_answers * self.t_stride;
        &self.a[base..base + self.dims.n_answers * self.t_stride]
    }

    /// The `D[q,·]` row, `t_stride` cells.
    #[inline]
    pub fn d_row(&self, q: usize) -> &[AtomicF64] {
        let base = q * self.t_stride;
        &self.d[base..base + self.t_stride]
    }

    /// The `B[·]` row, `t_stride` cells.
    #[inline]
    pub fn b_row(&self) -> &[AtomicF64] {
        &self.b
    }

    #[inline]
    pub fn cell_a(&self, q: usize, a: usize, t: usize) -> &AtomicF64 {
        &self.a[(q * self.dims.n_answers + a) * self.t_stride + t]
    }

    #[inline]
    pub fn cell_d(&self, q: usize, t: usize) -> &AtomicF64 {
        &self.d[q * self.t_stride + t]
    }

    #[inline]
    pub fn cell_b(&self, t: usize) -> &AtomicF64 {
        &self.b[t]
    }

    // ------------------------------------------------------------------
    // Maintenance rebuilds (exclusive lock held by the caller)
    // ------------------------------------------------------------------

    /// Reseed one question's rows to the initial amount (gap-slot reuse).
    pub fn reset_question(&self, q: usize) {
        for a in 0..self.dims.n_answers {
            let row = self.a_row(q, a);
            for t in 0..self.dims.n_targets {
                row[t].set(self.init_amount);
            }
        }
        let d_row = self.d_row(q);
        let seeded_d = self.init_amount * self.dims.n_answers as f64;
        for t in 0..self.dims.n_targets {
            d_row[t].set(seeded_d);
        }
    }

    /// Reseed one target's column across all tables (gap-slot reuse).
    pub fn reset_target(&self, t: usize) {
        let seeded_d = self.init_amount * self.dims.n_answers as f64;
        for q in 0..self.dims.n_questions {
            for a in 0..self.dims.n_answers {
                self.cell_a(q, a, t).set(self.init_amount);
            }
            self.cell_d(q, t).set(seeded_d);
        }
        self.cell_b(t).set(self.init_amount);
    }

    /// A store with enlarged dimensions: new cells seeded with α₀, old
    /// cells copied over.
    pub fn grown(&self, new_dims: EngineDimensions) -> KbStore {
        debug_assert!(new_dims.n_questions >= self.dims.n_questions);
        debug_assert!(new_dims.n_targets >= self.dims.n_targets);
        debug_assert_eq!(new_dims.n_answers, self.dims.n_answers);
        let next = KbStore::new(new_dims, self.init_amount);
        for q in 0..self.dims.n_questions {
            for a in 0..self.dims.n_answers {
                let src = self.a_row(q, a);
                let dst = next.a_row(q, a);
                for t in 0..self.dims.n_targets {
                    dst[t].set(src[t].get());
                }
            }
            let src = self.d_row(q);
            let dst = next.d_row(q);
            for t in 0..self.dims.n_targets {
                dst[t].set(src[t].get());
            }
        }
        for t in 0..self.dims.n_targets {
            next.cell_b(t).set(self.cell_b(t).get());
        }
        next
    }

    /// A store with gapped ids squeezed out. `q_map[old]` / `t_map[old]`
    /// give the new id of each live old id, `None` for gaps.
    pub fn compacted(&self, q_map: &[Option<usize>], t_map: &[Option<usize>]) -> KbStore {
        let new_dims = EngineDimensions {
            n_answers: self.dims.n_answers,
            n_questions: q_map.iter().flatten().count(),
            n_targets: t_map.iter().flatten().count(),
        };
        let next = KbStore::new(new_dims, self.init_amount);
        for (old_q, &new_q) in q_map.iter().enumerate() {
            let Some(new_q) = new_q else { continue };
            for a in 0..self.dims.n_answers {
                let src = self.a_row(old_q, a);
                let dst = next.a_row(new_q, a);
                for (old_t, &new_t) in t_map.iter().enumerate() {
                    if let Some(new_t) = new_t {
                        dst[new_t].set(src[old_t].get());
                    }
                }
            }
            let src = self.d_row(old_q);
            let dst = next.d_row(new_q);
            for (old_t, &new_t) in t_map.iter().enumerate() {
                if let Some(new_t) = new_t {
                    dst[new_t].set(src[old_t].get());
                }
            }
        }
        for (old_t, &new_t) in t_map.iter().enumerate() {
            if let Some(new_t) = new_t {
                next.cell_b(new_t).set(self.cell_b(old_t).get());
            }
        }
        next
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    /// Check the mass-table invariants over live ids:
    /// `D[q,t] = Σₐ A[q,a,t]` within `1e-9·D`, and every cell at or above
    /// its seeded floor.
    pub fn verify(&self, q_gaps: &GapTracker, t_gaps: &GapTracker) -> Result<(), String> {
        let floor_a = self.init_amount - 1e-12;
        let floor_d = self.init_amount * self.dims.n_answers as f64 - 1e-12;
        for q in q_gaps.iter_live() {
            for t in t_gaps.iter_live() {
                let d = self.cell_d(q, t).get();
                if d < floor_d {
                    return Err(format!("D[{q},{t}] = {d} below seeded floor"));
                }
                let mut sum_a = 0.0;
                for a in 0..self.dims.n_answers {
                    let av = self.cell_a(q, a, t).get();
                    if av < floor_a {
                        return Err(format!("A[{q},{a},{t}] = {av} below seeded floor"));
                    }
                    sum_a += av;
                }
                if (sum_a - d).abs() > 1e-9 * d {
                    return Err(format!("D[{q},{t}] = {d} but Σa A = {sum_a}"));
                }
            }
        }
        for t in t_gaps.iter_live() {
            let b = self.cell_b(t).get();
            if b < floor_a {
                return Err(format!("B[{t}] = {b} below seeded floor"));
            }
        }
        Ok(())
    }
}
