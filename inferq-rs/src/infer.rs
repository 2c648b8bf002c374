//! Inference kernels: priors initialization, likelihood update, normalize,
//! next-question selection, top-target listing.
//!
//! All kernels fan work out over the worker pool in quad blocks along the
//! T axis (or over questions, for selection), with the target gap tracker's
//! quad masks knocking dead lanes out of every block. The caller holds the
//! KB lock in shared mode and the per-quiz mutex; nothing here locks.
//!
//! Numeric discipline:
//! - a lane's belief is `mants[t] · 2^exps[t]`; whenever a multiply drags a
//!   mantissa below `2⁻²⁵⁶` the lane is rescaled by `2²⁵⁶` (exact) and its
//!   exponent bias drops by 256,
//! - sums of probabilities go through the bucket summator, never a naive
//!   accumulator,
//! - normalize rescales by `2^(E − Eₘₐₓ)` with the max taken across *all*
//!   workers' chunk maxima, so the largest live lane lands in `[1, 2)` and
//!   flushed-to-zero lanes are harmless.

use inferq_core::simd::{biased_exponent, exp2i, mask_quad};
use inferq_core::{AtomicF64, BucketSummator, MemPool, PoolError, SplitSlice, WorkerPool, WorkerSlots};

use crate::config::{AnswerId, QuestionId, MAX_ANSWERS};
use crate::error::{EngineError, EngineResult};
use crate::gaps::GapTracker;
use crate::kb::KbStore;
use crate::quiz::{AnsweredQuestion, Quiz, RatedTarget};

/// Exponent shift applied per renormalization step; mantissas below
/// `2^-RENORM_SHIFT` get rescaled by `2^RENORM_SHIFT` (exact).
const RENORM_SHIFT: i64 = 256;

/// Borrowed engine internals every kernel needs.
pub(crate) struct KernelCtx<'e> {
    pub kb: &'e KbStore,
    pub question_gaps: &'e GapTracker,
    pub target_gaps: &'e GapTracker,
    pub pool: &'e WorkerPool,
    pub mem: &'e MemPool,
}

#[inline(always)]
fn load_quad(cells: &[AtomicF64], base: usize) -> [f64; 4] {
    [
        cells[base].get(),
        cells[base + 1].get(),
        cells[base + 2].get(),
        cells[base + 3].get(),
    ]
}

fn pool_internal(err: PoolError) -> EngineError {
    EngineError::Internal(err.to_string())
}

// ============================================================================
// (a) Initialize priors — copy B, divide by Σ B
// ============================================================================

/// Fill a fresh quiz's priors with the normalized target prior masses.
///
/// Two split passes: a set-and-sum pass feeding the bucket summator, then a
/// divide pass. Exponent lanes end at zero, mantissas sum to 1.
pub(crate) fn init_priors(ctx: &KernelCtx<'_>, quiz: &mut Quiz) -> EngineResult<()> {
    let n_blocks = ctx.kb.t_stride() / 4;
    let summator = BucketSummator::new(ctx.mem, ctx.pool.n_workers());
    let b_row = ctx.kb.b_row();
    let mants = SplitSlice::new(quiz.mants.as_mut_slice());
    let exps = SplitSlice::new(quiz.exps.as_mut_slice());

    ctx.pool
        .run_split(n_blocks, |w, range| {
            summator.zero_row(w);
            let m = mants.piece(range.start * 4..range.end * 4);
            let e = exps.piece(range.start * 4..range.end * 4);
            for i in range.clone() {
                let off = (i - range.start) * 4;
                let mut vals = load_quad(b_row, i * 4);
                mask_quad(&mut vals, ctx.target_gaps.quad(i));
                m[off..off + 4].copy_from_slice(&vals);
                e[off..off + 4].fill(0);
                summator.add_quad(w, vals, 4);
            }
        })
        .map_err(pool_internal)?;

    let n_rows = ctx.pool.split(n_blocks).n_pieces();
    let sum = summator
        .compute_sum(ctx.pool, n_rows)
        .map_err(pool_internal)?;
    if !sum.is_finite() {
        return Err(EngineError::Internal(format!(
            "prior mass sum is not finite: {sum}"
        )));
    }
    if sum <= 0.0 {
        // Every target is gapped; the planes are already zero.
        return Ok(());
    }

    ctx.pool
        .run_split(n_blocks, |_, range| {
            for v in mants.piece(range.start * 4..range.end * 4) {
                *v /= sum;
            }
        })
        .map_err(pool_internal)
}

// ============================================================================
// Likelihood multiply — shared by (b) resume and (c) record answer
// ============================================================================

/// Multiply the priors in place by `A[q,a,·] / D[q,·]`, renormalizing any
/// lane whose mantissa crosses the low-magnitude threshold.
fn multiply_by_likelihood(
    ctx: &KernelCtx<'_>,
    mants: &SplitSlice<'_, f64>,
    exps: &SplitSlice<'_, i64>,
    q: QuestionId,
    a: AnswerId,
) -> EngineResult<()> {
    let n_blocks = ctx.kb.t_stride() / 4;
    let a_row = ctx.kb.a_row(q, a);
    let d_row = ctx.kb.d_row(q);
    let mant_low = exp2i(-RENORM_SHIFT);
    let renorm_up = exp2i(RENORM_SHIFT);

    ctx.pool
        .run_split(n_blocks, |_, range| {
            let m = mants.piece(range.start * 4..range.end * 4);
            let e = exps.piece(range.start * 4..range.end * 4);
            for i in range.clone() {
                let mask = ctx.target_gaps.quad(i);
                if mask == 0xF {
                    continue;
                }
                for lane in 0..4 {
                    if mask >> lane & 1 == 1 {
                        continue;
                    }
                    let idx = i * 4 + lane;
                    let off = idx - range.start * 4;
                    let mv = m[off];
                    if mv == 0.0 {
                        continue;
                    }
                    let mut next = mv * (a_row[idx].get() / d_row[idx].get());
                    while next < mant_low && next > 0.0 {
                        next *= renorm_up;
                        e[off] -= RENORM_SHIFT;
                    }
                    m[off] = next;
                }
            }
        })
        .map_err(pool_internal)
}

// ============================================================================
// (c) Record answer
// ============================================================================

/// Fold one answer into the quiz's belief and renormalize to probabilities.
pub(crate) fn apply_answer(
    ctx: &KernelCtx<'_>,
    quiz: &mut Quiz,
    q: QuestionId,
    a: AnswerId,
) -> EngineResult<()> {
    {
        let mants = SplitSlice::new(quiz.mants.as_mut_slice());
        let exps = SplitSlice::new(quiz.exps.as_mut_slice());
        multiply_by_likelihood(ctx, &mants, &exps, q, a)?;
    }
    normalize_priors(ctx, quiz)
}

// ============================================================================
// (b) Resume priors — replay a history of answers
// ============================================================================

/// Rebuild a quiz's belief from scratch out of `history`: copy B, multiply
/// by each answer's likelihood slice, then normalize once.
pub(crate) fn apply_history(
    ctx: &KernelCtx<'_>,
    quiz: &mut Quiz,
    history: &[AnsweredQuestion],
) -> EngineResult<()> {
    let n_blocks = ctx.kb.t_stride() / 4;
    let b_row = ctx.kb.b_row();
    {
        let mants = SplitSlice::new(quiz.mants.as_mut_slice());
        let exps = SplitSlice::new(quiz.exps.as_mut_slice());

        ctx.pool
            .run_split(n_blocks, |_, range| {
                let m = mants.piece(range.start * 4..range.end * 4);
                let e = exps.piece(range.start * 4..range.end * 4);
                for i in range.clone() {
                    let off = (i - range.start) * 4;
                    let mut vals = load_quad(b_row, i * 4);
                    mask_quad(&mut vals, ctx.target_gaps.quad(i));
                    m[off..off + 4].copy_from_slice(&vals);
                    e[off..off + 4].fill(0);
                }
            })
            .map_err(pool_internal)?;

        for aq in history {
            multiply_by_likelihood(ctx, &mants, &exps, aq.question, aq.answer)?;
        }
    }
    normalize_priors(ctx, quiz)
}

// ============================================================================
// (d) Normalize to probabilities
// ============================================================================

/// Three passes: find the maximum total exponent across live lanes, rescale
/// every lane by `2^(E − Eₘₐₓ)` while bucket-summing, then divide by the
/// sum. Afterwards the exponent plane is zero and mantissas sum to 1.
pub(crate) fn normalize_priors(ctx: &KernelCtx<'_>, quiz: &mut Quiz) -> EngineResult<()> {
    let n_blocks = ctx.kb.t_stride() / 4;
    let mants = SplitSlice::new(quiz.mants.as_mut_slice());
    let exps = SplitSlice::new(quiz.exps.as_mut_slice());

    // Pass 1: per-worker maxima of exps + mantissa exponent, gaps and dead
    // lanes masked out.
    let maxima = WorkerSlots::new(ctx.pool.n_workers(), i64::MIN);
    ctx.pool
        .run_split(n_blocks, |w, range| {
            let m = mants.piece(range.start * 4..range.end * 4);
            let e = exps.piece(range.start * 4..range.end * 4);
            let mut cur = i64::MIN;
            for i in range.clone() {
                let mask = ctx.target_gaps.quad(i);
                if mask == 0xF {
                    continue;
                }
                for lane in 0..4 {
                    if mask >> lane & 1 == 1 {
                        continue;
                    }
                    let off = (i - range.start) * 4 + lane;
                    if m[off] == 0.0 {
                        continue;
                    }
                    let total = e[off] + biased_exponent(m[off]);
                    if total > cur {
                        cur = total;
                    }
                }
            }
            maxima.set(w, cur);
        })
        .map_err(pool_internal)?;
    // Reduce the per-worker maxima to the true maximum.
    let e_max = maxima.into_vec().into_iter().max().unwrap_or(i64::MIN);

    if e_max == i64::MIN {
        // No live mass at all (every target gapped or flushed). Leave a
        // well-defined all-zero belief rather than dividing by zero.
        ctx.pool
            .run_split(n_blocks, |_, range| {
                mants.piece(range.start * 4..range.end * 4).fill(0.0);
                exps.piece(range.start * 4..range.end * 4).fill(0);
            })
            .map_err(pool_internal)?;
        return Ok(());
    }

    // Pass 2: rescale into plain doubles and bucket-sum them.
    let summator = BucketSummator::new(ctx.mem, ctx.pool.n_workers());
    ctx.pool
        .run_split(n_blocks, |w, range| {
            summator.zero_row(w);
            let m = mants.piece(range.start * 4..range.end * 4);
            let e = exps.piece(range.start * 4..range.end * 4);
            for i in range.clone() {
                let mask = ctx.target_gaps.quad(i);
                let off = (i - range.start) * 4;
                let mut vals = [0.0f64; 4];
                for lane in 0..4 {
                    if mask >> lane & 1 == 0 && m[off + lane] != 0.0 {
                        vals[lane] = m[off + lane] * exp2i(e[off + lane] - e_max);
                    }
                }
                m[off..off + 4].copy_from_slice(&vals);
                e[off..off + 4].fill(0);
                summator.add_quad(w, vals, 4);
            }
        })
        .map_err(pool_internal)?;

    let n_rows = ctx.pool.split(n_blocks).n_pieces();
    let sum = summator
        .compute_sum(ctx.pool, n_rows)
        .map_err(pool_internal)?;
    if !(sum.is_finite() && sum > 0.0) {
        return Err(EngineError::Internal(format!(
            "normalization sum must be a positive finite number, got {sum}"
        )));
    }

    // Pass 3: divide into probabilities.
    ctx.pool
        .run_split(n_blocks, |_, range| {
            for v in mants.piece(range.start * 4..range.end * 4) {
                *v /= sum;
            }
        })
        .map_err(pool_internal)
}

// ============================================================================
// (e) Next question
// ============================================================================

/// Pick the most informative next question for `quiz`.
///
/// Every live question is scored with the expected answer-entropy
/// `−Σₐ wₐ ln wₐ`, where `wₐ = Σₜ priors[t] · A[q,a,t]/D[q,t]`; ties break
/// to the lowest id. If the winner is already asked in this quiz (or got
/// gapped), [`find_nearest_question`] walks outward from it to the first
/// eligible question.
pub(crate) fn next_question(ctx: &KernelCtx<'_>, quiz: &Quiz) -> EngineResult<QuestionId> {
    let dims = ctx.kb.dims();
    let n_q = dims.n_questions;
    if n_q == 0 {
        return Err(EngineError::NoEligibleQuestion);
    }
    let t_stride = ctx.kb.t_stride();
    let n_blocks = t_stride / 4;
    let n_a = dims.n_answers;
    let priors: &[f64] = quiz.mants.as_slice();

    let bests = WorkerSlots::new(ctx.pool.n_workers(), (f64::NEG_INFINITY, usize::MAX));
    ctx.pool
        .run_split(n_q, |w, range| {
            let mut wa = [0.0f64; MAX_ANSWERS];
            let mut best = (f64::NEG_INFINITY, usize::MAX);
            for q in range {
                if ctx.question_gaps.is_gap(q) {
                    continue;
                }
                wa[..n_a].fill(0.0);
                let a_rows = ctx.kb.a_rows(q);
                let d_row = ctx.kb.d_row(q);
                for i in 0..n_blocks {
                    let mask = ctx.target_gaps.quad(i);
                    if mask == 0xF {
                        continue;
                    }
                    for lane in 0..4 {
                        if mask >> lane & 1 == 1 {
                            continue;
                        }
                        let idx = i * 4 + lane;
                        let p = priors[idx];
                        if p == 0.0 {
                            continue;
                        }
                        // Σₐ A[q,a,t] = D[q,t], so the wₐ of one target sum
                        // to its prior and the w vector is a distribution.
                        let scaled = p / d_row[idx].get();
                        for (a, acc) in wa[..n_a].iter_mut().enumerate() {
                            *acc += scaled * a_rows[a * t_stride + idx].get();
                        }
                    }
                }
                let mut score = 0.0;
                for &wv in &wa[..n_a] {
                    if wv > 0.0 {
                        score -= wv * wv.ln();
                    }
                }
                // Strict > keeps the lowest id among equal scores.
                if score > best.0 {
                    best = (score, q);
                }
            }
            bests.set(w, best);
        })
        .map_err(pool_internal)?;

    let mut best = (f64::NEG_INFINITY, usize::MAX);
    for (score, q) in bests.into_vec() {
        // Workers cover ascending id ranges, so equal scores resolve to
        // the lowest question id here as well.
        if score > best.0 || (score == best.0 && q < best.1) {
            best = (score, q);
        }
    }
    if best.1 == usize::MAX {
        return Err(EngineError::NoEligibleQuestion);
    }

    let candidate = best.1;
    if ctx.question_gaps.is_gap(candidate) || quiz.is_asked(candidate) {
        find_nearest_question(candidate, quiz, ctx.question_gaps, n_q)
            .ok_or(EngineError::NoEligibleQuestion)
    } else {
        Ok(candidate)
    }
}

/// Walk outward by index from `mid` and return the first question that is
/// neither a gap nor already asked; the lower id wins at equal distance.
pub(crate) fn find_nearest_question(
    mid: QuestionId,
    quiz: &Quiz,
    gaps: &GapTracker,
    n_q: usize,
) -> Option<QuestionId> {
    let eligible = |q: usize| !gaps.is_gap(q) && !quiz.is_asked(q);
    for dist in 1..n_q {
        if mid >= dist && eligible(mid - dist) {
            return Some(mid - dist);
        }
        let up = mid + dist;
        if up < n_q && eligible(up) {
            return Some(up);
        }
    }
    None
}

// ============================================================================
// (f) Top targets
// ============================================================================

/// The top-k targets by posterior, gaps excluded, probability descending
/// and id ascending on ties.
pub(crate) fn top_targets(
    quiz: &Quiz,
    target_gaps: &GapTracker,
    n_targets: usize,
    k: usize,
) -> Vec<RatedTarget> {
    let mut rated: Vec<RatedTarget> = (0..n_targets)
        .filter(|&t| !target_gaps.is_gap(t))
        .map(|t| RatedTarget {
            target: t,
            probability: quiz.mants[t],
        })
        .collect();
    rated.sort_unstable_by(|x, y| {
        y.probability
            .total_cmp(&x.probability)
            .then(x.target.cmp(&y.target))
    });
    rated.truncate(k);
    rated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineDimensions;

    struct Fixture {
        kb: KbStore,
        question_gaps: GapTracker,
        target_gaps: GapTracker,
        pool: WorkerPool,
        mem: MemPool,
    }

    impl Fixture {
        fn new(n_answers: usize, n_questions: usize, n_targets: usize) -> Self {
            let dims = EngineDimensions {
                n_answers,
                n_questions,
                n_targets,
            };
            Self {
                kb: KbStore::new(dims, 0.1),
                question_gaps: GapTracker::new_full(n_questions),
                target_gaps: GapTracker::new_full(n_targets),
                pool: WorkerPool::new(2),
                mem: MemPool::new(),
            }
        }

        fn ctx(&self) -> KernelCtx<'_> {
            KernelCtx {
                kb: &self.kb,
                question_gaps: &self.question_gaps,
                target_gaps: &self.target_gaps,
                pool: &self.pool,
                mem: &self.mem,
            }
        }
    }

    fn priors_sum(quiz: &Quiz, n_targets: usize) -> f64 {
        quiz.mants[..n_targets].iter().sum()
    }

    #[test]
    fn test_init_priors_uniform() {
        let fx = Fixture::new(5, 4, 10);
        let mut quiz = Quiz::new(fx.kb.t_stride());
        init_priors(&fx.ctx(), &mut quiz).unwrap();
        assert!((priors_sum(&quiz, 10) - 1.0).abs() < 1e-12);
        for t in 0..10 {
            assert!((quiz.mants[t] - 0.1).abs() < 1e-12);
        }
        // Padding lanes carry no mass.
        assert_eq!(quiz.mants[10], 0.0);
        assert_eq!(quiz.mants[11], 0.0);
    }

    #[test]
    fn test_init_priors_respects_b_masses() {
        let fx = Fixture::new(5, 2, 4);
        fx.kb.cell_b(2).add(0.3); // B = [0.1, 0.1, 0.4, 0.1]
        let mut quiz = Quiz::new(fx.kb.t_stride());
        init_priors(&fx.ctx(), &mut quiz).unwrap();
        assert!((quiz.mants[2] - 4.0 / 7.0).abs() < 1e-12);
        assert!((quiz.mants[0] - 1.0 / 7.0).abs() < 1e-12);
    }

    #[test]
    fn test_init_priors_masks_gapped_targets() {
        let mut fx = Fixture::new(5, 2, 4);
        fx.target_gaps.release(1);
        let mut quiz = Quiz::new(fx.kb.t_stride());
        init_priors(&fx.ctx(), &mut quiz).unwrap();
        assert_eq!(quiz.mants[1], 0.0);
        assert!((priors_sum(&quiz, 4) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_apply_answer_sharpens_and_normalizes() {
        let fx = Fixture::new(2, 1, 2);
        // Target 0 strongly answers 0 to question 0; target 1 answers 1.
        fx.kb.cell_a(0, 0, 0).add(8.0);
        fx.kb.cell_d(0, 0).add(8.0);
        fx.kb.cell_a(0, 1, 1).add(8.0);
        fx.kb.cell_d(0, 1).add(8.0);
        let mut quiz = Quiz::new(fx.kb.t_stride());
        init_priors(&fx.ctx(), &mut quiz).unwrap();
        apply_answer(&fx.ctx(), &mut quiz, 0, 0).unwrap();
        assert!((priors_sum(&quiz, 2) - 1.0).abs() < 1e-12);
        assert!(
            quiz.mants[0] > 0.9,
            "posterior for the matching target: {}",
            quiz.mants[0]
        );
        assert_eq!(quiz.exps[0], 0);
        assert_eq!(quiz.exps[1], 0);
    }

    #[test]
    fn test_long_histories_do_not_underflow() {
        let fx = Fixture::new(2, 40, 8);
        // Make answer 0 unlikely for every (q, t): each likelihood is 1e-3,
        // so 40 of them multiply to 1e-120 — well past the 2^-256 mantissa
        // threshold, forcing several renormalization steps per lane.
        for q in 0..40 {
            for t in 0..8 {
                fx.kb.cell_a(q, 1, t).add(99.8);
                fx.kb.cell_d(q, t).add(99.8);
            }
        }
        let history: Vec<AnsweredQuestion> = (0..40)
            .map(|q| AnsweredQuestion {
                question: q,
                answer: 0,
            })
            .collect();
        let mut quiz = Quiz::new(fx.kb.t_stride());
        apply_history(&fx.ctx(), &mut quiz, &history).unwrap();
        // All targets look alike, so the posterior is uniform — but only if
        // no lane underflowed to zero along the way.
        assert!((priors_sum(&quiz, 8) - 1.0).abs() < 1e-12);
        for t in 0..8 {
            assert!((quiz.mants[t] - 0.125).abs() < 1e-9, "lane {t}");
        }
    }

    #[test]
    fn test_next_question_prefers_balanced_answer_split() {
        let fx = Fixture::new(2, 3, 4);
        // All three questions are trained. Questions 0 and 2 answer 0 for
        // every target (skewed answer distribution, low entropy); question 1
        // splits the targets down the middle, so its predicted answer
        // distribution is even and its entropy maximal.
        for q in [0, 2] {
            for t in 0..4 {
                fx.kb.cell_a(q, 0, t).add(10.0);
                fx.kb.cell_d(q, t).add(10.0);
            }
        }
        for t in 0..4 {
            let a = if t < 2 { 0 } else { 1 };
            fx.kb.cell_a(1, a, t).add(10.0);
            fx.kb.cell_d(1, t).add(10.0);
        }
        let mut quiz = Quiz::new(fx.kb.t_stride());
        init_priors(&fx.ctx(), &mut quiz).unwrap();
        assert_eq!(next_question(&fx.ctx(), &quiz).unwrap(), 1);
    }

    #[test]
    fn test_next_question_tie_breaks_low() {
        let fx = Fixture::new(3, 5, 4);
        let mut quiz = Quiz::new(fx.kb.t_stride());
        init_priors(&fx.ctx(), &mut quiz).unwrap();
        // Fresh KB: every question scores identically.
        assert_eq!(next_question(&fx.ctx(), &quiz).unwrap(), 0);
    }

    #[test]
    fn test_next_question_walks_past_asked() {
        let fx = Fixture::new(3, 5, 4);
        let mut quiz = Quiz::new(fx.kb.t_stride());
        init_priors(&fx.ctx(), &mut quiz).unwrap();
        quiz.mark_asked(0);
        assert_eq!(next_question(&fx.ctx(), &quiz).unwrap(), 1);
        quiz.mark_asked(1);
        assert_eq!(next_question(&fx.ctx(), &quiz).unwrap(), 2);
    }

    #[test]
    fn test_next_question_exhausted() {
        let fx = Fixture::new(3, 2, 4);
        let mut quiz = Quiz::new(fx.kb.t_stride());
        init_priors(&fx.ctx(), &mut quiz).unwrap();
        quiz.mark_asked(0);
        quiz.mark_asked(1);
        assert!(matches!(
            next_question(&fx.ctx(), &quiz),
            Err(EngineError::NoEligibleQuestion)
        ));
    }

    #[test]
    fn test_find_nearest_prefers_lower_at_ties() {
        let fx = Fixture::new(3, 7, 4);
        let quiz = Quiz::new(fx.kb.t_stride());
        assert_eq!(find_nearest_question(3, &quiz, &fx.question_gaps, 7), Some(2));
        let mut gapped = GapTracker::new_full(7);
        gapped.release(2);
        assert_eq!(find_nearest_question(3, &quiz, &gapped, 7), Some(4));
    }

    #[test]
    fn test_top_targets_ordering() {
        let fx = Fixture::new(2, 1, 6);
        let mut quiz = Quiz::new(fx.kb.t_stride());
        quiz.mants.as_mut_slice()[..6].copy_from_slice(&[0.1, 0.3, 0.05, 0.3, 0.2, 0.05]);
        let top = top_targets(&quiz, &fx.target_gaps, 6, 3);
        let ids: Vec<usize> = top.iter().map(|r| r.target).collect();
        // 0.3 ties resolve to the lower id.
        assert_eq!(ids, vec![1, 3, 4]);
    }

    #[test]
    fn test_top_targets_skips_gaps() {
        let mut fx = Fixture::new(2, 1, 4);
        fx.target_gaps.release(0);
        let mut quiz = Quiz::new(fx.kb.t_stride());
        quiz.mants.as_mut_slice()[..4].copy_from_slice(&[0.9, 0.05, 0.03, 0.02]);
        let top = top_targets(&quiz, &fx.target_gaps, 4, 10);
        assert_eq!(top.len(), 3);
        assert_eq!(top[0].target, 1);
    }
}
