//! Training kernel — fold a resolved quiz back into the KB.
//!
//! For each (question, answer) in the quiz's history the learning mass is
//! added to `A[q,a,τ]` and to `D[q,τ]`, then once to `B[τ]`, τ being the
//! confirmed target. Adds are per-cell atomic, so any number of quizzes can
//! train concurrently under the shared mode of the KB lock and the final
//! cell values equal the sum of all applied amounts regardless of
//! interleaving. The identical add to A and D preserves `D = Σₐ A` exactly
//! up to fp rounding drift, which stays bounded because both sides only
//! ever grow by the same increments.

use crate::config::TargetId;
use crate::kb::KbStore;
use crate::quiz::AnsweredQuestion;

/// Apply one resolved quiz with confirmed target `target`.
///
/// The loop is serial: a history is at most one quiz long, and a pool
/// dispatch would cost more than the handful of CAS adds.
pub(crate) fn apply_quiz(kb: &KbStore, history: &[AnsweredQuestion], target: TargetId, amount: f64) {
    for aq in history {
        kb.cell_a(aq.question, aq.answer, target).add(amount);
        kb.cell_d(aq.question, target).add(amount);
    }
    kb.cell_b(target).add(amount);
}
