//! Quiz state and the quiz registry.
//!
//! A quiz's belief over targets is stored as two parallel planes: a
//! *mantissa* plane of normalized fractions and an *exponent* plane of
//! signed biases, so that the product of dozens of small likelihoods can be
//! represented without underflow — the value of lane t is
//! `mants[t] · 2^exps[t]`. Renormalization keeps live mantissas within
//! `[2⁻²⁵⁶, 1)`; after a normalize pass the exponent plane is all zero and
//! the mantissa plane holds probabilities.
//!
//! The registry owns every quiz behind an `Arc<Mutex<_>>`: concurrent calls
//! on the same quiz id serialize on that mutex, and clients refer to a quiz
//! by id only.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use inferq_core::AlignedBuf;

use crate::config::{AnswerId, QuestionId, QuizId, TargetId};
use crate::error::{EngineError, EngineResult};
use crate::gaps::GapTracker;

/// One recorded (question, answer) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnsweredQuestion {
    pub question: QuestionId,
    pub answer: AnswerId,
}

/// One entry of a top-targets listing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RatedTarget {
    pub target: TargetId,
    pub probability: f64,
}

/// Per-quiz state: priors planes, asked bitmap, history, active question.
#[derive(Debug)]
pub struct Quiz {
    /// Mantissa plane, `t_stride` lanes.
    pub(crate) mants: AlignedBuf<f64>,
    /// Exponent plane, `t_stride` lanes.
    pub(crate) exps: AlignedBuf<i64>,
    asked: Vec<u64>,
    history: Vec<AnsweredQuestion>,
    active: Option<QuestionId>,
}

impl Quiz {
    pub(crate) fn new(t_stride: usize) -> Self {
        Self {
            mants: AlignedBuf::zeroed(t_stride),
            exps: AlignedBuf::zeroed(t_stride),
            asked: Vec::new(),
            history: Vec::new(),
            active: None,
        }
    }

    #[inline]
    pub fn history(&self) -> &[AnsweredQuestion] {
        &self.history
    }

    #[inline]
    pub fn active_question(&self) -> Option<QuestionId> {
        self.active
    }

    #[inline]
    pub fn is_asked(&self, q: QuestionId) -> bool {
        self.asked
            .get(q / 64)
            .is_some_and(|word| word >> (q % 64) & 1 == 1)
    }

    /// The bitmap grows lazily so questions added in maintenance mode after
    /// the quiz started read as unasked.
    pub(crate) fn mark_asked(&mut self, q: QuestionId) {
        let word = q / 64;
        if word >= self.asked.len() {
            self.asked.resize(word + 1, 0);
        }
        self.asked[word] |= 1 << (q % 64);
    }

    pub(crate) fn push_history(&mut self, q: QuestionId, a: AnswerId) {
        self.history.push(AnsweredQuestion {
            question: q,
            answer: a,
        });
    }

    pub(crate) fn set_active(&mut self, q: QuestionId) {
        self.active = Some(q);
    }

    pub(crate) fn clear_active(&mut self) {
        self.active = None;
    }
}

/// Id → quiz map plus its gap tracker, guarded by the registry mutex.
pub(crate) struct QuizRegistry {
    slots: Vec<Option<Arc<Mutex<Quiz>>>>,
    gaps: GapTracker,
    max_quizzes: usize,
}

impl QuizRegistry {
    pub fn new(max_quizzes: usize) -> Self {
        Self {
            slots: Vec::new(),
            gaps: GapTracker::new_empty(),
            max_quizzes,
        }
    }

    /// Create a fresh quiz, reusing the smallest freed id.
    pub fn create(&mut self, t_stride: usize) -> EngineResult<(QuizId, Arc<Mutex<Quiz>>)> {
        let id = match self.gaps.acquire() {
            Some(id) => id,
            None => {
                if self.slots.len() >= self.max_quizzes {
                    return Err(EngineError::CapacityExhausted(format!(
                        "quiz registry is at its limit of {}",
                        self.max_quizzes
                    )));
                }
                let id = self.gaps.grow_live();
                self.slots.push(None);
                id
            }
        };
        let quiz = Arc::new(Mutex::new(Quiz::new(t_stride)));
        self.slots[id] = Some(Arc::clone(&quiz));
        Ok((id, quiz))
    }

    pub fn get(&self, id: QuizId) -> Option<Arc<Mutex<Quiz>>> {
        self.slots.get(id).and_then(|slot| slot.clone())
    }

    pub fn release(&mut self, id: QuizId) -> bool {
        match self.slots.get_mut(id) {
            Some(slot @ Some(_)) => {
                *slot = None;
                self.gaps.release(id);
                true
            }
            _ => false,
        }
    }

    /// Number of currently open quizzes.
    pub fn outstanding(&self) -> usize {
        self.gaps.live_count()
    }

    pub fn drain(&mut self) -> usize {
        let n = self.outstanding();
        for id in 0..self.slots.len() {
            self.release(id);
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asked_bitmap() {
        let mut quiz = Quiz::new(8);
        assert!(!quiz.is_asked(0));
        assert!(!quiz.is_asked(200));
        quiz.mark_asked(70);
        assert!(quiz.is_asked(70));
        assert!(!quiz.is_asked(69));
        assert!(!quiz.is_asked(71));
    }

    #[test]
    fn test_registry_reuses_smallest_id() {
        let mut reg = QuizRegistry::new(16);
        let (a, _) = reg.create(4).unwrap();
        let (b, _) = reg.create(4).unwrap();
        let (c, _) = reg.create(4).unwrap();
        assert_eq!((a, b, c), (0, 1, 2));
        assert!(reg.release(1));
        let (again, _) = reg.create(4).unwrap();
        assert_eq!(again, 1);
        assert_eq!(reg.outstanding(), 3);
    }

    #[test]
    fn test_registry_capacity() {
        let mut reg = QuizRegistry::new(2);
        reg.create(4).unwrap();
        reg.create(4).unwrap();
        let err = reg.create(4).unwrap_err();
        assert!(matches!(err, EngineError::CapacityExhausted(_)));
        reg.release(0);
        assert!(reg.create(4).is_ok());
    }

    #[test]
    fn test_release_unknown_id() {
        let mut reg = QuizRegistry::new(4);
        assert!(!reg.release(0));
        let (id, _) = reg.create(4).unwrap();
        assert!(reg.release(id));
        assert!(!reg.release(id));
    }

    #[test]
    fn test_drain() {
        let mut reg = QuizRegistry::new(8);
        reg.create(4).unwrap();
        reg.create(4).unwrap();
        assert_eq!(reg.drain(), 2);
        assert_eq!(reg.outstanding(), 0);
    }
}
