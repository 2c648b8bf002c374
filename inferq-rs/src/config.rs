//! Engine definition and dimensions.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Handle to an open quiz.
pub type QuizId = usize;
/// Dense question id in `[0, n_questions)`.
pub type QuestionId = usize;
/// Discrete answer id in `[0, n_answers)`.
pub type AnswerId = usize;
/// Dense target id in `[0, n_targets)`.
pub type TargetId = usize;

/// Largest supported answer alphabet. The next-question kernel keeps one
/// accumulator per answer on the stack.
pub const MAX_ANSWERS: usize = 64;

/// The three dimensions of the knowledge base, fixed at engine creation and
/// mutable only in maintenance mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineDimensions {
    /// Size of the answer alphabet (small, typically ≤ 16).
    pub n_answers: usize,
    /// Number of question slots, gaps included.
    pub n_questions: usize,
    /// Number of target slots, gaps included.
    pub n_targets: usize,
}

impl EngineDimensions {
    pub fn validate(&self) -> EngineResult<()> {
        if self.n_answers == 0 || self.n_answers > MAX_ANSWERS {
            return Err(EngineError::InvalidArgument(format!(
                "n_answers must be in 1..={MAX_ANSWERS}, got {}",
                self.n_answers
            )));
        }
        if self.n_targets == 0 {
            return Err(EngineError::InvalidArgument(
                "n_targets must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Numeric precision of the KB cells. Only double is built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Precision {
    #[default]
    Double,
    Float,
}

/// Which engine implementation to instantiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Backend {
    Cpu,
    Cuda,
    Grid,
}

/// Everything needed to construct an engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineDefinition {
    pub dims: EngineDimensions,
    /// Smoothing mass α₀ seeded into every A and B cell; keeps every
    /// likelihood strictly positive.
    pub init_amount: f64,
    pub precision: Precision,
    /// Worker thread count; `None` means hardware parallelism.
    pub n_workers: Option<usize>,
    /// Learning mass added per confirmed quiz.
    pub train_amount: f64,
    /// Upper bound on concurrently open quizzes.
    pub max_quizzes: usize,
}

impl EngineDefinition {
    /// Definition with the customary defaults: α₀ = 0.1, unit learning mass.
    pub fn new(dims: EngineDimensions) -> Self {
        Self {
            dims,
            init_amount: 0.1,
            precision: Precision::Double,
            n_workers: None,
            train_amount: 1.0,
            max_quizzes: 1 << 20,
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        self.dims.validate()?;
        if !(self.init_amount > 0.0 && self.init_amount.is_finite()) {
            return Err(EngineError::InvalidArgument(format!(
                "init_amount must be a positive finite number, got {}",
                self.init_amount
            )));
        }
        if !(self.train_amount > 0.0 && self.train_amount.is_finite()) {
            return Err(EngineError::InvalidArgument(format!(
                "train_amount must be a positive finite number, got {}",
                self.train_amount
            )));
        }
        if self.max_quizzes == 0 {
            return Err(EngineError::InvalidArgument(
                "max_quizzes must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims(a: usize, q: usize, t: usize) -> EngineDimensions {
        EngineDimensions {
            n_answers: a,
            n_questions: q,
            n_targets: t,
        }
    }

    #[test]
    fn test_valid_definition() {
        assert!(EngineDefinition::new(dims(5, 100, 100)).validate().is_ok());
    }

    #[test]
    fn test_zero_questions_is_legal() {
        // A KB with no questions still answers ListTopTargets from priors.
        assert!(EngineDefinition::new(dims(5, 0, 4)).validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_dimensions() {
        assert!(EngineDefinition::new(dims(0, 10, 10)).validate().is_err());
        assert!(EngineDefinition::new(dims(65, 10, 10)).validate().is_err());
        assert!(EngineDefinition::new(dims(5, 10, 0)).validate().is_err());
    }

    #[test]
    fn test_rejects_bad_amounts() {
        let mut def = EngineDefinition::new(dims(5, 10, 10));
        def.init_amount = 0.0;
        assert!(def.validate().is_err());
        def.init_amount = f64::NAN;
        assert!(def.validate().is_err());
        def.init_amount = 0.1;
        def.train_amount = -1.0;
        assert!(def.validate().is_err());
    }
}
