//! Engine error hierarchy.
//!
//! Every public operation returns either success or a single error carrying
//! a kind and a human-readable detail. `Internal` is fatal to the engine
//! instance: once latched, every subsequent operation returns it until the
//! process is restarted.

use thiserror::Error;

/// Which id space an invalid id belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdSpace {
    Quiz,
    Question,
    Answer,
    Target,
}

impl std::fmt::Display for IdSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            IdSpace::Quiz => "quiz",
            IdSpace::Question => "question",
            IdSpace::Answer => "answer",
            IdSpace::Target => "target",
        };
        f.write_str(s)
    }
}

/// Root error type for all engine failures.
#[derive(Error, Debug)]
pub enum EngineError {
    /// An argument failed validation (dimension, amount, live-quiz conflict).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An id does not name a live entity in its space.
    #[error("invalid {space} id {id}")]
    InvalidId { space: IdSpace, id: usize },

    /// The operation is not permitted in the engine's current mode.
    #[error("wrong mode: {0}")]
    WrongMode(String),

    /// An id space or registry has no room left.
    #[error("capacity exhausted: {0}")]
    CapacityExhausted(String),

    /// Every question is either a gap or already asked in this quiz.
    #[error("no eligible question")]
    NoEligibleQuestion,

    /// RecordAnswer was called with no question outstanding.
    #[error("no pending question for quiz {0}")]
    NoPendingQuestion(usize),

    /// A persisted KB disagrees with the engine (magic, version, dims).
    #[error("format mismatch: {0}")]
    FormatMismatch(String),

    /// Backend or precision declared but not built.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Internal invariant violation. Fatal to this engine instance.
    #[error("internal invariant violation: {0}")]
    Internal(String),

    /// I/O failure during persistence.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_detail() {
        let e = EngineError::InvalidId {
            space: IdSpace::Target,
            id: 99,
        };
        assert_eq!(e.to_string(), "invalid target id 99");

        let e = EngineError::WrongMode("engine is in maintenance mode".into());
        assert!(e.to_string().contains("maintenance"));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let e: EngineError = io.into();
        assert!(matches!(e, EngineError::Io(_)));
    }
}
