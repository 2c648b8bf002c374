//! # inferq-rs
//!
//! A probabilistic question-answering engine. The engine maintains a learned
//! joint distribution over a finite universe of *targets* conditioned on
//! *answers* given to *questions*, and uses it to drive interactive
//! *quizzes*: it repeatedly selects the next most informative question,
//! records the answer, and sharpens its belief over targets until one
//! dominates. Confirming the true target at the end of a quiz folds that
//! evidence back into the knowledge base.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        CpuEngine                              │
//! │  mode switch ──► KB r/w lock ──► quiz registry mutex          │
//! │                                                               │
//! │  KB store          quiz state           kernels               │
//! │  A[q,a,t] mass     mantissa plane       infer: priors init,   │
//! │  D[q,t] = Σa A     exponent plane              answer update, │
//! │  B[t] prior        asked bitmap                normalize,     │
//! │  gap trackers      history              next question,        │
//! │                                          top targets          │
//! │                                          train: scatter-add   │
//! │                                                               │
//! │  substrate: worker pool · mem pool · bucket summator (core)   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Regular operations (quizzes, training) run concurrently under the shared
//! mode of the KB lock; structural changes (adding/removing questions or
//! targets, compaction, save/load) require maintenance mode, reached through
//! a draining mode switch.
//!
//! ## Quick start
//!
//! ```rust
//! use inferq_rs::{create_engine, Backend, EngineDefinition, EngineDimensions, QuizEngine};
//!
//! let def = EngineDefinition::new(EngineDimensions {
//!     n_answers: 5,
//!     n_questions: 100,
//!     n_targets: 100,
//! });
//! let engine = create_engine(Backend::Cpu, &def).unwrap();
//!
//! let quiz = engine.start_quiz().unwrap();
//! let question = engine.next_question(quiz).unwrap();
//! engine.record_answer(quiz, 2).unwrap();
//! let top = engine.list_top_targets(quiz, 3).unwrap();
//! assert!(!top.is_empty());
//! engine.record_quiz_target(quiz, 7).unwrap();
//! engine.release_quiz(quiz).unwrap();
//! # let _ = question;
//! ```

mod config;
mod engine;
mod error;
mod factory;
mod gaps;
mod infer;
mod kb;
mod mode;
mod persist;
mod quiz;
mod train;

pub use config::{
    AnswerId, Backend, EngineDefinition, EngineDimensions, Precision, QuestionId, QuizId, TargetId,
};
pub use engine::{CompactionReport, CpuEngine, ProgressSink, QuizEngine};
pub use error::{EngineError, EngineResult, IdSpace};
pub use factory::create_engine;
pub use gaps::GapTracker;
pub use mode::EngineMode;
pub use quiz::{AnsweredQuestion, RatedTarget};
