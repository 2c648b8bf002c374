//! Engine facade — the public contract over the kernels.
//!
//! `CpuEngine` owns the KB, the quiz registry and the execution substrate.
//! Public operations are thin dispatchers: they validate arguments against
//! the dimensions and gap trackers, claim the right locks, and route to the
//! kernels — never doing math themselves.
//!
//! Lock acquisition order, always: mode switch → KB r/w lock → quiz
//! registry mutex. The per-quiz mutex is taken after the registry mutex has
//! been released. Violating this order is a bug, not a runtime error.
//!
//! A pool failure or a non-finite sum latches the engine *fatal*: every
//! later operation returns the same internal-invariant-violation error
//! until the process restarts.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, RwLock};

use inferq_core::{MemPool, WorkerPool};

use crate::config::{
    AnswerId, EngineDefinition, EngineDimensions, Precision, QuestionId, QuizId, TargetId,
};
use crate::error::{EngineError, EngineResult, IdSpace};
use crate::gaps::GapTracker;
use crate::infer::{self, KernelCtx};
use crate::kb::KbStore;
use crate::mode::{EngineMode, ModeGuard, ModeSwitch};
use crate::persist;
use crate::quiz::{Quiz, QuizRegistry};
use crate::train;

pub use crate::quiz::{AnsweredQuestion, RatedTarget};

/// Old-id → new-id remapping produced by [`QuizEngine::compact_gaps`];
/// `None` marks an id that was a gap and is now gone.
#[derive(Debug, Clone)]
pub struct CompactionReport {
    pub question_map: Vec<Option<QuestionId>>,
    pub target_map: Vec<Option<TargetId>>,
}

/// Progress sink for long maintenance operations: `(done, total)`.
pub type ProgressSink<'a> = &'a (dyn Fn(u64, u64) + Sync);

/// The public engine contract.
pub trait QuizEngine: Send + Sync {
    /// Open a fresh quiz with priors initialized from B.
    fn start_quiz(&self) -> EngineResult<QuizId>;
    /// Open a quiz reconstructed from a history of answered questions.
    fn resume_quiz(&self, history: &[AnsweredQuestion]) -> EngineResult<QuizId>;
    /// Select the most informative question to ask next.
    fn next_question(&self, quiz: QuizId) -> EngineResult<QuestionId>;
    /// Record the answer to the pending question.
    fn record_answer(&self, quiz: QuizId, answer: AnswerId) -> EngineResult<()>;
    /// Top-k targets by posterior, probability descending.
    fn list_top_targets(&self, quiz: QuizId, k: usize) -> EngineResult<Vec<RatedTarget>>;
    /// Confirm the quiz's true target and train the KB on its history.
    fn record_quiz_target(&self, quiz: QuizId, target: TargetId) -> EngineResult<()>;
    /// Close a quiz and free its id.
    fn release_quiz(&self, quiz: QuizId) -> EngineResult<()>;

    /// Block until the engine is in `target` mode (draining in-flight ops).
    fn switch_mode(&self, target: EngineMode) -> EngineResult<()>;
    /// Add a question slot (maintenance). Reuses the smallest gap.
    fn add_question(&self) -> EngineResult<QuestionId>;
    /// Add a target slot (maintenance, no quizzes outstanding).
    fn add_target(&self) -> EngineResult<TargetId>;
    /// Gap a question (maintenance).
    fn remove_question(&self, q: QuestionId) -> EngineResult<()>;
    /// Gap a target (maintenance).
    fn remove_target(&self, t: TargetId) -> EngineResult<()>;
    /// Squeeze gapped ids out of the KB (maintenance, no quizzes outstanding).
    fn compact_gaps(&self) -> EngineResult<CompactionReport>;
    /// Persist the KB to `path` (maintenance).
    fn save_kb(&self, path: &Path) -> EngineResult<()>;
    /// Replace the KB from `path` (maintenance, no quizzes outstanding).
    fn load_kb(&self, path: &Path) -> EngineResult<()>;

    fn dims(&self) -> EngineDimensions;
    /// Monotone count of questions handed out by `next_question`.
    fn total_questions_asked(&self) -> u64;
}

/// KB tables plus the id gap trackers they are indexed by, all guarded by
/// one r/w lock.
struct KbState {
    store: KbStore,
    question_gaps: GapTracker,
    target_gaps: GapTracker,
}

/// CPU implementation of [`QuizEngine`].
pub struct CpuEngine {
    mem: MemPool,
    pool: WorkerPool,
    mode: ModeSwitch,
    kb: RwLock<KbState>,
    quizzes: Mutex<QuizRegistry>,
    n_questions_asked: AtomicU64,
    train_amount: f64,
    fatal: OnceLock<String>,
}

impl CpuEngine {
    pub fn new(def: &EngineDefinition) -> EngineResult<Self> {
        def.validate()?;
        if def.precision != Precision::Double {
            return Err(EngineError::NotImplemented(
                "CPU engine for precision other than double".into(),
            ));
        }
        let pool = match def.n_workers {
            Some(n) => WorkerPool::new(n),
            None => WorkerPool::with_default_workers(),
        };
        log::info!(
            "creating CPU engine: {} answers, {} questions, {} targets, α₀ = {}, {} workers",
            def.dims.n_answers,
            def.dims.n_questions,
            def.dims.n_targets,
            def.init_amount,
            pool.n_workers()
        );
        Ok(Self {
            mem: MemPool::new(),
            pool,
            mode: ModeSwitch::new(),
            kb: RwLock::new(KbState {
                store: KbStore::new(def.dims, def.init_amount),
                question_gaps: GapTracker::new_full(def.dims.n_questions),
                target_gaps: GapTracker::new_full(def.dims.n_targets),
            }),
            quizzes: Mutex::new(QuizRegistry::new(def.max_quizzes)),
            n_questions_asked: AtomicU64::new(0),
            train_amount: def.train_amount,
            fatal: OnceLock::new(),
        })
    }

    /// The engine's current mode, `None` while a switch is draining.
    pub fn current_mode(&self) -> Option<EngineMode> {
        self.mode.current()
    }

    /// Number of quizzes currently open.
    pub fn open_quizzes(&self) -> usize {
        self.quizzes.lock().outstanding()
    }

    /// Check the KB mass-table invariants. A violation latches the engine.
    pub fn verify_kb(&self) -> EngineResult<()> {
        self.check_fatal()?;
        let kb = self.kb.read();
        match kb.store.verify(&kb.question_gaps, &kb.target_gaps) {
            Ok(()) => Ok(()),
            Err(detail) => Err(self.escalate(EngineError::Internal(detail))),
        }
    }

    // ------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------

    fn check_fatal(&self) -> EngineResult<()> {
        match self.fatal.get() {
            Some(msg) => Err(EngineError::Internal(msg.clone())),
            None => Ok(()),
        }
    }

    /// Latch internal errors so the whole instance keeps reporting the
    /// first violation; pass every other kind through.
    fn escalate(&self, err: EngineError) -> EngineError {
        if let EngineError::Internal(msg) = &err {
            let stored = self.fatal.get_or_init(|| msg.clone());
            log::error!("engine latched fatal: {stored}");
            EngineError::Internal(stored.clone())
        } else {
            err
        }
    }

    fn regular(&self) -> EngineResult<ModeGuard<'_>> {
        self.mode
            .enter_regular()
            .map_err(|e| EngineError::WrongMode(e.detail()))
    }

    fn maintenance(&self) -> EngineResult<ModeGuard<'_>> {
        self.mode
            .enter_maintenance()
            .map_err(|e| EngineError::WrongMode(e.detail()))
    }

    fn quiz_arc(&self, id: QuizId) -> EngineResult<Arc<Mutex<Quiz>>> {
        self.quizzes.lock().get(id).ok_or(EngineError::InvalidId {
            space: IdSpace::Quiz,
            id,
        })
    }

    fn ctx<'a>(&'a self, kb: &'a KbState) -> KernelCtx<'a> {
        KernelCtx {
            kb: &kb.store,
            question_gaps: &kb.question_gaps,
            target_gaps: &kb.target_gaps,
            pool: &self.pool,
            mem: &self.mem,
        }
    }

    // ------------------------------------------------------------------
    // Maintenance ops with progress reporting
    // ------------------------------------------------------------------

    /// [`QuizEngine::save_kb`] with a progress sink.
    pub fn save_kb_with_progress(
        &self,
        path: &Path,
        progress: Option<ProgressSink<'_>>,
    ) -> EngineResult<()> {
        self.check_fatal()?;
        let _g = self.maintenance()?;
        let kb = self.kb.write();
        persist::save(&kb.store, &kb.question_gaps, &kb.target_gaps, path, progress)
    }

    /// [`QuizEngine::load_kb`] with a progress sink.
    pub fn load_kb_with_progress(
        &self,
        path: &Path,
        progress: Option<ProgressSink<'_>>,
    ) -> EngineResult<()> {
        self.check_fatal()?;
        let _g = self.maintenance()?;
        if self.open_quizzes() > 0 {
            return Err(EngineError::InvalidArgument(
                "cannot load a KB while quizzes are outstanding".into(),
            ));
        }
        let mut kb = self.kb.write();
        let loaded = persist::load(path, progress)?;
        if loaded.store.dims() != kb.store.dims() {
            return Err(EngineError::FormatMismatch(format!(
                "file dimensions {:?} disagree with engine dimensions {:?}",
                loaded.store.dims(),
                kb.store.dims()
            )));
        }
        kb.store = loaded.store;
        kb.question_gaps = loaded.question_gaps;
        kb.target_gaps = loaded.target_gaps;
        Ok(())
    }

    /// [`QuizEngine::compact_gaps`] with a progress sink.
    pub fn compact_gaps_with_progress(
        &self,
        progress: Option<ProgressSink<'_>>,
    ) -> EngineResult<CompactionReport> {
        self.check_fatal()?;
        let _g = self.maintenance()?;
        if self.open_quizzes() > 0 {
            return Err(EngineError::InvalidArgument(
                "cannot compact gaps while quizzes are outstanding".into(),
            ));
        }
        let mut kb = self.kb.write();

        let remap = |gaps: &GapTracker| -> Vec<Option<usize>> {
            let mut next = 0usize;
            (0..gaps.len())
                .map(|id| {
                    if gaps.is_gap(id) {
                        None
                    } else {
                        let new_id = next;
                        next += 1;
                        Some(new_id)
                    }
                })
                .collect()
        };
        let question_map = remap(&kb.question_gaps);
        let target_map = remap(&kb.target_gaps);

        if let Some(report) = progress {
            report(0, 1);
        }
        let compacted = kb.store.compacted(&question_map, &target_map);
        kb.store = compacted;
        kb.question_gaps = GapTracker::new_full(kb.store.dims().n_questions);
        kb.target_gaps = GapTracker::new_full(kb.store.dims().n_targets);
        if let Some(report) = progress {
            report(1, 1);
        }
        log::info!(
            "compacted KB to {} questions, {} targets",
            kb.store.dims().n_questions,
            kb.store.dims().n_targets
        );
        Ok(CompactionReport {
            question_map,
            target_map,
        })
    }
}

impl QuizEngine for CpuEngine {
    fn start_quiz(&self) -> EngineResult<QuizId> {
        self.check_fatal()?;
        let _g = self.regular()?;
        let kb = self.kb.read();
        let (id, quiz_arc) = self.quizzes.lock().create(kb.store.t_stride())?;
        let mut quiz = quiz_arc.lock();
        match infer::init_priors(&self.ctx(&kb), &mut quiz) {
            Ok(()) => Ok(id),
            Err(e) => {
                drop(quiz);
                self.quizzes.lock().release(id);
                Err(self.escalate(e))
            }
        }
    }

    fn resume_quiz(&self, history: &[AnsweredQuestion]) -> EngineResult<QuizId> {
        self.check_fatal()?;
        let _g = self.regular()?;
        let kb = self.kb.read();
        let dims = kb.store.dims();
        for aq in history {
            if aq.question >= dims.n_questions || kb.question_gaps.is_gap(aq.question) {
                return Err(EngineError::InvalidId {
                    space: IdSpace::Question,
                    id: aq.question,
                });
            }
            if aq.answer >= dims.n_answers {
                return Err(EngineError::InvalidId {
                    space: IdSpace::Answer,
                    id: aq.answer,
                });
            }
        }
        let (id, quiz_arc) = self.quizzes.lock().create(kb.store.t_stride())?;
        let mut quiz = quiz_arc.lock();
        match infer::apply_history(&self.ctx(&kb), &mut quiz, history) {
            Ok(()) => {
                for aq in history {
                    quiz.mark_asked(aq.question);
                    quiz.push_history(aq.question, aq.answer);
                }
                Ok(id)
            }
            Err(e) => {
                drop(quiz);
                self.quizzes.lock().release(id);
                Err(self.escalate(e))
            }
        }
    }

    fn next_question(&self, quiz: QuizId) -> EngineResult<QuestionId> {
        self.check_fatal()?;
        let _g = self.regular()?;
        let kb = self.kb.read();
        let quiz_arc = self.quiz_arc(quiz)?;
        let mut quiz = quiz_arc.lock();
        let q = infer::next_question(&self.ctx(&kb), &quiz).map_err(|e| self.escalate(e))?;
        quiz.set_active(q);
        self.n_questions_asked.fetch_add(1, Ordering::Relaxed);
        Ok(q)
    }

    fn record_answer(&self, quiz: QuizId, answer: AnswerId) -> EngineResult<()> {
        self.check_fatal()?;
        let _g = self.regular()?;
        let kb = self.kb.read();
        if answer >= kb.store.dims().n_answers {
            return Err(EngineError::InvalidId {
                space: IdSpace::Answer,
                id: answer,
            });
        }
        let quiz_arc = self.quiz_arc(quiz)?;
        let mut state = quiz_arc.lock();
        let q = state
            .active_question()
            .ok_or(EngineError::NoPendingQuestion(quiz))?;
        infer::apply_answer(&self.ctx(&kb), &mut state, q, answer)
            .map_err(|e| self.escalate(e))?;
        state.mark_asked(q);
        state.push_history(q, answer);
        state.clear_active();
        Ok(())
    }

    fn list_top_targets(&self, quiz: QuizId, k: usize) -> EngineResult<Vec<RatedTarget>> {
        self.check_fatal()?;
        let _g = self.regular()?;
        let kb = self.kb.read();
        let quiz_arc = self.quiz_arc(quiz)?;
        let state = quiz_arc.lock();
        Ok(infer::top_targets(
            &state,
            &kb.target_gaps,
            kb.store.dims().n_targets,
            k,
        ))
    }

    fn record_quiz_target(&self, quiz: QuizId, target: TargetId) -> EngineResult<()> {
        self.check_fatal()?;
        let _g = self.regular()?;
        let kb = self.kb.read();
        if target >= kb.store.dims().n_targets || kb.target_gaps.is_gap(target) {
            return Err(EngineError::InvalidId {
                space: IdSpace::Target,
                id: target,
            });
        }
        let quiz_arc = self.quiz_arc(quiz)?;
        let state = quiz_arc.lock();
        train::apply_quiz(&kb.store, state.history(), target, self.train_amount);
        Ok(())
    }

    fn release_quiz(&self, quiz: QuizId) -> EngineResult<()> {
        self.check_fatal()?;
        let _g = self.regular()?;
        if self.quizzes.lock().release(quiz) {
            Ok(())
        } else {
            Err(EngineError::InvalidId {
                space: IdSpace::Quiz,
                id: quiz,
            })
        }
    }

    fn switch_mode(&self, target: EngineMode) -> EngineResult<()> {
        self.check_fatal()?;
        match self.mode.switch_to(target) {
            Ok(()) => {
                log::info!("engine switched to {target} mode");
                Ok(())
            }
            Err(e) => Err(EngineError::WrongMode(e.detail())),
        }
    }

    fn add_question(&self) -> EngineResult<QuestionId> {
        self.check_fatal()?;
        let _g = self.maintenance()?;
        let mut kb = self.kb.write();
        if let Some(q) = kb.question_gaps.acquire() {
            kb.store.reset_question(q);
            log::debug!("reused gapped question slot {q}");
            return Ok(q);
        }
        let mut dims = kb.store.dims();
        dims.n_questions += 1;
        let grown = kb.store.grown(dims);
        kb.store = grown;
        let q = kb.question_gaps.grow_live();
        log::debug!("grew question space to {}", dims.n_questions);
        Ok(q)
    }

    fn add_target(&self) -> EngineResult<TargetId> {
        self.check_fatal()?;
        let _g = self.maintenance()?;
        if self.open_quizzes() > 0 {
            return Err(EngineError::InvalidArgument(
                "cannot add a target while quizzes are outstanding".into(),
            ));
        }
        let mut kb = self.kb.write();
        if let Some(t) = kb.target_gaps.acquire() {
            kb.store.reset_target(t);
            log::debug!("reused gapped target slot {t}");
            return Ok(t);
        }
        let mut dims = kb.store.dims();
        dims.n_targets += 1;
        let grown = kb.store.grown(dims);
        kb.store = grown;
        let t = kb.target_gaps.grow_live();
        log::debug!("grew target space to {}", dims.n_targets);
        Ok(t)
    }

    fn remove_question(&self, q: QuestionId) -> EngineResult<()> {
        self.check_fatal()?;
        let _g = self.maintenance()?;
        let mut kb = self.kb.write();
        if kb.question_gaps.release(q) {
            Ok(())
        } else {
            Err(EngineError::InvalidId {
                space: IdSpace::Question,
                id: q,
            })
        }
    }

    fn remove_target(&self, t: TargetId) -> EngineResult<()> {
        self.check_fatal()?;
        let _g = self.maintenance()?;
        let mut kb = self.kb.write();
        if kb.target_gaps.release(t) {
            Ok(())
        } else {
            Err(EngineError::InvalidId {
                space: IdSpace::Target,
                id: t,
            })
        }
    }

    fn compact_gaps(&self) -> EngineResult<CompactionReport> {
        self.compact_gaps_with_progress(None)
    }

    fn save_kb(&self, path: &Path) -> EngineResult<()> {
        self.save_kb_with_progress(path, None)
    }

    fn load_kb(&self, path: &Path) -> EngineResult<()> {
        self.load_kb_with_progress(path, None)
    }

    fn dims(&self) -> EngineDimensions {
        self.kb.read().store.dims()
    }

    fn total_questions_asked(&self) -> u64 {
        self.n_questions_asked.load(Ordering::Relaxed)
    }
}

impl Drop for CpuEngine {
    fn drop(&mut self) {
        let drained = self.quizzes.lock().drain();
        if drained > 0 {
            log::warn!("engine dropped with {drained} quizzes still open");
        }
    }
}
