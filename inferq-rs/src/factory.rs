//! Backend factory — the thin layer that picks an engine implementation.

use crate::config::{Backend, EngineDefinition, Precision};
use crate::engine::{CpuEngine, QuizEngine};
use crate::error::{EngineError, EngineResult};

/// Instantiate an engine for `backend`.
///
/// Only the CPU backend with double precision is built; CUDA and grid
/// backends are declared surface and report *not implemented*.
pub fn create_engine(
    backend: Backend,
    def: &EngineDefinition,
) -> EngineResult<Box<dyn QuizEngine>> {
    match backend {
        Backend::Cpu => match def.precision {
            Precision::Double => Ok(Box::new(CpuEngine::new(def)?)),
            Precision::Float => Err(EngineError::NotImplemented(
                "CPU engine for precision other than double".into(),
            )),
        },
        Backend::Cuda => Err(EngineError::NotImplemented("CUDA engine".into())),
        Backend::Grid => Err(EngineError::NotImplemented("grid engine".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineDimensions;

    fn def() -> EngineDefinition {
        EngineDefinition::new(EngineDimensions {
            n_answers: 5,
            n_questions: 4,
            n_targets: 4,
        })
    }

    #[test]
    fn test_cpu_double_builds() {
        assert!(create_engine(Backend::Cpu, &def()).is_ok());
    }

    #[test]
    fn test_unbuilt_backends_report_not_implemented() {
        assert!(matches!(
            create_engine(Backend::Cuda, &def()),
            Err(EngineError::NotImplemented(_))
        ));
        assert!(matches!(
            create_engine(Backend::Grid, &def()),
            Err(EngineError::NotImplemented(_))
        ));
        let mut d = def();
        d.precision = Precision::Float;
        assert!(matches!(
            create_engine(Backend::Cpu, &d),
            Err(EngineError::NotImplemented(_))
        ));
    }
}
