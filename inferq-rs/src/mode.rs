//! Mode switch — regular ↔ maintenance coordination.
//!
//! Three states over one mutex and condvar:
//!
//! | State         | Regular ops           | Structural ops        |
//! |---------------|-----------------------|-----------------------|
//! | Regular       | permitted, concurrent | rejected (wrong mode) |
//! | Transitioning | rejected              | rejected              |
//! | Maintenance   | rejected (wrong mode) | permitted, serialized |
//!
//! `switch_to(target)` blocks until every in-flight guard of the departing
//! mode has dropped. The switch sits *above* the KB r/w lock and the quiz
//! registry mutex in the lock order; guards are acquired before either.

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

/// Publicly visible engine mode (the transitioning state is internal).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineMode {
    Regular,
    Maintenance,
}

impl std::fmt::Display for EngineMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineMode::Regular => f.write_str("regular"),
            EngineMode::Maintenance => f.write_str("maintenance"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Regular,
    Transitioning,
    Maintenance,
}

struct Inner {
    state: State,
    n_active: usize,
}

/// Why a guard could not be taken or a switch not performed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ModeError {
    /// The engine is in the named mode and the operation needs the other.
    Wrong(&'static str),
    /// `switch_to` was asked for the mode the engine is already in.
    AlreadyThere(EngineMode),
}

impl ModeError {
    pub fn detail(&self) -> String {
        match self {
            ModeError::Wrong(actual) => format!("engine is in {actual} mode"),
            ModeError::AlreadyThere(mode) => format!("already in {mode} mode"),
        }
    }
}

/// Drops decrement the in-flight count and wake a pending switch.
pub(crate) struct ModeGuard<'a> {
    switch: &'a ModeSwitch,
}

impl Drop for ModeGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.switch.inner.lock();
        inner.n_active -= 1;
        if inner.n_active == 0 {
            self.switch.cond.notify_all();
        }
    }
}

/// Tri-state regular/maintenance coordinator.
pub(crate) struct ModeSwitch {
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl ModeSwitch {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: State::Regular,
                n_active: 0,
            }),
            cond: Condvar::new(),
        }
    }

    /// Claim a slot for a regular operation (quiz, training).
    pub fn enter_regular(&self) -> Result<ModeGuard<'_>, ModeError> {
        let mut inner = self.inner.lock();
        match inner.state {
            State::Regular => {
                inner.n_active += 1;
                Ok(ModeGuard { switch: self })
            }
            State::Transitioning => Err(ModeError::Wrong("a transitioning")),
            State::Maintenance => Err(ModeError::Wrong("maintenance")),
        }
    }

    /// Claim a slot for a structural operation.
    pub fn enter_maintenance(&self) -> Result<ModeGuard<'_>, ModeError> {
        let mut inner = self.inner.lock();
        match inner.state {
            State::Maintenance => {
                inner.n_active += 1;
                Ok(ModeGuard { switch: self })
            }
            State::Transitioning => Err(ModeError::Wrong("a transitioning")),
            State::Regular => Err(ModeError::Wrong("regular")),
        }
    }

    /// Block until the engine is in `target` mode.
    ///
    /// Waits out a concurrent transition, then drains the in-flight guards
    /// of the departing mode before flipping the state.
    pub fn switch_to(&self, target: EngineMode) -> Result<(), ModeError> {
        let mut inner = self.inner.lock();
        loop {
            match inner.state {
                State::Transitioning => self.cond.wait(&mut inner),
                State::Regular if target == EngineMode::Regular => {
                    return Err(ModeError::AlreadyThere(target));
                }
                State::Maintenance if target == EngineMode::Maintenance => {
                    return Err(ModeError::AlreadyThere(target));
                }
                _ => break,
            }
        }
        inner.state = State::Transitioning;
        while inner.n_active > 0 {
            self.cond.wait(&mut inner);
        }
        inner.state = match target {
            EngineMode::Regular => State::Regular,
            EngineMode::Maintenance => State::Maintenance,
        };
        self.cond.notify_all();
        Ok(())
    }

    pub fn current(&self) -> Option<EngineMode> {
        match self.inner.lock().state {
            State::Regular => Some(EngineMode::Regular),
            State::Maintenance => Some(EngineMode::Maintenance),
            State::Transitioning => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_starts_regular() {
        let sw = ModeSwitch::new();
        assert_eq!(sw.current(), Some(EngineMode::Regular));
        assert!(sw.enter_regular().is_ok());
        assert!(matches!(
            sw.enter_maintenance(),
            Err(ModeError::Wrong("regular"))
        ));
    }

    #[test]
    fn test_switch_flips_permissions() {
        let sw = ModeSwitch::new();
        sw.switch_to(EngineMode::Maintenance).unwrap();
        assert!(sw.enter_regular().is_err());
        assert!(sw.enter_maintenance().is_ok());
        sw.switch_to(EngineMode::Regular).unwrap();
        assert!(sw.enter_regular().is_ok());
    }

    #[test]
    fn test_switch_to_current_mode() {
        let sw = ModeSwitch::new();
        assert!(matches!(
            sw.switch_to(EngineMode::Regular),
            Err(ModeError::AlreadyThere(EngineMode::Regular))
        ));
    }

    #[test]
    fn test_switch_waits_for_in_flight_guards() {
        let sw = Arc::new(ModeSwitch::new());
        let released = Arc::new(AtomicBool::new(false));

        let guard_sw = Arc::clone(&sw);
        let guard_released = Arc::clone(&released);
        let holder = std::thread::spawn(move || {
            let guard = guard_sw.enter_regular().unwrap();
            std::thread::sleep(Duration::from_millis(50));
            guard_released.store(true, Ordering::SeqCst);
            drop(guard);
        });

        // Give the holder time to take its guard.
        std::thread::sleep(Duration::from_millis(10));
        sw.switch_to(EngineMode::Maintenance).unwrap();
        assert!(
            released.load(Ordering::SeqCst),
            "switch returned before the in-flight guard dropped"
        );
        holder.join().unwrap();
    }
}
