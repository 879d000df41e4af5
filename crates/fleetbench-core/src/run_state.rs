//! Process-wide phase state flags and the phase-boundary check.
//!
//! Signal handlers and the phase timer set these flags; workers poll them at
//! their yield points and the coordinator checks them immediately before and
//! after every phase. Flags are never cleared mid-phase.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use crate::error::RunError;

/// Interrupt and time-limit flags shared by every worker in the process.
#[derive(Debug, Default)]
pub struct SharedPhaseState {
    got_user_interrupt: AtomicBool,
    phase_time_expired: AtomicBool,
}

impl SharedPhaseState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_interrupted(&self) {
        self.got_user_interrupt.store(true, Ordering::Relaxed);
    }

    pub fn is_interrupted(&self) -> bool {
        self.got_user_interrupt.load(Ordering::Relaxed)
    }

    pub fn set_phase_time_expired(&self) {
        self.phase_time_expired.store(true, Ordering::Relaxed);
    }

    pub fn is_phase_time_expired(&self) -> bool {
        self.phase_time_expired.load(Ordering::Relaxed)
    }

    /// Clear the time-limit flag. Called only between phases, when a new
    /// phase is armed; the interrupt flag is never cleared.
    pub fn clear_phase_time_expired(&self) {
        self.phase_time_expired.store(false, Ordering::Relaxed);
    }

    /// Required call-point immediately before and after every phase.
    /// Interrupt takes precedence over time-limit expiry.
    pub fn check_phase_boundary(&self) -> Result<(), RunError> {
        if self.is_interrupted() {
            return Err(RunError::Interrupted);
        }
        if self.is_phase_time_expired() {
            return Err(RunError::TimeLimit);
        }
        Ok(())
    }
}

/// The process-wide instance, reachable from signal handlers. Components
/// take an `Arc` so tests can run with private instances instead.
pub fn process_state() -> Arc<SharedPhaseState> {
    static STATE: OnceLock<Arc<SharedPhaseState>> = OnceLock::new();
    Arc::clone(STATE.get_or_init(|| Arc::new(SharedPhaseState::new())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_check_passes_when_clear() {
        let state = SharedPhaseState::new();
        assert!(state.check_phase_boundary().is_ok());
    }

    #[test]
    fn interrupt_takes_precedence_over_time_limit() {
        let state = SharedPhaseState::new();
        state.set_phase_time_expired();
        state.set_interrupted();
        match state.check_phase_boundary() {
            Err(RunError::Interrupted) => {}
            other => panic!("expected Interrupted, got {:?}", other),
        }
    }

    #[test]
    fn time_limit_reported_when_not_interrupted() {
        let state = SharedPhaseState::new();
        state.set_phase_time_expired();
        match state.check_phase_boundary() {
            Err(RunError::TimeLimit) => {}
            other => panic!("expected TimeLimit, got {:?}", other),
        }
        state.clear_phase_time_expired();
        assert!(state.check_phase_boundary().is_ok());
    }
}
