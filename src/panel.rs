//! Operator control surface
//!
//! The CPU state variable with its condition variable, plus the operator
//! key register. The front panel (or a debugger) requests state transitions
//! here; the CPU loop observes them. The interrupt controller pokes the
//! condition variable so a CPU blocked in STOP or WAIT re-evaluates.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Condvar, Mutex};

/// CPU execution states. Exactly one is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuState {
    /// Powered off; the CPU loop exits
    Off,
    /// Executing instructions
    Run,
    /// Stopped, waiting for the operator
    Stop,
    /// Idle until an interrupt arrives (HLT)
    Wait,
    /// Execute a single instruction, then stop
    Cycle,
    /// Master clear, then run (MCL or operator)
    ClearMaster,
    /// Operator clear, then stop
    ClearOperator,
    /// Binary load in progress
    BinLoad,
}

/// State cell + condition variable + operator keys.
pub struct ControlPanel {
    state: Mutex<CpuState>,
    cond: Condvar,
    keys: AtomicU16,
}

impl ControlPanel {
    pub fn new(keys: u16) -> Self {
        Self {
            state: Mutex::new(CpuState::Off),
            cond: Condvar::new(),
            keys: AtomicU16::new(keys),
        }
    }

    /// Atomically transition to `to` provided the current state equals
    /// `from` (or `from` is `None`, meaning "from any state"). Broadcasts
    /// on success. Returns whether the transition happened.
    pub fn request_state(&self, to: CpuState, from: Option<CpuState>) -> bool {
        let mut state = self.state.lock().unwrap();
        if from.is_none() || Some(*state) == from {
            *state = to;
            self.cond.notify_all();
            true
        } else {
            false
        }
    }

    /// Current state.
    pub fn state(&self) -> CpuState {
        *self.state.lock().unwrap()
    }

    /// Wake anything blocked on the state cell without changing it.
    /// Called by the interrupt controller on every `set()`.
    pub fn notify(&self) {
        let _guard = self.state.lock().unwrap();
        self.cond.notify_all();
    }

    /// Operator key register.
    pub fn set_keys(&self, kb: u16) {
        self.keys.store(kb, Ordering::Relaxed);
    }

    pub fn keys(&self) -> u16 {
        self.keys.load(Ordering::Relaxed)
    }

    /// Block while the state stays STOP; returns the state that ended the
    /// wait.
    pub(crate) fn wait_while_stopped(&self) -> CpuState {
        let mut state = self.state.lock().unwrap();
        while *state == CpuState::Stop {
            state = self.cond.wait(state).unwrap();
        }
        *state
    }

    /// Block while the state stays WAIT and `ready` is false. If the wait
    /// ends with the state still WAIT (an interrupt became deliverable),
    /// transition to RUN.
    pub(crate) fn wait_while_idle(&self, ready: impl Fn() -> bool) {
        let mut state = self.state.lock().unwrap();
        while *state == CpuState::Wait && !ready() {
            state = self.cond.wait(state).unwrap();
        }
        if *state == CpuState::Wait {
            *state = CpuState::Run;
            self.cond.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_request_state_precondition() {
        let p = ControlPanel::new(0);
        assert_eq!(p.state(), CpuState::Off);
        // wrong precondition: no transition
        assert!(!p.request_state(CpuState::Run, Some(CpuState::Stop)));
        assert_eq!(p.state(), CpuState::Off);
        // any-state transition
        assert!(p.request_state(CpuState::Stop, None));
        assert_eq!(p.state(), CpuState::Stop);
        // exact precondition
        assert!(p.request_state(CpuState::Run, Some(CpuState::Stop)));
        assert_eq!(p.state(), CpuState::Run);
    }

    #[test]
    fn test_keys() {
        let p = ControlPanel::new(0x1234);
        assert_eq!(p.keys(), 0x1234);
        p.set_keys(0xBEEF);
        assert_eq!(p.keys(), 0xBEEF);
    }

    #[test]
    fn test_wait_while_stopped_wakes() {
        let p = Arc::new(ControlPanel::new(0));
        p.request_state(CpuState::Stop, None);
        let panel = Arc::clone(&p);
        let handle = thread::spawn(move || panel.wait_while_stopped());
        thread::sleep(Duration::from_millis(20));
        p.request_state(CpuState::Run, Some(CpuState::Stop));
        assert_eq!(handle.join().unwrap(), CpuState::Run);
    }

    #[test]
    fn test_wait_while_idle_takes_run_on_ready() {
        let p = Arc::new(ControlPanel::new(0));
        p.request_state(CpuState::Wait, None);
        let panel = Arc::clone(&p);
        let ready = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ready2 = Arc::clone(&ready);
        let handle = thread::spawn(move || {
            panel.wait_while_idle(|| ready2.load(Ordering::Relaxed));
        });
        thread::sleep(Duration::from_millis(20));
        ready.store(true, Ordering::Relaxed);
        p.notify();
        handle.join().unwrap();
        assert_eq!(p.state(), CpuState::Run);
    }
}
