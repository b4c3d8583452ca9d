//! Cooperative lifecycle cell shared with the background threads.

use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    Init = 0,
    Running = 1,
    StopRequested = 2,
    Stopped = 3,
}

impl ThreadState {
    fn from_raw(raw: u8) -> ThreadState {
        match raw {
            0 => ThreadState::Init,
            1 => ThreadState::Running,
            2 => ThreadState::StopRequested,
            _ => ThreadState::Stopped,
        }
    }
}

/// Stop is cooperative: the owner requests it, the thread observes it at
/// loop boundaries and marks itself stopped on the way out.
pub struct StateCell(AtomicU8);

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCell {
    pub const fn new() -> Self {
        StateCell(AtomicU8::new(ThreadState::Init as u8))
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::from_raw(self.0.load(Ordering::Acquire))
    }

    /// Transitions Init -> Running; false if the cell moved on already.
    pub fn try_start(&self) -> bool {
        self.0
            .compare_exchange(
                ThreadState::Init as u8,
                ThreadState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Relaxed fast-path check for hot loops; pair with `stop_requested`
    /// (acquire) at iteration boundaries.
    pub fn stop_requested_relaxed(&self) -> bool {
        self.0.load(Ordering::Relaxed) == ThreadState::StopRequested as u8
    }

    pub fn stop_requested(&self) -> bool {
        self.0.load(Ordering::Acquire) == ThreadState::StopRequested as u8
    }

    pub fn request_stop(&self) {
        let mut cur = self.0.load(Ordering::Acquire);
        loop {
            let next = match ThreadState::from_raw(cur) {
                ThreadState::Init => ThreadState::Stopped,
                ThreadState::Running => ThreadState::StopRequested,
                ThreadState::StopRequested | ThreadState::Stopped => return,
            };
            match self.0.compare_exchange_weak(
                cur,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => cur = observed,
            }
        }
    }

    pub fn mark_stopped(&self) {
        self.0.store(ThreadState::Stopped as u8, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self.state(),
            ThreadState::Running | ThreadState::StopRequested
        )
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == ThreadState::Stopped
    }
}

#[cfg(test)]
mod tests {
    use super::{StateCell, ThreadState};

    #[test]
    fn lifecycle_transitions() {
        let cell = StateCell::new();
        assert_eq!(cell.state(), ThreadState::Init);
        assert!(cell.try_start());
        assert!(!cell.try_start());
        assert!(cell.is_running());
        cell.request_stop();
        assert!(cell.stop_requested());
        cell.mark_stopped();
        assert!(cell.is_stopped());
    }

    #[test]
    fn stop_before_start_skips_running() {
        let cell = StateCell::new();
        cell.request_stop();
        assert!(cell.is_stopped());
        assert!(!cell.try_start());
    }
}
