// Synchronization primitives
//
// Fences order submissions across queues: a submission waiting on a fence
// consumes one signal of it, a submission signalling a fence adds one when it
// completes. `SubmissionStatus` is the completion record a command buffer
// shares with the queue executing it.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crate::error::{RhiError, RhiResult};

/// Interval at which blocked queue workers re-check for shutdown.
const SHUTDOWN_POLL: Duration = Duration::from_millis(10);

#[derive(Debug)]
pub struct Fence {
    handle: u64,
    signals: Mutex<u64>,
    cond: Condvar,
    /// Signals promised by submitted but unfinished work.
    outstanding: AtomicU64,
}

impl Fence {
    pub(crate) fn new(handle: u64) -> Self {
        Self {
            handle,
            signals: Mutex::new(0),
            cond: Condvar::new(),
            outstanding: AtomicU64::new(0),
        }
    }

    pub fn native_handle(&self) -> u64 {
        self.handle
    }

    /// Signals not yet consumed by a waiting submission.
    pub fn pending_signals(&self) -> u64 {
        *self.signals.lock()
    }

    pub fn outstanding_signals(&self) -> u64 {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Host-side wait for at least one pending signal; does not consume it.
    pub fn wait_signaled(&self, timeout: Duration) -> bool {
        let mut signals = self.signals.lock();
        if *signals == 0 {
            self.cond.wait_while_for(&mut signals, |s| *s == 0, timeout);
        }
        *signals > 0
    }

    pub(crate) fn reserve_signal(&self) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn signal(&self) {
        let mut signals = self.signals.lock();
        *signals += 1;
        // Saturating: a signal from a dropped submission never reserved one.
        let _ = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        self.cond.notify_all();
    }

    /// Blocks until one signal is available and consumes it. Returns
    /// `Interrupted` once `shutdown` is raised.
    pub(crate) fn consume(&self, shutdown: &AtomicBool) -> RhiResult<()> {
        let mut signals = self.signals.lock();
        while *signals == 0 {
            if shutdown.load(Ordering::Acquire) {
                return Err(RhiError::Interrupted);
            }
            self.cond.wait_for(&mut signals, SHUTDOWN_POLL);
        }
        *signals -= 1;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) enum SubmissionState {
    #[default]
    Idle,
    Executing,
    Completed(RhiResult<()>),
}

#[derive(Debug, Default)]
pub(crate) struct SubmissionStatus {
    state: Mutex<SubmissionState>,
    cond: Condvar,
}

impl SubmissionStatus {
    pub fn is_executing(&self) -> bool {
        *self.state.lock() == SubmissionState::Executing
    }

    pub fn is_idle(&self) -> bool {
        *self.state.lock() == SubmissionState::Idle
    }

    pub fn begin(&self) {
        *self.state.lock() = SubmissionState::Executing;
    }

    pub fn complete(&self, result: RhiResult<()>) {
        *self.state.lock() = SubmissionState::Completed(result);
        self.cond.notify_all();
    }

    pub fn reset(&self) {
        *self.state.lock() = SubmissionState::Idle;
    }

    pub fn wait(&self) {
        let mut state = self.state.lock();
        self.cond
            .wait_while(&mut state, |s| *s == SubmissionState::Executing);
    }

    pub fn result(&self) -> Option<RhiResult<()>> {
        match &*self.state.lock() {
            SubmissionState::Completed(result) => Some(result.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn consume_takes_one_signal() {
        let fence = Fence::new(1);
        let shutdown = AtomicBool::new(false);
        fence.reserve_signal();
        assert_eq!(fence.outstanding_signals(), 1);
        fence.signal();
        fence.signal();
        assert_eq!(fence.outstanding_signals(), 0);
        fence.consume(&shutdown).unwrap();
        assert_eq!(fence.pending_signals(), 1);
    }

    #[test]
    fn consume_wakes_on_signal_from_another_thread() {
        let fence = Arc::new(Fence::new(1));
        let shutdown = AtomicBool::new(false);
        let signaller = {
            let fence = fence.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                fence.signal();
            })
        };
        fence.consume(&shutdown).unwrap();
        signaller.join().unwrap();
        assert_eq!(fence.pending_signals(), 0);
    }

    #[test]
    fn shutdown_interrupts_consume() {
        let fence = Fence::new(1);
        let shutdown = AtomicBool::new(true);
        assert_eq!(fence.consume(&shutdown), Err(RhiError::Interrupted));
    }

    #[test]
    fn status_transitions() {
        let status = SubmissionStatus::default();
        assert!(status.is_idle());
        status.begin();
        assert!(status.is_executing());
        assert_eq!(status.result(), None);
        status.complete(Err(RhiError::Interrupted));
        status.wait();
        assert_eq!(status.result(), Some(Err(RhiError::Interrupted)));
        status.reset();
        assert!(status.is_idle());
    }
}
