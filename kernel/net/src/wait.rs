//! Frame-arrival signal for the network worker.
//!
//! Adapters call [`FrameSignal::notify`] from their receive path; the worker
//! blocks in [`FrameSignal::wait`] with a bounded timeout so housekeeping
//! (delayed-ACK flush, retransmission) still runs on an idle link.
//!
//! The signal is a rendezvous channel with capacity one: any number of
//! notifications between two waits collapse into a single wake-up, and the
//! worker re-checks the pending-frame counter after waking.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use core::time::Duration;
use spin::Mutex;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};

/// Result of a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// At least one notification arrived
    Woken,
    /// Timeout expired without a notification
    TimedOut,
    /// The signal was closed; the worker should exit
    Closed,
}

/// Coalescing wake-up channel between adapters and the worker.
pub struct FrameSignal {
    tx: Mutex<SyncSender<()>>,
    rx: Mutex<Receiver<()>>,
    closed: AtomicBool,
    wakeup_count: AtomicU64,
}

impl FrameSignal {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::sync_channel(1);
        FrameSignal {
            tx: Mutex::new(tx),
            rx: Mutex::new(rx),
            closed: AtomicBool::new(false),
            wakeup_count: AtomicU64::new(0),
        }
    }

    /// Signal that frames may be pending. Never blocks.
    pub fn notify(&self) {
        self.wakeup_count.fetch_add(1, Ordering::Relaxed);
        match self.tx.lock().try_send(()) {
            // A wake-up is already queued; this one folds into it.
            Ok(()) | Err(TrySendError::Full(())) => {}
            Err(TrySendError::Disconnected(())) => {
                self.closed.store(true, Ordering::Release);
            }
        }
    }

    /// Block until notified, closed, or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> WaitOutcome {
        if self.is_closed() {
            return WaitOutcome::Closed;
        }
        let result = self.rx.lock().recv_timeout(timeout);
        match result {
            Ok(()) if self.is_closed() => WaitOutcome::Closed,
            Ok(()) => WaitOutcome::Woken,
            Err(RecvTimeoutError::Timeout) => WaitOutcome::TimedOut,
            Err(RecvTimeoutError::Disconnected) => WaitOutcome::Closed,
        }
    }

    /// Close the signal and wake the worker so it can observe it.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of `notify` calls so far.
    pub fn wakeup_count(&self) -> u64 {
        self.wakeup_count.load(Ordering::Relaxed)
    }
}

impl Default for FrameSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;

    #[test]
    fn test_notifications_coalesce() {
        let signal = FrameSignal::new();
        signal.notify();
        signal.notify();
        signal.notify();
        assert_eq!(signal.wait(Duration::from_millis(10)), WaitOutcome::Woken);
        assert_eq!(signal.wait(Duration::from_millis(10)), WaitOutcome::TimedOut);
        assert_eq!(signal.wakeup_count(), 3);
    }

    #[test]
    fn test_close_wakes_and_sticks() {
        let signal = FrameSignal::new();
        signal.close();
        assert_eq!(signal.wait(Duration::from_secs(5)), WaitOutcome::Closed);
        assert_eq!(signal.wait(Duration::from_secs(5)), WaitOutcome::Closed);
    }

    #[test]
    fn test_wake_from_other_thread() {
        let signal = Arc::new(FrameSignal::new());
        let remote = signal.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.notify();
        });
        assert_eq!(signal.wait(Duration::from_secs(5)), WaitOutcome::Woken);
        handle.join().unwrap();
    }
}
