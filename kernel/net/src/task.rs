//! The network worker.
//!
//! One thread runs the dispatch loop for a [`NetworkStack`]:
//!
//! 1. flush delayed ACKs
//! 2. one retransmission pass
//! 3. no frame pending: wait on the frame signal for at most `idle_timeout`
//!    and start over
//! 4. otherwise dequeue one frame into the scratch buffer and process it
//!
//! The loop exits once shutdown is requested.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use std::thread::{self, JoinHandle};

use crate::stack::{NetworkStack, ProcessResult};
use crate::wait::WaitOutcome;

const WORKER_THREAD_NAME: &str = "NetworkTask";

/// Worker start-up failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("a network worker is already running for this stack")]
    AlreadyRunning,
    #[error("failed to spawn the network worker thread")]
    SpawnFailed,
}

/// Handle to a running worker. Dropping it shuts the worker down.
pub struct NetworkTask {
    stack: Arc<NetworkStack>,
    handle: Option<JoinHandle<()>>,
}

impl NetworkTask {
    /// Start the worker thread for `stack`.
    pub fn spawn(stack: Arc<NetworkStack>) -> Result<NetworkTask, TaskError> {
        if !stack.claim_worker() {
            return Err(TaskError::AlreadyRunning);
        }

        let worker_stack = stack.clone();
        let handle = thread::Builder::new()
            .name(String::from(WORKER_THREAD_NAME))
            .spawn(move || {
                run(&worker_stack);
                worker_stack.release_worker();
            })
            .map_err(|e| {
                klog!(Error, "net: worker spawn failed: {}", e);
                stack.release_worker();
                TaskError::SpawnFailed
            })?;

        Ok(NetworkTask {
            stack,
            handle: Some(handle),
        })
    }

    pub fn stack(&self) -> &Arc<NetworkStack> {
        &self.stack
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Request termination, wake the worker and wait for it to exit.
    pub fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.stack.request_shutdown();
        if handle.join().is_err() {
            klog!(Error, "net: worker panicked");
        }
    }
}

impl Drop for NetworkTask {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The dispatch loop.
fn run(stack: &NetworkStack) {
    klog_always!("net: {} started", WORKER_THREAD_NAME);
    let mut scratch = vec![0u8; stack.config().scratch_buffer_size];

    while !stack.is_shutting_down() {
        stack.flush_delayed_acks();
        stack.retransmit_pass();

        let Some((adapter, len, timestamp)) = stack.dequeue_frame(&mut scratch) else {
            if stack.signal().wait(stack.config().idle_timeout) == WaitOutcome::Closed {
                break;
            }
            continue;
        };

        match stack.process_frame(adapter.as_ref(), &scratch[..len], timestamp) {
            ProcessResult::Dropped(reason) => {
                klog!(Trace, "net: frame from {} dropped: {:?}", adapter.name(), reason)
            }
            ProcessResult::Handled | ProcessResult::Replied => {}
        }
    }
    klog_always!("net: {} stopped", WORKER_THREAD_NAME);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::StackConfig;
    use crate::time::ManualClock;
    use core::time::Duration;

    fn quick_stack() -> Arc<NetworkStack> {
        let config = StackConfig {
            idle_timeout: Duration::from_millis(10),
            ..StackConfig::default()
        };
        NetworkStack::new(config, Arc::new(ManualClock::new(0)))
    }

    #[test]
    fn test_spawn_and_shutdown() {
        let stack = quick_stack();
        let mut task = NetworkTask::spawn(stack.clone()).unwrap();
        assert!(!task.is_finished());
        task.shutdown();
        assert!(task.is_finished());
        assert!(stack.is_shutting_down());
    }

    #[test]
    fn test_second_worker_rejected() {
        let stack = quick_stack();
        let _task = NetworkTask::spawn(stack.clone()).unwrap();
        assert_eq!(
            NetworkTask::spawn(stack).err(),
            Some(TaskError::AlreadyRunning)
        );
    }
}
