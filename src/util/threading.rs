use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Handle to a named background worker. The worker signals completion by
/// dropping its end of the done channel, which lets callers join with a
/// bounded wait instead of blocking on `JoinHandle::join` forever.
pub struct WorkerHandle {
    name: String,
    done_rx: Receiver<()>,
    handle: JoinHandle<()>,
}

pub fn spawn_worker<F>(name: impl Into<String>, f: F) -> Result<WorkerHandle>
where
    F: FnOnce() + Send + 'static,
{
    let name = name.into();
    let (done_tx, done_rx) = bounded::<()>(0);
    let handle = thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            // Moved in so it drops (and signals) even if `f` panics.
            let _done_tx: Sender<()> = done_tx;
            f();
        })
        .map_err(|e| anyhow!("failed to spawn worker '{name}': {e}"))?;

    Ok(WorkerHandle {
        name,
        done_rx,
        handle,
    })
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait up to `timeout` for the worker to finish. Returns false if the
    /// worker is still running, in which case it is left detached.
    pub fn join_timeout(self, timeout: Duration) -> bool {
        match self.done_rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                let _ = self.handle.join();
                true
            }
            Err(RecvTimeoutError::Timeout) => false,
        }
    }

    /// Block until the worker finishes.
    pub fn join(self) {
        let _ = self.done_rx.recv();
        let _ = self.handle.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn joins_finished_worker() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let handle = spawn_worker("test-worker", move || {
            flag.store(true, Ordering::SeqCst);
        })
        .expect("spawn");
        assert!(handle.join_timeout(Duration::from_secs(1)));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn join_timeout_reports_stuck_worker() {
        let (block_tx, block_rx) = bounded::<()>(0);
        let handle = spawn_worker("stuck-worker", move || {
            let _ = block_rx.recv();
        })
        .expect("spawn");
        assert!(!handle.join_timeout(Duration::from_millis(50)));
        drop(block_tx);
    }
}
