//! Virtual hosting process.

use std::sync::atomic::{AtomicBool, Ordering};

use devicepilot_app::ports::ProcessLifecycle;
use devicepilot_domain::error::ProcessError;
use tokio_util::sync::CancellationToken;

/// Tracks keep-awake and task-list membership in memory.
///
/// `terminate` cancels [`termination`](Self::termination); the daemon awaits
/// that token to exit its main loop.
pub struct VirtualProcess {
    awake: AtomicBool,
    listed: AtomicBool,
    terminated: CancellationToken,
}

impl Default for VirtualProcess {
    fn default() -> Self {
        Self {
            awake: AtomicBool::new(false),
            listed: AtomicBool::new(true),
            terminated: CancellationToken::new(),
        }
    }
}

impl VirtualProcess {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn termination(&self) -> CancellationToken {
        self.terminated.clone()
    }

    #[must_use]
    pub fn is_awake(&self) -> bool {
        self.awake.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_listed(&self) -> bool {
        self.listed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated.is_cancelled()
    }
}

impl ProcessLifecycle for VirtualProcess {
    fn request_foreground_persistence(&self) -> Result<(), ProcessError> {
        if self.is_terminated() {
            return Err(ProcessError::KeepAwakeUnavailable);
        }
        if !self.awake.swap(true, Ordering::SeqCst) {
            tracing::debug!("keep-awake acquired");
        }
        Ok(())
    }

    fn release(&self) -> Result<(), ProcessError> {
        if self.awake.swap(false, Ordering::SeqCst) {
            tracing::debug!("keep-awake released");
        }
        Ok(())
    }

    fn remove_from_task_list(&self) -> Result<(), ProcessError> {
        self.listed.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn terminate(&self) {
        tracing::info!("virtual process terminating");
        self.terminated.cancel();
    }
}
