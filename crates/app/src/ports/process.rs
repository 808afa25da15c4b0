//! Hosting-process port: keep-awake, task list and termination.

use devicepilot_domain::error::ProcessError;

pub trait ProcessLifecycle: Send + Sync {
    /// Ask the host to keep the process alive in the foreground.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError`] when the keep-awake resource cannot be acquired.
    fn request_foreground_persistence(&self) -> Result<(), ProcessError>;

    /// Release the keep-awake resource. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError`] when the host rejects the release.
    fn release(&self) -> Result<(), ProcessError>;

    /// Remove the automation surface from the foreground task list.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError`] when the host has no such list or refuses.
    fn remove_from_task_list(&self) -> Result<(), ProcessError>;

    /// Terminate the hosting process.
    fn terminate(&self);
}
