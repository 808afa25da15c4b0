//! UI tree port: snapshot, activate and scroll a foreign application's UI.
//!
//! All methods may block; callers must invoke them off any thread that
//! renders interactive UI.

use devicepilot_domain::automation::{ScrollDirection, UiNode};
use devicepilot_domain::error::AutomationError;

pub trait UiTreeSource: Send + Sync {
    /// Capture the current UI tree.
    ///
    /// # Errors
    ///
    /// Returns [`AutomationError::SnapshotUnavailable`] when no tree can be read.
    fn snapshot(&self) -> Result<UiNode, AutomationError>;

    /// Activate (click) `node`, a node from the most recent snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`AutomationError::Activation`] when the node cannot be activated.
    fn activate(&self, node: &UiNode) -> Result<(), AutomationError>;

    /// Scroll the root container to reveal more content.
    ///
    /// # Errors
    ///
    /// Returns an [`AutomationError`] when the gesture cannot be dispatched.
    fn scroll(&self, direction: ScrollDirection) -> Result<(), AutomationError>;
}
