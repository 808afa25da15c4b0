//! Scripted UI tree: a foreign application reduced to a list of screens.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use devicepilot_app::ports::UiTreeSource;
use devicepilot_domain::automation::{ScrollDirection, UiNode};
use devicepilot_domain::error::AutomationError;

#[derive(Default)]
struct Screens {
    screens: Vec<UiNode>,
    current: usize,
    activated: Vec<UiNode>,
}

/// Serves one screen at a time; activating an interactive node advances to
/// the next screen (the last one stays put).
#[derive(Default)]
pub struct ScriptedUiTree {
    state: Mutex<Screens>,
    scrolls: AtomicUsize,
}

impl ScriptedUiTree {
    #[must_use]
    pub fn new(screens: Vec<UiNode>) -> Self {
        Self {
            state: Mutex::new(Screens {
                screens,
                ..Screens::default()
            }),
            scrolls: AtomicUsize::new(0),
        }
    }

    /// Load screens from a JSON array of [`UiNode`] trees.
    ///
    /// # Errors
    ///
    /// Returns the parse error when `json` is not an array of nodes.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let screens: Vec<UiNode> = serde_json::from_str(json)?;
        Ok(Self::new(screens))
    }

    /// A system permission prompt followed by an in-app consent dialog.
    #[must_use]
    pub fn demo() -> Self {
        Self::new(vec![
            UiNode::default()
                .child(UiNode::text("Allow Maps to access this device's location?"))
                .child(
                    UiNode::interactive()
                        .with_identifier("permission_allow_foreground_only_button")
                        .child(UiNode::text("While using the app")),
                )
                .child(
                    UiNode::interactive()
                        .with_identifier("permission_deny_button")
                        .child(UiNode::text("Don't allow")),
                ),
            UiNode::default()
                .child(UiNode::text("Improve location accuracy?"))
                .child(
                    UiNode::text("Turn on")
                        .with_identifier("button_accept")
                        .clickable(),
                )
                .child(UiNode::text("No thanks").clickable()),
            UiNode::default().child(
                UiNode::text("Map ready")
                    .with_description("map view")
                    .clickable(),
            ),
        ])
    }

    #[must_use]
    pub fn current_screen(&self) -> usize {
        self.lock().current
    }

    #[must_use]
    pub fn activations(&self) -> Vec<UiNode> {
        self.lock().activated.clone()
    }

    #[must_use]
    pub fn scrolls(&self) -> usize {
        self.scrolls.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, Screens> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl UiTreeSource for ScriptedUiTree {
    fn snapshot(&self) -> Result<UiNode, AutomationError> {
        let state = self.lock();
        state
            .screens
            .get(state.current)
            .cloned()
            .ok_or(AutomationError::SnapshotUnavailable)
    }

    fn activate(&self, node: &UiNode) -> Result<(), AutomationError> {
        if !node.interactive {
            return Err(AutomationError::Activation(
                "node is not interactive".into(),
            ));
        }
        let mut state = self.lock();
        state.activated.push(node.clone());
        if state.current + 1 < state.screens.len() {
            state.current += 1;
        }
        tracing::debug!(screen = state.current, "virtual UI advanced");
        Ok(())
    }

    fn scroll(&self, direction: ScrollDirection) -> Result<(), AutomationError> {
        self.scrolls.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(?direction, "virtual UI scrolled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_advance_screen_on_activation() {
        let ui = ScriptedUiTree::demo();
        let first = ui.snapshot().unwrap();
        let hit = first.find_activatable(&["While using"]).unwrap();

        ui.activate(hit.target).unwrap();

        assert_eq!(ui.current_screen(), 1);
        assert_eq!(
            ui.activations()[0].identifier.as_deref(),
            Some("permission_allow_foreground_only_button")
        );
    }

    #[test]
    fn should_stay_on_last_screen() {
        let ui = ScriptedUiTree::new(vec![UiNode::interactive()]);

        ui.activate(&UiNode::interactive()).unwrap();
        ui.activate(&UiNode::interactive()).unwrap();

        assert_eq!(ui.current_screen(), 0);
        assert_eq!(ui.activations().len(), 2);
    }

    #[test]
    fn should_refuse_non_interactive_node() {
        let ui = ScriptedUiTree::demo();

        let result = ui.activate(&UiNode::text("Map ready"));

        assert!(matches!(result, Err(AutomationError::Activation(_))));
        assert_eq!(ui.current_screen(), 0);
    }

    #[test]
    fn should_report_missing_snapshot_when_empty() {
        let ui = ScriptedUiTree::default();
        assert!(matches!(
            ui.snapshot(),
            Err(AutomationError::SnapshotUnavailable)
        ));
    }

    #[test]
    fn should_load_screens_from_json() {
        let json = r#"[
            {"children": [{"text": "Continue", "interactive": true}]},
            {"text": "Done"}
        ]"#;

        let ui = ScriptedUiTree::from_json(json).unwrap();
        let screen = ui.snapshot().unwrap();

        assert!(screen.find_activatable(&["continue"]).is_some());
        ui.scroll(ScrollDirection::Forward).unwrap();
        assert_eq!(ui.scrolls(), 1);
    }
}
