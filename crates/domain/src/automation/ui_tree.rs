//! Snapshot model of a foreign application's UI tree and label search.

use serde::{Deserialize, Serialize};

/// One node of a UI tree snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UiNode {
    /// Visible text.
    pub text: Option<String>,
    /// Accessible description.
    pub description: Option<String>,
    /// Stable identifier assigned by the foreign application.
    pub identifier: Option<String>,
    /// Whether activating this node does something (clickable).
    pub interactive: bool,
    pub children: Vec<UiNode>,
}

/// Result of a successful search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UiMatch<'a> {
    /// The candidate label that matched.
    pub label: &'a str,
    /// Node whose text, description or identifier contained the label.
    pub matched: &'a UiNode,
    /// Nearest interactive node on the path from `matched` to the root.
    pub target: &'a UiNode,
}

impl UiNode {
    /// Non-interactive node showing `text`.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    /// Interactive container with no text of its own.
    #[must_use]
    pub fn interactive() -> Self {
        Self {
            interactive: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    #[must_use]
    pub fn clickable(mut self) -> Self {
        self.interactive = true;
        self
    }

    #[must_use]
    pub fn child(mut self, child: UiNode) -> Self {
        self.children.push(child);
        self
    }

    /// Case-insensitive substring match on text, description or identifier.
    #[must_use]
    pub fn mentions(&self, label: &str) -> bool {
        let needle = label.to_lowercase();
        [&self.text, &self.description, &self.identifier]
            .into_iter()
            .flatten()
            .any(|value| value.to_lowercase().contains(&needle))
    }

    /// Search for the first candidate label that resolves to an activatable node.
    ///
    /// Labels are tried in order; within a label the tree is walked
    /// depth-first in document order. A match without any interactive node
    /// on its ancestor path is skipped.
    #[must_use]
    pub fn find_activatable<'a, S: AsRef<str>>(&'a self, labels: &'a [S]) -> Option<UiMatch<'a>> {
        labels
            .iter()
            .map(AsRef::<str>::as_ref)
            .filter(|label| !label.trim().is_empty())
            .find_map(|label| {
                let mut path = Vec::new();
                find_in(self, label, &mut path).map(|(matched, target)| UiMatch {
                    label,
                    matched,
                    target,
                })
            })
    }

    /// Total number of nodes in this subtree.
    #[must_use]
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(UiNode::node_count).sum::<usize>()
    }
}

fn find_in<'a>(
    node: &'a UiNode,
    label: &str,
    path: &mut Vec<&'a UiNode>,
) -> Option<(&'a UiNode, &'a UiNode)> {
    path.push(node);
    if node.mentions(label) {
        if let Some(target) = path.iter().rev().find(|n| n.interactive) {
            return Some((node, target));
        }
    }
    for child in &node.children {
        if let Some(found) = find_in(child, label, path) {
            return Some(found);
        }
    }
    path.pop();
    None
}
