//! UI automation: steps, sequences and the foreign UI tree model.
//!
//! A [`Sequence`] is an ordered, best-effort list of [`SequenceStep`]s.
//! Each step searches the UI tree for one of its candidate labels and
//! activates the nearest interactive ancestor of the match.

mod sequence;
mod step;
mod ui_tree;

pub use sequence::{Precondition, Sequence, SequenceBuilder, SequenceStep};
pub use step::{AutomationStep, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY, ScrollDirection};
pub use ui_tree::{UiMatch, UiNode};
