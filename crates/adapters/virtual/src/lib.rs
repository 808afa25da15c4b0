//! # devicepilot-adapter-virtual
//!
//! Simulated collaborators for demonstration and end-to-end testing.
//!
//! ## Provided collaborators
//!
//! | Collaborator | Port | Behaviour |
//! |--------------|------|-----------|
//! | [`VirtualTunnel`] | `TunnelTransport` | Keeps one in-memory session; refuses a second open |
//! | [`VirtualPositioning`] | `PositioningProvider` | Emits fixes whose accuracy converges toward a floor |
//! | [`ScriptedUiTree`] | `UiTreeSource` | Walks through a list of screens, one per activation |
//! | [`VirtualProcess`] | `ProcessLifecycle` | Tracks keep-awake; `terminate` cancels a token |
//!
//! ## Dependency rule
//!
//! Depends on `devicepilot-app` (port traits) and `devicepilot-domain` only.

mod lifecycle;
mod positioning;
mod tunnel;
mod ui;

pub use lifecycle::VirtualProcess;
pub use positioning::{PositioningScript, VirtualPositioning};
pub use tunnel::VirtualTunnel;
pub use ui::ScriptedUiTree;
