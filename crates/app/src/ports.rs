//! Port definitions: traits that adapters implement.
//!
//! Ports are the boundaries between the application core and the external
//! collaborators (tunnel transport, positioning provider, UI tree, request
//! client, hosting process). They are defined here (in `app`) so that both
//! the services and the adapters can depend on them without creating
//! circular dependencies.

pub mod event_bus;
pub mod positioning;
pub mod process;
pub mod request_client;
pub mod tunnel;
pub mod ui_tree;

pub use event_bus::{EventPublisher, StatusSink};
pub use positioning::{PositioningProvider, UpdateStream};
pub use process::ProcessLifecycle;
pub use request_client::RequestClient;
pub use tunnel::TunnelTransport;
pub use ui_tree::UiTreeSource;
