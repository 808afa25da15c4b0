//! # devicepilot-app
//!
//! Application layer: orchestration services and **port definitions** (traits).
//!
//! ## Responsibilities
//! - Define **port traits** for the external collaborators:
//!   - `TunnelTransport`: open/close the virtual tunnel
//!   - `PositioningProvider`: subscribe to location updates
//!   - `UiTreeSource`: snapshot, activate and scroll a foreign UI
//!   - `RequestClient`: issue stream requests and datagram probes
//!   - `ProcessLifecycle`: keep-awake, task list, termination
//!   - `StatusSink`: render status events
//! - Provide the orchestration services:
//!   - `EngineStateMachine`: serialized Idle/Starting/Running/Stopping lifecycle
//!   - `TunnelManager`, `PositioningStabilizer`, `NetworkConditioner`
//!   - `UiAutomationController` and `SequenceRunner`
//!   - `TeardownOrchestrator`: staged shutdown
//!   - `CommandDispatcher`: FIFO command intake
//! - Provide **in-process infrastructure** (event bus) that doesn't need IO
//!
//! ## Dependency rule
//! Depends on `devicepilot-domain` only (plus `tokio` for tasks, channels and timers).
//! Never imports adapter crates. Adapters depend on *this* crate, not the reverse.

pub mod event_bus;
pub mod ports;
pub mod services;
