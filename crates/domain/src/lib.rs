//! # devicepilot-domain
//!
//! Pure domain model for the devicepilot device-automation engine.
//!
//! ## Responsibilities
//! - Foundational types: typed identifiers, error taxonomy, timestamps
//! - Define the **engine lifecycle** (`EngineState`) and accepted commands
//! - Define **tunnel profiles** and resolver selection
//! - Define **location samples** and the edge-triggered lock state machine
//! - Define **conditioning targets** and the deterministic cycle schedule
//! - Define **automation steps, sequences** and UI tree search
//! - Define **status events** published on the event bus
//!
//! ## Dependency rule
//! This crate has **no internal dependencies**.
//! It must never import anything from `app`, adapters, or external IO crates.
//! All IO boundaries are expressed as traits in the `app` crate (ports).

pub mod error;
pub mod id;
pub mod time;

pub mod automation;
pub mod conditioning;
pub mod engine;
pub mod event;
pub mod location;
pub mod tunnel;
