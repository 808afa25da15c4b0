//! Application services: the orchestration core.
//!
//! Each service accepts port implementations via generic parameters
//! (constructor injection), keeping this layer decoupled from concrete adapters.

pub mod dispatcher;
pub mod engine;
pub mod network_conditioner;
pub mod positioning_stabilizer;
pub mod sequence_runner;
pub mod teardown;
pub mod tunnel_manager;
pub mod ui_automation;
