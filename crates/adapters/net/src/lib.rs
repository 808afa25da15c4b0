//! # devicepilot-adapter-net
//!
//! Real [`RequestClient`](devicepilot_app::ports::RequestClient) used by the
//! network conditioner.
//!
//! | Request | Transport | Success |
//! |---------|-----------|---------|
//! | `Stream` | HTTP(S) via `reqwest`, method from the schedule | any response, status classified by the core |
//! | `Datagram` | one UDP packet to `host:port` | the packet left the socket |
//!
//! ## Dependency rule
//!
//! Depends on `devicepilot-app` (port traits) and `devicepilot-domain` only.

mod client;
mod error;

pub use client::NetRequestClient;
pub use error::NetError;
