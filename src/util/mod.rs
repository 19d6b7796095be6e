//! Process-level plumbing shared by the binary and the integration tests.
//!
//! - [`sig_forward`] - Forwarding of received OS signals to the supervised child
//! - [`telemetry`] - `tracing` subscriber setup

pub mod sig_forward;
pub mod telemetry;

pub use sig_forward::*;
pub use telemetry::*;
