//! Sidecar lifecycle coordinator for service-mesh pods.
//!
//! `scuttle` wraps a command running next to a mesh proxy (Envoy / Istio `pilot-agent`).
//! It holds the command back until the proxy is ready, relays OS signals to it while it
//! runs, and once it exits stops the proxy so the pod can complete.
//!
//! # Modules
//!
//! - [`config`] - Environment-driven configuration and the command line.
//! - [`endpoint`] - Single-shot HTTP calls against proxy and companion endpoints.
//! - [`retry`] - Backoff curve and deadline used while polling for readiness.
//! - [`readiness`] - The readiness gate run before the command starts.
//! - [`supervisor`] - Spawning and waiting for the wrapped command.
//! - [`shutdown`] - Deciding how to stop the proxy and doing it.
//! - [`run`] - The driver tying the phases together.
//! - [`util`] - Signal forwarding and logging setup.

pub mod config;
pub mod endpoint;
pub mod readiness;
pub mod retry;
pub mod run;
pub mod shutdown;
pub mod supervisor;
pub mod util;
