//! Runtime error kinds surfaced through the routing and control paths.
//!
//! Configuration problems are a separate family ([`crate::config::ConfigError`])
//! and are fatal at startup only. Process spawn and health-check failures are
//! never surfaced here; they fold into the instance state machine.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// No healthy instance to route to. Surfaced to HTTP clients as a 503,
    /// never fatal to the app.
    #[error("no active instances")]
    NoActiveInstances,

    /// A stop/kill request matched no running instance.
    #[error("instance is not running")]
    InstanceNotRunning,

    /// The internal port range has no free port left.
    #[error("internal port pool exhausted")]
    PortsExhausted,

    /// Spawning the configured command failed. The restart policy retries
    /// on the next reconcile tick while budget remains.
    #[error("failed to spawn process: {0}")]
    Spawn(#[source] anyhow::Error),
}
