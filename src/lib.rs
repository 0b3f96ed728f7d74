//! rollgate - zero-downtime supervisor and reverse proxy for local services
//!
//! rollgate runs each configured app as a supervised child process behind a
//! per-app reverse proxy. New instances warm up on fresh internal ports
//! while the old one keeps serving; traffic cuts over only once the
//! replacement passes its health check, and displaced instances drain their
//! in-flight requests before being reaped. A loopback control API drives
//! rollouts and reports status, with `rollctl` as the command line client.

pub mod app;
pub mod config;
pub mod error;
pub mod instance;
pub mod logger;
pub mod ports;
pub mod process;
pub mod proxy;
pub mod report;
pub mod rpc;
