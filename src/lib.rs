//! Siteplane - a single-host control plane for web sites
//!
//! This library deploys sites onto one host and keeps three things in
//! agreement: the registry of sites, the workloads serving them and the
//! reverse-proxy rules routing their domains.
//! - Sites run either as a supervised process or as a container stack
//! - Each site gets a unique local port from a configured range
//! - Proxy rules are validated before activation and rolled back on failure
//! - Failed deploys are compensated so nothing is left half-wired
//! - Every pipeline step is recorded in an audit log

pub mod audit;
pub mod command;
pub mod config;
pub mod docker;
pub mod error;
pub mod pipeline;
pub mod ports;
pub mod proxy;
pub mod registry;
pub mod site;
pub mod workload;

pub use error::{ErrorKind, PipelineError, Step};
pub use pipeline::Pipeline;

/// Package name for logs and CLI output
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
