//! `oc`-backed cluster access for tempest-soak.
//!
//! Every cluster operation is one `oc` invocation with its own timeout.
//! Failures are mapped onto [`tempest_soak_core::ClusterError`] so the
//! core can tell retryable problems from terminal ones.

pub mod cluster;
pub mod command;
pub mod parse;

pub use cluster::{OcCluster, DEFAULT_COMMAND_TIMEOUT, DEFAULT_OC_BINARY};
pub use command::{CommandOutput, OcRunner};
