//! Provisioning-engine and version-control backends for stackgate.
//!
//! This crate implements the execution layer: the pluggable `Provisioner`
//! trait with a Terraform backend driven as an external process, the
//! `SourceControl` trait with a git backend, in-process mock backends for
//! tests, and the `OutputSink` adapter that streams human-readable progress.

pub mod mock;
pub mod output;
pub mod provisioner;
pub mod terraform;
pub mod vcs;

pub use mock::{MockProvisioner, MockSourceControl, RecordedRun};
pub use output::{CaptureSink, OutputSink, PrefixedSink, TracingSink};
pub use provisioner::{select_provisioner, Invocation, Provisioner};
pub use terraform::TerraformProvisioner;
pub use vcs::{select_vcs, GitClient, SourceControl};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("backend '{0}' is not available on this system")]
    BackendUnavailable(String),
    #[error("provisioning engine failed: {0}")]
    ExecFailed(String),
    #[error("version control failed: {0}")]
    VcsFailed(String),
    #[error("invalid invocation: {0}")]
    InvalidInvocation(String),
    #[error("state store error: {0}")]
    Store(#[from] stackgate_store::StoreError),
}
