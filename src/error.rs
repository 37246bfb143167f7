//! Error types for the VM pool

use thiserror::Error;

use crate::models::VmAction;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Insufficient capacity: {0}")]
    InsufficientCapacity(String),

    #[error("Unable to release VM {vm} as it is busy")]
    BusyResource { vm: String },

    #[error("Missing network info: {0}")]
    MissingNetworkInfo(String),

    #[error("Provisioning failed: {0}")]
    Provisioning(String),

    #[error("SSH error: {0}")]
    Ssh(String),

    #[error("Timed out waiting for pool action {desired}, last observed action {last}")]
    Timeout { desired: VmAction, last: VmAction },

    #[error("Remote pool agent error: {0}")]
    Remote(String),

    #[error("VM pool not found: {0}")]
    PoolNotFound(String),

    #[error("No server with a name or ID: {0} exists")]
    ServerNotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Pool store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Errors that may clear up if the caller tries again later
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::BusyResource { .. } | Error::Timeout { .. })
    }

    /// Wrap a failed remote step as a provisioning failure naming the VM
    pub fn ssh_step(step: &str, vm: &str, err: Error) -> Self {
        Error::Provisioning(format!("{} on vm {}: {}", step, vm, err))
    }
}
