//! Errors surfaced to the orchestrator.

use stratus_reconcile::{ConvergeError, ProviderError};
use thiserror::Error;

/// Result type used throughout the provisioner.
pub type Result<T> = std::result::Result<T, CloudError>;

/// Every failure a cloud operation can report.
#[derive(Debug, Error)]
pub enum CloudError {
    /// VM creation failed. Callers branch on `ok_to_retry`.
    #[error("{message}")]
    VmCreationFailed { message: String, ok_to_retry: bool },

    #[error("VM `{0}' not found")]
    VmNotFound(String),

    #[error("Disk `{0}' not found")]
    DiskNotFound(String),

    #[error("Disk `{disk_id}' is not attached to instance `{instance_id}'")]
    DiskNotAttached {
        instance_id: String,
        disk_id: String,
    },

    #[error("{0}")]
    NotSupported(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("registry: {0}")]
    Registry(String),

    #[error(transparent)]
    Converge(#[from] ConvergeError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("{0}")]
    Cloud(String),
}

impl CloudError {
    pub fn vm_creation_failed(message: impl Into<String>, ok_to_retry: bool) -> Self {
        Self::VmCreationFailed {
            message: message.into(),
            ok_to_retry,
        }
    }

    pub fn cloud(message: impl Into<String>) -> Self {
        Self::Cloud(message.into())
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Whether the caller may retry the whole operation.
    pub fn ok_to_retry(&self) -> bool {
        matches!(
            self,
            Self::VmCreationFailed {
                ok_to_retry: true,
                ..
            }
        )
    }

    /// Error class name used on the external CPI wire.
    pub fn cpi_type(&self) -> &'static str {
        match self {
            Self::VmCreationFailed { .. } => "Bosh::Clouds::VMCreationFailed",
            Self::VmNotFound(_) => "Bosh::Clouds::VMNotFound",
            Self::DiskNotFound(_) => "Bosh::Clouds::DiskNotFound",
            Self::DiskNotAttached { .. } => "Bosh::Clouds::DiskNotAttached",
            Self::NotSupported(_) => "Bosh::Clouds::NotSupported",
            _ => "Bosh::Clouds::CloudError",
        }
    }
}

impl From<stratus_id::IdError> for CloudError {
    fn from(err: stratus_id::IdError) -> Self {
        Self::InvalidArgument(err.to_string())
    }
}
