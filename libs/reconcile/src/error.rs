//! Error taxonomy shared by every convergence loop.
//!
//! Provider adapters translate their native failures into [`ProviderError`]
//! before anything in this crate sees them; the loops only ever branch on
//! [`ProviderErrorKind`].

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Closed set of provider conditions the loops know how to treat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderErrorKind {
    /// The resource (or request id) is not visible to the provider.
    NotFound,

    /// The provider asked us to come back later.
    ServiceUnavailable,

    /// Request rate exceeded.
    RateLimited,

    /// A private IP is still held by a just-terminated instance.
    PrivateIpInUse,

    /// A volume is still attached or busy.
    VolumeInUse,

    /// Anything the adapter could not classify.
    Other,
}

impl ProviderErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::ServiceUnavailable => "service_unavailable",
            Self::RateLimited => "rate_limited",
            Self::PrivateIpInUse => "private_ip_in_use",
            Self::VolumeInUse => "volume_in_use",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A provider failure, already classified by the adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct ProviderError {
    kind: ProviderErrorKind,
    message: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::NotFound, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::ServiceUnavailable, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::RateLimited, message)
    }

    pub fn private_ip_in_use(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::PrivateIpInUse, message)
    }

    pub fn volume_in_use(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::VolumeInUse, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Other, message)
    }

    pub fn kind(&self) -> ProviderErrorKind {
        self.kind
    }

    /// The provider's own error text.
    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ProviderErrorKind::NotFound
    }
}

/// Why a wait did not converge.
#[derive(Debug, Error)]
pub enum ConvergeError {
    /// The resource settled somewhere other than the target. Never retried.
    #[error("{resource} reached unexpected state `{observed}', expected `{expected}'")]
    UnexpectedTerminalState {
        resource: String,
        observed: String,
        expected: String,
    },

    /// Attempt budget exhausted.
    #[error("timed out waiting for {resource} after {attempts} attempts ({elapsed:?})")]
    Timeout {
        resource: String,
        attempts: u32,
        elapsed: Duration,
        last_observed: Option<String>,
    },

    /// A provider error the wait was not told to tolerate.
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl ConvergeError {
    /// Returns true for attempt-budget exhaustion.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
