//! Error classification shared by every component.
//!
//! Each module owns its own error enum; [`ErrorKind`] is the coarse category
//! callers branch on (retry, give up, report a timeout).

use crate::auth::AuthError;
use crate::ca::CaError;
use crate::config::ConfigError;
use crate::rotation::RotationError;
use crate::sds::SdsError;
use std::fmt;

/// Coarse category of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The peer rejected the presented credential.
    Unauthenticated,
    /// The peer could not be reached or asked us to come back later.
    Unavailable,
    /// Malformed input, response, or configuration. Retrying will not help.
    Invalid,
    /// A bounded wait expired.
    Timeout,
    /// The operation was abandoned because of shutdown.
    Cancelled,
}

impl ErrorKind {
    /// Returns a stable, low-cardinality label for this kind.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Unavailable => "unavailable",
            Self::Invalid => "invalid",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Classifies a gRPC status code.
///
/// Rejected credentials are `Unauthenticated`; anything that may clear up
/// on its own is `Unavailable` (a peer-side `Cancelled` included, local
/// cancellation never reaches this point); the rest is `Invalid`.
pub(crate) fn status_kind(code: tonic::Code) -> ErrorKind {
    use tonic::Code;
    match code {
        Code::Unauthenticated | Code::PermissionDenied => ErrorKind::Unauthenticated,
        Code::Unavailable
        | Code::DeadlineExceeded
        | Code::ResourceExhausted
        | Code::Aborted
        | Code::Internal
        | Code::Unknown
        | Code::Cancelled => ErrorKind::Unavailable,
        _ => ErrorKind::Invalid,
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Umbrella error returned by the [`Agent`](crate::Agent) facade.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum AgentError {
    /// The configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Rotation manager failure (startup load, first acquisition, shutdown).
    #[error(transparent)]
    Rotation(#[from] RotationError),

    /// SDS failure.
    #[error(transparent)]
    Sds(#[from] SdsError),

    /// Credential selection failure.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// CA failure surfaced directly to the caller.
    #[error(transparent)]
    Ca(#[from] CaError),
}

impl AgentError {
    /// Returns the category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Invalid,
            Self::Rotation(e) => e.kind(),
            Self::Sds(e) => e.kind(),
            Self::Auth(e) => e.kind(),
            Self::Ca(e) => e.kind(),
        }
    }
}
