use crate::auth::AuthError;
use crate::backoff::Transient;
use crate::error::{status_kind, ErrorKind};

/// Failure of a certificate request.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CaError {
    /// The CA rejected the presented credential.
    #[error("certificate authority rejected credential: {0}")]
    Unauthenticated(String),

    /// The CA could not be reached or asked to retry later.
    #[error("certificate authority unavailable: {0}")]
    Unavailable(String),

    /// Malformed request or response; retrying the same request will not help.
    #[error("invalid certificate exchange: {0}")]
    Invalid(String),

    /// No usable credential could be selected for the request.
    #[error("no credential for certificate authority: {0}")]
    Credential(#[source] AuthError),

    /// Shutdown interrupted the request.
    #[error("certificate request cancelled")]
    Cancelled,
}

impl CaError {
    /// Category of this failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CaError::Unauthenticated(_) => ErrorKind::Unauthenticated,
            CaError::Unavailable(_) => ErrorKind::Unavailable,
            CaError::Invalid(_) => ErrorKind::Invalid,
            CaError::Credential(e) => e.kind(),
            CaError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

impl Transient for CaError {
    fn is_transient(&self) -> bool {
        match self {
            CaError::Unauthenticated(_) | CaError::Unavailable(_) => true,
            CaError::Credential(e) => e.is_transient(),
            CaError::Invalid(_) | CaError::Cancelled => false,
        }
    }
}

impl From<tonic::Status> for CaError {
    fn from(status: tonic::Status) -> Self {
        let message = format!("{}: {}", status.code(), status.message());
        match status_kind(status.code()) {
            ErrorKind::Unauthenticated => CaError::Unauthenticated(message),
            ErrorKind::Unavailable => CaError::Unavailable(message),
            _ => CaError::Invalid(message),
        }
    }
}

impl From<tonic::transport::Error> for CaError {
    fn from(err: tonic::transport::Error) -> Self {
        CaError::Unavailable(err.to_string())
    }
}

impl From<AuthError> for CaError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Cancelled => CaError::Cancelled,
            other => CaError::Credential(other),
        }
    }
}

impl From<rcgen::Error> for CaError {
    fn from(err: rcgen::Error) -> Self {
        CaError::Invalid(format!("CSR generation failed: {err}"))
    }
}
