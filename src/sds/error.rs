use crate::error::ErrorKind;

/// Errors produced by the [`SdsServer`](super::SdsServer).
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SdsError {
    /// The request named no resources.
    #[error("request names no resources")]
    EmptyRequest,

    /// A requested name is neither well-known nor file-backed.
    #[error("unknown secret resource `{0}`")]
    UnknownResource(String),

    /// The rotation manager shut down.
    #[error("secret discovery is shut down")]
    Closed,
}

impl SdsError {
    /// Category of this failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::EmptyRequest | Self::UnknownResource(_) => ErrorKind::Invalid,
            Self::Closed => ErrorKind::Cancelled,
        }
    }
}
