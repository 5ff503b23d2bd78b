use crate::ca::CaError;
use crate::cert::load::LoadError;
use crate::config::ConfigError;
use crate::error::ErrorKind;
use std::fmt;
use std::time::Duration;

/// Errors surfaced by the [`RotationManager`](super::RotationManager).
///
/// Background renewal never returns these; they reach callers only from
/// construction, an explicit bounded wait, or shutdown.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RotationError {
    /// The configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// File-backed material could not be loaded at startup.
    #[error(transparent)]
    Load(#[from] LoadError),

    /// A certificate request failed permanently.
    #[error(transparent)]
    Ca(#[from] CaError),

    /// The resource name is neither well-known nor a file-backed name.
    #[error("unknown secret resource `{0}`")]
    UnknownResource(String),

    /// A bounded wait for a resource expired.
    #[error("timed out after {timeout:?} waiting for resource `{resource}`")]
    Timeout {
        /// Resource waited for.
        resource: String,
        /// Configured bound.
        timeout: Duration,
    },

    /// The manager has been shut down.
    #[error("rotation manager is closed")]
    Closed,

    /// Background tasks did not stop in time and were aborted.
    #[error("shutdown timeout exceeded; background tasks aborted")]
    ShutdownTimeout,
}

impl RotationError {
    /// Category of this failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) | Self::Load(_) | Self::UnknownResource(_) => ErrorKind::Invalid,
            Self::Ca(e) => e.kind(),
            Self::Timeout { .. } | Self::ShutdownTimeout => ErrorKind::Timeout,
            Self::Closed => ErrorKind::Cancelled,
        }
    }
}

/// Stable, low-cardinality error categories passed to
/// [`MetricsRecorder::record_error`](super::MetricsRecorder::record_error).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum MetricsErrorKind {
    /// The CA rejected the credential.
    CaUnauthenticated,
    /// The CA was unreachable.
    CaUnavailable,
    /// The CA exchange failed permanently.
    CaInvalid,
    /// No token could be derived for the CA.
    Token,
    /// File-backed material failed to load.
    FileLoad,
    /// Mirroring to the output directory failed.
    DiskWrite,
    /// A result was discarded because it was not fresher than the installed value.
    StaleResult,
    /// A background task panicked or could not be joined at shutdown.
    SupervisorJoinFailed,
}

impl MetricsErrorKind {
    /// Returns the label value.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CaUnauthenticated => "ca_unauthenticated",
            Self::CaUnavailable => "ca_unavailable",
            Self::CaInvalid => "ca_invalid",
            Self::Token => "token",
            Self::FileLoad => "file_load",
            Self::DiskWrite => "disk_write",
            Self::StaleResult => "stale_result",
            Self::SupervisorJoinFailed => "supervisor_join_failed",
        }
    }

    pub(crate) fn for_ca(err: &CaError) -> Self {
        match err {
            CaError::Unauthenticated(_) => Self::CaUnauthenticated,
            CaError::Unavailable(_) => Self::CaUnavailable,
            CaError::Credential(crate::auth::AuthError::Token(_)) => Self::Token,
            CaError::Credential(_) => Self::FileLoad,
            _ => Self::CaInvalid,
        }
    }
}

impl fmt::Display for MetricsErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_the_taxonomy() {
        assert_eq!(RotationError::Closed.kind(), ErrorKind::Cancelled);
        assert_eq!(
            RotationError::Timeout {
                resource: "default".into(),
                timeout: Duration::from_secs(1)
            }
            .kind(),
            ErrorKind::Timeout
        );
        assert_eq!(
            RotationError::UnknownResource("bogus".into()).kind(),
            ErrorKind::Invalid
        );
        assert_eq!(
            RotationError::from(CaError::Unavailable("down".into())).kind(),
            ErrorKind::Unavailable
        );
    }

    #[test]
    fn metric_labels_are_stable() {
        assert_eq!(MetricsErrorKind::DiskWrite.to_string(), "disk_write");
        assert_eq!(
            MetricsErrorKind::for_ca(&CaError::Unauthenticated("no".into())),
            MetricsErrorKind::CaUnauthenticated
        );
        assert_eq!(
            MetricsErrorKind::for_ca(&CaError::Invalid("bad".into())),
            MetricsErrorKind::CaInvalid
        );
    }
}
