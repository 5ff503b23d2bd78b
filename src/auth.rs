//! Per-connection credential selection.
//!
//! [`Authenticator::credential_for`] decides, on every call, whether an
//! outbound connection presents a client certificate or a bearer token:
//!
//! | source        | CA target                         | control-plane target               |
//! |---------------|-----------------------------------|------------------------------------|
//! | file-backed   | not contacted                     | mTLS, mounted files                |
//! | provisioned   | mTLS, provisioned → issued → bearer | mTLS, provisioned → issued → bearer |
//! | CA-issued     | bearer                            | mTLS with issued cert, else bearer |
//!
//! Files are re-read on every call so externally replaced material is picked up.

use crate::backoff::{
    next_backoff, sleep_or_cancel, ErrorKey, ErrorTracker, ReconnectConfig,
    MAX_CONSECUTIVE_SAME_ERROR,
};
use crate::cert::load::{load_workload, LoadError};
use crate::cert::Certificate;
use crate::constants::WORKLOAD_RESOURCE;
use crate::error::{status_kind, ErrorKind};
use crate::prelude::{debug, warn};
use crate::source::CredentialSource;
use crate::token::{AuthToken, TokenError, TokenProvider};
use arc_swap::ArcSwapOption;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

/// Who the outbound connection is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthTarget {
    /// The certificate authority (CSR signing).
    CertificateAuthority,
    /// The control plane (configuration discovery).
    ControlPlane,
}

/// Where a client certificate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityOrigin {
    /// Mounted certificate files.
    FileMounted,
    /// Pre-provisioned directory.
    Provisioned,
    /// Most recent certificate issued by the CA.
    CaIssued,
}

/// A client certificate and key to present during the TLS handshake.
#[derive(Clone, Debug)]
pub struct ClientIdentity {
    certificate: Arc<Certificate>,
    origin: IdentityOrigin,
}

impl ClientIdentity {
    /// Wraps workload material.
    pub fn new(certificate: Arc<Certificate>, origin: IdentityOrigin) -> Self {
        Self {
            certificate,
            origin,
        }
    }

    /// The underlying material.
    pub fn certificate(&self) -> &Arc<Certificate> {
        &self.certificate
    }

    /// Where the material came from.
    pub fn origin(&self) -> IdentityOrigin {
        self.origin
    }

    /// PEM certificate chain.
    pub fn cert_chain_pem(&self) -> &[u8] {
        self.certificate.cert_chain_pem()
    }

    /// PEM private key.
    pub fn private_key_pem(&self) -> &[u8] {
        self.certificate
            .private_key()
            .map(|k| k.as_pem())
            .unwrap_or_default()
    }
}

/// The credential attached to one outbound connection.
#[derive(Clone, Debug)]
pub enum CallCredential {
    /// Present a client certificate.
    Mtls(ClientIdentity),
    /// Send `authorization: Bearer <token>`.
    Bearer(AuthToken),
}

impl CallCredential {
    /// `true` for [`CallCredential::Mtls`].
    pub fn is_mtls(&self) -> bool {
        matches!(self, CallCredential::Mtls(_))
    }

    /// Short label for logs.
    pub fn describe(&self) -> &'static str {
        match self {
            CallCredential::Mtls(id) => match id.origin() {
                IdentityOrigin::FileMounted => "mtls(file-mounted)",
                IdentityOrigin::Provisioned => "mtls(provisioned)",
                IdentityOrigin::CaIssued => "mtls(ca-issued)",
            },
            CallCredential::Bearer(_) => "bearer",
        }
    }
}

/// Failure of one connection attempt, as reported by the caller of
/// [`Authenticator::with_credential_retry`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConnectError {
    /// The peer rejected the credential.
    #[error("peer rejected credential: {0}")]
    Unauthenticated(String),
    /// The peer could not be reached.
    #[error("peer unavailable: {0}")]
    Unavailable(String),
    /// Anything retrying will not fix.
    #[error("connection failed: {0}")]
    Fatal(String),
}

impl ConnectError {
    /// Category of this failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConnectError::Unauthenticated(_) => ErrorKind::Unauthenticated,
            ConnectError::Unavailable(_) => ErrorKind::Unavailable,
            ConnectError::Fatal(_) => ErrorKind::Invalid,
        }
    }
}

impl From<tonic::Status> for ConnectError {
    fn from(status: tonic::Status) -> Self {
        let message = status.message().to_owned();
        match status_kind(status.code()) {
            ErrorKind::Unauthenticated => ConnectError::Unauthenticated(message),
            ErrorKind::Unavailable => ConnectError::Unavailable(message),
            _ => ConnectError::Fatal(format!("{}: {message}", status.code())),
        }
    }
}

/// Credential selection failure.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum AuthError {
    /// File-mounted deployments never talk to the CA.
    #[error("certificate authority is not used with file-mounted certificates")]
    CaNotUsed,

    /// Mounted material could not be loaded.
    #[error(transparent)]
    Material(#[from] LoadError),

    /// No token could be derived.
    #[error(transparent)]
    Token(#[from] TokenError),

    /// The connection attempt failed permanently.
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// Shutdown interrupted the operation.
    #[error("operation cancelled")]
    Cancelled,
}

impl AuthError {
    /// Category of this failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AuthError::CaNotUsed | AuthError::Material(_) => ErrorKind::Invalid,
            AuthError::Token(e) => e.kind(),
            AuthError::Connect(e) => e.kind(),
            AuthError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// `true` if a later attempt with a freshly selected credential may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            AuthError::Token(e) => e.is_retryable(),
            AuthError::Connect(e) => !matches!(e, ConnectError::Fatal(_)),
            AuthError::CaNotUsed | AuthError::Material(_) | AuthError::Cancelled => false,
        }
    }
}

/// Chooses the credential for every outbound connection.
pub struct Authenticator {
    source: CredentialSource,
    tokens: TokenProvider,
    issued: ArcSwapOption<Certificate>,
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authenticator")
            .field("source", &self.source)
            .field("tokens", &self.tokens)
            .field("issued", &self.issued.load_full().map(|c| c.not_after()))
            .finish()
    }
}

impl Authenticator {
    /// Builds a selector for `source`.
    pub fn new(source: CredentialSource, tokens: TokenProvider) -> Self {
        Self {
            source,
            tokens,
            issued: ArcSwapOption::empty(),
        }
    }

    /// The resolved credential source.
    pub fn source(&self) -> &CredentialSource {
        &self.source
    }

    /// The most recent CA-issued workload certificate, if any.
    pub fn latest_issued(&self) -> Option<Arc<Certificate>> {
        self.issued.load_full()
    }

    /// Records a newly installed CA-issued workload certificate.
    pub(crate) fn publish_issued(&self, certificate: Arc<Certificate>) {
        self.issued.store(Some(certificate));
    }

    /// Selects the credential for a connection to `target`.
    ///
    /// # Errors
    ///
    /// - [`AuthError::CaNotUsed`] for the CA target with file-mounted certificates.
    /// - [`AuthError::Material`] if mounted files cannot be loaded.
    /// - [`AuthError::Token`] if a bearer token is needed and cannot be derived.
    pub async fn credential_for(&self, target: AuthTarget) -> Result<CallCredential, AuthError> {
        match (&self.source, target) {
            (CredentialSource::FileBacked(_), AuthTarget::CertificateAuthority) => {
                Err(AuthError::CaNotUsed)
            }
            (CredentialSource::FileBacked(paths), AuthTarget::ControlPlane) => {
                let cert = load_workload(
                    WORKLOAD_RESOURCE,
                    &paths.cert_chain,
                    &paths.private_key,
                    Some(&paths.root_cert),
                    false,
                )
                .await?;
                Ok(CallCredential::Mtls(ClientIdentity::new(
                    Arc::new(cert),
                    IdentityOrigin::FileMounted,
                )))
            }
            (CredentialSource::ProvisionedBacked(dir), _) => {
                match load_workload(
                    WORKLOAD_RESOURCE,
                    &dir.cert_chain_path(),
                    &dir.private_key_path(),
                    Some(&dir.root_cert_path()),
                    true,
                )
                .await
                {
                    Ok(cert) if !cert.is_expired_at(OffsetDateTime::now_utc()) => {
                        return Ok(CallCredential::Mtls(ClientIdentity::new(
                            Arc::new(cert),
                            IdentityOrigin::Provisioned,
                        )));
                    }
                    Ok(_) => debug!(
                        "Provisioned certificate in {} has expired; falling back",
                        dir.path().display()
                    ),
                    Err(_e) => debug!(
                        "Provisioned certificate unavailable; falling back: error={}",
                        _e
                    ),
                }
                self.issued_or_bearer().await
            }
            (CredentialSource::CaIssued, AuthTarget::CertificateAuthority) => self.bearer().await,
            (CredentialSource::CaIssued, AuthTarget::ControlPlane) => {
                self.issued_or_bearer().await
            }
        }
    }

    /// Derives a fresh bearer credential.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Token`] if the token cannot be derived.
    pub async fn bearer(&self) -> Result<CallCredential, AuthError> {
        Ok(CallCredential::Bearer(self.tokens.token().await?))
    }

    async fn issued_or_bearer(&self) -> Result<CallCredential, AuthError> {
        let now = OffsetDateTime::now_utc();
        match self.latest_issued() {
            Some(cert) if !cert.is_expired_at(now) => Ok(CallCredential::Mtls(
                ClientIdentity::new(cert, IdentityOrigin::CaIssued),
            )),
            _ => self.bearer().await,
        }
    }

    /// Runs `connect` until it succeeds, reselecting the credential before every attempt.
    ///
    /// Rejected credentials and unreachable peers are retried with backoff;
    /// fatal connection errors and permanent credential errors are returned.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Cancelled`] if `cancel` fires, or the first
    /// non-transient [`AuthError`].
    pub async fn with_credential_retry<T, F, Fut>(
        &self,
        target: AuthTarget,
        reconnect: ReconnectConfig,
        cancel: &CancellationToken,
        mut connect: F,
    ) -> Result<T, AuthError>
    where
        F: FnMut(CallCredential) -> Fut,
        Fut: Future<Output = Result<T, ConnectError>>,
    {
        let reconnect = reconnect.normalize();
        let mut backoff = reconnect.min_backoff;
        let mut tracker = ErrorTracker::new(MAX_CONSECUTIVE_SAME_ERROR);

        loop {
            if cancel.is_cancelled() {
                return Err(AuthError::Cancelled);
            }

            let attempt = async {
                let credential = self.credential_for(target).await?;
                let _label = credential.describe();
                connect(credential).await.map_err(|e| {
                    debug!("Connection attempt with {} credential failed", _label);
                    AuthError::Connect(e)
                })
            };

            let result = tokio::select! {
                () = cancel.cancelled() => return Err(AuthError::Cancelled),
                result = attempt => result,
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => {
                    if tracker.record_error(ErrorKey::Connect) {
                        warn!(
                            "Connection to {:?} failed; retrying: error={}, backoff_ms={}",
                            target,
                            e,
                            backoff.as_millis()
                        );
                    } else {
                        debug!(
                            "Connection to {:?} failed (repeated); retrying: error={}, consecutive_failures={}",
                            target,
                            e,
                            tracker.consecutive_count()
                        );
                    }
                    if sleep_or_cancel(cancel, backoff).await {
                        return Err(AuthError::Cancelled);
                    }
                    backoff = next_backoff(backoff, reconnect.max_backoff);
                }
            }
        }
    }
}
