//! Agent configuration.
//!
//! [`CredentialConfig`] is deserialized once (every field has a default) and
//! treated as read-only afterwards. Call [`CredentialConfig::normalized`] at the
//! construction boundary and [`CredentialConfig::validate`] before use; the
//! rotation manager builder does both.

use crate::backoff::ReconnectConfig;
use crate::ca::KeyAlgorithm;
use crate::identity::{IdentityError, SpiffeId, TrustDomain};
use crate::source::FileMountedPaths;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_TRUST_DOMAIN: &str = "cluster.local";
const DEFAULT_NAMESPACE: &str = "default";
const DEFAULT_SERVICE_ACCOUNT: &str = "default";
const DEFAULT_GRACE_RATIO: f64 = 0.5;
const DEFAULT_CERT_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_SDS_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_CA_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Inputs that select and drive the credential source.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct CredentialConfig {
    /// Serve certificates mounted on disk instead of requesting them.
    pub file_mounted_certs: bool,
    /// Mounted certificate chain (used when `file_mounted_certs` is set).
    pub file_cert_chain: Option<PathBuf>,
    /// Mounted private key (used when `file_mounted_certs` is set).
    pub file_private_key: Option<PathBuf>,
    /// Mounted root bundle (used when `file_mounted_certs` is set).
    pub file_root_cert: Option<PathBuf>,

    /// Directory probed for `cert-chain.pem`, `key.pem` and `root-cert.pem`
    /// (conventionally `/etc/certs`). When all three files exist there, they
    /// are served as if `file_mounted_certs` were set. `None` disables the lookup.
    pub well_known_cert_dir: Option<PathBuf>,

    /// Directory holding pre-provisioned `cert-chain.pem`, `key.pem` and
    /// `root-cert.pem`, used to authenticate to the CA and the control plane.
    pub provisioned_cert_dir: Option<PathBuf>,

    /// Trust domain of the workload identity.
    pub trust_domain: String,
    /// Workload namespace.
    pub namespace: String,
    /// Workload service account.
    pub service_account: String,

    /// CA address, e.g. `https://istiod.istio-system.svc:15012`.
    pub ca_endpoint: Option<String>,
    /// PEM root used to verify the CA; also served as `ROOTCA` when the CA
    /// returns a bare leaf.
    pub ca_root_cert: Option<PathBuf>,
    /// TLS server name to verify on the CA connection, if it differs from the
    /// endpoint host.
    pub ca_tls_server_name: Option<String>,
    /// Per-call deadline on CA requests.
    pub ca_request_timeout: Duration,

    /// File holding the platform JWT. Re-read before every CSR attempt.
    pub jwt_path: Option<PathBuf>,

    /// Fraction of the validity window that must remain when renewal starts.
    ///
    /// `1.0` renews right away, values near `0.0` renew just before expiry.
    /// Clamped to `[0, 1]` on normalization.
    pub grace_ratio: f64,

    /// Directory the workload certificate is mirrored to after every rotation.
    pub output_dir: Option<PathBuf>,

    /// Requested certificate lifetime.
    pub cert_ttl: Duration,
    /// Key type generated for every CSR.
    pub key_algorithm: KeyAlgorithm,

    /// Bounded wait for the first workload certificate. `None` leaves the
    /// decision to the caller of `wait_ready`.
    pub initial_fetch_timeout: Option<Duration>,

    /// How long an SDS request waits for a not-yet-available resource.
    pub sds_request_timeout: Duration,

    /// Retry pacing for CA requests and file reloads.
    pub reconnect: ReconnectConfig,

    /// Upper bound on graceful shutdown before background tasks are aborted.
    pub shutdown_timeout: Option<Duration>,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            file_mounted_certs: false,
            file_cert_chain: None,
            file_private_key: None,
            file_root_cert: None,
            well_known_cert_dir: None,
            provisioned_cert_dir: None,
            trust_domain: DEFAULT_TRUST_DOMAIN.to_owned(),
            namespace: DEFAULT_NAMESPACE.to_owned(),
            service_account: DEFAULT_SERVICE_ACCOUNT.to_owned(),
            ca_endpoint: None,
            ca_root_cert: None,
            ca_tls_server_name: None,
            ca_request_timeout: DEFAULT_CA_REQUEST_TIMEOUT,
            jwt_path: None,
            grace_ratio: DEFAULT_GRACE_RATIO,
            output_dir: None,
            cert_ttl: DEFAULT_CERT_TTL,
            key_algorithm: KeyAlgorithm::default(),
            initial_fetch_timeout: None,
            sds_request_timeout: DEFAULT_SDS_REQUEST_TIMEOUT,
            reconnect: ReconnectConfig::default(),
            shutdown_timeout: Some(DEFAULT_SHUTDOWN_TIMEOUT),
        }
    }
}

/// Configuration rejected at startup.
#[derive(Debug, thiserror::Error, PartialEq)]
#[non_exhaustive]
pub enum ConfigError {
    /// `file_mounted_certs` is set but a path is missing.
    #[error("file mounted certs enabled but `{0}` is not set")]
    MissingFilePath(&'static str),

    /// The workload identity cannot be formed.
    #[error("invalid workload identity: {0}")]
    Identity(#[from] IdentityError),

    /// A CA-backed source has no CA endpoint.
    #[error("certificate authority endpoint is required for CA-issued certificates")]
    MissingCaEndpoint,

    /// The CA endpoint is not a valid URI.
    #[error("invalid certificate authority endpoint `{endpoint}`: {reason}")]
    InvalidCaEndpoint {
        /// Offending endpoint.
        endpoint: String,
        /// Parser message.
        reason: String,
    },

    /// The CA root file could not be read.
    #[error("cannot read certificate authority root {path}: {reason}")]
    UnreadableCaRoot {
        /// Configured path.
        path: PathBuf,
        /// I/O message.
        reason: String,
    },
    /// Zero TTL requested.
    #[error("certificate TTL must be non-zero")]
    ZeroTtl,
}

impl CredentialConfig {
    /// Returns a copy with backoff bounds ordered and the grace ratio clamped.
    ///
    /// A NaN grace ratio falls back to the default.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.reconnect = self.reconnect.normalize();
        self.grace_ratio = if self.grace_ratio.is_nan() {
            DEFAULT_GRACE_RATIO
        } else {
            self.grace_ratio.clamp(0.0, 1.0)
        };
        self
    }

    /// Checks the settings that do not depend on the environment.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] for incomplete file-mounted settings, an
    /// invalid identity, or a zero TTL.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.file_mounted_certs {
            if self.file_cert_chain.is_none() {
                return Err(ConfigError::MissingFilePath("file_cert_chain"));
            }
            if self.file_private_key.is_none() {
                return Err(ConfigError::MissingFilePath("file_private_key"));
            }
            if self.file_root_cert.is_none() {
                return Err(ConfigError::MissingFilePath("file_root_cert"));
            }
        }
        if self.cert_ttl.is_zero() {
            return Err(ConfigError::ZeroTtl);
        }
        self.workload_identity()?;
        Ok(())
    }

    /// The identity requested in every CSR.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Identity`] if the trust domain, namespace or
    /// service account is not a valid SPIFFE component.
    pub fn workload_identity(&self) -> Result<SpiffeId, ConfigError> {
        let td = TrustDomain::new(&self.trust_domain)?;
        Ok(SpiffeId::for_workload(
            &td,
            &self.namespace,
            &self.service_account,
        )?)
    }

    /// The mounted file set, when `file_mounted_certs` is set with all three paths.
    pub fn file_mounted_paths(&self) -> Option<FileMountedPaths> {
        if !self.file_mounted_certs {
            return None;
        }
        Some(FileMountedPaths {
            cert_chain: self.file_cert_chain.clone()?,
            private_key: self.file_private_key.clone()?,
            root_cert: self.file_root_cert.clone()?,
        })
    }
}
