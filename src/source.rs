//! Credential source resolution.
//!
//! Every other component matches on [`CredentialSource`] instead of
//! re-inspecting the configuration.

use crate::config::CredentialConfig;
use crate::constants::{
    CERT_CHAIN_FILE, FILE_CERT_PREFIX, FILE_CERT_SEPARATOR, FILE_ROOT_PREFIX, PRIVATE_KEY_FILE,
    ROOT_CERT_FILE,
};
use std::path::{Path, PathBuf};

/// Where the workload certificate comes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CredentialSource {
    /// Certificates mounted on disk; the CA is never contacted.
    FileBacked(FileMountedPaths),
    /// Pre-provisioned material authenticates the agent; the workload
    /// certificate is still CA-issued.
    ProvisionedBacked(ProvisionedDir),
    /// The CA issues the workload certificate against a platform token.
    CaIssued,
}

impl CredentialSource {
    /// `true` if the workload certificate is requested from the CA.
    pub fn requires_ca(&self) -> bool {
        !matches!(self, CredentialSource::FileBacked(_))
    }

    /// Short label for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialSource::FileBacked(_) => "file-backed",
            CredentialSource::ProvisionedBacked(_) => "provisioned",
            CredentialSource::CaIssued => "ca-issued",
        }
    }
}

/// Selects the credential source for `config`.
///
/// Precedence: file-mounted certificates (flag plus all three paths), then a
/// complete set of files in the well-known directory, then a pre-provisioned
/// directory, then CA issuance.
pub fn resolve(config: &CredentialConfig) -> CredentialSource {
    if let Some(paths) = config.file_mounted_paths() {
        return CredentialSource::FileBacked(paths);
    }
    if let Some(paths) = config.well_known_cert_dir.as_deref().and_then(detect_mounted) {
        return CredentialSource::FileBacked(paths);
    }
    if let Some(dir) = &config.provisioned_cert_dir {
        return CredentialSource::ProvisionedBacked(ProvisionedDir::new(dir.clone()));
    }
    CredentialSource::CaIssued
}

/// Returns the standard file set in `dir` if all three files exist.
fn detect_mounted(dir: &Path) -> Option<FileMountedPaths> {
    let layout = ProvisionedDir::new(dir);
    let paths = FileMountedPaths {
        cert_chain: layout.cert_chain_path(),
        private_key: layout.private_key_path(),
        root_cert: layout.root_cert_path(),
    };
    [&paths.cert_chain, &paths.private_key, &paths.root_cert]
        .iter()
        .all(|path| path.is_file())
        .then_some(paths)
}

/// Paths of file-mounted certificate material.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FileMountedPaths {
    /// PEM certificate chain.
    pub cert_chain: PathBuf,
    /// PEM private key.
    pub private_key: PathBuf,
    /// PEM root bundle.
    pub root_cert: PathBuf,
}

impl FileMountedPaths {
    /// SDS name of the certificate/key pair: `file-cert:<chain>~<key>`.
    pub fn cert_resource_name(&self) -> String {
        file_cert_resource_name(&self.cert_chain, &self.private_key)
    }

    /// SDS name of the root bundle: `file-root:<root>`.
    pub fn root_resource_name(&self) -> String {
        file_root_resource_name(&self.root_cert)
    }
}

/// Formats a `file-cert:` resource name.
pub fn file_cert_resource_name(cert_chain: &Path, private_key: &Path) -> String {
    format!(
        "{FILE_CERT_PREFIX}{}{FILE_CERT_SEPARATOR}{}",
        cert_chain.display(),
        private_key.display()
    )
}

/// Formats a `file-root:` resource name.
pub fn file_root_resource_name(root_cert: &Path) -> String {
    format!("{FILE_ROOT_PREFIX}{}", root_cert.display())
}

/// A directory laid out with `cert-chain.pem`, `key.pem` and `root-cert.pem`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProvisionedDir {
    dir: PathBuf,
}

impl ProvisionedDir {
    /// Wraps `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The directory itself.
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// `<dir>/cert-chain.pem`
    pub fn cert_chain_path(&self) -> PathBuf {
        self.dir.join(CERT_CHAIN_FILE)
    }

    /// `<dir>/key.pem`
    pub fn private_key_path(&self) -> PathBuf {
        self.dir.join(PRIVATE_KEY_FILE)
    }

    /// `<dir>/root-cert.pem`
    pub fn root_cert_path(&self) -> PathBuf {
        self.dir.join(ROOT_CERT_FILE)
    }
}
