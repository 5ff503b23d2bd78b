//! Reading certificate material from disk.

use crate::cert::error::CertificateError;
use crate::cert::Certificate;
use std::path::{Path, PathBuf};

/// Failure to load certificate material from disk.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum LoadError {
    /// A file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The files were read but do not form valid material.
    #[error("invalid certificate material in {path}: {source}")]
    Invalid {
        /// Certificate file the material was read from.
        path: PathBuf,
        /// Validation error.
        #[source]
        source: CertificateError,
    },
}

impl LoadError {
    /// `true` if the failure is a missing file.
    pub fn is_not_found(&self) -> bool {
        matches!(self, LoadError::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

pub(crate) async fn read_file(path: &Path) -> Result<Vec<u8>, LoadError> {
    tokio::fs::read(path).await.map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Loads a chain, key and optional root bundle into a workload [`Certificate`].
///
/// A missing root file is tolerated only when `root_optional` is set.
pub(crate) async fn load_workload(
    resource_name: &str,
    cert_chain: &Path,
    private_key: &Path,
    root_cert: Option<&Path>,
    root_optional: bool,
) -> Result<Certificate, LoadError> {
    let chain = read_file(cert_chain).await?;
    let key = read_file(private_key).await?;
    let root = match root_cert {
        Some(path) => match read_file(path).await {
            Ok(bytes) => bytes,
            Err(e) if root_optional && e.is_not_found() => Vec::new(),
            Err(e) => return Err(e),
        },
        None => Vec::new(),
    };

    Certificate::from_pem(resource_name, chain, key, root).map_err(|source| LoadError::Invalid {
        path: cert_chain.to_path_buf(),
        source,
    })
}

/// Loads a PEM root bundle into a root-only [`Certificate`].
pub(crate) async fn load_root(resource_name: &str, root_cert: &Path) -> Result<Certificate, LoadError> {
    let root = read_file(root_cert).await?;
    Certificate::root_from_pem(resource_name, root).map_err(|source| LoadError::Invalid {
        path: root_cert.to_path_buf(),
        source,
    })
}
