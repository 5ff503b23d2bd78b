use crate::constants::{
    FILE_CERT_PREFIX, FILE_CERT_SEPARATOR, FILE_ROOT_PREFIX, ROOT_RESOURCE, WORKLOAD_RESOURCE,
};
use std::path::PathBuf;

/// A parsed secret resource name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceName {
    /// `default`: the workload certificate.
    Workload,
    /// `ROOTCA`: the root bundle.
    Root,
    /// `file-cert:<chain>~<key>`: a certificate and key read from disk.
    FileCert {
        /// Certificate chain path.
        cert_chain: PathBuf,
        /// Private key path.
        private_key: PathBuf,
    },
    /// `file-root:<root>`: a root bundle read from disk.
    FileRoot(PathBuf),
}

impl ResourceName {
    /// Parses a resource name, returning `None` for unknown names.
    pub fn parse(name: &str) -> Option<Self> {
        if name == WORKLOAD_RESOURCE {
            return Some(Self::Workload);
        }
        if name == ROOT_RESOURCE {
            return Some(Self::Root);
        }
        if let Some(rest) = name.strip_prefix(FILE_CERT_PREFIX) {
            let (chain, key) = rest.split_once(FILE_CERT_SEPARATOR)?;
            if chain.is_empty() || key.is_empty() {
                return None;
            }
            return Some(Self::FileCert {
                cert_chain: PathBuf::from(chain),
                private_key: PathBuf::from(key),
            });
        }
        if let Some(root) = name.strip_prefix(FILE_ROOT_PREFIX) {
            if root.is_empty() {
                return None;
            }
            return Some(Self::FileRoot(PathBuf::from(root)));
        }
        None
    }

    /// `true` for names backed by files rather than the CA.
    pub fn is_file_backed(&self) -> bool {
        matches!(self, Self::FileCert { .. } | Self::FileRoot(_))
    }
}
