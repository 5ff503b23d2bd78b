//! Mirroring the workload certificate to an output directory.

use crate::cert::Certificate;
use crate::constants::{CERT_CHAIN_FILE, PRIVATE_KEY_FILE, ROOT_CERT_FILE};
use crate::prelude::debug;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;

/// Single writer for the output directory.
///
/// Every file is written to a temporary sibling and renamed into place, so an
/// external watcher never reads a partial file. Writes are serialized.
#[derive(Debug)]
pub(crate) struct DiskWriter {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl DiskWriter {
    pub(crate) fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lock: Mutex::new(()),
        }
    }

    pub(crate) fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes `cert-chain.pem`, `key.pem` and, when present, `root-cert.pem`.
    pub(crate) async fn write(&self, cert: &Certificate) -> io::Result<()> {
        let Some(key) = cert.private_key() else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "root-only resources are not mirrored",
            ));
        };

        let _guard = self.lock.lock().await;
        fs::create_dir_all(&self.dir).await?;

        atomic_write(&self.dir.join(CERT_CHAIN_FILE), cert.cert_chain_pem(), false).await?;
        atomic_write(&self.dir.join(PRIVATE_KEY_FILE), key.as_pem(), true).await?;
        if !cert.root_cert_pem().is_empty() {
            atomic_write(&self.dir.join(ROOT_CERT_FILE), cert.root_cert_pem(), false).await?;
        }

        debug!(
            "Certificate files written: dir={}, not_after={}",
            self.dir.display(),
            cert.not_after()
        );
        Ok(())
    }
}

async fn atomic_write(path: &Path, contents: &[u8], private: bool) -> io::Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.tmp{}", fastrand::u32(..)));

    fs::write(&tmp, contents).await?;
    if private {
        restrict(&tmp).await?;
    }
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}

#[cfg(unix)]
async fn restrict(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await
}

#[cfg(not(unix))]
async fn restrict(_path: &Path) -> io::Result<()> {
    Ok(())
}
