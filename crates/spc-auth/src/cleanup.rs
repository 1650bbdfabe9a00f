use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::certificate::Certificate;

/// Platform location of machine-wide cached private keys
pub fn default_machine_key_dir() -> PathBuf {
    if cfg!(windows) {
        let program_data = std::env::var("ProgramData")
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| r"C:\ProgramData".to_string());
        return PathBuf::from(program_data)
            .join("Microsoft")
            .join("Crypto")
            .join("RSA")
            .join("MachineKeys");
    }

    directories::ProjectDirs::from("", "", "spconnect")
        .map(|dirs| dirs.data_dir().join("MachineKeys"))
        .unwrap_or_else(|| std::env::temp_dir().join("spconnect").join("MachineKeys"))
}

/// Best-effort removal of the machine cached copy of a certificate's private key
///
/// Never fails: a certificate without a private key is left alone and any
/// error while deleting is only logged.
pub async fn cleanup_machine_key(certificate: &Certificate, key_dir: &Path) {
    let Some(container) = certificate.key_container_name() else {
        debug!("Certificate {} has no private key, nothing to clean up", certificate.thumbprint());
        return;
    };

    drop(certificate.release_private_key());

    let path = key_dir.join(&container);
    match tokio::fs::remove_file(&path).await {
        Ok(()) => debug!("Removed cached private key {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("No cached private key at {}", path.display());
        }
        Err(e) => warn!("Failed to remove cached private key {}: {}", path.display(), e),
    }
}
