//! Reconciled state snapshots, one JSON file per device

use crate::device::DeviceSnapshot;
use crate::error::ConfigError;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Snapshot file for `address` inside `dir`
#[must_use]
pub fn snapshot_path(dir: &Path, address: u16) -> PathBuf {
    dir.join(format!("device_{address:04x}.json"))
}

async fn read_snapshot(path: &Path) -> Result<Option<DeviceSnapshot>, ConfigError> {
    match fs::read_to_string(path).await {
        Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Saved state for `address`
///
/// Anything unusable (missing, unparsable, or written for another address)
/// yields `None` so the device starts with an empty cache.
pub async fn load_snapshot(dir: &Path, address: u16) -> Option<DeviceSnapshot> {
    let path = snapshot_path(dir, address);
    match read_snapshot(&path).await {
        Ok(Some(snapshot)) if snapshot.address == address => {
            tracing::info!(
                "Restoring {} gangs of {:#06x} from {:?}",
                snapshot.gangs.len(),
                address,
                path
            );
            Some(snapshot)
        }
        Ok(Some(snapshot)) => {
            tracing::warn!(
                "Snapshot {:?} belongs to {:#06x}, not {:#06x}; ignoring",
                path,
                snapshot.address,
                address
            );
            None
        }
        Ok(None) => {
            tracing::debug!("No snapshot for {:#06x}", address);
            None
        }
        Err(e) => {
            tracing::warn!("Discarding snapshot {:?}: {}", path, e);
            None
        }
    }
}

/// Write `snapshot` under `dir`, replacing the previous file in one rename
#[allow(clippy::missing_errors_doc)]
pub async fn save_snapshot(dir: &Path, snapshot: &DeviceSnapshot) -> Result<(), ConfigError> {
    fs::create_dir_all(dir).await?;
    let path = snapshot_path(dir, snapshot.address);
    let staged = path.with_extension("json.tmp");

    fs::write(&staged, serde_json::to_vec_pretty(snapshot)?).await?;
    fs::rename(&staged, &path).await?;

    tracing::trace!("Snapshot of {:#06x} written to {:?}", snapshot.address, path);
    Ok(())
}
