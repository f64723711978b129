//! Kernel keyring handoff. Keys live in the user session keyring under
//! names derived from the device's `/dev/disk/by-uuid` path, so later
//! resealing can find them without touching the disk.

use std::path::Path;

use anyhow::Error;
use log::warn;

use crate::keys::{DiskUnlockKey, PrimaryKey};

/// Prefix of every keyring entry this crate creates.
pub const KEYRING_PREFIX: &str = "ubuntu-fde";

/// Keyring name of the unlock key for a device path.
pub fn unlock_key_name(device_path: &Path) -> String {
    format!("{}:{}:unlock", KEYRING_PREFIX, device_path.display())
}

/// Keyring name of the primary (auxiliary) key for a device path.
pub fn aux_key_name(device_path: &Path) -> String {
    format!("{}:{}:aux", KEYRING_PREFIX, device_path.display())
}

/// Installs both keys for `device_path`. Failures are reported to the
/// caller; most call sites warn and carry on, since the keyring is an
/// optimization over file-based recovery.
pub fn put_keys(
    device_path: &Path,
    unlock: &DiskUnlockKey,
    primary: &PrimaryKey,
) -> Result<(), Error> {
    osutils::keyring::add_user_key(&unlock_key_name(device_path), unlock.as_bytes())?;
    osutils::keyring::add_user_key(&aux_key_name(device_path), primary.as_bytes())?;
    Ok(())
}

/// Looks up the primary key by trying `device_path` and then each of its
/// devlinks. Read failures fall through to the next candidate; `None`
/// means file-based recovery is needed.
pub fn find_primary_key(device_path: &Path, devlinks: &[std::path::PathBuf]) -> Option<PrimaryKey> {
    let candidates = std::iter::once(device_path).chain(devlinks.iter().map(|p| p.as_path()));
    for candidate in candidates {
        match osutils::keyring::read_user_key(&aux_key_name(candidate)) {
            Ok(payload) => match PrimaryKey::from_slice(&payload) {
                Ok(key) => return Some(key),
                Err(e) => warn!(
                    "Keyring entry for '{}' has unusable payload: {}",
                    candidate.display(),
                    e
                ),
            },
            Err(_) => continue,
        }
    }
    None
}
