//! The short-lived install-time container handle. It holds the bootstrap
//! unlock key, mediates enrolment of the long-lived keys, and then
//! destroys the bootstrap slot.

use std::path::{Path, PathBuf};

use log::warn;

use diskseal_api::error::{SealError, SealingError};

use super::{Luks2, TokenWriter, BOOTSTRAP_SLOT_NAME};
use crate::keyring;
use crate::keys::{DiskUnlockKey, PrimaryKey, RecoveryKey};

/// Install-time handle around (device, bootstrap unlock key).
///
/// Exclusively owned by the installer. Once [`remove_bootstrap_key`]
/// succeeds the container is finished: further key additions fail
/// deterministically, while `remove_bootstrap_key` itself stays
/// idempotent.
///
/// [`remove_bootstrap_key`]: BootstrappedContainer::remove_bootstrap_key
pub struct BootstrappedContainer {
    device: PathBuf,
    bootstrap_key: DiskUnlockKey,
    finished: bool,
}

impl BootstrappedContainer {
    pub fn new(device: PathBuf, bootstrap_key: DiskUnlockKey) -> Self {
        BootstrappedContainer {
            device,
            bootstrap_key,
            finished: false,
        }
    }

    pub fn device(&self) -> &Path {
        &self.device
    }

    fn check_not_finished(&self) -> Result<(), SealError> {
        if self.finished {
            return Err(SealError::new(SealingError::ContainerFinished {
                device: self.device.clone(),
            }));
        }
        Ok(())
    }

    /// Enrols a long-lived unlock key under `slot_name`, authorized by the
    /// bootstrap key.
    pub fn add_key(
        &mut self,
        engine: &mut dyn Luks2,
        slot_name: &str,
        new_key: &DiskUnlockKey,
    ) -> Result<(), SealError> {
        self.check_not_finished()?;
        super::add_unlock_key(
            engine,
            &self.device,
            slot_name,
            self.bootstrap_key.as_bytes(),
            new_key.as_bytes(),
        )
    }

    /// Enrols a recovery key under `slot_name`.
    pub fn add_recovery_key(
        &mut self,
        engine: &mut dyn Luks2,
        slot_name: &str,
        recovery_key: &RecoveryKey,
    ) -> Result<(), SealError> {
        self.check_not_finished()?;
        super::add_recovery_key(
            engine,
            &self.device,
            slot_name,
            self.bootstrap_key.as_bytes(),
            recovery_key,
        )
    }

    /// Returns a writer for the key data token of `slot_name`.
    pub fn get_token_writer(&self, slot_name: &str) -> TokenWriter {
        TokenWriter::new(&self.device, slot_name)
    }

    /// Publishes both keys to the kernel keyring under the device's
    /// by-uuid path. Keyring failures only warn: the keyring is an
    /// optimization, not a requirement.
    pub fn register_keys_as_used(&self, primary: &PrimaryKey, unlock: &DiskUnlockKey) {
        let by_uuid = match osutils::devlinks::by_uuid_path(&self.device) {
            Ok(path) => path,
            Err(e) => {
                warn!(
                    "Not registering keys for '{}': {}",
                    self.device.display(),
                    e
                );
                return;
            }
        };
        if let Err(e) = keyring::put_keys(&by_uuid, unlock, primary) {
            warn!(
                "Could not register keys for '{}' in the kernel keyring: {}",
                by_uuid.display(),
                e
            );
        }
    }

    /// Deletes the bootstrap slot and marks the container finished.
    /// Calling it again is a no-op.
    pub fn remove_bootstrap_key(&mut self, engine: &mut dyn Luks2) -> Result<(), SealError> {
        if self.finished {
            return Ok(());
        }
        match super::delete_slot(engine, &self.device, BOOTSTRAP_SLOT_NAME) {
            Ok(()) => {}
            Err(e) if e.tag() == "slot-missing" => {
                // Already gone, e.g. after a partially completed install.
            }
            Err(e) => return Err(e),
        }
        self.finished = true;
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl Drop for BootstrappedContainer {
    fn drop(&mut self) {
        if !self.finished {
            warn!(
                "Dropping unfinished bootstrapped container for '{}'; the bootstrap slot is still live",
                self.device.display()
            );
        }
    }
}
