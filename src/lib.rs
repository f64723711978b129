//! Full-disk-encryption key management for measured-boot, image-based
//! systems: building PCR protection profiles from boot load chains,
//! sealing disk unlock keys against them through a TPM 2.0 (or a
//! hook-based protector), managing LUKS2 keyslots across install and
//! factory reset, and activating encrypted volumes at early boot.
//!
//! External engines (the TPM wire protocol, the cryptsetup on-disk
//! format, partition discovery, the hook helper, the preinstall check
//! library) are consumed through traits; production bindings live next to
//! each trait where a CLI wrapper can express them.

pub mod container;
pub mod hooks;
pub mod keydata;
pub mod keyring;
pub mod keys;
pub mod preinstall;
pub mod profile;
pub mod seal;
pub mod tpm;
pub mod unlock;

#[cfg(any(test, feature = "test-utilities"))]
pub mod testutils;
