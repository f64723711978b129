//! Fixed-size key material. All three key types are generated from the
//! operating system CSPRNG, wiped from memory on drop, and redacted from
//! debug output.

use std::fmt;
use std::path::Path;

use anyhow::{Context, Error};
use rand::rngs::OsRng;
use rand::TryRngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use osutils::files;

/// Length in bytes of a disk unlock key.
pub const UNLOCK_KEY_SIZE: usize = 64;

/// Length in bytes of a primary (policy-authorization) key.
pub const PRIMARY_KEY_SIZE: usize = 32;

/// Length in bytes of a recovery key.
pub const RECOVERY_KEY_SIZE: usize = 16;

fn fill_random(buf: &mut [u8]) -> Result<(), Error> {
    // OsRng either fills the whole buffer or errors; short reads cannot
    // happen.
    OsRng
        .try_fill_bytes(buf)
        .context("CSPRNG could not produce key material")
}

/// 64-byte secret used as the LUKS2 volume key input. Never persisted in
/// cleartext outside the kernel keyring or a TPM-sealed payload.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct DiskUnlockKey([u8; UNLOCK_KEY_SIZE]);

impl DiskUnlockKey {
    pub fn generate() -> Result<Self, Error> {
        let mut key = [0u8; UNLOCK_KEY_SIZE];
        fill_random(&mut key)?;
        Ok(DiskUnlockKey(key))
    }

    pub fn from_bytes(bytes: [u8; UNLOCK_KEY_SIZE]) -> Self {
        DiskUnlockKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for DiskUnlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DiskUnlockKey(..)")
    }
}

/// 32-byte secret authorizing PCR-policy updates and model/boot-mode
/// authorization HMACs. Also called the auxiliary key.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct PrimaryKey([u8; PRIMARY_KEY_SIZE]);

impl PrimaryKey {
    pub fn generate() -> Result<Self, Error> {
        let mut key = [0u8; PRIMARY_KEY_SIZE];
        fill_random(&mut key)?;
        Ok(PrimaryKey(key))
    }

    pub fn from_bytes(bytes: [u8; PRIMARY_KEY_SIZE]) -> Self {
        PrimaryKey(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, Error> {
        let key: [u8; PRIMARY_KEY_SIZE] = bytes
            .try_into()
            .ok()
            .context("Primary key must be exactly 32 bytes")?;
        Ok(PrimaryKey(key))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Writes the raw key atomically with mode 0600.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        files::atomic_write_mode(path, 0o600, &self.0)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let data = files::read_exact_file(path, PRIMARY_KEY_SIZE)?;
        Self::from_slice(&data)
    }
}

impl fmt::Debug for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrimaryKey(..)")
    }
}

/// 16-byte last-resort key, presentable to a human as sixteen zero-padded
/// decimal groups.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct RecoveryKey([u8; RECOVERY_KEY_SIZE]);

impl RecoveryKey {
    pub fn generate() -> Result<Self, Error> {
        let mut key = [0u8; RECOVERY_KEY_SIZE];
        fill_random(&mut key)?;
        Ok(RecoveryKey(key))
    }

    pub fn from_bytes(bytes: [u8; RECOVERY_KEY_SIZE]) -> Self {
        RecoveryKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Writes the 16 raw bytes atomically with mode 0600.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        files::atomic_write_mode(path, 0o600, &self.0)
    }

    /// Reads a recovery key file, failing distinguishably when the file is
    /// not exactly 16 bytes.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let data = files::read_exact_file(path, RECOVERY_KEY_SIZE)?;
        let mut key = [0u8; RECOVERY_KEY_SIZE];
        key.copy_from_slice(&data);
        Ok(RecoveryKey(key))
    }

    /// Parses the human form produced by `Display`. Surrounding whitespace
    /// is tolerated.
    pub fn parse(s: &str) -> Result<Self, Error> {
        let groups: Vec<&str> = s.trim().split('-').collect();
        if groups.len() != RECOVERY_KEY_SIZE {
            anyhow::bail!(
                "Recovery key must have {} groups, found {}",
                RECOVERY_KEY_SIZE,
                groups.len()
            );
        }
        let mut key = [0u8; RECOVERY_KEY_SIZE];
        for (i, group) in groups.iter().enumerate() {
            key[i] = group
                .parse::<u8>()
                .with_context(|| format!("Recovery key group '{}' is not a byte value", group))?;
        }
        Ok(RecoveryKey(key))
    }
}

impl fmt::Display for RecoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let groups: Vec<String> = self.0.iter().map(|b| format!("{:03}", b)).collect();
        f.write_str(&groups.join("-"))
    }
}

impl fmt::Debug for RecoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RecoveryKey(..)")
    }
}
