//! LUKS2 container management. The on-disk format engine is consumed
//! through the [`Luks2`] trait; this module owns the naming layer on top:
//! per-slot tokens carrying a slot name, a slot kind, and optionally a
//! key data record.

pub mod bootstrap;
pub mod cryptsetup;

use std::path::{Path, PathBuf};

use anyhow::Error;
use log::debug;
use serde::{Deserialize, Serialize};

use diskseal_api::error::{DiskError, InternalError, ReportError, SealError, SlotError};

use crate::keydata::KeyData;
use crate::keys::RecoveryKey;

/// Token type tag for slots managed by this crate.
pub const TOKEN_TYPE: &str = "ubuntu-fde";

/// Name of the install-time bootstrap slot created by `format_container`.
pub const BOOTSTRAP_SLOT_NAME: &str = "bootstrap-key";

/// Formatting options for new containers.
#[derive(Debug, Clone, Default)]
pub struct FormatOptions {
    pub inline_crypto_engine: bool,
}

/// Whether a named slot holds a regular unlock key or a recovery key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SlotKind {
    Unlock,
    Recovery,
}

/// The JSON document stored in a LUKS2 token for one named slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotToken {
    #[serde(rename = "type")]
    pub token_type: String,
    /// LUKS2 requires keyslot references as strings.
    pub keyslots: Vec<String>,
    pub name: String,
    pub kind: SlotKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<KeyData>,
}

impl SlotToken {
    pub fn new(name: &str, kind: SlotKind, keyslot: u32, data: Option<KeyData>) -> Self {
        SlotToken {
            token_type: TOKEN_TYPE.to_string(),
            keyslots: vec![keyslot.to_string()],
            name: name.to_string(),
            kind,
            data,
        }
    }

    pub fn keyslot(&self) -> Result<u32, Error> {
        let slot = self
            .keyslots
            .first()
            .ok_or_else(|| anyhow::anyhow!("Token '{}' references no keyslots", self.name))?;
        slot.parse()
            .map_err(|_| anyhow::anyhow!("Token '{}' has malformed keyslot '{}'", self.name, slot))
    }
}

/// Native rename support is optional in LUKS2 engines; `Unsupported` makes
/// the manager fall back to copy-then-remove.
#[derive(Debug)]
pub enum NativeRenameError {
    Unsupported,
    Other(Error),
}

/// The consumed LUKS2 engine surface.
pub trait Luks2 {
    fn format(
        &mut self,
        device: &Path,
        label: &str,
        key: &[u8],
        opts: &FormatOptions,
    ) -> Result<(), Error>;

    /// Adds a keyslot authorized by `existing_key` and returns its number.
    fn add_key(&mut self, device: &Path, existing_key: &[u8], new_key: &[u8])
        -> Result<u32, Error>;

    fn kill_slot(&mut self, device: &Path, keyslot: u32) -> Result<(), Error>;

    /// Tests a key against the container, optionally pinned to one
    /// keyslot.
    fn verify_key(&self, device: &Path, key: &[u8], keyslot: Option<u32>) -> Result<bool, Error>;

    /// All tokens of this crate's type, with their token ids.
    fn tokens(&self, device: &Path) -> Result<Vec<(u32, SlotToken)>, Error>;

    fn import_token(
        &mut self,
        device: &Path,
        token: &SlotToken,
        replace_id: Option<u32>,
    ) -> Result<(), Error>;

    fn remove_token(&mut self, device: &Path, token_id: u32) -> Result<(), Error>;

    fn rename_token(
        &mut self,
        device: &Path,
        old: &str,
        new: &str,
    ) -> Result<(), NativeRenameError>;

    fn is_luks2(&self, device: &Path) -> bool;
}

fn engine_error() -> InternalError {
    InternalError::Internal("LUKS2 engine operation failed")
}

fn find_token(
    engine: &dyn Luks2,
    device: &Path,
    slot_name: &str,
) -> Result<Option<(u32, SlotToken)>, SealError> {
    let tokens = engine.tokens(device).structured(engine_error())?;
    Ok(tokens.into_iter().find(|(_, t)| t.name == slot_name))
}

fn slot_names(engine: &dyn Luks2, device: &Path) -> Result<Vec<String>, SealError> {
    let tokens = engine.tokens(device).structured(engine_error())?;
    Ok(tokens.into_iter().map(|(_, t)| t.name).collect())
}

/// Formats `device` as a LUKS2 container bound to `key` and names the
/// initial keyslot `bootstrap-key`.
pub fn format_container(
    engine: &mut dyn Luks2,
    device: &Path,
    label: &str,
    key: &[u8],
    opts: &FormatOptions,
) -> Result<(), SealError> {
    engine
        .format(device, label, key, opts)
        .structured(engine_error())?;
    let token = SlotToken::new(BOOTSTRAP_SLOT_NAME, SlotKind::Unlock, 0, None);
    engine
        .import_token(device, &token, None)
        .structured(engine_error())
}

fn add_named_key(
    engine: &mut dyn Luks2,
    device: &Path,
    slot_name: &str,
    kind: SlotKind,
    existing_key: &[u8],
    new_key: &[u8],
) -> Result<(), SealError> {
    if find_token(engine, device, slot_name)?.is_some() {
        return Err(SealError::new(SlotError::SlotExists {
            name: slot_name.to_string(),
        }));
    }
    let keyslot = engine
        .add_key(device, existing_key, new_key)
        .structured(engine_error())?;
    let token = SlotToken::new(slot_name, kind, keyslot, None);
    engine
        .import_token(device, &token, None)
        .structured(engine_error())
}

/// Adds an unlock key under a new slot name.
pub fn add_unlock_key(
    engine: &mut dyn Luks2,
    device: &Path,
    slot_name: &str,
    existing_key: &[u8],
    new_key: &[u8],
) -> Result<(), SealError> {
    add_named_key(
        engine,
        device,
        slot_name,
        SlotKind::Unlock,
        existing_key,
        new_key,
    )
}

/// Adds a recovery key under a new slot name.
pub fn add_recovery_key(
    engine: &mut dyn Luks2,
    device: &Path,
    slot_name: &str,
    existing_key: &[u8],
    recovery_key: &RecoveryKey,
) -> Result<(), SealError> {
    add_named_key(
        engine,
        device,
        slot_name,
        SlotKind::Recovery,
        existing_key,
        recovery_key.as_bytes(),
    )
}

/// Deletes a named slot: its keyslot and its token.
pub fn delete_slot(engine: &mut dyn Luks2, device: &Path, slot_name: &str) -> Result<(), SealError> {
    let (token_id, token) =
        find_token(engine, device, slot_name)?.structured(SlotError::SlotMissing {
            name: slot_name.to_string(),
        })?;
    let keyslot = token.keyslot().structured(engine_error())?;
    engine
        .kill_slot(device, keyslot)
        .structured(engine_error())?;
    engine
        .remove_token(device, token_id)
        .structured(engine_error())
}

/// Renames a slot, falling back to copy-then-remove when the engine has no
/// native token rename.
pub fn rename_slot(
    engine: &mut dyn Luks2,
    device: &Path,
    old: &str,
    new: &str,
) -> Result<(), SealError> {
    if find_token(engine, device, new)?.is_some() {
        return Err(SealError::new(SlotError::SlotExists {
            name: new.to_string(),
        }));
    }
    let (token_id, token) = find_token(engine, device, old)?.structured(SlotError::SlotMissing {
        name: old.to_string(),
    })?;

    match engine.rename_token(device, old, new) {
        Ok(()) => Ok(()),
        Err(NativeRenameError::Unsupported) => {
            debug!("LUKS2 engine has no native rename, copying token '{old}' to '{new}'");
            let mut renamed = token;
            renamed.name = new.to_string();
            engine
                .import_token(device, &renamed, None)
                .structured(engine_error())?;
            engine
                .remove_token(device, token_id)
                .structured(engine_error())
        }
        Err(NativeRenameError::Other(e)) => Err(e).structured(engine_error()),
    }
}

/// Validates and applies a rename batch.
///
/// The batch is rejected outright when a target collides with a slot that
/// is not itself being renamed away, with another target, or with any
/// source (no cycles or chains). Sources that are not present on the
/// device are silently skipped; the rest apply in input order.
pub fn rename_slots(
    engine: &mut dyn Luks2,
    device: &Path,
    renames: &[(String, String)],
) -> Result<(), SealError> {
    let present = slot_names(engine, device)?;
    let sources: Vec<&String> = renames.iter().map(|(src, _)| src).collect();

    for (_, target) in renames {
        if sources.contains(&target) {
            return Err(SealError::new(SlotError::SlotNameCycle {
                name: target.clone(),
            }));
        }
        let target_count = renames.iter().filter(|(_, t)| t == target).count();
        if target_count > 1 || (present.contains(target) && !sources.contains(&target)) {
            return Err(SealError::new(SlotError::SlotExists {
                name: target.clone(),
            }));
        }
    }

    for (source, target) in renames {
        if !present.contains(source) {
            continue;
        }
        rename_slot(engine, device, source, target)?;
    }
    Ok(())
}

/// Deletes every named slot that exists; absent names are silently
/// ignored.
pub fn delete_slots(
    engine: &mut dyn Luks2,
    device: &Path,
    slot_names: &[String],
) -> Result<(), SealError> {
    for name in slot_names {
        if find_token(engine, device, name)?.is_none() {
            continue;
        }
        delete_slot(engine, device, name)?;
    }
    Ok(())
}

fn list_slot_names_of_kind(
    engine: &dyn Luks2,
    device: &Path,
    kind: SlotKind,
) -> Result<Vec<String>, SealError> {
    let tokens = engine.tokens(device).structured(engine_error())?;
    Ok(tokens
        .into_iter()
        .filter(|(_, t)| t.kind == kind)
        .map(|(_, t)| t.name)
        .collect())
}

pub fn list_unlock_slot_names(engine: &dyn Luks2, device: &Path) -> Result<Vec<String>, SealError> {
    list_slot_names_of_kind(engine, device, SlotKind::Unlock)
}

pub fn list_recovery_slot_names(
    engine: &dyn Luks2,
    device: &Path,
) -> Result<Vec<String>, SealError> {
    list_slot_names_of_kind(engine, device, SlotKind::Recovery)
}

/// Reads the key data record stored for a slot. A missing token or a
/// token without key data yields `None`.
pub fn read_token(
    engine: &dyn Luks2,
    device: &Path,
    slot_name: &str,
) -> Result<Option<KeyData>, SealError> {
    Ok(find_token(engine, device, slot_name)?.and_then(|(_, t)| t.data))
}

/// Writes (or replaces) the key data record stored for a slot. The slot
/// must already exist.
pub fn write_token(
    engine: &mut dyn Luks2,
    device: &Path,
    slot_name: &str,
    data: &KeyData,
) -> Result<(), SealError> {
    let (token_id, mut token) =
        find_token(engine, device, slot_name)?.structured(SlotError::SlotMissing {
            name: slot_name.to_string(),
        })?;
    token.data = Some(data.clone());
    engine
        .import_token(device, &token, Some(token_id))
        .structured(engine_error())
}

/// A deferred token write bound to one slot of one device.
#[derive(Debug, Clone)]
pub struct TokenWriter {
    device: PathBuf,
    slot_name: String,
}

impl TokenWriter {
    pub fn new(device: &Path, slot_name: &str) -> Self {
        TokenWriter {
            device: device.to_path_buf(),
            slot_name: slot_name.to_string(),
        }
    }

    pub fn slot_name(&self) -> &str {
        &self.slot_name
    }

    pub fn write(&self, engine: &mut dyn Luks2, data: &KeyData) -> Result<(), SealError> {
        write_token(engine, &self.device, &self.slot_name, data)
    }
}

/// Fails unless `device` carries a LUKS2 superblock.
pub fn ensure_encrypted(engine: &dyn Luks2, device: &Path) -> Result<(), SealError> {
    if !engine.is_luks2(device) {
        return Err(SealError::new(DiskError::DeviceNotEncrypted {
            device: device.display().to_string(),
        }));
    }
    Ok(())
}

/// Tests a recovery key against the container's recovery slots.
pub fn check_recovery_key(
    engine: &dyn Luks2,
    device: &Path,
    key: &RecoveryKey,
) -> Result<(), SealError> {
    ensure_encrypted(engine, device)?;
    let tokens = engine.tokens(device).structured(engine_error())?;
    let mut recovery_slots = tokens
        .iter()
        .filter(|(_, t)| t.kind == SlotKind::Recovery)
        .peekable();
    if recovery_slots.peek().is_none() {
        return Err(SealError::new(SlotError::SlotMissing {
            name: "default-recovery".to_string(),
        }));
    }

    for (_, token) in recovery_slots {
        let keyslot = token.keyslot().structured(engine_error())?;
        if engine
            .verify_key(device, key.as_bytes(), Some(keyslot))
            .structured(engine_error())?
        {
            return Ok(());
        }
    }
    Err(SealError::new(
        diskseal_api::error::ActivationError::ActivationFailed {
            device: device.to_path_buf(),
        },
    ))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use diskseal_api::error::ErrorKind;

    use super::*;
    use crate::keydata::{KeyData, PlatformName};
    use crate::testutils::MemoryLuks2;

    fn device() -> PathBuf {
        PathBuf::from("/dev/vda4")
    }

    fn formatted_engine() -> MemoryLuks2 {
        let mut engine = MemoryLuks2::new();
        format_container(
            &mut engine,
            &device(),
            "ubuntu-data-enc",
            &[1u8; 64],
            &FormatOptions::default(),
        )
        .unwrap();
        engine
    }

    fn names(engine: &MemoryLuks2) -> BTreeSet<String> {
        slot_names(engine, &device()).unwrap().into_iter().collect()
    }

    fn sample_key_data() -> KeyData {
        KeyData {
            platform_name: PlatformName::Tpm2,
            platform_handle: None,
            encrypted_payload: vec![1, 2, 3],
            kdf: None,
            authorized_models: Default::default(),
            role: "run".to_string(),
        }
    }

    #[test]
    fn test_format_names_first_slot_bootstrap_key() {
        let engine = formatted_engine();
        assert_eq!(
            names(&engine),
            BTreeSet::from([BOOTSTRAP_SLOT_NAME.to_string()])
        );
    }

    #[test]
    fn test_add_unlock_key_and_duplicate_rejected() {
        let mut engine = formatted_engine();
        add_unlock_key(&mut engine, &device(), "default", &[1u8; 64], &[2u8; 64]).unwrap();

        let err =
            add_unlock_key(&mut engine, &device(), "default", &[1u8; 64], &[3u8; 64]).unwrap_err();
        assert_eq!(err.tag(), "slot-exists");
    }

    #[test]
    fn test_add_key_requires_valid_existing_key() {
        let mut engine = formatted_engine();
        let err = add_unlock_key(&mut engine, &device(), "default", &[9u8; 64], &[2u8; 64])
            .unwrap_err();
        assert_eq!(err.tag(), "internal-error");
    }

    #[test]
    fn test_recovery_and_unlock_slot_listings_are_disjoint() {
        let mut engine = formatted_engine();
        add_unlock_key(&mut engine, &device(), "default", &[1u8; 64], &[2u8; 64]).unwrap();
        let recovery = RecoveryKey::from_bytes([5; 16]);
        add_recovery_key(
            &mut engine,
            &device(),
            "default-recovery",
            &[1u8; 64],
            &recovery,
        )
        .unwrap();

        let unlock = list_unlock_slot_names(&engine, &device()).unwrap();
        let recovery_names = list_recovery_slot_names(&engine, &device()).unwrap();
        assert!(unlock.contains(&"default".to_string()));
        assert!(unlock.contains(&BOOTSTRAP_SLOT_NAME.to_string()));
        assert!(!unlock.contains(&"default-recovery".to_string()));
        assert_eq!(recovery_names, vec!["default-recovery".to_string()]);
    }

    #[test]
    fn test_delete_slot_and_missing_slot_error() {
        let mut engine = formatted_engine();
        add_unlock_key(&mut engine, &device(), "default", &[1u8; 64], &[2u8; 64]).unwrap();

        delete_slot(&mut engine, &device(), "default").unwrap();
        assert!(!names(&engine).contains("default"));

        let err = delete_slot(&mut engine, &device(), "default").unwrap_err();
        assert_eq!(err.tag(), "slot-missing");
    }

    #[test]
    fn test_rename_slot_native_and_fallback() {
        for native in [true, false] {
            let mut engine = formatted_engine();
            engine.set_native_rename(native);
            add_unlock_key(&mut engine, &device(), "default", &[1u8; 64], &[2u8; 64]).unwrap();

            rename_slot(&mut engine, &device(), "default", "factory-default").unwrap();
            assert!(!names(&engine).contains("default"));
            assert!(names(&engine).contains("factory-default"));

            // The keyslot must survive the rename either way.
            let (_, token) = find_token(&engine, &device(), "factory-default")
                .unwrap()
                .unwrap();
            assert!(engine
                .verify_key(&device(), &[2u8; 64], Some(token.keyslot().unwrap()))
                .unwrap());
        }
    }

    #[test]
    fn test_rename_batch_target_collision_rejected_without_side_effects() {
        // Scenario E: slots {a, b, c}, request {a -> b}.
        let mut engine = formatted_engine();
        for name in ["a", "b", "c"] {
            add_unlock_key(&mut engine, &device(), name, &[1u8; 64], &[2u8; 64]).unwrap();
        }
        let before = names(&engine);

        let err = rename_slots(
            &mut engine,
            &device(),
            &[("a".to_string(), "b".to_string())],
        )
        .unwrap_err();
        assert_eq!(err.tag(), "slot-exists");
        assert_eq!(names(&engine), before);
    }

    #[test]
    fn test_rename_batch_source_target_overlap_rejected() {
        let mut engine = formatted_engine();
        for name in ["a", "b"] {
            add_unlock_key(&mut engine, &device(), name, &[1u8; 64], &[2u8; 64]).unwrap();
        }

        // b is both a target and a source: rejected as a cycle.
        let err = rename_slots(
            &mut engine,
            &device(),
            &[
                ("a".to_string(), "b".to_string()),
                ("b".to_string(), "c".to_string()),
            ],
        )
        .unwrap_err();
        assert_eq!(err.tag(), "slot-name-cycle");
    }

    #[test]
    fn test_rename_batch_applies_and_skips_absent_sources() {
        let mut engine = formatted_engine();
        for name in ["a", "b"] {
            add_unlock_key(&mut engine, &device(), name, &[1u8; 64], &[2u8; 64]).unwrap();
        }

        rename_slots(
            &mut engine,
            &device(),
            &[
                ("a".to_string(), "x".to_string()),
                ("ghost".to_string(), "y".to_string()),
            ],
        )
        .unwrap();

        let after = names(&engine);
        assert!(after.contains("x"));
        assert!(after.contains("b"));
        assert!(!after.contains("a"));
        assert!(!after.contains("y"));
    }

    #[test]
    fn test_delete_batch_ignores_absent_names() {
        let mut engine = formatted_engine();
        add_unlock_key(&mut engine, &device(), "a", &[1u8; 64], &[2u8; 64]).unwrap();

        delete_slots(
            &mut engine,
            &device(),
            &["a".to_string(), "ghost".to_string()],
        )
        .unwrap();
        assert!(!names(&engine).contains("a"));
    }

    #[test]
    fn test_token_roundtrip_is_identity() {
        let mut engine = formatted_engine();
        add_unlock_key(&mut engine, &device(), "default", &[1u8; 64], &[2u8; 64]).unwrap();

        let key_data = sample_key_data();
        write_token(&mut engine, &device(), "default", &key_data).unwrap();
        let read_back = read_token(&engine, &device(), "default").unwrap().unwrap();
        assert_eq!(read_back, key_data);
    }

    #[test]
    fn test_read_token_tolerates_missing() {
        let engine = formatted_engine();
        assert!(read_token(&engine, &device(), "absent").unwrap().is_none());
        assert!(read_token(&engine, &device(), BOOTSTRAP_SLOT_NAME)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_token_writer_writes_to_its_slot() {
        let mut engine = formatted_engine();
        add_unlock_key(&mut engine, &device(), "default", &[1u8; 64], &[2u8; 64]).unwrap();

        let writer = TokenWriter::new(&device(), "default");
        writer.write(&mut engine, &sample_key_data()).unwrap();
        assert!(read_token(&engine, &device(), "default").unwrap().is_some());
    }

    #[test]
    fn test_check_recovery_key() {
        let mut engine = formatted_engine();
        let recovery = RecoveryKey::from_bytes([5; 16]);
        add_recovery_key(
            &mut engine,
            &device(),
            "default-recovery",
            &[1u8; 64],
            &recovery,
        )
        .unwrap();

        check_recovery_key(&engine, &device(), &recovery).unwrap();

        let wrong = RecoveryKey::from_bytes([6; 16]);
        let err = check_recovery_key(&engine, &device(), &wrong).unwrap_err();
        assert_eq!(err.tag(), "activation-failed");
    }

    #[test]
    fn test_check_recovery_key_without_recovery_slots() {
        let engine = formatted_engine();
        let err =
            check_recovery_key(&engine, &device(), &RecoveryKey::from_bytes([5; 16])).unwrap_err();
        assert_eq!(err.tag(), "slot-missing");
    }

    #[test]
    fn test_check_recovery_key_on_unencrypted_device() {
        let engine = MemoryLuks2::new();
        let err = check_recovery_key(
            &engine,
            Path::new("/dev/vda3"),
            &RecoveryKey::from_bytes([5; 16]),
        )
        .unwrap_err();
        assert_eq!(err.tag(), "device-not-encrypted");
    }

    #[test]
    fn test_slot_token_json_shape() {
        let token = SlotToken::new("default", SlotKind::Unlock, 3, Some(sample_key_data()));
        let json = serde_json::to_value(&token).unwrap();
        assert_eq!(json["type"], "ubuntu-fde");
        assert_eq!(json["keyslots"][0], "3");
        assert_eq!(json["kind"], "unlock");
        assert_eq!(json["data"]["platform_name"], "tpm2");
        assert_eq!(json["data"]["encrypted_payload"], "AQID");
    }

    #[test]
    fn test_err_kind_matches_slot_category() {
        let mut engine = formatted_engine();
        let err = delete_slot(&mut engine, &device(), "none").unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Slot(SlotError::SlotMissing { .. })));
    }
}
