//! Early-boot volume activation: the TPM-sealed key path, the hook
//! fallback, and the recovery key of last resort.
//!
//! Operations here mutate the ambient activation context (current model,
//! boot mode, protector key, hook revealer); they are not reentrant and
//! must not run concurrently within one process.

use std::path::{Path, PathBuf};

use anyhow::Error;
use log::{debug, warn};
use rand::rngs::OsRng;
use rand::TryRngCore;

use diskseal_api::error::{
    ActivationError, DiskError, InternalError, ReportError, SealError,
};
use enumflags2::BitFlags;
use sysdefs::tpm2::Pcr;

use crate::container::{Luks2, SlotKind};
use crate::hooks::{self, HookRunner};
use crate::keydata::{load_key_file, KeyData, KeyFileKind, PlatformName};
use crate::keyring::KEYRING_PREFIX;
use crate::profile::Model;
use crate::tpm::{self, Tpm, TpmConnectError};

/// Partition discovery result for one filesystem label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    pub part_uuid: String,
    pub fs_uuid: String,
}

#[derive(Debug)]
pub enum DiskProbeError {
    LabelNotFound,
    Other(Error),
}

/// Consumed partition-discovery surface: find a partition by filesystem
/// label on one disk.
pub trait Disk {
    fn partition_by_label(&self, label: &str) -> Result<PartitionInfo, DiskProbeError>;
}

/// Production discovery through `/dev/disk/by-label` and blkid.
pub struct ByLabelDisk;

impl Disk for ByLabelDisk {
    fn partition_by_label(&self, label: &str) -> Result<PartitionInfo, DiskProbeError> {
        let link = Path::new("/dev/disk/by-label").join(label);
        if !link.exists() {
            return Err(DiskProbeError::LabelNotFound);
        }
        let node = std::fs::canonicalize(&link).map_err(|e| DiskProbeError::Other(e.into()))?;
        let part_uuid =
            osutils::blkid::get_partition_uuid(&node).map_err(DiskProbeError::Other)?;
        let fs_uuid = osutils::blkid::get_filesystem_uuid(&node).map_err(DiskProbeError::Other)?;
        Ok(PartitionInfo { part_uuid, fs_uuid })
    }
}

/// Which hook protocol revision reveals v2+ hook key data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookRevealerVersion {
    V2,
    V3,
}

/// Ambient state consulted by the activation library while it unseals:
/// the device identity and boot mode to recompute authorization HMACs,
/// the registered hook revealer, and the plainkey protector key.
///
/// One context per process; the unlock engine sets fields before the
/// activation primitive runs and clears them afterwards.
#[derive(Default)]
pub struct UnlockContext {
    model: Option<Model>,
    boot_mode: Option<String>,
    protector_key: Option<Vec<u8>>,
    revealer: Option<HookRevealerVersion>,
}

impl UnlockContext {
    pub fn new() -> Self {
        UnlockContext::default()
    }

    pub fn model(&self) -> Option<&Model> {
        self.model.as_ref()
    }

    pub fn boot_mode(&self) -> Option<&str> {
        self.boot_mode.as_deref()
    }

    pub fn protector_key(&self) -> Option<&[u8]> {
        self.protector_key.as_deref()
    }

    pub fn revealer(&self) -> Option<HookRevealerVersion> {
        self.revealer
    }

    pub fn set_revealer(&mut self, revealer: HookRevealerVersion) {
        self.revealer = Some(revealer);
    }

    pub fn clear_revealer(&mut self) {
        self.revealer = None;
    }
}

/// Options forwarded to the activation primitive.
#[derive(Debug, Clone)]
pub struct ActivateOptions {
    pub passphrase_tries: u32,
    pub recovery_key_tries: u32,
    pub keyring_prefix: String,
    /// Extra device paths registered with the keyring so downstream name
    /// lookups keep resolving.
    pub legacy_device_paths: Vec<PathBuf>,
}

/// Activation failure shapes. `RecoveryKeyUsed` is a sentinel: the volume
/// is open, just not with a sealed key.
#[derive(Debug)]
pub enum ActivateError {
    RecoveryKeyUsed,
    Failed(Error),
}

/// Consumed volume-activation facility. Implementations unseal the given
/// key data records (dispatching per platform protector) and activate the
/// volume, falling back to passphrase and recovery key prompts per the
/// options.
pub trait Activator {
    fn activate_with_key_data(
        &mut self,
        ctx: &UnlockContext,
        volume_name: &str,
        source_device: &Path,
        keys: &[KeyData],
        options: &ActivateOptions,
    ) -> Result<(), ActivateError>;

    fn activate_with_recovery_key(
        &mut self,
        volume_name: &str,
        source_device: &Path,
        options: &ActivateOptions,
    ) -> Result<(), ActivateError>;

    fn activate_with_raw_key(
        &mut self,
        volume_name: &str,
        source_device: &Path,
        key: &[u8],
    ) -> Result<(), Error>;
}

/// How (whether) a volume ended up unlocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockMethod {
    /// Nothing needed unlocking, or nothing was unlocked.
    UnlockStatusUnknown,
    NotUnlocked,
    UnlockedWithSealedKey,
    UnlockedWithRecoveryKey,
}

/// Outcome of an unlock attempt. `is_encrypted` and `part_device` are
/// valid even when the attempt failed, so callers can branch robustly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlockResult {
    pub unlock_method: UnlockMethod,
    pub is_encrypted: bool,
    pub part_device: PathBuf,
    pub fs_device: PathBuf,
}

/// An unlock failure, carrying the partial result alongside the error.
#[derive(Debug)]
pub struct UnlockError {
    pub partial: UnlockResult,
    pub error: SealError,
}

impl UnlockError {
    fn new(partial: UnlockResult, error: SealError) -> Self {
        UnlockError { partial, error }
    }
}

/// Per-volume unlock options.
pub struct UnlockOptions<'a> {
    pub allow_recovery_key: bool,
    pub which_model: Option<&'a dyn Fn() -> Result<Model, Error>>,
    pub boot_mode: String,
}

fn by_partuuid_path(part_uuid: &str) -> PathBuf {
    PathBuf::from(format!("/dev/disk/by-partuuid/{part_uuid}"))
}

fn by_uuid_path(fs_uuid: &str) -> PathBuf {
    PathBuf::from(format!("/dev/disk/by-uuid/{fs_uuid}"))
}

fn random_mapper_suffix() -> Result<String, SealError> {
    let mut bytes = [0u8; 16];
    OsRng
        .try_fill_bytes(&mut bytes)
        .structured(InternalError::RandomSource(
            "could not generate device-mapper name",
        ))?;
    Ok(uuid::Builder::from_random_bytes(bytes)
        .into_uuid()
        .to_string())
}

fn token_key_data(engine: &dyn Luks2, device: &Path) -> Vec<KeyData> {
    match engine.tokens(device) {
        Ok(tokens) => tokens
            .into_iter()
            .filter(|(_, t)| t.kind == SlotKind::Unlock)
            .filter_map(|(_, t)| t.data)
            .collect(),
        Err(e) => {
            warn!(
                "Ignoring unreadable tokens on '{}': {}",
                device.display(),
                e
            );
            Vec::new()
        }
    }
}

/// Classified key-file candidate, with malformed sources tolerated.
fn key_file_candidate(key_file: Option<&Path>) -> Option<KeyFileKind> {
    let path = key_file?;
    match load_key_file(path) {
        Ok(kind) => Some(kind),
        Err(e) => {
            warn!("Ignoring unusable key file '{}': {}", path.display(), e);
            None
        }
    }
}

fn wrap_legacy_sealed_object(object: Vec<u8>) -> KeyData {
    // Pre-KeyData sealed objects carry their own framing; the activation
    // library recognizes them by the absence of a platform handle.
    KeyData {
        platform_name: PlatformName::Tpm2,
        platform_handle: None,
        encrypted_payload: object,
        kdf: None,
        authorized_models: Default::default(),
        role: String::new(),
    }
}

/// Unlocks the volume `name` if its backing partition is encrypted.
///
/// Probes the disk for the `{name}-enc` filesystem label, falling back to
/// plain `{name}`; assembles key data candidates from LUKS2 tokens and the
/// optional key file; and drives the activation primitive. Classification
/// is deterministic: identical disk state and key sources produce the
/// same `is_encrypted`, `part_device` and `unlock_method`.
#[allow(clippy::too_many_arguments)]
pub fn unlock_volume_if_encrypted(
    ctx: &mut UnlockContext,
    activator: &mut dyn Activator,
    engine: &dyn Luks2,
    hook_runner: Option<&dyn HookRunner>,
    disk: &dyn Disk,
    name: &str,
    key_file: Option<&Path>,
    options: &UnlockOptions,
) -> Result<UnlockResult, UnlockError> {
    let mut partial = UnlockResult {
        unlock_method: UnlockMethod::UnlockStatusUnknown,
        is_encrypted: false,
        part_device: PathBuf::new(),
        fs_device: PathBuf::new(),
    };

    let enc_label = format!("{name}-enc");
    let info = match disk.partition_by_label(&enc_label) {
        Ok(info) => {
            partial.is_encrypted = true;
            info
        }
        Err(DiskProbeError::LabelNotFound) => match disk.partition_by_label(name) {
            Ok(info) => {
                // Unencrypted fallback: the partition is used as-is.
                let device = by_partuuid_path(&info.part_uuid);
                partial.part_device = device.clone();
                partial.fs_device = device;
                return Ok(partial);
            }
            Err(DiskProbeError::LabelNotFound) => {
                return Err(UnlockError::new(
                    partial,
                    SealError::new(DiskError::LabelNotFound {
                        label: name.to_string(),
                    }),
                ));
            }
            Err(DiskProbeError::Other(e)) => {
                return Err(UnlockError::new(
                    partial,
                    SealError::with_source(
                        InternalError::Internal("partition probe failed"),
                        e,
                    ),
                ));
            }
        },
        Err(DiskProbeError::Other(e)) => {
            return Err(UnlockError::new(
                partial,
                SealError::with_source(InternalError::Internal("partition probe failed"), e),
            ));
        }
    };

    partial.part_device = by_partuuid_path(&info.part_uuid);
    let mapper_suffix = match random_mapper_suffix() {
        Ok(suffix) => suffix,
        Err(e) => return Err(UnlockError::new(partial, e)),
    };
    let volume_name = format!("{name}-{mapper_suffix}");
    partial.fs_device = PathBuf::from(format!("/dev/mapper/{volume_name}"));

    let source_device = partial.part_device.clone();
    let mut keys = token_key_data(engine, &source_device);

    let mut legacy_v1_blob = None;
    match key_file_candidate(key_file) {
        Some(KeyFileKind::KeyData(key_data)) => keys.push(key_data),
        Some(KeyFileKind::LegacySealedObject(object)) => {
            keys.push(wrap_legacy_sealed_object(object))
        }
        Some(KeyFileKind::LegacyFdeHookRawV1(blob)) => legacy_v1_blob = Some(blob),
        None => {}
    }

    // Legacy v1 hook keys bypass the key data machinery entirely: the
    // helper reveals the raw unlock key.
    if let Some(blob) = &legacy_v1_blob {
        if let Some(runner) = hook_runner {
            match hooks::reveal_v1(runner, blob) {
                Ok(raw_key) => {
                    match activator.activate_with_raw_key(&volume_name, &source_device, &raw_key)
                    {
                        Ok(()) => {
                            partial.unlock_method = UnlockMethod::UnlockedWithSealedKey;
                            return Ok(partial);
                        }
                        Err(e) => warn!(
                            "v1 hook key did not activate '{}', retrying token keys: {}",
                            volume_name, e
                        ),
                    }
                }
                Err(e) => warn!("v1 hook reveal failed, retrying token keys: {:?}", e),
            }
        } else {
            warn!("Found a v1 hook key but no hook helper is available");
        }
    }

    // Give the protector what it needs to recompute authorization HMACs.
    if let Some(which_model) = options.which_model {
        match which_model() {
            Ok(model) => ctx.model = Some(model),
            Err(e) => {
                return Err(UnlockError::new(
                    partial,
                    SealError::with_source(
                        InternalError::Internal("could not determine current model"),
                        e,
                    ),
                ));
            }
        }
    }
    ctx.boot_mode = Some(options.boot_mode.clone());

    // Hook-protected records need the matching revealer registered for
    // the duration of the attempt.
    if keys
        .iter()
        .any(|k| k.platform_name == PlatformName::FdeHookV3)
    {
        ctx.revealer = Some(HookRevealerVersion::V3);
    } else if keys
        .iter()
        .any(|k| k.platform_name == PlatformName::FdeHookV2)
    {
        ctx.revealer = Some(HookRevealerVersion::V2);
    }

    let activate_options = ActivateOptions {
        passphrase_tries: 1,
        recovery_key_tries: if options.allow_recovery_key { 3 } else { 0 },
        keyring_prefix: KEYRING_PREFIX.to_string(),
        legacy_device_paths: vec![partial.part_device.clone()],
    };

    let outcome =
        activator.activate_with_key_data(ctx, &volume_name, &source_device, &keys, &activate_options);
    ctx.revealer = None;

    match outcome {
        Ok(()) => {
            partial.unlock_method = UnlockMethod::UnlockedWithSealedKey;
            ctx.boot_mode = None;
            Ok(partial)
        }
        Err(ActivateError::RecoveryKeyUsed) => {
            partial.unlock_method = UnlockMethod::UnlockedWithRecoveryKey;
            ctx.boot_mode = None;
            Ok(partial)
        }
        Err(ActivateError::Failed(e)) => {
            partial.unlock_method = UnlockMethod::NotUnlocked;
            Err(UnlockError::new(
                partial,
                SealError::with_source(
                    ActivationError::ActivationFailed {
                        device: by_uuid_path(&info.fs_uuid),
                    },
                    e,
                ),
            ))
        }
    }
}

/// Unlocks a volume with a caller-supplied protector key.
///
/// When the container carries `plainkey` key data, the protector bytes go
/// into the process-wide protector-key register for the activation
/// primitive and are cleared afterwards; otherwise the protector is used
/// directly as the volume key.
pub fn unlock_with_protector_key(
    ctx: &mut UnlockContext,
    activator: &mut dyn Activator,
    engine: &dyn Luks2,
    device: &Path,
    name: &str,
    protector: &[u8],
) -> Result<(), SealError> {
    let plainkeys: Vec<KeyData> = token_key_data(engine, device)
        .into_iter()
        .filter(|k| k.platform_name == PlatformName::Plainkey)
        .collect();

    if plainkeys.is_empty() {
        debug!("No plainkey slots on '{}', using the protector directly", device.display());
        return activator
            .activate_with_raw_key(name, device, protector)
            .structured(ActivationError::ActivationFailed {
                device: device.to_path_buf(),
            });
    }

    ctx.protector_key = Some(protector.to_vec());
    let options = ActivateOptions {
        passphrase_tries: 1,
        recovery_key_tries: 0,
        keyring_prefix: KEYRING_PREFIX.to_string(),
        legacy_device_paths: Vec::new(),
    };
    let outcome = activator.activate_with_key_data(ctx, name, device, &plainkeys, &options);
    ctx.protector_key = None;

    match outcome {
        Ok(()) | Err(ActivateError::RecoveryKeyUsed) => Ok(()),
        Err(ActivateError::Failed(e)) => Err(SealError::with_source(
            ActivationError::ActivationFailed {
                device: device.to_path_buf(),
            },
            e,
        )),
    }
}

/// Locks further access to sealed keys for the rest of this boot: blocks
/// the PCR policies on the TPM (when one is present) and tells the hook
/// helper to lock its store.
pub fn lock_sealed_keys(
    tpm: &dyn Tpm,
    hook_runner: Option<&dyn HookRunner>,
    pcrs: BitFlags<Pcr>,
) -> Result<(), SealError> {
    match tpm.connect() {
        Ok(mut conn) => tpm::block_pcr_policies(conn.as_mut(), pcrs)?,
        Err(TpmConnectError::NoDevice) => {
            debug!("No TPM present, nothing to block");
        }
        Err(TpmConnectError::Failed(e)) => {
            return Err(SealError::with_source(
                diskseal_api::error::TpmError::TpmConnectFailed,
                e,
            ));
        }
    }

    if let Some(runner) = hook_runner {
        hooks::lock(runner)?;
    }
    Ok(())
}
