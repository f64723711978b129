//! Sealing disk unlock keys against a PCR protection profile.
//!
//! Profile construction strictly precedes any TPM write, and every TPM
//! sealing operation completes before the first keyslot or file is
//! touched, so a failure mid-sealing leaves no side effects.

pub mod reseal;

use std::path::PathBuf;

use log::{debug, info};

use diskseal_api::error::{
    InternalError, ReportError, SealError, SealResultExt, SealingError, TpmError,
};
use sysdefs::tpm2::NvHandle;

use crate::container::bootstrap::BootstrappedContainer;
use crate::container::Luks2;
use crate::hooks::{self, HookRunner};
use crate::keydata::{self, KdfParams, KdfType, KeyData, PlatformName};
use crate::keys::{DiskUnlockKey, PrimaryKey};
use crate::profile::{build_pcr_profile, ModelParams, SnapImageReader};
use crate::tpm::{self, Tpm};

/// How the sealed payloads are additionally protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    None,
    Passphrase,
    Pin,
}

/// Extra authentication requested for the sealed volumes.
#[derive(Debug, Clone)]
pub struct VolumesAuthOptions {
    pub mode: AuthMode,
    pub kdf_type: Option<KdfType>,
    /// Wall-clock budget for the KDF, in milliseconds.
    pub kdf_target_duration_ms: u64,
    pub passphrase: Option<String>,
}

/// Parses a KDF selection from its stable name.
pub fn parse_kdf_type(name: &str) -> Result<KdfType, SealError> {
    KdfType::parse(name).map_err(|kdf| SealError::new(SealingError::KdfUnsupported { kdf }))
}

/// One key to seal: which container it unlocks, the slot to enrol it
/// under, and optionally a standalone file for the key data record.
#[derive(Debug, Clone)]
pub struct SealKeyRequest {
    /// Index into the containers slice passed to [`seal_keys`].
    pub container: usize,
    pub key_name: String,
    pub slot_name: String,
    pub key_file: Option<PathBuf>,
}

/// Parameters shared by all requests of one sealing run.
#[derive(Debug)]
pub struct SealParams<'a> {
    pub model_params: &'a [ModelParams],
    pub primary_key_file: PathBuf,
    pub pcr_policy_counter: NvHandle,
    pub volumes_auth: Option<VolumesAuthOptions>,
    pub role: String,
}

struct SealedRequest<'a> {
    request: &'a SealKeyRequest,
    unlock_key: DiskUnlockKey,
    key_data: KeyData,
}

fn authorize_models(key_data: &mut KeyData, primary: &PrimaryKey, model_params: &[ModelParams]) {
    for params in model_params {
        for boot_mode in &params.boot_modes {
            key_data.authorize_model(primary, &params.model, boot_mode);
        }
    }
}

/// Enrols every sealed key into its container and persists the key data
/// records (token by default, file when requested) plus the primary key
/// file. Runs only after all protector work succeeded.
fn persist_sealed(
    engine: &mut dyn Luks2,
    containers: &mut [BootstrappedContainer],
    sealed: &[SealedRequest],
    primary_key_file: &std::path::Path,
    primary: &PrimaryKey,
) -> Result<(), SealError> {
    for entry in sealed {
        let container = &mut containers[entry.request.container];
        container.add_key(engine, &entry.request.slot_name, &entry.unlock_key)?;

        match &entry.request.key_file {
            Some(path) => {
                let json = entry
                    .key_data
                    .to_json()
                    .structured(InternalError::Internal("could not serialize key data"))?;
                osutils::files::atomic_write_mode(path, 0o600, &json).structured(
                    InternalError::Internal("could not write key data file"),
                )?;
            }
            None => {
                container
                    .get_token_writer(&entry.request.slot_name)
                    .write(engine, &entry.key_data)?;
            }
        }
        info!(
            "Sealed key '{}' into slot '{}'",
            entry.request.key_name, entry.request.slot_name
        );
    }

    primary
        .save(primary_key_file)
        .structured(InternalError::Internal("could not write primary key file"))
}

/// Seals a fresh unlock key for every request, enrols the keys into their
/// containers, persists the key data records, and writes the primary key
/// file. Returns the primary key so the caller may stash it.
pub fn seal_keys(
    tpm: &dyn Tpm,
    engine: &mut dyn Luks2,
    reader: &dyn SnapImageReader,
    containers: &mut [BootstrappedContainer],
    requests: &[SealKeyRequest],
    params: &SealParams,
) -> Result<PrimaryKey, SealError> {
    if params.model_params.is_empty() {
        return Err(SealError::new(SealingError::NoModelParams));
    }

    let mut conn = tpm::connect(tpm)?;
    if !conn.enabled().structured(TpmError::TpmConnectFailed)? {
        return Err(SealError::new(TpmError::TpmDisabled));
    }

    let auth_mode = params
        .volumes_auth
        .as_ref()
        .map(|a| a.mode)
        .unwrap_or(AuthMode::None);
    if auth_mode == AuthMode::Pin {
        return Err(SealError::new(SealingError::AuthModeUnsupported {
            mode: "pin".to_string(),
        }))
        .message("PIN authentication is not implemented");
    }

    // Build the profile before any key material exists, so profile errors
    // cannot leave partial state behind.
    let profile = build_pcr_profile(params.model_params, reader)?;
    debug!("Sealing against a profile with {} branches", profile.branches.len());

    let primary = PrimaryKey::generate().structured(InternalError::RandomSource(
        "could not generate primary key",
    ))?;

    // Phase one: all TPM work, nothing persisted.
    let mut sealed = Vec::with_capacity(requests.len());
    for request in requests {
        if request.container >= containers.len() {
            return Err(SealError::new(InternalError::Internal(
                "seal request references an unknown container",
            )));
        }

        let unlock_key = DiskUnlockKey::generate().structured(InternalError::RandomSource(
            "could not generate unlock key",
        ))?;
        let payload = keydata::make_cleartext_payload(&unlock_key, &primary);

        let (blob, kdf) = match (&params.volumes_auth, auth_mode) {
            (Some(auth), AuthMode::Passphrase) => {
                let passphrase = auth
                    .passphrase
                    .as_deref()
                    .structured(InternalError::Internal(
                        "passphrase mode selected without a passphrase",
                    ))?;
                let kdf = KdfParams {
                    kdf_type: auth.kdf_type.unwrap_or(KdfType::Argon2id),
                    target_duration_ms: auth.kdf_target_duration_ms,
                };
                let blob = conn
                    .seal_passphrase_protected(
                        &profile,
                        params.pcr_policy_counter,
                        &params.role,
                        &kdf,
                        passphrase,
                        &payload,
                    )
                    .structured(TpmError::TpmConnectFailed)?;
                (blob, Some(kdf))
            }
            _ => {
                let blob = conn
                    .seal_pcr_protected(
                        &profile,
                        params.pcr_policy_counter,
                        &params.role,
                        &payload,
                    )
                    .structured(TpmError::TpmConnectFailed)?;
                (blob, None)
            }
        };

        let mut key_data = KeyData {
            platform_name: PlatformName::Tpm2,
            platform_handle: Some(blob.handle),
            encrypted_payload: blob.encrypted_payload,
            kdf,
            authorized_models: Default::default(),
            role: params.role.clone(),
        };
        authorize_models(&mut key_data, &primary, params.model_params);

        sealed.push(SealedRequest {
            request,
            unlock_key,
            key_data,
        });
    }

    // Phase two: enrol keys and persist records.
    persist_sealed(
        engine,
        containers,
        &sealed,
        &params.primary_key_file,
        &primary,
    )?;

    Ok(primary)
}

/// Parameters for sealing through the out-of-process hook protector
/// instead of a TPM.
#[derive(Debug)]
pub struct HookSealParams<'a> {
    pub model_params: &'a [ModelParams],
    pub primary_key_file: PathBuf,
    pub role: String,
}

/// Seals a fresh unlock key for every request with the hook helper's
/// `initial-setup` operation. The same two-phase discipline as
/// [`seal_keys`] applies: every hook invocation completes before
/// anything is persisted.
pub fn seal_keys_with_hook_protector(
    runner: &dyn HookRunner,
    engine: &mut dyn Luks2,
    containers: &mut [BootstrappedContainer],
    requests: &[SealKeyRequest],
    params: &HookSealParams,
) -> Result<PrimaryKey, SealError> {
    if params.model_params.is_empty() {
        return Err(SealError::new(SealingError::NoModelParams));
    }

    let primary = PrimaryKey::generate().structured(InternalError::RandomSource(
        "could not generate primary key",
    ))?;

    let mut sealed = Vec::with_capacity(requests.len());
    for request in requests {
        if request.container >= containers.len() {
            return Err(SealError::new(InternalError::Internal(
                "seal request references an unknown container",
            )));
        }

        let unlock_key = DiskUnlockKey::generate().structured(InternalError::RandomSource(
            "could not generate unlock key",
        ))?;
        let payload = keydata::make_cleartext_payload(&unlock_key, &primary);
        let response = hooks::initial_setup(runner, &payload, &request.key_name)?;

        let mut key_data = KeyData {
            platform_name: PlatformName::FdeHookV3,
            platform_handle: response.handle,
            encrypted_payload: response.encrypted_key,
            kdf: None,
            authorized_models: Default::default(),
            role: params.role.clone(),
        };
        authorize_models(&mut key_data, &primary, params.model_params);

        sealed.push(SealedRequest {
            request,
            unlock_key,
            key_data,
        });
    }

    persist_sealed(
        engine,
        containers,
        &sealed,
        &params.primary_key_file,
        &primary,
    )?;

    Ok(primary)
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    use super::*;
    use crate::container::{self, FormatOptions};
    use crate::testutils::{models, MemoryLuks2, MockTpm, NoContainers, TpmBehavior};

    fn bootstrapped(engine: &mut MemoryLuks2, device: &str) -> BootstrappedContainer {
        let device = PathBuf::from(device);
        let key = DiskUnlockKey::from_bytes([1; 64]);
        container::format_container(
            engine,
            &device,
            "enc",
            key.as_bytes(),
            &FormatOptions::default(),
        )
        .unwrap();
        BootstrappedContainer::new(device, key)
    }

    fn seal_params<'a>(
        model_params: &'a [ModelParams],
        dir: &Path,
    ) -> SealParams<'a> {
        SealParams {
            model_params,
            primary_key_file: dir.join("aux.key"),
            pcr_policy_counter: NvHandle(0x0188_0004),
            volumes_auth: None,
            role: "run+recover".to_string(),
        }
    }

    #[test]
    fn test_seal_without_model_params_has_no_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let tpm = MockTpm::enabled();
        let mut engine = MemoryLuks2::new();
        let mut containers = vec![bootstrapped(&mut engine, "/dev/vda4")];
        let requests = vec![SealKeyRequest {
            container: 0,
            key_name: "ubuntu-data".to_string(),
            slot_name: "default".to_string(),
            key_file: None,
        }];
        let params = seal_params(&[], dir.path());

        let err = seal_keys(
            &tpm,
            &mut engine,
            &NoContainers,
            &mut containers,
            &requests,
            &params,
        )
        .unwrap_err();
        assert_eq!(err.tag(), "no-model-params");
        assert!(!params.primary_key_file.exists());
        assert!(!container::list_unlock_slot_names(&engine, containers[0].device())
            .unwrap()
            .contains(&"default".to_string()));

        containers[0].remove_bootstrap_key(&mut engine).unwrap();
    }

    #[test]
    fn test_seal_requires_enabled_tpm() {
        let dir = tempfile::tempdir().unwrap();
        let model_params = models::sample_model_params(dir.path());
        let params = seal_params(&model_params, dir.path());
        let mut engine = MemoryLuks2::new();
        let mut containers = vec![bootstrapped(&mut engine, "/dev/vda4")];

        let tpm = MockTpm::with_behavior(TpmBehavior::Disabled);
        let err = seal_keys(
            &tpm,
            &mut engine,
            &NoContainers,
            &mut containers,
            &[],
            &params,
        )
        .unwrap_err();
        assert_eq!(err.tag(), "tpm-disabled");

        containers[0].remove_bootstrap_key(&mut engine).unwrap();
    }

    #[test]
    fn test_parse_kdf_type() {
        assert_eq!(parse_kdf_type("argon2i").unwrap(), KdfType::Argon2i);
        assert_eq!(parse_kdf_type("argon2id").unwrap(), KdfType::Argon2id);
        assert_eq!(parse_kdf_type("pbkdf2").unwrap(), KdfType::Pbkdf2);

        let err = parse_kdf_type("scrypt").unwrap_err();
        assert_eq!(err.tag(), "kdf-unsupported");
        assert!(format!("{:?}", err).contains("scrypt"));
    }

    #[test]
    fn test_seal_rejects_pin_auth() {
        let dir = tempfile::tempdir().unwrap();
        let model_params = models::sample_model_params(dir.path());
        let mut params = seal_params(&model_params, dir.path());
        params.volumes_auth = Some(VolumesAuthOptions {
            mode: AuthMode::Pin,
            kdf_type: None,
            kdf_target_duration_ms: 0,
            passphrase: None,
        });
        let tpm = MockTpm::enabled();
        let mut engine = MemoryLuks2::new();
        let mut containers = vec![bootstrapped(&mut engine, "/dev/vda4")];

        let err = seal_keys(
            &tpm,
            &mut engine,
            &NoContainers,
            &mut containers,
            &[],
            &params,
        )
        .unwrap_err();
        assert_eq!(err.tag(), "auth-mode-unsupported");

        containers[0].remove_bootstrap_key(&mut engine).unwrap();
    }

    #[test]
    fn test_successful_seal_enrols_slots_and_writes_files() {
        let dir = tempfile::tempdir().unwrap();
        let model_params = models::sample_model_params(dir.path());
        let params = seal_params(&model_params, dir.path());
        let tpm = MockTpm::enabled();
        let mut engine = MemoryLuks2::new();
        let mut containers = vec![
            bootstrapped(&mut engine, "/dev/vda4"),
            bootstrapped(&mut engine, "/dev/vda5"),
        ];
        let fallback = dir.path().join("fallback.key");
        let requests = vec![
            SealKeyRequest {
                container: 0,
                key_name: "ubuntu-data".to_string(),
                slot_name: "default".to_string(),
                key_file: None,
            },
            SealKeyRequest {
                container: 1,
                key_name: "ubuntu-save".to_string(),
                slot_name: "default-fallback".to_string(),
                key_file: Some(fallback.clone()),
            },
        ];

        let primary = seal_keys(
            &tpm,
            &mut engine,
            &NoContainers,
            &mut containers,
            &requests,
            &params,
        )
        .unwrap();

        // Request 0: token persisted, slot enrolled.
        let data_names =
            container::list_unlock_slot_names(&engine, containers[0].device()).unwrap();
        assert!(data_names.contains(&"default".to_string()));
        let token = container::read_token(&engine, containers[0].device(), "default")
            .unwrap()
            .unwrap();
        assert_eq!(token.platform_name, PlatformName::Tpm2);
        assert!(token.platform_handle.is_some());

        // Request 1: file persisted with mode 0600, no token.
        assert!(fallback.exists());
        let mode = std::fs::metadata(&fallback).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert!(container::read_token(&engine, containers[1].device(), "default-fallback")
            .unwrap()
            .is_none());

        // Primary key file written with mode 0600 and matches the return.
        let stored = PrimaryKey::load(&params.primary_key_file).unwrap();
        assert_eq!(stored, primary);

        // The record authorizes the sealed models for their boot modes.
        let model = &model_params[0].model;
        assert!(token.is_model_authorized(&primary, model, "run"));
        assert!(token.is_model_authorized(&primary, model, "recover"));
        assert!(!token.is_model_authorized(&primary, model, "factory-reset"));

        for c in &mut containers {
            c.remove_bootstrap_key(&mut engine).unwrap();
        }
    }

    #[test]
    fn test_seal_failure_before_persistence_leaves_no_slots() {
        let dir = tempfile::tempdir().unwrap();
        let model_params = models::sample_model_params(dir.path());
        let params = seal_params(&model_params, dir.path());
        let tpm = MockTpm::enabled();
        tpm.fail_sealing();
        let mut engine = MemoryLuks2::new();
        let mut containers = vec![bootstrapped(&mut engine, "/dev/vda4")];
        let requests = vec![SealKeyRequest {
            container: 0,
            key_name: "ubuntu-data".to_string(),
            slot_name: "default".to_string(),
            key_file: None,
        }];

        seal_keys(
            &tpm,
            &mut engine,
            &NoContainers,
            &mut containers,
            &requests,
            &params,
        )
        .unwrap_err();

        assert!(!container::list_unlock_slot_names(&engine, containers[0].device())
            .unwrap()
            .contains(&"default".to_string()));
        assert!(!params.primary_key_file.exists());

        containers[0].remove_bootstrap_key(&mut engine).unwrap();
    }

    #[test]
    fn test_hook_protector_seal_builds_hook_key_data() {
        let dir = tempfile::tempdir().unwrap();
        let model_params = models::sample_model_params(dir.path());
        let params = HookSealParams {
            model_params: &model_params,
            primary_key_file: dir.path().join("aux.key"),
            role: "run".to_string(),
        };
        let runner = crate::testutils::ScriptedHookRunner::replying(
            br#"{"encrypted-key":"BAUG","handle":{"v":3}}"#.to_vec(),
        );
        let mut engine = MemoryLuks2::new();
        let mut containers = vec![bootstrapped(&mut engine, "/dev/vda4")];
        let requests = vec![SealKeyRequest {
            container: 0,
            key_name: "ubuntu-data".to_string(),
            slot_name: "default".to_string(),
            key_file: None,
        }];

        let primary = seal_keys_with_hook_protector(
            &runner,
            &mut engine,
            &mut containers,
            &requests,
            &params,
        )
        .unwrap();

        let token = container::read_token(&engine, containers[0].device(), "default")
            .unwrap()
            .unwrap();
        assert_eq!(token.platform_name, PlatformName::FdeHookV3);
        assert_eq!(token.encrypted_payload, vec![4, 5, 6]);
        assert_eq!(token.platform_handle.as_ref().unwrap().get(), r#"{"v":3}"#);
        assert!(token.is_model_authorized(&primary, &model_params[0].model, "run"));

        // The helper saw one initial-setup request naming the key.
        let requests_seen = runner.requests();
        assert_eq!(requests_seen.len(), 1);
        assert_eq!(requests_seen[0]["op"], "initial-setup");
        assert_eq!(requests_seen[0]["key-name"], "ubuntu-data");

        containers[0].remove_bootstrap_key(&mut engine).unwrap();
    }

    #[test]
    fn test_hook_protector_seal_requires_model_params() {
        let dir = tempfile::tempdir().unwrap();
        let params = HookSealParams {
            model_params: &[],
            primary_key_file: dir.path().join("aux.key"),
            role: "run".to_string(),
        };
        let runner = crate::testutils::ScriptedHookRunner::replying(Vec::new());
        let mut engine = MemoryLuks2::new();
        let mut containers = vec![bootstrapped(&mut engine, "/dev/vda4")];

        let err = seal_keys_with_hook_protector(&runner, &mut engine, &mut containers, &[], &params)
            .unwrap_err();
        assert_eq!(err.tag(), "no-model-params");

        containers[0].remove_bootstrap_key(&mut engine).unwrap();
    }

    #[test]
    fn test_passphrase_seal_records_kdf_params() {
        let dir = tempfile::tempdir().unwrap();
        let model_params = models::sample_model_params(dir.path());
        let mut params = seal_params(&model_params, dir.path());
        params.volumes_auth = Some(VolumesAuthOptions {
            mode: AuthMode::Passphrase,
            kdf_type: Some(KdfType::Argon2id),
            kdf_target_duration_ms: 2000,
            passphrase: Some("correct horse".to_string()),
        });
        let tpm = MockTpm::enabled();
        let mut engine = MemoryLuks2::new();
        let mut containers = vec![bootstrapped(&mut engine, "/dev/vda4")];
        let requests = vec![SealKeyRequest {
            container: 0,
            key_name: "ubuntu-data".to_string(),
            slot_name: "default".to_string(),
            key_file: None,
        }];

        seal_keys(
            &tpm,
            &mut engine,
            &NoContainers,
            &mut containers,
            &requests,
            &params,
        )
        .unwrap();

        let token = container::read_token(&engine, containers[0].device(), "default")
            .unwrap()
            .unwrap();
        let kdf = token.kdf.unwrap();
        assert_eq!(kdf.kdf_type, KdfType::Argon2id);
        assert_eq!(kdf.target_duration_ms, 2000);

        containers[0].remove_bootstrap_key(&mut engine).unwrap();
    }
}
