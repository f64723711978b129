//! Resealing: rebinding already-sealed keys to an updated PCR profile,
//! then revoking the policy versions the old records were bound to.

use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use diskseal_api::error::{
    InternalError, KeyDataError, ReportError, SealError, SealingError,
};
use sysdefs::tpm2::{NvHandle, LEGACY_FALLBACK_POLICY_COUNTER, LEGACY_RUN_POLICY_COUNTER};

use crate::container::{self, Luks2};
use crate::keydata::{load_key_file, KeyData, KeyFileKind};
use crate::keyring;
use crate::keys::PrimaryKey;
use crate::profile::PcrProfile;
use crate::tpm::TpmConnection;

/// One key to reseal, addressed by device and slot name, with an optional
/// standalone file fallback.
#[derive(Debug, Clone)]
pub struct ResealKeyLocation {
    pub device: PathBuf,
    pub slot_name: String,
    pub key_file: Option<PathBuf>,
}

enum LoadedKey {
    Modern {
        key_data: KeyData,
        /// None means the record came from (and goes back to) the token.
        file: Option<PathBuf>,
    },
    Legacy {
        object: Vec<u8>,
        file: PathBuf,
    },
}

fn load_location(engine: &dyn Luks2, location: &ResealKeyLocation) -> Result<LoadedKey, SealError> {
    let token_result = container::read_token(engine, &location.device, &location.slot_name);
    let token_error = match token_result {
        Ok(Some(key_data)) => {
            return Ok(LoadedKey::Modern {
                key_data,
                file: None,
            })
        }
        Ok(None) => format!("no key data token for slot '{}'", location.slot_name),
        Err(e) => format!("reading token for slot '{}': {:?}", location.slot_name, e),
    };

    let Some(file) = &location.key_file else {
        return Err(SealError::new(KeyDataError::KeyDataMissing {
            slot_name: location.slot_name.clone(),
            token_error,
        }));
    };

    match load_key_file(file) {
        Ok(KeyFileKind::KeyData(key_data)) => Ok(LoadedKey::Modern {
            key_data,
            file: Some(file.clone()),
        }),
        Ok(KeyFileKind::LegacySealedObject(object)) => Ok(LoadedKey::Legacy {
            object,
            file: file.clone(),
        }),
        Ok(KeyFileKind::LegacyFdeHookRawV1(_)) => {
            Err(SealError::new(KeyDataError::KeyDataMalformed {
                source_desc: format!("{} (raw hook blobs cannot be resealed)", file.display()),
            }))
        }
        Err(e) => Err(SealError::with_source(
            KeyDataError::KeyDataMissing {
                slot_name: location.slot_name.clone(),
                token_error: format!("{}; fallback file '{}' unusable", token_error, file.display()),
            },
            e,
        )),
    }
}

/// Reseals every location against `profile`.
///
/// Two flavors exist: legacy pre-KeyData sealed objects and modern
/// KeyData records. A batch must be uniformly one or the other; the
/// modern path rebinds all records under a single policy-version bump,
/// the legacy path updates the objects and then revokes the two
/// well-known legacy counters. Updated records are persisted before any
/// revocation, so a failure in between leaves the keys usable under the
/// new policy and the next reseal retries the revocation.
pub fn reseal_keys(
    conn: &mut dyn TpmConnection,
    engine: &mut dyn Luks2,
    profile: &PcrProfile,
    locations: &[ResealKeyLocation],
    primary: &PrimaryKey,
    policy_counter: NvHandle,
) -> Result<(), SealError> {
    let mut loaded = Vec::with_capacity(locations.len());
    for location in locations {
        loaded.push((location, load_location(engine, location)?));
    }

    let any_legacy = loaded
        .iter()
        .any(|(_, key)| matches!(key, LoadedKey::Legacy { .. }));
    if any_legacy {
        let all_legacy = loaded
            .iter()
            .all(|(_, key)| matches!(key, LoadedKey::Legacy { .. }));
        if !all_legacy {
            return Err(SealError::new(InternalError::Internal(
                "cannot reseal a mix of legacy and modern key records",
            )));
        }
        return reseal_legacy(conn, profile, loaded, primary);
    }

    reseal_modern(conn, engine, profile, loaded, primary, policy_counter)
}

fn reseal_modern(
    conn: &mut dyn TpmConnection,
    engine: &mut dyn Luks2,
    profile: &PcrProfile,
    loaded: Vec<(&ResealKeyLocation, LoadedKey)>,
    primary: &PrimaryKey,
    policy_counter: NvHandle,
) -> Result<(), SealError> {
    let mut keys = Vec::with_capacity(loaded.len());
    let mut destinations = Vec::with_capacity(loaded.len());
    for (location, key) in loaded {
        let LoadedKey::Modern { key_data, file } = key else {
            unreachable!("legacy keys filtered by caller");
        };
        keys.push(key_data);
        destinations.push((location, file));
    }

    conn.update_keys_policy(profile, &mut keys, primary)
        .map_err(|e| {
            let (location, _) = &destinations[0];
            SealError::with_source(
                SealingError::ResealKey {
                    device: location.device.clone(),
                    slot_name: location.slot_name.clone(),
                },
                e,
            )
        })?;

    for (key_data, (location, file)) in keys.iter().zip(&destinations) {
        match file {
            Some(path) => {
                let json = key_data
                    .to_json()
                    .structured(InternalError::Internal("could not serialize key data"))?;
                osutils::files::atomic_write_mode(path, 0o600, &json).structured(
                    SealingError::ResealKey {
                        device: location.device.clone(),
                        slot_name: location.slot_name.clone(),
                    },
                )?;
            }
            None => {
                container::write_token(engine, &location.device, &location.slot_name, key_data)?;
            }
        }
        debug!(
            "Updated key data for slot '{}' of '{}'",
            location.slot_name,
            location.device.display()
        );
    }

    conn.revoke_prior_policies(policy_counter, primary)
        .structured(SealingError::RevokePolicies {
            counter: policy_counter,
        })?;
    info!(
        "Resealed {} keys and revoked prior policies under {}",
        destinations.len(),
        policy_counter
    );
    Ok(())
}

fn reseal_legacy(
    conn: &mut dyn TpmConnection,
    profile: &PcrProfile,
    loaded: Vec<(&ResealKeyLocation, LoadedKey)>,
    primary: &PrimaryKey,
) -> Result<(), SealError> {
    let mut objects = Vec::with_capacity(loaded.len());
    let mut files = Vec::with_capacity(loaded.len());
    for (location, key) in loaded {
        let LoadedKey::Legacy { object, file } = key else {
            unreachable!("modern keys filtered by caller");
        };
        objects.push(object);
        files.push((location, file));
    }

    conn.update_legacy_keys_policy(profile, &mut objects, primary)
        .map_err(|e| {
            let (location, _) = &files[0];
            SealError::with_source(
                SealingError::ResealKey {
                    device: location.device.clone(),
                    slot_name: location.slot_name.clone(),
                },
                e,
            )
        })?;

    for (object, (location, file)) in objects.iter().zip(&files) {
        osutils::files::atomic_write_mode(file, 0o600, object).structured(
            SealingError::ResealKey {
                device: location.device.clone(),
                slot_name: location.slot_name.clone(),
            },
        )?;
    }

    // The previous scheme kept one policy counter per key.
    for counter in [LEGACY_RUN_POLICY_COUNTER, LEGACY_FALLBACK_POLICY_COUNTER] {
        conn.revoke_prior_policies(counter, primary)
            .structured(SealingError::RevokePolicies { counter })?;
    }

    // Best effort: the well-known counters are no longer allocated by the
    // current scheme, so try to give the NV space back.
    if let Err(e) = crate::tpm::release_handles(
        conn,
        &[LEGACY_RUN_POLICY_COUNTER, LEGACY_FALLBACK_POLICY_COUNTER],
    ) {
        warn!("Could not release legacy policy counters: {:?}", e);
    }

    info!("Resealed {} legacy sealed objects", files.len());
    Ok(())
}

/// Recovers the primary key for resealing: first from the kernel keyring
/// (trying the device path and each of its devlinks), then from the
/// primary key file.
pub fn recover_primary_key(
    device_path: &Path,
    primary_key_file: Option<&Path>,
) -> Result<PrimaryKey, SealError> {
    let devlinks = match osutils::devlinks::device_symlinks(device_path) {
        Ok(links) => links,
        Err(e) => {
            warn!(
                "Could not enumerate devlinks for '{}': {}",
                device_path.display(),
                e
            );
            Vec::new()
        }
    };

    if let Some(key) = keyring::find_primary_key(device_path, &devlinks) {
        return Ok(key);
    }

    let Some(file) = primary_key_file else {
        return Err(SealError::new(InternalError::Internal(
            "primary key is neither in the kernel keyring nor available as a file",
        )));
    };
    PrimaryKey::load(file).structured(InternalError::Internal(
        "could not read primary key file",
    ))
}
