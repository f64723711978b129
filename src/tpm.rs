//! TPM gate: connection probing, provisioning, NV handle management, and
//! the trait surface of the consumed TPM 2.0 library.
//!
//! The wire protocol lives entirely behind [`Tpm`] and [`TpmConnection`];
//! this module owns the policy around those primitives: lockout-auth file
//! hygiene, aggregated handle release, and the reserved policy-counter
//! block scan.

use std::path::Path;

use anyhow::Error;
use enumflags2::BitFlags;
use log::debug;
use rand::rngs::OsRng;
use rand::TryRngCore;
use serde_json::value::RawValue;

use diskseal_api::error::{ReportError, SealError, TpmError};
use sysdefs::tpm2::{
    NvHandle, Pcr, LEGACY_FALLBACK_POLICY_COUNTER, LEGACY_RUN_POLICY_COUNTER,
    PCR_POLICY_COUNTER_BLOCK_LEN, PCR_POLICY_COUNTER_BLOCK_START,
};

use crate::keydata::{KdfParams, KeyData};
use crate::keys::PrimaryKey;
use crate::profile::{Model, PcrProfile};

/// Size in bytes of the lockout hierarchy authorization value.
pub const LOCKOUT_AUTH_SIZE: usize = 16;

/// Provisioning flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionMode {
    /// Generate a fresh lockout authorization and fully provision.
    Full,
    /// Re-run provisioning with the previously stored lockout
    /// authorization.
    PartialReprovision,
    /// Provision without touching the lockout hierarchy, with a
    /// caller-managed storage root key.
    WithoutLockoutWithCustomSrk,
}

/// How a device's unlock keys are protected, for operations that behave
/// differently per protector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SealingMethod {
    Tpm,
    Hook,
}

/// Connection failure. `NoDevice` is distinguishable so
/// measurement-when-possible callers can skip TPM paths without erroring.
#[derive(Debug, thiserror::Error)]
pub enum TpmConnectError {
    #[error("no TPM 2.0 device")]
    NoDevice,
    #[error("TPM connection failed")]
    Failed(#[source] anyhow::Error),
}

/// A sealed key produced by the TPM library: the encrypted payload plus
/// the opaque platform handle that must round-trip through KeyData JSON.
#[derive(Debug)]
pub struct SealedKeyBlob {
    pub encrypted_payload: Vec<u8>,
    pub handle: Box<RawValue>,
}

/// Entry point of the consumed TPM 2.0 library.
pub trait Tpm {
    fn connect(&self) -> Result<Box<dyn TpmConnection>, TpmConnectError>;
}

/// An open channel to the TPM device. Not safe for concurrent use; do not
/// share a connection across threads.
pub trait TpmConnection: std::fmt::Debug {
    fn enabled(&mut self) -> Result<bool, Error>;
    fn in_lockout(&mut self) -> Result<bool, Error>;

    fn provision(&mut self, mode: ProvisionMode, lockout_auth: &[u8]) -> Result<(), Error>;
    fn dictionary_attack_lock_reset(&mut self, lockout_auth: &[u8]) -> Result<(), Error>;

    /// Prevents any later code path from satisfying PCR policies over the
    /// given registers.
    fn block_pcr_policies(&mut self, pcrs: BitFlags<Pcr>) -> Result<(), Error>;

    fn nv_release(&mut self, handle: NvHandle) -> Result<(), Error>;
    /// Occupied NV handles starting at `first`, capped at `count` entries.
    fn nv_handles(&mut self, first: NvHandle, count: u32) -> Result<Vec<NvHandle>, Error>;

    fn seal_pcr_protected(
        &mut self,
        profile: &PcrProfile,
        policy_counter: NvHandle,
        role: &str,
        payload: &[u8],
    ) -> Result<SealedKeyBlob, Error>;

    fn seal_passphrase_protected(
        &mut self,
        profile: &PcrProfile,
        policy_counter: NvHandle,
        role: &str,
        kdf: &KdfParams,
        passphrase: &str,
        payload: &[u8],
    ) -> Result<SealedKeyBlob, Error>;

    /// Rebinds every record to `profile` under a single new policy
    /// version.
    fn update_keys_policy(
        &mut self,
        profile: &PcrProfile,
        keys: &mut [KeyData],
        primary: &PrimaryKey,
    ) -> Result<(), Error>;

    /// Legacy path: rebinds pre-KeyData sealed objects in place.
    fn update_legacy_keys_policy(
        &mut self,
        profile: &PcrProfile,
        objects: &mut [Vec<u8>],
        primary: &PrimaryKey,
    ) -> Result<(), Error>;

    /// Makes every policy version older than the current one unusable.
    fn revoke_prior_policies(
        &mut self,
        policy_counter: NvHandle,
        primary: &PrimaryKey,
    ) -> Result<(), Error>;

    fn measure_epoch(&mut self) -> Result<(), Error>;
    fn measure_model(&mut self, model: &Model) -> Result<(), Error>;
}

/// Observable states of the TPM device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TpmDeviceState {
    Absent,
    PresentDisabled,
    PresentEnabled,
    PresentInLockout,
}

/// Connects to the TPM, mapping the two failure shapes onto their stable
/// tags.
pub fn connect(tpm: &dyn Tpm) -> Result<Box<dyn TpmConnection>, SealError> {
    tpm.connect().map_err(|e| match e {
        TpmConnectError::NoDevice => SealError::new(TpmError::NoTpmDevice),
        TpmConnectError::Failed(source) => {
            SealError::with_source(TpmError::TpmConnectFailed, source)
        }
    })
}

/// Probes which of the four observable device states applies.
pub fn device_state(tpm: &dyn Tpm) -> Result<TpmDeviceState, SealError> {
    let mut conn = match tpm.connect() {
        Ok(conn) => conn,
        Err(TpmConnectError::NoDevice) => return Ok(TpmDeviceState::Absent),
        Err(TpmConnectError::Failed(source)) => {
            return Err(SealError::with_source(TpmError::TpmConnectFailed, source));
        }
    };
    if !conn.enabled().structured(TpmError::TpmConnectFailed)? {
        return Ok(TpmDeviceState::PresentDisabled);
    }
    if conn.in_lockout().structured(TpmError::TpmConnectFailed)? {
        return Ok(TpmDeviceState::PresentInLockout);
    }
    Ok(TpmDeviceState::PresentEnabled)
}

/// Fails with the matching tag unless the device is present, enabled, and
/// not in lockout.
pub fn ensure_operational(tpm: &dyn Tpm) -> Result<(), SealError> {
    match device_state(tpm)? {
        TpmDeviceState::Absent => Err(SealError::new(TpmError::NoTpmDevice)),
        TpmDeviceState::PresentDisabled => Err(SealError::new(TpmError::TpmDisabled)),
        TpmDeviceState::PresentInLockout => Err(SealError::new(TpmError::TpmInLockout)),
        TpmDeviceState::PresentEnabled => Ok(()),
    }
}

/// Measures the boot epoch and the device model into the TPM when one is
/// available. A missing device is a non-error here.
pub fn measure_when_possible(tpm: &dyn Tpm, model: &Model) -> Result<(), SealError> {
    let mut conn = match tpm.connect() {
        Ok(conn) => conn,
        Err(TpmConnectError::NoDevice) => return Ok(()),
        Err(TpmConnectError::Failed(source)) => {
            return Err(SealError::with_source(TpmError::TpmConnectFailed, source));
        }
    };
    conn.measure_epoch().structured(TpmError::TpmConnectFailed)?;
    conn.measure_model(model)
        .structured(TpmError::TpmConnectFailed)
}

/// Provisions the TPM.
///
/// In full mode a fresh lockout authorization is generated and written to
/// `lockout_auth_file` atomically with mode 0600 before the TPM
/// transaction; if the transaction then fails the file is removed again.
/// Partial reprovisioning reads the existing file and fails with a
/// distinguishable error when it is absent.
pub fn provision(
    conn: &mut dyn TpmConnection,
    mode: ProvisionMode,
    lockout_auth_file: &Path,
) -> Result<(), SealError> {
    match mode {
        ProvisionMode::Full => {
            let mut auth = [0u8; LOCKOUT_AUTH_SIZE];
            OsRng
                .try_fill_bytes(&mut auth)
                .structured(TpmError::TpmProvisioningFailed)?;
            osutils::files::atomic_write_mode(lockout_auth_file, 0o600, &auth)
                .structured(TpmError::TpmProvisioningFailed)?;

            if let Err(e) = conn.provision(mode, &auth) {
                if let Err(remove_err) = std::fs::remove_file(lockout_auth_file) {
                    debug!(
                        "Could not remove stale lockout auth file '{}': {}",
                        lockout_auth_file.display(),
                        remove_err
                    );
                }
                return Err(e).structured(TpmError::TpmProvisioningFailed);
            }
            Ok(())
        }
        ProvisionMode::PartialReprovision => {
            if !lockout_auth_file.exists() {
                return Err(SealError::new(TpmError::LockoutAuthMissing {
                    path: lockout_auth_file.to_path_buf(),
                }));
            }
            let auth = osutils::files::read_exact_file(lockout_auth_file, LOCKOUT_AUTH_SIZE)
                .structured(TpmError::TpmProvisioningFailed)?;
            conn.provision(mode, &auth)
                .structured(TpmError::TpmProvisioningFailed)
        }
        ProvisionMode::WithoutLockoutWithCustomSrk => conn
            .provision(mode, &[])
            .structured(TpmError::TpmProvisioningFailed),
    }
}

/// Blocks PCR policies over `pcrs` so nothing later in boot can unseal.
pub fn block_pcr_policies(
    conn: &mut dyn TpmConnection,
    pcrs: BitFlags<Pcr>,
) -> Result<(), SealError> {
    debug!(
        "Blocking PCR policies over registers {:?}",
        pcrs.iter().map(|p| p.index()).collect::<Vec<_>>()
    );
    conn.block_pcr_policies(pcrs)
        .structured(TpmError::TpmConnectFailed)
}

/// Releases every handle, attempting all of them, and aggregates the
/// per-handle failures into a single error.
pub fn release_handles(
    conn: &mut dyn TpmConnection,
    handles: &[NvHandle],
) -> Result<(), SealError> {
    let mut failures = Vec::new();
    for handle in handles {
        if let Err(e) = conn.nv_release(*handle) {
            failures.push(format!("{}: {}", handle, e));
        }
    }
    if failures.is_empty() {
        Ok(())
    } else {
        Err(SealError::new(TpmError::ReleaseHandles {
            summary: failures.join("; "),
        }))
    }
}

/// Scans the reserved policy-counter block and returns the first handle
/// that is neither occupied nor one of the legacy well-known counters.
pub fn find_free_handle(conn: &mut dyn TpmConnection) -> Result<NvHandle, SealError> {
    let occupied = conn
        .nv_handles(PCR_POLICY_COUNTER_BLOCK_START, PCR_POLICY_COUNTER_BLOCK_LEN)
        .structured(TpmError::TpmConnectFailed)?;

    let start = PCR_POLICY_COUNTER_BLOCK_START.0;
    for value in start..start + PCR_POLICY_COUNTER_BLOCK_LEN {
        let candidate = NvHandle(value);
        if candidate == LEGACY_RUN_POLICY_COUNTER || candidate == LEGACY_FALLBACK_POLICY_COUNTER {
            continue;
        }
        if !occupied.contains(&candidate) {
            return Ok(candidate);
        }
    }
    Err(SealError::new(TpmError::NoFreeNvHandles))
}

/// Acknowledges a successful boot. On a TPM-sealed system the stored
/// lockout authorization is used to reset the dictionary-attack counter.
/// Hook-sealed and unencrypted systems require nothing.
pub fn mark_successful(
    method: Option<SealingMethod>,
    tpm: &dyn Tpm,
    lockout_auth_file: &Path,
) -> Result<(), SealError> {
    match method {
        None | Some(SealingMethod::Hook) => Ok(()),
        Some(SealingMethod::Tpm) => {
            let auth = osutils::files::read_exact_file(lockout_auth_file, LOCKOUT_AUTH_SIZE)
                .structured(TpmError::TpmProvisioningFailed)?;
            let mut conn = connect(tpm)?;
            conn.dictionary_attack_lock_reset(&auth)
                .structured(TpmError::TpmProvisioningFailed)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use diskseal_api::error::ErrorKind;

    use super::*;
    use crate::testutils::{MockTpm, TpmBehavior};

    #[test]
    fn test_connect_no_device_is_distinguishable() {
        let tpm = MockTpm::with_behavior(TpmBehavior::Absent);
        let err = connect(&tpm).unwrap_err();
        assert_eq!(err.tag(), "no-tpm-device");
    }

    #[test]
    fn test_connect_failure_has_its_own_tag() {
        let tpm = MockTpm::with_behavior(TpmBehavior::ConnectFails);
        let err = connect(&tpm).unwrap_err();
        assert_eq!(err.tag(), "tpm-connect-failed");
    }

    #[test]
    fn test_device_state_covers_all_observable_states() {
        let states = [
            (TpmBehavior::Absent, TpmDeviceState::Absent),
            (TpmBehavior::Disabled, TpmDeviceState::PresentDisabled),
            (TpmBehavior::Enabled, TpmDeviceState::PresentEnabled),
            (TpmBehavior::InLockout, TpmDeviceState::PresentInLockout),
        ];
        for (behavior, expected) in states {
            let tpm = MockTpm::with_behavior(behavior);
            assert_eq!(device_state(&tpm).unwrap(), expected);
        }
    }

    #[test]
    fn test_ensure_operational_tags() {
        let cases = [
            (TpmBehavior::Absent, "no-tpm-device"),
            (TpmBehavior::Disabled, "tpm-disabled"),
            (TpmBehavior::InLockout, "tpm-in-lockout"),
        ];
        for (behavior, tag) in cases {
            let tpm = MockTpm::with_behavior(behavior);
            assert_eq!(ensure_operational(&tpm).unwrap_err().tag(), tag);
        }
        ensure_operational(&MockTpm::enabled()).unwrap();
    }

    #[test]
    fn test_measure_when_possible_skips_absent_device() {
        let model = crate::testutils::models::sample_model();

        let tpm = MockTpm::with_behavior(TpmBehavior::Absent);
        measure_when_possible(&tpm, &model).unwrap();

        let tpm = MockTpm::enabled();
        measure_when_possible(&tpm, &model).unwrap();
        assert_eq!(tpm.measurements(), (1, 1));
    }

    #[test]
    fn test_full_provision_writes_auth_file_with_mode_0600() {
        let dir = tempfile::tempdir().unwrap();
        let auth_file = dir.path().join("lockout.auth");
        let tpm = MockTpm::enabled();
        let mut conn = connect(&tpm).unwrap();

        provision(conn.as_mut(), ProvisionMode::Full, &auth_file).unwrap();

        let metadata = std::fs::metadata(&auth_file).unwrap();
        assert_eq!(metadata.len(), LOCKOUT_AUTH_SIZE as u64);
        assert_eq!(metadata.permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn test_full_provision_removes_auth_file_on_tpm_failure() {
        let dir = tempfile::tempdir().unwrap();
        let auth_file = dir.path().join("lockout.auth");
        let tpm = MockTpm::enabled();
        tpm.fail_provision();
        let mut conn = connect(&tpm).unwrap();

        provision(conn.as_mut(), ProvisionMode::Full, &auth_file).unwrap_err();
        assert!(!auth_file.exists());
    }

    #[test]
    fn test_partial_reprovision_requires_auth_file() {
        let dir = tempfile::tempdir().unwrap();
        let auth_file = dir.path().join("lockout.auth");
        let tpm = MockTpm::enabled();
        let mut conn = connect(&tpm).unwrap();

        let err =
            provision(conn.as_mut(), ProvisionMode::PartialReprovision, &auth_file).unwrap_err();
        assert_eq!(
            err.kind(),
            &ErrorKind::Tpm(TpmError::LockoutAuthMissing {
                path: auth_file.clone()
            })
        );

        std::fs::write(&auth_file, [1u8; LOCKOUT_AUTH_SIZE]).unwrap();
        provision(conn.as_mut(), ProvisionMode::PartialReprovision, &auth_file).unwrap();
    }

    #[test]
    fn test_release_handles_attempts_every_handle() {
        let tpm = MockTpm::enabled();
        tpm.define_nv_handles(&[NvHandle(0x0188_0005)]);
        let mut conn = connect(&tpm).unwrap();

        // 0x0188_0004 is not defined so its release fails, but the defined
        // handle after it must still be attempted and released.
        let err = release_handles(
            conn.as_mut(),
            &[NvHandle(0x0188_0004), NvHandle(0x0188_0005)],
        )
        .unwrap_err();
        assert_eq!(err.tag(), "release-handles");
        assert!(format!("{:?}", err).contains("0x01880004"));
        assert!(tpm.released_handles().contains(&NvHandle(0x0188_0005)));
    }

    #[test]
    fn test_find_free_handle_skips_occupied_and_legacy() {
        let tpm = MockTpm::enabled();
        tpm.define_nv_handles(&[PCR_POLICY_COUNTER_BLOCK_START, NvHandle(0x0188_0003)]);
        let mut conn = connect(&tpm).unwrap();

        // 0x01880000 occupied, 0x01880001/2 legacy, 0x01880003 occupied.
        assert_eq!(
            find_free_handle(conn.as_mut()).unwrap(),
            NvHandle(0x0188_0004)
        );
    }

    #[test]
    fn test_mark_successful_is_noop_without_tpm_sealing() {
        let tpm = MockTpm::with_behavior(TpmBehavior::Absent);
        mark_successful(None, &tpm, Path::new("/nonexistent")).unwrap();
        mark_successful(Some(SealingMethod::Hook), &tpm, Path::new("/nonexistent")).unwrap();
    }

    #[test]
    fn test_mark_successful_resets_da_lockout_for_tpm_sealing() {
        let dir = tempfile::tempdir().unwrap();
        let auth_file = dir.path().join("lockout.auth");
        std::fs::write(&auth_file, [7u8; LOCKOUT_AUTH_SIZE]).unwrap();

        let tpm = MockTpm::enabled();
        mark_successful(Some(SealingMethod::Tpm), &tpm, &auth_file).unwrap();
        assert_eq!(tpm.da_resets(), 1);
    }
}
