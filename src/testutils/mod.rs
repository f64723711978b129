//! In-memory mock backends for the consumed interfaces: the LUKS2 engine,
//! the TPM library, partition discovery, the activation facility, the
//! hook helper, and the snap container reader.
//!
//! Exposed behind the `test-utilities` feature so consumers can reuse
//! them in their own tests.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Error};
use enumflags2::BitFlags;
use serde_json::value::RawValue;

use sysdefs::tpm2::{NvHandle, Pcr};

use crate::container::{FormatOptions, Luks2, NativeRenameError, SlotToken};
use crate::hooks::{HookRequest, HookRunner};
use crate::keydata::{KdfParams, KeyData};
use crate::keys::PrimaryKey;
use crate::profile::{Model, PcrProfile, SnapImageReader};
use crate::tpm::{ProvisionMode, SealedKeyBlob, Tpm, TpmConnectError, TpmConnection};
use crate::unlock::{
    ActivateError, ActivateOptions, Activator, Disk, DiskProbeError, HookRevealerVersion,
    PartitionInfo, UnlockContext,
};

// ---------------------------------------------------------------------------
// LUKS2 engine

#[derive(Debug, Default)]
struct MemoryDevice {
    keyslots: BTreeMap<u32, Vec<u8>>,
    tokens: BTreeMap<u32, SlotToken>,
    next_keyslot: u32,
    next_token: u32,
}

/// In-memory [`Luks2`] engine.
#[derive(Debug, Default)]
pub struct MemoryLuks2 {
    devices: HashMap<PathBuf, MemoryDevice>,
    native_rename: bool,
}

impl MemoryLuks2 {
    pub fn new() -> Self {
        MemoryLuks2::default()
    }

    /// Toggles native token rename support, to exercise the manager's
    /// copy-then-remove fallback.
    pub fn set_native_rename(&mut self, supported: bool) {
        self.native_rename = supported;
    }

    fn device(&self, device: &Path) -> Result<&MemoryDevice, Error> {
        self.devices
            .get(device)
            .ok_or_else(|| anyhow!("'{}' is not a LUKS2 container", device.display()))
    }

    fn device_mut(&mut self, device: &Path) -> Result<&mut MemoryDevice, Error> {
        self.devices
            .get_mut(device)
            .ok_or_else(|| anyhow!("'{}' is not a LUKS2 container", device.display()))
    }
}

impl Luks2 for MemoryLuks2 {
    fn format(
        &mut self,
        device: &Path,
        _label: &str,
        key: &[u8],
        _opts: &FormatOptions,
    ) -> Result<(), Error> {
        let mut state = MemoryDevice::default();
        state.keyslots.insert(0, key.to_vec());
        state.next_keyslot = 1;
        self.devices.insert(device.to_path_buf(), state);
        Ok(())
    }

    fn add_key(
        &mut self,
        device: &Path,
        existing_key: &[u8],
        new_key: &[u8],
    ) -> Result<u32, Error> {
        let state = self.device_mut(device)?;
        if !state.keyslots.values().any(|k| k == existing_key) {
            bail!("No keyslot matches the provided key");
        }
        let keyslot = state.next_keyslot;
        state.next_keyslot += 1;
        state.keyslots.insert(keyslot, new_key.to_vec());
        Ok(keyslot)
    }

    fn kill_slot(&mut self, device: &Path, keyslot: u32) -> Result<(), Error> {
        let state = self.device_mut(device)?;
        state
            .keyslots
            .remove(&keyslot)
            .map(|_| ())
            .ok_or_else(|| anyhow!("Keyslot {} does not exist", keyslot))
    }

    fn verify_key(&self, device: &Path, key: &[u8], keyslot: Option<u32>) -> Result<bool, Error> {
        let state = self.device(device)?;
        Ok(match keyslot {
            Some(slot) => state.keyslots.get(&slot).map(|k| k == key).unwrap_or(false),
            None => state.keyslots.values().any(|k| k == key),
        })
    }

    fn tokens(&self, device: &Path) -> Result<Vec<(u32, SlotToken)>, Error> {
        let state = self.device(device)?;
        Ok(state.tokens.iter().map(|(id, t)| (*id, t.clone())).collect())
    }

    fn import_token(
        &mut self,
        device: &Path,
        token: &SlotToken,
        replace_id: Option<u32>,
    ) -> Result<(), Error> {
        let state = self.device_mut(device)?;
        match replace_id {
            Some(id) => {
                if !state.tokens.contains_key(&id) {
                    bail!("Token {} does not exist", id);
                }
                state.tokens.insert(id, token.clone());
            }
            None => {
                let id = state.next_token;
                state.next_token += 1;
                state.tokens.insert(id, token.clone());
            }
        }
        Ok(())
    }

    fn remove_token(&mut self, device: &Path, token_id: u32) -> Result<(), Error> {
        let state = self.device_mut(device)?;
        state
            .tokens
            .remove(&token_id)
            .map(|_| ())
            .ok_or_else(|| anyhow!("Token {} does not exist", token_id))
    }

    fn rename_token(
        &mut self,
        device: &Path,
        old: &str,
        new: &str,
    ) -> Result<(), NativeRenameError> {
        if !self.native_rename {
            return Err(NativeRenameError::Unsupported);
        }
        let state = self
            .device_mut(device)
            .map_err(NativeRenameError::Other)?;
        if state.tokens.values().any(|t| t.name == new) {
            return Err(NativeRenameError::Other(anyhow!(
                "Token '{}' already exists",
                new
            )));
        }
        match state.tokens.values_mut().find(|t| t.name == old) {
            Some(token) => {
                token.name = new.to_string();
                Ok(())
            }
            None => Err(NativeRenameError::Other(anyhow!(
                "Token '{}' does not exist",
                old
            ))),
        }
    }

    fn is_luks2(&self, device: &Path) -> bool {
        self.devices.contains_key(device)
    }
}

// ---------------------------------------------------------------------------
// TPM

/// Coarse device states for [`MockTpm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TpmBehavior {
    Enabled,
    Disabled,
    InLockout,
    Absent,
    ConnectFails,
}

#[derive(Debug)]
struct MockTpmState {
    behavior: TpmBehavior,
    fail_provision: bool,
    fail_sealing: bool,
    nv_defined: Vec<NvHandle>,
    released: Vec<NvHandle>,
    da_resets: usize,
    revocations: Vec<NvHandle>,
    blocked: BitFlags<Pcr>,
    policy_version: u64,
    epochs_measured: usize,
    models_measured: usize,
}

/// Scriptable [`Tpm`] implementation.
pub struct MockTpm {
    state: Arc<Mutex<MockTpmState>>,
}

impl MockTpm {
    pub fn with_behavior(behavior: TpmBehavior) -> Self {
        MockTpm {
            state: Arc::new(Mutex::new(MockTpmState {
                behavior,
                fail_provision: false,
                fail_sealing: false,
                nv_defined: Vec::new(),
                released: Vec::new(),
                da_resets: 0,
                revocations: Vec::new(),
                blocked: BitFlags::empty(),
                policy_version: 1,
                epochs_measured: 0,
                models_measured: 0,
            })),
        }
    }

    pub fn enabled() -> Self {
        Self::with_behavior(TpmBehavior::Enabled)
    }

    pub fn fail_provision(&self) {
        self.state.lock().unwrap().fail_provision = true;
    }

    pub fn fail_sealing(&self) {
        self.state.lock().unwrap().fail_sealing = true;
    }

    pub fn define_nv_handles(&self, handles: &[NvHandle]) {
        self.state
            .lock()
            .unwrap()
            .nv_defined
            .extend_from_slice(handles);
    }

    pub fn released_handles(&self) -> Vec<NvHandle> {
        self.state.lock().unwrap().released.clone()
    }

    pub fn da_resets(&self) -> usize {
        self.state.lock().unwrap().da_resets
    }

    pub fn revocations(&self) -> Vec<NvHandle> {
        self.state.lock().unwrap().revocations.clone()
    }

    pub fn blocked_pcrs(&self) -> BitFlags<Pcr> {
        self.state.lock().unwrap().blocked
    }

    pub fn measurements(&self) -> (usize, usize) {
        let state = self.state.lock().unwrap();
        (state.epochs_measured, state.models_measured)
    }
}

impl Tpm for MockTpm {
    fn connect(&self) -> Result<Box<dyn TpmConnection>, TpmConnectError> {
        let behavior = self.state.lock().unwrap().behavior;
        match behavior {
            TpmBehavior::Absent => Err(TpmConnectError::NoDevice),
            TpmBehavior::ConnectFails => {
                Err(TpmConnectError::Failed(anyhow!("transport error")))
            }
            _ => Ok(Box::new(MockTpmConnection {
                state: Arc::clone(&self.state),
            })),
        }
    }
}

#[derive(Debug)]
struct MockTpmConnection {
    state: Arc<Mutex<MockTpmState>>,
}

impl MockTpmConnection {
    fn make_handle(version: u64, counter: NvHandle, role: &str) -> Box<RawValue> {
        RawValue::from_string(format!(
            r#"{{"policy_version":{},"counter":{},"role":"{}"}}"#,
            version, counter.0, role
        ))
        .expect("valid JSON")
    }
}

impl TpmConnection for MockTpmConnection {
    fn enabled(&mut self) -> Result<bool, Error> {
        Ok(self.state.lock().unwrap().behavior != TpmBehavior::Disabled)
    }

    fn in_lockout(&mut self) -> Result<bool, Error> {
        Ok(self.state.lock().unwrap().behavior == TpmBehavior::InLockout)
    }

    fn provision(&mut self, _mode: ProvisionMode, _lockout_auth: &[u8]) -> Result<(), Error> {
        if self.state.lock().unwrap().fail_provision {
            bail!("TPM provisioning refused");
        }
        Ok(())
    }

    fn dictionary_attack_lock_reset(&mut self, _lockout_auth: &[u8]) -> Result<(), Error> {
        self.state.lock().unwrap().da_resets += 1;
        Ok(())
    }

    fn block_pcr_policies(&mut self, pcrs: BitFlags<Pcr>) -> Result<(), Error> {
        self.state.lock().unwrap().blocked |= pcrs;
        Ok(())
    }

    fn nv_release(&mut self, handle: NvHandle) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        match state.nv_defined.iter().position(|h| *h == handle) {
            Some(index) => {
                state.nv_defined.remove(index);
                state.released.push(handle);
                Ok(())
            }
            None => bail!("NV handle {} is not defined", handle),
        }
    }

    fn nv_handles(&mut self, first: NvHandle, count: u32) -> Result<Vec<NvHandle>, Error> {
        let state = self.state.lock().unwrap();
        let range = first.0..first.0.saturating_add(count);
        let mut handles: Vec<NvHandle> = state
            .nv_defined
            .iter()
            .filter(|h| range.contains(&h.0))
            .copied()
            .collect();
        handles.sort();
        Ok(handles)
    }

    fn seal_pcr_protected(
        &mut self,
        _profile: &PcrProfile,
        policy_counter: NvHandle,
        role: &str,
        payload: &[u8],
    ) -> Result<SealedKeyBlob, Error> {
        let state = self.state.lock().unwrap();
        if state.fail_sealing {
            bail!("TPM refused to seal");
        }
        Ok(SealedKeyBlob {
            encrypted_payload: payload.to_vec(),
            handle: Self::make_handle(state.policy_version, policy_counter, role),
        })
    }

    fn seal_passphrase_protected(
        &mut self,
        profile: &PcrProfile,
        policy_counter: NvHandle,
        role: &str,
        _kdf: &KdfParams,
        _passphrase: &str,
        payload: &[u8],
    ) -> Result<SealedKeyBlob, Error> {
        self.seal_pcr_protected(profile, policy_counter, role, payload)
    }

    fn update_keys_policy(
        &mut self,
        _profile: &PcrProfile,
        keys: &mut [KeyData],
        _primary: &PrimaryKey,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.policy_version += 1;
        for key in keys {
            let counter = key
                .platform_handle
                .as_ref()
                .and_then(|h| serde_json::from_str::<serde_json::Value>(h.get()).ok())
                .and_then(|v| v["counter"].as_u64())
                .unwrap_or(0) as u32;
            key.platform_handle = Some(Self::make_handle(
                state.policy_version,
                NvHandle(counter),
                &key.role,
            ));
        }
        Ok(())
    }

    fn update_legacy_keys_policy(
        &mut self,
        _profile: &PcrProfile,
        objects: &mut [Vec<u8>],
        _primary: &PrimaryKey,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.policy_version += 1;
        for object in objects {
            object.extend_from_slice(&state.policy_version.to_be_bytes());
        }
        Ok(())
    }

    fn revoke_prior_policies(
        &mut self,
        policy_counter: NvHandle,
        _primary: &PrimaryKey,
    ) -> Result<(), Error> {
        self.state.lock().unwrap().revocations.push(policy_counter);
        Ok(())
    }

    fn measure_epoch(&mut self) -> Result<(), Error> {
        self.state.lock().unwrap().epochs_measured += 1;
        Ok(())
    }

    fn measure_model(&mut self, _model: &Model) -> Result<(), Error> {
        self.state.lock().unwrap().models_measured += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Disks

/// Label-to-partition map standing in for a physical disk.
#[derive(Debug, Default)]
pub struct MockDisk {
    labels: HashMap<String, PartitionInfo>,
}

impl MockDisk {
    pub fn new() -> Self {
        MockDisk::default()
    }

    pub fn add_label(&mut self, label: &str, info: PartitionInfo) {
        self.labels.insert(label.to_string(), info);
    }
}

impl Disk for MockDisk {
    fn partition_by_label(&self, label: &str) -> Result<PartitionInfo, DiskProbeError> {
        self.labels
            .get(label)
            .cloned()
            .ok_or(DiskProbeError::LabelNotFound)
    }
}

// ---------------------------------------------------------------------------
// Activation

/// Scripted outcome of key data activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivatorScript {
    Succeed,
    RecoveryKeyUsed,
    Fail,
}

/// One recorded `activate_with_key_data` call, including the ambient
/// context observed at call time.
pub struct KeyDataCall {
    pub volume_name: String,
    pub source_device: PathBuf,
    pub keys: Vec<KeyData>,
    pub options: ActivateOptions,
    pub model: Option<Model>,
    pub boot_mode: Option<String>,
    pub protector_key: Option<Vec<u8>>,
    pub revealer: Option<HookRevealerVersion>,
}

/// Recording [`Activator`] with scripted outcomes.
pub struct MockActivator {
    script: ActivatorScript,
    fail_raw: bool,
    key_data_calls: Vec<KeyDataCall>,
    raw_calls: usize,
}

impl MockActivator {
    pub fn new(script: ActivatorScript) -> Self {
        MockActivator {
            script,
            fail_raw: false,
            key_data_calls: Vec::new(),
            raw_calls: 0,
        }
    }

    pub fn fail_raw_key(&mut self) {
        self.fail_raw = true;
    }

    pub fn last_key_data_call(&self) -> Option<&KeyDataCall> {
        self.key_data_calls.last()
    }

    pub fn raw_key_calls(&self) -> usize {
        self.raw_calls
    }
}

impl Activator for MockActivator {
    fn activate_with_key_data(
        &mut self,
        ctx: &UnlockContext,
        volume_name: &str,
        source_device: &Path,
        keys: &[KeyData],
        options: &ActivateOptions,
    ) -> Result<(), ActivateError> {
        self.key_data_calls.push(KeyDataCall {
            volume_name: volume_name.to_string(),
            source_device: source_device.to_path_buf(),
            keys: keys.to_vec(),
            options: options.clone(),
            model: ctx.model().cloned(),
            boot_mode: ctx.boot_mode().map(|m| m.to_string()),
            protector_key: ctx.protector_key().map(|k| k.to_vec()),
            revealer: ctx.revealer(),
        });
        match self.script {
            ActivatorScript::Succeed => Ok(()),
            ActivatorScript::RecoveryKeyUsed => Err(ActivateError::RecoveryKeyUsed),
            ActivatorScript::Fail => Err(ActivateError::Failed(anyhow!("no key unsealed"))),
        }
    }

    fn activate_with_recovery_key(
        &mut self,
        _volume_name: &str,
        _source_device: &Path,
        _options: &ActivateOptions,
    ) -> Result<(), ActivateError> {
        match self.script {
            ActivatorScript::Fail => Err(ActivateError::Failed(anyhow!("bad recovery key"))),
            _ => Ok(()),
        }
    }

    fn activate_with_raw_key(
        &mut self,
        _volume_name: &str,
        _source_device: &Path,
        _key: &[u8],
    ) -> Result<(), Error> {
        self.raw_calls += 1;
        if self.fail_raw {
            bail!("raw key did not activate the volume");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Hook helper

/// [`HookRunner`] that records requests and answers each with the same
/// canned bytes.
pub struct ScriptedHookRunner {
    reply: Vec<u8>,
    requests: RefCell<Vec<serde_json::Value>>,
}

impl ScriptedHookRunner {
    pub fn replying(reply: Vec<u8>) -> Self {
        ScriptedHookRunner {
            reply,
            requests: RefCell::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<serde_json::Value> {
        self.requests.borrow().clone()
    }
}

impl HookRunner for ScriptedHookRunner {
    fn run(&self, request: &HookRequest) -> Result<Vec<u8>, diskseal_api::error::SealError> {
        self.requests
            .borrow_mut()
            .push(serde_json::to_value(request).expect("serializable request"));
        Ok(self.reply.clone())
    }
}

// ---------------------------------------------------------------------------
// Containers and models

/// [`SnapImageReader`] for tests that only use on-disk images.
pub struct NoContainers;

impl SnapImageReader for NoContainers {
    fn read_member(&self, container: &Path, member: &str) -> Result<Vec<u8>, Error> {
        bail!(
            "no container support in tests (asked for '{}' from '{}')",
            member,
            container.display()
        )
    }
}

/// Canned models and model parameters.
pub mod models {
    use std::path::Path;

    use crate::profile::loadchain::{ImageRef, ImageSource, LoadChain};
    use crate::profile::{Model, ModelParams};

    pub fn sample_model() -> Model {
        Model {
            series: "16".to_string(),
            brand_id: "generic".to_string(),
            model: "generic-classic".to_string(),
            grade: "signed".to_string(),
            sign_key_id: "key-id".to_string(),
        }
    }

    /// One model-params set over a three-image chain materialized in
    /// `dir`.
    pub fn sample_model_params(dir: &Path) -> Vec<ModelParams> {
        let mut chain = LoadChain::new();
        let mut previous = None;
        for (i, name) in ["shim.efi", "grub.efi", "kernel.efi"].iter().enumerate() {
            let path = dir.join(name);
            std::fs::write(&path, name.as_bytes()).expect("write test image");
            let source = if i == 0 {
                ImageSource::Firmware
            } else {
                ImageSource::Shim
            };
            let node = chain.add_node(source, ImageRef::Path(path));
            match previous {
                None => chain.add_root(node),
                Some(parent) => chain.add_child(parent, node),
            }
            previous = Some(node);
        }

        vec![ModelParams {
            load_chains: vec![chain],
            kernel_cmdlines: vec!["console=ttyS0 root=/dev/mapper/ubuntu-data".to_string()],
            model: sample_model(),
            boot_modes: vec!["run".to_string(), "recover".to_string()],
            sig_db_update: None,
        }]
    }
}
