//! The self-describing per-slot record binding an encrypted key payload to
//! a platform protector, plus the loader that classifies legacy on-disk
//! key files.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{bail, Context, Error};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use sha2::Sha256;

use crate::keys::{DiskUnlockKey, PrimaryKey};
use crate::profile::Model;

type HmacSha256 = Hmac<Sha256>;

/// Magic prefix of pre-KeyData sealed key object files.
const SEALED_OBJECT_MAGIC: &[u8] = b"USK$";

/// Tag selecting the protector mechanism of a key data record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlatformName {
    Tpm2,
    FdeHookV1,
    FdeHookV2,
    FdeHookV3,
    Plainkey,
}

/// KDF selection for passphrase-protected key data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KdfType {
    Argon2i,
    Argon2id,
    Pbkdf2,
}

impl KdfType {
    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "argon2i" => Ok(KdfType::Argon2i),
            "argon2id" => Ok(KdfType::Argon2id),
            "pbkdf2" => Ok(KdfType::Pbkdf2),
            other => Err(other.to_string()),
        }
    }
}

/// KDF parameters recorded alongside a passphrase-protected payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KdfParams {
    #[serde(rename = "type")]
    pub kdf_type: KdfType,
    /// Wall-clock budget the KDF cost was tuned against, in milliseconds.
    pub target_duration_ms: u64,
}

pub(crate) mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// A self-describing key record. Stored either in a LUKS2 token or in a
/// standalone JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyData {
    pub platform_name: PlatformName,

    /// Opaque protector state. Kept as raw JSON so that objects, arrays
    /// and null all survive a round-trip untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_handle: Option<Box<RawValue>>,

    #[serde(with = "base64_bytes")]
    pub encrypted_payload: Vec<u8>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kdf: Option<KdfParams>,

    /// HMACs authorizing (model, boot mode) pairs under the primary key.
    /// Kept sorted so the serialized form is deterministic.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub authorized_models: BTreeSet<String>,

    /// Free-form tag scoping the policies this record participates in.
    pub role: String,
}

impl PartialEq for KeyData {
    fn eq(&self, other: &Self) -> bool {
        self.platform_name == other.platform_name
            && self.platform_handle.as_ref().map(|h| h.get())
                == other.platform_handle.as_ref().map(|h| h.get())
            && self.encrypted_payload == other.encrypted_payload
            && self.kdf == other.kdf
            && self.authorized_models == other.authorized_models
            && self.role == other.role
    }
}

impl KeyData {
    pub fn from_json(data: &[u8]) -> Result<Self, Error> {
        serde_json::from_slice(data).context("Malformed key data JSON")
    }

    pub fn to_json(&self) -> Result<Vec<u8>, Error> {
        serde_json::to_vec(self).context("Failed to serialize key data")
    }

    fn model_hmac(primary: &PrimaryKey, model: &Model, boot_mode: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(primary.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(&model.canonical_bytes());
        mac.update(boot_mode.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Adds an authorization entry for running `model` in `boot_mode`.
    pub fn authorize_model(&mut self, primary: &PrimaryKey, model: &Model, boot_mode: &str) {
        self.authorized_models
            .insert(Self::model_hmac(primary, model, boot_mode));
    }

    /// Checks whether (model, boot mode) was authorized under `primary`.
    pub fn is_model_authorized(
        &self,
        primary: &PrimaryKey,
        model: &Model,
        boot_mode: &str,
    ) -> bool {
        self.authorized_models
            .contains(&Self::model_hmac(primary, model, boot_mode))
    }
}

/// Cleartext payload carried inside a sealed record: the unlock key and
/// the primary key, each length-prefixed.
pub fn make_cleartext_payload(unlock: &DiskUnlockKey, primary: &PrimaryKey) -> Vec<u8> {
    let mut payload =
        Vec::with_capacity(4 + unlock.as_bytes().len() + primary.as_bytes().len());
    payload.extend_from_slice(&(unlock.as_bytes().len() as u16).to_be_bytes());
    payload.extend_from_slice(unlock.as_bytes());
    payload.extend_from_slice(&(primary.as_bytes().len() as u16).to_be_bytes());
    payload.extend_from_slice(primary.as_bytes());
    payload
}

/// Splits a cleartext payload back into (unlock key bytes, primary key
/// bytes).
pub fn split_cleartext_payload(payload: &[u8]) -> Result<(Vec<u8>, Vec<u8>), Error> {
    fn take(payload: &[u8]) -> Result<(Vec<u8>, &[u8]), Error> {
        if payload.len() < 2 {
            bail!("Truncated length prefix");
        }
        let len = u16::from_be_bytes([payload[0], payload[1]]) as usize;
        let rest = &payload[2..];
        if rest.len() < len {
            bail!("Truncated key ({} bytes missing)", len - rest.len());
        }
        Ok((rest[..len].to_vec(), &rest[len..]))
    }

    let (unlock, rest) = take(payload).context("Malformed cleartext payload")?;
    let (primary, rest) = take(rest).context("Malformed cleartext payload")?;
    if !rest.is_empty() {
        bail!("Trailing garbage after cleartext payload");
    }
    Ok((unlock, primary))
}

/// Classification of an on-disk key file. Modern files are KeyData JSON;
/// two legacy forms remain loadable.
#[derive(Debug)]
pub enum KeyFileKind {
    KeyData(KeyData),
    /// A pre-KeyData sealed key object, kept opaque for the legacy reseal
    /// path.
    LegacySealedObject(Vec<u8>),
    /// A raw v1 FDE hook blob, revealed out-of-process.
    LegacyFdeHookRawV1(Vec<u8>),
}

/// Loads and classifies a key file. This is the only entry point for
/// reading key files; downstream code dispatches on the returned variant.
pub fn load_key_file(path: impl AsRef<Path>) -> Result<KeyFileKind, Error> {
    let path = path.as_ref();
    let data = std::fs::read(path)
        .with_context(|| format!("Could not read key file '{}'", path.display()))?;
    classify_key_file(&data)
        .with_context(|| format!("Could not classify key file '{}'", path.display()))
}

fn classify_key_file(data: &[u8]) -> Result<KeyFileKind, Error> {
    if data.starts_with(SEALED_OBJECT_MAGIC) {
        return Ok(KeyFileKind::LegacySealedObject(data.to_vec()));
    }
    // KeyData files are JSON objects; anything else non-JSON is a raw v1
    // hook blob.
    if data.first() == Some(&b'{') {
        let key_data = KeyData::from_json(data)?;
        return Ok(KeyFileKind::KeyData(key_data));
    }
    Ok(KeyFileKind::LegacyFdeHookRawV1(data.to_vec()))
}
