use std::fmt::{Debug, Write};
use std::path::PathBuf;
use std::{borrow::Cow, panic::Location};

use serde::{ser::SerializeStruct, Deserialize, Serialize};
use strum_macros::IntoStaticStr;

use sysdefs::tpm2::NvHandle;

/// The TPM device is missing, unusable, or refused an operation.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq, IntoStaticStr)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum TpmError {
    #[error("No TPM 2.0 device is available")]
    NoTpmDevice,
    #[error("TPM 2.0 device is present but disabled")]
    TpmDisabled,
    #[error("TPM 2.0 device is in dictionary-attack lockout mode")]
    TpmInLockout,
    #[error("Failed to connect to TPM 2.0 device")]
    TpmConnectFailed,
    #[error("Failed to provision TPM 2.0 device")]
    TpmProvisioningFailed,
    #[error("Lockout authorization file '{path}' does not exist")]
    LockoutAuthMissing { path: PathBuf },
    #[error("No free NV index handle in the reserved policy counter block")]
    NoFreeNvHandles,
    #[error("Failed to release NV index handles: {summary}")]
    ReleaseHandles { summary: String },
}

/// Firmware state prevents secure sealing.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq, IntoStaticStr)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum FirmwareError {
    #[error("Secure boot is disabled")]
    SecureBootDisabled,
    #[error("EFI variable '{name}' is missing")]
    SecureBootVariableMissing { name: String },
    #[error("Not running on an EFI system")]
    NotEfi,
}

/// Disk probing failed.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq, IntoStaticStr)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum DiskError {
    #[error("No partition with filesystem label '{label}'")]
    LabelNotFound { label: String },
    #[error("Device '{device}' is not a LUKS2 container")]
    DeviceNotEncrypted { device: String },
}

/// A key-data record could not be located or decoded.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq, IntoStaticStr)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum KeyDataError {
    #[error("No key data in token '{slot_name}' and no fallback file: {token_error}")]
    KeyDataMissing {
        slot_name: String,
        token_error: String,
    },
    #[error("Malformed key data in '{source_desc}'")]
    KeyDataMalformed { source_desc: String },
}

/// LUKS2 keyslot bookkeeping was violated.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq, IntoStaticStr)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum SlotError {
    #[error("Keyslot '{name}' already exists")]
    SlotExists { name: String },
    #[error("Keyslot '{name}' does not exist")]
    SlotMissing { name: String },
    #[error("Rename of keyslot '{name}' overlaps another rename in the batch")]
    SlotNameCycle { name: String },
}

/// The out-of-process FDE hook helper misbehaved.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq, IntoStaticStr)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum HookError {
    #[error("FDE hook helper failed: {details}")]
    HookHelperFailed { details: String },
    #[error("FDE hook helper did not finish within {seconds} seconds")]
    HookHelperTimeout { seconds: u64 },
}

/// Sealing inputs were rejected before any key material was touched.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq, IntoStaticStr)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum SealingError {
    #[error("Cannot seal keys without model parameters")]
    NoModelParams,
    #[error("Unsupported KDF type '{kdf}'")]
    KdfUnsupported { kdf: String },
    #[error("Unsupported volumes authentication mode '{mode}'")]
    AuthModeUnsupported { mode: String },
    #[error("Cannot add {sub_profile} profile")]
    AddSubProfile { sub_profile: String },
    #[error("Encryption container for '{device}' is already finished")]
    ContainerFinished { device: PathBuf },
    #[error("Failed to reseal key in slot '{slot_name}' of '{device}'")]
    ResealKey { device: PathBuf, slot_name: String },
    #[error("Failed to revoke previous PCR policies for counter {counter}")]
    RevokePolicies { counter: NvHandle },
}

/// Outcomes of trying to unlock a volume.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq, IntoStaticStr)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ActivationError {
    #[error("Cannot activate encrypted device '{device}'")]
    ActivationFailed { device: PathBuf },
    /// Sentinel: activation succeeded, but with the recovery key. Callers
    /// treat this as a successful outcome with a distinct unlock method.
    #[error("Volume was unlocked with the recovery key")]
    RecoveryKeyUsed,
}

/// A bug in this library or a broken invariant.
#[derive(Debug, Eq, thiserror::Error, Serialize, PartialEq, IntoStaticStr)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum InternalError {
    #[error("Internal error: {0}")]
    Internal(&'static str),
    #[error("Load chain contains a cycle")]
    LoadChainCycle,
    #[error("CSPRNG failure: {0}")]
    RandomSource(&'static str),
    #[error("Compound check error carries an unexpected inner error: {inner}")]
    UnexpectedCheckError { inner: String },
    #[error("Compound check error wraps no errors")]
    EmptyCompoundError,
}

/// Each variant of `ErrorKind` is a category of error. Categories route
/// failures to the right remediation; the per-variant tags are stable
/// across versions.
#[derive(Debug, Eq, thiserror::Error, IntoStaticStr, PartialEq)]
#[strum(serialize_all = "kebab-case")]
pub enum ErrorKind {
    #[error(transparent)]
    Tpm(#[from] TpmError),

    #[error(transparent)]
    Firmware(#[from] FirmwareError),

    #[error(transparent)]
    Disk(#[from] DiskError),

    #[error(transparent)]
    KeyData(#[from] KeyDataError),

    #[error(transparent)]
    Slot(#[from] SlotError),

    #[error(transparent)]
    Hook(#[from] HookError),

    #[error(transparent)]
    Sealing(#[from] SealingError),

    #[error(transparent)]
    Activation(#[from] ActivationError),

    #[error(transparent)]
    Internal(#[from] InternalError),
}

impl ErrorKind {
    /// Returns the stable kebab-case tag of this error. Internal errors all
    /// collapse onto `internal-error`; every other tag is the variant name.
    pub fn tag(&self) -> &'static str {
        match self {
            ErrorKind::Tpm(e) => e.into(),
            ErrorKind::Firmware(e) => e.into(),
            ErrorKind::Disk(e) => e.into(),
            ErrorKind::KeyData(e) => e.into(),
            ErrorKind::Slot(e) => e.into(),
            ErrorKind::Hook(e) => e.into(),
            ErrorKind::Sealing(e) => e.into(),
            ErrorKind::Activation(e) => e.into(),
            ErrorKind::Internal(_) => "internal-error",
        }
    }
}

#[derive(Debug)]
struct SealErrorInner {
    kind: ErrorKind,
    location: &'static Location<'static>,
    source: Option<anyhow::Error>,
    context: Vec<(Cow<'static, str>, &'static Location<'static>)>,
}

/// Structured error carrying an [`ErrorKind`], the location that raised it,
/// and an optional unstructured cause chain.
pub struct SealError(Box<SealErrorInner>);

impl SealError {
    #[track_caller]
    pub fn new(kind: impl Into<ErrorKind>) -> Self {
        SealError(Box::new(SealErrorInner {
            kind: kind.into(),
            location: Location::caller(),
            source: None,
            context: Vec::new(),
        }))
    }

    #[track_caller]
    pub fn with_source(kind: impl Into<ErrorKind>, source: anyhow::Error) -> Self {
        SealError(Box::new(SealErrorInner {
            kind: kind.into(),
            location: Location::caller(),
            source: Some(source),
            context: Vec::new(),
        }))
    }

    /// Returns a reference to the inner ErrorKind.
    pub fn kind(&self) -> &ErrorKind {
        &self.0.kind
    }

    /// Returns the stable kebab-case tag of the inner kind.
    pub fn tag(&self) -> &'static str {
        self.0.kind.tag()
    }

    /// Convert this error into an unstructured error.
    pub fn unstructured(self, context: impl Into<Cow<'static, str>>) -> anyhow::Error {
        match self.0.source {
            Some(source) => source.context(self.0.kind).context(context.into()),
            None => anyhow::Error::from(self.0.kind).context(context.into()),
        }
    }
}

pub trait ReportError<T, K> {
    /// Convert this error into a structured SealError.
    fn structured(self, kind: K) -> Result<T, SealError>;
}

impl<T, K> ReportError<T, K> for Option<T>
where
    K: Into<ErrorKind>,
{
    #[track_caller]
    fn structured(self, kind: K) -> Result<T, SealError> {
        match self {
            Some(t) => Ok(t),
            None => Err(SealError(Box::new(SealErrorInner {
                kind: kind.into(),
                location: Location::caller(),
                source: None,
                context: Vec::new(),
            }))),
        }
    }
}

impl<T, E, K> ReportError<T, K> for Result<T, E>
where
    E: Into<anyhow::Error>,
    K: Into<ErrorKind>,
{
    #[track_caller]
    fn structured(self, kind: K) -> Result<T, SealError> {
        match self {
            Ok(o) => Ok(o),
            Err(e) => Err(SealError(Box::new(SealErrorInner {
                kind: kind.into(),
                location: Location::caller(),
                source: Some(e.into()),
                context: Vec::new(),
            }))),
        }
    }
}

pub trait SealResultExt<T> {
    /// Attach a context message to the error.
    fn message(self, context: impl Into<Cow<'static, str>>) -> Result<T, SealError>;

    /// Convert the error into an unstructured error.
    fn unstructured(self, context: impl Into<Cow<'static, str>>) -> Result<T, anyhow::Error>;
}

impl<T> SealResultExt<T> for Result<T, SealError> {
    #[track_caller]
    fn message(mut self, context: impl Into<Cow<'static, str>>) -> Result<T, SealError> {
        if let Err(ref mut e) = self {
            e.0.context.push((context.into(), Location::caller()));
        }
        self
    }

    fn unstructured(self, context: impl Into<Cow<'static, str>>) -> Result<T, anyhow::Error> {
        self.map_err(|e| e.unstructured(context))
    }
}

impl Serialize for SealError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("seal-error", 5)?;
        state.serialize_field("message", &self.0.kind.to_string())?;
        match self.0.kind {
            ErrorKind::Tpm(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Firmware(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Disk(ref e) => state.serialize_field("error", e)?,
            ErrorKind::KeyData(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Slot(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Hook(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Sealing(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Activation(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Internal(ref e) => state.serialize_field("error", e)?,
        }
        state.serialize_field("category", <&str>::from(&self.0.kind))?;
        state.serialize_field(
            "location",
            &format!("{}:{}", self.0.location.file(), self.0.location.line()),
        )?;
        match self.0.source {
            Some(ref e) => state.serialize_field("cause", &Some(format!("{:?}", e)))?,
            None => state.serialize_field("cause", &None::<String>)?,
        }
        state.end()
    }
}

impl Debug for SealError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} at {}:{}",
            self.0.kind,
            self.0.location.file(),
            self.0.location.line()
        )?;

        if !self.0.context.is_empty() {
            writeln!(f, "\n\nContext:")?;
            for (i, (context, location)) in self.0.context.iter().enumerate() {
                for (j, line) in context.split('\n').enumerate() {
                    if j == 0 {
                        write!(f, "{: >5}: ", i)?;
                    } else {
                        f.write_str("\n       ")?;
                    }
                    f.write_str(line)?;
                }
                writeln!(f, " at {}:{}", location.file(), location.line())?;
            }
        }

        if let Some(ref source) = self.0.source {
            writeln!(f, "\n\nCaused by:")?;
            let mut index = 0;
            let mut source: Option<&dyn std::error::Error> = Some(source.as_ref());
            while let Some(e) = source {
                for (i, line) in e.to_string().split('\n').enumerate() {
                    if i == 0 {
                        write!(f, "{: >5}: ", index)?;
                    } else {
                        f.write_str("\n       ")?;
                    }
                    f.write_str(line)?;
                }
                f.write_char('\n')?;
                source = e.source();
                index += 1;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Context;
    use serde_yaml::Value;

    use super::*;

    #[test]
    fn test_tags_are_stable() {
        assert_eq!(ErrorKind::Tpm(TpmError::NoTpmDevice).tag(), "no-tpm-device");
        assert_eq!(ErrorKind::Tpm(TpmError::TpmDisabled).tag(), "tpm-disabled");
        assert_eq!(
            ErrorKind::Tpm(TpmError::TpmInLockout).tag(),
            "tpm-in-lockout"
        );
        assert_eq!(
            ErrorKind::Tpm(TpmError::TpmConnectFailed).tag(),
            "tpm-connect-failed"
        );
        assert_eq!(
            ErrorKind::Firmware(FirmwareError::SecureBootDisabled).tag(),
            "secure-boot-disabled"
        );
        assert_eq!(
            ErrorKind::Firmware(FirmwareError::SecureBootVariableMissing {
                name: "SecureBoot".into()
            })
            .tag(),
            "secure-boot-variable-missing"
        );
        assert_eq!(ErrorKind::Firmware(FirmwareError::NotEfi).tag(), "not-efi");
        assert_eq!(
            ErrorKind::Disk(DiskError::LabelNotFound {
                label: "data".into()
            })
            .tag(),
            "label-not-found"
        );
        assert_eq!(
            ErrorKind::Disk(DiskError::DeviceNotEncrypted {
                device: "/dev/sda4".into()
            })
            .tag(),
            "device-not-encrypted"
        );
        assert_eq!(
            ErrorKind::Activation(ActivationError::ActivationFailed {
                device: "/dev/sda4".into()
            })
            .tag(),
            "activation-failed"
        );
        assert_eq!(
            ErrorKind::Activation(ActivationError::RecoveryKeyUsed).tag(),
            "recovery-key-used"
        );
        assert_eq!(
            ErrorKind::KeyData(KeyDataError::KeyDataMissing {
                slot_name: "default".into(),
                token_error: "no token".into()
            })
            .tag(),
            "key-data-missing"
        );
        assert_eq!(
            ErrorKind::KeyData(KeyDataError::KeyDataMalformed {
                source_desc: "token".into()
            })
            .tag(),
            "key-data-malformed"
        );
        assert_eq!(
            ErrorKind::Slot(SlotError::SlotExists { name: "b".into() }).tag(),
            "slot-exists"
        );
        assert_eq!(
            ErrorKind::Slot(SlotError::SlotMissing { name: "b".into() }).tag(),
            "slot-missing"
        );
        assert_eq!(
            ErrorKind::Slot(SlotError::SlotNameCycle { name: "b".into() }).tag(),
            "slot-name-cycle"
        );
        assert_eq!(
            ErrorKind::Hook(HookError::HookHelperFailed {
                details: "exit 1".into()
            })
            .tag(),
            "hook-helper-failed"
        );
        assert_eq!(
            ErrorKind::Hook(HookError::HookHelperTimeout { seconds: 120 }).tag(),
            "hook-helper-timeout"
        );
        assert_eq!(
            ErrorKind::Sealing(SealingError::NoModelParams).tag(),
            "no-model-params"
        );
        assert_eq!(
            ErrorKind::Sealing(SealingError::KdfUnsupported {
                kdf: "scrypt".into()
            })
            .tag(),
            "kdf-unsupported"
        );
        assert_eq!(
            ErrorKind::Sealing(SealingError::AuthModeUnsupported { mode: "pin".into() }).tag(),
            "auth-mode-unsupported"
        );
        assert_eq!(
            ErrorKind::Internal(InternalError::LoadChainCycle).tag(),
            "internal-error"
        );
        assert_eq!(
            ErrorKind::Internal(InternalError::Internal("bug")).tag(),
            "internal-error"
        );
    }

    #[test]
    fn test_error_serialize() {
        let e = SealError::with_source(
            TpmError::TpmConnectFailed,
            std::fs::read("/non-existent-file")
                .context("failed to open device")
                .unwrap_err(),
        );
        match serde_yaml::to_value(e).unwrap() {
            Value::Mapping(m) => {
                assert_eq!(m.len(), 5);
                assert_eq!(m["error"], Value::String("tpm-connect-failed".into()));
                assert_eq!(m["category"], Value::String("tpm".into()));
                assert!(matches!(m["cause"], Value::String(_)));
                assert_eq!(
                    m["message"],
                    Value::String("Failed to connect to TPM 2.0 device".into())
                );
                match m["location"] {
                    Value::String(ref s) => assert!(s.contains("error.rs:")),
                    _ => panic!("location isn't string"),
                }
            }
            _ => panic!("value isn't mapping"),
        }
    }

    #[test]
    fn test_error_debug() {
        let error = Err::<(), _>(anyhow::anyhow!("z"))
            .context("x\ny")
            .structured(InternalError::Internal("w"))
            .unwrap_err();
        assert!(format!("{:?}", error).starts_with("Internal error: w at "));
        assert!(format!("{:?}", error).ends_with("Caused by:\n    0: x\n       y\n    1: z\n"));
    }

    #[test]
    fn test_structured_on_option() {
        let missing: Option<u32> = None;
        let err = missing
            .structured(SlotError::SlotMissing {
                name: "default".into(),
            })
            .unwrap_err();
        assert_eq!(
            err.kind(),
            &ErrorKind::Slot(SlotError::SlotMissing {
                name: "default".into()
            })
        );
    }
}
