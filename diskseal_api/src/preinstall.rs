//! Wire types for the pre-install platform readiness check.
//!
//! The check library reports failures as a compound error wrapping typed
//! "kind plus remediation actions" inner errors. This module defines those
//! types and the stable details structure they convert into.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use strum_macros::IntoStaticStr;

/// Remediation actions a caller can present to the user, in the order the
/// check library suggests them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, IntoStaticStr)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum PreinstallAction {
    Reboot,
    Shutdown,
    RebootToFwSettings,
    None,
}

/// Stable tags identifying why the platform is not ready for TPM-backed
/// sealing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, IntoStaticStr)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum PreinstallErrorKind {
    InternalError,
    NotEfi,
    SecureBootDisabled,
    SecureBootVariableMissing,
    NoSuitableTpm2Device,
    TpmDeviceFailure,
    TpmDeviceDisabled,
    TpmHierarchiesOwned,
    TpmDeviceLockout,
    InsufficientTpmCounters,
    VirtualMachineDetected,
    VarSuppliedDriversPresent,
}

/// One structured entry of a failed pre-install check. The `args` map is
/// ordered (lexicographically by key) so its JSON form is deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreinstallErrorDetails {
    pub kind: PreinstallErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<BTreeMap<String, serde_json::Value>>,
    pub actions: Vec<PreinstallAction>,
}

/// The typed error the check library attaches to each individual failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindAndActionsError {
    pub kind: PreinstallErrorKind,
    pub message: String,
    pub args: Option<BTreeMap<String, serde_json::Value>>,
    pub actions: Vec<PreinstallAction>,
}

impl fmt::Display for KindAndActionsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for KindAndActionsError {}

impl From<&KindAndActionsError> for PreinstallErrorDetails {
    fn from(e: &KindAndActionsError) -> Self {
        PreinstallErrorDetails {
            kind: e.kind,
            message: e.message.clone(),
            args: e.args.clone(),
            actions: e.actions.clone(),
        }
    }
}

/// A compound error wrapping one or more inner check failures, in the order
/// the check library produced them.
#[derive(Debug)]
pub struct CompoundCheckError {
    errors: Vec<Box<dyn std::error::Error + Send + Sync>>,
}

impl CompoundCheckError {
    pub fn new(errors: Vec<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        CompoundCheckError { errors }
    }

    pub fn errors(&self) -> &[Box<dyn std::error::Error + Send + Sync>] {
        &self.errors
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

impl fmt::Display for CompoundCheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errors.len() {
            0 => write!(f, "preinstall check failed (no errors attached)"),
            1 => write!(f, "preinstall check failed: {}", self.errors[0]),
            n => write!(
                f,
                "preinstall check failed with {} errors, first: {}",
                n, self.errors[0]
            ),
        }
    }
}

impl std::error::Error for CompoundCheckError {}

#[cfg(test)]
mod tests {
    use maplit::btreemap;
    use serde_json::json;

    use super::*;

    #[test]
    fn test_details_json_shape() {
        let details = PreinstallErrorDetails {
            kind: PreinstallErrorKind::TpmDeviceLockout,
            message: "TPM is in DA lockout mode".to_string(),
            args: Some(btreemap! {
                "total-duration".to_string() => json!(230400000000000u64),
                "interval-duration".to_string() => json!(7200000000000u64),
            }),
            actions: vec![PreinstallAction::RebootToFwSettings],
        };

        let serialized = serde_json::to_string(&details).unwrap();
        // BTreeMap keys come out lexicographically sorted.
        assert_eq!(
            serialized,
            "{\"kind\":\"tpm-device-lockout\",\
             \"message\":\"TPM is in DA lockout mode\",\
             \"args\":{\"interval-duration\":7200000000000,\"total-duration\":230400000000000},\
             \"actions\":[\"reboot-to-fw-settings\"]}"
        );

        let roundtrip: PreinstallErrorDetails = serde_json::from_str(&serialized).unwrap();
        assert_eq!(roundtrip, details);
    }

    #[test]
    fn test_details_without_args() {
        let details = PreinstallErrorDetails {
            kind: PreinstallErrorKind::SecureBootDisabled,
            message: "secure boot is disabled".to_string(),
            args: None,
            actions: vec![PreinstallAction::RebootToFwSettings],
        };
        let serialized = serde_json::to_string(&details).unwrap();
        assert!(!serialized.contains("args"));
    }

    #[test]
    fn test_compound_display() {
        let compound = CompoundCheckError::new(vec![Box::new(KindAndActionsError {
            kind: PreinstallErrorKind::TpmDeviceDisabled,
            message: "TPM device is disabled".to_string(),
            args: None,
            actions: vec![PreinstallAction::RebootToFwSettings],
        })]);
        assert_eq!(
            compound.to_string(),
            "preinstall check failed: TPM device is disabled"
        );
    }
}
