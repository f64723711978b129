//! Pre-install platform readiness: runs the TPM-backed sealing check on a
//! newly built system and converts the check library's compound errors
//! into the stable structured taxonomy.

use log::{info, warn};

use diskseal_api::error::{FirmwareError, InternalError, ReportError, SealError};
use diskseal_api::preinstall::{CompoundCheckError, KindAndActionsError, PreinstallErrorDetails};

use osutils::efivar::EfiVariableState;

/// Flags steering the readiness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckContext {
    pub permit_var_supplied_drivers: bool,
    /// Only ever set when a virtualization probe reports we are in a VM.
    pub permit_virtual_machine: bool,
}

impl CheckContext {
    /// Builds a context; virtual machines are permitted only when the
    /// virt probe says we are actually inside one.
    pub fn new(permit_var_supplied_drivers: bool) -> Self {
        CheckContext {
            permit_var_supplied_drivers,
            permit_virtual_machine: osutils::virt::is_virtual_machine(),
        }
    }
}

/// A successful check: possibly with warnings, never with errors.
#[derive(Debug, Default)]
pub struct CheckResult {
    pub warnings: Vec<String>,
}

/// Failure shapes of the check library.
#[derive(Debug)]
pub enum CheckRunError {
    Compound(CompoundCheckError),
    Other(anyhow::Error),
}

/// Consumed check library surface.
pub trait CheckRunner {
    fn run(&self, ctx: &CheckContext) -> Result<CheckResult, CheckRunError>;
}

/// Unwraps a compound check error into ordered structured details.
///
/// Every inner error must be a typed kind-and-actions error; anything
/// else, or a compound wrapping nothing, fails the unwrap itself.
pub fn unwrap_check_error(
    compound: &CompoundCheckError,
) -> Result<Vec<PreinstallErrorDetails>, SealError> {
    if compound.is_empty() {
        return Err(SealError::new(InternalError::EmptyCompoundError));
    }

    let mut details = Vec::with_capacity(compound.errors().len());
    for inner in compound.errors() {
        match inner.downcast_ref::<KindAndActionsError>() {
            Some(typed) => details.push(PreinstallErrorDetails::from(typed)),
            None => {
                return Err(SealError::new(InternalError::UnexpectedCheckError {
                    inner: inner.to_string(),
                }));
            }
        }
    }
    Ok(details)
}

/// Runs the readiness check. An empty list means the platform is ready;
/// warnings from a successful run are logged individually and do not fail
/// the check.
pub fn run_preinstall_checks(
    runner: &dyn CheckRunner,
    ctx: &CheckContext,
) -> Result<Vec<PreinstallErrorDetails>, SealError> {
    info!(
        "Running preinstall checks (drivers-permitted={}, vm-permitted={})",
        ctx.permit_var_supplied_drivers, ctx.permit_virtual_machine
    );
    match runner.run(ctx) {
        Ok(result) => {
            for warning in &result.warnings {
                warn!("Preinstall check warning: {}", warning);
            }
            Ok(Vec::new())
        }
        Err(CheckRunError::Compound(compound)) => unwrap_check_error(&compound),
        Err(CheckRunError::Other(e)) => {
            Err(e).structured(InternalError::Internal("preinstall check did not run"))
        }
    }
}

/// Maps the secure-boot variable probe onto the firmware error taxonomy.
fn secure_boot_status(state: EfiVariableState) -> Result<(), SealError> {
    match state {
        EfiVariableState::NotEfi => Err(SealError::new(FirmwareError::NotEfi)),
        EfiVariableState::Missing => {
            Err(SealError::new(FirmwareError::SecureBootVariableMissing {
                name: "SecureBoot".to_string(),
            }))
        }
        EfiVariableState::Present(payload) => {
            if payload.last() == Some(&1) {
                Ok(())
            } else {
                Err(SealError::new(FirmwareError::SecureBootDisabled))
            }
        }
    }
}

/// Cheap local probe that secure boot is on, without going through the
/// full check library.
pub fn check_secure_boot_enabled() -> Result<(), SealError> {
    let state = osutils::efivar::secure_boot_state()
        .structured(InternalError::Internal("could not probe secure boot state"))?;
    secure_boot_status(state)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use maplit::btreemap;
    use serde_json::json;

    use diskseal_api::preinstall::{PreinstallAction, PreinstallErrorKind};

    use super::*;

    struct PassingRunner;

    impl CheckRunner for PassingRunner {
        fn run(&self, _ctx: &CheckContext) -> Result<CheckResult, CheckRunError> {
            Ok(CheckResult {
                warnings: vec!["TPM startup auth is set".to_string()],
            })
        }
    }

    struct FailingRunner {
        errors: fn() -> Vec<Box<dyn std::error::Error + Send + Sync>>,
    }

    impl CheckRunner for FailingRunner {
        fn run(&self, _ctx: &CheckContext) -> Result<CheckResult, CheckRunError> {
            Err(CheckRunError::Compound(CompoundCheckError::new((self.errors)())))
        }
    }

    fn hierarchies_owned() -> KindAndActionsError {
        KindAndActionsError {
            kind: PreinstallErrorKind::TpmHierarchiesOwned,
            message: "TPM hierarchies are already owned".to_string(),
            args: Some(btreemap! {
                "with-auth-value".to_string() => json!([1073741834u64]),
                "with-auth-policy".to_string() => json!([1073741825u64]),
            }),
            actions: vec![PreinstallAction::RebootToFwSettings],
        }
    }

    fn device_lockout() -> KindAndActionsError {
        KindAndActionsError {
            kind: PreinstallErrorKind::TpmDeviceLockout,
            message: "TPM is in DA lockout mode".to_string(),
            args: Some(btreemap! {
                "interval-duration".to_string() => json!(7200000000000u64),
                "total-duration".to_string() => json!(230400000000000u64),
            }),
            actions: vec![PreinstallAction::RebootToFwSettings],
        }
    }

    #[test]
    fn test_successful_check_returns_empty_details() {
        let details =
            run_preinstall_checks(&PassingRunner, &CheckContext::new(false)).unwrap();
        assert!(details.is_empty());
    }

    #[test]
    fn test_scenario_f_compound_unwrap() {
        let runner = FailingRunner {
            errors: || vec![Box::new(hierarchies_owned()), Box::new(device_lockout())],
        };

        let details = run_preinstall_checks(&runner, &CheckContext::new(false)).unwrap();
        assert_eq!(details.len(), 2);

        assert_eq!(details[0].kind, PreinstallErrorKind::TpmHierarchiesOwned);
        assert_eq!(
            details[0].args,
            Some(btreemap! {
                "with-auth-policy".to_string() => json!([1073741825u64]),
                "with-auth-value".to_string() => json!([1073741834u64]),
            })
        );
        assert_eq!(details[0].actions, vec![PreinstallAction::RebootToFwSettings]);

        assert_eq!(details[1].kind, PreinstallErrorKind::TpmDeviceLockout);
        assert_eq!(details[1].actions, vec![PreinstallAction::RebootToFwSettings]);

        // JSON form sorts args keys lexicographically.
        let json = serde_json::to_string(&details[1]).unwrap();
        let interval = json.find("interval-duration").unwrap();
        let total = json.find("total-duration").unwrap();
        assert!(interval < total);
    }

    #[test]
    fn test_unknown_inner_error_fails_unwrap() {
        let runner = FailingRunner {
            errors: || {
                vec![Box::new(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "something opaque",
                ))]
            },
        };

        let err = run_preinstall_checks(&runner, &CheckContext::new(false)).unwrap_err();
        assert_eq!(err.tag(), "internal-error");
        assert!(format!("{:?}", err).contains("something opaque"));
    }

    #[test]
    fn test_empty_compound_is_a_failure() {
        let runner = FailingRunner { errors: Vec::new };
        let err = run_preinstall_checks(&runner, &CheckContext::new(false)).unwrap_err();
        assert_eq!(err.tag(), "internal-error");
    }

    #[test]
    fn test_details_preserve_order() {
        let runner = FailingRunner {
            errors: || vec![Box::new(device_lockout()), Box::new(hierarchies_owned())],
        };
        let details = run_preinstall_checks(&runner, &CheckContext::new(false)).unwrap();
        assert_eq!(details[0].kind, PreinstallErrorKind::TpmDeviceLockout);
        assert_eq!(details[1].kind, PreinstallErrorKind::TpmHierarchiesOwned);
    }

    #[test]
    fn test_secure_boot_status_mapping() {
        assert_eq!(
            secure_boot_status(EfiVariableState::NotEfi)
                .unwrap_err()
                .tag(),
            "not-efi"
        );
        assert_eq!(
            secure_boot_status(EfiVariableState::Missing)
                .unwrap_err()
                .tag(),
            "secure-boot-variable-missing"
        );
        assert_eq!(
            secure_boot_status(EfiVariableState::Present(vec![0]))
                .unwrap_err()
                .tag(),
            "secure-boot-disabled"
        );
        secure_boot_status(EfiVariableState::Present(vec![1])).unwrap();
    }

    #[test]
    fn test_details_without_args_serialize_without_args_key() {
        let details = PreinstallErrorDetails {
            kind: PreinstallErrorKind::NoSuitableTpm2Device,
            message: "no TPM 2.0 device".to_string(),
            args: None::<BTreeMap<String, serde_json::Value>>,
            actions: vec![PreinstallAction::None],
        };
        let json = serde_json::to_string(&details).unwrap();
        assert!(!json.contains("\"args\""));
        assert!(json.contains("\"actions\":[\"none\"]"));
    }
}
