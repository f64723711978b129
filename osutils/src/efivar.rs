//! Read-only probes of EFI variables through efivarfs.

use std::{fs, io::ErrorKind, path::PathBuf};

use anyhow::{bail, Context, Error};

const EFIVARS_DIR: &str = "/sys/firmware/efi/efivars";

/// GUID of the EFI global variable namespace.
const EFI_GLOBAL_VARIABLE_GUID: &str = "8be4df61-93ca-11d2-aa0d-00e098032b8c";

/// State of an EFI variable probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EfiVariableState {
    /// The firmware does not expose efivarfs at all.
    NotEfi,
    /// efivarfs exists but the variable does not.
    Missing,
    /// The variable's payload, with the 4-byte attribute header stripped.
    Present(Vec<u8>),
}

/// Reads an EFI global variable. The 4 leading attribute bytes that
/// efivarfs prepends are stripped from the returned payload.
pub fn read_global_variable(name: &str) -> Result<EfiVariableState, Error> {
    if !PathBuf::from(EFIVARS_DIR).is_dir() {
        return Ok(EfiVariableState::NotEfi);
    }

    let path = PathBuf::from(EFIVARS_DIR).join(format!("{name}-{EFI_GLOBAL_VARIABLE_GUID}"));
    let raw = match fs::read(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(EfiVariableState::Missing),
        Err(e) => {
            return Err(e).context(format!("Failed to read EFI variable '{}'", path.display()))
        }
    };

    if raw.len() < 4 {
        bail!(
            "EFI variable '{}' is {} bytes, too short to carry attributes",
            name,
            raw.len()
        );
    }
    Ok(EfiVariableState::Present(raw[4..].to_vec()))
}

/// Probes whether secure boot is enabled, returning the raw states so the
/// caller can distinguish a non-EFI system from a missing variable.
pub fn secure_boot_state() -> Result<EfiVariableState, Error> {
    read_global_variable("SecureBoot")
}
