use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
};

use anyhow::{bail, Context, Error};

use crate::exe::RunAndCheck;

/// Returns every `/dev/disk/by-*` symlink pointing at the given block
/// device node, as reported by the udev database.
pub fn device_symlinks(device_path: impl AsRef<Path>) -> Result<Vec<PathBuf>, Error> {
    let output = Command::new("udevadm")
        .arg("info")
        .arg("--query=symlink")
        .arg(format!("--name={}", device_path.as_ref().display()))
        .output_and_check()
        .context(format!(
            "Failed to query udev symlinks for '{}'",
            device_path.as_ref().display()
        ))?;

    Ok(output
        .split_whitespace()
        .map(|link| Path::new("/dev").join(link))
        .collect())
}

/// Resolves the `/dev/disk/by-uuid/*` symlink of the given block device by
/// comparing canonicalized targets. Fails if no by-uuid entry points at the
/// device.
pub fn by_uuid_path(device_path: impl AsRef<Path>) -> Result<PathBuf, Error> {
    let device_path = device_path.as_ref();
    let target = fs::canonicalize(device_path).context(format!(
        "Failed to canonicalize device path '{}'",
        device_path.display()
    ))?;

    let by_uuid_dir = Path::new("/dev/disk/by-uuid");
    let entries = fs::read_dir(by_uuid_dir).context("Failed to read /dev/disk/by-uuid")?;
    for entry in entries {
        let entry = entry.context("Failed to read /dev/disk/by-uuid entry")?;
        let Ok(resolved) = fs::canonicalize(entry.path()) else {
            continue;
        };
        if resolved == target {
            return Ok(entry.path());
        }
    }

    bail!(
        "No /dev/disk/by-uuid symlink resolves to '{}'",
        device_path.display()
    );
}
