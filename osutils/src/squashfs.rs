use std::{path::Path, process::Command};

use anyhow::{Context, Error};

use crate::exe::RunAndCheck;

/// Reads a single member file out of a squashfs container image without
/// unpacking it, using `unsquashfs -cat`.
pub fn cat_file(container: impl AsRef<Path>, member: &str) -> Result<Vec<u8>, Error> {
    let output = Command::new("unsquashfs")
        .arg("-no-progress")
        .arg("-cat")
        .arg(container.as_ref())
        .arg(member)
        .raw_output_and_check()
        .context(format!(
            "Failed to read '{}' from container '{}'",
            member,
            container.as_ref().display()
        ))?;

    Ok(output.stdout)
}
