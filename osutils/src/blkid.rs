use std::{path::Path, process::Command};

use anyhow::{Context, Error};

use crate::exe::RunAndCheck;

fn run(device_path: impl AsRef<Path>, tag: &str) -> Result<String, Error> {
    let output = Command::new("blkid")
        .arg("-o") // output format
        .arg("value") // single value
        .arg("-s") // tag
        .arg(tag)
        .arg(device_path.as_ref())
        .output_and_check()
        .context("Failed to execute blkid")?;

    Ok(output.trim().to_owned())
}

/// Returns the GPT partition UUID of the given partition node.
pub fn get_partition_uuid(device_path: impl AsRef<Path>) -> Result<String, Error> {
    run(device_path, "PARTUUID")
}

/// Returns the filesystem UUID of the given partition node. For a LUKS2
/// container this is the UUID recorded in the LUKS2 superblock.
pub fn get_filesystem_uuid(device_path: impl AsRef<Path>) -> Result<String, Error> {
    run(device_path, "UUID")
}

/// Returns the filesystem label of the given partition node.
pub fn get_filesystem_label(device_path: impl AsRef<Path>) -> Result<String, Error> {
    run(device_path, "LABEL")
}
