//! Thin wrapper around the `cryptsetup` command line tool for the LUKS2
//! operations the key manager performs. Key material is fed over stdin or
//! inherited pipes and never touches the filesystem.

use std::{
    collections::BTreeMap,
    io::Write,
    os::fd::{AsRawFd, FromRawFd, OwnedFd},
    path::Path,
    process::Command,
};

use anyhow::{Context, Error};
use serde::Deserialize;

use crate::exe::RunAndCheck;

/// Cipher specification string for the LUKS2 data segment.
pub const CIPHER: &str = "aes-xts-plain64";

/// Key size in bits, limited by the cipher specification.
pub const KEY_SIZE: &str = "512";

/// Bound on the LUKS2 metadata area.
const METADATA_SIZE: &str = "2048k";

/// Bound on the LUKS2 keyslots area.
const KEYSLOTS_SIZE: &str = "2560k";

/// Options for formatting a new LUKS2 container.
#[derive(Debug, Clone, Default)]
pub struct FormatOpts {
    /// Format for an inline-crypto-engine capable device (4k sectors).
    pub inline_crypto_engine: bool,
}

/// Subset of `cryptsetup luksDump --dump-json-metadata` output the key
/// manager consumes. Token and keyslot payloads stay opaque here; callers
/// interpret them.
#[derive(Debug, Clone, Deserialize)]
pub struct Luks2Header {
    #[serde(default)]
    pub tokens: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub keyslots: BTreeMap<String, serde_json::Value>,
}

/// Returns a `/proc/self/fd` path under which the child process can read
/// the inherited descriptor.
fn fd_path(fd: &OwnedFd) -> String {
    format!("/proc/self/fd/{}", fd.as_raw_fd())
}

/// Builds an inherited pipe pre-filled with `data`. The write end is closed
/// before the child runs, so reads terminate. Key material fits well below
/// the pipe buffer, so the fill never blocks.
fn key_pipe(data: &[u8]) -> Result<OwnedFd, Error> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: fds points at two ints the call fills in.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(std::io::Error::last_os_error()).context("Failed to create key pipe");
    }
    // SAFETY: both descriptors are freshly created and owned only here.
    let (read_end, write_end) =
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

    let mut writer = std::fs::File::from(write_end);
    writer.write_all(data).context("Failed to fill key pipe")?;
    Ok(read_end)
}

/// Formats `device` as a LUKS2 container with bounded metadata and keyslot
/// areas, labeling it and binding the initial keyslot to `key`. The KDF
/// runs with fixed minimal cost because the input key is already
/// high-entropy.
pub fn format(device: impl AsRef<Path>, label: &str, key: &[u8], opts: &FormatOpts) -> Result<(), Error> {
    let mut cmd = Command::new("cryptsetup");
    cmd.arg("luksFormat")
        .arg("--type")
        .arg("luks2")
        .arg("--batch-mode")
        .arg("--key-file")
        .arg("-")
        .arg("--cipher")
        .arg(CIPHER)
        .arg("--key-size")
        .arg(KEY_SIZE)
        .arg("--label")
        .arg(label)
        .arg("--pbkdf")
        .arg("argon2i")
        .arg("--pbkdf-force-iterations")
        .arg("4")
        .arg("--pbkdf-memory")
        .arg("32")
        .arg("--luks2-metadata-size")
        .arg(METADATA_SIZE)
        .arg("--luks2-keyslots-size")
        .arg(KEYSLOTS_SIZE);

    if opts.inline_crypto_engine {
        cmd.arg("--sector-size").arg("4096");
    }

    cmd.arg(device.as_ref());
    cmd.input_and_check(key).context(format!(
        "Failed to format '{}' as LUKS2",
        device.as_ref().display()
    ))?;
    Ok(())
}

/// Adds `new_key` to the container, authorized by `existing_key`. The new
/// keyslot also uses minimal KDF cost. When `slot` is given the keyslot
/// number is forced, which fails if the slot is occupied.
pub fn add_key(
    device: impl AsRef<Path>,
    existing_key: &[u8],
    new_key: &[u8],
    slot: Option<u32>,
) -> Result<(), Error> {
    let new_key_fd = key_pipe(new_key)?;

    let mut cmd = Command::new("cryptsetup");
    cmd.arg("luksAddKey")
        .arg("--batch-mode")
        .arg("--key-file")
        .arg("-")
        .arg("--pbkdf")
        .arg("argon2i")
        .arg("--pbkdf-force-iterations")
        .arg("4")
        .arg("--pbkdf-memory")
        .arg("32");

    if let Some(slot) = slot {
        cmd.arg("--key-slot").arg(slot.to_string());
    }

    cmd.arg(device.as_ref()).arg(fd_path(&new_key_fd));
    cmd.input_and_check(existing_key).context(format!(
        "Failed to add key to '{}'",
        device.as_ref().display()
    ))?;
    Ok(())
}

/// Destroys the given keyslot. Runs in batch mode, so no authorization is
/// required; callers gate access.
pub fn kill_slot(device: impl AsRef<Path>, slot: u32) -> Result<(), Error> {
    Command::new("cryptsetup")
        .arg("luksKillSlot")
        .arg("--batch-mode")
        .arg(device.as_ref())
        .arg(slot.to_string())
        .run_and_check()
        .context(format!(
            "Failed to kill keyslot {} of '{}'",
            slot,
            device.as_ref().display()
        ))
}

/// Tests that `key` opens a keyslot of the container without activating
/// anything. With `slot` the test is pinned to that keyslot.
pub fn verify_key(device: impl AsRef<Path>, key: &[u8], slot: Option<u32>) -> Result<(), Error> {
    let mut cmd = Command::new("cryptsetup");
    cmd.arg("open")
        .arg("--test-passphrase")
        .arg("--key-file")
        .arg("-");
    if let Some(slot) = slot {
        cmd.arg("--key-slot").arg(slot.to_string());
    }
    cmd.arg(device.as_ref());
    cmd.input_and_check(key).map(|_| ()).context(format!(
        "Key does not open any keyslot of '{}'",
        device.as_ref().display()
    ))
}

/// Imports a token JSON document. With `token_id` the existing token at
/// that id is replaced.
pub fn import_token(
    device: impl AsRef<Path>,
    token_json: &[u8],
    token_id: Option<u32>,
) -> Result<(), Error> {
    let mut cmd = Command::new("cryptsetup");
    cmd.arg("token").arg("import");
    if let Some(id) = token_id {
        cmd.arg("--token-id").arg(id.to_string());
        cmd.arg("--token-replace");
    }
    cmd.arg(device.as_ref());
    cmd.input_and_check(token_json).context(format!(
        "Failed to import token into '{}'",
        device.as_ref().display()
    ))?;
    Ok(())
}

/// Exports the token JSON document at `token_id`.
pub fn export_token(device: impl AsRef<Path>, token_id: u32) -> Result<String, Error> {
    Command::new("cryptsetup")
        .arg("token")
        .arg("export")
        .arg("--token-id")
        .arg(token_id.to_string())
        .arg(device.as_ref())
        .output_and_check()
        .context(format!(
            "Failed to export token {} from '{}'",
            token_id,
            device.as_ref().display()
        ))
}

/// Removes the token at `token_id`.
pub fn remove_token(device: impl AsRef<Path>, token_id: u32) -> Result<(), Error> {
    Command::new("cryptsetup")
        .arg("token")
        .arg("remove")
        .arg("--token-id")
        .arg(token_id.to_string())
        .arg(device.as_ref())
        .run_and_check()
        .context(format!(
            "Failed to remove token {} from '{}'",
            token_id,
            device.as_ref().display()
        ))
}

/// Dumps the LUKS2 header metadata as JSON.
pub fn dump_header(device: impl AsRef<Path>) -> Result<Luks2Header, Error> {
    let json = Command::new("cryptsetup")
        .arg("luksDump")
        .arg("--dump-json-metadata")
        .arg(device.as_ref())
        .output_and_check()
        .context(format!(
            "Failed to dump LUKS2 metadata of '{}'",
            device.as_ref().display()
        ))?;

    serde_json::from_str(&json).context(format!(
        "Malformed LUKS2 metadata dump for '{}'",
        device.as_ref().display()
    ))
}

/// Returns true when the device carries a LUKS2 superblock.
pub fn is_luks2(device: impl AsRef<Path>) -> bool {
    Command::new("cryptsetup")
        .arg("isLuks")
        .arg("--type")
        .arg("luks2")
        .arg(device.as_ref())
        .run_and_check()
        .is_ok()
}

/// Activates the container under the given device-mapper name.
pub fn open(device: impl AsRef<Path>, name: &str, key: &[u8]) -> Result<(), Error> {
    Command::new("cryptsetup")
        .arg("open")
        .arg("--type")
        .arg("luks2")
        .arg("--key-file")
        .arg("-")
        .arg(device.as_ref())
        .arg(name)
        .input_and_check(key)
        .map(|_| ())
        .context(format!(
            "Failed to open '{}' as '{}'",
            device.as_ref().display(),
            name
        ))
}

/// Deactivates a previously opened container.
pub fn close(name: &str) -> Result<(), Error> {
    Command::new("cryptsetup")
        .arg("close")
        .arg(name)
        .run_and_check()
        .context(format!("Failed to close device-mapper volume '{}'", name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_pipe_readable_via_fd_path() {
        let fd = key_pipe(b"pipe-payload").unwrap();
        let data = std::fs::read(fd_path(&fd)).unwrap();
        assert_eq!(data, b"pipe-payload");
    }

    #[test]
    fn test_dump_header_parses_minimal_metadata() {
        let header: Luks2Header = serde_json::from_str(
            r#"{
                "keyslots": {"0": {"type": "luks2"}},
                "tokens": {"2": {"type": "ubuntu-fde", "keyslots": ["0"]}},
                "segments": {}
            }"#,
        )
        .unwrap();
        assert_eq!(header.keyslots.len(), 1);
        assert_eq!(header.tokens["2"]["type"], "ubuntu-fde");
    }
}
