//! Minimal kernel keyring access through the raw syscalls. Only the two
//! operations the key manager needs are wrapped: installing a user key and
//! reading one back by description.

use std::ffi::CString;

use anyhow::{bail, Context, Error};

const KEY_SPEC_USER_SESSION_KEYRING: libc::c_long = -5;
const KEYCTL_READ: libc::c_long = 11;

const KEY_TYPE_USER: &[u8] = b"user\0";

fn key_description(description: &str) -> Result<CString, Error> {
    CString::new(description).context("Key description contains a NUL byte")
}

/// Installs `payload` as a "user" type key with the given description in
/// the user session keyring, replacing any existing key with the same
/// description. Returns the key serial.
pub fn add_user_key(description: &str, payload: &[u8]) -> Result<i32, Error> {
    let description = key_description(description)?;

    // SAFETY: all pointers are valid for the duration of the call and the
    // payload length is passed alongside the buffer.
    let serial = unsafe {
        libc::syscall(
            libc::SYS_add_key,
            KEY_TYPE_USER.as_ptr(),
            description.as_ptr(),
            payload.as_ptr(),
            payload.len(),
            KEY_SPEC_USER_SESSION_KEYRING,
        )
    };
    if serial < 0 {
        return Err(std::io::Error::last_os_error()).context(format!(
            "add_key failed for '{}'",
            description.to_string_lossy()
        ));
    }
    Ok(serial as i32)
}

/// Looks up a "user" type key by description in the user session keyring
/// and returns its payload.
pub fn read_user_key(description: &str) -> Result<Vec<u8>, Error> {
    let description = key_description(description)?;

    // SAFETY: the callout-info pointer may be null per request_key(2).
    let serial = unsafe {
        libc::syscall(
            libc::SYS_request_key,
            KEY_TYPE_USER.as_ptr(),
            description.as_ptr(),
            std::ptr::null::<libc::c_char>(),
            KEY_SPEC_USER_SESSION_KEYRING,
        )
    };
    if serial < 0 {
        return Err(std::io::Error::last_os_error()).context(format!(
            "request_key failed for '{}'",
            description.to_string_lossy()
        ));
    }

    // First call sizes the payload, second call fetches it.
    // SAFETY: a null buffer with zero length is the documented sizing call.
    let len = unsafe {
        libc::syscall(
            libc::SYS_keyctl,
            KEYCTL_READ,
            serial,
            std::ptr::null_mut::<libc::c_char>(),
            0usize,
        )
    };
    if len < 0 {
        return Err(std::io::Error::last_os_error()).context(format!(
            "keyctl read (sizing) failed for '{}'",
            description.to_string_lossy()
        ));
    }

    let mut payload = vec![0u8; len as usize];
    // SAFETY: the buffer is valid for `payload.len()` bytes.
    let read = unsafe {
        libc::syscall(
            libc::SYS_keyctl,
            KEYCTL_READ,
            serial,
            payload.as_mut_ptr(),
            payload.len(),
        )
    };
    if read < 0 {
        return Err(std::io::Error::last_os_error()).context(format!(
            "keyctl read failed for '{}'",
            description.to_string_lossy()
        ));
    }
    if read as usize != payload.len() {
        bail!(
            "Key '{}' changed size during read ({} != {})",
            description.to_string_lossy(),
            read,
            payload.len()
        );
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_description_with_nul_rejected() {
        assert!(add_user_key("bad\0desc", b"payload").is_err());
    }

    // Keyring syscalls need a session keyring, which not every test
    // environment provides, so the round-trip is exercised best-effort.
    #[test]
    fn test_add_and_read_roundtrip() {
        let desc = format!("diskseal-test:{}", std::process::id());
        if add_user_key(&desc, b"roundtrip-payload").is_err() {
            return;
        }
        assert_eq!(read_user_key(&desc).unwrap(), b"roundtrip-payload");
    }
}
