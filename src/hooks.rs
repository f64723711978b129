//! Protocol plumbing for the out-of-process FDE hook helper. Requests go
//! as a single JSON document on stdin; responses come back on stdout,
//! either as JSON or (for v1 reveal) as raw key bytes.

use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use log::trace;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use diskseal_api::error::{HookError, ReportError, SealError};

use crate::keydata::base64_bytes;

/// Wall-clock cap on a helper invocation.
pub const HOOK_TIMEOUT: Duration = Duration::from_secs(120);

/// A request to the hook helper.
#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum HookRequest<'a> {
    InitialSetup {
        #[serde(serialize_with = "serialize_bytes")]
        key: &'a [u8],
        #[serde(rename = "key-name")]
        key_name: &'a str,
    },
    Reveal {
        #[serde(rename = "sealed-key", serialize_with = "serialize_bytes")]
        sealed_key: &'a [u8],
        #[serde(rename = "sealed-key-name")]
        sealed_key_name: &'a str,
        handle: Option<serde_json::Value>,
    },
    Lock,
}

fn serialize_bytes<S: serde::Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    base64_bytes::serialize(bytes, serializer)
}

/// Response to `initial-setup`.
#[derive(Debug, Deserialize)]
pub struct InitialSetupResponse {
    #[serde(rename = "encrypted-key", with = "base64_bytes")]
    pub encrypted_key: Vec<u8>,
    #[serde(default)]
    pub handle: Option<Box<RawValue>>,
}

/// Response to `reveal` for v2/v3 hooks. v1 hooks answer with raw bytes
/// instead, which callers take straight from the runner.
#[derive(Debug, Deserialize)]
struct RevealResponse {
    #[serde(with = "base64_bytes")]
    key: Vec<u8>,
}

/// Runs hook requests. The production implementation invokes an external
/// program; tests substitute scripted responders.
pub trait HookRunner {
    /// Sends `request` and returns the raw bytes the helper wrote to
    /// stdout.
    fn run(&self, request: &HookRequest) -> Result<Vec<u8>, SealError>;
}

/// Asks the helper to protect `key`, returning the encrypted key and the
/// opaque handle to store alongside it.
pub fn initial_setup(
    runner: &dyn HookRunner,
    key: &[u8],
    key_name: &str,
) -> Result<InitialSetupResponse, SealError> {
    let stdout = runner.run(&HookRequest::InitialSetup { key, key_name })?;
    serde_json::from_slice(&stdout).structured(HookError::HookHelperFailed {
        details: "malformed initial-setup response".to_string(),
    })
}

/// Asks the helper to reveal a v2/v3 sealed key.
pub fn reveal(
    runner: &dyn HookRunner,
    sealed_key: &[u8],
    sealed_key_name: &str,
    handle: Option<&RawValue>,
) -> Result<Vec<u8>, SealError> {
    let handle = handle
        .map(|h| serde_json::from_str(h.get()))
        .transpose()
        .structured(HookError::HookHelperFailed {
            details: "key data handle is not valid JSON".to_string(),
        })?;
    let stdout = runner.run(&HookRequest::Reveal {
        sealed_key,
        sealed_key_name,
        handle,
    })?;
    let response: RevealResponse =
        serde_json::from_slice(&stdout).structured(HookError::HookHelperFailed {
            details: "malformed reveal response".to_string(),
        })?;
    Ok(response.key)
}

/// Asks the helper to reveal a legacy v1 blob. The answer is raw bytes on
/// stdout and must be exactly one unlock key long.
pub fn reveal_v1(runner: &dyn HookRunner, sealed_key: &[u8]) -> Result<Vec<u8>, SealError> {
    let stdout = runner.run(&HookRequest::Reveal {
        sealed_key,
        sealed_key_name: "",
        handle: None,
    })?;
    if stdout.len() != crate::keys::UNLOCK_KEY_SIZE {
        return Err(SealError::new(HookError::HookHelperFailed {
            details: format!(
                "v1 reveal returned {} bytes, expected {}",
                stdout.len(),
                crate::keys::UNLOCK_KEY_SIZE
            ),
        }));
    }
    Ok(stdout)
}

/// Tells the helper to lock its key store for the rest of this boot.
pub fn lock(runner: &dyn HookRunner) -> Result<(), SealError> {
    runner.run(&HookRequest::Lock).map(|_| ())
}

/// Production runner invoking an external helper program.
///
/// The helper runs under a transient systemd scope with a syscall filter
/// forbidding the mount family, and is killed once the wall-clock cap
/// elapses.
pub struct ProcessHookRunner {
    program: PathBuf,
    timeout: Duration,
    confine: bool,
}

impl ProcessHookRunner {
    pub fn new(program: PathBuf) -> Self {
        ProcessHookRunner {
            program,
            timeout: HOOK_TIMEOUT,
            confine: true,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Disables the systemd confinement wrapper, for environments without
    /// a system bus.
    pub fn without_confinement(mut self) -> Self {
        self.confine = false;
        self
    }

    fn command(&self) -> Command {
        if self.confine {
            let mut cmd = Command::new("systemd-run");
            cmd.arg("--quiet")
                .arg("--pipe")
                .arg("--wait")
                .arg("--collect")
                .arg("--property=SystemCallFilter=~@mount")
                .arg(&self.program);
            cmd
        } else {
            Command::new(&self.program)
        }
    }
}

impl HookRunner for ProcessHookRunner {
    fn run(&self, request: &HookRequest) -> Result<Vec<u8>, SealError> {
        let request_json =
            serde_json::to_vec(request).structured(HookError::HookHelperFailed {
                details: "could not serialize hook request".to_string(),
            })?;
        trace!("Invoking FDE hook helper '{}'", self.program.display());

        let mut cmd = self.command();
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().structured(HookError::HookHelperFailed {
            details: format!("could not spawn '{}'", self.program.display()),
        })?;

        // The request is tiny; writing before reading cannot fill the
        // pipe.
        child
            .stdin
            .take()
            .structured(HookError::HookHelperFailed {
                details: "helper has no stdin".to_string(),
            })?
            .write_all(&request_json)
            .structured(HookError::HookHelperFailed {
                details: "could not write hook request".to_string(),
            })?;

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(SealError::new(HookError::HookHelperTimeout {
                            seconds: self.timeout.as_secs(),
                        }));
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(e) => {
                    return Err(e).structured(HookError::HookHelperFailed {
                        details: "could not wait for helper".to_string(),
                    });
                }
            }
        };

        let mut stdout = Vec::new();
        if let Some(mut pipe) = child.stdout.take() {
            use std::io::Read;
            let _ = pipe.read_to_end(&mut stdout);
        }

        if !status.success() {
            let mut stderr = String::new();
            if let Some(mut pipe) = child.stderr.take() {
                use std::io::Read;
                let _ = pipe.read_to_string(&mut stderr);
            }
            return Err(SealError::new(HookError::HookHelperFailed {
                details: format!("helper exited with {}: {}", status, stderr.trim()),
            }));
        }

        Ok(stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::ScriptedHookRunner;

    #[test]
    fn test_request_json_shapes() {
        let setup = HookRequest::InitialSetup {
            key: &[1, 2, 3],
            key_name: "ubuntu-data",
        };
        let json = serde_json::to_value(&setup).unwrap();
        assert_eq!(json["op"], "initial-setup");
        assert_eq!(json["key"], "AQID");
        assert_eq!(json["key-name"], "ubuntu-data");

        let reveal = HookRequest::Reveal {
            sealed_key: &[4, 5],
            sealed_key_name: "ubuntu-data",
            handle: Some(serde_json::json!({"v": 2})),
        };
        let json = serde_json::to_value(&reveal).unwrap();
        assert_eq!(json["op"], "reveal");
        assert_eq!(json["sealed-key"], "BAU=");
        assert_eq!(json["handle"]["v"], 2);

        let json = serde_json::to_value(HookRequest::Lock).unwrap();
        assert_eq!(json, serde_json::json!({"op": "lock"}));
    }

    #[test]
    fn test_initial_setup_parses_response() {
        let runner =
            ScriptedHookRunner::replying(br#"{"encrypted-key":"BAUG","handle":{"v":2}}"#.to_vec());
        let response = initial_setup(&runner, &[1, 2, 3], "ubuntu-data").unwrap();
        assert_eq!(response.encrypted_key, vec![4, 5, 6]);
        assert_eq!(response.handle.unwrap().get(), r#"{"v":2}"#);
    }

    #[test]
    fn test_reveal_parses_key() {
        let runner = ScriptedHookRunner::replying(br#"{"key":"AQID"}"#.to_vec());
        let key = reveal(&runner, &[9], "ubuntu-data", None).unwrap();
        assert_eq!(key, vec![1, 2, 3]);
    }

    #[test]
    fn test_reveal_v1_expects_exactly_one_unlock_key() {
        let runner = ScriptedHookRunner::replying(vec![7u8; 64]);
        assert_eq!(reveal_v1(&runner, &[9]).unwrap(), vec![7u8; 64]);

        let runner = ScriptedHookRunner::replying(vec![7u8; 32]);
        let err = reveal_v1(&runner, &[9]).unwrap_err();
        assert_eq!(err.tag(), "hook-helper-failed");
    }

    #[test]
    fn test_malformed_response_is_hook_helper_failed() {
        let runner = ScriptedHookRunner::replying(b"not json".to_vec());
        let err = initial_setup(&runner, &[1], "name").unwrap_err();
        assert_eq!(err.tag(), "hook-helper-failed");
    }

    #[test]
    fn test_process_runner_roundtrip_with_cat() {
        // `cat` echoes the request, which is valid JSON but not a valid
        // reveal response; the runner itself must succeed.
        let runner = ProcessHookRunner::new(PathBuf::from("cat")).without_confinement();
        let stdout = runner.run(&HookRequest::Lock).unwrap();
        assert_eq!(stdout, br#"{"op":"lock"}"#);
    }

    #[test]
    fn test_process_runner_times_out() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("slow-hook");
        std::fs::write(&script, "#!/bin/sh\ncat >/dev/null\nsleep 10\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let runner = ProcessHookRunner::new(script)
            .without_confinement()
            .with_timeout(Duration::from_millis(100));
        let err = runner.run(&HookRequest::Lock).unwrap_err();
        assert_eq!(err.tag(), "hook-helper-timeout");
    }

    #[test]
    fn test_process_runner_reports_helper_failure_with_stderr() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("broken-hook");
        std::fs::write(&script, "#!/bin/sh\ncat >/dev/null\necho kaput >&2\nexit 3\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let runner = ProcessHookRunner::new(script).without_confinement();
        let err = runner.run(&HookRequest::Lock).unwrap_err();
        assert_eq!(err.tag(), "hook-helper-failed");
        assert!(format!("{:?}", err).contains("kaput"));
    }
}
