use std::{
    io::Write,
    os::unix::process::ExitStatusExt,
    process::{Command, Output, Stdio},
};

use anyhow::{anyhow, bail, Context, Error};
use log::trace;

use crate::crate_private::Sealed;

/// Extension for `std::process::Output` to check exit status and surface
/// captured output through anyhow errors. Sealed, so it cannot be
/// implemented outside of this crate.
pub trait OutputChecker: Sealed {
    /// Check if the process exited successfully
    fn is_success(&self) -> bool;

    /// Get the exit code of the process, if it exited normally
    fn exit_code(&self) -> Option<i32>;

    /// Get the signal that terminated the process, if it was terminated by a signal
    fn end_signal(&self) -> Option<i32>;

    /// Get stdout
    fn output(&self) -> String {
        "".into()
    }

    /// Get stderr
    fn error_output(&self) -> String {
        "".into()
    }

    /// Get all available output, useful for reporting or debugging
    fn output_report(&self) -> String {
        let stdout = self.output();
        let stderr = self.error_output();

        let mut res = String::with_capacity(stdout.len() + stderr.len() + 20);

        if !stdout.is_empty() {
            res += &format!("stdout:\n{}\n", stdout);
        }

        if !stderr.is_empty() {
            if !res.is_empty() {
                res += "\n";
            }
            res += &format!("stderr:\n{}\n", stderr);
        }

        res
    }

    /// Check if the process exited successfully, otherwise produce an error
    fn check(&self) -> Result<(), Error> {
        if self.is_success() {
            return Ok(());
        }

        Err(match self.output_report() {
            s if !s.is_empty() => anyhow!("Process output:\n{}", s).context(self.explain_exit()),
            _ => anyhow!("(No output was captured)").context(self.explain_exit()),
        })
    }

    /// Check if the process exited successfully and return stdout, otherwise
    /// produce an error with the output
    fn check_output(&self) -> Result<String, Error> {
        self.check()?;
        Ok(self.output())
    }

    /// Produce a string explaining the exit status of the process
    fn explain_exit(&self) -> String {
        if let Some(code) = self.exit_code() {
            format!("Process exited with status: {code}")
        } else if let Some(signal) = self.end_signal() {
            format!("Process was terminated by signal: {signal}")
        } else {
            "Process exited with unknown status".into()
        }
    }
}

impl Sealed for Output {}

impl OutputChecker for Output {
    fn is_success(&self) -> bool {
        self.status.success()
    }

    fn exit_code(&self) -> Option<i32> {
        self.status.code()
    }

    fn end_signal(&self) -> Option<i32> {
        self.status.signal()
    }

    fn error_output(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into()
    }

    fn output(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into()
    }
}

impl Sealed for Result<Output, std::io::Error> {}

impl OutputChecker for Result<Output, std::io::Error> {
    fn is_success(&self) -> bool {
        self.as_ref()
            .map(|output| output.is_success())
            .unwrap_or(false)
    }

    fn exit_code(&self) -> Option<i32> {
        self.as_ref().ok().and_then(|output| output.exit_code())
    }

    fn end_signal(&self) -> Option<i32> {
        self.as_ref().ok().and_then(|output| output.end_signal())
    }

    fn error_output(&self) -> String {
        self.as_ref()
            .map(|output| output.error_output())
            .unwrap_or("".into())
    }

    fn output(&self) -> String {
        self.as_ref()
            .map(|output| output.output())
            .unwrap_or("".into())
    }

    fn check(&self) -> Result<(), Error> {
        match self {
            Ok(output) => output.check(),
            Err(e) => bail!("Failed to execute process: {}", e),
        }
    }

    fn check_output(&self) -> Result<String, Error> {
        match self {
            Ok(output) => output.check_output(),
            Err(e) => bail!("Failed to execute process: {}", e),
        }
    }

    fn explain_exit(&self) -> String {
        match self {
            Ok(output) => output.explain_exit(),
            Err(e) => format!("Failed to execute process: {}", e),
        }
    }
}

/// Extension for `std::process::Command` that runs the command, traces the
/// invocation, and converts failure into a descriptive error.
pub trait RunAndCheck: Sealed {
    fn run_and_check(&mut self) -> Result<(), Error>;
    fn output_and_check(&mut self) -> Result<String, Error>;
    fn raw_output_and_check(&mut self) -> Result<Output, Error>;
    /// Feed `input` on stdin, then behave like `raw_output_and_check`.
    /// Secrets are routinely passed this way, so the input is never logged.
    fn input_and_check(&mut self, input: &[u8]) -> Result<Output, Error>;
    fn render_command(&self) -> String;
}

impl Sealed for Command {}

impl RunAndCheck for Command {
    fn run_and_check(&mut self) -> Result<(), Error> {
        let rendered_command = self.render_command();
        trace!("Executing '{rendered_command}'");
        let result = self.output();
        trace!(
            "Executed '{rendered_command}': {}",
            result.explain_exit(),
        );
        result
            .check()
            .with_context(|| format!("Error when running: {}", rendered_command))
    }

    fn output_and_check(&mut self) -> Result<String, Error> {
        let rendered_command = self.render_command();
        trace!("Executing '{rendered_command}'");
        let result = self.output();
        trace!(
            "Executed '{rendered_command}': {}",
            result.explain_exit(),
        );
        result
            .check_output()
            .with_context(|| format!("Error when running: {}", rendered_command))
    }

    fn raw_output_and_check(&mut self) -> Result<Output, Error> {
        let rendered_command = self.render_command();
        trace!("Executing '{rendered_command}'");
        let result = self.output();
        trace!(
            "Executed '{rendered_command}': {}",
            result.explain_exit(),
        );
        result
            .check()
            .with_context(|| format!("Error when running: {}", rendered_command))?;
        Ok(result.unwrap())
    }

    fn input_and_check(&mut self, input: &[u8]) -> Result<Output, Error> {
        let rendered_command = self.render_command();
        trace!("Executing '{rendered_command}' with piped stdin");

        self.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = self
            .spawn()
            .with_context(|| format!("Failed to spawn: {}", rendered_command))?;
        child
            .stdin
            .take()
            .context("Child has no stdin handle")?
            .write_all(input)
            .with_context(|| format!("Failed to write stdin of: {}", rendered_command))?;

        let result = child.wait_with_output();
        trace!(
            "Executed '{rendered_command}': {}",
            result.explain_exit(),
        );
        result
            .check()
            .with_context(|| format!("Error when running: {}", rendered_command))?;
        Ok(result.unwrap())
    }

    fn render_command(&self) -> String {
        if self.get_args().count() == 0 {
            self.get_program().to_string_lossy().into()
        } else {
            format!(
                "{} {}",
                self.get_program().to_string_lossy(),
                self.get_args()
                    .map(|a| a.to_string_lossy())
                    .collect::<Vec<_>>()
                    .join(" ")
            )
        }
    }
}
