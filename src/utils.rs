//! Helpers for the host side: serial ports and shell commands.

mod ports;

use std::process::Command;

use log::{debug, warn};

use crate::error::{Error, Result};

pub(crate) use ports::{open_and_setup_port, wait_for_port};

/// Run `command` through `sh -c` and return its standard output. A non-zero
/// exit status is an error carrying the command's standard error.
pub(crate) fn run_command(command: &str) -> Result<String> {
    debug!("running `{}`", command);
    let output = Command::new("sh").arg("-c").arg(command).output()?;
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if output.status.success() {
        Ok(stdout)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!("`{}` exited with {}", command, output.status);
        Err(Error::Critical(format!(
            "`{}` failed ({}): {}",
            command,
            output.status,
            stderr.trim()
        )))
    }
}

#[test]
fn command_output_is_returned() {
    assert_eq!(run_command("echo hello").unwrap().trim(), "hello");
}

#[test]
fn failing_command_is_an_error() {
    let err = run_command("echo oops >&2; exit 3").unwrap_err();
    assert!(err.to_string().contains("oops"));
}
