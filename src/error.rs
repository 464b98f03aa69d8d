//! Error type shared by every layer of the dispatcher.

use std::{io, time::Duration};

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A pattern wait on the console exceeded its bound.
    #[error("timed out after {timeout:?} waiting for `{expected}`")]
    Timeout { expected: String, timeout: Duration },

    /// The device network could not be reached or its address not acquired.
    #[error("network error: {0}")]
    Network(String),

    /// Building the factory image failed. Normal-mode flashing downgrades this
    /// to a warning.
    #[error("factory image generation failed: {0}")]
    FlashGeneration(String),

    #[error("boot command `{command}` failed: {message}")]
    BootCommand { command: String, message: String },

    /// Unknown device family or bootloader type.
    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    #[error("{0}")]
    Critical(String),

    #[error("no console session is attached to the device")]
    NotConnected,

    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("invalid device configuration: {0}")]
    Config(#[from] toml::de::Error),

    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    pub(crate) fn timeout(patterns: &[&str], timeout: Duration) -> Self {
        Error::Timeout {
            expected: patterns.join(" | "),
            timeout,
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn timeout_lists_all_alternatives() {
    let err = Error::timeout(&["shell@", "root@"], Duration::from_secs(5));
    assert!(err.is_timeout());
    assert_eq!(
        err.to_string(),
        "timed out after 5s waiting for `shell@ | root@`"
    );
}

#[test]
fn boot_command_names_the_line() {
    let err = Error::BootCommand {
        command: "mstar auto_update.txt".into(),
        message: "Bootloader Error: boot command execution failed.".into(),
    };
    assert!(!err.is_timeout());
    assert!(err.to_string().contains("mstar auto_update.txt"));
}
