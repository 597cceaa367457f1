//! Unified error types for the partmgr-core library.
//!
//! Uses SNAFU for context-rich error handling, especially useful when the same
//! underlying error type (like `std::io::Error`) appears in different contexts.
//!
//! These are *hard* errors: the engine could not establish ground truth or
//! reach the system at all. Refusals and failed operations are reported as
//! values in [`crate::orchestrator::Failure`] instead.

use snafu::{ResultExt, Snafu};
use std::path::PathBuf;

/// Result type alias using the library's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for all core library operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// No block device enumeration source could be read.
    #[snafu(display("block device enumeration unavailable: {reason}"))]
    EnumerationUnavailable { reason: String },

    /// The live mount table could not be read.
    #[snafu(display("mount table unavailable at {}", path.display()))]
    MountTableUnavailable {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to execute a system command.
    #[snafu(display("failed to execute command '{command}'"))]
    CommandExecution {
        command: String,
        source: std::io::Error,
    },

    /// Command executed but returned non-zero exit code.
    #[snafu(display("command '{command}' exited with code {code}: {stderr}"))]
    CommandExit {
        command: String,
        code: i32,
        stderr: String,
    },

    /// Failed to parse lsblk JSON output.
    #[snafu(display("failed to parse lsblk output: {message}"))]
    LsblkParse { message: String },

    /// A procfs file could not be read.
    #[snafu(display("failed to read {}", path.display()))]
    ProcRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Mount point creation failed.
    #[snafu(display("failed to create mount point at {}", path.display()))]
    MountPointCreation {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Delivering a signal to a process failed.
    #[snafu(display("failed to signal process {pid}"))]
    Signal {
        pid: u32,
        source: nix::errno::Errno,
    },

    /// Configuration file could not be read.
    #[snafu(display("failed to read configuration at {}", path.display()))]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Configuration file is not valid JSON for [`crate::config::EngineConfig`].
    #[snafu(display("invalid configuration at {}", path.display()))]
    ConfigParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// User cancelled authentication dialog.
    #[snafu(display("authentication cancelled by user"))]
    AuthenticationCancelled,

    #[snafu(whatever, display("{message}"))]
    Generic {
        message: String,
        #[snafu(source(from(Box<dyn std::error::Error>, Some)))]
        source: Option<Box<dyn std::error::Error>>,
    },
}

impl Error {
    /// Returns true if this error means the signalled process no longer exists.
    pub fn is_no_such_process(&self) -> bool {
        matches!(
            self,
            Error::Signal {
                source: nix::errno::Errno::ESRCH,
                ..
            }
        )
    }
}

/// Extension trait for adding context to io::Error results.
pub trait IoResultExt<T> {
    /// Add context for command execution errors.
    fn command_context(self, command: impl Into<String>) -> Result<T>;

    /// Add context for procfs read errors.
    fn proc_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for mount table read errors.
    fn mount_table_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for mount point creation errors.
    fn mount_point_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for configuration read errors.
    fn config_context(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::result::Result<T, std::io::Error> {
    fn command_context(self, command: impl Into<String>) -> Result<T> {
        self.context(CommandExecutionSnafu {
            command: command.into(),
        })
    }

    fn proc_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(ProcReadSnafu { path: path.into() })
    }

    fn mount_table_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(MountTableUnavailableSnafu { path: path.into() })
    }

    fn mount_point_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(MountPointCreationSnafu { path: path.into() })
    }

    fn config_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(ConfigReadSnafu { path: path.into() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_such_process_detection() {
        let gone = Error::Signal {
            pid: 10,
            source: nix::errno::Errno::ESRCH,
        };
        assert!(gone.is_no_such_process());

        let denied = Error::Signal {
            pid: 10,
            source: nix::errno::Errno::EPERM,
        };
        assert!(!denied.is_no_such_process());
    }

    #[test]
    fn test_mount_table_context_display() {
        let err: Result<()> = Err(std::io::Error::from(std::io::ErrorKind::NotFound))
            .mount_table_context("/proc/self/mountinfo");
        assert_eq!(
            err.unwrap_err().to_string(),
            "mount table unavailable at /proc/self/mountinfo"
        );
    }
}
