//! Command execution abstraction with privilege escalation support.
//!
//! Privileged actions (mount, umount, swapon, swapoff, signalling processes
//! owned by other users) run through an [`ExecutionContext`]. How authority is
//! obtained (`pkexec` for GUI sessions, `sudo` on a TTY, or already running as
//! root) is opaque to the engine; it only sees success or a refusal.

use std::process::{Command, Output};

use serde::{Deserialize, Serialize};

use crate::error::{Error, IoResultExt, Result};

/// Privilege escalation method for executing commands that require root.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrivilegeEscalation {
    /// Execute directly without privilege escalation.
    #[default]
    None,
    /// Use `pkexec` for GUI-based privilege escalation (polkit).
    Pkexec,
    /// Use `sudo` for TTY-based privilege escalation.
    Sudo,
}

impl PrivilegeEscalation {
    fn wrapper(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Pkexec => Some("pkexec"),
            Self::Sudo => Some("sudo"),
        }
    }
}

/// Execution context for running system commands.
///
/// # Example
///
/// ```
/// use partmgr_core::executor::{ExecutionContext, PrivilegeEscalation};
///
/// let ctx = ExecutionContext::default();
/// assert_eq!(ctx.escalation(), PrivilegeEscalation::None);
///
/// let tty_ctx = ExecutionContext::with_sudo();
/// assert_eq!(tty_ctx.escalation(), PrivilegeEscalation::Sudo);
/// ```
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    escalation: PrivilegeEscalation,
}

impl ExecutionContext {
    /// Creates a new execution context with no privilege escalation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an execution context that uses `pkexec` for privileged commands.
    pub fn with_pkexec() -> Self {
        Self::with_escalation(PrivilegeEscalation::Pkexec)
    }

    /// Creates an execution context that uses `sudo` for privileged commands.
    pub fn with_sudo() -> Self {
        Self::with_escalation(PrivilegeEscalation::Sudo)
    }

    /// Creates an execution context with a specific escalation method.
    pub fn with_escalation(escalation: PrivilegeEscalation) -> Self {
        Self { escalation }
    }

    /// Returns the current privilege escalation method.
    pub fn escalation(&self) -> PrivilegeEscalation {
        self.escalation
    }

    /// Returns true if privileged commands are wrapped.
    pub fn is_escalated(&self) -> bool {
        self.escalation != PrivilegeEscalation::None
    }

    /// Executes a command that requires root privileges.
    pub fn run_privileged(&self, cmd: &str, args: &[&str]) -> Result<Output> {
        tracing::debug!(command = cmd, ?args, escalation = ?self.escalation, "running privileged command");
        match self.escalation.wrapper() {
            None => run_command(cmd, args),
            Some(wrapper) => run_with_wrapper(wrapper, cmd, args),
        }
    }

    /// Executes a command that requires root privileges, checking for success.
    ///
    /// Returns an error if the command fails or if authentication is cancelled.
    pub fn run_privileged_checked(&self, cmd: &str, args: &[&str]) -> Result<Output> {
        let output = self.run_privileged(cmd, args)?;

        if !output.status.success() {
            return Err(exit_error(
                self.escalation,
                cmd,
                output.status.code(),
                &String::from_utf8_lossy(&output.stderr),
            ));
        }

        Ok(output)
    }

    /// Creates a directory with root privileges.
    pub fn mkdir_privileged(&self, path: &str) -> Result<()> {
        self.run_privileged_checked("mkdir", &["-p", path])?;
        Ok(())
    }
}

/// Maps a failed exit to an error.
///
/// pkexec exits 126 when the dialog is dismissed and 127 when authorization
/// is refused; both mean the user did not grant privileges.
fn exit_error(escalation: PrivilegeEscalation, cmd: &str, code: Option<i32>, stderr: &str) -> Error {
    if escalation == PrivilegeEscalation::Pkexec && matches!(code, Some(126) | Some(127)) {
        return Error::AuthenticationCancelled;
    }
    Error::CommandExit {
        command: cmd.to_string(),
        code: code.unwrap_or(-1),
        stderr: stderr.trim().to_string(),
    }
}

/// Runs an unprivileged command, returning its output regardless of exit status.
pub fn run_command(cmd: &str, args: &[&str]) -> Result<Output> {
    Command::new(cmd).args(args).output().command_context(cmd)
}

/// Runs a command with a privilege escalation wrapper (pkexec or sudo).
fn run_with_wrapper(wrapper: &str, cmd: &str, args: &[&str]) -> Result<Output> {
    let mut wrapper_args = vec![cmd];
    wrapper_args.extend(args);

    Command::new(wrapper)
        .args(&wrapper_args)
        .output()
        .command_context(format!("{} {}", wrapper, cmd))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_context() {
        let ctx = ExecutionContext::default();
        assert_eq!(ctx.escalation(), PrivilegeEscalation::None);
        assert!(!ctx.is_escalated());
    }

    #[test]
    fn test_pkexec_context() {
        let ctx = ExecutionContext::with_pkexec();
        assert_eq!(ctx.escalation(), PrivilegeEscalation::Pkexec);
        assert!(ctx.is_escalated());
    }

    #[test]
    fn test_sudo_context() {
        let ctx = ExecutionContext::with_sudo();
        assert_eq!(ctx.escalation(), PrivilegeEscalation::Sudo);
    }

    #[test]
    fn test_escalation_serde_names() {
        let parsed: PrivilegeEscalation = serde_json::from_str("\"pkexec\"").unwrap();
        assert_eq!(parsed, PrivilegeEscalation::Pkexec);
        assert_eq!(
            serde_json::to_string(&PrivilegeEscalation::None).unwrap(),
            "\"none\""
        );
    }

    #[test]
    fn test_pkexec_refusal_is_authentication_cancelled() {
        for code in [126, 127] {
            let err = exit_error(PrivilegeEscalation::Pkexec, "mount", Some(code), "");
            assert!(matches!(err, Error::AuthenticationCancelled));
        }
        let err = exit_error(PrivilegeEscalation::Sudo, "mount", Some(127), "sudo: mount: command not found\n");
        assert!(matches!(
            err,
            Error::CommandExit { code: 127, ref stderr, .. } if stderr == "sudo: mount: command not found"
        ));
        let err = exit_error(PrivilegeEscalation::Pkexec, "umount", Some(32), "target is busy");
        assert!(matches!(err, Error::CommandExit { code: 32, .. }));
    }

    #[test]
    fn test_missing_binary_is_execution_error() {
        let err = run_command("partmgr-definitely-not-a-binary", &[]).unwrap_err();
        assert!(matches!(err, Error::CommandExecution { .. }));
    }
}
