//! System boundary traits.
//!
//! Everything the engine learns about or does to the machine goes through
//! these traits, so workflows can be exercised without root or real devices.
//! [`LinuxHost`] talks to the running kernel; [`FakeHost`] keeps an in-memory
//! world and records every privileged operation.

pub mod fake;
pub mod linux;

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::busy::HandleKind;
use crate::disk::DevNum;
use crate::error::Result;

pub use fake::{FakeHost, FakeProcess, Operation};
pub use linux::LinuxHost;

/// Read-only system sources.
pub trait ProbeOps {
    /// Raw `lsblk --json` output.
    fn lsblk_json(&self) -> Result<String>;

    /// Reads a text file such as `/proc/self/mountinfo` or `/etc/fstab`.
    fn read_file(&self, path: &Path) -> std::io::Result<String>;

    /// Returns true if an executable named `binary` exists in one of `search_path`.
    fn binary_exists(&self, binary: &str, search_path: &[PathBuf]) -> bool;

    /// Returns true if the kernel can load a module providing `fstype` on demand.
    fn kernel_module_available(&self, fstype: &str) -> bool;

    /// Device number of the filesystem holding the running executable.
    fn self_exe_devnum(&self) -> Option<DevNum>;
}

/// Signals used when clearing busy holders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TermSignal {
    /// SIGTERM.
    Graceful,
    /// SIGKILL.
    Forceful,
}

/// Filesystem references held by one process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessHandles {
    pub cwd: Option<PathBuf>,
    pub exe: Option<PathBuf>,
    pub root: Option<PathBuf>,
    /// Targets of open file descriptors.
    pub open_files: Vec<PathBuf>,
    /// Files mapped into the address space.
    pub mapped_files: Vec<PathBuf>,
}

/// A process using a filesystem, as reported by a privileged scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilesystemUser {
    pub pid: u32,
    pub handle: HandleKind,
}

/// Process inspection and termination.
pub trait ProcessOps {
    /// Pids of all visible processes.
    fn list_pids(&self) -> Result<Vec<u32>>;

    fn process_name(&self, pid: u32) -> Option<String>;

    /// Handles of a process, or None if it vanished.
    ///
    /// A process that exists but cannot be inspected (another user's, with no
    /// privileges) is an error, not None.
    fn process_handles(&self, pid: u32) -> Result<Option<ProcessHandles>>;

    /// Processes using the filesystem at `target`, found with privileges.
    ///
    /// Covers processes [`ProcessOps::process_handles`] cannot inspect.
    /// Returns None when no privileged scan is available.
    fn filesystem_users(&self, target: &Path) -> Result<Option<Vec<FilesystemUser>>>;

    /// Returns false once a process has exited (zombies count as exited).
    fn is_alive(&self, pid: u32) -> bool;

    fn send_signal(&self, pid: u32, signal: TermSignal) -> Result<()>;

    fn current_pid(&self) -> u32;
}

/// Privileged mount-table mutations.
pub trait MountOps {
    /// Creates `path` if needed. Returns true if it did not exist before.
    fn create_mount_point(&self, path: &Path) -> Result<bool>;

    /// Removes an empty mountpoint directory.
    fn remove_mount_point(&self, path: &Path) -> Result<()>;

    /// Mounts `device` at `target` using the given `mount -t` type.
    fn mount(&self, device: &Path, target: &Path, fstype: &str, options: &[String]) -> Result<()>;

    fn unmount(&self, target: &Path) -> Result<()>;

    fn swap_on(&self, device: &Path) -> Result<()>;

    fn swap_off(&self, device: &Path) -> Result<()>;
}

/// Complete host combining all system operation traits.
pub trait Host: ProbeOps + ProcessOps + MountOps + Send + Sync {}

impl<T> Host for T where T: ProbeOps + ProcessOps + MountOps + Send + Sync {}
