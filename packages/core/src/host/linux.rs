//! Host backed by the running Linux kernel.
//!
//! Reads come straight from procfs and `lsblk`. Mutations shell out to
//! `mount`, `umount`, `swapon` and `swapoff` through the configured
//! [`ExecutionContext`], so they run as root when escalation is enabled.

use std::fs;
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::stat;
use nix::unistd::Pid;
use tracing::{debug, info};

use crate::busy::HandleKind;
use crate::disk::{DevNum, LSBLK_COLUMNS};
use crate::error::{Error, IoResultExt, Result};
use crate::executor::{ExecutionContext, run_command};
use crate::host::{FilesystemUser, MountOps, ProbeOps, ProcessHandles, ProcessOps, TermSignal};

const PROC: &str = "/proc";

/// The real system.
#[derive(Debug, Clone, Default)]
pub struct LinuxHost {
    ctx: ExecutionContext,
}

impl LinuxHost {
    pub fn new(ctx: ExecutionContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    fn proc_path(pid: u32, entry: &str) -> PathBuf {
        Path::new(PROC).join(pid.to_string()).join(entry)
    }

    /// Delivers a signal with `kill(1)` under escalation, for processes we do not own.
    fn signal_privileged(&self, pid: u32, signal: TermSignal) -> Result<()> {
        let name = match signal {
            TermSignal::Graceful => "TERM",
            TermSignal::Forceful => "KILL",
        };
        let pid_arg = pid.to_string();
        match self.ctx.run_privileged_checked("kill", &["-s", name, &pid_arg]) {
            Ok(_) => Ok(()),
            Err(Error::CommandExit { stderr, .. }) if stderr.contains("No such process") => {
                Err(Error::Signal {
                    pid,
                    source: Errno::ESRCH,
                })
            }
            Err(e) => Err(e),
        }
    }
}

fn is_executable(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Paths of file-backed mappings from `/proc/<pid>/maps`.
fn parse_maps(content: &str) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = Vec::new();
    for line in content.lines() {
        // address perms offset dev inode pathname
        let Some(path) = line.splitn(6, char::is_whitespace).nth(5).map(str::trim) else {
            continue;
        };
        if !path.starts_with('/') {
            continue;
        }
        let path = PathBuf::from(path);
        if !paths.contains(&path) {
            paths.push(path);
        }
    }
    paths
}

/// Parses `fuser -m` standard output: pids suffixed with access letters
/// (`1234c 5678rce`).
fn parse_fuser(stdout: &str) -> Vec<FilesystemUser> {
    let mut users: Vec<FilesystemUser> = Vec::new();
    for token in stdout.split_whitespace() {
        let split = token.find(|c: char| !c.is_ascii_digit()).unwrap_or(token.len());
        let Ok(pid) = token[..split].parse::<u32>() else {
            continue;
        };
        let access = &token[split..];
        let mut handles: Vec<HandleKind> = access
            .chars()
            .filter_map(|c| match c {
                'c' => Some(HandleKind::WorkingDirectory),
                'e' => Some(HandleKind::Executable),
                'f' | 'F' => Some(HandleKind::OpenFile),
                'r' => Some(HandleKind::RootDirectory),
                'm' => Some(HandleKind::MemoryMap),
                _ => None,
            })
            .collect();
        if handles.is_empty() {
            handles.push(HandleKind::OpenFile);
        }
        for handle in handles {
            let user = FilesystemUser { pid, handle };
            if !users.contains(&user) {
                users.push(user);
            }
        }
    }
    users
}

impl ProbeOps for LinuxHost {
    fn lsblk_json(&self) -> Result<String> {
        let args = ["--json", "--bytes", "--output", LSBLK_COLUMNS];
        let output = run_command("lsblk", &args)?;
        if !output.status.success() {
            return Err(Error::CommandExit {
                command: "lsblk".to_string(),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn read_file(&self, path: &Path) -> io::Result<String> {
        fs::read_to_string(path)
    }

    fn binary_exists(&self, binary: &str, search_path: &[PathBuf]) -> bool {
        if binary.contains('/') {
            return is_executable(Path::new(binary));
        }
        search_path.iter().any(|dir| is_executable(&dir.join(binary)))
    }

    fn kernel_module_available(&self, fstype: &str) -> bool {
        // Dry run: resolves the module without loading it.
        match run_command("modprobe", &["--dry-run", "--quiet", fstype]) {
            Ok(output) => output.status.success(),
            Err(e) => {
                debug!(fstype, error = %e, "modprobe unavailable");
                false
            }
        }
    }

    fn self_exe_devnum(&self) -> Option<DevNum> {
        let dev = fs::metadata("/proc/self/exe").ok()?.dev();
        Some(DevNum::new(stat::major(dev) as u32, stat::minor(dev) as u32))
    }
}

impl ProcessOps for LinuxHost {
    fn list_pids(&self) -> Result<Vec<u32>> {
        let entries = fs::read_dir(PROC).proc_context(PROC)?;
        let mut pids: Vec<u32> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str()?.parse().ok())
            .collect();
        pids.sort_unstable();
        Ok(pids)
    }

    fn process_name(&self, pid: u32) -> Option<String> {
        fs::read_to_string(Self::proc_path(pid, "comm"))
            .ok()
            .map(|name| name.trim_end().to_string())
    }

    fn process_handles(&self, pid: u32) -> Result<Option<ProcessHandles>> {
        let link = |entry: &str| fs::read_link(Self::proc_path(pid, entry)).ok();

        // Without access to the fd table the process cannot be inspected at all.
        let fd_dir = Self::proc_path(pid, "fd");
        let fds = match fs::read_dir(&fd_dir) {
            Ok(fds) => fds,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).proc_context(fd_dir),
        };
        let open_files = fds
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| fs::read_link(entry.path()).ok())
            .filter(|target| target.is_absolute())
            .collect();
        let mapped_files = fs::read_to_string(Self::proc_path(pid, "maps"))
            .map(|content| parse_maps(&content))
            .unwrap_or_default();

        Ok(Some(ProcessHandles {
            cwd: link("cwd"),
            exe: link("exe"),
            root: link("root"),
            open_files,
            mapped_files,
        }))
    }

    fn filesystem_users(&self, target: &Path) -> Result<Option<Vec<FilesystemUser>>> {
        if !self.ctx.is_escalated() {
            return Ok(None);
        }
        let target = target.to_string_lossy();
        let output = self.ctx.run_privileged("fuser", &["-m", &*target])?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if output.status.success() {
            return Ok(Some(parse_fuser(&stdout)));
        }
        // Exit 1 with no output: nothing uses the filesystem.
        if output.status.code() == Some(1) && stdout.trim().is_empty() && stderr.trim().is_empty() {
            return Ok(Some(Vec::new()));
        }
        Err(Error::CommandExit {
            command: "fuser".to_string(),
            code: output.status.code().unwrap_or(-1),
            stderr: stderr.trim().to_string(),
        })
    }

    fn is_alive(&self, pid: u32) -> bool {
        let Ok(stat) = fs::read_to_string(Self::proc_path(pid, "stat")) else {
            return false;
        };
        // pid (comm) state ...; comm may contain spaces and parentheses.
        let state = stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.trim_start().chars().next());
        !matches!(state, Some('Z') | Some('X') | None)
    }

    fn send_signal(&self, pid: u32, signal: TermSignal) -> Result<()> {
        let sig = match signal {
            TermSignal::Graceful => Signal::SIGTERM,
            TermSignal::Forceful => Signal::SIGKILL,
        };
        let raw = i32::try_from(pid).map_err(|_| Error::Signal {
            pid,
            source: Errno::EINVAL,
        })?;
        match signal::kill(Pid::from_raw(raw), sig) {
            Ok(()) => Ok(()),
            Err(Errno::EPERM) if self.ctx.is_escalated() => {
                info!(pid, ?signal, "signalling through privileged kill");
                self.signal_privileged(pid, signal)
            }
            Err(source) => Err(Error::Signal { pid, source }),
        }
    }

    fn current_pid(&self) -> u32 {
        std::process::id()
    }
}

impl MountOps for LinuxHost {
    fn create_mount_point(&self, path: &Path) -> Result<bool> {
        if path.is_dir() {
            return Ok(false);
        }
        if self.ctx.is_escalated() {
            self.ctx.mkdir_privileged(&path.to_string_lossy())?;
        } else {
            fs::create_dir_all(path).mount_point_context(path)?;
        }
        Ok(true)
    }

    fn remove_mount_point(&self, path: &Path) -> Result<()> {
        if self.ctx.is_escalated() {
            self.ctx
                .run_privileged_checked("rmdir", &[&*path.to_string_lossy()])?;
            return Ok(());
        }
        fs::remove_dir(path).mount_point_context(path)
    }

    fn mount(&self, device: &Path, target: &Path, fstype: &str, options: &[String]) -> Result<()> {
        let device = device.to_string_lossy();
        let target = target.to_string_lossy();
        let joined = options.join(",");
        let mut args = vec!["-t", fstype];
        if !joined.is_empty() {
            args.extend(["-o", joined.as_str()]);
        }
        args.extend([&*device, &*target]);
        self.ctx.run_privileged_checked("mount", &args)?;
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        self.ctx
            .run_privileged_checked("umount", &[&*target.to_string_lossy()])?;
        Ok(())
    }

    fn swap_on(&self, device: &Path) -> Result<()> {
        self.ctx
            .run_privileged_checked("swapon", &[&*device.to_string_lossy()])?;
        Ok(())
    }

    fn swap_off(&self, device: &Path) -> Result<()> {
        self.ctx
            .run_privileged_checked("swapoff", &[&*device.to_string_lossy()])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_maps() {
        let maps = "\
55d0c0a00000-55d0c0a02000 r--p 00000000 08:11 1054 /mnt/usb/bin/tool
55d0c0a02000-55d0c0a08000 r-xp 00002000 08:11 1054 /mnt/usb/bin/tool
7f1e2c000000-7f1e2c021000 rw-p 00000000 00:00 0
7f1e2d000000-7f1e2d200000 r--p 00000000 08:02 777 /usr/lib/my lib.so
7ffd5b000000-7ffd5b021000 rw-p 00000000 00:00 0 [stack]
";
        assert_eq!(
            parse_maps(maps),
            vec![
                PathBuf::from("/mnt/usb/bin/tool"),
                PathBuf::from("/usr/lib/my lib.so"),
            ]
        );
    }

    #[test]
    fn test_self_process_is_visible() {
        let host = LinuxHost::default();
        let pid = host.current_pid();
        assert!(host.is_alive(pid));
        assert!(host.list_pids().unwrap().contains(&pid));
        let handles = host.process_handles(pid).unwrap().unwrap();
        assert!(handles.exe.is_some());
    }

    #[test]
    fn test_vanished_process_has_no_handles() {
        let host = LinuxHost::default();
        assert!(host.process_handles(u32::MAX - 1).unwrap().is_none());
    }

    #[test]
    fn test_unescalated_host_has_no_privileged_scan() {
        let host = LinuxHost::default();
        assert!(host.filesystem_users(Path::new("/")).unwrap().is_none());
    }

    #[test]
    fn test_parse_fuser() {
        let users = parse_fuser("   812c  1044rce 1300 kernel 77mm");
        assert_eq!(
            users,
            vec![
                FilesystemUser { pid: 812, handle: HandleKind::WorkingDirectory },
                FilesystemUser { pid: 1044, handle: HandleKind::RootDirectory },
                FilesystemUser { pid: 1044, handle: HandleKind::WorkingDirectory },
                FilesystemUser { pid: 1044, handle: HandleKind::Executable },
                FilesystemUser { pid: 1300, handle: HandleKind::OpenFile },
                FilesystemUser { pid: 77, handle: HandleKind::MemoryMap },
            ]
        );
    }

    #[test]
    fn test_remove_mount_point() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("stick");
        let host = LinuxHost::default();

        assert!(host.create_mount_point(&target).unwrap());
        assert!(!host.create_mount_point(&target).unwrap());
        host.remove_mount_point(&target).unwrap();
        assert!(!target.exists());
    }

    #[test]
    fn test_dead_pid_is_not_alive() {
        let host = LinuxHost::default();
        assert!(!host.is_alive(u32::MAX - 1));
    }

    #[test]
    fn test_binary_exists() {
        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("mount.fake");
        fs::write(&tool, "#!/bin/sh\n").unwrap();
        let search = vec![dir.path().to_path_buf()];
        let host = LinuxHost::default();

        assert!(!host.binary_exists("mount.fake", &search));
        fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).unwrap();
        assert!(host.binary_exists("mount.fake", &search));
        assert!(!host.binary_exists("mount.other", &search));
    }
}
