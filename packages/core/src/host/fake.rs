//! In-memory host.
//!
//! Models disks, mounts, swap, kernel drivers and processes, and renders them
//! through the same text sources the real kernel exposes (`lsblk --json`,
//! mountinfo, `/proc/swaps`, ...), so the parsing layers are exercised as
//! they would be on a live system. Every mutation is recorded as an
//! [`Operation`].

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use nix::errno::Errno;
use serde_json::{Value, json};

use crate::config::{
    DEFAULT_FILESYSTEMS_PATH, DEFAULT_MOUNTINFO_PATH, DEFAULT_PARTITIONS_PATH, DEFAULT_SWAPS_PATH,
};
use crate::busy::HandleKind;
use crate::disk::DevNum;
use crate::error::{Error, Result};
use crate::host::{FilesystemUser, MountOps, ProbeOps, ProcessHandles, ProcessOps, TermSignal};

/// Pid the fake host reports for the calling process.
pub const FAKE_SELF_PID: u32 = 4242;

const PARTITION_SIZE: u64 = 16 * 1024 * 1024 * 1024;

/// A privileged action performed against a [`FakeHost`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    CreateMountPoint { path: PathBuf },
    RemoveMountPoint { path: PathBuf },
    Mount {
        device: PathBuf,
        target: PathBuf,
        driver: String,
        options: Vec<String>,
    },
    Unmount { target: PathBuf },
    SwapOn { device: PathBuf },
    SwapOff { device: PathBuf },
    Signal { pid: u32, signal: TermSignal },
}

/// A simulated process and the filesystem references it holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeProcess {
    pub pid: u32,
    pub name: String,
    pub handles: ProcessHandles,
    /// Survives SIGTERM; only SIGKILL ends it.
    pub ignores_sigterm: bool,
    /// Stuck in uninterruptible sleep; survives every signal.
    pub uninterruptible: bool,
    /// Owned by another user; its handles cannot be read without privileges.
    pub foreign: bool,
}

impl FakeProcess {
    pub fn new(pid: u32, name: impl Into<String>) -> Self {
        Self {
            pid,
            name: name.into(),
            handles: ProcessHandles::default(),
            ignores_sigterm: false,
            uninterruptible: false,
            foreign: false,
        }
    }

    pub fn open_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.handles.open_files.push(path.into());
        self
    }

    pub fn mapped(mut self, path: impl Into<PathBuf>) -> Self {
        self.handles.mapped_files.push(path.into());
        self
    }

    pub fn cwd(mut self, path: impl Into<PathBuf>) -> Self {
        self.handles.cwd = Some(path.into());
        self
    }

    pub fn exe(mut self, path: impl Into<PathBuf>) -> Self {
        self.handles.exe = Some(path.into());
        self
    }

    pub fn root(mut self, path: impl Into<PathBuf>) -> Self {
        self.handles.root = Some(path.into());
        self
    }

    pub fn ignore_sigterm(mut self) -> Self {
        self.ignores_sigterm = true;
        self
    }

    pub fn uninterruptible(mut self) -> Self {
        self.ignores_sigterm = true;
        self.uninterruptible = true;
        self
    }

    pub fn foreign(mut self) -> Self {
        self.foreign = true;
        self
    }

    fn references(&self, mountpoint: &Path) -> bool {
        !self.uses_of(mountpoint).is_empty()
    }

    /// Handle kinds referring to paths under `mountpoint`.
    fn uses_of(&self, mountpoint: &Path) -> Vec<HandleKind> {
        let h = &self.handles;
        let under = |p: &PathBuf| p.starts_with(mountpoint);
        let kinds = [
            (HandleKind::WorkingDirectory, h.cwd.iter().any(under)),
            (HandleKind::RootDirectory, h.root.iter().any(under)),
            (HandleKind::Executable, h.exe.iter().any(under)),
            (HandleKind::OpenFile, h.open_files.iter().any(under)),
            (HandleKind::MemoryMap, h.mapped_files.iter().any(under)),
        ];
        kinds
            .into_iter()
            .filter_map(|(kind, hit)| hit.then_some(kind))
            .collect()
    }
}

#[derive(Debug, Clone)]
struct FakePartition {
    name: String,
    devnum: DevNum,
    fstype: Option<String>,
    uuid: Option<String>,
    label: Option<String>,
}

#[derive(Debug, Clone)]
struct FakeDisk {
    name: String,
    devnum: DevNum,
    removable: Option<bool>,
    partitions: Vec<FakePartition>,
}

#[derive(Debug, Clone)]
struct FakeMount {
    device: PathBuf,
    mountpoint: PathBuf,
    fstype: String,
    options: Vec<String>,
}

#[derive(Debug, Default)]
struct FakeState {
    disks: Vec<FakeDisk>,
    mounts: Vec<FakeMount>,
    swaps: Vec<PathBuf>,
    kernel_filesystems: Vec<String>,
    kernel_modules: BTreeSet<String>,
    binaries: BTreeSet<String>,
    processes: BTreeMap<u32, FakeProcess>,
    exited: BTreeSet<u32>,
    signals: Vec<(u32, TermSignal)>,
    self_device: Option<String>,
    files: BTreeMap<PathBuf, String>,
    hidden: BTreeSet<PathBuf>,
    directories: BTreeSet<PathBuf>,
    privileged_scan: bool,
    lsblk_unavailable: bool,
    privileged_failure: Option<String>,
    failing_commands: BTreeMap<String, String>,
    suppress_effects: bool,
    operations: Vec<Operation>,
}

impl FakeState {
    fn partition(&self, name: &str) -> Option<&FakePartition> {
        self.disks
            .iter()
            .flat_map(|d| d.partitions.iter())
            .find(|p| p.name == name)
    }

    fn partition_mut(&mut self, name: &str) -> Option<&mut FakePartition> {
        self.disks
            .iter_mut()
            .flat_map(|d| d.partitions.iter_mut())
            .find(|p| p.name == name)
    }

    fn devnum_of(&self, device: &Path) -> Option<DevNum> {
        let name = device.file_name()?.to_str()?;
        self.partition(name).map(|p| p.devnum)
    }

    fn is_running(&self, pid: u32) -> bool {
        self.processes.contains_key(&pid) && !self.exited.contains(&pid)
    }

    fn refuse_privileged(&self, command: &str) -> Result<()> {
        match self.failing_commands.get(command).or(self.privileged_failure.as_ref()) {
            Some(stderr) => Err(Error::CommandExit {
                command: command.to_string(),
                code: 32,
                stderr: stderr.clone(),
            }),
            None => Ok(()),
        }
    }

    fn lsblk(&self) -> Value {
        let devices: Vec<Value> = self
            .disks
            .iter()
            .map(|disk| {
                let children: Vec<Value> = disk
                    .partitions
                    .iter()
                    .map(|p| {
                        json!({
                            "name": p.name,
                            "maj:min": p.devnum.to_string(),
                            "size": PARTITION_SIZE,
                            "type": "part",
                            "fstype": p.fstype,
                            "uuid": p.uuid,
                            "partuuid": null,
                            "label": p.label,
                        })
                    })
                    .collect();
                let tran = if disk.removable == Some(true) { "usb" } else { "sata" };
                json!({
                    "name": disk.name,
                    "maj:min": disk.devnum.to_string(),
                    "size": PARTITION_SIZE * (disk.partitions.len() as u64 + 1),
                    "type": "disk",
                    "fstype": null,
                    "rm": disk.removable,
                    "hotplug": disk.removable,
                    "tran": tran,
                    "model": "Fake Disk",
                    "children": children,
                })
            })
            .collect();
        json!({ "blockdevices": devices })
    }

    fn mountinfo(&self) -> String {
        let mut out = String::new();
        for (i, mount) in self.mounts.iter().enumerate() {
            let devnum = self
                .devnum_of(&mount.device)
                .unwrap_or(DevNum::new(0, 100 + i as u32));
            out.push_str(&format!(
                "{} 1 {} / {} {} - {} {} rw\n",
                20 + i,
                devnum,
                escape(&mount.mountpoint),
                mount.options.join(","),
                mount.fstype,
                escape(&mount.device),
            ));
        }
        out.push_str("90 1 0:5 / /proc rw,nosuid,nodev,noexec - proc proc rw\n");
        out
    }

    fn swaps(&self) -> String {
        let mut out = String::from("Filename\t\t\t\tType\t\tSize\t\tUsed\t\tPriority\n");
        for device in &self.swaps {
            out.push_str(&format!("{}\tpartition\t8388604\t\t0\t\t-2\n", escape(device)));
        }
        out
    }

    fn filesystems(&self) -> String {
        let mut out = String::from("nodev\tsysfs\nnodev\tproc\nnodev\ttmpfs\n");
        for fs in &self.kernel_filesystems {
            out.push_str(&format!("\t{}\n", fs));
        }
        out
    }

    fn partitions(&self) -> String {
        let mut out = String::from("major minor  #blocks  name\n\n");
        for disk in &self.disks {
            out.push_str(&format!(
                "{:>4} {:>7} {:>10} {}\n",
                disk.devnum.major, disk.devnum.minor, 0, disk.name
            ));
            for p in &disk.partitions {
                out.push_str(&format!(
                    "{:>4} {:>7} {:>10} {}\n",
                    p.devnum.major,
                    p.devnum.minor,
                    PARTITION_SIZE / 1024,
                    p.name
                ));
            }
        }
        out
    }
}

fn escape(path: &Path) -> String {
    path.to_string_lossy().replace(' ', "\\040")
}

/// Filesystem type the kernel reports for a mount made with `driver`.
fn reported_fstype(driver: &str) -> String {
    if driver == "ntfs-3g" || driver.contains("fuse") {
        "fuseblk".to_string()
    } else {
        driver.to_string()
    }
}

/// Simulated machine for driving the engine in tests.
#[derive(Debug)]
pub struct FakeHost {
    state: Mutex<FakeState>,
}

impl Default for FakeHost {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeHost {
    /// Creates a host with no devices and `ext4` and `vfat` built in.
    pub fn new() -> Self {
        let state = FakeState {
            kernel_filesystems: vec!["ext4".to_string(), "vfat".to_string()],
            ..FakeState::default()
        };
        Self {
            state: Mutex::new(state),
        }
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a disk. `removable` of None is reported as unknown.
    pub fn add_disk(&self, name: &str, removable: Option<bool>) {
        let mut state = self.state();
        let devnum = DevNum::new(8, 16 * state.disks.len() as u32);
        state.disks.push(FakeDisk {
            name: name.to_string(),
            devnum,
            removable,
            partitions: Vec::new(),
        });
    }

    /// Adds a partition to `disk`. Does nothing if the disk is unknown.
    pub fn add_partition(&self, disk: &str, name: &str, fstype: Option<&str>) {
        let mut state = self.state();
        let Some(disk) = state.disks.iter_mut().find(|d| d.name == disk) else {
            return;
        };
        let devnum = DevNum::new(8, disk.devnum.minor + disk.partitions.len() as u32 + 1);
        disk.partitions.push(FakePartition {
            name: name.to_string(),
            devnum,
            fstype: fstype.map(str::to_string),
            uuid: Some(format!("{:04X}-{:04X}", devnum.major, devnum.minor)),
            label: None,
        });
    }

    pub fn set_label(&self, partition: &str, label: &str) {
        if let Some(p) = self.state().partition_mut(partition) {
            p.label = Some(label.to_string());
        }
    }

    /// Adds a live mount without recording an operation.
    pub fn add_mount(&self, device: &str, mountpoint: &str, fstype: &str) {
        let mut state = self.state();
        state.directories.insert(PathBuf::from(mountpoint));
        state.mounts.push(FakeMount {
            device: PathBuf::from(device),
            mountpoint: PathBuf::from(mountpoint),
            fstype: fstype.to_string(),
            options: vec!["rw".to_string(), "relatime".to_string()],
        });
    }

    /// Marks a device as active swap without recording an operation.
    pub fn add_swap(&self, device: &str) {
        self.state().swaps.push(PathBuf::from(device));
    }

    pub fn set_kernel_filesystems(&self, filesystems: &[&str]) {
        self.state().kernel_filesystems = filesystems.iter().map(|s| s.to_string()).collect();
    }

    pub fn add_kernel_module(&self, fstype: &str) {
        self.state().kernel_modules.insert(fstype.to_string());
    }

    pub fn add_binary(&self, binary: &str) {
        self.state().binaries.insert(binary.to_string());
    }

    pub fn add_process(&self, process: FakeProcess) {
        let mut state = self.state();
        state.exited.remove(&process.pid);
        state.processes.insert(process.pid, process);
    }

    /// Places the running executable on `partition`.
    pub fn set_self_device(&self, partition: &str) {
        self.state().self_device = Some(partition.to_string());
    }

    /// Serves `content` for `path`, overriding any generated source.
    pub fn set_file(&self, path: impl Into<PathBuf>, content: impl Into<String>) {
        self.state().files.insert(path.into(), content.into());
    }

    /// Makes reads of `path` fail with NotFound.
    pub fn hide_file(&self, path: impl Into<PathBuf>) {
        self.state().hidden.insert(path.into());
    }

    /// Adds an existing directory.
    pub fn add_directory(&self, path: impl Into<PathBuf>) {
        self.state().directories.insert(path.into());
    }

    pub fn has_directory(&self, path: impl AsRef<Path>) -> bool {
        self.state().directories.contains(path.as_ref())
    }

    /// Enables a privileged filesystem-user scan that sees foreign processes.
    pub fn enable_privileged_scan(&self, enabled: bool) {
        self.state().privileged_scan = enabled;
    }

    pub fn set_lsblk_available(&self, available: bool) {
        self.state().lsblk_unavailable = !available;
    }

    /// Makes every privileged mutation fail with `stderr`, or succeed again with None.
    pub fn fail_privileged(&self, stderr: Option<&str>) {
        self.state().privileged_failure = stderr.map(str::to_string);
    }

    /// Makes one privileged command (`mount`, `umount`, `mkdir`, ...) fail with `stderr`.
    pub fn fail_command(&self, command: &str, stderr: &str) {
        self.state()
            .failing_commands
            .insert(command.to_string(), stderr.to_string());
    }

    /// When set, mount and swap commands report success without changing state.
    pub fn suppress_effects(&self, suppress: bool) {
        self.state().suppress_effects = suppress;
    }

    pub fn operations(&self) -> Vec<Operation> {
        self.state().operations.clone()
    }

    pub fn signals_sent(&self, pid: u32) -> Vec<TermSignal> {
        self.state()
            .signals
            .iter()
            .filter(|(p, _)| *p == pid)
            .map(|(_, s)| *s)
            .collect()
    }

    pub fn is_process_alive(&self, pid: u32) -> bool {
        self.state().is_running(pid)
    }

    pub fn is_mounted_at(&self, device: &str, mountpoint: &str) -> bool {
        self.state()
            .mounts
            .iter()
            .any(|m| m.device == Path::new(device) && m.mountpoint == Path::new(mountpoint))
    }
}

impl ProbeOps for FakeHost {
    fn lsblk_json(&self) -> Result<String> {
        let state = self.state();
        if state.lsblk_unavailable {
            return Err(Error::CommandExecution {
                command: "lsblk".to_string(),
                source: io::Error::from(io::ErrorKind::NotFound),
            });
        }
        Ok(state.lsblk().to_string())
    }

    fn read_file(&self, path: &Path) -> io::Result<String> {
        let state = self.state();
        if state.hidden.contains(path) {
            return Err(io::Error::from(io::ErrorKind::NotFound));
        }
        if let Some(content) = state.files.get(path) {
            return Ok(content.clone());
        }
        if path == Path::new(DEFAULT_MOUNTINFO_PATH) {
            Ok(state.mountinfo())
        } else if path == Path::new(DEFAULT_SWAPS_PATH) {
            Ok(state.swaps())
        } else if path == Path::new(DEFAULT_FILESYSTEMS_PATH) {
            Ok(state.filesystems())
        } else if path == Path::new(DEFAULT_PARTITIONS_PATH) {
            Ok(state.partitions())
        } else {
            Err(io::Error::from(io::ErrorKind::NotFound))
        }
    }

    fn binary_exists(&self, binary: &str, _search_path: &[PathBuf]) -> bool {
        self.state().binaries.contains(binary)
    }

    fn kernel_module_available(&self, fstype: &str) -> bool {
        self.state().kernel_modules.contains(fstype)
    }

    fn self_exe_devnum(&self) -> Option<DevNum> {
        let state = self.state();
        let name = state.self_device.as_deref()?;
        state.partition(name).map(|p| p.devnum)
    }
}

impl ProcessOps for FakeHost {
    fn list_pids(&self) -> Result<Vec<u32>> {
        let state = self.state();
        Ok(state
            .processes
            .keys()
            .copied()
            .filter(|pid| state.is_running(*pid))
            .collect())
    }

    fn process_name(&self, pid: u32) -> Option<String> {
        self.state().processes.get(&pid).map(|p| p.name.clone())
    }

    fn process_handles(&self, pid: u32) -> Result<Option<ProcessHandles>> {
        let state = self.state();
        if !state.is_running(pid) {
            return Ok(None);
        }
        match state.processes.get(&pid) {
            Some(p) if p.foreign => Err(Error::ProcRead {
                path: PathBuf::from(format!("/proc/{}/fd", pid)),
                source: io::Error::from(io::ErrorKind::PermissionDenied),
            }),
            Some(p) => Ok(Some(p.handles.clone())),
            None => Ok(None),
        }
    }

    fn filesystem_users(&self, target: &Path) -> Result<Option<Vec<FilesystemUser>>> {
        let state = self.state();
        if !state.privileged_scan {
            return Ok(None);
        }
        let users = state
            .processes
            .values()
            .filter(|p| state.is_running(p.pid))
            .flat_map(|p| {
                p.uses_of(target)
                    .into_iter()
                    .map(|handle| FilesystemUser { pid: p.pid, handle })
            })
            .collect();
        Ok(Some(users))
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.state().is_running(pid)
    }

    fn send_signal(&self, pid: u32, signal: TermSignal) -> Result<()> {
        let mut state = self.state();
        if !state.is_running(pid) {
            return Err(Error::Signal {
                pid,
                source: Errno::ESRCH,
            });
        }
        state.signals.push((pid, signal));
        state.operations.push(Operation::Signal { pid, signal });

        let dies = state.processes.get(&pid).is_some_and(|p| match signal {
            TermSignal::Graceful => !p.ignores_sigterm,
            TermSignal::Forceful => !p.uninterruptible,
        });
        if dies {
            state.exited.insert(pid);
        }
        Ok(())
    }

    fn current_pid(&self) -> u32 {
        FAKE_SELF_PID
    }
}

impl MountOps for FakeHost {
    fn create_mount_point(&self, path: &Path) -> Result<bool> {
        let mut state = self.state();
        state.operations.push(Operation::CreateMountPoint {
            path: path.to_path_buf(),
        });
        state.refuse_privileged("mkdir")?;
        Ok(state.directories.insert(path.to_path_buf()))
    }

    fn remove_mount_point(&self, path: &Path) -> Result<()> {
        let mut state = self.state();
        state.operations.push(Operation::RemoveMountPoint {
            path: path.to_path_buf(),
        });
        state.refuse_privileged("rmdir")?;
        if state.mounts.iter().any(|m| m.mountpoint == path) {
            return Err(Error::CommandExit {
                command: "rmdir".to_string(),
                code: 1,
                stderr: format!("failed to remove '{}': Device or resource busy", path.display()),
            });
        }
        state.directories.remove(path);
        Ok(())
    }

    fn mount(&self, device: &Path, target: &Path, fstype: &str, options: &[String]) -> Result<()> {
        let mut state = self.state();
        state.operations.push(Operation::Mount {
            device: device.to_path_buf(),
            target: target.to_path_buf(),
            driver: fstype.to_string(),
            options: options.to_vec(),
        });
        state.refuse_privileged("mount")?;

        if state.mounts.iter().any(|m| m.mountpoint == target) {
            return Err(Error::CommandExit {
                command: "mount".to_string(),
                code: 32,
                stderr: format!("{}: mount point busy", target.display()),
            });
        }
        if !state.suppress_effects {
            let mut mount_options = if options.iter().any(|o| o == "ro") {
                vec!["ro".to_string()]
            } else {
                vec!["rw".to_string()]
            };
            mount_options.push("relatime".to_string());
            state.mounts.push(FakeMount {
                device: device.to_path_buf(),
                mountpoint: target.to_path_buf(),
                fstype: reported_fstype(fstype),
                options: mount_options,
            });
        }
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        let mut state = self.state();
        state.operations.push(Operation::Unmount {
            target: target.to_path_buf(),
        });
        state.refuse_privileged("umount")?;

        let Some(index) = state.mounts.iter().position(|m| m.mountpoint == target) else {
            return Err(Error::CommandExit {
                command: "umount".to_string(),
                code: 32,
                stderr: format!("{}: not mounted.", target.display()),
            });
        };
        let busy = state
            .processes
            .values()
            .any(|p| state.is_running(p.pid) && p.references(target));
        if busy {
            return Err(Error::CommandExit {
                command: "umount".to_string(),
                code: 32,
                stderr: format!("{}: target is busy.", target.display()),
            });
        }
        if !state.suppress_effects {
            state.mounts.remove(index);
        }
        Ok(())
    }

    fn swap_on(&self, device: &Path) -> Result<()> {
        let mut state = self.state();
        state.operations.push(Operation::SwapOn {
            device: device.to_path_buf(),
        });
        state.refuse_privileged("swapon")?;
        if !state.suppress_effects && !state.swaps.iter().any(|s| s == device) {
            state.swaps.push(device.to_path_buf());
        }
        Ok(())
    }

    fn swap_off(&self, device: &Path) -> Result<()> {
        let mut state = self.state();
        state.operations.push(Operation::SwapOff {
            device: device.to_path_buf(),
        });
        state.refuse_privileged("swapoff")?;
        if !state.suppress_effects {
            state.swaps.retain(|s| s != device);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::disk::{PartitionId, list_devices};
    use crate::mounts::read_mount_table;

    fn host() -> FakeHost {
        let host = FakeHost::new();
        host.add_disk("sda", Some(false));
        host.add_partition("sda", "sda1", Some("vfat"));
        host.add_partition("sda", "sda2", Some("ext4"));
        host.add_disk("sdc", Some(true));
        host.add_partition("sdc", "sdc1", Some("ext4"));
        host.set_label("sdc1", "My Stick");
        host.add_mount("/dev/sda2", "/", "ext4");
        host
    }

    #[test]
    fn test_generated_sources_parse() {
        let host = host();
        let config = EngineConfig::default();
        let devices = list_devices(&host, &config).unwrap();

        assert_eq!(devices.partitions().count(), 3);
        let stick = devices.find_partition(&PartitionId::new("sdc1")).unwrap();
        assert_eq!(stick.label.as_deref(), Some("My Stick"));
        assert_eq!(devices.disk_of(stick).unwrap().removable, Some(true));

        let table = read_mount_table(&host, &config, &devices).unwrap();
        assert_eq!(table.root_partition(), Some(&PartitionId::new("sda2")));
    }

    #[test]
    fn test_mount_round_trip_through_mountinfo() {
        let host = host();
        let config = EngineConfig::default();
        host.mount(
            Path::new("/dev/sdc1"),
            Path::new("/mnt/my stick"),
            "ext4",
            &["ro".to_string()],
        )
        .unwrap();

        let devices = list_devices(&host, &config).unwrap();
        let table = read_mount_table(&host, &config, &devices).unwrap();
        let record = table.mount_state_of(&PartitionId::new("sdc1")).unwrap();
        assert_eq!(record.mountpoint, PathBuf::from("/mnt/my stick"));
        assert!(record.read_only);
    }

    #[test]
    fn test_unmount_refused_while_busy() {
        let host = host();
        host.add_mount("/dev/sdc1", "/mnt/usb", "ext4");
        host.add_process(FakeProcess::new(77, "shell").cwd("/mnt/usb/docs"));

        let err = host.unmount(Path::new("/mnt/usb")).unwrap_err();
        assert!(err.to_string().contains("exited with code 32"));

        host.send_signal(77, TermSignal::Graceful).unwrap();
        host.unmount(Path::new("/mnt/usb")).unwrap();
        assert!(!host.is_mounted_at("/dev/sdc1", "/mnt/usb"));
        assert_eq!(
            host.operations().last(),
            Some(&Operation::Unmount {
                target: PathBuf::from("/mnt/usb")
            })
        );
    }

    #[test]
    fn test_foreign_process_needs_privileged_scan() {
        let host = host();
        host.add_process(FakeProcess::new(90, "daemon").cwd("/mnt/usb").foreign());

        assert!(host.process_handles(90).is_err());
        assert!(host.process_handles(91).unwrap().is_none());
        assert!(host.filesystem_users(Path::new("/mnt/usb")).unwrap().is_none());

        host.enable_privileged_scan(true);
        assert_eq!(
            host.filesystem_users(Path::new("/mnt/usb")).unwrap(),
            Some(vec![FilesystemUser {
                pid: 90,
                handle: HandleKind::WorkingDirectory
            }])
        );
    }

    #[test]
    fn test_mount_point_bookkeeping() {
        let host = host();
        host.fail_command("mount", "wrong fs type");

        assert!(host.create_mount_point(Path::new("/mnt/new")).unwrap());
        assert!(!host.create_mount_point(Path::new("/mnt/new")).unwrap());
        assert!(host.mount(Path::new("/dev/sdc1"), Path::new("/mnt/new"), "ext4", &[]).is_err());
        host.remove_mount_point(Path::new("/mnt/new")).unwrap();
        assert!(!host.has_directory("/mnt/new"));
    }

    #[test]
    fn test_signal_dead_process_is_esrch() {
        let host = FakeHost::new();
        let err = host.send_signal(9999, TermSignal::Forceful).unwrap_err();
        assert!(err.is_no_such_process());
    }

    #[test]
    fn test_suppressed_effects_leave_state() {
        let host = host();
        host.suppress_effects(true);
        host.swap_on(Path::new("/dev/sda1")).unwrap();
        assert!(host.read_file(Path::new(DEFAULT_SWAPS_PATH)).unwrap().lines().count() == 1);
        assert_eq!(host.operations().len(), 1);
    }
}
