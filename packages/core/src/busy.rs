//! Busy holder detection and termination.
//!
//! Finds processes keeping a device or mountpoint busy (open files, working
//! or root directory, executable image, memory maps) and terminates them on
//! request: SIGTERM first, SIGKILL for whatever survives a bounded grace
//! period. Holder lists are computed on demand and never cached; callers must
//! look again after terminating.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::host::{ProcessHandles, ProcessOps, TermSignal};

/// Kernel init; never terminated.
pub const INIT_PID: u32 = 1;

/// What a busy holder is looking at.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "path", rename_all = "snake_case")]
pub enum BusyTarget {
    Device(PathBuf),
    Mountpoint(PathBuf),
}

impl BusyTarget {
    fn covers(&self, path: &Path) -> bool {
        match self {
            Self::Device(device) => path == device,
            Self::Mountpoint(mountpoint) => path.starts_with(mountpoint),
        }
    }
}

/// Kind of reference a process holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleKind {
    OpenFile,
    WorkingDirectory,
    RootDirectory,
    Executable,
    MemoryMap,
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::OpenFile => "open file",
            Self::WorkingDirectory => "working directory",
            Self::RootDirectory => "root directory",
            Self::Executable => "executable",
            Self::MemoryMap => "memory map",
        };
        f.write_str(name)
    }
}

/// A process holding a target busy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BusyHolder {
    pub pid: u32,
    pub name: String,
    pub handle: HandleKind,
    /// First offending path for this handle kind.
    pub path: PathBuf,
}

/// Result of terminating one holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum TerminationOutcome {
    /// Exited within the grace period after SIGTERM.
    Terminated,
    /// Needed SIGKILL.
    Killed,
    /// Gone before it could be signalled.
    AlreadyExited,
    /// The calling process or init; never signalled.
    Protected,
    Failed(String),
}

/// Timing for graceful then forceful termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalEscalation {
    pub grace: Duration,
    pub poll: Duration,
}

impl SignalEscalation {
    pub fn new(grace: Duration, poll: Duration) -> Self {
        Self { grace, poll }
    }
}

/// Returns true for processes that must never be terminated.
pub fn is_protected(pid: u32, self_pid: u32) -> bool {
    pid == INIT_PID || pid == self_pid
}

/// Strips the " (deleted)" suffix the kernel appends to unlinked files.
fn clean_link(path: &Path) -> PathBuf {
    match path.to_str().and_then(|s| s.strip_suffix(" (deleted)")) {
        Some(stripped) => PathBuf::from(stripped),
        None => path.to_path_buf(),
    }
}

fn holders_of(pid: u32, name: &str, handles: &ProcessHandles, targets: &[BusyTarget]) -> Vec<BusyHolder> {
    let singles = [
        (HandleKind::WorkingDirectory, handles.cwd.as_ref()),
        (HandleKind::RootDirectory, handles.root.as_ref()),
        (HandleKind::Executable, handles.exe.as_ref()),
    ];
    let lists = [
        (HandleKind::OpenFile, &handles.open_files),
        (HandleKind::MemoryMap, &handles.mapped_files),
    ];

    let hit = |path: &Path| {
        let path = clean_link(path);
        targets.iter().any(|t| t.covers(&path)).then_some(path)
    };

    let mut found = Vec::new();
    for (handle, path) in singles {
        if let Some(path) = path.and_then(|p| hit(p)) {
            found.push(BusyHolder {
                pid,
                name: name.to_string(),
                handle,
                path,
            });
        }
    }
    for (handle, paths) in lists {
        if let Some(path) = paths.iter().find_map(|p| hit(p)) {
            found.push(BusyHolder {
                pid,
                name: name.to_string(),
                handle,
                path,
            });
        }
    }
    found
}

/// Outcome of scanning processes for busy holders.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HolderScan {
    pub holders: Vec<BusyHolder>,
    /// Pids that exist but whose handles could not be read, and that no
    /// privileged scan accounted for.
    pub uninspected: Vec<u32>,
}

impl HolderScan {
    pub fn is_complete(&self) -> bool {
        self.uninspected.is_empty()
    }
}

/// Lists processes holding any of `targets` busy, one entry per (pid, handle kind).
///
/// Processes that vanish mid-scan are skipped. Processes that cannot be
/// inspected are looked up with a privileged scan of each mountpoint target
/// when the host offers one, and reported in
/// [`HolderScan::uninspected`] otherwise.
pub fn scan_holders<P: ProcessOps + ?Sized>(process: &P, targets: &[BusyTarget]) -> Result<HolderScan> {
    let mut holders = Vec::new();
    let mut uninspected = Vec::new();
    for pid in process.list_pids()? {
        let handles = match process.process_handles(pid) {
            Ok(Some(handles)) => handles,
            Ok(None) => continue,
            Err(e) => {
                debug!(pid, error = %e, "cannot inspect process");
                uninspected.push(pid);
                continue;
            }
        };
        let name = process.process_name(pid).unwrap_or_else(|| format!("pid {}", pid));
        holders.extend(holders_of(pid, &name, &handles, targets));
    }

    if !uninspected.is_empty() {
        resolve_uninspected(process, targets, &mut holders, &mut uninspected);
    }
    debug!(?targets, count = holders.len(), uninspected = uninspected.len(), "busy holder scan");
    Ok(HolderScan { holders, uninspected })
}

/// Fills in holders among `uninspected` pids from a privileged scan.
fn resolve_uninspected<P: ProcessOps + ?Sized>(
    process: &P,
    targets: &[BusyTarget],
    holders: &mut Vec<BusyHolder>,
    uninspected: &mut Vec<u32>,
) {
    let mountpoints: Vec<&Path> = targets
        .iter()
        .filter_map(|t| match t {
            BusyTarget::Mountpoint(path) => Some(path.as_path()),
            BusyTarget::Device(_) => None,
        })
        .collect();
    if mountpoints.is_empty() {
        return;
    }

    let mut found = Vec::new();
    for mountpoint in mountpoints {
        match process.filesystem_users(mountpoint) {
            Ok(Some(users)) => found.extend(users.into_iter().map(|u| (u, mountpoint))),
            Ok(None) => {
                warn!(count = uninspected.len(), "cannot inspect processes without privileges");
                return;
            }
            Err(e) => {
                warn!(mountpoint = %mountpoint.display(), error = %e, "privileged busy scan failed");
                return;
            }
        }
    }

    for (user, mountpoint) in found {
        if !uninspected.contains(&user.pid) {
            continue;
        }
        if holders.iter().any(|h| h.pid == user.pid && h.handle == user.handle) {
            continue;
        }
        let name = process
            .process_name(user.pid)
            .unwrap_or_else(|| format!("pid {}", user.pid));
        holders.push(BusyHolder {
            pid: user.pid,
            name,
            handle: user.handle,
            path: mountpoint.to_path_buf(),
        });
    }
    uninspected.clear();
}

/// Lists processes holding any of `targets` busy, one entry per (pid, handle kind).
///
/// See [`scan_holders`] for processes that cannot be inspected.
pub fn find_holders<P: ProcessOps + ?Sized>(process: &P, targets: &[BusyTarget]) -> Result<Vec<BusyHolder>> {
    Ok(scan_holders(process, targets)?.holders)
}

fn wait_for_exit<P: ProcessOps + ?Sized>(process: &P, pids: &[u32], escalation: SignalEscalation) {
    let deadline = Instant::now() + escalation.grace;
    while pids.iter().any(|&pid| process.is_alive(pid)) {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        std::thread::sleep(escalation.poll.min(deadline - now));
    }
}

/// Terminates the processes behind `holders`.
///
/// Sends SIGTERM, waits up to the grace period, then SIGKILLs survivors and
/// waits once more for them. The calling process and init are never
/// signalled and are reported as [`TerminationOutcome::Protected`].
pub fn terminate<P: ProcessOps + ?Sized>(
    process: &P,
    holders: &[BusyHolder],
    escalation: SignalEscalation,
) -> Vec<(u32, TerminationOutcome)> {
    let self_pid = process.current_pid();
    let mut pids: Vec<u32> = Vec::new();
    for holder in holders {
        if !pids.contains(&holder.pid) {
            pids.push(holder.pid);
        }
    }

    let mut outcomes: Vec<(u32, Option<TerminationOutcome>)> = Vec::new();
    let mut signalled = Vec::new();
    for pid in pids {
        if is_protected(pid, self_pid) {
            warn!(pid, "refusing to terminate protected process");
            outcomes.push((pid, Some(TerminationOutcome::Protected)));
            continue;
        }
        match process.send_signal(pid, TermSignal::Graceful) {
            Ok(()) => {
                info!(pid, "sent SIGTERM to busy holder");
                signalled.push(pid);
                outcomes.push((pid, None));
            }
            Err(e) if e.is_no_such_process() => {
                outcomes.push((pid, Some(TerminationOutcome::AlreadyExited)));
            }
            Err(e) => {
                warn!(pid, error = %e, "SIGTERM failed");
                outcomes.push((pid, Some(TerminationOutcome::Failed(e.to_string()))));
            }
        }
    }

    if signalled.is_empty() {
        return finalize(outcomes);
    }

    wait_for_exit(process, &signalled, escalation);

    let mut killed = Vec::new();
    for (pid, outcome) in outcomes.iter_mut() {
        if outcome.is_some() {
            continue;
        }
        if !process.is_alive(*pid) {
            *outcome = Some(TerminationOutcome::Terminated);
            continue;
        }
        match process.send_signal(*pid, TermSignal::Forceful) {
            Ok(()) => {
                warn!(pid = *pid, "holder ignored SIGTERM, sent SIGKILL");
                killed.push(*pid);
            }
            Err(e) if e.is_no_such_process() => {
                *outcome = Some(TerminationOutcome::Terminated);
            }
            Err(e) => {
                *outcome = Some(TerminationOutcome::Failed(e.to_string()));
            }
        }
    }

    if !killed.is_empty() {
        wait_for_exit(process, &killed, escalation);
        for (pid, outcome) in outcomes.iter_mut() {
            if outcome.is_none() {
                *outcome = Some(if process.is_alive(*pid) {
                    TerminationOutcome::Failed("still running after SIGKILL".to_string())
                } else {
                    TerminationOutcome::Killed
                });
            }
        }
    }

    finalize(outcomes)
}

fn finalize(outcomes: Vec<(u32, Option<TerminationOutcome>)>) -> Vec<(u32, TerminationOutcome)> {
    outcomes
        .into_iter()
        .map(|(pid, outcome)| {
            (
                pid,
                outcome.unwrap_or_else(|| TerminationOutcome::Failed("not signalled".to_string())),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{FakeHost, FakeProcess};

    fn escalation() -> SignalEscalation {
        SignalEscalation::new(Duration::from_millis(50), Duration::from_millis(5))
    }

    fn usb_targets() -> Vec<BusyTarget> {
        vec![
            BusyTarget::Device(PathBuf::from("/dev/sdc1")),
            BusyTarget::Mountpoint(PathBuf::from("/mnt/usb")),
        ]
    }

    #[test]
    fn test_find_holders_by_handle_kind() {
        let host = FakeHost::new();
        host.add_process(FakeProcess::new(100, "vim").open_file("/mnt/usb/notes.txt"));
        host.add_process(FakeProcess::new(101, "bash").cwd("/mnt/usb/photos"));
        host.add_process(FakeProcess::new(102, "player").exe("/mnt/usb/bin/player").mapped("/mnt/usb/lib/libx.so"));
        host.add_process(FakeProcess::new(103, "dd").open_file("/dev/sdc1"));
        host.add_process(FakeProcess::new(104, "sshd").cwd("/").open_file("/var/log/auth.log"));
        host.add_process(FakeProcess::new(105, "trickster").open_file("/mnt/usbstick/file"));

        let holders = find_holders(&host, &usb_targets()).unwrap();
        let summary: Vec<(u32, HandleKind)> = holders.iter().map(|h| (h.pid, h.handle)).collect();
        assert_eq!(
            summary,
            vec![
                (100, HandleKind::OpenFile),
                (101, HandleKind::WorkingDirectory),
                (102, HandleKind::Executable),
                (102, HandleKind::MemoryMap),
                (103, HandleKind::OpenFile),
            ]
        );
        assert_eq!(holders[0].name, "vim");
    }

    #[test]
    fn test_deleted_files_still_count() {
        let host = FakeHost::new();
        host.add_process(FakeProcess::new(200, "logger").open_file("/mnt/usb/log.txt (deleted)"));

        let holders = find_holders(&host, &usb_targets()).unwrap();
        assert_eq!(holders.len(), 1);
        assert_eq!(holders[0].path, PathBuf::from("/mnt/usb/log.txt"));
    }

    #[test]
    fn test_foreign_process_is_reported_uninspected() {
        let host = FakeHost::new();
        host.add_process(FakeProcess::new(500, "daemon").cwd("/mnt/usb").foreign());
        host.add_process(FakeProcess::new(501, "cron").cwd("/").foreign());

        let scan = scan_holders(&host, &usb_targets()).unwrap();
        assert!(scan.holders.is_empty());
        assert_eq!(scan.uninspected, vec![500, 501]);
        assert!(!scan.is_complete());
    }

    #[test]
    fn test_privileged_scan_finds_foreign_holders() {
        let host = FakeHost::new();
        host.enable_privileged_scan(true);
        host.add_process(FakeProcess::new(100, "vim").open_file("/mnt/usb/notes.txt"));
        host.add_process(FakeProcess::new(500, "daemon").cwd("/mnt/usb/data").foreign());
        host.add_process(FakeProcess::new(501, "cron").cwd("/").foreign());

        let scan = scan_holders(&host, &usb_targets()).unwrap();
        assert!(scan.is_complete());
        let summary: Vec<(u32, HandleKind)> = scan.holders.iter().map(|h| (h.pid, h.handle)).collect();
        assert_eq!(
            summary,
            vec![(100, HandleKind::OpenFile), (500, HandleKind::WorkingDirectory)]
        );
        assert_eq!(scan.holders[1].name, "daemon");
        assert_eq!(scan.holders[1].path, PathBuf::from("/mnt/usb"));
    }

    #[test]
    fn test_terminate_graceful() {
        let host = FakeHost::new();
        host.add_process(FakeProcess::new(300, "vim").open_file("/mnt/usb/a"));

        let holders = find_holders(&host, &usb_targets()).unwrap();
        let outcomes = terminate(&host, &holders, escalation());
        assert_eq!(outcomes, vec![(300, TerminationOutcome::Terminated)]);
        assert!(!host.is_process_alive(300));
    }

    #[test]
    fn test_terminate_escalates_to_sigkill() {
        let host = FakeHost::new();
        host.add_process(FakeProcess::new(301, "stubborn").cwd("/mnt/usb").ignore_sigterm());

        let holders = find_holders(&host, &usb_targets()).unwrap();
        let outcomes = terminate(&host, &holders, escalation());
        assert_eq!(outcomes, vec![(301, TerminationOutcome::Killed)]);
        assert_eq!(host.signals_sent(301), vec![TermSignal::Graceful, TermSignal::Forceful]);
    }

    #[test]
    fn test_terminate_never_signals_protected() {
        let host = FakeHost::new();
        let self_pid = host.current_pid();
        let holders = vec![
            BusyHolder {
                pid: INIT_PID,
                name: "init".to_string(),
                handle: HandleKind::OpenFile,
                path: PathBuf::from("/mnt/usb/x"),
            },
            BusyHolder {
                pid: self_pid,
                name: "partmgr".to_string(),
                handle: HandleKind::WorkingDirectory,
                path: PathBuf::from("/mnt/usb"),
            },
        ];

        let outcomes = terminate(&host, &holders, escalation());
        assert_eq!(
            outcomes,
            vec![
                (INIT_PID, TerminationOutcome::Protected),
                (self_pid, TerminationOutcome::Protected),
            ]
        );
        assert!(host.signals_sent(INIT_PID).is_empty());
    }

    #[test]
    fn test_terminate_dedupes_pids_and_handles_vanished() {
        let host = FakeHost::new();
        host.add_process(FakeProcess::new(400, "player").exe("/mnt/usb/p").mapped("/mnt/usb/l.so"));
        let mut holders = find_holders(&host, &usb_targets()).unwrap();
        holders.push(BusyHolder {
            pid: 401,
            name: "ghost".to_string(),
            handle: HandleKind::OpenFile,
            path: PathBuf::from("/mnt/usb/g"),
        });

        let outcomes = terminate(&host, &holders, escalation());
        assert_eq!(
            outcomes,
            vec![
                (400, TerminationOutcome::Terminated),
                (401, TerminationOutcome::AlreadyExited),
            ]
        );
        assert_eq!(host.signals_sent(400), vec![TermSignal::Graceful]);
    }
}
