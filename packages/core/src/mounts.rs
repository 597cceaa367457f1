//! Mount state reading and reconciliation.
//!
//! The live mount table (`/proc/self/mountinfo`) is authoritative. The
//! persisted configuration (`/etc/fstab`) is read when available and compared
//! against it; disagreements are reported as [`Discrepancy`] warnings. Active
//! swap areas come from `/proc/swaps`.
//!
//! A [`MountTable`] is a snapshot: it is rebuilt from scratch on every read and
//! never updated in place.

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::disk::{DevNum, DeviceSnapshot, Partition, PartitionId};
use crate::error::{IoResultExt, Result};
use crate::fstab::{self, FstabEntry, unescape_fstab_path};
use crate::host::ProbeOps;

/// A partition currently mounted, as reported by the kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountRecord {
    pub partition: PartitionId,
    pub mountpoint: PathBuf,
    pub fstype: String,
    pub options: Vec<String>,
    pub read_only: bool,
}

/// An active swap area.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SwapArea {
    pub path: PathBuf,
    /// "partition" or "file".
    pub kind: String,
    pub size_kib: Option<u64>,
    pub used_kib: Option<u64>,
    pub priority: Option<i32>,
}

/// Disagreement between the live mount table and fstab.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Discrepancy {
    /// fstab places the partition elsewhere than where it is mounted.
    MountpointMismatch {
        partition: PartitionId,
        configured: PathBuf,
        live: PathBuf,
    },
    /// An auto-mount fstab entry whose partition is not mounted.
    NotMounted {
        partition: PartitionId,
        configured: PathBuf,
    },
    /// An fstab device spec matching no present partition.
    UnresolvedSpec { spec: String, configured: PathBuf },
    /// The partition is mounted more than once; only one record is kept.
    DuplicateMount {
        partition: PartitionId,
        kept: PathBuf,
        ignored: PathBuf,
    },
}

impl fmt::Display for Discrepancy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MountpointMismatch {
                partition,
                configured,
                live,
            } => write!(
                f,
                "{} is mounted at {} but fstab says {}",
                partition,
                live.display(),
                configured.display()
            ),
            Self::NotMounted {
                partition,
                configured,
            } => write!(
                f,
                "{} is configured at {} but not mounted",
                partition,
                configured.display()
            ),
            Self::UnresolvedSpec { spec, configured } => write!(
                f,
                "fstab entry {} for {} matches no present device",
                spec,
                configured.display()
            ),
            Self::DuplicateMount {
                partition,
                kept,
                ignored,
            } => write!(
                f,
                "{} is also mounted at {} (reporting {})",
                partition,
                ignored.display(),
                kept.display()
            ),
        }
    }
}

/// Snapshot of the kernel mount and swap state for known partitions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MountTable {
    records: Vec<MountRecord>,
    swaps: Vec<SwapArea>,
    warnings: Vec<Discrepancy>,
}

impl MountTable {
    /// All mounted partitions, at most one record each.
    pub fn current_mounts(&self) -> &[MountRecord] {
        &self.records
    }

    pub fn mount_state_of(&self, partition: &PartitionId) -> Option<&MountRecord> {
        self.records.iter().find(|r| &r.partition == partition)
    }

    /// Every place `partition` is mounted, deepest first.
    ///
    /// Includes the mountpoints dropped from [`Self::current_mounts`] as
    /// duplicates, so all of them can be released together.
    pub fn mountpoints_of(&self, partition: &PartitionId) -> Vec<PathBuf> {
        let mut mountpoints: Vec<PathBuf> = self
            .mount_state_of(partition)
            .map(|r| r.mountpoint.clone())
            .into_iter()
            .collect();
        for warning in &self.warnings {
            if let Discrepancy::DuplicateMount {
                partition: duplicate,
                ignored,
                ..
            } = warning
                && duplicate == partition
                && !mountpoints.contains(ignored)
            {
                mountpoints.push(ignored.clone());
            }
        }
        mountpoints.sort_by_key(|m| std::cmp::Reverse(m.components().count()));
        mountpoints
    }

    pub fn by_mountpoint(&self, mountpoint: &Path) -> Option<&MountRecord> {
        self.records.iter().find(|r| r.mountpoint == mountpoint)
    }

    /// The partition mounted at `/`.
    pub fn root_partition(&self) -> Option<&PartitionId> {
        self.by_mountpoint(Path::new("/")).map(|r| &r.partition)
    }

    pub fn swaps(&self) -> &[SwapArea] {
        &self.swaps
    }

    pub fn is_swap_active(&self, partition: &PartitionId) -> bool {
        self.swaps.iter().any(|s| s.path == partition.path())
    }

    pub fn warnings(&self) -> &[Discrepancy] {
        &self.warnings
    }
}

/// One parsed line of mountinfo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfoEntry {
    pub devnum: Option<DevNum>,
    /// Root of the mount within its filesystem; not "/" for bind mounts.
    pub root: String,
    pub mountpoint: PathBuf,
    pub options: Vec<String>,
    pub fstype: String,
    pub source: String,
}

/// Parses `/proc/self/mountinfo`.
///
/// Format: `id parent maj:min root mountpoint options [optional...] - fstype source superopts`
pub fn parse_mountinfo(content: &str) -> Vec<MountInfoEntry> {
    content
        .lines()
        .filter_map(|line| {
            let (pre, post) = line.split_once(" - ")?;
            let pre_fields: Vec<&str> = pre.split_whitespace().collect();
            if pre_fields.len() < 6 {
                debug!(line, "skipping short mountinfo line");
                return None;
            }
            let mut post_fields = post.split_whitespace();
            let fstype = post_fields.next()?.to_string();
            let source = unescape_fstab_path(post_fields.next().unwrap_or("none"));

            Some(MountInfoEntry {
                devnum: DevNum::parse(pre_fields[2]),
                root: unescape_fstab_path(pre_fields[3]),
                mountpoint: PathBuf::from(unescape_fstab_path(pre_fields[4])),
                options: pre_fields[5].split(',').map(str::to_string).collect(),
                fstype,
                source,
            })
        })
        .collect()
}

/// Parses `/proc/swaps`.
pub fn parse_swaps(content: &str) -> Vec<SwapArea> {
    content
        .lines()
        .skip_while(|line| line.starts_with("Filename"))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 2 {
                return None;
            }
            Some(SwapArea {
                path: PathBuf::from(unescape_fstab_path(fields[0])),
                kind: fields[1].to_string(),
                size_kib: fields.get(2).and_then(|v| v.parse().ok()),
                used_kib: fields.get(3).and_then(|v| v.parse().ok()),
                priority: fields.get(4).and_then(|v| v.parse().ok()),
            })
        })
        .collect()
}

/// Maps a mountinfo entry to a known partition.
///
/// Device numbers are preferred; btrfs and similar report anonymous device
/// numbers, so the source path is the fallback.
fn partition_for<'s>(entry: &MountInfoEntry, devices: &'s DeviceSnapshot) -> Option<&'s Partition> {
    if let Some(devnum) = entry.devnum
        && let Some(partition) = devices.find_by_devnum(devnum)
    {
        return Some(partition);
    }
    if !entry.source.starts_with('/') {
        return None;
    }
    let probe = FstabEntry {
        fs_spec: entry.source.clone(),
        mount_point: entry.mountpoint.clone(),
        vfs_type: entry.fstype.clone(),
        mount_options: Vec::new(),
        dump: 0,
        fsck_order: 0,
    };
    probe.resolve(devices)
}

/// Builds mount records from mountinfo entries, keeping one per partition.
pub fn build_records(
    entries: &[MountInfoEntry],
    devices: &DeviceSnapshot,
) -> (Vec<MountRecord>, Vec<Discrepancy>) {
    let mut records: Vec<(MountRecord, bool)> = Vec::new();
    let mut warnings = Vec::new();

    for entry in entries {
        let Some(partition) = partition_for(entry, devices) else {
            continue;
        };
        let is_bind = entry.root != "/";
        let record = MountRecord {
            partition: partition.id(),
            mountpoint: entry.mountpoint.clone(),
            fstype: entry.fstype.clone(),
            read_only: entry.options.iter().any(|o| o == "ro"),
            options: entry.options.clone(),
        };

        match records.iter_mut().find(|(r, _)| r.partition == record.partition) {
            None => records.push((record, is_bind)),
            Some((existing, existing_is_bind)) => {
                // Prefer the mount of the filesystem root over bind mounts.
                if *existing_is_bind && !is_bind {
                    warnings.push(Discrepancy::DuplicateMount {
                        partition: record.partition.clone(),
                        kept: record.mountpoint.clone(),
                        ignored: existing.mountpoint.clone(),
                    });
                    *existing = record;
                    *existing_is_bind = false;
                } else {
                    warnings.push(Discrepancy::DuplicateMount {
                        partition: record.partition,
                        kept: existing.mountpoint.clone(),
                        ignored: record.mountpoint,
                    });
                }
            }
        }
    }

    (records.into_iter().map(|(r, _)| r).collect(), warnings)
}

/// Compares fstab against the live records.
pub fn reconcile(
    records: &[MountRecord],
    fstab_entries: &[FstabEntry],
    devices: &DeviceSnapshot,
) -> Vec<Discrepancy> {
    let mut warnings = Vec::new();

    for entry in fstab_entries {
        if entry.is_swap() || !entry.names_block_device() {
            continue;
        }
        let Some(partition) = entry.resolve(devices) else {
            if !entry.is_nofail() {
                warnings.push(Discrepancy::UnresolvedSpec {
                    spec: entry.fs_spec.clone(),
                    configured: entry.mount_point.clone(),
                });
            }
            continue;
        };
        let id = partition.id();
        match records.iter().find(|r| r.partition == id) {
            Some(live) if live.mountpoint != entry.mount_point => {
                warnings.push(Discrepancy::MountpointMismatch {
                    partition: id,
                    configured: entry.mount_point.clone(),
                    live: live.mountpoint.clone(),
                });
            }
            None if entry.is_auto() => {
                warnings.push(Discrepancy::NotMounted {
                    partition: id,
                    configured: entry.mount_point.clone(),
                });
            }
            _ => {}
        }
    }

    warnings
}

/// Reads the live mount table, swap table and fstab into a fresh snapshot.
///
/// Fails only if the live mount table cannot be read. A missing fstab is
/// ignored; a missing swap table means no swap support in the kernel.
pub fn read_mount_table<P: ProbeOps + ?Sized>(
    probe: &P,
    config: &EngineConfig,
    devices: &DeviceSnapshot,
) -> Result<MountTable> {
    let mountinfo = probe
        .read_file(&config.mountinfo_path)
        .mount_table_context(&config.mountinfo_path)?;
    let (records, mut warnings) = build_records(&parse_mountinfo(&mountinfo), devices);

    let swaps = match probe.read_file(&config.swaps_path) {
        Ok(content) => parse_swaps(&content),
        Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e).mount_table_context(&config.swaps_path),
    };

    match probe.read_file(&config.fstab_path) {
        Ok(content) => {
            warnings.extend(reconcile(&records, &fstab::parse_fstab(&content), devices));
        }
        Err(e) => {
            debug!(path = %config.fstab_path.display(), error = %e, "fstab unavailable, skipping reconciliation");
        }
    }

    for warning in &warnings {
        warn!(%warning, "mount state discrepancy");
    }

    Ok(MountTable {
        records,
        swaps,
        warnings,
    })
}
