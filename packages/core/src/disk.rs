//! Block device enumeration.
//!
//! Scans block devices with `lsblk` and builds an immutable [`DeviceSnapshot`]
//! of disks and their partitions. The parser is tolerant: a device with
//! missing or malformed attributes is kept, with the attribute left unknown,
//! rather than failing the scan. When lsblk itself is unusable the kernel's
//! `/proc/partitions` list is used instead, with filesystem metadata unknown.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::host::ProbeOps;

/// Columns requested from lsblk.
pub const LSBLK_COLUMNS: &str = "NAME,MAJ:MIN,SIZE,TYPE,FSTYPE,UUID,PARTUUID,LABEL,RM,HOTPLUG,TRAN,MODEL";

/// Filesystem label used when the type could not be determined.
pub const UNKNOWN_FSTYPE: &str = "unknown";

/// Kernel device number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DevNum {
    pub major: u32,
    pub minor: u32,
}

impl DevNum {
    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Parses the `MAJ:MIN` notation used by lsblk and mountinfo.
    pub fn parse(raw: &str) -> Option<Self> {
        let (major, minor) = raw.trim().split_once(':')?;
        Some(Self {
            major: major.trim().parse().ok()?,
            minor: minor.trim().parse().ok()?,
        })
    }
}

impl fmt::Display for DevNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

/// Identifies a partition by its device node.
///
/// Accepts either a kernel name (`sdb1`) or a path (`/dev/sdb1`); both
/// normalize to the path form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(PathBuf);

impl PartitionId {
    pub fn new(id: impl AsRef<str>) -> Self {
        let id = id.as_ref().trim();
        if id.starts_with('/') {
            Self(PathBuf::from(id))
        } else {
            Self(Path::new("/dev").join(id))
        }
    }

    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }

    /// Kernel device name (last path component).
    pub fn name(&self) -> &str {
        self.0.file_name().and_then(|n| n.to_str()).unwrap_or("")
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl From<&str> for PartitionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Kind of a top-level block device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Disk,
    Partition,
    Loop,
    Other,
}

impl DeviceKind {
    fn from_lsblk(device_type: Option<&str>) -> Self {
        match device_type {
            Some("disk") => Self::Disk,
            Some("part") => Self::Partition,
            Some("loop") => Self::Loop,
            _ => Self::Other,
        }
    }
}

/// A partition (or a whole device carrying a filesystem directly).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Partition {
    /// Kernel name (e.g. "sda1").
    pub name: String,
    /// Device node (e.g. "/dev/sda1").
    pub path: PathBuf,
    pub devnum: Option<DevNum>,
    /// Size in bytes.
    pub size: Option<u64>,
    /// Filesystem type (e.g. "ext4", "ntfs", "swap").
    pub fstype: Option<String>,
    pub uuid: Option<String>,
    pub partuuid: Option<String>,
    pub label: Option<String>,
    /// Name of the owning block device.
    pub parent: String,
    /// Attributes the scan could not determine.
    pub unknown: Vec<&'static str>,
}

impl Partition {
    pub fn id(&self) -> PartitionId {
        PartitionId::from_path(self.path.clone())
    }

    /// Filesystem type, or "unknown".
    pub fn fstype_label(&self) -> &str {
        self.fstype.as_deref().unwrap_or(UNKNOWN_FSTYPE)
    }

    pub fn is_swap(&self) -> bool {
        self.fstype.as_deref() == Some("swap")
    }

    pub fn matches(&self, id: &PartitionId) -> bool {
        self.path == id.path() || self.name == id.name()
    }

    /// Returns a mount directory name based on label, UUID or device name.
    pub fn suggested_mount_name(&self) -> String {
        if let Some(label) = self.label.as_ref().filter(|l| !l.trim().is_empty()) {
            return sanitize_mount_name(label);
        }
        if let Some(uuid) = &self.uuid {
            return uuid.chars().take(8).collect();
        }
        self.name.clone()
    }
}

/// A top-level block device and the partitions it owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockDevice {
    pub name: String,
    pub path: PathBuf,
    pub devnum: Option<DevNum>,
    pub size: Option<u64>,
    pub kind: DeviceKind,
    /// Removable or hot-pluggable medium.
    pub removable: Option<bool>,
    /// Transport type (e.g. "usb", "nvme").
    pub transport: Option<String>,
    pub model: Option<String>,
    pub partitions: Vec<Partition>,
    pub unknown: Vec<&'static str>,
}

/// Where a snapshot was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnumerationSource {
    Lsblk,
    ProcPartitions,
}

/// Immutable result of one enumeration pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceSnapshot {
    pub devices: Vec<BlockDevice>,
    pub source: EnumerationSource,
}

impl DeviceSnapshot {
    /// All partitions in device order.
    pub fn partitions(&self) -> impl Iterator<Item = &Partition> {
        self.devices.iter().flat_map(|d| d.partitions.iter())
    }

    /// Finds a partition by kernel name or path, or by a udev alias such as
    /// `/dev/disk/by-uuid/<uuid>`.
    pub fn find_partition(&self, id: &PartitionId) -> Option<&Partition> {
        self.partitions()
            .find(|p| p.matches(id))
            .or_else(|| self.find_by_alias(id.path()))
    }

    fn find_by_alias(&self, path: &Path) -> Option<&Partition> {
        let path = path.to_str()?;
        if let Some(uuid) = path.strip_prefix("/dev/disk/by-uuid/") {
            self.find_by_uuid(uuid)
        } else if let Some(partuuid) = path.strip_prefix("/dev/disk/by-partuuid/") {
            self.find_by_partuuid(partuuid)
        } else if let Some(label) = path.strip_prefix("/dev/disk/by-label/") {
            self.find_by_label(&label.replace("\\x20", " "))
        } else {
            None
        }
    }

    pub fn find_by_devnum(&self, devnum: DevNum) -> Option<&Partition> {
        self.partitions().find(|p| p.devnum == Some(devnum))
    }

    pub fn find_by_uuid(&self, uuid: &str) -> Option<&Partition> {
        self.partitions()
            .find(|p| p.uuid.as_deref().is_some_and(|u| u.eq_ignore_ascii_case(uuid)))
    }

    pub fn find_by_partuuid(&self, partuuid: &str) -> Option<&Partition> {
        self.partitions()
            .find(|p| p.partuuid.as_deref().is_some_and(|u| u.eq_ignore_ascii_case(partuuid)))
    }

    pub fn find_by_label(&self, label: &str) -> Option<&Partition> {
        self.partitions().find(|p| p.label.as_deref() == Some(label))
    }

    /// The block device owning a partition.
    pub fn disk_of(&self, partition: &Partition) -> Option<&BlockDevice> {
        self.devices.iter().find(|d| d.name == partition.parent)
    }
}

/// Sanitize a string for use as a mount point directory name.
///
/// Replaces problematic characters with underscores.
fn sanitize_mount_name(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Raw JSON structure from lsblk output.
#[derive(Debug, Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<LsblkDevice>,
}

/// One lsblk row. Loosely typed: lsblk versions disagree on whether sizes and
/// flags are numbers, strings or booleans.
#[derive(Debug, Deserialize)]
struct LsblkDevice {
    #[serde(default)]
    name: Option<String>,
    #[serde(default, rename = "maj:min")]
    maj_min: Option<Value>,
    #[serde(default)]
    size: Option<Value>,
    #[serde(default, rename = "type")]
    device_type: Option<String>,
    #[serde(default)]
    fstype: Option<String>,
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    partuuid: Option<String>,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    rm: Option<Value>,
    #[serde(default)]
    hotplug: Option<Value>,
    #[serde(default)]
    tran: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    children: Vec<LsblkDevice>,
}

fn value_as_u64(value: Option<&Value>) -> Option<u64> {
    match value? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn value_as_bool(value: Option<&Value>) -> Option<bool> {
    match value? {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_u64().map(|n| n != 0),
        Value::String(s) => match s.trim() {
            "1" | "true" => Some(true),
            "0" | "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn value_as_devnum(value: Option<&Value>) -> Option<DevNum> {
    match value? {
        Value::String(s) => DevNum::parse(s),
        _ => None,
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_ref()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

impl LsblkDevice {
    fn to_partition(&self, name: &str, parent: &str) -> Partition {
        let devnum = value_as_devnum(self.maj_min.as_ref());
        let size = value_as_u64(self.size.as_ref());
        let fstype = non_empty(&self.fstype);

        let mut unknown = Vec::new();
        if devnum.is_none() {
            unknown.push("devnum");
        }
        if size.is_none() {
            unknown.push("size");
        }
        if fstype.is_none() {
            unknown.push("fstype");
        }

        Partition {
            name: name.to_string(),
            path: Path::new("/dev").join(name),
            devnum,
            size,
            fstype,
            uuid: non_empty(&self.uuid),
            partuuid: non_empty(&self.partuuid),
            label: non_empty(&self.label),
            parent: parent.to_string(),
            unknown,
        }
    }
}

/// Parses `lsblk --json` output into block devices.
pub fn parse_lsblk(json: &str) -> Result<Vec<BlockDevice>> {
    let output: LsblkOutput = serde_json::from_str(json).map_err(|e| Error::LsblkParse {
        message: e.to_string(),
    })?;

    let mut devices = Vec::new();
    for dev in &output.blockdevices {
        let Some(name) = non_empty(&dev.name) else {
            warn!("skipping lsblk entry without a name");
            continue;
        };

        let kind = DeviceKind::from_lsblk(dev.device_type.as_deref());
        let devnum = value_as_devnum(dev.maj_min.as_ref());
        let size = value_as_u64(dev.size.as_ref());
        let removable = match (
            value_as_bool(dev.rm.as_ref()),
            value_as_bool(dev.hotplug.as_ref()),
        ) {
            (None, None) => None,
            (rm, hotplug) => Some(rm.unwrap_or(false) || hotplug.unwrap_or(false)),
        };

        let mut partitions = Vec::new();
        collect_partitions(&dev.children, &name, &mut partitions);

        // A filesystem written straight onto the device (no partition table)
        // is exposed as the device's only partition.
        if partitions.is_empty() && non_empty(&dev.fstype).is_some() {
            partitions.push(dev.to_partition(&name, &name));
        }

        let mut unknown = Vec::new();
        if devnum.is_none() {
            unknown.push("devnum");
        }
        if size.is_none() {
            unknown.push("size");
        }
        if removable.is_none() {
            unknown.push("removable");
        }
        if !unknown.is_empty() {
            debug!(device = %name, ?unknown, "incomplete lsblk metadata");
        }

        devices.push(BlockDevice {
            path: Path::new("/dev").join(&name),
            name,
            devnum,
            size,
            kind,
            removable,
            transport: non_empty(&dev.tran),
            model: non_empty(&dev.model),
            partitions,
            unknown,
        });
    }

    Ok(devices)
}

/// Recursively collect partitions under a disk, including nested children.
fn collect_partitions(children: &[LsblkDevice], parent: &str, out: &mut Vec<Partition>) {
    for child in children {
        let Some(name) = non_empty(&child.name) else {
            warn!(parent, "skipping unnamed child device");
            continue;
        };
        if child.device_type.as_deref() == Some("part") {
            out.push(child.to_partition(&name, parent));
        }
        collect_partitions(&child.children, parent, out);
    }
}

/// Parses `/proc/partitions` (`major minor #blocks name`).
///
/// Names that extend another listed device's name with a partition number
/// (`sda1`, `nvme0n1p2`, `mmcblk0p1`) become partitions of that device.
pub fn parse_proc_partitions(content: &str) -> Vec<BlockDevice> {
    struct Row {
        name: String,
        devnum: Option<DevNum>,
        size: Option<u64>,
    }

    let rows: Vec<Row> = content
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() != 4 || fields[0] == "major" {
                return None;
            }
            let devnum = match (fields[0].parse(), fields[1].parse()) {
                (Ok(major), Ok(minor)) => Some(DevNum::new(major, minor)),
                _ => None,
            };
            Some(Row {
                name: fields[3].to_string(),
                devnum,
                size: fields[2].parse::<u64>().ok().and_then(|blocks| blocks.checked_mul(1024)),
            })
        })
        .collect();

    let parent_of = |name: &str| -> Option<String> {
        rows.iter()
            .filter(|r| r.name != name && is_partition_of(name, &r.name))
            .map(|r| r.name.clone())
            .max_by_key(|n| n.len())
    };

    let mut devices: Vec<BlockDevice> = Vec::new();
    let mut orphans = Vec::new();
    for row in &rows {
        match parent_of(&row.name) {
            Some(parent) => orphans.push((parent, row)),
            None => devices.push(BlockDevice {
                path: Path::new("/dev").join(&row.name),
                name: row.name.clone(),
                devnum: row.devnum,
                size: row.size,
                kind: if row.name.starts_with("loop") {
                    DeviceKind::Loop
                } else {
                    DeviceKind::Disk
                },
                removable: None,
                transport: None,
                model: None,
                partitions: Vec::new(),
                unknown: vec!["removable"],
            }),
        }
    }

    for (parent, row) in orphans {
        if let Some(device) = devices.iter_mut().find(|d| d.name == parent) {
            let mut unknown = vec!["fstype"];
            if row.devnum.is_none() {
                unknown.push("devnum");
            }
            device.partitions.push(Partition {
                name: row.name.clone(),
                path: Path::new("/dev").join(&row.name),
                devnum: row.devnum,
                size: row.size,
                fstype: None,
                uuid: None,
                partuuid: None,
                label: None,
                parent,
                unknown,
            });
        }
    }

    devices
}

fn is_partition_of(candidate: &str, disk: &str) -> bool {
    let Some(rest) = candidate.strip_prefix(disk) else {
        return false;
    };
    // The kernel separates the partition number with `p` only when the
    // disk name itself ends in a digit (nvme0n1p1, mmcblk0p1, loop1p1).
    let digits = if disk.ends_with(|c: char| c.is_ascii_digit()) {
        match rest.strip_prefix('p') {
            Some(digits) => digits,
            None => return false,
        }
    } else {
        rest
    };
    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}

/// Lists all block devices on the system.
///
/// Calls `lsblk --json --bytes`; falls back to `/proc/partitions` if lsblk
/// cannot run or its output cannot be parsed. Fails with
/// [`Error::EnumerationUnavailable`] only if both sources are unreadable.
pub fn list_devices<P: ProbeOps + ?Sized>(probe: &P, config: &EngineConfig) -> Result<DeviceSnapshot> {
    let lsblk_error = match probe.lsblk_json().and_then(|raw| parse_lsblk(&raw)) {
        Ok(devices) => {
            return Ok(DeviceSnapshot {
                devices,
                source: EnumerationSource::Lsblk,
            });
        }
        Err(e) => e,
    };

    warn!(
        error = %lsblk_error,
        fallback = %config.partitions_path.display(),
        "lsblk unavailable, falling back to kernel partition list"
    );

    match probe.read_file(&config.partitions_path) {
        Ok(content) => Ok(DeviceSnapshot {
            devices: parse_proc_partitions(&content),
            source: EnumerationSource::ProcPartitions,
        }),
        Err(e) => Err(Error::EnumerationUnavailable {
            reason: format!(
                "lsblk: {}; {}: {}",
                lsblk_error,
                config.partitions_path.display(),
                e
            ),
        }),
    }
}
