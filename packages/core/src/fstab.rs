//! Fstab parsing module.
//!
//! Reads the persisted mount configuration. It is the second, non-authoritative
//! source of truth: the live mount table wins, and disagreements surface as
//! reconciliation warnings. Lines that do not parse are skipped, never fatal.

use std::path::PathBuf;

use tracing::debug;

use crate::disk::{DeviceSnapshot, Partition};

/// Represents a single fstab entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FstabEntry {
    /// The device identifier (e.g., "UUID=xxx", "LABEL=xxx" or "/dev/sda1").
    pub fs_spec: String,
    /// Mount point path ("none" for swap).
    pub mount_point: PathBuf,
    /// Filesystem type (e.g., "ext4", "swap").
    pub vfs_type: String,
    /// Mount options.
    pub mount_options: Vec<String>,
    /// This field is used by dump(8) to determine which filesystems need to be dumped.
    pub dump: u8,
    /// This field is used by fsck(8) to determine the order in which filesystem checks are done at boot time.
    pub fsck_order: u16,
}

/// How an fstab entry names its device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsSpec<'a> {
    Uuid(&'a str),
    PartUuid(&'a str),
    Label(&'a str),
    Path(&'a str),
    /// Pseudo filesystems and anything not naming a block device ("tmpfs", "proc").
    Virtual(&'a str),
}

impl FstabEntry {
    /// Parses a single fstab line into an entry.
    ///
    /// Returns None for comments, empty lines and malformed lines. The
    /// dump and pass fields are optional and default to 0.
    pub fn from_line(line: &str) -> Option<Self> {
        let line = line.trim();

        // Skip comments and empty lines
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        if !(3..=6).contains(&parts.len()) {
            debug!(line, "skipping malformed fstab line");
            return None;
        }

        let mount_options = parts
            .get(3)
            .map(|opts| opts.split(',').map(|s| s.to_string()).collect())
            .unwrap_or_else(|| vec!["defaults".to_string()]);
        let dump = parts.get(4).and_then(|d| d.parse().ok()).unwrap_or(0);
        let fsck_order = parts.get(5).and_then(|p| p.parse().ok()).unwrap_or(0);

        Some(Self {
            fs_spec: unescape_fstab_path(parts[0]),
            mount_point: PathBuf::from(unescape_fstab_path(parts[1])),
            vfs_type: parts[2].to_string(),
            mount_options,
            dump,
            fsck_order,
        })
    }

    pub fn spec(&self) -> FsSpec<'_> {
        let spec = self.fs_spec.as_str();
        if let Some(uuid) = spec.strip_prefix("UUID=") {
            FsSpec::Uuid(uuid)
        } else if let Some(partuuid) = spec.strip_prefix("PARTUUID=") {
            FsSpec::PartUuid(partuuid)
        } else if let Some(label) = spec.strip_prefix("LABEL=") {
            FsSpec::Label(label)
        } else if let Some(uuid) = spec.strip_prefix("/dev/disk/by-uuid/") {
            FsSpec::Uuid(uuid)
        } else if let Some(partuuid) = spec.strip_prefix("/dev/disk/by-partuuid/") {
            FsSpec::PartUuid(partuuid)
        } else if let Some(label) = spec.strip_prefix("/dev/disk/by-label/") {
            FsSpec::Label(label)
        } else if spec.starts_with("/dev/") {
            FsSpec::Path(spec)
        } else {
            FsSpec::Virtual(spec)
        }
    }

    /// Resolves the entry to a partition in the given snapshot.
    pub fn resolve<'s>(&self, devices: &'s DeviceSnapshot) -> Option<&'s Partition> {
        match self.spec() {
            FsSpec::Uuid(uuid) => devices.find_by_uuid(uuid),
            FsSpec::PartUuid(partuuid) => devices.find_by_partuuid(partuuid),
            FsSpec::Label(label) => devices.find_by_label(label),
            FsSpec::Path(path) => devices.partitions().find(|p| p.path.as_os_str() == path),
            FsSpec::Virtual(_) => None,
        }
    }

    /// True if the entry names a block device rather than a pseudo filesystem.
    pub fn names_block_device(&self) -> bool {
        !matches!(self.spec(), FsSpec::Virtual(_))
    }

    pub fn is_swap(&self) -> bool {
        self.vfs_type == "swap"
    }

    /// True unless the entry is marked `noauto`.
    pub fn is_auto(&self) -> bool {
        !self.mount_options.iter().any(|o| o == "noauto")
    }

    pub fn is_nofail(&self) -> bool {
        self.mount_options.iter().any(|o| o == "nofail")
    }
}

/// Unescapes octal sequences (`\040` and friends) in fstab and mountinfo fields.
pub fn unescape_fstab_path(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\\' {
            let lookahead: String = chars.clone().take(3).collect();
            if lookahead.len() == 3
                && lookahead.chars().all(|d| ('0'..='7').contains(&d))
                && let Ok(byte) = u8::from_str_radix(&lookahead, 8)
            {
                result.push(byte as char);
                for _ in 0..3 {
                    chars.next();
                }
                continue;
            }
        }
        result.push(c);
    }
    result
}

/// Parses fstab content, skipping anything that is not an entry.
pub fn parse_fstab(content: &str) -> Vec<FstabEntry> {
    content.lines().filter_map(FstabEntry::from_line).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::{EnumerationSource, parse_lsblk};

    const SAMPLE_FSTAB: &str = r#"# /etc/fstab: static file system information.

# <file system>  <mount point>  <type>  <options>  <dump>  <pass>
UUID=abc-123  /  ext4  defaults  0  1
PARTUUID=ef-01  /boot/efi  vfat  umask=0077  0  1
/dev/sda3  none  swap  sw  0  0
LABEL=Backup  /mnt/backup  ext4  noauto,nofail
tmpfs  /tmp  tmpfs  defaults,size=2G  0  0
this line is broken in too many different places
"#;

    #[test]
    fn test_parse_fstab_entry() {
        let line = "UUID=1234-5678  /mnt/Test  ntfs3  rw,noatime  0  0";
        let entry = FstabEntry::from_line(line).unwrap();

        assert_eq!(entry.fs_spec, "UUID=1234-5678");
        assert_eq!(entry.mount_point, PathBuf::from("/mnt/Test"));
        assert_eq!(entry.vfs_type, "ntfs3");
        assert_eq!(entry.mount_options, vec!["rw", "noatime"]);
        assert_eq!(entry.dump, 0);
        assert_eq!(entry.fsck_order, 0);
    }

    #[test]
    fn test_parse_fstab_skip_comments() {
        assert!(FstabEntry::from_line("# This is a comment").is_none());
        assert!(FstabEntry::from_line("").is_none());
        assert!(FstabEntry::from_line("   ").is_none());
        assert!(FstabEntry::from_line("only two").is_none());
    }

    #[test]
    fn test_parse_fstab_tolerates_short_and_broken_lines() {
        let entries = parse_fstab(SAMPLE_FSTAB);
        assert_eq!(entries.len(), 5);

        let backup = &entries[3];
        assert_eq!(backup.fsck_order, 0);
        assert!(!backup.is_auto());
        assert!(backup.is_nofail());
        assert!(entries[2].is_swap());
    }

    #[test]
    fn test_fs_spec_kinds() {
        let entries = parse_fstab(SAMPLE_FSTAB);
        assert_eq!(entries[0].spec(), FsSpec::Uuid("abc-123"));
        assert_eq!(entries[1].spec(), FsSpec::PartUuid("ef-01"));
        assert_eq!(entries[2].spec(), FsSpec::Path("/dev/sda3"));
        assert_eq!(entries[3].spec(), FsSpec::Label("Backup"));
        assert_eq!(entries[4].spec(), FsSpec::Virtual("tmpfs"));
        assert!(!entries[4].names_block_device());

        let by_uuid = FstabEntry::from_line("/dev/disk/by-uuid/abc-123 / ext4 defaults 0 1").unwrap();
        assert_eq!(by_uuid.spec(), FsSpec::Uuid("abc-123"));
    }

    #[test]
    fn test_resolve_against_snapshot() {
        let json = r#"{"blockdevices": [{"name": "sda", "type": "disk", "children": [
            {"name": "sda1", "type": "part", "fstype": "ext4", "uuid": "ABC-123", "label": "root"},
            {"name": "sda3", "type": "part", "fstype": "swap"}
        ]}]}"#;
        let devices = DeviceSnapshot {
            devices: parse_lsblk(json).unwrap(),
            source: EnumerationSource::Lsblk,
        };
        let entries = parse_fstab(SAMPLE_FSTAB);

        assert_eq!(entries[0].resolve(&devices).unwrap().name, "sda1");
        assert!(entries[1].resolve(&devices).is_none());
        assert_eq!(entries[2].resolve(&devices).unwrap().name, "sda3");
        assert!(entries[4].resolve(&devices).is_none());
    }

    #[test]
    fn test_parse_fstab_escaped_spaces() {
        // "My Drive" -> "My\040Drive"
        let line = "UUID=1234  /mnt/My\\040Drive  ntfs3  defaults  0  0";
        let entry = FstabEntry::from_line(line).unwrap();
        assert_eq!(entry.mount_point, PathBuf::from("/mnt/My Drive"));
    }

    #[test]
    fn test_unescape_leaves_non_octal_alone() {
        assert_eq!(unescape_fstab_path(r"/mnt/a\134b"), r"/mnt/a\b");
        assert_eq!(unescape_fstab_path(r"/mnt/a\9zz"), r"/mnt/a\9zz");
        assert_eq!(unescape_fstab_path(r"/mnt/tail\04"), r"/mnt/tail\04");
    }
}
