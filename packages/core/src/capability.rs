//! Filesystem capability detection.
//!
//! Decides how a filesystem type can be mounted on this host: by an in-kernel
//! driver, through a user-space helper (e.g. ntfs-3g), or not at all.

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::host::ProbeOps;

/// Filesystem types that are never mounted as filesystems.
const NON_MOUNTABLE: &[&str] = &["swap", "linux_raid_member", "LVM2_member", "crypto_LUKS"];

/// How a filesystem type can be mounted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Capability {
    /// The kernel mounts it directly with `driver`.
    Supported { driver: String },
    /// A user-space helper is needed.
    RequiresHelper {
        helper: String,
        /// Filesystem type to pass to `mount -t`.
        driver: String,
        available: bool,
    },
    Unsupported,
}

impl Capability {
    /// The `mount -t` type to use, if mounting is possible right now.
    pub fn driver(&self) -> Option<&str> {
        match self {
            Self::Supported { driver } => Some(driver),
            Self::RequiresHelper {
                driver,
                available: true,
                ..
            } => Some(driver),
            _ => None,
        }
    }

    /// The helper that must be installed, if one is missing.
    pub fn missing_helper(&self) -> Option<&str> {
        match self {
            Self::RequiresHelper {
                helper,
                available: false,
                ..
            } => Some(helper),
            _ => None,
        }
    }
}

/// Parses `/proc/filesystems` into the set of registered filesystem names.
pub fn parse_kernel_filesystems(content: &str) -> BTreeSet<String> {
    content
        .lines()
        .filter_map(|line| line.split_whitespace().last())
        .filter(|name| !name.is_empty() && *name != "nodev")
        .map(str::to_string)
        .collect()
}

/// Determines how `fstype` can be mounted.
pub fn can_mount<P: ProbeOps + ?Sized>(probe: &P, config: &EngineConfig, fstype: &str) -> Capability {
    let fstype = fstype.trim();
    if fstype.is_empty() || NON_MOUNTABLE.iter().any(|n| n.eq_ignore_ascii_case(fstype)) {
        return Capability::Unsupported;
    }

    let kernel = match probe.read_file(&config.filesystems_path) {
        Ok(content) => parse_kernel_filesystems(&content),
        Err(e) => {
            warn!(path = %config.filesystems_path.display(), error = %e, "cannot read kernel filesystem list");
            BTreeSet::new()
        }
    };
    let kernel_has = |name: &str| kernel.contains(name) || probe.kernel_module_available(name);

    if let Some(rule) = config.helper_for(fstype) {
        if let Some(driver) = rule.kernel_driver.as_deref()
            && kernel_has(driver)
        {
            debug!(fstype, driver, "in-kernel driver available");
            return Capability::Supported {
                driver: driver.to_string(),
            };
        }
        let available = probe.binary_exists(&rule.binary, &config.helper_search_path);
        debug!(fstype, helper = %rule.helper, available, "filesystem requires helper");
        return Capability::RequiresHelper {
            helper: rule.helper.clone(),
            driver: rule.driver.clone(),
            available,
        };
    }

    let fstype = fstype.to_ascii_lowercase();
    if kernel_has(&fstype) {
        Capability::Supported { driver: fstype }
    } else {
        Capability::Unsupported
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HelperRule;
    use crate::host::FakeHost;

    const FILESYSTEMS: &str = "nodev\tsysfs\nnodev\ttmpfs\n\text4\n\tvfat\nnodev\tfuse\n\tfuseblk\n";

    #[test]
    fn test_parse_kernel_filesystems() {
        let set = parse_kernel_filesystems(FILESYSTEMS);
        assert!(set.contains("ext4"));
        assert!(set.contains("tmpfs"));
        assert!(!set.contains("nodev"));
    }

    #[test]
    fn test_native_filesystem_supported() {
        let host = FakeHost::new();
        host.set_kernel_filesystems(&["ext4", "vfat"]);
        let config = EngineConfig::default();

        assert_eq!(
            can_mount(&host, &config, "ext4"),
            Capability::Supported {
                driver: "ext4".to_string()
            }
        );
        assert_eq!(can_mount(&host, &config, "xfs"), Capability::Unsupported);
        assert_eq!(can_mount(&host, &config, "swap"), Capability::Unsupported);
        assert_eq!(can_mount(&host, &config, ""), Capability::Unsupported);
    }

    #[test]
    fn test_loadable_module_counts_as_supported() {
        let host = FakeHost::new();
        host.set_kernel_filesystems(&["ext4"]);
        host.add_kernel_module("xfs");
        let config = EngineConfig::default();

        assert_eq!(
            can_mount(&host, &config, "xfs").driver(),
            Some("xfs")
        );
    }

    #[test]
    fn test_kernel_driver_preferred_over_helper() {
        let host = FakeHost::new();
        host.set_kernel_filesystems(&["ext4", "ntfs3"]);
        let config = EngineConfig::default();

        assert_eq!(
            can_mount(&host, &config, "ntfs"),
            Capability::Supported {
                driver: "ntfs3".to_string()
            }
        );
    }

    #[test]
    fn test_helper_presence() {
        let host = FakeHost::new();
        host.set_kernel_filesystems(&["ext4"]);
        let config = EngineConfig::default()
            .with_helpers(vec![HelperRule::new("ntfs", "ntfs-helper", "mount.ntfs-helper", "ntfs-3g")]);

        let missing = can_mount(&host, &config, "ntfs");
        assert_eq!(missing.missing_helper(), Some("ntfs-helper"));
        assert_eq!(missing.driver(), None);

        host.add_binary("mount.ntfs-helper");
        let present = can_mount(&host, &config, "NTFS");
        assert_eq!(present.missing_helper(), None);
        assert_eq!(present.driver(), Some("ntfs-3g"));
    }
}
