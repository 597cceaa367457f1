//! Engine configuration.
//!
//! Paths of the system sources the engine reads, timing of the busy-holder
//! escalation, and the table of filesystems that need a user-space helper.
//! Loaded from JSON; every field has a default so a partial file is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt};

use crate::error::{ConfigParseSnafu, Error, IoResultExt, Result};
use crate::executor::PrivilegeEscalation;

/// Default live mount table.
pub const DEFAULT_MOUNTINFO_PATH: &str = "/proc/self/mountinfo";

/// Default persisted mount configuration.
pub const DEFAULT_FSTAB_PATH: &str = "/etc/fstab";

/// Default active swap table.
pub const DEFAULT_SWAPS_PATH: &str = "/proc/swaps";

/// Default list of filesystems registered with the kernel.
pub const DEFAULT_FILESYSTEMS_PATH: &str = "/proc/filesystems";

/// Default kernel partition list, used when lsblk is unavailable.
pub const DEFAULT_PARTITIONS_PATH: &str = "/proc/partitions";

/// Default parent directory for generated mount points.
pub const DEFAULT_MOUNT_BASE: &str = "/mnt";

/// Default wait between SIGTERM and SIGKILL.
pub const DEFAULT_GRACE_PERIOD_MS: u64 = 3000;

/// Default liveness polling interval during the grace period.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

/// A filesystem that may need a user-space helper to be mounted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelperRule {
    /// Filesystem type as reported by blkid/lsblk (e.g. "ntfs").
    pub fstype: String,
    /// Human-facing helper name reported in `MissingDependency`.
    pub helper: String,
    /// Binary that must be present for the helper to work.
    pub binary: String,
    /// Filesystem type passed to `mount -t` when the helper is used.
    pub driver: String,
    /// In-kernel driver that makes the helper unnecessary (e.g. "ntfs3").
    #[serde(default)]
    pub kernel_driver: Option<String>,
}

impl HelperRule {
    /// Creates a helper rule without an in-kernel alternative.
    pub fn new(
        fstype: impl Into<String>,
        helper: impl Into<String>,
        binary: impl Into<String>,
        driver: impl Into<String>,
    ) -> Self {
        Self {
            fstype: fstype.into(),
            helper: helper.into(),
            binary: binary.into(),
            driver: driver.into(),
            kernel_driver: None,
        }
    }

    /// Sets the in-kernel driver that takes precedence over the helper.
    pub fn with_kernel_driver(mut self, driver: impl Into<String>) -> Self {
        self.kernel_driver = Some(driver.into());
        self
    }
}

fn default_helpers() -> Vec<HelperRule> {
    vec![
        HelperRule::new("ntfs", "ntfs-3g", "mount.ntfs-3g", "ntfs-3g").with_kernel_driver("ntfs3"),
        HelperRule::new("exfat", "exfat-fuse", "mount.exfat-fuse", "exfat-fuse")
            .with_kernel_driver("exfat"),
    ]
}

fn default_search_path() -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = std::env::var_os("PATH")
        .map(|path| std::env::split_paths(&path).collect())
        .unwrap_or_default();
    for extra in ["/sbin", "/usr/sbin", "/usr/bin"] {
        let extra = PathBuf::from(extra);
        if !dirs.contains(&extra) {
            dirs.push(extra);
        }
    }
    dirs
}

/// Configuration for the partition and mount state engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub mountinfo_path: PathBuf,
    pub fstab_path: PathBuf,
    pub swaps_path: PathBuf,
    pub filesystems_path: PathBuf,
    pub partitions_path: PathBuf,
    /// Parent directory for mount points generated from labels.
    pub mount_base: PathBuf,
    /// Time holders get to exit after SIGTERM before SIGKILL is sent.
    pub grace_period_ms: u64,
    pub poll_interval_ms: u64,
    pub helpers: Vec<HelperRule>,
    /// Directories searched for helper binaries.
    pub helper_search_path: Vec<PathBuf>,
    pub escalation: PrivilegeEscalation,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mountinfo_path: PathBuf::from(DEFAULT_MOUNTINFO_PATH),
            fstab_path: PathBuf::from(DEFAULT_FSTAB_PATH),
            swaps_path: PathBuf::from(DEFAULT_SWAPS_PATH),
            filesystems_path: PathBuf::from(DEFAULT_FILESYSTEMS_PATH),
            partitions_path: PathBuf::from(DEFAULT_PARTITIONS_PATH),
            mount_base: PathBuf::from(DEFAULT_MOUNT_BASE),
            grace_period_ms: DEFAULT_GRACE_PERIOD_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            helpers: default_helpers(),
            helper_search_path: default_search_path(),
            escalation: PrivilegeEscalation::None,
        }
    }
}

impl EngineConfig {
    /// Creates a new config with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a JSON configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).config_context(path)?;
        Self::from_json(&content).context(ConfigParseSnafu { path })
    }

    /// Parses configuration from a JSON string.
    pub fn from_json(content: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(content)
    }

    /// Loads the per-user configuration file, falling back to defaults when absent.
    pub fn load_default() -> Result<Self> {
        let path = Self::default_path()?;
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no configuration file, using defaults");
            return Ok(Self::default());
        }
        Self::load(&path)
    }

    /// Returns `<config dir>/partmgr/config.json`.
    pub fn default_path() -> Result<PathBuf> {
        let dir = dirs::config_dir()
            .whatever_context::<_, Error>("could not determine configuration directory")?;
        Ok(dir.join("partmgr").join("config.json"))
    }

    /// Sets the parent directory for generated mount points.
    pub fn with_mount_base(mut self, path: impl Into<PathBuf>) -> Self {
        self.mount_base = path.into();
        self
    }

    /// Sets the fstab path.
    pub fn with_fstab_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.fstab_path = path.into();
        self
    }

    /// Sets the SIGTERM grace period.
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period_ms = grace.as_millis() as u64;
        self
    }

    /// Replaces the helper table.
    pub fn with_helpers(mut self, helpers: Vec<HelperRule>) -> Self {
        self.helpers = helpers;
        self
    }

    /// Sets the privilege escalation method for privileged commands.
    pub fn with_escalation(mut self, escalation: PrivilegeEscalation) -> Self {
        self.escalation = escalation;
        self
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Finds the helper rule for a filesystem type.
    pub fn helper_for(&self, fstype: &str) -> Option<&HelperRule> {
        self.helpers
            .iter()
            .find(|rule| rule.fstype.eq_ignore_ascii_case(fstype))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config = EngineConfig::from_json(r#"{ "mount_base": "/media" }"#).unwrap();
        assert_eq!(config.mount_base, PathBuf::from("/media"));
        assert_eq!(config.mountinfo_path, PathBuf::from(DEFAULT_MOUNTINFO_PATH));
        assert_eq!(config.grace_period(), Duration::from_millis(3000));
        assert!(config.helper_for("ntfs").is_some());
    }

    #[test]
    fn test_helper_lookup_is_case_insensitive() {
        let config = EngineConfig::default();
        let rule = config.helper_for("NTFS").unwrap();
        assert_eq!(rule.helper, "ntfs-3g");
        assert_eq!(rule.kernel_driver.as_deref(), Some("ntfs3"));
        assert!(config.helper_for("ext4").is_none());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(
            br#"{
                "grace_period_ms": 500,
                "escalation": "sudo",
                "helpers": [
                    { "fstype": "ntfs", "helper": "ntfs-helper", "binary": "mount.ntfs", "driver": "ntfs" }
                ]
            }"#,
        )
        .unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.grace_period(), Duration::from_millis(500));
        assert_eq!(config.escalation, PrivilegeEscalation::Sudo);
        assert_eq!(config.helpers.len(), 1);
        assert_eq!(config.helpers[0].kernel_driver, None);
    }

    #[test]
    fn test_load_malformed_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"{ not json").unwrap();

        let err = EngineConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, Error::ConfigParse { .. }));
    }

    #[test]
    fn test_poll_interval_never_zero() {
        let config = EngineConfig {
            poll_interval_ms: 0,
            ..EngineConfig::default()
        };
        assert_eq!(config.poll_interval(), Duration::from_millis(1));
    }
}
