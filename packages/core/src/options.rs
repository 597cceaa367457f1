//! Mount option generation.
//!
//! Builds the `-o` list passed to `mount` from:
//! - Filesystem defaults (ownership for filesystems without POSIX permissions)
//! - Caller options, which override defaults by key
//! - The read-only flag
//!
//! Also derives the default mountpoint for a partition.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::disk::Partition;

/// Filesystems that have no on-disk ownership and need `uid=`/`gid=` to be usable.
const OWNERLESS_FILESYSTEMS: &[&str] = &["ntfs", "ntfs3", "exfat", "vfat", "msdos", "fat"];

/// Returns the uid and gid of the invoking user.
///
/// When running under sudo this is the user who ran sudo, not root.
pub fn invoking_ids() -> (u32, u32) {
    let from_env = |var: &str| std::env::var(var).ok().and_then(|v| v.parse().ok());
    let uid = from_env("SUDO_UID").unwrap_or_else(|| nix::unistd::getuid().as_raw());
    let gid = from_env("SUDO_GID").unwrap_or_else(|| nix::unistd::getgid().as_raw());
    (uid, gid)
}

/// Caller-supplied parameters for a mount request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountOptions {
    /// Mountpoint; derived from the partition when None.
    pub target: Option<PathBuf>,
    /// Extra `mount -o` options, e.g. `["noatime", "umask=022"]`.
    pub options: Vec<String>,
    pub read_only: bool,
}

impl MountOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_target(mut self, target: impl Into<PathBuf>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options.extend(options.into_iter().map(Into::into));
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }
}

/// Splits a comma separated option string, dropping empty items.
pub fn parse_option_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|o| !o.is_empty())
        .map(str::to_string)
        .collect()
}

fn option_key(option: &str) -> &str {
    option.split_once('=').map_or(option, |(key, _)| key)
}

/// Default options for a filesystem type.
pub fn default_options(fstype: &str, uid: u32, gid: u32) -> Vec<String> {
    let fstype = fstype.to_ascii_lowercase();
    if OWNERLESS_FILESYSTEMS.contains(&fstype.as_str()) {
        vec![format!("uid={}", uid), format!("gid={}", gid)]
    } else {
        Vec::new()
    }
}

/// Merges caller options into defaults.
///
/// A caller option replaces any default with the same key (`uid=0` replaces
/// `uid=1000`); `ro` and `rw` replace each other.
pub fn merge_options(defaults: &[String], caller: &[String]) -> Vec<String> {
    let mut merged: Vec<String> = defaults.to_vec();
    for option in caller {
        let key = option_key(option);
        merged.retain(|existing| {
            let existing_key = option_key(existing);
            let access_flip = matches!((existing_key, key), ("ro", "rw") | ("rw", "ro"));
            existing_key != key && !access_flip
        });
        merged.push(option.clone());
    }
    merged
}

/// Builds the final option list for mounting a filesystem of `fstype`.
pub fn build_mount_options(fstype: &str, request: &MountOptions, uid: u32, gid: u32) -> Vec<String> {
    let mut caller = request.options.clone();
    if request.read_only {
        caller.push("ro".to_string());
    }
    merge_options(&default_options(fstype, uid, gid), &caller)
}

/// Default mountpoint for a partition: `<base>/<label, uuid prefix or name>`.
pub fn default_mount_point(base: &Path, partition: &Partition) -> PathBuf {
    base.join(partition.suggested_mount_name())
}
