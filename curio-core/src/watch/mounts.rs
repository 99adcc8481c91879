//! Mount table inspection.
//!
//! Decides per watched root whether native change notification is reliable.
//! Kernel-backed local filesystems get inotify-style watchers; network and
//! FUSE mounts fall back to snapshot polling because remote writers never
//! reach the local notification layer.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;

/// Broad filesystem family, derived from the mount table's fstype column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsCategory {
    /// Kernel-backed local disk (ext4, xfs, btrfs, apfs, ntfs, ...).
    Local,
    /// NFS in any version.
    Nfs,
    /// SMB/CIFS shares.
    Cifs,
    /// SSH-based remote mounts.
    Sshfs,
    /// Other userspace filesystems.
    Fuse,
    /// RAM-backed (tmpfs, ramfs).
    Memory,
    /// Kernel pseudo-filesystems (proc, sysfs, cgroup, ...).
    Virtual,
    /// Anything we cannot classify.
    Unknown,
}

impl FsCategory {
    /// Whether the kernel delivers change events for writes from any client.
    ///
    /// Network and FUSE mounts report only locally-initiated changes at
    /// best, so they are treated as unreliable and polled instead.
    pub fn supports_reliable_watch(self) -> bool {
        matches!(self, FsCategory::Local | FsCategory::Memory)
    }
}

/// Classify a mount table fstype string.
pub fn classify_fstype(fstype: &str) -> FsCategory {
    let lower = fstype.to_ascii_lowercase();
    match lower.as_str() {
        "nfs" | "nfs4" | "nfs3" => FsCategory::Nfs,
        "cifs" | "smb" | "smb2" | "smb3" | "smbfs" => FsCategory::Cifs,
        "sshfs" | "fuse.sshfs" => FsCategory::Sshfs,
        "tmpfs" | "ramfs" => FsCategory::Memory,
        "proc" | "sysfs" | "devtmpfs" | "devpts" | "cgroup" | "cgroup2" | "securityfs"
        | "debugfs" | "tracefs" | "pstore" | "bpf" | "configfs" | "mqueue" | "hugetlbfs"
        | "autofs" | "binfmt_misc" | "fusectl" | "rpc_pipefs" | "nsfs" => FsCategory::Virtual,
        "ext2" | "ext3" | "ext4" | "xfs" | "btrfs" | "zfs" | "f2fs" | "reiserfs" | "jfs"
        | "ntfs" | "ntfs3" | "exfat" | "vfat" | "msdos" | "iso9660" | "udf" | "squashfs"
        | "overlay" | "apfs" | "hfs" | "hfsplus" => FsCategory::Local,
        _ if lower.starts_with("fuse") => FsCategory::Fuse,
        _ if lower.starts_with("nfs") => FsCategory::Nfs,
        _ => FsCategory::Unknown,
    }
}

/// One row of the mount table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountEntry {
    pub mount_point: PathBuf,
    pub fstype: String,
    pub category: FsCategory,
}

/// Decode `/proc/mounts` octal escapes (`\040` for space, `\011` for tab,
/// `\012` for newline, `\134` for backslash). Non-ASCII characters pass
/// through untouched; the kernel only escapes the four ASCII bytes above.
fn unescape_octal(field: &str) -> String {
    // Escapes decode to raw bytes, so assemble bytes and re-validate once.
    let mut bytes = Vec::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c == '\\'
            && let Some(code) = chars.as_str().get(0..3)
            && code.bytes().all(|b| matches!(b, b'0'..=b'7'))
            && let Ok(value) = u8::from_str_radix(code, 8)
        {
            bytes.push(value);
            chars.nth(2);
            continue;
        }
        let mut buf = [0u8; 4];
        bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Parse `/proc/mounts` content into entries, skipping malformed lines.
pub fn parse_proc_mounts(content: &str) -> Vec<MountEntry> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let _device = fields.next()?;
            let mount_point = unescape_octal(fields.next()?);
            let fstype = fields.next()?.to_string();
            let category = classify_fstype(&fstype);
            Some(MountEntry {
                mount_point: PathBuf::from(mount_point),
                fstype,
                category,
            })
        })
        .collect()
}

/// Source of mount table entries. Swappable in tests so mount
/// classification can be exercised without a real `/proc`.
pub trait MountResolver: Send + Sync {
    fn mounts(&self) -> Result<Vec<MountEntry>>;
}

/// Reads the live system mount table.
#[derive(Debug, Default)]
pub struct SystemMounts;

impl MountResolver for SystemMounts {
    #[cfg(target_os = "linux")]
    fn mounts(&self) -> Result<Vec<MountEntry>> {
        let content = std::fs::read_to_string("/proc/mounts")?;
        Ok(parse_proc_mounts(&content))
    }

    #[cfg(not(target_os = "linux"))]
    fn mounts(&self) -> Result<Vec<MountEntry>> {
        // No portable mount table here; callers treat every root as local.
        Ok(Vec::new())
    }
}

/// Category of the mount holding `path`: the entry with the longest
/// mount-point prefix wins. Paths matching no entry are treated as local so
/// a missing or unparsable mount table degrades to native watching.
pub fn category_for_path(mounts: &[MountEntry], path: &Path) -> FsCategory {
    let best = mounts
        .iter()
        .filter(|entry| path.starts_with(&entry.mount_point))
        .max_by_key(|entry| entry.mount_point.as_os_str().len());
    match best {
        Some(entry) => {
            debug!(
                path = %path.display(),
                mount = %entry.mount_point.display(),
                fstype = %entry.fstype,
                category = ?entry.category,
                "classified watch root"
            );
            entry.category
        }
        None => FsCategory::Local,
    }
}
