//! Host mount table inspection.
//!
//! User-namespace overlays are known to misbehave on top of ecryptfs, so
//! before any sandbox is launched the workspace and the shard storage
//! directory are checked against the host mount table. The check is
//! best effort: when the mount table cannot be read (non-Linux host,
//! restricted `/proc`) every path is assumed to be safe.

use std::path::{Component, Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{DrydockError, EncryptedPath, Result};

const MOUNT_TABLE: &str = "/proc/self/mounts";

/// Filesystem types that corrupt user-namespace overlays.
const BROKEN_FSTYPES: &[&str] = &["ecryptfs"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub mountpoint: PathBuf,
    pub fstype: String,
}

#[derive(Debug, Clone, Default)]
pub struct MountTable {
    entries: Vec<MountEntry>,
}

/// Undo the octal escaping the kernel applies to whitespace and
/// backslashes in mount table fields (`\040` for a space, etc).
fn unescape_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = digits
                    .iter()
                    .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
                if let Ok(v) = u8::try_from(value) {
                    out.push(v);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Make `path` absolute and free of `.`/`..` without requiring it to exist.
fn normalize(path: &Path) -> PathBuf {
    if let Ok(canonical) = std::fs::canonicalize(path) {
        return canonical;
    }
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    let mut out = PathBuf::from("/");
    for comp in absolute.components() {
        match comp {
            Component::Normal(seg) => out.push(seg),
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    out
}

fn with_trailing_slash(path: &Path) -> String {
    let s = path.to_string_lossy();
    if s.ends_with('/') {
        s.into_owned()
    } else {
        format!("{}/", s)
    }
}

impl MountTable {
    /// Parse the `/proc/mounts` format: `device mountpoint fstype options freq passno`.
    pub fn parse(content: &str) -> Self {
        let entries = content
            .lines()
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                let _device = fields.next()?;
                let mountpoint = fields.next()?;
                let fstype = fields.next()?;
                Some(MountEntry {
                    mountpoint: PathBuf::from(unescape_field(mountpoint)),
                    fstype: fstype.to_string(),
                })
            })
            .collect();
        Self { entries }
    }

    /// Snapshot the host mount table, or `None` when it is unreadable.
    pub fn read() -> Option<Self> {
        match std::fs::read_to_string(MOUNT_TABLE) {
            Ok(content) => Some(Self::parse(&content)),
            Err(e) => {
                debug!("Cannot read {}: {}; skipping mount checks", MOUNT_TABLE, e);
                None
            }
        }
    }

    pub fn entries(&self) -> &[MountEntry] {
        &self.entries
    }

    /// The mount whose mountpoint is the longest prefix of `path`.
    /// `path` is expected to be absolute and normalized.
    pub fn find_mount(&self, path: &Path) -> Option<&MountEntry> {
        let target = with_trailing_slash(path);
        self.entries
            .iter()
            .filter(|e| target.starts_with(&with_trailing_slash(&e.mountpoint)))
            // Later entries shadow earlier ones mounted at the same point.
            .max_by_key(|e| e.mountpoint.as_os_str().len())
    }

    pub fn is_mountpoint(&self, path: &Path) -> bool {
        let path = normalize(path);
        self.entries.iter().any(|e| e.mountpoint == path)
    }
}

/// Refuses to operate on paths that live on encrypted mounts.
#[derive(Debug, Clone)]
pub struct MountGuard {
    allow_ecryptfs: bool,
    table: Option<MountTable>,
}

impl MountGuard {
    /// Guard over a snapshot of the live host mount table.
    pub fn new(allow_ecryptfs: bool) -> Self {
        let table = if allow_ecryptfs { None } else { MountTable::read() };
        Self { allow_ecryptfs, table }
    }

    pub fn with_table(table: Option<MountTable>, allow_ecryptfs: bool) -> Self {
        Self { allow_ecryptfs, table }
    }

    fn find_encrypted(&self, path: &Path) -> Option<EncryptedPath> {
        let table = self.table.as_ref()?;
        let normalized = normalize(path);
        let mount = table.find_mount(&normalized)?;
        if BROKEN_FSTYPES.contains(&mount.fstype.as_str()) {
            Some(EncryptedPath {
                path: path.to_path_buf(),
                mountpoint: mount.mountpoint.clone(),
            })
        } else {
            None
        }
    }

    pub fn check_encryption(&self, path: &Path) -> Result<()> {
        self.check_all(&[path])
    }

    /// Check every path, reporting all offenders in a single error.
    pub fn check_all(&self, paths: &[&Path]) -> Result<()> {
        if self.allow_ecryptfs {
            warn!("Encrypted filesystem check bypassed by configuration");
            return Ok(());
        }
        let offenders: Vec<EncryptedPath> = paths
            .iter()
            .filter_map(|p| self.find_encrypted(p))
            .collect();
        if offenders.is_empty() {
            Ok(())
        } else {
            Err(DrydockError::EncryptionDetected(offenders))
        }
    }
}
