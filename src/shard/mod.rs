pub mod catalog;
pub mod store;

use std::path::PathBuf;

use serde::Deserialize;

use crate::error::Result;
use crate::platform::Platform;

/// What a shard provides inside the container.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ShardKind {
    /// Base OS tree plus the sandbox launcher; mounted as `/`.
    Rootfs,
    /// Compiler toolchain for one triplet.
    Toolchain,
    /// Platform SDK (macOS).
    Sdk,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum ShardFormat {
    /// Tarball unpacked into the shard store.
    #[default]
    Unpacked,
    /// Squashfs image loop-mounted read-only.
    Squashfs,
}

/// A content-addressed filesystem bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard {
    pub name: String,
    pub version: String,
    pub kind: ShardKind,
    pub triplet: String,
    pub format: ShardFormat,
    pub url: String,
    pub sha256: String,
    pub storage_dir: PathBuf,
}

impl Shard {
    /// Unique, filesystem-safe identifier.
    pub fn id(&self) -> String {
        format!("{}-{}-{}", self.name, self.version, self.triplet)
    }

    /// Where the shard's contents appear on the host once prepared.
    pub fn mount_path(&self) -> PathBuf {
        self.storage_dir.join("mounts").join(self.id())
    }

    /// Cached download location.
    pub fn archive_path(&self) -> PathBuf {
        let filename = self
            .url
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| self.id());
        self.storage_dir
            .join("downloads")
            .join(format!("{}-{}", &self.sha256[..self.sha256.len().min(12)], filename))
    }

    /// Mount point inside the container for auxiliary shards. The root
    /// shard has none: it becomes the container's `/`.
    pub fn mount_target(&self) -> Option<PathBuf> {
        match self.kind {
            ShardKind::Rootfs => None,
            ShardKind::Toolchain => Some(PathBuf::from("/opt").join(&self.triplet)),
            ShardKind::Sdk => Some(
                PathBuf::from("/opt")
                    .join(&self.triplet)
                    .join(format!("MacOSX{}.sdk", self.version)),
            ),
        }
    }
}

/// Selects and materializes shards for a target platform.
pub trait ShardResolver: Send + Sync {
    /// Ordered shard list for `platform`, root shard first.
    fn choose_shards(&self, platform: &Platform) -> Result<Vec<Shard>>;

    /// Make sure `shard` is present and mounted. Idempotent; re-checks the
    /// host state on every call since mounts can disappear between sessions.
    fn prepare_shard(&self, shard: &Shard, verbose: bool) -> Result<()>;
}
