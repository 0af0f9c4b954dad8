use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{DrydockError, Result};
use crate::shard::{Shard, ShardFormat, ShardKind};

#[derive(Debug, Deserialize, Clone)]
pub struct CatalogEntry {
    pub name: String,
    pub version: String,
    pub kind: ShardKind,
    pub triplet: String,
    pub url: String,
    pub sha256: String,
    #[serde(default)]
    pub format: ShardFormat,
}

#[derive(Deserialize)]
struct CatalogFile {
    #[serde(default, rename = "shard")]
    shards: Vec<CatalogEntry>,
}

/// Known shards, read from a TOML file of `[[shard]]` tables.
#[derive(Debug, Clone, Default)]
pub struct ShardCatalog {
    entries: Vec<CatalogEntry>,
}

impl ShardCatalog {
    pub fn parse(content: &str) -> Result<Self> {
        let file: CatalogFile = toml::from_str(content)?;
        for entry in &file.shards {
            if entry.sha256.len() != 64 || !entry.sha256.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(DrydockError::ConfigError(format!(
                    "shard {}-{} has an invalid sha256",
                    entry.name, entry.version
                )));
            }
        }
        Ok(Self { entries: file.shards })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            DrydockError::ConfigError(format!(
                "failed to read shard catalog {}: {} (set [general] catalog or DRYDOCK_STORAGE_DIR)",
                path.display(),
                e
            ))
        })?;
        Self::parse(&content)
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    /// Look up a shard of `kind` for `triplet`, preferring `format` but
    /// accepting any format when the preferred one is not published.
    pub fn find(&self, kind: ShardKind, triplet: &str, format: ShardFormat) -> Option<&CatalogEntry> {
        let mut candidates = self
            .entries
            .iter()
            .filter(|e| e.kind == kind && e.triplet == triplet);
        let first = candidates.clone().next()?;
        Some(candidates.find(|e| e.format == format).unwrap_or(first))
    }

    pub fn to_shard(entry: &CatalogEntry, storage_dir: &Path) -> Shard {
        Shard {
            name: entry.name.clone(),
            version: entry.version.clone(),
            kind: entry.kind,
            triplet: entry.triplet.clone(),
            format: entry.format,
            url: entry.url.clone(),
            sha256: entry.sha256.to_lowercase(),
            storage_dir: PathBuf::from(storage_dir),
        }
    }
}
