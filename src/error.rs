use std::fmt;
use std::path::PathBuf;

/// A path that lives on a mount known to break user-namespace overlays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedPath {
    pub path: PathBuf,
    pub mountpoint: PathBuf,
}

impl fmt::Display for EncryptedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (on encrypted mount {})",
            self.path.display(),
            self.mountpoint.display()
        )
    }
}

fn format_encrypted(paths: &[EncryptedPath]) -> String {
    let listed = paths
        .iter()
        .map(|p| format!("  {}", p))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "encrypted filesystem detected; user namespace overlays are broken on ecryptfs:\n{}\n\
         move the affected directories off the encrypted mount, or point DRYDOCK_STORAGE_DIR \
         at an unencrypted location (DRYDOCK_ALLOW_ECRYPTFS=1 skips this check at your own risk)",
        listed
    )
}

fn shard_hint(stage: &ShardStage) -> &'static str {
    match stage {
        ShardStage::Select => {
            "check the shard catalog ([general] catalog) and the [sandbox] bootstrap triplet"
        }
        ShardStage::Download => {
            "check network access, or set DRYDOCK_STORAGE_DIR to a store that already holds the shard"
        }
        ShardStage::Verify => "the bad archive was removed; retry, or check the sha256 in the shard catalog",
        ShardStage::Mount => {
            "check free space and permissions under the storage dir, or set DRYDOCK_STORAGE_DIR elsewhere"
        }
    }
}

/// Which step of shard preparation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardStage {
    Select,
    Download,
    Verify,
    Mount,
}

impl fmt::Display for ShardStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Select => "select",
            Self::Download => "download",
            Self::Verify => "verify",
            Self::Mount => "mount",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DrydockError {
    #[error("{}", format_encrypted(.0))]
    EncryptionDetected(Vec<EncryptedPath>),

    #[error("shard {shard}: {stage} failed: {message}\n{}", shard_hint(.stage))]
    ShardError {
        shard: String,
        stage: ShardStage,
        message: String,
    },

    #[error("environment error: {0}")]
    EnvironmentError(String),

    #[error("sandbox error: {0}")]
    SandboxError(String),

    #[error("config error: {0}")]
    ConfigError(String),

    #[error("parse error: {0}")]
    ParseError(String),

    #[error("archive error: {0}")]
    ArchiveError(String),

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML deserialization error: {0}")]
    TomlError(#[from] toml::de::Error),
}

impl DrydockError {
    pub fn shard(shard: impl Into<String>, stage: ShardStage, message: impl Into<String>) -> Self {
        Self::ShardError {
            shard: shard.into(),
            stage,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DrydockError>;
