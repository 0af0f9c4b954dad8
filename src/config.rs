use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{DrydockError, Result};
use crate::platform::Platform;

pub const ENV_RUNNER: &str = "DRYDOCK_RUNNER";
pub const ENV_ALLOW_ECRYPTFS: &str = "DRYDOCK_ALLOW_ECRYPTFS";
pub const ENV_STORAGE_DIR: &str = "DRYDOCK_STORAGE_DIR";
pub const ENV_USE_CCACHE: &str = "DRYDOCK_USE_CCACHE";
pub const ENV_USE_SQUASHFS: &str = "DRYDOCK_USE_SQUASHFS";

#[derive(Debug, Deserialize, Clone)]
pub struct GlobalConfig {
    #[serde(default = "default_general")]
    pub general: GeneralConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeneralConfig {
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,
    /// Shard catalog; defaults to `<storage_dir>/shards.toml`.
    #[serde(default)]
    pub catalog: Option<PathBuf>,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

/// How the sandbox runner should obtain its privileges.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PrivilegeOverride {
    #[default]
    Auto,
    Unprivileged,
    Privileged,
}

impl std::str::FromStr for PrivilegeOverride {
    type Err = DrydockError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "auto" => Ok(Self::Auto),
            "unprivileged" | "userns" => Ok(Self::Unprivileged),
            "privileged" => Ok(Self::Privileged),
            other => Err(DrydockError::ConfigError(format!(
                "unknown runner mode '{}' (expected auto, privileged or unprivileged)",
                other
            ))),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SandboxConfig {
    #[serde(default)]
    pub runner: PrivilegeOverride,
    #[serde(default)]
    pub allow_ecryptfs: bool,
    #[serde(default)]
    pub use_squashfs: bool,
    #[serde(default)]
    pub use_ccache: bool,
    #[serde(default)]
    pub ccache_dir: Option<PathBuf>,
    /// Triplet of the toolchain that runs build-side tools.
    #[serde(default = "default_bootstrap")]
    pub bootstrap: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NetworkConfig {
    #[serde(default = "default_timeout")]
    pub download_timeout: u64,
}

fn default_general() -> GeneralConfig {
    let uid = nix::unistd::getuid();
    let use_xdg = !uid.is_root();

    GeneralConfig {
        storage_dir: if use_xdg {
            get_xdg_cache().unwrap_or_else(default_storage_dir)
        } else {
            default_storage_dir()
        },
        catalog: None,
        log_dir: if use_xdg {
            get_xdg_state().unwrap_or_else(default_log_dir)
        } else {
            default_log_dir()
        },
    }
}

fn get_xdg_cache() -> Option<PathBuf> {
    std::env::var("XDG_CACHE_HOME")
        .map(PathBuf::from)
        .ok()
        .or_else(|| {
            std::env::var("HOME")
                .map(|h| PathBuf::from(h).join(".cache"))
                .ok()
        })
        .map(|p| p.join("drydock"))
}

fn get_xdg_state() -> Option<PathBuf> {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .ok()
        .or_else(|| {
            std::env::var("HOME")
                .map(|h| PathBuf::from(h).join(".local/state"))
                .ok()
        })
        .map(|p| p.join("drydock"))
}

fn get_xdg_config() -> Option<PathBuf> {
    if nix::unistd::getuid().is_root() {
        return None;
    }

    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .ok()
        .or_else(|| {
            std::env::var("HOME")
                .map(|h| PathBuf::from(h).join(".config"))
                .ok()
        })
        .map(|p| p.join("drydock/drydock.toml"))
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("/var/cache/drydock")
}
fn default_log_dir() -> PathBuf {
    PathBuf::from("/var/log/drydock")
}
fn default_bootstrap() -> String {
    "x86_64-linux-gnu".to_string()
}
fn default_timeout() -> u64 {
    300
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            general: default_general(),
            sandbox: SandboxConfig::default(),
            network: NetworkConfig::default(),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            runner: PrivilegeOverride::Auto,
            allow_ecryptfs: false,
            use_squashfs: false,
            use_ccache: false,
            ccache_dir: None,
            bootstrap: default_bootstrap(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            download_timeout: default_timeout(),
        }
    }
}

/// Recursively merge two TOML values. For tables, overlay keys win;
/// missing keys are inherited from base. All other types (scalars, arrays)
/// are replaced wholesale by the overlay value.
fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    use toml::Value;
    match (base, overlay) {
        (Value::Table(mut base_map), Value::Table(overlay_map)) => {
            for (k, v) in overlay_map {
                let merged = if let Some(base_v) = base_map.remove(&k) {
                    merge_toml(base_v, v)
                } else {
                    v
                };
                base_map.insert(k, merged);
            }
            Value::Table(base_map)
        }
        (_, overlay) => overlay,
    }
}

fn load_toml_file(path: &Path) -> Result<toml::Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        DrydockError::ConfigError(format!("failed to read {}: {}", path.display(), e))
    })?;
    Ok(toml::from_str(&content)?)
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

impl GlobalConfig {
    /// Load configuration with layered merging.
    ///
    /// An explicit `path` is loaded on its own. Otherwise the layers are
    /// merged lowest priority first:
    ///
    ///   1. `/etc/drydock/drydock.toml`
    ///   2. `$XDG_CONFIG_HOME/drydock/drydock.toml` (non-root only)
    ///   3. `./drydock.toml`
    ///
    /// Missing layers are skipped; with none present the defaults apply.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(p) = path {
            if !p.exists() {
                return Err(DrydockError::ConfigError(format!(
                    "config file not found: {}",
                    p.display()
                )));
            }
            let val = load_toml_file(p)?;
            return Ok(GlobalConfig::deserialize(val)?);
        }

        let mut layers: Vec<PathBuf> = vec![PathBuf::from("/etc/drydock/drydock.toml")];
        if let Some(xdg) = get_xdg_config() {
            layers.push(xdg);
        }
        layers.push(PathBuf::from("./drydock.toml"));

        let mut merged: Option<toml::Value> = None;
        for layer_path in &layers {
            if layer_path.exists() {
                let val = load_toml_file(layer_path)?;
                merged = Some(match merged {
                    Some(base) => merge_toml(base, val),
                    None => val,
                });
            }
        }

        match merged {
            None => Ok(Self::default()),
            Some(val) => Ok(GlobalConfig::deserialize(val)?),
        }
    }

    /// Overlay the `DRYDOCK_*` environment variables on top of the file
    /// configuration. Takes the variables explicitly so callers decide
    /// when the environment is sampled.
    pub fn apply_env<I, K, V>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let value = value.as_ref();
            match key.as_ref() {
                ENV_RUNNER => self.sandbox.runner = value.parse()?,
                ENV_ALLOW_ECRYPTFS => self.sandbox.allow_ecryptfs = parse_flag(value),
                ENV_USE_CCACHE => self.sandbox.use_ccache = parse_flag(value),
                ENV_USE_SQUASHFS => self.sandbox.use_squashfs = parse_flag(value),
                ENV_STORAGE_DIR if !value.is_empty() => {
                    self.general.storage_dir = PathBuf::from(value)
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.general
            .catalog
            .clone()
            .unwrap_or_else(|| self.general.storage_dir.join("shards.toml"))
    }

    pub fn ccache_dir(&self) -> PathBuf {
        self.sandbox
            .ccache_dir
            .clone()
            .unwrap_or_else(|| self.general.storage_dir.join("ccache"))
    }

    /// Where a build for `platform` logs when the caller names no file.
    pub fn default_log_path(&self, platform: &Platform) -> PathBuf {
        self.general.log_dir.join(format!("{}.log", platform.triplet()))
    }

    pub fn bootstrap_platform(&self) -> Result<Platform> {
        self.sandbox.bootstrap.parse().map_err(|e| {
            DrydockError::ConfigError(format!("invalid bootstrap triplet: {}", e))
        })
    }
}
