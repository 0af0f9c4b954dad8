//! Local shard storage: selection from the catalog, download, checksum
//! verification, and unpacking or loop-mounting under the storage dir.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::config::GlobalConfig;
use crate::error::{DrydockError, Result, ShardStage};
use crate::mounts::MountTable;
use crate::platform::{Os, Platform};
use crate::privilege::Escalation;
use crate::shard::catalog::ShardCatalog;
use crate::shard::{Shard, ShardFormat, ShardKind, ShardResolver};
use crate::util::{checksum, compress, download};

/// Written into an unpacked shard once extraction completes.
const STAMP: &str = ".drydock-shard";

pub struct ShardStore {
    storage_dir: PathBuf,
    catalog: ShardCatalog,
    bootstrap: Platform,
    format: ShardFormat,
    download_timeout: u64,
    escalation: Escalation,
}

impl ShardStore {
    pub fn new(
        storage_dir: impl Into<PathBuf>,
        catalog: ShardCatalog,
        bootstrap: Platform,
        use_squashfs: bool,
        escalation: Escalation,
    ) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            catalog,
            bootstrap,
            format: if use_squashfs { ShardFormat::Squashfs } else { ShardFormat::Unpacked },
            download_timeout: 300,
            escalation,
        }
    }

    /// Open the store described by `config`, reading its catalog.
    pub fn open(config: &GlobalConfig, escalation: Escalation) -> Result<Self> {
        let catalog = ShardCatalog::load(&config.catalog_path())?;
        let mut store = Self::new(
            &config.general.storage_dir,
            catalog,
            config.bootstrap_platform()?,
            config.sandbox.use_squashfs,
            escalation,
        );
        store.download_timeout = config.network.download_timeout;
        Ok(store)
    }

    fn lookup(&self, kind: ShardKind, platform: &Platform) -> Option<Shard> {
        let triplet = platform.triplet();
        self.catalog
            .find(kind, &triplet, self.format)
            .map(|e| ShardCatalog::to_shard(e, &self.storage_dir))
    }

    fn require(&self, kind: ShardKind, platform: &Platform) -> Result<Shard> {
        self.lookup(kind, platform).ok_or_else(|| {
            DrydockError::shard(
                format!("{:?}/{}", kind, platform).to_lowercase(),
                ShardStage::Select,
                "no such shard in the catalog",
            )
        })
    }

    fn is_unpacked(&self, shard: &Shard) -> bool {
        std::fs::read_to_string(shard.mount_path().join(STAMP))
            .map(|s| s.trim() == shard.sha256)
            .unwrap_or(false)
    }

    fn is_mounted(&self, shard: &Shard) -> bool {
        MountTable::read()
            .map(|t| t.is_mountpoint(&shard.mount_path()))
            .unwrap_or(false)
    }

    /// Download the shard archive unless a verified copy is already cached.
    fn fetch(&self, shard: &Shard, verbose: bool) -> Result<PathBuf> {
        let archive = shard.archive_path();
        if checksum::matches(&archive, &shard.sha256) {
            debug!("Shard archive {} already cached and verified", archive.display());
            return Ok(archive);
        }
        if archive.exists() {
            warn!("Cached archive {} is corrupted, re-downloading", archive.display());
            let _ = std::fs::remove_file(&archive);
        }

        info!("Fetching shard {} from {}", shard.id(), shard.url);
        download::download_file(&shard.url, &archive, self.download_timeout, verbose)
            .map_err(|e| DrydockError::shard(shard.id(), ShardStage::Download, e.to_string()))?;

        let actual = checksum::sha256_file(&archive)
            .map_err(|e| DrydockError::shard(shard.id(), ShardStage::Verify, e.to_string()))?;
        if actual != shard.sha256 {
            let _ = std::fs::remove_file(&archive);
            return Err(DrydockError::shard(
                shard.id(),
                ShardStage::Verify,
                format!("sha256 mismatch: expected {}, got {}", shard.sha256, actual),
            ));
        }
        Ok(archive)
    }

    fn unpack(&self, shard: &Shard, archive: &Path) -> Result<()> {
        let mount_path = shard.mount_path();
        let fail = |e: String| DrydockError::shard(shard.id(), ShardStage::Mount, e);
        let parent = mount_path
            .parent()
            .ok_or_else(|| fail("mount path has no parent".to_string()))?;
        std::fs::create_dir_all(parent).map_err(|e| fail(e.to_string()))?;

        // Unpack beside the final location and rename, so a crash never
        // leaves a half-extracted tree behind a valid-looking path.
        let staging = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(parent)
            .map_err(|e| fail(e.to_string()))?;
        let tree = staging.path().join("tree");
        std::fs::create_dir(&tree).map_err(|e| fail(e.to_string()))?;
        compress::extract_archive(archive, &tree).map_err(|e| fail(e.to_string()))?;
        std::fs::write(tree.join(STAMP), &shard.sha256).map_err(|e| fail(e.to_string()))?;

        if mount_path.exists() {
            std::fs::remove_dir_all(&mount_path).map_err(|e| fail(e.to_string()))?;
        }
        std::fs::rename(&tree, &mount_path).map_err(|e| fail(e.to_string()))?;
        info!("Unpacked shard {} to {}", shard.id(), mount_path.display());
        Ok(())
    }

    fn mount(&self, shard: &Shard, archive: &Path) -> Result<()> {
        let mount_path = shard.mount_path();
        let fail = |e: String| DrydockError::shard(shard.id(), ShardStage::Mount, e);
        std::fs::create_dir_all(&mount_path).map_err(|e| fail(e.to_string()))?;

        let mut cmd = self.escalation.command(
            "mount",
            &[
                std::ffi::OsStr::new("-o"),
                std::ffi::OsStr::new("ro,loop"),
                archive.as_os_str(),
                mount_path.as_os_str(),
            ],
        );
        debug!("Mounting shard: {:?}", cmd);
        let output = cmd
            .output()
            .map_err(|e| fail(format!("failed to run mount: {}", e)))?;
        if !output.status.success() {
            return Err(fail(format!(
                "mount exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        info!("Mounted shard {} at {}", shard.id(), mount_path.display());
        Ok(())
    }
}

impl ShardResolver for ShardStore {
    fn choose_shards(&self, platform: &Platform) -> Result<Vec<Shard>> {
        let mut shards = vec![
            self.require(ShardKind::Rootfs, &self.bootstrap)?,
            self.require(ShardKind::Toolchain, platform)?,
        ];

        // Build-side tools always expect the bootstrap toolchain at its
        // fixed location, whatever the target is.
        let bootstrap = self.require(ShardKind::Toolchain, &self.bootstrap)?;
        if !shards.iter().any(|s| s.id() == bootstrap.id()) {
            shards.push(bootstrap);
        }

        if platform.os == Os::MacOS {
            if let Some(sdk) = self.lookup(ShardKind::Sdk, platform) {
                shards.push(sdk);
            }
        }
        Ok(shards)
    }

    fn prepare_shard(&self, shard: &Shard, verbose: bool) -> Result<()> {
        let ready = match shard.format {
            ShardFormat::Unpacked => self.is_unpacked(shard),
            ShardFormat::Squashfs => self.is_mounted(shard),
        };
        if ready {
            debug!("Shard {} already prepared", shard.id());
            return Ok(());
        }

        let archive = self.fetch(shard, verbose)?;
        match shard.format {
            ShardFormat::Unpacked => self.unpack(shard, &archive),
            ShardFormat::Squashfs => self.mount(shard, &archive),
        }
    }
}
