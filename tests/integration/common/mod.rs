#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use drydock::config::{GlobalConfig, PrivilegeOverride};
use drydock::context::Context;
use drydock::error::Result;
use drydock::mounts::MountGuard;
use drydock::platform::Platform;
use drydock::privilege::{Escalation, PrivilegePolicy, UsernsProbe};
use drydock::shard::{Shard, ShardFormat, ShardKind, ShardResolver};

/// Stands in for the real launcher: skips its own flags and execs the
/// contained command directly on the host. Like the real one it gets
/// chatty on stderr under `--verbose`.
pub const FAKE_LAUNCHER: &str = r#"#!/bin/sh
while [ $# -gt 0 ]; do
    case "$1" in
        --) shift; break ;;
        --verbose) echo "sandbox: parsed flags" >&2; shift ;;
        *) shift 2 ;;
    esac
done
exec "$@"
"#;

/// Launcher that runs the command but adds a warning of its own.
pub const NOISY_LAUNCHER: &str = r#"#!/bin/sh
while [ $# -gt 0 ]; do
    case "$1" in
        --) shift; break ;;
        --verbose) shift ;;
        *) shift 2 ;;
    esac
done
echo "sandbox: user namespaces restricted, continuing" >&2
exec "$@"
"#;

/// Launcher on a kernel without user namespaces.
pub const FAILING_LAUNCHER: &str = r#"#!/bin/sh
echo "sandbox: unshare: Operation not permitted" >&2
exit 1
"#;

const HASH: &str = "1111111111111111111111111111111111111111111111111111111111111111";

/// Resolver over a single locally built rootfs shard.
pub struct FakeResolver {
    storage_dir: PathBuf,
    launcher: &'static str,
    with_rootfs: bool,
    pub prepared: AtomicUsize,
}

impl FakeResolver {
    pub fn new(storage_dir: &Path) -> Self {
        Self::with_launcher(storage_dir, FAKE_LAUNCHER)
    }

    pub fn with_launcher(storage_dir: &Path, launcher: &'static str) -> Self {
        Self {
            storage_dir: storage_dir.to_path_buf(),
            launcher,
            with_rootfs: true,
            prepared: AtomicUsize::new(0),
        }
    }

    /// A catalog that only publishes toolchains.
    pub fn without_rootfs(storage_dir: &Path) -> Self {
        Self {
            with_rootfs: false,
            ..Self::new(storage_dir)
        }
    }

    fn shard(&self, kind: ShardKind, triplet: String) -> Shard {
        Shard {
            name: format!("{:?}", kind).to_lowercase(),
            version: "1.0".to_string(),
            kind,
            triplet,
            format: ShardFormat::Unpacked,
            url: "file:///dev/null".to_string(),
            sha256: HASH.to_string(),
            storage_dir: self.storage_dir.clone(),
        }
    }
}

impl ShardResolver for FakeResolver {
    fn choose_shards(&self, platform: &Platform) -> Result<Vec<Shard>> {
        let mut shards = Vec::new();
        if self.with_rootfs {
            shards.push(self.shard(ShardKind::Rootfs, "x86_64-linux-gnu".to_string()));
        }
        shards.push(self.shard(ShardKind::Toolchain, platform.triplet()));
        Ok(shards)
    }

    fn prepare_shard(&self, shard: &Shard, _verbose: bool) -> Result<()> {
        self.prepared.fetch_add(1, Ordering::SeqCst);
        let root = shard.mount_path();
        std::fs::create_dir_all(&root)?;
        if shard.kind == ShardKind::Rootfs {
            let launcher = root.join("sandbox");
            if !launcher.exists() {
                std::fs::write(&launcher, self.launcher)?;
                std::fs::set_permissions(&launcher, std::fs::Permissions::from_mode(0o755))?;
            }
        }
        Ok(())
    }
}

pub struct CountingProbe {
    pub calls: Arc<AtomicUsize>,
    pub result: bool,
}

impl UsernsProbe for CountingProbe {
    fn probe(&self) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.result
    }
}

pub struct Fixture {
    pub storage: tempfile::TempDir,
    pub workspace: tempfile::TempDir,
    pub probe_calls: Arc<AtomicUsize>,
}

impl Fixture {
    pub fn new() -> Self {
        Self {
            storage: tempfile::tempdir().unwrap(),
            workspace: tempfile::tempdir().unwrap(),
            probe_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn config(&self) -> GlobalConfig {
        let mut config = GlobalConfig::default();
        config.general.storage_dir = self.storage.path().to_path_buf();
        config.sandbox.bootstrap = "x86_64-linux-gnu".to_string();
        config.sandbox.use_ccache = false;
        config
    }

    pub fn context(&self, forced: PrivilegeOverride, escalation: Escalation) -> Context {
        self.context_with(self.config(), forced, escalation)
    }

    pub fn context_with(
        &self,
        config: GlobalConfig,
        forced: PrivilegeOverride,
        escalation: Escalation,
    ) -> Context {
        let probe = CountingProbe {
            calls: self.probe_calls.clone(),
            result: true,
        };
        let policy = PrivilegePolicy::new(forced, Box::new(probe));
        let resolver = Arc::new(FakeResolver::new(self.storage.path()));
        Context::with_parts(config, resolver, policy, escalation)
            .with_guard(MountGuard::with_table(None, false))
    }
}
