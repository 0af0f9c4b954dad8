//! Process-wide decision of whether unprivileged user-namespace containers
//! work on this host.
//!
//! The decision is made at most once per `PrivilegePolicy`: once a caller
//! has started typing a sudo password it would be surprising for the next
//! runner to silently go back to user namespaces, so the probe result is
//! cached for the policy's lifetime and never refreshed.

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::path::PathBuf;
use std::process::Command;
use std::sync::{Arc, OnceLock};

use tracing::{debug, warn};

use crate::collector::OutputCollector;
use crate::config::{GlobalConfig, PrivilegeOverride};
use crate::mounts::MountGuard;
use crate::sandbox::{SandboxCommandBuilder, WorkspaceMapping, WORKSPACE_MOUNT};
use crate::shard::{ShardKind, ShardResolver};
use crate::util::quote;

const PROBE_SENTINEL: &str = "hello drydock";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivilegeMode {
    /// User-namespace container, no elevation.
    Unprivileged,
    /// Launcher runs as root through an escalation command.
    Privileged,
}

/// How to become root for privileged execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Escalation {
    /// Already root, or elevation not wanted.
    None,
    Sudo(PathBuf),
    /// Fallback: `su root -c "<string>"`. su resets the environment, so
    /// variables are re-injected through `env(1)` in the command string;
    /// anything the launcher reads from its own environment before that
    /// point is lost.
    Su(PathBuf),
}

impl Escalation {
    pub fn detect() -> Self {
        if nix::unistd::geteuid().is_root() {
            return Self::None;
        }
        if let Ok(sudo) = which::which("sudo") {
            return Self::Sudo(sudo);
        }
        let su = which::which("su").unwrap_or_else(|_| PathBuf::from("/bin/su"));
        Self::Su(su)
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Prefix `inner` (program first) so that it runs as root, keeping the
    /// variables in `env` visible to it.
    pub fn wrap(&self, inner: Vec<OsString>, env: &BTreeMap<String, String>) -> Vec<OsString> {
        match self {
            Self::None => inner,
            Self::Sudo(sudo) => {
                let mut argv = vec![sudo.as_os_str().to_os_string()];
                if !env.is_empty() {
                    let keys = env.keys().cloned().collect::<Vec<_>>().join(",");
                    argv.push(format!("--preserve-env={}", keys).into());
                }
                argv.extend(inner);
                argv
            }
            Self::Su(su) => {
                let mut script = OsString::new();
                if !env.is_empty() {
                    script.push("env");
                    for (k, v) in env {
                        script.push(" ");
                        script.push(quote::quote_os(OsStr::new(&format!("{}={}", k, v))));
                    }
                    script.push(" ");
                }
                script.push(quote::join_os(&inner));
                vec![
                    su.as_os_str().to_os_string(),
                    "root".into(),
                    "-c".into(),
                    script,
                ]
            }
        }
    }

    /// A root `Command` for a host-side helper such as `mount`.
    pub fn command<S: AsRef<OsStr>>(&self, program: &str, args: &[S]) -> Command {
        let mut inner: Vec<OsString> = vec![program.into()];
        inner.extend(args.iter().map(|a| a.as_ref().to_os_string()));
        let argv = self.wrap(inner, &BTreeMap::new());
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd
    }
}

/// Decides whether unprivileged containers work. Implemented by the real
/// sandbox probe and by test doubles.
pub trait UsernsProbe: Send + Sync {
    fn probe(&self) -> bool;
}

pub struct PrivilegePolicy {
    forced: PrivilegeOverride,
    mode: OnceLock<PrivilegeMode>,
    probe: Box<dyn UsernsProbe>,
}

impl PrivilegePolicy {
    pub fn new(forced: PrivilegeOverride, probe: Box<dyn UsernsProbe>) -> Self {
        Self {
            forced,
            mode: OnceLock::new(),
            probe,
        }
    }

    /// The effective mode, probing on first use when not forced.
    pub fn resolve(&self) -> PrivilegeMode {
        match self.forced {
            PrivilegeOverride::Unprivileged => return PrivilegeMode::Unprivileged,
            PrivilegeOverride::Privileged => return PrivilegeMode::Privileged,
            PrivilegeOverride::Auto => {}
        }
        *self.mode.get_or_init(|| {
            if self.probe.probe() {
                debug!("Unprivileged user namespace containers are available");
                PrivilegeMode::Unprivileged
            } else {
                warn!(
                    "This kernel cannot run unprivileged user namespace containers; \
                     falling back to privileged execution. You may be asked for your \
                     password once per session. Set DRYDOCK_RUNNER=privileged to skip this probe."
                );
                PrivilegeMode::Privileged
            }
        })
    }

    /// The cached probe outcome, if the probe has run.
    pub fn resolved(&self) -> Option<PrivilegeMode> {
        self.mode.get().copied()
    }
}

/// Launch the root shard's sandbox unprivileged with a trivial command and
/// check that it echoes back exactly what it was asked to.
///
/// `verbose` only echoes the captured output live; the launcher itself is
/// kept quiet so its diagnostics cannot spoil the comparison.
pub fn probe_unprivileged_containers(
    resolver: &dyn ShardResolver,
    config: &GlobalConfig,
    guard: &MountGuard,
    verbose: bool,
) -> bool {
    let bootstrap = match config.bootstrap_platform() {
        Ok(p) => p,
        Err(e) => {
            debug!("Probe skipped: {}", e);
            return false;
        }
    };
    let rootfs = match resolver.choose_shards(&bootstrap) {
        Ok(shards) => match shards.into_iter().find(|s| s.kind == ShardKind::Rootfs) {
            Some(s) => s,
            None => {
                debug!("Probe skipped: no root shard for {}", bootstrap);
                return false;
            }
        },
        Err(e) => {
            debug!("Probe skipped: {}", e);
            return false;
        }
    };
    if let Err(e) = resolver.prepare_shard(&rootfs, verbose) {
        debug!("Probe skipped: {}", e);
        return false;
    }

    let storage_dir = &config.general.storage_dir;
    if let Err(e) = std::fs::create_dir_all(storage_dir) {
        debug!("Probe skipped: cannot create {}: {}", storage_dir.display(), e);
        return false;
    }
    let scratch = match tempfile::Builder::new()
        .prefix("probe-")
        .tempdir_in(storage_dir)
    {
        Ok(dir) => dir,
        Err(e) => {
            debug!("Probe skipped: scratch dir: {}", e);
            return false;
        }
    };
    if let Err(e) = guard.check_encryption(scratch.path()) {
        debug!("Probe skipped: {}", e);
        return false;
    }

    let invocation = SandboxCommandBuilder::new(rootfs.mount_path())
        .workspace(WorkspaceMapping::new(scratch.path(), WORKSPACE_MOUNT))
        .build();

    let mut env = BTreeMap::new();
    env.insert("PATH".to_string(), "/usr/bin:/bin".to_string());
    let command = [
        "/bin/sh".to_string(),
        "-c".to_string(),
        format!("echo {}", PROBE_SENTINEL),
    ];

    let mut collector = match OutputCollector::start(&invocation, &command, &env, verbose, None) {
        Ok(c) => c,
        Err(e) => {
            debug!("Probe launch failed: {}", e);
            return false;
        }
    };
    let success = collector.wait().unwrap_or(false);
    let output = collector.merged_output();
    debug!("Probe exit success={} output={:?}", success, output);
    success && output == format!("{}\n", PROBE_SENTINEL)
}

/// The production probe: runs the sandbox from the shard store.
pub struct SandboxProbe {
    resolver: Arc<dyn ShardResolver>,
    config: GlobalConfig,
    guard: MountGuard,
    verbose: bool,
}

impl SandboxProbe {
    pub fn new(
        resolver: Arc<dyn ShardResolver>,
        config: GlobalConfig,
        guard: MountGuard,
        verbose: bool,
    ) -> Self {
        Self { resolver, config, guard, verbose }
    }
}

impl UsernsProbe for SandboxProbe {
    fn probe(&self) -> bool {
        probe_unprivileged_containers(self.resolver.as_ref(), &self.config, &self.guard, self.verbose)
    }
}
