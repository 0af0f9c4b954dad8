pub mod interactive;

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::collector::OutputCollector;
use crate::context::Context;
use crate::error::{DrydockError, Result, ShardStage};
use crate::platform::Platform;
use crate::privilege::{Escalation, PrivilegeMode};
use crate::sandbox::{SandboxCommandBuilder, SandboxInvocation, WorkspaceMapping, WORKSPACE_MOUNT};
use crate::shard::ShardKind;

pub use interactive::{shared_buffer, InteractiveIo, IoTarget, SharedBuffer};

/// Container path of the compiler cache when ccache is enabled.
pub const CCACHE_MOUNT: &str = "/root/.ccache";

/// Caller-supplied knobs for a runner.
#[derive(Debug, Clone, Default)]
pub struct RunnerOptions {
    /// Target platform; the bootstrap platform when unset.
    pub platform: Option<Platform>,
    /// Extra read-write mappings, applied after the workspace root.
    pub extra_mappings: Vec<WorkspaceMapping>,
    /// Working directory inside the container.
    pub cwd: Option<PathBuf>,
    /// Pass `--verbose` to the launcher and show shard download progress.
    pub verbose: bool,
    /// Environment entries layered over the target defaults.
    pub env: BTreeMap<String, String>,
}

/// Runs commands inside a fixed sandbox. Calls are sequential; a runner
/// never has two commands in flight.
pub trait Runner {
    fn platform(&self) -> &Platform;

    fn invocation(&self) -> &SandboxInvocation;

    fn env(&self) -> &BTreeMap<String, String>;

    fn privilege(&self) -> PrivilegeMode;

    /// Run `command` to completion, capturing its output. When `log_path`
    /// is given and non-empty the log is written whether or not the
    /// command succeeded.
    /// A failing command is `Ok(false)`; errors are reserved for problems
    /// with the environment itself.
    fn run(
        &self,
        command: &[String],
        log_path: Option<&Path>,
        verbose: bool,
        tee: Option<Box<dyn Write + Send>>,
    ) -> Result<bool> {
        let line = self.invocation().command_line(command, self.env());
        let mut collector = OutputCollector::start(self.invocation(), command, self.env(), verbose, tee)?;
        let success = collector.wait()?;
        if let Some(path) = log_path.filter(|p| !p.as_os_str().is_empty()) {
            write_log(path, &line, collector.merged_bytes())?;
        }
        Ok(success)
    }

    /// Run `command` attached to the given streams.
    fn run_interactive(&self, command: &[String], io: InteractiveIo) -> Result<bool> {
        interactive::run_interactive(self.invocation(), command, self.env(), io)
    }
}

/// Sandbox launched directly, relying on unprivileged user namespaces.
#[derive(Debug, Clone)]
pub struct UserNsRunner {
    platform: Platform,
    invocation: SandboxInvocation,
    env: BTreeMap<String, String>,
}

impl Runner for UserNsRunner {
    fn platform(&self) -> &Platform {
        &self.platform
    }

    fn invocation(&self) -> &SandboxInvocation {
        &self.invocation
    }

    fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    fn privilege(&self) -> PrivilegeMode {
        PrivilegeMode::Unprivileged
    }
}

/// Sandbox launched as root through sudo or su.
#[derive(Debug, Clone)]
pub struct PrivilegedRunner {
    platform: Platform,
    invocation: SandboxInvocation,
    env: BTreeMap<String, String>,
}

impl PrivilegedRunner {
    fn new(
        platform: Platform,
        invocation: SandboxInvocation,
        env: BTreeMap<String, String>,
        escalation: &Escalation,
    ) -> Self {
        if escalation.is_none() {
            debug!("Already running as root; no escalation prefix needed");
        }
        Self {
            platform,
            invocation: invocation.with_escalation(escalation.clone()),
            env,
        }
    }
}

impl Runner for PrivilegedRunner {
    fn platform(&self) -> &Platform {
        &self.platform
    }

    fn invocation(&self) -> &SandboxInvocation {
        &self.invocation
    }

    fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    fn privilege(&self) -> PrivilegeMode {
        PrivilegeMode::Privileged
    }
}

fn write_log(path: &Path, command_line: &str, output: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| {
            DrydockError::EnvironmentError(format!(
                "failed to create log directory {}: {}",
                parent.display(),
                e
            ))
        })?;
    }
    let mut content = Vec::with_capacity(command_line.len() + 1 + output.len());
    content.extend_from_slice(command_line.as_bytes());
    content.push(b'\n');
    content.extend_from_slice(output);
    std::fs::write(path, content).map_err(|e| {
        DrydockError::EnvironmentError(format!("failed to write log {}: {}", path.display(), e))
    })
}

/// Default environment of a contained build for `platform`.
pub fn target_environment(
    platform: &Platform,
    bootstrap: &Platform,
    use_ccache: bool,
    overlay: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let target = platform.triplet();
    let machtype = bootstrap.triplet();

    let mut path = vec![format!("/opt/{}/bin", target)];
    if machtype != target {
        path.push(format!("/opt/{}/bin", machtype));
    }
    path.extend(
        ["/usr/local/sbin", "/usr/local/bin", "/usr/sbin", "/usr/bin", "/sbin", "/bin"]
            .iter()
            .map(|s| s.to_string()),
    );

    let nproc = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);

    let mut env = BTreeMap::new();
    env.insert("PATH".to_string(), path.join(":"));
    env.insert("HOME".to_string(), "/root".to_string());
    env.insert("TERM".to_string(), "xterm".to_string());
    env.insert("WORKSPACE".to_string(), WORKSPACE_MOUNT.to_string());
    env.insert("prefix".to_string(), format!("{}/destdir", WORKSPACE_MOUNT));
    env.insert("target".to_string(), target);
    env.insert("MACHTYPE".to_string(), machtype);
    env.insert("nproc".to_string(), nproc.to_string());
    if use_ccache {
        env.insert("USE_CCACHE".to_string(), "true".to_string());
        env.insert("CCACHE_DIR".to_string(), CCACHE_MOUNT.to_string());
    }
    for (k, v) in overlay {
        env.insert(k.clone(), v.clone());
    }
    env
}

/// Construct a runner for `workspace_root`.
///
/// Checks the workspace and shard storage against encrypted mounts,
/// prepares every shard the target needs, composes the launcher
/// invocation and picks the runner variant from the privilege policy.
/// No runner is returned if any of those steps fails.
pub fn new_runner(
    ctx: &Context,
    workspace_root: &Path,
    options: RunnerOptions,
) -> Result<Box<dyn Runner>> {
    let config = ctx.config();
    let bootstrap = config.bootstrap_platform()?;
    let platform = options.platform.unwrap_or(bootstrap);
    let workspace_root = std::path::absolute(workspace_root)?;
    let storage_dir = config.general.storage_dir.clone();

    ctx.guard().check_all(&[&workspace_root, &storage_dir])?;

    let resolver = ctx.resolver();
    let shards = resolver.choose_shards(&platform)?;
    let rootfs = match shards.first() {
        Some(s) if s.kind == ShardKind::Rootfs => s.clone(),
        _ => {
            return Err(DrydockError::shard(
                platform.triplet(),
                ShardStage::Select,
                "resolver did not return a root shard first",
            ))
        }
    };
    for shard in &shards {
        resolver.prepare_shard(shard, options.verbose)?;
    }

    let mut mappings = vec![WorkspaceMapping::new(&workspace_root, WORKSPACE_MOUNT)];
    if config.sandbox.use_ccache {
        let ccache_dir = config.ccache_dir();
        std::fs::create_dir_all(&ccache_dir).map_err(|e| {
            DrydockError::EnvironmentError(format!(
                "failed to create ccache directory {}: {}",
                ccache_dir.display(),
                e
            ))
        })?;
        mappings.push(WorkspaceMapping::new(ccache_dir, CCACHE_MOUNT));
    }
    mappings.extend(options.extra_mappings);

    let mut builder = SandboxCommandBuilder::new(rootfs.mount_path())
        .workspaces(mappings)
        .cwd(options.cwd)
        .verbose(options.verbose);
    for shard in &shards[1..] {
        if let Some(target) = shard.mount_target() {
            builder = builder.map(shard.mount_path(), target);
        }
    }
    let invocation = builder.build();
    let env = target_environment(&platform, &bootstrap, config.sandbox.use_ccache, &options.env);

    let runner: Box<dyn Runner> = match ctx.policy().resolve() {
        PrivilegeMode::Unprivileged => Box::new(UserNsRunner { platform, invocation, env }),
        PrivilegeMode::Privileged => Box::new(PrivilegedRunner::new(
            platform,
            invocation,
            env,
            ctx.escalation(),
        )),
    };
    info!(
        "Runner ready for {} ({:?}) over {}",
        platform,
        runner.privilege(),
        workspace_root.display()
    );
    Ok(runner)
}
