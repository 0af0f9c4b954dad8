//! Construction of the sandbox launcher invocation.
//!
//! The launcher binary ships inside the root shard and takes a small set
//! of flags. Later flags of the same kind take priority inside the
//! launcher, so the emission order here is part of its contract:
//!
//! ```text
//! --verbose? --rootfs <root> --cd <dir>? --workspace <host>:<ctr>... --map <src>:<dst>...
//! ```
//!
//! Flags are accumulated as structured values and only turned into an
//! argument vector at the process boundary; nothing here goes through a
//! shell unless the `su` escalation path asks for it.

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::privilege::Escalation;
use crate::util::quote;

/// Name of the launcher binary inside the root shard.
pub const LAUNCHER: &str = "sandbox";

/// Where the caller's build root appears inside the container.
pub const WORKSPACE_MOUNT: &str = "/workspace";

/// Separates launcher flags from the contained command.
const SEPARATOR: &str = "--";

/// A read-write bind of a host directory into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceMapping {
    pub host: PathBuf,
    pub container: PathBuf,
}

impl WorkspaceMapping {
    pub fn new(host: impl Into<PathBuf>, container: impl Into<PathBuf>) -> Self {
        Self { host: host.into(), container: container.into() }
    }
}

/// A read-only auxiliary shard mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuxMount {
    pub source: PathBuf,
    pub target: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SandboxFlag {
    Verbose,
    Rootfs(PathBuf),
    Cd(PathBuf),
    Workspace(WorkspaceMapping),
    Map(AuxMount),
}

fn pair(a: &Path, b: &Path) -> OsString {
    let mut s = a.as_os_str().to_os_string();
    s.push(":");
    s.push(b.as_os_str());
    s
}

impl SandboxFlag {
    fn push_args(&self, out: &mut Vec<OsString>) {
        match self {
            Self::Verbose => out.push("--verbose".into()),
            Self::Rootfs(root) => {
                out.push("--rootfs".into());
                out.push(root.as_os_str().to_os_string());
            }
            Self::Cd(dir) => {
                out.push("--cd".into());
                out.push(dir.as_os_str().to_os_string());
            }
            Self::Workspace(m) => {
                out.push("--workspace".into());
                out.push(pair(&m.host, &m.container));
            }
            Self::Map(m) => {
                out.push("--map".into());
                out.push(pair(&m.source, &m.target));
            }
        }
    }
}

/// Accumulates the pieces of a launcher invocation. Building is pure:
/// no filesystem access and no environment lookups.
#[derive(Debug, Clone)]
pub struct SandboxCommandBuilder {
    rootfs: PathBuf,
    aux: Vec<AuxMount>,
    workspaces: Vec<WorkspaceMapping>,
    cwd: Option<PathBuf>,
    verbose: bool,
}

impl SandboxCommandBuilder {
    pub fn new(rootfs: impl Into<PathBuf>) -> Self {
        Self {
            rootfs: rootfs.into(),
            aux: Vec::new(),
            workspaces: Vec::new(),
            cwd: None,
            verbose: false,
        }
    }

    pub fn workspace(mut self, mapping: WorkspaceMapping) -> Self {
        self.workspaces.push(mapping);
        self
    }

    pub fn workspaces(mut self, mappings: impl IntoIterator<Item = WorkspaceMapping>) -> Self {
        self.workspaces.extend(mappings);
        self
    }

    pub fn map(mut self, source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        self.aux.push(AuxMount { source: source.into(), target: target.into() });
        self
    }

    pub fn cwd(mut self, dir: Option<PathBuf>) -> Self {
        self.cwd = dir;
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    fn flags(&self) -> Vec<SandboxFlag> {
        let mut flags = Vec::new();
        if self.verbose {
            flags.push(SandboxFlag::Verbose);
        }
        flags.push(SandboxFlag::Rootfs(self.rootfs.clone()));
        if let Some(ref cwd) = self.cwd {
            flags.push(SandboxFlag::Cd(cwd.clone()));
        }
        flags.extend(self.workspaces.iter().cloned().map(SandboxFlag::Workspace));
        flags.extend(self.aux.iter().cloned().map(SandboxFlag::Map));
        flags
    }

    pub fn build(&self) -> SandboxInvocation {
        let mut args = Vec::new();
        for flag in self.flags() {
            flag.push_args(&mut args);
        }
        SandboxInvocation {
            launcher: self.rootfs.join(LAUNCHER),
            args,
            workspaces: self.workspaces.clone(),
            escalation: Escalation::None,
        }
    }
}

/// A fully composed launcher invocation. Immutable once built; wrapping
/// with an escalation prefix produces a new value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxInvocation {
    launcher: PathBuf,
    args: Vec<OsString>,
    workspaces: Vec<WorkspaceMapping>,
    escalation: Escalation,
}

impl SandboxInvocation {
    pub fn launcher(&self) -> &Path {
        &self.launcher
    }

    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    pub fn workspaces(&self) -> &[WorkspaceMapping] {
        &self.workspaces
    }

    pub fn escalation(&self) -> &Escalation {
        &self.escalation
    }

    pub fn with_escalation(&self, escalation: Escalation) -> Self {
        Self { escalation, ..self.clone() }
    }

    /// The full argument vector for running `command` in the sandbox,
    /// program first.
    pub fn argv<S: AsRef<OsStr>>(
        &self,
        command: &[S],
        env: &BTreeMap<String, String>,
    ) -> Vec<OsString> {
        let mut inner: Vec<OsString> = Vec::with_capacity(self.args.len() + command.len() + 2);
        inner.push(self.launcher.as_os_str().to_os_string());
        inner.extend(self.args.iter().cloned());
        inner.push(SEPARATOR.into());
        inner.extend(command.iter().map(|c| c.as_ref().to_os_string()));

        self.escalation.wrap(inner, env)
    }

    /// A `Command` for `command` with the environment replaced by `env`.
    pub fn to_command<S: AsRef<OsStr>>(
        &self,
        command: &[S],
        env: &BTreeMap<String, String>,
    ) -> Command {
        let argv = self.argv(command, env);
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd.env_clear();
        cmd.envs(env);
        cmd
    }

    /// Printable, shell-quoted command line, as written to build logs.
    pub fn command_line<S: AsRef<OsStr>>(
        &self,
        command: &[S],
        env: &BTreeMap<String, String>,
    ) -> String {
        quote::join(&self.argv(command, env))
    }
}
