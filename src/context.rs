use std::sync::Arc;

use crate::config::GlobalConfig;
use crate::error::Result;
use crate::mounts::MountGuard;
use crate::privilege::{Escalation, PrivilegePolicy, SandboxProbe};
use crate::shard::store::ShardStore;
use crate::shard::ShardResolver;

/// Everything a runner needs from the process: effective configuration,
/// the shard resolver and the once-per-process privilege decision.
/// Built once at startup and passed down by reference.
pub struct Context {
    config: GlobalConfig,
    resolver: Arc<dyn ShardResolver>,
    policy: PrivilegePolicy,
    escalation: Escalation,
    guard: MountGuard,
}

impl Context {
    /// Production context over the on-disk shard store.
    pub fn new(config: GlobalConfig) -> Result<Self> {
        let escalation = Escalation::detect();
        let store = ShardStore::open(&config, escalation.clone())?;
        let resolver: Arc<dyn ShardResolver> = Arc::new(store);
        let guard = MountGuard::new(config.sandbox.allow_ecryptfs);
        let probe = SandboxProbe::new(resolver.clone(), config.clone(), guard.clone(), false);
        let policy = PrivilegePolicy::new(config.sandbox.runner, Box::new(probe));
        Ok(Self {
            config,
            resolver,
            policy,
            escalation,
            guard,
        })
    }

    pub fn with_parts(
        config: GlobalConfig,
        resolver: Arc<dyn ShardResolver>,
        policy: PrivilegePolicy,
        escalation: Escalation,
    ) -> Self {
        let guard = MountGuard::new(config.sandbox.allow_ecryptfs);
        Self {
            config,
            resolver,
            policy,
            escalation,
            guard,
        }
    }

    /// Replace the mount guard, e.g. with one over a fixed mount table.
    pub fn with_guard(mut self, guard: MountGuard) -> Self {
        self.guard = guard;
        self
    }

    pub fn config(&self) -> &GlobalConfig {
        &self.config
    }

    pub fn resolver(&self) -> &dyn ShardResolver {
        self.resolver.as_ref()
    }

    pub fn policy(&self) -> &PrivilegePolicy {
        &self.policy
    }

    pub fn escalation(&self) -> &Escalation {
        &self.escalation
    }

    pub fn guard(&self) -> &MountGuard {
        &self.guard
    }
}
