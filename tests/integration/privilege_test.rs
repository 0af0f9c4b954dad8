mod common;

use std::sync::Arc;

use drydock::config::PrivilegeOverride;
use drydock::mounts::{MountGuard, MountTable};
use drydock::privilege::{
    probe_unprivileged_containers, PrivilegeMode, PrivilegePolicy, SandboxProbe,
};

use common::{FakeResolver, Fixture, FAILING_LAUNCHER, NOISY_LAUNCHER};

fn open_guard() -> MountGuard {
    MountGuard::with_table(None, false)
}

#[test]
fn test_working_launcher_is_supported() {
    let fx = Fixture::new();
    let resolver = FakeResolver::new(fx.storage.path());
    assert!(probe_unprivileged_containers(&resolver, &fx.config(), &open_guard(), false));
}

#[test]
fn test_verbose_does_not_change_the_answer() {
    let fx = Fixture::new();
    let resolver = FakeResolver::new(fx.storage.path());
    let config = fx.config();
    let quiet = probe_unprivileged_containers(&resolver, &config, &open_guard(), false);
    let loud = probe_unprivileged_containers(&resolver, &config, &open_guard(), true);
    assert!(quiet);
    assert_eq!(quiet, loud);
}

#[test]
fn test_extra_output_is_unsupported() {
    let fx = Fixture::new();
    let resolver = FakeResolver::with_launcher(fx.storage.path(), NOISY_LAUNCHER);
    assert!(!probe_unprivileged_containers(&resolver, &fx.config(), &open_guard(), false));
}

#[test]
fn test_failing_launcher_is_unsupported() {
    let fx = Fixture::new();
    let resolver = FakeResolver::with_launcher(fx.storage.path(), FAILING_LAUNCHER);
    assert!(!probe_unprivileged_containers(&resolver, &fx.config(), &open_guard(), false));
}

#[test]
fn test_missing_root_shard_is_unsupported() {
    let fx = Fixture::new();
    let resolver = FakeResolver::without_rootfs(fx.storage.path());
    assert!(!probe_unprivileged_containers(&resolver, &fx.config(), &open_guard(), false));
}

#[test]
fn test_encrypted_scratch_dir_is_unsupported() {
    let fx = Fixture::new();
    let resolver = FakeResolver::new(fx.storage.path());
    let storage = fx.storage.path().canonicalize().unwrap();
    let table = MountTable::parse(&format!(
        "/dev/sda1 / ext4 rw 0 0\n/home/.Private {} ecryptfs rw 0 0\n",
        storage.display()
    ));
    let guard = MountGuard::with_table(Some(table), false);
    assert!(!probe_unprivileged_containers(&resolver, &fx.config(), &guard, false));
    assert!(probe_unprivileged_containers(&resolver, &fx.config(), &open_guard(), false));
}

#[test]
fn test_policy_over_real_sandbox_resolves_once() {
    let fx = Fixture::new();
    let resolver = Arc::new(FakeResolver::with_launcher(fx.storage.path(), FAILING_LAUNCHER));
    let probe = SandboxProbe::new(resolver, fx.config(), open_guard(), false);
    let policy = PrivilegePolicy::new(PrivilegeOverride::Auto, Box::new(probe));
    assert_eq!(policy.resolve(), PrivilegeMode::Privileged);
    assert_eq!(policy.resolved(), Some(PrivilegeMode::Privileged));

    // A later fix on the host does not flip the cached decision.
    let launcher = fx
        .storage
        .path()
        .join("mounts/rootfs-1.0-x86_64-linux-gnu/sandbox");
    assert!(launcher.exists());
    std::fs::write(&launcher, common::FAKE_LAUNCHER).unwrap();
    assert_eq!(policy.resolve(), PrivilegeMode::Privileged);
}
