mod common;

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use drydock::config::PrivilegeOverride;
use drydock::platform::{Arch, Libc, Platform};
use drydock::privilege::{Escalation, PrivilegeMode};
use drydock::runner::{new_runner, shared_buffer, InteractiveIo, IoTarget, RunnerOptions};
use drydock::sandbox::WorkspaceMapping;

use common::Fixture;

fn sh(script: &str) -> Vec<String> {
    vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
}

#[derive(Clone, Default)]
struct SharedSink(Arc<Mutex<Vec<u8>>>);

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn test_run_success_writes_log() {
    let fx = Fixture::new();
    let ctx = fx.context(PrivilegeOverride::Auto, Escalation::None);
    let runner = new_runner(&ctx, fx.workspace.path(), RunnerOptions::default()).unwrap();

    let log = fx.workspace.path().join("logs/hello.log");
    let command = sh("echo hello julia");
    assert!(runner.run(&command, Some(&log), false, None).unwrap());

    let content = std::fs::read_to_string(&log).unwrap();
    let (first, rest) = content.split_once('\n').unwrap();
    assert_eq!(first, runner.invocation().command_line(&command, runner.env()));
    assert_eq!(rest, "hello julia\n");
}

#[test]
fn test_run_failure_still_writes_log() {
    let fx = Fixture::new();
    let ctx = fx.context(PrivilegeOverride::Auto, Escalation::None);
    let runner = new_runner(&ctx, fx.workspace.path(), RunnerOptions::default()).unwrap();

    let log = fx.workspace.path().join("fail.log");
    let ok = runner
        .run(&sh("echo partial; echo broken >&2; exit 3"), Some(&log), false, None)
        .unwrap();
    assert!(!ok);

    let content = std::fs::read_to_string(&log).unwrap();
    assert!(content.contains("partial\n"));
    assert!(content.contains("broken\n"));
}

#[test]
fn test_empty_log_path_means_no_log() {
    let fx = Fixture::new();
    let ctx = fx.context(PrivilegeOverride::Auto, Escalation::None);
    let runner = new_runner(&ctx, fx.workspace.path(), RunnerOptions::default()).unwrap();
    let empty = std::path::Path::new("");
    assert!(runner.run(&sh("true"), Some(empty), false, None).unwrap());
    assert!(!runner.run(&sh("exit 2"), Some(empty), false, None).unwrap());
}

#[test]
fn test_run_without_log() {
    let fx = Fixture::new();
    let ctx = fx.context(PrivilegeOverride::Auto, Escalation::None);
    let runner = new_runner(&ctx, fx.workspace.path(), RunnerOptions::default()).unwrap();
    assert!(runner.run(&sh("true"), None, false, None).unwrap());
    assert!(!runner.run(&sh("false"), None, false, None).unwrap());
}

#[test]
fn test_verbose_run_tees_output() {
    let fx = Fixture::new();
    let ctx = fx.context(PrivilegeOverride::Auto, Escalation::None);
    let runner = new_runner(&ctx, fx.workspace.path(), RunnerOptions::default()).unwrap();

    let sink = SharedSink::default();
    let ok = runner
        .run(&sh("echo streamed"), None, true, Some(Box::new(sink.clone())))
        .unwrap();
    assert!(ok);
    assert_eq!(String::from_utf8(sink.0.lock().unwrap().clone()).unwrap(), "streamed\n");
}

#[test]
fn test_target_environment_reaches_command() {
    let fx = Fixture::new();
    let ctx = fx.context(PrivilegeOverride::Auto, Escalation::None);
    let mut env = BTreeMap::new();
    env.insert("GREETING".to_string(), "ahoy".to_string());
    let runner = new_runner(&ctx, fx.workspace.path(), RunnerOptions {
        platform: Some(Platform::linux(Arch::Aarch64, Libc::Musl)),
        env,
        ..Default::default()
    })
    .unwrap();

    let out = shared_buffer();
    let ok = runner
        .run_interactive(
            &sh("echo $target $MACHTYPE $GREETING $WORKSPACE"),
            InteractiveIo::capture_stdout(out.clone()),
        )
        .unwrap();
    assert!(ok);
    assert_eq!(
        String::from_utf8(out.lock().unwrap().clone()).unwrap(),
        "aarch64-linux-musl x86_64-linux-gnu ahoy /workspace\n"
    );
}

#[test]
fn test_interactive_buffers() {
    let fx = Fixture::new();
    let ctx = fx.context(PrivilegeOverride::Auto, Escalation::None);
    let runner = new_runner(&ctx, fx.workspace.path(), RunnerOptions::default()).unwrap();

    let input = shared_buffer();
    input.lock().unwrap().extend_from_slice(b"from stdin\n");
    let out = shared_buffer();
    let err = shared_buffer();
    let ok = runner
        .run_interactive(
            &sh("cat; echo to stderr >&2"),
            InteractiveIo {
                stdin: Some(IoTarget::Buffer(input)),
                stdout: Some(IoTarget::Buffer(out.clone())),
                stderr: Some(IoTarget::Buffer(err.clone())),
            },
        )
        .unwrap();
    assert!(ok);
    assert_eq!(out.lock().unwrap().as_slice(), b"from stdin\n");
    assert_eq!(err.lock().unwrap().as_slice(), b"to stderr\n");
}

#[test]
fn test_interactive_failure_is_false() {
    let fx = Fixture::new();
    let ctx = fx.context(PrivilegeOverride::Auto, Escalation::None);
    let runner = new_runner(&ctx, fx.workspace.path(), RunnerOptions::default()).unwrap();
    let io = InteractiveIo {
        stdout: Some(IoTarget::Null),
        stderr: Some(IoTarget::Null),
        stdin: Some(IoTarget::Null),
    };
    assert!(!runner.run_interactive(&sh("exit 1"), io).unwrap());
}

#[test]
fn test_probe_runs_once_across_runners() {
    let fx = Fixture::new();
    let ctx = fx.context(PrivilegeOverride::Auto, Escalation::None);
    let a = new_runner(&ctx, fx.workspace.path(), RunnerOptions::default()).unwrap();
    let b = new_runner(&ctx, fx.workspace.path(), RunnerOptions::default()).unwrap();
    assert_eq!(fx.probe_calls.load(Ordering::SeqCst), 1);
    assert_eq!(a.privilege(), PrivilegeMode::Unprivileged);
    assert_eq!(b.privilege(), PrivilegeMode::Unprivileged);
}

#[test]
fn test_forced_mode_skips_probe() {
    let fx = Fixture::new();
    let ctx = fx.context(PrivilegeOverride::Unprivileged, Escalation::None);
    let runner = new_runner(&ctx, fx.workspace.path(), RunnerOptions::default()).unwrap();
    assert_eq!(runner.privilege(), PrivilegeMode::Unprivileged);
    assert_eq!(fx.probe_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_workspace_root_is_first_mapping() {
    let fx = Fixture::new();
    let ctx = fx.context(PrivilegeOverride::Auto, Escalation::None);
    let extra = tempfile::tempdir().unwrap();
    let runner = new_runner(&ctx, fx.workspace.path(), RunnerOptions {
        extra_mappings: vec![WorkspaceMapping::new(extra.path(), "/srcdir")],
        cwd: Some(PathBuf::from("/workspace/build")),
        ..Default::default()
    })
    .unwrap();

    let maps = runner.invocation().workspaces();
    assert_eq!(maps.len(), 2);
    assert_eq!(maps[0].host, std::path::absolute(fx.workspace.path()).unwrap());
    assert_eq!(maps[0].container, PathBuf::from("/workspace"));
    assert_eq!(maps[1].container, PathBuf::from("/srcdir"));

    let args: Vec<String> = runner
        .invocation()
        .args()
        .iter()
        .map(|a| a.to_string_lossy().into_owned())
        .collect();
    let cd = args.iter().position(|a| a == "--cd").unwrap();
    let ws = args.iter().position(|a| a == "--workspace").unwrap();
    let map = args.iter().position(|a| a == "--map").unwrap();
    assert!(cd < ws && ws < map);
}

#[test]
fn test_ccache_mapping_follows_workspace() {
    let fx = Fixture::new();
    let mut config = fx.config();
    config.sandbox.use_ccache = true;
    let ctx = fx.context_with(config, PrivilegeOverride::Auto, Escalation::None);
    let runner = new_runner(&ctx, fx.workspace.path(), RunnerOptions::default()).unwrap();

    let maps = runner.invocation().workspaces();
    assert_eq!(maps[0].container, PathBuf::from("/workspace"));
    assert_eq!(maps[1].container, PathBuf::from("/root/.ccache"));
    assert!(fx.storage.path().join("ccache").is_dir());
    assert_eq!(runner.env()["CCACHE_DIR"], "/root/.ccache");
}

#[test]
fn test_runners_are_deterministic() {
    let fx = Fixture::new();
    let ctx = fx.context(PrivilegeOverride::Auto, Escalation::None);
    let options = RunnerOptions {
        platform: Some(Platform::macos(Arch::X86_64)),
        verbose: true,
        ..Default::default()
    };
    let a = new_runner(&ctx, fx.workspace.path(), options.clone()).unwrap();
    let b = new_runner(&ctx, fx.workspace.path(), options).unwrap();
    assert_eq!(a.invocation(), b.invocation());
    assert_eq!(a.env(), b.env());
    assert_eq!(a.platform(), b.platform());

    let command = sh("make");
    assert_eq!(
        a.invocation().command_line(&command, a.env()),
        b.invocation().command_line(&command, b.env())
    );
}

#[test]
fn test_privileged_runner_wraps_with_escalation() {
    let fx = Fixture::new();
    let sudo = PathBuf::from("/usr/bin/sudo");
    let ctx = fx.context(PrivilegeOverride::Privileged, Escalation::Sudo(sudo.clone()));
    let runner = new_runner(&ctx, fx.workspace.path(), RunnerOptions::default()).unwrap();

    assert_eq!(runner.privilege(), PrivilegeMode::Privileged);
    assert_eq!(fx.probe_calls.load(Ordering::SeqCst), 0);

    let argv = runner.invocation().argv(&sh("id -u"), runner.env());
    assert_eq!(PathBuf::from(&argv[0]), sudo);
    let preserve = argv[1].to_string_lossy();
    assert!(preserve.starts_with("--preserve-env="));
    assert!(preserve.contains("PATH"));
    assert_eq!(PathBuf::from(&argv[2]), runner.invocation().launcher());
}

#[test]
fn test_privileged_runner_as_root_runs_directly() {
    let fx = Fixture::new();
    let ctx = fx.context(PrivilegeOverride::Privileged, Escalation::None);
    let runner = new_runner(&ctx, fx.workspace.path(), RunnerOptions::default()).unwrap();
    assert_eq!(runner.privilege(), PrivilegeMode::Privileged);
    assert!(runner.run(&sh("echo root"), None, false, None).unwrap());
}
