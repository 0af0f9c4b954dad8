use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use drydock::config::GlobalConfig;
use drydock::context::Context;
use drydock::mounts::MountGuard;
use drydock::platform::Platform;
use drydock::privilege::probe_unprivileged_containers;
use drydock::runner::{new_runner, InteractiveIo, RunnerOptions};

#[derive(Parser)]
#[command(name = "drydock", about = "sandboxed build runner over rootfs shards")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(long, short = 'v', global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Reduce log output (show warnings/errors only)
    #[arg(long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Check whether unprivileged user-namespace containers work here
    Probe,
    /// Run a command inside the sandbox and capture its output
    Run {
        /// Target triplet (defaults to the bootstrap platform)
        #[arg(long)]
        target: Option<Platform>,

        /// Host directory mounted at /workspace
        #[arg(long, default_value = ".")]
        workspace: PathBuf,

        /// Write the command line and merged output to this file
        /// (default: <log_dir>/<triplet>.log)
        #[arg(long)]
        log: Option<PathBuf>,

        /// Command to run
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Open an interactive shell inside the sandbox
    Shell {
        #[arg(long)]
        target: Option<Platform>,

        #[arg(long, default_value = ".")]
        workspace: PathBuf,
    },
    /// Report paths that live on encrypted mounts
    CheckMounts {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose > 1 {
        EnvFilter::new("trace")
    } else if cli.verbose > 0 {
        EnvFilter::new("debug")
    } else if cli.quiet {
        EnvFilter::new("warn")
    } else {
        EnvFilter::new("info")
    };

    if cli.verbose > 0 {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt()
            .without_time()
            .with_target(false)
            .with_level(true)
            .with_env_filter(filter)
            .init();
    }

    let mut config = GlobalConfig::load(cli.config.as_deref())
        .context("failed to load config")?;
    config
        .apply_env(std::env::vars())
        .context("invalid DRYDOCK_* environment")?;
    let verbose = cli.verbose > 0;

    match cli.command {
        Commands::Probe => {
            let ctx = Context::new(config)?;
            let works = probe_unprivileged_containers(ctx.resolver(), ctx.config(), ctx.guard(), verbose);
            if works {
                println!("unprivileged containers: supported");
            } else {
                println!("unprivileged containers: unsupported (sudo/su will be used)");
            }
            Ok(())
        }
        Commands::Run { target, workspace, log, command } => {
            let platform = match target {
                Some(p) => p,
                None => config.bootstrap_platform()?,
            };
            let log = log.unwrap_or_else(|| config.default_log_path(&platform));
            let ctx = Context::new(config)?;
            let runner = new_runner(&ctx, &workspace, RunnerOptions {
                platform: Some(platform),
                verbose,
                ..Default::default()
            })?;
            // Output is always shown; -v additionally makes the launcher chatty.
            let success = runner.run(&command, Some(&log), true, None)?;
            if !success {
                anyhow::bail!(
                    "command failed inside sandbox: {} (log: {})",
                    command.join(" "),
                    log.display()
                );
            }
            Ok(())
        }
        Commands::Shell { target, workspace } => {
            let ctx = Context::new(config)?;
            let runner = new_runner(&ctx, &workspace, RunnerOptions {
                platform: target,
                verbose,
                ..Default::default()
            })?;
            runner.run_interactive(&["/bin/bash".to_string()], InteractiveIo::inherit())?;
            Ok(())
        }
        Commands::CheckMounts { paths } => {
            let guard = MountGuard::new(config.sandbox.allow_ecryptfs);
            let refs: Vec<&std::path::Path> = paths.iter().map(|p| p.as_path()).collect();
            guard.check_all(&refs)?;
            println!("no encrypted mounts found");
            Ok(())
        }
    }
}
