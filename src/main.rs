use std::env;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use gluster_entry::config::{CONFIG_PATH_DEFAULT, Config};
use gluster_entry::lifecycle::{self, Context, Role, Settings};
use gluster_entry::runner::ShellRunner;
use gluster_entry::{exit_code_for, statedir};

#[derive(Parser)]
#[command(name = "gluster-entry")]
#[command(about = "GlusterFS container entrypoint: supervises glusterd, reconciles volumes and mounts", long_about = None)]
struct Cli {
    /// Path to the YAML configuration (default: $CONFIG_PATH or /etc/gluster-container/config.yaml)
    #[arg(value_name = "CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured role: server | server+bootstrap | client | noop
    #[arg(long)]
    role: Option<String>,

    /// Log commands instead of executing them
    #[arg(long)]
    dry_run: bool,

    /// Log output shape
    #[arg(long, value_parser = ["text", "json"])]
    log_format: Option<String>,

    /// Log verbosity (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Seconds to wait for glusterd readiness
    #[arg(long, value_name = "SECS")]
    ready_timeout: Option<u64>,

    /// Local address used for unqualified brick entries
    #[arg(long)]
    brick_host: Option<String>,

    /// Explicit glusterd binary path or name
    #[arg(long)]
    glusterd_bin: Option<String>,

    /// Write the reconciliation report to this file as JSON
    #[arg(long, value_name = "PATH")]
    report: Option<PathBuf>,

    /// Persistent state root (default: $MOUNT_ROOT or /mnt/data)
    #[arg(long, value_name = "DIR")]
    mount_root: Option<PathBuf>,
}

fn env_nonempty(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn env_truthy(key: &str) -> bool {
    matches!(
        env::var(key).unwrap_or_default().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn init_tracing(cli: &Cli) {
    let level = cli
        .log_level
        .clone()
        .or_else(|| env_nonempty("LOG_LEVEL"))
        .unwrap_or_else(|| "info".to_string());
    let filter =
        EnvFilter::try_new(level.to_lowercase()).unwrap_or_else(|_| EnvFilter::new("info"));
    let format = cli
        .log_format
        .clone()
        .or_else(|| env_nonempty("LOG_FORMAT"))
        .unwrap_or_else(|| "text".to_string());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if format.eq_ignore_ascii_case("json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn run(cli: Cli) -> Result<()> {
    let config_path = cli
        .config
        .clone()
        .or_else(|| env_nonempty("CONFIG_PATH").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(CONFIG_PATH_DEFAULT));
    let dry_run = cli.dry_run || env_truthy("DRY_RUN");
    let mount_root = cli
        .mount_root
        .clone()
        .or_else(|| env_nonempty("MOUNT_ROOT").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(statedir::MOUNT_ROOT_DEFAULT));

    let settings = Settings {
        glusterd_bin: cli.glusterd_bin.clone().or_else(|| env_nonempty("GLUSTERD_BIN")),
        brick_host: cli.brick_host.clone().or_else(|| env_nonempty("BRICK_HOST")),
        ready_timeout: cli
            .ready_timeout
            .or_else(|| env_nonempty("READY_TIMEOUT").and_then(|v| v.parse().ok()))
            .map(Duration::from_secs)
            .unwrap_or(gluster_entry::probe::DEFAULT_READY_TIMEOUT),
        report_path: cli.report.clone(),
        ..Settings::default()
    };

    let cfg = Config::load(&config_path)?;
    let role_str = cli
        .role
        .clone()
        .filter(|r| !r.trim().is_empty())
        .or_else(|| env_nonempty("ROLE"))
        .or_else(|| cfg.role.clone())
        .unwrap_or_else(|| "noop".to_string());
    let role = Role::parse(&role_str)?;

    tracing::info!(
        role = %role_str,
        config = %config_path.display(),
        dry_run,
        "starting entrypoint"
    );

    let runner = Arc::new(ShellRunner::new(dry_run));
    statedir::prepare(&mount_root, runner.as_ref(), dry_run)?;

    let ctx = Context::new(runner, settings);
    lifecycle::install_signal_handlers(Arc::clone(&ctx.stop))?;

    lifecycle::run(role, &cfg, &ctx)
}

fn main() {
    let cli = Cli::parse();
    init_tracing(&cli);

    if let Err(err) = run(cli) {
        let code = exit_code_for(&err);
        tracing::error!(error = %format!("{err:#}"), code, "fatal");
        process::exit(code);
    }
}
