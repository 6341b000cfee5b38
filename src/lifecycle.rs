//! Role-keyed lifecycle state machine. One control thread drives everything;
//! signal handlers only flip the stop flag, and every wait in the system is a
//! bounded sleep-and-recheck loop so signals are observed within one interval.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::config::Config;
use crate::error::EntryError;
use crate::mounts::MountManager;
use crate::probe::{self, Readiness};
use crate::reconcile::Reconciler;
use crate::resolver;
use crate::runner::{ChildHandle, CommandRunner};
use crate::supervisor;

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const STATUS_INTERVAL: Duration = Duration::from_secs(30);
const TERM_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Noop,
    Server { bootstrap: bool },
    Client,
}

impl Role {
    pub fn parse(raw: &str) -> Result<Role> {
        match raw.trim().to_lowercase().as_str() {
            "noop" => Ok(Role::Noop),
            "server" => Ok(Role::Server { bootstrap: false }),
            "server+bootstrap" => Ok(Role::Server { bootstrap: true }),
            "client" => Ok(Role::Client),
            other => Err(EntryError::UnknownRole(other.to_string()).into()),
        }
    }
}

/// Tunables collected from flags and environment once at startup.
pub struct Settings {
    pub glusterd_bin: Option<String>,
    pub brick_host: Option<String>,
    pub ready_timeout: Duration,
    pub startup_grace: Duration,
    pub term_timeout: Duration,
    pub report_path: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            glusterd_bin: None,
            brick_host: None,
            ready_timeout: probe::DEFAULT_READY_TIMEOUT,
            startup_grace: supervisor::DEFAULT_GRACE,
            term_timeout: Duration::from_secs(10),
            report_path: None,
        }
    }
}

/// Process-wide runtime state, passed explicitly to every component. The stop
/// flag is flipped exactly once by signal delivery; the child registry is
/// terminated in insertion order at shutdown.
pub struct Context {
    pub runner: Arc<dyn CommandRunner>,
    pub stop: Arc<AtomicBool>,
    pub settings: Settings,
    children: Mutex<Vec<Box<dyn ChildHandle>>>,
}

impl Context {
    pub fn new(runner: Arc<dyn CommandRunner>, settings: Settings) -> Self {
        Context {
            runner,
            stop: Arc::new(AtomicBool::new(false)),
            settings,
            children: Mutex::new(Vec::new()),
        }
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn register_child(&self, child: Box<dyn ChildHandle>) {
        self.children.lock().expect("child registry poisoned").push(child);
    }

    /// First registered child that has exited, if any.
    fn poll_child_exit(&self) -> Result<Option<i32>> {
        let mut children = self.children.lock().expect("child registry poisoned");
        for child in children.iter_mut() {
            if let Some(rc) = child.try_wait()? {
                return Ok(Some(rc));
            }
        }
        Ok(None)
    }

    /// Two-phase termination of all registered children, in registration
    /// order: SIGTERM, bounded wait, SIGKILL. Failures are logged only;
    /// shutdown must complete regardless.
    pub fn shutdown_children(&self) {
        let mut children = self.children.lock().expect("child registry poisoned");
        for child in children.iter_mut() {
            terminate_child(child.as_mut(), self.settings.term_timeout);
        }
        children.clear();
    }
}

fn terminate_child(child: &mut dyn ChildHandle, timeout: Duration) {
    match child.try_wait() {
        Ok(Some(_)) => return,
        Ok(None) => {}
        Err(err) => {
            tracing::warn!(pid = child.id(), error = %err, "child state unknown at shutdown");
        }
    }
    tracing::info!(pid = child.id(), "terminating child");
    if let Err(err) = child.terminate() {
        tracing::warn!(pid = child.id(), error = %err, "SIGTERM failed");
    }
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        match child.try_wait() {
            Ok(Some(rc)) => {
                tracing::info!(pid = child.id(), rc, "child exited");
                return;
            }
            Ok(None) => std::thread::sleep(TERM_POLL),
            Err(err) => {
                tracing::warn!(pid = child.id(), error = %err, "wait failed during shutdown");
                return;
            }
        }
    }
    tracing::warn!(pid = child.id(), "child ignored SIGTERM, killing");
    if let Err(err) = child.kill() {
        tracing::warn!(pid = child.id(), error = %err, "SIGKILL failed");
    }
    let _ = child.try_wait();
}

static SIGNAL_STOP: OnceLock<Arc<AtomicBool>> = OnceLock::new();

extern "C" fn handle_stop_signal(signum: i32) {
    // Only async-signal-safe work here: flip the flag, nothing else.
    if let Some(stop) = SIGNAL_STOP.get() {
        stop.store(true, Ordering::SeqCst);
    }
    let _ = signum;
}

/// Routes SIGTERM, SIGINT and SIGHUP to the stop flag. Everything else in the
/// process observes the flag cooperatively at its next poll point.
pub fn install_signal_handlers(stop: Arc<AtomicBool>) -> Result<()> {
    SIGNAL_STOP
        .set(stop)
        .map_err(|_| anyhow::anyhow!("signal handlers installed twice"))?;
    let action = SigAction::new(
        SigHandler::Handler(handle_stop_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for sig in [Signal::SIGTERM, Signal::SIGINT, Signal::SIGHUP] {
        // Safety: the handler only performs an atomic store.
        unsafe {
            signal::sigaction(sig, &action)
                .with_context(|| format!("installing handler for {sig}"))?;
        }
    }
    Ok(())
}

/// Runs the selected role to completion. Returns once the stop flag is set
/// and shutdown finished, or with the fatal error that ended the run.
pub fn run(role: Role, cfg: &Config, ctx: &Context) -> Result<()> {
    match role {
        Role::Noop => {
            tracing::info!("noop role: waiting for stop signal");
            wait_for_stop(ctx);
            tracing::info!("noop finished");
            Ok(())
        }
        Role::Server { bootstrap } => {
            let result = run_server(ctx, cfg, bootstrap);
            ctx.shutdown_children();
            tracing::info!("server stopped");
            result
        }
        Role::Client => run_client(ctx, cfg),
    }
}

fn run_server(ctx: &Context, cfg: &Config, bootstrap: bool) -> Result<()> {
    resolver::require("gluster")?;

    let resolved = resolver::resolve(ctx.runner.as_ref(), ctx.settings.glusterd_bin.as_deref())?;
    let supervised = supervisor::start(ctx.runner.as_ref(), &resolved, ctx.settings.startup_grace)?;
    ctx.register_child(supervised.child);

    let readiness = {
        let mut children = ctx.children.lock().expect("child registry poisoned");
        let child = children.last_mut().expect("supervised child registered");
        probe::wait_ready(ctx.runner.as_ref(), child.as_mut(), ctx.settings.ready_timeout)?
    };
    match readiness {
        Readiness::Ready => {}
        Readiness::Died { rc } => return Err(EntryError::DaemonExited { rc }.into()),
        Readiness::Timeout { last_stderr } => {
            return Err(EntryError::ReadyTimeout {
                timeout_secs: ctx.settings.ready_timeout.as_secs(),
                last_stderr,
            }
            .into());
        }
    }

    if bootstrap {
        let mut reconciler =
            Reconciler::new(ctx.runner.as_ref(), ctx.settings.brick_host.clone());
        let report = reconciler.run(&cfg.peers, &cfg.volumes)?;
        match serde_json::to_string(&report) {
            Ok(json) => tracing::info!(report = %json, "reconciliation finished"),
            Err(err) => tracing::warn!(error = %err, "could not serialize report"),
        }
        if let Some(path) = &ctx.settings.report_path {
            match serde_json::to_string_pretty(&report)
                .map_err(anyhow::Error::from)
                .and_then(|json| std::fs::write(path, json).map_err(Into::into))
            {
                Ok(()) => tracing::info!(path = %path.display(), "report written"),
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "report write failed")
                }
            }
        }
    }

    let status = spawn_status_task(ctx);

    let result = loop {
        if ctx.stop_requested() {
            tracing::info!("stop requested, shutting down server");
            break Ok(());
        }
        std::thread::sleep(POLL_INTERVAL);
        if let Some(rc) = ctx.poll_child_exit()? {
            break Err(EntryError::DaemonExited { rc: Some(rc) }.into());
        }
    };

    // The status thread observes the stop flag; make sure it sees one.
    if result.is_err() {
        ctx.request_stop();
    }
    let _ = status.join();
    result
}

fn run_client(ctx: &Context, cfg: &Config) -> Result<()> {
    for tool in ["mount", "umount", "mountpoint"] {
        resolver::require(tool)?;
    }

    let mut manager = MountManager::new(ctx.runner.as_ref());
    let mount_result = manager.mount_all(&cfg.mounts);

    if mount_result.is_ok() {
        wait_for_stop(ctx);
    }

    // Teardown runs even when the mount phase failed part-way: whatever did
    // get mounted must still come down.
    tracing::info!("unmounting client targets");
    manager.unmount_all();
    mount_result
}

fn wait_for_stop(ctx: &Context) {
    while !ctx.stop_requested() {
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Read-only liveness snapshot, emitted periodically while the server role
/// blocks. Holds no shared state beyond the stop flag.
fn spawn_status_task(ctx: &Context) -> std::thread::JoinHandle<()> {
    let stop = Arc::clone(&ctx.stop);
    std::thread::spawn(move || {
        let mut last = Instant::now();
        while !stop.load(Ordering::SeqCst) {
            std::thread::sleep(POLL_INTERVAL);
            if last.elapsed() >= STATUS_INTERVAL {
                tracing::info!("supervising glusterd, waiting for stop signal");
                last = Instant::now();
            }
        }
    })
}
