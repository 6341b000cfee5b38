//! Command execution layer.
//!
//! Every interaction with the outside world (the `gluster` CLI, `mount`,
//! `dpkg`, the daemon binary itself) goes through the [`CommandRunner`] trait
//! so components can be tested against a scripted runner and so dry-run mode
//! has a single place to suppress side effects.

use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use thiserror::Error;

const TIMEOUT_POLL: Duration = Duration::from_millis(50);

/// A structured command: program plus discrete argv entries. Arguments are
/// never joined into a shell string for execution; the display form is for
/// logs only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    program: String,
    args: Vec<String>,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Cmd {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn argv(&self) -> &[String] {
        &self.args
    }

    /// Log-friendly rendering, quoting arguments that contain whitespace.
    pub fn display(&self) -> String {
        let mut out = self.program.clone();
        for a in &self.args {
            out.push(' ');
            if a.is_empty() || a.contains(char::is_whitespace) {
                out.push('\'');
                out.push_str(a);
                out.push('\'');
            } else {
                out.push_str(a);
            }
        }
        out
    }
}

/// Outcome of one command invocation.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Synthetic success, used by dry-run mode.
    pub fn simulated() -> Self {
        CommandResult {
            code: 0,
            stdout: String::new(),
            stderr: String::new(),
            elapsed: Duration::ZERO,
        }
    }
}

#[derive(Debug, Error)]
#[error("command `{cmd}` failed with rc={code}: {stderr}")]
pub struct CommandFailed {
    pub cmd: String,
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// A supervised child process. The real implementation wraps
/// `std::process::Child`; tests substitute scripted children.
pub trait ChildHandle: Send {
    fn id(&self) -> u32;

    /// Non-blocking poll: `Ok(Some(rc))` once the process has exited.
    fn try_wait(&mut self) -> Result<Option<i32>>;

    /// Polite stop (SIGTERM).
    fn terminate(&mut self) -> Result<()>;

    /// Forced stop (SIGKILL).
    fn kill(&mut self) -> Result<()>;
}

pub trait CommandRunner: Send + Sync {
    /// Run to completion with captured output. Never errors on a non-zero
    /// exit code, only on failure to execute at all.
    fn run(&self, cmd: &Cmd) -> Result<CommandResult>;

    /// Like [`CommandRunner::run`] but kills the command once `timeout`
    /// elapses.
    fn run_timeout(&self, cmd: &Cmd, timeout: Duration) -> Result<CommandResult>;

    /// Start a long-lived background process.
    fn spawn(&self, cmd: &Cmd) -> Result<Box<dyn ChildHandle>>;

    fn dry_run(&self) -> bool {
        false
    }

    /// Run and convert a non-zero exit into a [`CommandFailed`] error, logging
    /// the full diagnostic context first.
    fn run_checked(&self, cmd: &Cmd) -> Result<CommandResult> {
        let result = self.run(cmd)?;
        if !result.success() {
            tracing::error!(
                cmd = %cmd.display(),
                rc = result.code,
                stdout = %result.stdout.trim(),
                stderr = %result.stderr.trim(),
                "command failed"
            );
            return Err(CommandFailed {
                cmd: cmd.display(),
                code: result.code,
                stdout: result.stdout,
                stderr: result.stderr,
            }
            .into());
        }
        Ok(result)
    }
}

/// Production runner over `std::process`. With `dry_run` set, state-changing
/// entry points log the exact command and synthesize success instead of
/// executing anything.
pub struct ShellRunner {
    dry_run: bool,
}

impl ShellRunner {
    pub fn new(dry_run: bool) -> Self {
        ShellRunner { dry_run }
    }

    fn command(cmd: &Cmd) -> Command {
        let mut c = Command::new(cmd.program());
        c.args(cmd.argv());
        c
    }
}

impl CommandRunner for ShellRunner {
    fn run(&self, cmd: &Cmd) -> Result<CommandResult> {
        if self.dry_run {
            tracing::info!(cmd = %cmd.display(), "dry-run: would execute");
            return Ok(CommandResult::simulated());
        }
        tracing::debug!(cmd = %cmd.display(), "exec");
        let start = Instant::now();
        let output = Self::command(cmd)
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("failed to execute `{}`", cmd.display()))?;
        Ok(CommandResult {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            elapsed: start.elapsed(),
        })
    }

    fn run_timeout(&self, cmd: &Cmd, timeout: Duration) -> Result<CommandResult> {
        if self.dry_run {
            tracing::info!(cmd = %cmd.display(), "dry-run: would execute");
            return Ok(CommandResult::simulated());
        }
        tracing::debug!(cmd = %cmd.display(), timeout_ms = timeout.as_millis() as u64, "exec");
        let start = Instant::now();
        let mut child = Self::command(cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to execute `{}`", cmd.display()))?;
        // Bounded poll loop; on expiry the child is killed and reaped so the
        // caller still gets captured output.
        while start.elapsed() < timeout {
            if child.try_wait()?.is_some() {
                break;
            }
            std::thread::sleep(TIMEOUT_POLL);
        }
        if child.try_wait()?.is_none() {
            tracing::warn!(cmd = %cmd.display(), "command timed out, killing");
            let _ = child.kill();
        }
        let output = child
            .wait_with_output()
            .with_context(|| format!("failed to collect output of `{}`", cmd.display()))?;
        Ok(CommandResult {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            elapsed: start.elapsed(),
        })
    }

    fn spawn(&self, cmd: &Cmd) -> Result<Box<dyn ChildHandle>> {
        if self.dry_run {
            tracing::info!(cmd = %cmd.display(), "dry-run: would spawn");
            return Ok(Box::new(DryChild));
        }
        tracing::info!(cmd = %cmd.display(), "spawning process");
        let child = Self::command(cmd)
            .stdin(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to spawn `{}`", cmd.display()))?;
        Ok(Box::new(OsChild { child }))
    }

    fn dry_run(&self) -> bool {
        self.dry_run
    }
}

struct OsChild {
    child: std::process::Child,
}

impl ChildHandle for OsChild {
    fn id(&self) -> u32 {
        self.child.id()
    }

    fn try_wait(&mut self) -> Result<Option<i32>> {
        let status = self.child.try_wait().context("try_wait on child")?;
        Ok(status.map(|s| s.code().unwrap_or(-1)))
    }

    fn terminate(&mut self) -> Result<()> {
        signal::kill(Pid::from_raw(self.child.id() as i32), Signal::SIGTERM)
            .context("sending SIGTERM")?;
        Ok(())
    }

    fn kill(&mut self) -> Result<()> {
        self.child.kill().context("sending SIGKILL")?;
        Ok(())
    }
}

/// Stand-in child for dry-run mode: never exits, termination is a no-op.
struct DryChild;

impl ChildHandle for DryChild {
    fn id(&self) -> u32 {
        0
    }

    fn try_wait(&mut self) -> Result<Option<i32>> {
        Ok(None)
    }

    fn terminate(&mut self) -> Result<()> {
        Ok(())
    }

    fn kill(&mut self) -> Result<()> {
        Ok(())
    }
}
