//! Starts glusterd in the foreground. Daemon builds across versions and
//! distributions disagree about the foreground flag (`-N`, `--no-daemon`,
//! none), so the supervisor probes the variants in order and keeps the first
//! one that survives a short grace window.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;

use crate::error::EntryError;
use crate::resolver::{self, ResolvedBinary};
use crate::runner::{ChildHandle, Cmd, CommandRunner};

pub const DEFAULT_GRACE: Duration = Duration::from_secs(1);

/// Foreground flag variants, tried per binary in this order.
const FLAG_VARIANTS: &[&[&str]] = &[&["-N"], &["--no-daemon"], &[]];

/// A running daemon together with the invocation that produced it.
pub struct Supervised {
    pub child: Box<dyn ChildHandle>,
    pub cmd: Cmd,
    pub binary: PathBuf,
}

impl std::fmt::Debug for Supervised {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervised")
            .field("cmd", &self.cmd)
            .field("binary", &self.binary)
            .finish_non_exhaustive()
    }
}

/// Builds the ordered startup candidate list for a resolved binary.
///
/// An explicitly overridden binary yields only its own flag variants; without
/// an override the other conventional locations and a bare PATH lookup are
/// appended as fallbacks, skipping paths that do not exist.
pub fn startup_candidates(resolved: &ResolvedBinary) -> Vec<(PathBuf, Cmd)> {
    let mut binaries: Vec<PathBuf> = vec![resolved.path.clone()];
    if !resolved.explicit {
        for loc in resolver::WELL_KNOWN_LOCATIONS {
            let p = PathBuf::from(loc);
            if p != resolved.path && resolver::is_executable_file(&p) {
                binaries.push(p);
            }
        }
        if let Some(p) = resolver::which(resolver::DAEMON_NAME)
            && !binaries.contains(&p)
        {
            binaries.push(p);
        }
    }

    let mut candidates = Vec::new();
    for bin in &binaries {
        for flags in FLAG_VARIANTS {
            candidates.push((
                bin.clone(),
                Cmd::new(bin.to_string_lossy()).args(flags.iter().copied()),
            ));
        }
    }
    candidates
}

/// Tries each candidate until one survives the grace window.
///
/// A candidate that dies inside the window is logged with its exit code and a
/// short help excerpt and the next one is tried; a surviving candidate gets a
/// final client-signature check against its concrete binary path (PATH may
/// have changed between resolution and spawn). Exhausting all candidates is
/// fatal with the last observed exit code.
pub fn start(
    runner: &dyn CommandRunner,
    resolved: &ResolvedBinary,
    grace: Duration,
) -> Result<Supervised> {
    let candidates = startup_candidates(resolved);
    if candidates.is_empty() {
        return Err(EntryError::BinaryNotFound.into());
    }

    let mut last_rc = None;
    for (binary, cmd) in candidates {
        let mut child = runner.spawn(&cmd)?;
        std::thread::sleep(grace);

        match child.try_wait()? {
            Some(rc) => {
                last_rc = Some(rc);
                tracing::warn!(
                    cmd = %cmd.display(),
                    rc,
                    help = %help_excerpt(runner, &binary),
                    "startup variant died during grace window"
                );
            }
            None => {
                // The process is up; make sure we did not just background a
                // disguised client that will never serve the control plane.
                if spawned_binary_is_client(runner, &binary) {
                    let _ = child.terminate();
                    return Err(EntryError::WrongBinaryVariant {
                        path: binary,
                        help_excerpt: help_excerpt(runner, &cmd_binary(&cmd)),
                    }
                    .into());
                }
                tracing::info!(cmd = %cmd.display(), pid = child.id(), "glusterd running");
                return Ok(Supervised {
                    child,
                    cmd,
                    binary,
                });
            }
        }
    }

    Err(EntryError::AllVariantsFailed { last_rc }.into())
}

fn cmd_binary(cmd: &Cmd) -> PathBuf {
    PathBuf::from(cmd.program())
}

fn spawned_binary_is_client(runner: &dyn CommandRunner, binary: &std::path::Path) -> bool {
    match runner.run(&Cmd::new(binary.to_string_lossy()).arg("--help")) {
        Ok(res) => {
            let help = if res.stdout.trim().is_empty() {
                res.stderr
            } else {
                res.stdout
            };
            resolver::help_is_unmistakably_client(&help)
        }
        // No --help at all tells us nothing; let the readiness probe decide.
        Err(_) => false,
    }
}

fn help_excerpt(runner: &dyn CommandRunner, binary: &std::path::Path) -> String {
    match runner.run(&Cmd::new(binary.to_string_lossy()).arg("--help")) {
        Ok(res) => {
            let help = if res.stdout.trim().is_empty() {
                res.stderr
            } else {
                res.stdout
            };
            help.lines().take(5).collect::<Vec<_>>().join(" | ")
        }
        Err(_) => "(--help unavailable)".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_override_yields_only_override_variants() {
        let resolved = ResolvedBinary {
            path: PathBuf::from("/opt/gluster/sbin/glusterd"),
            explicit: true,
        };
        let candidates = startup_candidates(&resolved);
        assert_eq!(candidates.len(), FLAG_VARIANTS.len());
        for (binary, cmd) in &candidates {
            assert_eq!(binary, &resolved.path);
            assert_eq!(cmd.program(), "/opt/gluster/sbin/glusterd");
        }
        assert_eq!(candidates[0].1.argv(), ["-N"]);
        assert_eq!(candidates[1].1.argv(), ["--no-daemon"]);
        assert!(candidates[2].1.argv().is_empty());
    }

    #[test]
    fn resolved_binary_variants_come_first() {
        let resolved = ResolvedBinary {
            path: PathBuf::from("/nonexistent/glusterd"),
            explicit: false,
        };
        // No well-known location exists in the test environment, so only the
        // resolved binary's variants (and possibly a PATH hit) remain; the
        // resolved path must still lead.
        let candidates = startup_candidates(&resolved);
        assert_eq!(candidates[0].0, resolved.path);
        assert_eq!(candidates[0].1.argv(), ["-N"]);
    }
}
