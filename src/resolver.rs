//! Locates the glusterd binary and verifies it is the server daemon, not a
//! client build shipped under the same name. Distribution packages have been
//! observed to install a fuse client as `glusterd`, which accepts the daemon
//! flags and then sits waiting for a mount point; catching that here produces
//! a clear diagnostic instead of a hung container.

use std::env;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::error::EntryError;
use crate::runner::{Cmd, CommandRunner};

/// Conventional install locations, highest priority first.
pub const WELL_KNOWN_LOCATIONS: &[&str] = &["/usr/sbin/glusterd", "/usr/local/sbin/glusterd"];

pub const DAEMON_NAME: &str = "glusterd";

/// Help-text tokens that only appear in the fuse client's usage output.
/// Both must match for the spawn-time re-check; either is enough at resolve
/// time, where we can afford to be strict.
const CLIENT_TOKEN_VOLFILE: &str = "volfile";
const CLIENT_TOKEN_MOUNT_POINT: &str = "MOUNT-POINT";

/// Packages that legitimately own the daemon binary.
const EXPECTED_PACKAGES: &[&str] = &["glusterfs-server", "glusterfs-common"];

#[derive(Debug, Clone)]
pub struct ResolvedBinary {
    pub path: PathBuf,
    /// True when the path came from an explicit override (flag or env); the
    /// supervisor must not fall back to other locations in that case.
    pub explicit: bool,
}

/// Strict client detection for freshly resolved binaries: any client
/// vocabulary in the help text disqualifies it.
pub fn help_looks_like_client(help: &str) -> bool {
    help.contains(CLIENT_TOKEN_VOLFILE) || help.contains(CLIENT_TOKEN_MOUNT_POINT)
}

/// Lenient variant used for the post-spawn re-check, where daemon builds that
/// merely mention volfiles in passing must not be killed: both signature
/// tokens have to be present.
pub fn help_is_unmistakably_client(help: &str) -> bool {
    help.contains(CLIENT_TOKEN_VOLFILE) && help.contains(CLIENT_TOKEN_MOUNT_POINT)
}

/// PATH lookup, mirroring `which(1)`.
pub fn which(name: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    for dir in env::split_paths(&path) {
        let cand = dir.join(name);
        if is_executable_file(&cand) {
            return Some(cand);
        }
    }
    None
}

pub fn is_executable_file(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Fails with [`EntryError::MissingCommand`] when `name` is not on PATH.
pub fn require(name: &str) -> Result<()> {
    if which(name).is_none() {
        return Err(EntryError::MissingCommand(name.to_string()).into());
    }
    Ok(())
}

/// Resolves and validates the daemon binary.
///
/// With an override only that invocation is considered; otherwise the
/// conventional locations are searched in priority order, then PATH. The
/// winner's help text is scanned for client signatures (fatal) and its owning
/// package is cross-checked via dpkg (warning only; packaging heuristics are
/// best-effort and must not block a working daemon).
pub fn resolve(runner: &dyn CommandRunner, override_bin: Option<&str>) -> Result<ResolvedBinary> {
    let (path, explicit) = match override_bin {
        Some(bin) if !bin.trim().is_empty() => {
            let bin = bin.trim();
            let path = if bin.contains('/') {
                let p = PathBuf::from(bin);
                if !is_executable_file(&p) {
                    tracing::error!(path = %p.display(), "override binary is not executable");
                    return Err(EntryError::BinaryNotFound.into());
                }
                p
            } else {
                which(bin).ok_or(EntryError::BinaryNotFound)?
            };
            (path, true)
        }
        _ => {
            let found = WELL_KNOWN_LOCATIONS
                .iter()
                .map(PathBuf::from)
                .find(|p| is_executable_file(p))
                .or_else(|| which(DAEMON_NAME));
            (found.ok_or(EntryError::BinaryNotFound)?, false)
        }
    };

    check_daemon_variant(runner, &path)?;
    check_package_origin(runner, &path);

    tracing::info!(path = %path.display(), explicit, "resolved glusterd binary");
    Ok(ResolvedBinary { path, explicit })
}

/// Runs `--help` on the candidate and rejects client builds.
pub fn check_daemon_variant(runner: &dyn CommandRunner, path: &Path) -> Result<()> {
    let result = runner.run(&Cmd::new(path.to_string_lossy()).arg("--help"))?;
    // Some builds print usage on stderr.
    let help = if result.stdout.trim().is_empty() {
        result.stderr
    } else {
        result.stdout
    };
    if help_looks_like_client(&help) {
        let excerpt: String = help.lines().take(6).collect::<Vec<_>>().join("\n");
        tracing::error!(
            path = %path.display(),
            help = %excerpt,
            "client build detected where a daemon was expected"
        );
        return Err(EntryError::WrongBinaryVariant {
            path: path.to_path_buf(),
            help_excerpt: excerpt,
        }
        .into());
    }
    Ok(())
}

/// Best-effort dpkg ownership check. Mismatches are logged, never fatal.
fn check_package_origin(runner: &dyn CommandRunner, path: &Path) {
    let real = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let result = match runner.run(&Cmd::new("dpkg").arg("-S").arg(real.to_string_lossy())) {
        Ok(r) => r,
        Err(err) => {
            tracing::debug!(error = %err, "dpkg not usable, skipping package check");
            return;
        }
    };
    let owner = if result.stdout.trim().is_empty() {
        result.stderr
    } else {
        result.stdout
    };
    let owner = owner.trim();
    if EXPECTED_PACKAGES.iter().any(|p| owner.contains(p)) {
        tracing::info!(path = %real.display(), package = %truncate(owner, 120), "package origin ok");
    } else {
        tracing::warn!(
            path = %real.display(),
            package = %truncate(owner, 200),
            "glusterd not owned by an expected package; continuing anyway"
        );
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLIENT_HELP: &str = "Usage: glusterfs [OPTION...] --volfile-server=SERVER MOUNT-POINT\n\
                               Mount a GlusterFS volume on the given mount point";
    const DAEMON_HELP: &str = "Usage: glusterd [OPTION...]\n  -N, --no-daemon  Run in foreground";

    #[test]
    fn client_help_is_detected() {
        assert!(help_looks_like_client(CLIENT_HELP));
        assert!(help_is_unmistakably_client(CLIENT_HELP));
    }

    #[test]
    fn daemon_help_passes() {
        assert!(!help_looks_like_client(DAEMON_HELP));
        assert!(!help_is_unmistakably_client(DAEMON_HELP));
    }

    #[test]
    fn single_token_is_not_unmistakable() {
        let help = "glusterd accepts a volfile for static configuration";
        assert!(help_looks_like_client(help));
        assert!(!help_is_unmistakably_client(help));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("abcdef", 3), "abc");
        assert_eq!(truncate("ab", 10), "ab");
    }
}
