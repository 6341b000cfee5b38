//! State-tree bootstrap under the mount root.
//!
//! Containers keep all gluster state on one persistent volume so the image
//! stays stateless: on first start the minimal tree is created there and the
//! well-known system paths are symlinked into it. An xattr self-test on the
//! default brick directory catches backing filesystems mounted without
//! user_xattr early, where the daemon's own errors would be cryptic.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};

use crate::error::EntryError;
use crate::resolver;
use crate::runner::{Cmd, CommandRunner};

pub const MOUNT_ROOT_DEFAULT: &str = "/mnt/data";

const STATE_SUBDIRS: &[&str] = &[
    "etc/glusterfs",
    "etc/gluster-container",
    "var/lib/glusterd",
    "log/glusterfs",
    "bricks/brick1/gv0",
];

/// (system path, subpath under the mount root)
const SYSTEM_LINKS: &[(&str, &str)] = &[
    ("/etc/glusterfs", "etc/glusterfs"),
    ("/etc/gluster-container", "etc/gluster-container"),
    ("/var/lib/glusterd", "var/lib/glusterd"),
    ("/var/log/glusterfs", "log/glusterfs"),
    ("/bricks/brick1", "bricks/brick1"),
];

/// Full preparation pass: tree bootstrap, system symlinks, xattr self-test.
/// Dry-run logs what would happen and touches nothing.
pub fn prepare(root: &Path, runner: &dyn CommandRunner, dry_run: bool) -> Result<()> {
    if dry_run {
        tracing::info!(root = %root.display(), "dry-run: would bootstrap state tree and system links");
        return Ok(());
    }
    bootstrap_state_tree(root)?;
    link_system_paths(root)?;
    xattr_selftest(&root.join("bricks/brick1/gv0"), runner);
    Ok(())
}

/// Creates the minimal tree and a default config when the root is missing or
/// empty; an already-populated root is left untouched.
pub fn bootstrap_state_tree(root: &Path) -> Result<()> {
    if root.is_dir() && !dir_is_empty(root)? {
        tracing::info!(root = %root.display(), "state tree present, no bootstrap needed");
        return Ok(());
    }
    tracing::info!(root = %root.display(), "initializing state tree");
    for sub in STATE_SUBDIRS {
        fs::create_dir_all(root.join(sub))
            .with_context(|| format!("creating {}", root.join(sub).display()))?;
    }
    let cfg_path = root.join("etc/gluster-container/config.yaml");
    if !cfg_path.exists() {
        fs::write(&cfg_path, "role: server\n")
            .with_context(|| format!("writing default config {}", cfg_path.display()))?;
        tracing::info!(path = %cfg_path.display(), "default config written");
    }
    Ok(())
}

/// Points the well-known system paths at the state tree.
pub fn link_system_paths(root: &Path) -> Result<()> {
    for (link, sub) in SYSTEM_LINKS {
        let target = root.join(sub);
        fs::create_dir_all(&target)
            .with_context(|| format!("creating link target {}", target.display()))?;
        ensure_symlink(&target, Path::new(link))?;
    }
    Ok(())
}

/// Creates `link -> target` idempotently. A wrong existing link is replaced;
/// an existing real path is moved aside to a timestamped backup first, and a
/// failed backup is fatal (overwriting live daemon state is not an option).
pub fn ensure_symlink(target: &Path, link: &Path) -> Result<()> {
    if let Ok(current) = fs::read_link(link) {
        if current == target {
            return Ok(());
        }
        fs::remove_file(link)
            .with_context(|| format!("removing stale symlink {}", link.display()))?;
    } else if link.exists() {
        let backup = backup_path(link);
        if let Err(err) = fs::rename(link, &backup) {
            return Err(EntryError::StatedirBackupFailed {
                path: link.to_path_buf(),
                reason: err.to_string(),
            }
            .into());
        }
        tracing::warn!(old = %link.display(), backup = %backup.display(), "moved path aside for symlink setup");
    }
    if let Some(parent) = link.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    std::os::unix::fs::symlink(target, link)
        .with_context(|| format!("linking {} -> {}", link.display(), target.display()))?;
    Ok(())
}

fn backup_path(link: &Path) -> PathBuf {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let mut name = link.as_os_str().to_os_string();
    name.push(format!(".bak-{ts}"));
    PathBuf::from(name)
}

/// Smoke-tests user.* and trusted.* xattrs on the brick directory. All
/// failures are warnings: the daemon will surface a definitive error if the
/// filesystem really cannot do xattrs.
pub fn xattr_selftest(brick_dir: &Path, runner: &dyn CommandRunner) {
    if resolver::which("setfattr").is_none() || resolver::which("getfattr").is_none() {
        tracing::warn!("setfattr/getfattr not found; xattr self-test skipped");
        return;
    }
    if let Err(err) = fs::create_dir_all(brick_dir) {
        tracing::warn!(dir = %brick_dir.display(), error = %err, "xattr self-test skipped");
        return;
    }
    let probe = brick_dir.join(".xattr_probe");
    if let Err(err) = fs::write(&probe, b"probe") {
        tracing::warn!(dir = %brick_dir.display(), error = %err, "xattr self-test skipped");
        return;
    }
    let probe_str = probe.to_string_lossy().into_owned();

    let checks = [
        Cmd::new("setfattr").args(["-n", "user.test", "-v", "1", probe_str.as_str()]),
        Cmd::new("getfattr").args(["-n", "user.test", probe_str.as_str()]),
        Cmd::new("setfattr").args(["-n", "trusted.glusterfs.probe", "-v", "1", probe_str.as_str()]),
    ];
    for cmd in &checks {
        match runner.run(cmd) {
            Ok(res) if res.success() => {}
            Ok(res) => {
                tracing::warn!(
                    cmd = %cmd.display(),
                    rc = res.code,
                    stderr = %res.stderr.trim(),
                    "xattr self-test failed (check user_xattr,acl mount options)"
                );
            }
            Err(err) => {
                tracing::warn!(cmd = %cmd.display(), error = %err, "xattr self-test failed");
            }
        }
    }
    let _ = fs::remove_file(&probe);
}

fn dir_is_empty(dir: &Path) -> Result<bool> {
    let mut entries = fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))?;
    Ok(entries.next().is_none())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_creates_tree_and_default_config() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("data");
        bootstrap_state_tree(&root).unwrap();
        assert!(root.join("var/lib/glusterd").is_dir());
        assert!(root.join("bricks/brick1/gv0").is_dir());
        let cfg = fs::read_to_string(root.join("etc/gluster-container/config.yaml")).unwrap();
        assert_eq!(cfg, "role: server\n");
    }

    #[test]
    fn bootstrap_leaves_populated_root_alone() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::write(root.join("marker"), b"x").unwrap();
        bootstrap_state_tree(root).unwrap();
        assert!(!root.join("etc").exists());
    }

    #[test]
    fn ensure_symlink_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        fs::create_dir_all(&target).unwrap();
        let link = dir.path().join("link");
        ensure_symlink(&target, &link).unwrap();
        ensure_symlink(&target, &link).unwrap();
        assert_eq!(fs::read_link(&link).unwrap(), target);
    }

    #[test]
    fn ensure_symlink_moves_existing_dir_aside() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        fs::create_dir_all(&target).unwrap();
        let link = dir.path().join("existing");
        fs::create_dir_all(&link).unwrap();
        fs::write(link.join("keep"), b"x").unwrap();

        ensure_symlink(&target, &link).unwrap();
        assert_eq!(fs::read_link(&link).unwrap(), target);
        let backup = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .find(|e| e.file_name().to_string_lossy().starts_with("existing.bak-"))
            .expect("backup created");
        assert!(backup.path().join("keep").is_file());
    }

    #[test]
    fn ensure_symlink_replaces_stale_link() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("old");
        let new = dir.path().join("new");
        fs::create_dir_all(&old).unwrap();
        fs::create_dir_all(&new).unwrap();
        let link = dir.path().join("link");
        ensure_symlink(&old, &link).unwrap();
        ensure_symlink(&new, &link).unwrap();
        assert_eq!(fs::read_link(&link).unwrap(), new);
    }
}
