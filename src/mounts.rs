//! Client-side mount lifecycle. Mounting is idempotent (an already-mounted
//! target is skipped), teardown walks the targets this run mounted in reverse
//! order and never escalates failures: shutdown has to finish regardless.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::config::MountSpec;
use crate::error::EntryError;
use crate::runner::{Cmd, CommandRunner};

pub struct MountManager<'r> {
    runner: &'r dyn CommandRunner,
    /// Targets mounted by this run, in mount order. Pre-existing mounts are
    /// deliberately not registered: we only tear down what we set up.
    mounted: Vec<PathBuf>,
}

impl<'r> MountManager<'r> {
    pub fn new(runner: &'r dyn CommandRunner) -> Self {
        MountManager {
            runner,
            mounted: Vec::new(),
        }
    }

    /// Targets registered for teardown, in mount order.
    pub fn mounted(&self) -> &[PathBuf] {
        &self.mounted
    }

    /// Establishes every declared mount, in order. A mount failure is fatal:
    /// a client with an unmountable target has no useful degraded mode.
    pub fn mount_all(&mut self, specs: &[MountSpec]) -> Result<()> {
        if specs.is_empty() {
            tracing::warn!("client role with no mounts configured");
        }
        for spec in specs {
            self.mount_one(spec)?;
        }
        Ok(())
    }

    fn mount_one(&mut self, spec: &MountSpec) -> Result<()> {
        fs::create_dir_all(&spec.target)
            .with_context(|| format!("creating mount target {}", spec.target.display()))?;

        if self.is_mounted(&spec.target)? {
            tracing::info!(target = %spec.target.display(), "already mounted, skipping");
            return Ok(());
        }

        let mut cmd = Cmd::new("mount").args(["-t", "glusterfs"]);
        if !spec.opts.trim().is_empty() {
            cmd = cmd.arg("-o").arg(spec.opts.trim());
        }
        cmd = cmd
            .arg(spec.remote.as_str())
            .arg(spec.target.to_string_lossy());

        if let Err(err) = self.runner.run_checked(&cmd) {
            tracing::error!(
                remote = %spec.remote,
                target = %spec.target.display(),
                error = %err,
                "mount failed"
            );
            return Err(anyhow::Error::from(EntryError::MountFailed {
                remote: spec.remote.clone(),
                target: spec.target.clone(),
            }));
        }

        tracing::info!(remote = %spec.remote, target = %spec.target.display(), "mounted");
        self.mounted.push(spec.target.clone());
        Ok(())
    }

    /// Unmounts registered targets in reverse mount order. A normal unmount
    /// is tried first, then a lazy one; both failing is logged and tolerated,
    /// as is a target that is already gone.
    pub fn unmount_all(&mut self) {
        for target in self.mounted.drain(..).rev() {
            let target_str = target.to_string_lossy().into_owned();

            match is_mounted_at(self.runner, &target) {
                Ok(false) => {
                    tracing::info!(target = %target.display(), "already unmounted");
                    continue;
                }
                Ok(true) => {}
                Err(err) => {
                    tracing::warn!(target = %target.display(), error = %err, "mountpoint check failed");
                }
            }

            tracing::info!(target = %target.display(), "unmounting");
            let normal = self.runner.run(&Cmd::new("umount").arg(target_str.as_str()));
            match normal {
                Ok(res) if res.success() => continue,
                Ok(res) => {
                    tracing::warn!(target = %target.display(), rc = res.code, "umount failed, trying lazy");
                }
                Err(err) => {
                    tracing::warn!(target = %target.display(), error = %err, "umount failed, trying lazy");
                }
            }
            match self
                .runner
                .run(&Cmd::new("umount").args(["-l", target_str.as_str()]))
            {
                Ok(res) if res.success() => {}
                Ok(res) => {
                    tracing::warn!(target = %target.display(), rc = res.code, "lazy umount failed, giving up")
                }
                Err(err) => {
                    tracing::warn!(target = %target.display(), error = %err, "lazy umount failed, giving up")
                }
            }
        }
    }

    fn is_mounted(&self, target: &Path) -> Result<bool> {
        is_mounted_at(self.runner, target)
    }
}

fn is_mounted_at(runner: &dyn CommandRunner, target: &Path) -> Result<bool> {
    let target = target.to_string_lossy();
    let res = runner.run(&Cmd::new("mountpoint").args(["-q", target.as_ref()]))?;
    Ok(res.success())
}
