//! Declarative volume reconciliation.
//!
//! The daemon is the source of truth: every pass re-queries live state and
//! issues only the commands needed to converge, so a pass is safe to repeat
//! after a partial failure or a container restart. Creation and directory
//! preparation are fatal; option, reset and start failures are tolerated
//! because a partially configured but running volume beats none at all.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::config::{QuotaSpec, VolumeSpec, split_brick};
use crate::error::EntryError;
use crate::runner::{Cmd, CommandRunner};

/// What one reconciliation pass actually did, keyed by volume name. Purely
/// observational; the daemon remains authoritative.
#[derive(Debug, Default, Serialize)]
pub struct ReconcileReport {
    pub created: Vec<String>,
    pub started: Vec<String>,
    pub options_set: BTreeMap<String, BTreeMap<String, String>>,
    pub options_reset: BTreeMap<String, Vec<String>>,
    pub quota: BTreeMap<String, QuotaSpec>,
}

pub struct Reconciler<'r> {
    runner: &'r dyn CommandRunner,
    brick_host_override: Option<String>,
    resolved_host: Option<String>,
}

impl<'r> Reconciler<'r> {
    pub fn new(runner: &'r dyn CommandRunner, brick_host_override: Option<String>) -> Self {
        Reconciler {
            runner,
            brick_host_override,
            resolved_host: None,
        }
    }

    /// One full pass over the declaration, in declaration order.
    pub fn run(&mut self, peers: &[String], volumes: &[VolumeSpec]) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        for host in peers {
            if host.is_empty() {
                continue;
            }
            // Probing an already-probed peer is a no-op at the daemon level.
            let res = self
                .runner
                .run(&Cmd::new("gluster").args(["peer", "probe", host.as_str()]))?;
            if !res.success() {
                tracing::warn!(host = %host, rc = res.code, stderr = %res.stderr.trim(), "peer probe failed");
            }
        }

        for vol in volumes {
            self.reconcile_volume(vol, &mut report)
                .with_context(|| format!("reconciling volume {}", vol.name))?;
        }
        Ok(report)
    }

    fn reconcile_volume(&mut self, vol: &VolumeSpec, report: &mut ReconcileReport) -> Result<()> {
        self.ensure_brick_dirs(vol)?;

        if !self.volume_exists(&vol.name)? {
            self.create_volume(vol)?;
            report.created.push(vol.name.clone());
        } else {
            tracing::info!(volume = %vol.name, "volume already exists");
        }

        for (key, value) in &vol.options {
            let res = self
                .runner
                .run(&Cmd::new("gluster").args([
                    "volume",
                    "set",
                    vol.name.as_str(),
                    key.as_str(),
                    value.as_str(),
                ]))?;
            if res.success() {
                tracing::info!(volume = %vol.name, key = %key, value = %value, "option set");
            } else {
                tracing::warn!(
                    volume = %vol.name, key = %key, rc = res.code,
                    stderr = %res.stderr.trim(), "option set failed, continuing"
                );
            }
        }
        if !vol.options.is_empty() {
            report
                .options_set
                .insert(vol.name.clone(), vol.options.clone());
        }

        for key in &vol.options_reset {
            let res = self
                .runner
                .run(&Cmd::new("gluster").args([
                    "volume",
                    "reset",
                    vol.name.as_str(),
                    key.as_str(),
                ]))?;
            if res.success() {
                tracing::info!(volume = %vol.name, key = %key, "option reset");
            } else {
                tracing::warn!(
                    volume = %vol.name, key = %key, rc = res.code,
                    stderr = %res.stderr.trim(), "option reset failed, continuing"
                );
            }
        }
        if !vol.options_reset.is_empty() {
            report
                .options_reset
                .insert(vol.name.clone(), vol.options_reset.clone());
        }

        if let Some(quota) = &vol.quota {
            self.configure_quota(&vol.name, quota)?;
            report.quota.insert(vol.name.clone(), quota.clone());
        }

        if !self.volume_running(&vol.name)? {
            let res = self
                .runner
                .run(&Cmd::new("gluster").args(["volume", "start", vol.name.as_str()]))?;
            if res.success() {
                tracing::info!(volume = %vol.name, "volume started");
            } else {
                // An already-started volume answers non-zero here too.
                tracing::warn!(
                    volume = %vol.name, rc = res.code,
                    stderr = %res.stderr.trim(), "volume start failed, continuing"
                );
            }
            report.started.push(vol.name.clone());
        } else {
            tracing::info!(volume = %vol.name, "volume already running");
        }

        Ok(())
    }

    /// Creates brick root and per-volume brick directories for every brick
    /// that lives on this host, and verifies they are writable. Failures here
    /// are fatal: a volume created over broken bricks only fails later and
    /// more confusingly.
    fn ensure_brick_dirs(&self, vol: &VolumeSpec) -> Result<()> {
        for brick in &vol.bricks {
            let (host, root) = split_brick(brick);
            if host.is_some() {
                // Remote bricks are prepared by their own node's entrypoint.
                continue;
            }
            let brick_dir = Path::new(root).join(&vol.name);
            fs::create_dir_all(&brick_dir)
                .with_context(|| format!("creating brick directory {}", brick_dir.display()))?;
            ensure_writable(&brick_dir)?;
        }
        Ok(())
    }

    fn volume_exists(&self, name: &str) -> Result<bool> {
        let res = self
            .runner
            .run(&Cmd::new("gluster").args(["--mode=script", "volume", "info", name]))?;
        let exists = res.stdout.contains(&format!("Volume Name: {name}"));
        tracing::debug!(volume = %name, exists, "volume existence query");
        Ok(exists)
    }

    fn volume_running(&self, name: &str) -> Result<bool> {
        let res = self
            .runner
            .run(&Cmd::new("gluster").args(["--mode=script", "volume", "status", name]))?;
        let running = res.success() && res.stdout.contains("Status of volume");
        tracing::debug!(volume = %name, running, "volume status query");
        Ok(running)
    }

    fn create_volume(&mut self, vol: &VolumeSpec) -> Result<()> {
        let addresses = self.brick_addresses(vol)?;

        let mut cmd = Cmd::new("gluster").args(["volume", "create", vol.name.as_str()]);
        if let Some(replica) = vol.replica {
            cmd = cmd.arg("replica").arg(replica.to_string());
            if let Some(arbiter) = vol.arbiter {
                cmd = cmd.arg("arbiter").arg(arbiter.to_string());
            }
        }
        if let Some(disperse) = vol.disperse {
            cmd = cmd.arg("disperse").arg(disperse.to_string());
            if let Some(redundancy) = vol.redundancy {
                cmd = cmd.arg("redundancy").arg(redundancy.to_string());
            }
        }
        cmd = cmd.arg("transport").arg(vol.transport.as_str());
        cmd = cmd.args(addresses.iter().cloned());
        // force: bricks may be pre-existing directories from an earlier run.
        cmd = cmd.arg("force");

        self.runner
            .run_checked(&cmd)
            .with_context(|| format!("creating volume {}", vol.name))?;
        tracing::info!(volume = %vol.name, bricks = ?addresses, "volume created");
        Ok(())
    }

    /// Pairs each brick path with its host: qualified entries keep their
    /// host, unqualified ones get the resolved local brick host.
    fn brick_addresses(&mut self, vol: &VolumeSpec) -> Result<Vec<String>> {
        let mut addresses = Vec::with_capacity(vol.bricks.len());
        for brick in &vol.bricks {
            let (host, root) = split_brick(brick);
            let dir = Path::new(root).join(&vol.name);
            let host = match host {
                Some(h) => h.to_string(),
                None => self.local_brick_host()?,
            };
            addresses.push(format!("{host}:{}", dir.display()));
        }
        Ok(addresses)
    }

    /// Local address used for unqualified bricks: the override when it is
    /// locally reachable, else the first address `hostname -I` reports, else
    /// loopback. Resolved once per pass.
    fn local_brick_host(&mut self) -> Result<String> {
        if let Some(host) = &self.resolved_host {
            return Ok(host.clone());
        }

        let local_ips = self.local_addresses()?;
        let host = match &self.brick_host_override {
            Some(over)
                if over == "127.0.0.1"
                    || over == "localhost"
                    || local_ips.iter().any(|ip| ip == over) =>
            {
                over.clone()
            }
            Some(over) => {
                let fallback = local_ips
                    .first()
                    .cloned()
                    .unwrap_or_else(|| "127.0.0.1".to_string());
                tracing::warn!(
                    from = %over, to = %fallback,
                    "brick host override is not a local address, correcting"
                );
                fallback
            }
            None => local_ips
                .first()
                .cloned()
                .unwrap_or_else(|| "127.0.0.1".to_string()),
        };

        tracing::info!(brick_host = %host, "resolved brick host");
        self.resolved_host = Some(host.clone());
        Ok(host)
    }

    fn local_addresses(&self) -> Result<Vec<String>> {
        let res = self.runner.run(&Cmd::new("hostname").arg("-I"))?;
        Ok(res
            .stdout
            .split_whitespace()
            .map(str::to_string)
            .collect())
    }

    fn configure_quota(&self, name: &str, quota: &QuotaSpec) -> Result<()> {
        // Validate before issuing any quota command: a bad percentage must
        // not leave the subsystem half-configured.
        let pct = quota
            .soft_limit_pct
            .as_deref()
            .map(|raw| parse_soft_limit_pct(name, raw))
            .transpose()?;

        let enable = self
            .runner
            .run(&Cmd::new("gluster").args(["volume", "quota", name, "enable"]))?;
        if !enable.success() {
            // Already enabled answers non-zero on some versions.
            tracing::debug!(volume = %name, rc = enable.code, "quota enable not clean, continuing");
        }

        self.runner
            .run_checked(
                &Cmd::new("gluster").args([
                    "volume",
                    "quota",
                    name,
                    "limit-usage",
                    "/",
                    quota.limit.as_str(),
                ]),
            )
            .with_context(|| format!("setting quota limit on {name}"))?;

        if let Some(pct) = pct {
            let pct = pct.to_string();
            self.runner.run_checked(&Cmd::new("gluster").args([
                "volume",
                "quota",
                name,
                "default-soft-limit",
                pct.as_str(),
            ]))?;
        }
        tracing::info!(volume = %name, limit = %quota.limit, soft_limit_pct = ?quota.soft_limit_pct, "quota configured");
        Ok(())
    }
}

/// Accepts `80`, `80%`, ` 80 ` and the like; anything outside 0-100 or
/// non-numeric is a fatal configuration error.
fn parse_soft_limit_pct(volume: &str, raw: &str) -> Result<u32> {
    let trimmed = raw.trim().trim_end_matches('%').trim();
    let invalid = || EntryError::InvalidQuota {
        volume: volume.to_string(),
        value: raw.to_string(),
    };
    let pct: u32 = trimmed.parse().map_err(|_| invalid())?;
    if pct > 100 {
        return Err(invalid().into());
    }
    Ok(pct)
}

fn ensure_writable(dir: &Path) -> Result<()> {
    let probe: PathBuf = dir.join(".write_probe");
    fs::write(&probe, b"probe")
        .with_context(|| format!("brick directory {} is not writable", dir.display()))?;
    let _ = fs::remove_file(&probe);
    Ok(())
}
