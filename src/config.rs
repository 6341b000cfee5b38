//! Declarative configuration, loaded from YAML by an external orchestrator
//! (compose file, init container, operator). The structs here are read-only
//! for the lifetime of one run; validation happens once at load time so every
//! later component can assume a well-formed declaration.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::EntryError;

pub const CONFIG_PATH_DEFAULT: &str = "/etc/gluster-container/config.yaml";

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub role: Option<String>,
    /// Peer hostnames to probe before volume reconciliation.
    #[serde(default)]
    pub peers: Vec<String>,
    #[serde(default)]
    pub volumes: Vec<VolumeSpec>,
    #[serde(default)]
    pub mounts: Vec<MountSpec>,
}

/// One declared gluster volume. Bricks are brick-root directories; the
/// reconciler appends the volume name to each and qualifies unqualified
/// entries with the resolved local brick host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub name: String,
    #[serde(default)]
    pub bricks: Vec<String>,
    #[serde(default)]
    pub replica: Option<u32>,
    #[serde(default)]
    pub arbiter: Option<u32>,
    #[serde(default)]
    pub disperse: Option<u32>,
    #[serde(default)]
    pub redundancy: Option<u32>,
    #[serde(default = "default_transport")]
    pub transport: String,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    #[serde(default)]
    pub options_reset: Vec<String>,
    #[serde(default)]
    pub quota: Option<QuotaSpec>,
}

fn default_transport() -> String {
    "tcp".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaSpec {
    pub limit: String,
    #[serde(default)]
    pub soft_limit_pct: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountSpec {
    pub remote: String,
    pub target: PathBuf,
    #[serde(default)]
    pub opts: String,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(EntryError::ConfigMissing(path.to_path_buf()).into());
        }
        let raw = fs::read_to_string(path).map_err(|e| EntryError::ConfigUnreadable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let cfg: Config =
            serde_yaml::from_str(&raw).map_err(|e| EntryError::ConfigMalformed {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        cfg.validate(path)?;
        Ok(cfg)
    }

    /// Structural validation, before any external command is issued.
    fn validate(&self, path: &Path) -> Result<()> {
        let malformed = |reason: String| -> anyhow::Error {
            EntryError::ConfigMalformed {
                path: path.to_path_buf(),
                reason,
            }
            .into()
        };

        let mut seen = HashSet::new();
        for vol in &self.volumes {
            if vol.name.is_empty() {
                return Err(malformed("volume with empty name".to_string()));
            }
            if !seen.insert(vol.name.as_str()) {
                return Err(malformed(format!("duplicate volume name: {}", vol.name)));
            }
            for brick in &vol.bricks {
                if brick_path(brick).is_relative() {
                    return Err(malformed(format!(
                        "volume {}: brick path is not absolute: {brick}",
                        vol.name
                    )));
                }
            }
            if let Some(replica) = vol.replica
                && (vol.bricks.len() as u32) < replica
            {
                return Err(malformed(format!(
                    "volume {}: {} brick(s) declared but replica={replica}",
                    vol.name,
                    vol.bricks.len()
                )));
            }
        }

        for m in &self.mounts {
            if m.remote.is_empty() {
                return Err(malformed(format!(
                    "mount at {}: missing remote",
                    m.target.display()
                )));
            }
            if m.target.is_relative() {
                return Err(malformed(format!(
                    "mount target is not absolute: {}",
                    m.target.display()
                )));
            }
        }
        Ok(())
    }
}

/// Splits an optionally host-qualified brick entry into its parts.
/// `node1:/bricks/b1` -> `(Some("node1"), "/bricks/b1")`; a bare path keeps
/// no host. Only `host:/abs/path` counts as qualified so plain paths with
/// colons elsewhere are left alone.
pub fn split_brick(entry: &str) -> (Option<&str>, &str) {
    if let Some((host, path)) = entry.split_once(':')
        && !host.is_empty()
        && !host.contains('/')
        && path.starts_with('/')
    {
        return (Some(host), path);
    }
    (None, entry)
}

fn brick_path(entry: &str) -> &Path {
    Path::new(split_brick(entry).1)
}
