use std::path::PathBuf;

use thiserror::Error;

/// Stable process exit codes, one per fatal failure class. Operators script on
/// these, so the numbers never change between releases.
pub mod exit {
    pub const UNKNOWN_ROLE: i32 = 2;
    pub const MISSING_COMMAND: i32 = 10;
    pub const CONFIG_MISSING: i32 = 20;
    pub const CONFIG_MALFORMED: i32 = 21;
    pub const CONFIG_UNREADABLE: i32 = 22;
    pub const STATEDIR_BACKUP_FAILED: i32 = 24;
    pub const WRONG_BINARY_VARIANT: i32 = 27;
    pub const BINARY_NOT_FOUND: i32 = 28;
    pub const ALL_VARIANTS_FAILED: i32 = 29;
    pub const READY_TIMEOUT: i32 = 30;
    pub const DAEMON_EXITED: i32 = 31;
    pub const MOUNT_FAILED: i32 = 41;
    pub const INTERNAL: i32 = 99;
    pub const INTERRUPTED: i32 = 130;
}

/// Fatal failure taxonomy. Everything that terminates the process goes through
/// one of these variants so the exit code stays predictable; tolerated failures
/// (option set, volume start, unmount) are logged and never reach this type.
#[derive(Debug, Error)]
pub enum EntryError {
    #[error("unknown role: {0}")]
    UnknownRole(String),

    #[error("required command not found: {0}")]
    MissingCommand(String),

    #[error("config file not found: {0}")]
    ConfigMissing(PathBuf),

    #[error("config file is malformed: {path}: {reason}")]
    ConfigMalformed { path: PathBuf, reason: String },

    #[error("config file is unreadable: {path}: {reason}")]
    ConfigUnreadable { path: PathBuf, reason: String },

    #[error("could not move aside existing path {path} for symlink setup: {reason}")]
    StatedirBackupFailed { path: PathBuf, reason: String },

    #[error("volume {volume}: invalid quota soft_limit_pct {value:?} (expected integer 0-100)")]
    InvalidQuota { volume: String, value: String },

    #[error("wrong glusterd binary at {path} (client build detected)")]
    WrongBinaryVariant { path: PathBuf, help_excerpt: String },

    #[error("no glusterd binary found; is glusterfs-server installed?")]
    BinaryNotFound,

    #[error("all glusterd startup variants failed (last rc={last_rc:?})")]
    AllVariantsFailed { last_rc: Option<i32> },

    #[error("glusterd did not become ready within {timeout_secs}s")]
    ReadyTimeout {
        timeout_secs: u64,
        last_stderr: String,
    },

    #[error("glusterd exited unexpectedly (rc={rc:?})")]
    DaemonExited { rc: Option<i32> },

    #[error("mount of {remote} at {target} failed")]
    MountFailed { remote: String, target: PathBuf },
}

impl EntryError {
    pub fn exit_code(&self) -> i32 {
        match self {
            EntryError::UnknownRole(_) => exit::UNKNOWN_ROLE,
            EntryError::MissingCommand(_) => exit::MISSING_COMMAND,
            EntryError::ConfigMissing(_) => exit::CONFIG_MISSING,
            EntryError::ConfigMalformed { .. } => exit::CONFIG_MALFORMED,
            EntryError::ConfigUnreadable { .. } => exit::CONFIG_UNREADABLE,
            EntryError::StatedirBackupFailed { .. } => exit::STATEDIR_BACKUP_FAILED,
            EntryError::InvalidQuota { .. } => exit::CONFIG_MALFORMED,
            EntryError::WrongBinaryVariant { .. } => exit::WRONG_BINARY_VARIANT,
            EntryError::BinaryNotFound => exit::BINARY_NOT_FOUND,
            EntryError::AllVariantsFailed { .. } => exit::ALL_VARIANTS_FAILED,
            EntryError::ReadyTimeout { .. } => exit::READY_TIMEOUT,
            EntryError::DaemonExited { .. } => exit::DAEMON_EXITED,
            EntryError::MountFailed { .. } => exit::MOUNT_FAILED,
        }
    }
}

/// Exit code for an arbitrary error chain: the first `EntryError` in the chain
/// wins, anything else is an internal error.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<EntryError>() {
            return e.exit_code();
        }
    }
    exit::INTERNAL
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn exit_code_found_through_context_chain() {
        let err = anyhow::Error::from(EntryError::BinaryNotFound).context("starting server");
        assert_eq!(exit_code_for(&err), exit::BINARY_NOT_FOUND);
    }

    #[test]
    fn unknown_errors_map_to_internal() {
        let err = anyhow::anyhow!("something else");
        assert_eq!(exit_code_for(&err), exit::INTERNAL);
    }
}
