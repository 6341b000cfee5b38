pub mod config;
pub mod error;
pub mod lifecycle;
pub mod mounts;
pub mod probe;
pub mod reconcile;
pub mod resolver;
pub mod runner;
pub mod statedir;
pub mod supervisor;

// re-export selected public API
pub use config::{Config, MountSpec, QuotaSpec, VolumeSpec};
pub use error::{EntryError, exit, exit_code_for};
pub use lifecycle::{Context, Role, Settings};
pub use reconcile::{ReconcileReport, Reconciler};
pub use runner::{ChildHandle, Cmd, CommandFailed, CommandResult, CommandRunner, ShellRunner};
