mod checkpoint;
pub mod commands;
mod executor;
mod lifecycle;
mod oracle;
mod privilege;
mod strategy;
mod usage;

use thiserror::Error;

pub use checkpoint::{checkpoint_description, classify_checkpoint_failure, CheckpointManager};
pub use executor::{CommandExecutor, CommandOutput, PowerShellExecutor, TIMED_OUT_MESSAGE};
pub use lifecycle::{LifecycleEngine, NoProgress, OperationReport, PackageStatus, ProgressSink};
pub use oracle::{parse_batch_output, InstallationOracle, PackageManagerOracle};
pub use privilege::{PrivilegeGate, StaticPrivilege, SystemPrivilegeGate};
pub use strategy::{command_strategy, reinstall_ladder, restore_ladder, InstallStrategy};
pub use usage::{scan_unused_packages, UnusedPackage};

/// Request-level errors. Per-package failures never surface here; they are
/// recorded on the aggregate instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("invalid package id '{id}': {reason}")]
    InvalidPackageId { id: String, reason: String },
    #[error("no packages selected for {operation}")]
    EmptySelection { operation: &'static str },
}

#[cfg(test)]
mod tests;
