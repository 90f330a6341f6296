mod catalog;
mod checkpoint;
mod config;
mod operation;
mod outcome;

pub use catalog::{validate_package_id, Catalog, PackageDescriptor, PolicyTweak};
pub use checkpoint::{Checkpoint, CheckpointFailure, CheckpointOutcome};
pub use config::{AppConfig, EngineConfig, LoggingConfig};
pub use operation::Operation;
pub use outcome::{
    AbortReason, AggregateResult, FailureKind, OperationKind, OperationOutcome, Outcome,
    StrategyAttempt, StrategyKind, TweakOutcome, MANUAL_REINSTALL_ADVICE,
};
