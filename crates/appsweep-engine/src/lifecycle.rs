use std::collections::HashSet;
use std::sync::Arc;

use appsweep_core::{
    validate_package_id, AbortReason, AggregateResult, Catalog, Checkpoint, EngineConfig,
    FailureKind, Operation, OperationKind, OperationOutcome, StrategyAttempt, TweakOutcome,
};
use chrono::Local;
use tracing::{debug, info, warn};

use crate::checkpoint::CheckpointManager;
use crate::commands::{apply_policy_tweak, purge_cleanup_target, remove_package, repair_package_store};
use crate::executor::CommandExecutor;
use crate::oracle::{InstallationOracle, PackageManagerOracle};
use crate::privilege::PrivilegeGate;
use crate::strategy::{reinstall_ladder, restore_ladder, InstallStrategy};
use crate::usage::{scan_unused_packages, UnusedPackage};
use crate::EngineError;

const UNPRIVILEGED_DIAGNOSTIC: &str = "administrator rights are required";

/// Observes a sweep as it runs. `should_stop` is polled between packages, never
/// while a command is in flight.
pub trait ProgressSink {
    fn sweep_started(&mut self, _operation: OperationKind, _total: usize) {}

    fn package_started(&mut self, _id: &str) {}

    fn package_finished(&mut self, _outcome: &OperationOutcome) {}

    fn should_stop(&self) -> bool {
        false
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationReport {
    Packages(AggregateResult),
    Checkpoint(Checkpoint),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageStatus {
    pub id: String,
    pub description: String,
    pub installed: bool,
}

/// Applies remove, reinstall and restore transitions over catalog packages.
/// Calls are synchronous and packages are processed one at a time in request
/// order.
pub struct LifecycleEngine {
    catalog: Catalog,
    config: EngineConfig,
    executor: Arc<dyn CommandExecutor>,
    privilege: Arc<dyn PrivilegeGate>,
    oracle: Arc<dyn InstallationOracle>,
    checkpoints: CheckpointManager,
    reinstall_ladder: Vec<Box<dyn InstallStrategy>>,
    restore_ladder: Vec<Box<dyn InstallStrategy>>,
}

impl LifecycleEngine {
    pub fn new(
        catalog: Catalog,
        config: EngineConfig,
        executor: Arc<dyn CommandExecutor>,
        privilege: Arc<dyn PrivilegeGate>,
    ) -> Self {
        let timeout = config.command_timeout();
        let oracle = Arc::new(PackageManagerOracle::new(executor.clone(), timeout));
        let checkpoints = CheckpointManager::new(executor.clone(), privilege.clone(), &config);
        Self {
            reinstall_ladder: reinstall_ladder(executor.clone(), timeout),
            restore_ladder: restore_ladder(executor.clone(), timeout),
            catalog,
            config,
            executor,
            privilege,
            oracle,
            checkpoints,
        }
    }

    pub fn with_oracle(mut self, oracle: Arc<dyn InstallationOracle>) -> Self {
        self.oracle = oracle;
        self
    }

    pub fn with_reinstall_ladder(mut self, ladder: Vec<Box<dyn InstallStrategy>>) -> Self {
        self.reinstall_ladder = ladder;
        self
    }

    pub fn with_restore_ladder(mut self, ladder: Vec<Box<dyn InstallStrategy>>) -> Self {
        self.restore_ladder = ladder;
        self
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn run(&self, operation: &Operation) -> Result<OperationReport, EngineError> {
        self.run_with_progress(operation, &mut NoProgress)
    }

    pub fn run_with_progress(
        &self,
        operation: &Operation,
        progress: &mut dyn ProgressSink,
    ) -> Result<OperationReport, EngineError> {
        debug!("running {}", operation.label());
        let result = match operation {
            Operation::RemoveAll => self.remove_all_with_progress(progress)?,
            Operation::Remove(ids) => self.remove_with_progress(ids, progress)?,
            Operation::Reinstall(ids) => self.reinstall_with_progress(ids, progress)?,
            Operation::ReinstallMissing => self.reinstall_missing_with_progress(progress),
            Operation::RestoreDefaults => self.restore_defaults_with_progress(progress),
            Operation::CreateCheckpoint => {
                return Ok(OperationReport::Checkpoint(self.create_checkpoint()))
            }
        };
        Ok(OperationReport::Packages(result))
    }

    pub fn create_checkpoint(&self) -> Checkpoint {
        self.checkpoints.create()
    }

    pub fn remove(&self, ids: &[String]) -> Result<AggregateResult, EngineError> {
        self.remove_with_progress(ids, &mut NoProgress)
    }

    pub fn remove_all(&self) -> Result<AggregateResult, EngineError> {
        self.remove_all_with_progress(&mut NoProgress)
    }

    pub fn reinstall(&self, ids: &[String]) -> Result<AggregateResult, EngineError> {
        self.reinstall_with_progress(ids, &mut NoProgress)
    }

    pub fn reinstall_missing(&self) -> AggregateResult {
        self.reinstall_missing_with_progress(&mut NoProgress)
    }

    pub fn restore_defaults(&self) -> AggregateResult {
        self.restore_defaults_with_progress(&mut NoProgress)
    }

    /// Installed state of every catalog package from one batched query.
    pub fn catalog_status(&self) -> Vec<PackageStatus> {
        let statuses = self.oracle.is_installed_batch(&self.catalog.ids());
        self.catalog
            .packages()
            .iter()
            .map(|package| PackageStatus {
                id: package.id.clone(),
                description: package.display_name().to_string(),
                installed: statuses.get(&package.id).copied().unwrap_or(false),
            })
            .collect()
    }

    pub fn scan_unused(&self, days_threshold: i64) -> anyhow::Result<Vec<UnusedPackage>> {
        scan_unused_packages(
            self.executor.as_ref(),
            self.config.command_timeout(),
            days_threshold,
            Local::now(),
        )
    }

    fn remove_all_with_progress(
        &self,
        progress: &mut dyn ProgressSink,
    ) -> Result<AggregateResult, EngineError> {
        let ids = self.catalog.ids();
        if ids.is_empty() {
            return Err(EngineError::EmptySelection {
                operation: OperationKind::Remove.as_str(),
            });
        }
        Ok(self.remove_selected(ids, true, progress))
    }

    fn remove_with_progress(
        &self,
        ids: &[String],
        progress: &mut dyn ProgressSink,
    ) -> Result<AggregateResult, EngineError> {
        let ids = prepare_selection(ids, OperationKind::Remove)?;
        Ok(self.remove_selected(ids, false, progress))
    }

    fn remove_selected(
        &self,
        ids: Vec<String>,
        remove_all: bool,
        progress: &mut dyn ProgressSink,
    ) -> AggregateResult {
        let Some(mut result) = self.begin(OperationKind::Remove, &ids) else {
            return unprivileged_result(OperationKind::Remove, &ids);
        };

        self.sweep(&mut result, &ids, progress, |id| self.remove_one(id));

        let removed = result
            .per_package
            .iter()
            .filter(|outcome| outcome.is_success())
            .map(|outcome| outcome.package_id.clone())
            .collect::<Vec<_>>();
        result.tweaks = self.apply_tweaks(&removed, remove_all && !result.cancelled);
        self.finish(&result);
        result
    }

    fn remove_one(&self, id: &str) -> OperationOutcome {
        let timeout = self.config.command_timeout();
        let removal = self.executor.execute(&remove_package(id), timeout);
        if !removal.success {
            warn!("failed to remove {id}: {}", removal.summary());
            return OperationOutcome::failed(
                id,
                FailureKind::ExternalCommandFailure,
                removal.summary(),
            );
        }

        if self.config.verify_removal && self.oracle.is_installed(id) {
            warn!("{id} is still installed after removal");
            return OperationOutcome::failed(
                id,
                FailureKind::VerificationMismatch,
                "package is still installed after removal",
            );
        }

        let mut outcome = OperationOutcome::succeeded(id);
        for target in self.catalog.cleanup_targets(id) {
            let purge = self.executor.execute(&purge_cleanup_target(target), timeout);
            if !purge.success {
                warn!("failed to purge {target} for {id}: {}", purge.summary());
                outcome.cleanup_failures.push(target.clone());
            }
        }
        info!("removed {id}");
        outcome
    }

    fn reinstall_with_progress(
        &self,
        ids: &[String],
        progress: &mut dyn ProgressSink,
    ) -> Result<AggregateResult, EngineError> {
        let ids = prepare_selection(ids, OperationKind::Reinstall)?;
        let Some(mut result) = self.begin(OperationKind::Reinstall, &ids) else {
            return Ok(unprivileged_result(OperationKind::Reinstall, &ids));
        };
        self.sweep(&mut result, &ids, progress, |id| {
            self.climb_ladder(id, &self.reinstall_ladder)
        });
        self.finish(&result);
        Ok(result)
    }

    fn reinstall_missing_with_progress(&self, progress: &mut dyn ProgressSink) -> AggregateResult {
        if !self.privilege.is_elevated() {
            return unprivileged_result(OperationKind::Reinstall, &[]);
        }

        let statuses = self.oracle.is_installed_batch(&self.catalog.ids());
        let missing = self
            .catalog
            .ids()
            .into_iter()
            .filter(|id| !statuses.get(id).copied().unwrap_or(false))
            .collect::<Vec<_>>();
        if missing.is_empty() {
            info!("every catalog package is already installed");
            return AggregateResult::new(OperationKind::Reinstall);
        }

        let Some(mut result) = self.begin(OperationKind::Reinstall, &missing) else {
            return unprivileged_result(OperationKind::Reinstall, &missing);
        };
        self.sweep(&mut result, &missing, progress, |id| {
            self.climb_ladder(id, &self.reinstall_ladder)
        });
        self.finish(&result);
        result
    }

    fn restore_defaults_with_progress(&self, progress: &mut dyn ProgressSink) -> AggregateResult {
        let ids = self.catalog.ids();
        let Some(mut result) = self.begin(OperationKind::RestoreDefaults, &ids) else {
            return unprivileged_result(OperationKind::RestoreDefaults, &ids);
        };

        let statuses = self.oracle.is_installed_batch(&ids);
        self.sweep(&mut result, &ids, progress, |id| {
            if statuses.get(id).copied().unwrap_or(false) {
                debug!("{id} is already installed");
                let mut outcome = OperationOutcome::succeeded(id);
                outcome.already_present = true;
                return outcome;
            }
            self.climb_ladder(id, &self.restore_ladder)
        });

        let repair = self
            .executor
            .execute(&repair_package_store(), self.config.command_timeout());
        if repair.success {
            info!("requested package store repair");
        } else {
            warn!("package store repair failed: {}", repair.summary());
        }

        self.finish(&result);
        result
    }

    /// Tries each strategy in order and asks the oracle after every attempt;
    /// a strategy's own exit status never decides the outcome.
    fn climb_ladder(&self, id: &str, ladder: &[Box<dyn InstallStrategy>]) -> OperationOutcome {
        let mut attempts = Vec::with_capacity(ladder.len());
        for strategy in ladder {
            let kind = strategy.kind();
            let (command_succeeded, diagnostic) = match strategy.attempt(id) {
                Ok(()) => (true, None),
                Err(diagnostic) => (false, Some(diagnostic)),
            };
            let verified = self.oracle.is_installed(id);
            attempts.push(StrategyAttempt {
                strategy: kind,
                command_succeeded,
                verified,
                diagnostic,
            });

            if verified {
                info!("reinstalled {id} via {kind}");
                let mut outcome = OperationOutcome::succeeded(id);
                outcome.strategy_used = Some(kind);
                outcome.attempts = attempts;
                return outcome;
            }
            if command_succeeded {
                debug!("{kind} reported success for {id} but it is not installed");
            } else {
                debug!("{kind} failed for {id}");
            }
        }

        warn!("all reinstall strategies failed for {id}");
        let last = attempts
            .last()
            .and_then(|attempt| attempt.diagnostic.clone())
            .map(|diagnostic| format!(" (last error: {diagnostic})"))
            .unwrap_or_default();
        let mut outcome = OperationOutcome::failed(
            id,
            FailureKind::StrategiesExhausted,
            format!(
                "still not installed after {} strategies{last}; reinstall it manually from the Microsoft Store",
                attempts.len()
            ),
        );
        outcome.attempts = attempts;
        outcome
    }

    /// Privilege gate then checkpoint. `None` means the caller lacks rights and
    /// nothing was touched.
    fn begin(&self, kind: OperationKind, ids: &[String]) -> Option<AggregateResult> {
        if !self.privilege.is_elevated() {
            warn!(
                "refusing to {} {} packages without administrator rights",
                kind.as_str(),
                ids.len()
            );
            return None;
        }
        let mut result = AggregateResult::new(kind);
        result.checkpoint = Some(self.checkpoints.create());
        Some(result)
    }

    fn sweep<F>(
        &self,
        result: &mut AggregateResult,
        ids: &[String],
        progress: &mut dyn ProgressSink,
        mut process: F,
    ) where
        F: FnMut(&str) -> OperationOutcome,
    {
        progress.sweep_started(result.operation, ids.len());
        for id in ids {
            if progress.should_stop() {
                info!("{} cancelled after {} packages", result.operation.as_str(), result.attempted());
                result.cancelled = true;
                break;
            }
            progress.package_started(id);
            let outcome = process(id);
            progress.package_finished(&outcome);
            result.record(outcome);
        }
    }

    fn apply_tweaks(&self, removed: &[String], remove_all: bool) -> Vec<TweakOutcome> {
        self.catalog
            .tweaks_for_removal(removed, remove_all)
            .into_iter()
            .map(|tweak| {
                let applied = self
                    .executor
                    .execute(&apply_policy_tweak(tweak), self.config.command_timeout());
                if applied.success {
                    info!("applied policy tweak {}", tweak.id);
                    TweakOutcome {
                        tweak_id: tweak.id.clone(),
                        applied: true,
                        diagnostic: None,
                    }
                } else {
                    warn!("failed to apply policy tweak {}: {}", tweak.id, applied.summary());
                    TweakOutcome {
                        tweak_id: tweak.id.clone(),
                        applied: false,
                        diagnostic: Some(applied.summary()),
                    }
                }
            })
            .collect()
    }

    fn finish(&self, result: &AggregateResult) {
        info!("{}: {}", result.operation.as_str(), result.summary_line());
    }
}

fn prepare_selection(ids: &[String], kind: OperationKind) -> Result<Vec<String>, EngineError> {
    let mut seen = HashSet::new();
    let mut selection = Vec::with_capacity(ids.len());
    for id in ids {
        validate_package_id(id).map_err(|err| EngineError::InvalidPackageId {
            id: id.clone(),
            reason: err.to_string(),
        })?;
        if seen.insert(id.as_str()) {
            selection.push(id.clone());
        }
    }
    if selection.is_empty() {
        return Err(EngineError::EmptySelection {
            operation: kind.as_str(),
        });
    }
    Ok(selection)
}

fn unprivileged_result(kind: OperationKind, ids: &[String]) -> AggregateResult {
    let mut result = AggregateResult::new(kind);
    result.aborted = Some(AbortReason::Unprivileged);
    for id in ids {
        result.record(OperationOutcome::failed(
            id.as_str(),
            FailureKind::Unprivileged,
            UNPRIVILEGED_DIAGNOSTIC,
        ));
    }
    result
}
