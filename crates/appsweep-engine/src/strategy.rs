use std::sync::Arc;
use std::time::Duration;

use appsweep_core::StrategyKind;

use crate::commands::{register_by_family, reprovision_package, reregister_package};
use crate::executor::CommandExecutor;

/// One way of bringing a package back. `attempt` only reports whether the
/// command ran; the engine decides success by asking the oracle afterwards.
pub trait InstallStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    fn attempt(&self, id: &str) -> Result<(), String>;
}

struct CommandStrategy {
    kind: StrategyKind,
    executor: Arc<dyn CommandExecutor>,
    timeout: Duration,
    build: fn(&str) -> String,
}

impl InstallStrategy for CommandStrategy {
    fn kind(&self) -> StrategyKind {
        self.kind
    }

    fn attempt(&self, id: &str) -> Result<(), String> {
        let result = self.executor.execute(&(self.build)(id), self.timeout);
        if result.success {
            Ok(())
        } else {
            Err(result.summary())
        }
    }
}

pub fn command_strategy(
    kind: StrategyKind,
    executor: Arc<dyn CommandExecutor>,
    timeout: Duration,
) -> Box<dyn InstallStrategy> {
    let build: fn(&str) -> String = match kind {
        StrategyKind::Reregister => reregister_package,
        StrategyKind::Provisioned => reprovision_package,
        StrategyKind::FamilyRegistration => register_by_family,
    };
    Box::new(CommandStrategy {
        kind,
        executor,
        timeout,
        build,
    })
}

/// Re-register, re-provision, then register by family.
pub fn reinstall_ladder(
    executor: Arc<dyn CommandExecutor>,
    timeout: Duration,
) -> Vec<Box<dyn InstallStrategy>> {
    [
        StrategyKind::Reregister,
        StrategyKind::Provisioned,
        StrategyKind::FamilyRegistration,
    ]
    .into_iter()
    .map(|kind| command_strategy(kind, executor.clone(), timeout))
    .collect()
}

/// The reinstall ladder without the family-registration fallback.
pub fn restore_ladder(
    executor: Arc<dyn CommandExecutor>,
    timeout: Duration,
) -> Vec<Box<dyn InstallStrategy>> {
    [StrategyKind::Reregister, StrategyKind::Provisioned]
        .into_iter()
        .map(|kind| command_strategy(kind, executor.clone(), timeout))
        .collect()
}
