use super::*;

use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsString;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use appsweep_core::{
    Catalog, CheckpointFailure, CheckpointOutcome, EngineConfig, FailureKind, Operation,
    OperationKind, OperationOutcome, PackageDescriptor, PolicyTweak, StrategyKind,
};
use chrono::{Local, TimeZone, Utc};
use serde_json::json;

use crate::commands::{
    batch_installed_query, installed_query, normalize_registry_path, program_inventory_events_json,
    purge_cleanup_target, quote, remove_package, reregister_package,
};
use crate::privilege::{
    command_line_argument, groups_indicate_elevation, relaunch_script, uid_is_root,
};
use crate::usage::{event_app_id, filetime_to_local, parse_last_accessed, unused_from_json};

type Responder = Box<dyn Fn(&str) -> CommandOutput + Send + Sync>;

struct RecordingExecutor {
    commands: Mutex<Vec<String>>,
    respond: Responder,
}

impl RecordingExecutor {
    fn succeeding() -> Arc<Self> {
        Self::responding(|_| CommandOutput::ok(""))
    }

    fn responding(respond: impl Fn(&str) -> CommandOutput + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            commands: Mutex::new(Vec::new()),
            respond: Box::new(respond),
        })
    }

    fn commands(&self) -> Vec<String> {
        self.commands.lock().expect("commands lock").clone()
    }

    fn count_containing(&self, needle: &str) -> usize {
        self.commands()
            .iter()
            .filter(|command| command.contains(needle))
            .count()
    }
}

impl CommandExecutor for RecordingExecutor {
    fn execute(&self, command: &str, _timeout: Duration) -> CommandOutput {
        self.commands
            .lock()
            .expect("commands lock")
            .push(command.to_string());
        (self.respond)(command)
    }
}

#[derive(Default)]
struct FakeOracle {
    installed: Mutex<BTreeSet<String>>,
    single_queries: Mutex<Vec<String>>,
}

impl FakeOracle {
    fn with_installed(ids: &[&str]) -> Arc<Self> {
        let oracle = Self::default();
        oracle
            .installed
            .lock()
            .expect("installed lock")
            .extend(ids.iter().map(|id| id.to_string()));
        Arc::new(oracle)
    }

    fn install(&self, id: &str) {
        self.installed
            .lock()
            .expect("installed lock")
            .insert(id.to_string());
    }

    fn single_queries(&self) -> Vec<String> {
        self.single_queries.lock().expect("queries lock").clone()
    }
}

impl InstallationOracle for FakeOracle {
    fn is_installed(&self, id: &str) -> bool {
        self.single_queries
            .lock()
            .expect("queries lock")
            .push(id.to_string());
        self.installed.lock().expect("installed lock").contains(id)
    }

    fn is_installed_batch(&self, ids: &[String]) -> BTreeMap<String, bool> {
        let installed = self.installed.lock().expect("installed lock");
        ids.iter()
            .map(|id| (id.clone(), installed.contains(id)))
            .collect()
    }
}

struct ScriptedStrategy {
    kind: StrategyKind,
    oracle: Arc<FakeOracle>,
    installs: Vec<String>,
    command_ok: bool,
    calls: Arc<Mutex<Vec<(StrategyKind, String)>>>,
}

impl InstallStrategy for ScriptedStrategy {
    fn kind(&self) -> StrategyKind {
        self.kind
    }

    fn attempt(&self, id: &str) -> Result<(), String> {
        self.calls
            .lock()
            .expect("calls lock")
            .push((self.kind, id.to_string()));
        if self.installs.iter().any(|candidate| candidate == id) {
            self.oracle.install(id);
        }
        if self.command_ok {
            Ok(())
        } else {
            Err(format!("{} failed", self.kind))
        }
    }
}

type CallLog = Arc<Mutex<Vec<(StrategyKind, String)>>>;

fn scripted(
    kind: StrategyKind,
    oracle: &Arc<FakeOracle>,
    installs: &[&str],
    command_ok: bool,
    calls: &CallLog,
) -> Box<dyn InstallStrategy> {
    Box::new(ScriptedStrategy {
        kind,
        oracle: oracle.clone(),
        installs: installs.iter().map(|id| id.to_string()).collect(),
        command_ok,
        calls: calls.clone(),
    })
}

fn test_config() -> EngineConfig {
    EngineConfig {
        checkpoint_settle_secs: 0,
        ..EngineConfig::default()
    }
}

fn catalog_of(ids: &[&str]) -> Catalog {
    Catalog::new(
        ids.iter()
            .map(|id| PackageDescriptor::new(*id, format!("{id} description")))
            .collect(),
        Vec::new(),
    )
    .expect("catalog must build")
}

fn engine(
    catalog: Catalog,
    executor: &Arc<RecordingExecutor>,
    oracle: &Arc<FakeOracle>,
    elevated: bool,
) -> LifecycleEngine {
    LifecycleEngine::new(
        catalog,
        test_config(),
        executor.clone(),
        Arc::new(StaticPrivilege(elevated)),
    )
    .with_oracle(oracle.clone())
}

fn ids(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

fn package_ids(outcomes: &[OperationOutcome]) -> Vec<&str> {
    outcomes
        .iter()
        .map(|outcome| outcome.package_id.as_str())
        .collect()
}

#[test]
fn removing_absent_package_succeeds_every_time() {
    let executor = RecordingExecutor::succeeding();
    let oracle = FakeOracle::with_installed(&[]);
    let engine = engine(catalog_of(&["Pkg.X"]), &executor, &oracle, true);

    for _ in 0..2 {
        let result = engine.remove(&ids(&["Pkg.X"])).expect("remove must run");
        assert_eq!(result.counts(), (1, 0));
        assert!(result.succeeded());
    }
    assert_eq!(executor.count_containing("Remove-AppxPackage"), 2);
}

#[test]
fn oracle_requires_registration_but_reregister_finds_staged_payloads() {
    let registered = "$_.PackageUserInformation.InstallState -contains 'Installed'";
    assert!(installed_query("Foo").contains(registered));
    assert!(batch_installed_query(&ids(&["Foo"])).contains(registered));

    let reregister = reregister_package("Foo");
    assert!(reregister.contains("Get-AppxPackage -AllUsers | Where-Object { $_.Name -eq 'Foo' }"));
    assert!(!reregister.contains("InstallState"));
    assert!(reregister.contains("Add-AppxPackage -DisableDevelopmentMode -Register"));
}

#[test]
fn single_query_uses_exact_name_match() {
    let command = installed_query("Foo");
    assert!(command.contains("$_.Name -eq 'Foo'"));
    assert!(!command.contains("-like"));
    assert!(!command.contains("*Foo*"));

    let executor = RecordingExecutor::responding(|_| CommandOutput::ok("NOT_INSTALLED\n"));
    let oracle = PackageManagerOracle::new(executor.clone(), Duration::from_secs(5));
    assert!(!oracle.is_installed("Foo"));

    let executor = RecordingExecutor::responding(|_| CommandOutput::ok("INSTALLED\r\n"));
    let oracle = PackageManagerOracle::new(executor.clone(), Duration::from_secs(5));
    assert!(oracle.is_installed("Foo.Bar"));
}

#[test]
fn batch_parse_rejects_prefix_collisions() {
    let raw = "Foo.Bar---START---\nINSTALLED\n---END---\nFoo---START---\nNOT_INSTALLED\n---END---\n";
    let statuses = parse_batch_output(raw, &ids(&["Foo"]));
    assert_eq!(statuses, BTreeMap::from([("Foo".to_string(), false)]));
}

#[test]
fn batch_result_covers_exactly_the_requested_ids() {
    let requested = ids(&["A", "B", "C"]);
    let raw = "A---START---\r\nINSTALLED\r\n---END---\r\nZ---START---\r\nINSTALLED\r\n---END---\r\ngarbage line\r\n";
    let statuses = parse_batch_output(raw, &requested);

    assert_eq!(
        statuses.keys().cloned().collect::<Vec<_>>(),
        requested
    );
    assert_eq!(statuses["A"], true);
    assert_eq!(statuses["B"], false);
    assert_eq!(statuses["C"], false);
}

#[test]
fn batch_status_outside_a_block_is_ignored() {
    let raw = "INSTALLED\nA---START---\n---END---\nINSTALLED\n";
    let statuses = parse_batch_output(raw, &ids(&["A"]));
    assert_eq!(statuses["A"], false);
}

#[test]
fn batch_query_spawns_once_and_fails_closed() {
    let executor = RecordingExecutor::responding(|_| CommandOutput::failed("boom"));
    let oracle = PackageManagerOracle::new(executor.clone(), Duration::from_secs(5));
    let statuses = oracle.is_installed_batch(&ids(&["A", "B"]));
    assert_eq!(executor.commands().len(), 1);
    assert_eq!(
        statuses,
        BTreeMap::from([("A".to_string(), false), ("B".to_string(), false)])
    );

    let executor = RecordingExecutor::succeeding();
    let oracle = PackageManagerOracle::new(executor.clone(), Duration::from_secs(5));
    assert!(oracle.is_installed_batch(&[]).is_empty());
    assert!(executor.commands().is_empty());
}

#[test]
fn batch_query_reads_package_manager_output() {
    let executor = RecordingExecutor::responding(|_| {
        CommandOutput::ok("A---START---\nNOT_INSTALLED\n---END---\nB---START---\nINSTALLED\n---END---\n")
    });
    let oracle = PackageManagerOracle::new(executor.clone(), Duration::from_secs(5));
    let statuses = oracle.is_installed_batch(&ids(&["A", "B"]));
    assert_eq!(statuses["A"], false);
    assert_eq!(statuses["B"], true);

    let command = &executor.commands()[0];
    assert!(command.contains("@('A','B')"));
    assert!(command.contains("---START---"));
    assert!(command.contains("---END---"));
}

#[test]
fn reinstall_climbs_ladder_in_order_until_verified() {
    let executor = RecordingExecutor::succeeding();
    let oracle = FakeOracle::with_installed(&[]);
    let calls = CallLog::default();
    let engine = engine(catalog_of(&["Pkg.X"]), &executor, &oracle, true).with_reinstall_ladder(
        vec![
            scripted(StrategyKind::Reregister, &oracle, &[], true, &calls),
            scripted(StrategyKind::Provisioned, &oracle, &[], true, &calls),
            scripted(StrategyKind::FamilyRegistration, &oracle, &["Pkg.X"], true, &calls),
        ],
    );

    let result = engine.reinstall(&ids(&["Pkg.X"])).expect("reinstall must run");
    assert_eq!(result.counts(), (1, 0));

    let outcome = &result.per_package[0];
    assert_eq!(outcome.strategy_used, Some(StrategyKind::FamilyRegistration));
    assert_eq!(outcome.strategy_used.map(StrategyKind::rank), Some(3));
    assert_eq!(
        outcome.attempted_strategies(),
        vec![
            StrategyKind::Reregister,
            StrategyKind::Provisioned,
            StrategyKind::FamilyRegistration
        ]
    );
    assert_eq!(
        outcome
            .attempts
            .iter()
            .map(|attempt| attempt.verified)
            .collect::<Vec<_>>(),
        vec![false, false, true]
    );
    assert_eq!(
        calls
            .lock()
            .expect("calls lock")
            .iter()
            .map(|(kind, _)| *kind)
            .collect::<Vec<_>>(),
        outcome.attempted_strategies()
    );
    assert_eq!(oracle.single_queries().len(), 3);
}

#[test]
fn reinstall_trusts_oracle_over_strategy_exit_status() {
    let executor = RecordingExecutor::succeeding();
    let oracle = FakeOracle::with_installed(&[]);
    let calls = CallLog::default();
    let engine = engine(catalog_of(&["Pkg.X"]), &executor, &oracle, true).with_reinstall_ladder(
        vec![
            scripted(StrategyKind::Reregister, &oracle, &["Pkg.X"], false, &calls),
            scripted(StrategyKind::Provisioned, &oracle, &[], true, &calls),
        ],
    );

    let result = engine.reinstall(&ids(&["Pkg.X"])).expect("reinstall must run");
    let outcome = &result.per_package[0];
    assert!(outcome.is_success());
    assert_eq!(outcome.strategy_used, Some(StrategyKind::Reregister));
    assert!(!outcome.attempts[0].command_succeeded);
    assert_eq!(calls.lock().expect("calls lock").len(), 1);
}

#[test]
fn reinstall_exhaustion_reports_manual_store_advice() {
    let executor = RecordingExecutor::succeeding();
    let oracle = FakeOracle::with_installed(&[]);
    let calls = CallLog::default();
    let engine = engine(catalog_of(&["Pkg.X"]), &executor, &oracle, true).with_reinstall_ladder(
        vec![
            scripted(StrategyKind::Reregister, &oracle, &[], true, &calls),
            scripted(StrategyKind::Provisioned, &oracle, &[], false, &calls),
            scripted(StrategyKind::FamilyRegistration, &oracle, &[], false, &calls),
        ],
    );

    let result = engine.reinstall(&ids(&["Pkg.X"])).expect("reinstall must run");
    assert_eq!(result.counts(), (0, 1));
    assert!(!result.succeeded());
    let outcome = &result.per_package[0];
    assert_eq!(outcome.failure, Some(FailureKind::StrategiesExhausted));
    let diagnostic = outcome.diagnostic.as_deref().expect("diagnostic");
    assert!(diagnostic.contains("Microsoft Store"));
    assert!(diagnostic.contains("family-registration failed"));
    assert!(result.advisory().is_some());
}

#[test]
fn partial_success_aggregate() {
    let executor = RecordingExecutor::responding(|command| {
        if command.contains("Remove-AppxPackage") && command.contains("'B'") {
            CommandOutput::failed("Remove-AppxPackage : Access is denied.\nmore detail")
        } else {
            CommandOutput::ok("")
        }
    });
    let oracle = FakeOracle::with_installed(&[]);
    let engine = engine(catalog_of(&["A", "B", "C"]), &executor, &oracle, true);

    let result = engine.remove(&ids(&["A", "B", "C"])).expect("remove must run");
    assert_eq!(result.counts(), (2, 1));
    assert!(result.succeeded());
    assert_eq!(package_ids(&result.per_package), vec!["A", "B", "C"]);

    let failed = &result.per_package[1];
    assert_eq!(failed.failure, Some(FailureKind::ExternalCommandFailure));
    assert_eq!(
        failed.diagnostic.as_deref(),
        Some("Remove-AppxPackage : Access is denied.")
    );
    assert_eq!(result.summary_line(), "Successfully processed 2; Failed 1");
}

#[test]
fn unprivileged_reinstall_never_touches_the_executor() {
    let executor = RecordingExecutor::succeeding();
    let oracle = FakeOracle::with_installed(&[]);
    let calls = CallLog::default();
    let engine = engine(catalog_of(&["A", "B"]), &executor, &oracle, false).with_reinstall_ladder(
        vec![scripted(StrategyKind::Reregister, &oracle, &["A"], true, &calls)],
    );

    let result = engine.reinstall(&ids(&["A", "B"])).expect("reinstall must run");
    assert_eq!(result.counts(), (0, 2));
    assert_eq!(result.aborted, Some(appsweep_core::AbortReason::Unprivileged));
    assert!(result
        .per_package
        .iter()
        .all(|outcome| outcome.failure == Some(FailureKind::Unprivileged)));
    assert!(result.checkpoint.is_none());
    assert!(executor.commands().is_empty());
    assert!(calls.lock().expect("calls lock").is_empty());
    assert!(oracle.single_queries().is_empty());
    assert_eq!(result.advisory(), None);
}

#[test]
fn unprivileged_restore_fails_every_catalog_package() {
    let executor = RecordingExecutor::succeeding();
    let oracle = FakeOracle::with_installed(&["A"]);
    let engine = engine(catalog_of(&["A", "B", "C"]), &executor, &oracle, false);

    let result = engine.restore_defaults();
    assert_eq!(result.counts(), (0, 3));
    assert!(result.aborted.is_some());
    assert!(executor.commands().is_empty());
}

#[test]
fn checkpoint_failure_does_not_block_removal() {
    let executor = RecordingExecutor::responding(|command| {
        if command.contains("Checkpoint-Computer") {
            CommandOutput::failed("Checkpoint-Computer : Access is denied. (0x80070005)")
        } else {
            CommandOutput::ok("")
        }
    });
    let oracle = FakeOracle::with_installed(&[]);
    let engine = engine(catalog_of(&["A"]), &executor, &oracle, true);

    let result = engine.remove(&ids(&["A"])).expect("remove must run");
    assert_eq!(result.counts(), (1, 0));
    let checkpoint = result.checkpoint.expect("checkpoint attempted");
    assert_eq!(
        checkpoint.outcome,
        CheckpointOutcome::Failed(CheckpointFailure::AccessDenied)
    );

    let commands = executor.commands();
    let checkpoint_at = commands
        .iter()
        .position(|command| command.contains("Checkpoint-Computer"))
        .expect("checkpoint command issued");
    let remove_at = commands
        .iter()
        .position(|command| command.contains("Remove-AppxPackage"))
        .expect("remove command issued");
    assert!(checkpoint_at < remove_at);
}

#[test]
fn remove_of_uninstalled_package_without_cleanup_targets() {
    let executor = RecordingExecutor::succeeding();
    let oracle = FakeOracle::with_installed(&[]);
    let engine = engine(catalog_of(&["Pkg.X"]), &executor, &oracle, true);

    let result = engine.remove(&ids(&["Pkg.X"])).expect("remove must run");
    assert_eq!(result.counts(), (1, 0));
    assert_eq!(executor.count_containing(&remove_package("Pkg.X")), 1);
    assert_eq!(executor.count_containing("Remove-Item"), 0);
    assert!(result.per_package[0].cleanup_failures.is_empty());
}

#[test]
fn restore_defaults_short_circuits_and_uses_reduced_ladder() {
    let executor = RecordingExecutor::succeeding();
    let oracle = FakeOracle::with_installed(&["Pkg.Present"]);
    let calls = CallLog::default();
    let engine = engine(
        catalog_of(&["Pkg.Present", "Pkg.Provisioned", "Pkg.Gone"]),
        &executor,
        &oracle,
        true,
    )
    .with_restore_ladder(vec![
        scripted(StrategyKind::Reregister, &oracle, &[], false, &calls),
        scripted(StrategyKind::Provisioned, &oracle, &["Pkg.Provisioned"], true, &calls),
    ]);

    let result = engine.restore_defaults();
    assert_eq!(result.operation, OperationKind::RestoreDefaults);
    assert_eq!(result.counts(), (2, 1));
    assert!(result.succeeded());
    assert_eq!(
        package_ids(&result.per_package),
        vec!["Pkg.Present", "Pkg.Provisioned", "Pkg.Gone"]
    );

    let present = &result.per_package[0];
    assert!(present.is_success());
    assert!(present.already_present);
    assert!(present.attempts.is_empty());

    let provisioned = &result.per_package[1];
    assert_eq!(provisioned.strategy_used, Some(StrategyKind::Provisioned));

    let gone = &result.per_package[2];
    assert_eq!(gone.failure, Some(FailureKind::StrategiesExhausted));
    assert_eq!(
        gone.attempted_strategies(),
        vec![StrategyKind::Reregister, StrategyKind::Provisioned]
    );

    assert!(calls
        .lock()
        .expect("calls lock")
        .iter()
        .all(|(_, id)| id != "Pkg.Present"));
    assert_eq!(executor.count_containing("wsreset.exe"), 1);
    assert!(result.advisory().is_some());
}

#[test]
fn default_restore_ladder_omits_family_registration() {
    let executor: Arc<dyn CommandExecutor> = RecordingExecutor::succeeding();
    let kinds = restore_ladder(executor.clone(), Duration::from_secs(1))
        .iter()
        .map(|strategy| strategy.kind())
        .collect::<Vec<_>>();
    assert_eq!(kinds, vec![StrategyKind::Reregister, StrategyKind::Provisioned]);

    let kinds = reinstall_ladder(executor, Duration::from_secs(1))
        .iter()
        .map(|strategy| strategy.kind())
        .collect::<Vec<_>>();
    assert_eq!(
        kinds,
        vec![
            StrategyKind::Reregister,
            StrategyKind::Provisioned,
            StrategyKind::FamilyRegistration
        ]
    );
}

#[test]
fn command_strategy_reports_command_failure_summary() {
    let executor = RecordingExecutor::responding(|_| {
        CommandOutput::failed("\n  Add-AppxPackage : Deployment failed\nHRESULT: 0x80073CF3")
    });
    let strategy = command_strategy(
        StrategyKind::FamilyRegistration,
        executor.clone(),
        Duration::from_secs(1),
    );
    assert_eq!(
        strategy.attempt("Microsoft.People"),
        Err("Add-AppxPackage : Deployment failed".to_string())
    );
    assert!(executor.commands()[0]
        .contains("Add-AppxPackage -RegisterByFamilyName -MainPackage 'Microsoft.People'"));
}

#[test]
fn removal_is_verified_by_the_oracle() {
    let executor = RecordingExecutor::succeeding();
    let oracle = FakeOracle::with_installed(&["Stubborn.App"]);
    let catalog = Catalog::new(
        vec![PackageDescriptor::new("Stubborn.App", "stubborn")
            .with_cleanup_targets([r"HKCU:\Software\Stubborn"])],
        Vec::new(),
    )
    .expect("catalog must build");
    let engine = engine(catalog, &executor, &oracle, true);

    let result = engine.remove(&ids(&["Stubborn.App"])).expect("remove must run");
    assert_eq!(result.counts(), (0, 1));
    assert_eq!(
        result.per_package[0].failure,
        Some(FailureKind::VerificationMismatch)
    );
    assert_eq!(executor.count_containing("Remove-Item"), 0);
    assert_eq!(oracle.single_queries(), vec!["Stubborn.App"]);
}

#[test]
fn removal_verification_can_be_disabled() {
    let executor = RecordingExecutor::succeeding();
    let oracle = FakeOracle::with_installed(&["Stubborn.App"]);
    let engine = LifecycleEngine::new(
        catalog_of(&["Stubborn.App"]),
        EngineConfig {
            verify_removal: false,
            ..test_config()
        },
        executor.clone(),
        Arc::new(StaticPrivilege(true)),
    )
    .with_oracle(oracle.clone());

    let result = engine.remove(&ids(&["Stubborn.App"])).expect("remove must run");
    assert_eq!(result.counts(), (1, 0));
    assert!(oracle.single_queries().is_empty());
}

#[test]
fn cleanup_target_failures_do_not_fail_removal() {
    let executor = RecordingExecutor::responding(|command| {
        if command.contains("Remove-Item") && command.contains("Broken") {
            CommandOutput::failed("Remove-Item : Requested registry access is not allowed.")
        } else {
            CommandOutput::ok("")
        }
    });
    let oracle = FakeOracle::with_installed(&[]);
    let catalog = Catalog::new(
        vec![PackageDescriptor::new("Microsoft.SkypeApp", "Skype").with_cleanup_targets([
            r"HKCR:\Broken\Key",
            r"HKCU:\Software\Fine",
        ])],
        Vec::new(),
    )
    .expect("catalog must build");
    let engine = engine(catalog, &executor, &oracle, true);

    let result = engine
        .remove(&ids(&["Microsoft.SkypeApp"]))
        .expect("remove must run");
    assert_eq!(result.counts(), (1, 0));
    assert_eq!(
        result.per_package[0].cleanup_failures,
        vec![r"HKCR:\Broken\Key".to_string()]
    );
    assert_eq!(executor.count_containing("Remove-Item"), 2);
    assert_eq!(
        executor.count_containing(r"Registry::HKEY_CLASSES_ROOT\Broken\Key"),
        1
    );
}

#[test]
fn remove_all_applies_policy_tweaks() {
    let executor = RecordingExecutor::succeeding();
    let oracle = FakeOracle::with_installed(&[]);
    let catalog = Catalog::new(
        vec![
            PackageDescriptor::new("A", "a"),
            PackageDescriptor::new("B", "b"),
        ],
        vec![PolicyTweak {
            id: "disable-copilot".to_string(),
            description: String::new(),
            key: r"HKCU:\Software\Policies\Microsoft\Windows\WindowsCopilot".to_string(),
            value_name: "TurnOffWindowsCopilot".to_string(),
            value: 1,
            triggers: vec!["Microsoft.Copilot".to_string()],
            on_remove_all: true,
        }],
    )
    .expect("catalog must build");
    let engine = engine(catalog, &executor, &oracle, true);

    let selected = engine.remove(&ids(&["A"])).expect("remove must run");
    assert!(selected.tweaks.is_empty());

    let result = engine.remove_all().expect("remove all must run");
    assert_eq!(result.counts(), (2, 0));
    assert_eq!(result.tweaks.len(), 1);
    assert!(result.tweaks[0].applied);
    assert_eq!(result.tweaks[0].tweak_id, "disable-copilot");
    assert_eq!(executor.count_containing("-Name 'TurnOffWindowsCopilot' -Value 1"), 1);
}

#[test]
fn reinstall_missing_only_processes_absent_packages() {
    let executor = RecordingExecutor::succeeding();
    let oracle = FakeOracle::with_installed(&["A", "C"]);
    let calls = CallLog::default();
    let engine = engine(catalog_of(&["A", "B", "C"]), &executor, &oracle, true)
        .with_reinstall_ladder(vec![scripted(
            StrategyKind::Reregister,
            &oracle,
            &["B"],
            true,
            &calls,
        )]);

    let result = engine.reinstall_missing();
    assert_eq!(package_ids(&result.per_package), vec!["B"]);
    assert_eq!(result.counts(), (1, 0));

    let nothing = engine.reinstall_missing();
    assert_eq!(nothing.attempted(), 0);
    assert!(nothing.checkpoint.is_none());
    assert!(nothing.aborted.is_none());
}

#[test]
fn selection_is_validated_and_deduplicated() {
    let executor = RecordingExecutor::succeeding();
    let oracle = FakeOracle::with_installed(&[]);
    let engine = engine(catalog_of(&["A"]), &executor, &oracle, true);

    let err = engine
        .remove(&ids(&["A", "bad id"]))
        .expect_err("invalid id must fail");
    assert!(matches!(err, EngineError::InvalidPackageId { ref id, .. } if id == "bad id"));
    assert!(executor.commands().is_empty());

    let err = engine.reinstall(&[]).expect_err("empty selection must fail");
    assert_eq!(
        err,
        EngineError::EmptySelection {
            operation: "reinstall"
        }
    );

    let result = engine.remove(&ids(&["A", "A"])).expect("remove must run");
    assert_eq!(result.attempted(), 1);
}

struct StopAfter {
    limit: usize,
    finished: Vec<String>,
    total: Option<usize>,
}

impl ProgressSink for StopAfter {
    fn sweep_started(&mut self, _operation: OperationKind, total: usize) {
        self.total = Some(total);
    }

    fn package_finished(&mut self, outcome: &OperationOutcome) {
        self.finished.push(outcome.package_id.clone());
    }

    fn should_stop(&self) -> bool {
        self.finished.len() >= self.limit
    }
}

#[test]
fn cancellation_happens_between_packages() {
    let executor = RecordingExecutor::succeeding();
    let oracle = FakeOracle::with_installed(&[]);
    let engine = engine(catalog_of(&["A", "B", "C"]), &executor, &oracle, true);
    let mut progress = StopAfter {
        limit: 1,
        finished: Vec::new(),
        total: None,
    };

    let report = engine
        .run_with_progress(&Operation::Remove(ids(&["A", "B", "C"])), &mut progress)
        .expect("remove must run");
    let OperationReport::Packages(result) = report else {
        panic!("expected package report");
    };
    assert!(result.cancelled);
    assert_eq!(result.counts(), (1, 0));
    assert_eq!(progress.finished, vec!["A"]);
    assert_eq!(progress.total, Some(3));
    assert_eq!(executor.count_containing("Remove-AppxPackage"), 1);
}

#[test]
fn run_dispatches_checkpoint_operation() {
    let executor = RecordingExecutor::responding(|command| {
        if command.contains("Get-Service") {
            CommandOutput::ok("RUNNING\n")
        } else {
            CommandOutput::ok("")
        }
    });
    let oracle = FakeOracle::with_installed(&[]);
    let engine = engine(catalog_of(&["A"]), &executor, &oracle, true);

    let report = engine
        .run(&Operation::CreateCheckpoint)
        .expect("checkpoint must run");
    let OperationReport::Checkpoint(checkpoint) = report else {
        panic!("expected checkpoint report");
    };
    assert!(checkpoint.is_created());
    assert!(checkpoint.description.starts_with("appsweep - "));
    assert_eq!(executor.count_containing("Start-Service"), 0);
    assert_eq!(executor.count_containing("Enable-ComputerRestore"), 0);
}

#[test]
fn checkpoint_requires_privilege_before_any_command() {
    let executor = RecordingExecutor::succeeding();
    let manager = CheckpointManager::new(
        executor.clone(),
        Arc::new(StaticPrivilege(false)),
        &test_config(),
    );
    let checkpoint = manager.create();
    assert_eq!(
        checkpoint.outcome,
        CheckpointOutcome::Failed(CheckpointFailure::AccessDenied)
    );
    assert!(!manager.create().is_created());
    assert!(executor.commands().is_empty());
}

#[test]
fn checkpoint_steps_are_independent_best_effort() {
    let executor = RecordingExecutor::responding(|command| {
        if command.contains("Get-ComputerRestorePoint") {
            CommandOutput::failed("System Restore is disabled")
        } else {
            CommandOutput::ok("STOPPED\n")
        }
    });
    let manager = CheckpointManager::new(
        executor.clone(),
        Arc::new(StaticPrivilege(true)),
        &test_config(),
    );
    assert!(manager.create().is_created());

    let commands = executor.commands();
    assert!(commands[0].contains("Get-Service -Name 'VSS'"));
    assert!(commands[1].contains("Start-Service -Name 'VSS'"));
    assert!(commands[2].contains("Get-ComputerRestorePoint"));
    assert!(commands[3].contains(r"Enable-ComputerRestore -Drive 'C:\'"));
    assert!(commands[4].contains("-RestorePointType 'APPLICATION_UNINSTALL'"));
}

#[test]
fn checkpoint_skipped_when_service_cannot_start() {
    let executor = RecordingExecutor::responding(|command| {
        if command.contains("Get-ComputerRestorePoint") || command.contains("Get-Service") {
            CommandOutput::ok("STOPPED\n")
        } else {
            CommandOutput::failed("service failed to start")
        }
    });
    let manager = CheckpointManager::new(
        executor.clone(),
        Arc::new(StaticPrivilege(true)),
        &test_config(),
    );
    let checkpoint = manager.create();
    assert_eq!(checkpoint.outcome, CheckpointOutcome::SkippedServiceUnavailable);
    assert_eq!(executor.count_containing("Checkpoint-Computer"), 1);
}

#[test]
fn classify_checkpoint_failures() {
    assert_eq!(
        classify_checkpoint_failure("Access is denied"),
        CheckpointFailure::AccessDenied
    );
    assert_eq!(
        classify_checkpoint_failure("This operation requires Administrator rights"),
        CheckpointFailure::AccessDenied
    );
    assert_eq!(
        classify_checkpoint_failure("The service cannot be started because it is disabled."),
        CheckpointFailure::SubsystemDisabled
    );
    assert_eq!(
        classify_checkpoint_failure("  weird failure \n"),
        CheckpointFailure::Unknown("weird failure".to_string())
    );
}

#[test]
fn checkpoint_description_embeds_timestamp() {
    let at = Utc
        .with_ymd_and_hms(2024, 1, 2, 3, 4, 5)
        .single()
        .expect("valid timestamp");
    assert_eq!(
        checkpoint_description("appsweep", &at),
        "appsweep - 2024-01-02_03-04-05"
    );
}

#[test]
fn quoting_doubles_single_quotes() {
    assert_eq!(quote("O'Brien.App"), "'O''Brien.App'");
    assert!(remove_package("O'Brien.App").contains("-eq 'O''Brien.App'"));
    assert!(batch_installed_query(&ids(&["It's"])).contains("'It''s'"));
}

#[test]
fn hkcr_targets_use_registry_provider() {
    assert_eq!(
        normalize_registry_path(r"HKCR:\Extensions\ContractId"),
        r"Registry::HKEY_CLASSES_ROOT\Extensions\ContractId"
    );
    assert_eq!(
        normalize_registry_path(r"HKCU:\Software\Thing"),
        r"HKCU:\Software\Thing"
    );
    let purge = purge_cleanup_target(r"HKCR:\ActivatableClasses\Package\X");
    assert!(purge.contains(
        r"Remove-Item -LiteralPath 'Registry::HKEY_CLASSES_ROOT\ActivatableClasses\Package\X' -Recurse -Force"
    ));
}

#[test]
fn command_output_summary_uses_first_meaningful_line() {
    assert_eq!(
        CommandOutput::failed("\n\n  first\nsecond").summary(),
        "first"
    );
    assert_eq!(CommandOutput::ok("   ").summary(), "no output");
    let timed_out = CommandOutput::timed_out();
    assert!(!timed_out.success);
    assert_eq!(timed_out.output, TIMED_OUT_MESSAGE);
}

#[test]
fn privilege_output_parsing() {
    let groups = "Mandatory Label\\High Mandatory Level Label S-1-16-12288\n";
    assert!(groups_indicate_elevation(groups));
    assert!(!groups_indicate_elevation(
        "Mandatory Label\\Medium Mandatory Level Label S-1-16-8192\n"
    ));
    assert!(uid_is_root("0\n"));
    assert!(!uid_is_root("1000\n"));
}

#[test]
fn relaunch_drops_elevate_flag() {
    let args = vec![
        OsString::from("--elevate"),
        OsString::from("remove"),
        OsString::from("--all"),
    ];
    assert_eq!(
        relaunch_script(r"C:\Tools\appsweep.exe", &args),
        r#"Start-Process -FilePath 'C:\Tools\appsweep.exe' -Verb RunAs -ArgumentList '"remove"','"--all"'"#
    );
    assert_eq!(
        relaunch_script("appsweep", &[]),
        "Start-Process -FilePath 'appsweep' -Verb RunAs"
    );
}

#[test]
fn relaunch_keeps_arguments_with_spaces_whole() {
    let args = vec![
        OsString::from("--catalog"),
        OsString::from(r"C:\My Files\c.toml"),
        OsString::from("remove"),
        OsString::from("O'Brien.App"),
    ];
    assert_eq!(
        relaunch_script("appsweep", &args),
        r#"Start-Process -FilePath 'appsweep' -Verb RunAs -ArgumentList '"--catalog"','"C:\My Files\c.toml"','"remove"','"O''Brien.App"'"#
    );
}

#[test]
fn command_line_arguments_escape_quotes_and_trailing_backslashes() {
    assert_eq!(command_line_argument("plain"), r#""plain""#);
    assert_eq!(command_line_argument(r"C:\dir\"), r#""C:\dir\\""#);
    assert_eq!(command_line_argument(r#"say "hi""#), r#""say \"hi\"""#);
    assert_eq!(command_line_argument(r#"a\"b"#), r#""a\\\"b""#);
    assert_eq!(command_line_argument(""), r#""""#);
}

#[test]
fn filetime_converts_to_unix_epoch() {
    let epoch = filetime_to_local(116_444_736_000_000_000).expect("valid filetime");
    assert_eq!(epoch.timestamp(), 0);

    let from_string = parse_last_accessed(&json!("133500000000000000")).expect("filetime string");
    let from_number = parse_last_accessed(&json!(133_500_000_000_000_000_i64)).expect("filetime");
    assert_eq!(from_string, from_number);

    let iso = parse_last_accessed(&json!("2024-03-01T10:00:00Z")).expect("iso timestamp");
    assert_eq!(iso.timestamp(), 1_709_287_200);

    let dotnet = parse_last_accessed(&json!("/Date(1709287200000)/")).expect("dotnet date");
    assert_eq!(dotnet.timestamp(), 1_709_287_200);

    assert!(parse_last_accessed(&json!(null)).is_none());
    assert!(parse_last_accessed(&json!("yesterday")).is_none());
}

#[test]
fn unused_scan_joins_usage_history() {
    let now = Utc
        .with_ymd_and_hms(2024, 6, 1, 0, 0, 0)
        .single()
        .expect("valid timestamp")
        .with_timezone(&Local);
    let installed = json!([
        {"Name": "Microsoft.ZuneMusic", "PackageFamilyName": "Microsoft.ZuneMusic_8wekyb3d8bbwe"},
        {"Name": "Microsoft.WindowsCalculator", "PackageFamilyName": "Microsoft.WindowsCalculator_8wekyb3d8bbwe"},
        {"Name": "Microsoft.NET.Native.Framework.2.2", "PackageFamilyName": "Microsoft.NET.Native.Framework.2.2_8wekyb3d8bbwe"},
        {"Name": "Microsoft.BingNews", "PackageFamilyName": "Microsoft.BingNews_8wekyb3d8bbwe"},
        {"Name": "Microsoft.BingNews", "PackageFamilyName": "Microsoft.BingNews_8wekyb3d8bbwe"}
    ])
    .to_string();
    let usage = json!([
        {"AppId": "Microsoft.ZuneMusic_8wekyb3d8bbwe!Microsoft.ZuneMusic", "LastAccessedTime": "2024-01-01T00:00:00Z", "LaunchCount": 4},
        {"AppId": "App\\Microsoft.WindowsCalculator_8wekyb3d8bbwe!App", "LastAccessedTime": "2024-05-30T00:00:00Z", "LaunchCount": 40}
    ])
    .to_string();

    let unused = unused_from_json(&installed, Some(usage.as_str()), None, 30, now).expect("scan must parse");
    let names = unused
        .iter()
        .map(|package| package.name.as_str())
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["Microsoft.ZuneMusic", "Microsoft.BingNews"]);

    assert_eq!(unused[0].days_since_used, 152);
    assert_eq!(unused[0].launch_count, 4);
    assert!(unused[0].last_used.is_some());
    assert_eq!(unused[1].days_since_used, 30);
    assert!(unused[1].last_used.is_none());
}

#[test]
fn unused_scan_tolerates_missing_or_broken_usage() {
    let now = Local::now();
    let single = json!({"Name": "Microsoft.People", "PackageFamilyName": "Microsoft.People_8wekyb3d8bbwe"})
        .to_string();

    let unused = unused_from_json(&single, Some("not json"), Some("{broken"), 90, now).expect("scan must parse");
    assert_eq!(unused.len(), 1);
    assert_eq!(unused[0].days_since_used, 90);

    let unused = unused_from_json(&single, None, None, 90, now).expect("scan must parse");
    assert_eq!(unused.len(), 1);

    assert!(unused_from_json("{broken", None, None, 90, now).is_err());
    assert!(unused_from_json("", None, None, 90, now)
        .expect("empty list")
        .is_empty());
}

#[test]
fn unused_scan_reports_listing_failure() {
    let executor = RecordingExecutor::responding(|_| CommandOutput::failed("Get-AppxPackage failed"));
    let err = scan_unused_packages(executor.as_ref(), Duration::from_secs(1), 30, Local::now())
        .expect_err("listing failure must surface");
    assert!(err.to_string().contains("failed to list installed packages"));
    assert_eq!(executor.commands().len(), 1);
}

#[test]
fn event_messages_yield_application_ids() {
    assert_eq!(
        event_app_id(
            r"Application Id=App\Microsoft.ZuneMusic_8wekyb3d8bbwe!Microsoft.ZuneMusic, Version=10.0"
        )
        .as_deref(),
        Some("Microsoft.ZuneMusic_8wekyb3d8bbwe!Microsoft.ZuneMusic")
    );
    assert_eq!(
        event_app_id("Application Id=Microsoft.People_8wekyb3d8bbwe").as_deref(),
        Some("Microsoft.People_8wekyb3d8bbwe")
    );
    assert!(event_app_id("Program inventory updated").is_none());
    assert!(event_app_id("Application Id=, Version=1").is_none());
}

#[test]
fn inventory_events_refresh_usage_history() {
    let now = Utc
        .with_ymd_and_hms(2024, 6, 1, 0, 0, 0)
        .single()
        .expect("valid timestamp")
        .with_timezone(&Local);
    let installed = json!([
        {"Name": "Microsoft.ZuneMusic", "PackageFamilyName": "Microsoft.ZuneMusic_8wekyb3d8bbwe"},
        {"Name": "Microsoft.People", "PackageFamilyName": "Microsoft.People_8wekyb3d8bbwe"},
        {"Name": "Microsoft.BingNews", "PackageFamilyName": "Microsoft.BingNews_8wekyb3d8bbwe"}
    ])
    .to_string();
    let usage = json!([
        {"AppId": "Microsoft.ZuneMusic_8wekyb3d8bbwe!Microsoft.ZuneMusic", "LastAccessedTime": "2024-01-01T00:00:00Z", "LaunchCount": 4}
    ])
    .to_string();
    let events = json!([
        {"TimeCreated": "2024-05-25T00:00:00Z", "Message": "Application Id=Microsoft.ZuneMusic_8wekyb3d8bbwe!Microsoft.ZuneMusic, Version=1"},
        {"TimeCreated": "/Date(1709251200000)/", "Message": "Application Id=Microsoft.People_8wekyb3d8bbwe!App, Version=2"},
        {"TimeCreated": "2024-05-30T00:00:00Z", "Message": "no application here"},
        null
    ])
    .to_string();

    let unused = unused_from_json(&installed, Some(usage.as_str()), Some(events.as_str()), 30, now)
        .expect("scan must parse");
    let names = unused
        .iter()
        .map(|package| package.name.as_str())
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["Microsoft.People", "Microsoft.BingNews"]);
    assert_eq!(unused[0].days_since_used, 92);
    assert_eq!(unused[0].launch_count, 1);
    assert!(unused[1].last_used.is_none());
}

#[test]
fn unused_scan_survives_broken_event_stream() {
    let installed =
        json!({"Name": "Microsoft.People", "PackageFamilyName": "Microsoft.People_8wekyb3d8bbwe"})
            .to_string();
    let executor = RecordingExecutor::responding(move |command| {
        if command.contains("Get-WinEvent") {
            CommandOutput::failed("The specified channel could not be found")
        } else if command.contains("RecentApps") {
            CommandOutput::ok("")
        } else {
            CommandOutput::ok(installed.clone())
        }
    });

    let unused = scan_unused_packages(executor.as_ref(), Duration::from_secs(1), 45, Local::now())
        .expect("event failures must not fail the scan");
    assert_eq!(unused.len(), 1);
    assert_eq!(unused[0].days_since_used, 45);

    let commands = executor.commands();
    assert_eq!(commands.len(), 3);
    assert_eq!(commands[2], program_inventory_events_json());
    assert!(commands[2].contains("'Microsoft-Windows-Application-Experience/Program-Inventory'"));
    assert!(commands[2].contains("$_.Id -eq 500 -or $_.Id -eq 501"));
}

#[cfg(unix)]
fn stub_shell(label: &str) -> std::path::PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let dir = std::env::temp_dir().join(format!(
        "appsweep-engine-{label}-{}",
        std::process::id()
    ));
    std::fs::create_dir_all(&dir).expect("must create scratch dir");
    let path = dir.join("pwsh");
    std::fs::write(
        &path,
        "#!/bin/sh\n\
         case \"$6\" in\n\
         *Start-Sleep*) sleep 5 ;;\n\
         *Fail-Loudly*) echo bad >&2; exit 3 ;;\n\
         *Fail-Quietly*) echo partial; exit 4 ;;\n\
         *) echo INSTALLED ;;\n\
         esac\n",
    )
    .expect("must write stub shell");
    let mut permissions = std::fs::metadata(&path)
        .expect("stub shell metadata")
        .permissions();
    permissions.set_mode(0o755);
    std::fs::set_permissions(&path, permissions).expect("must mark stub shell executable");
    path
}

#[cfg(unix)]
#[test]
fn powershell_executor_reports_output_failures_and_timeouts() {
    let executor = PowerShellExecutor::with_program(stub_shell("executor"));

    let ok = executor.execute(&installed_query("Foo"), Duration::from_secs(10));
    assert_eq!(ok, CommandOutput::ok("INSTALLED\n"));

    let loud = executor.execute("Fail-Loudly", Duration::from_secs(10));
    assert_eq!(loud, CommandOutput::failed("bad\n"));

    let quiet = executor.execute("Fail-Quietly", Duration::from_secs(10));
    assert!(!quiet.success);
    assert!(quiet.output.starts_with("status="));
    assert!(quiet.output.contains("stdout='partial'"));

    let started = std::time::Instant::now();
    let slow = executor.execute("Start-Sleep -Seconds 5", Duration::from_secs(1));
    assert_eq!(slow, CommandOutput::timed_out());
    assert_eq!(slow.output, TIMED_OUT_MESSAGE);
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[test]
fn powershell_executor_reports_spawn_failure() {
    let executor = PowerShellExecutor::with_program("appsweep-missing-shell-binary");
    let output = executor.execute("Get-AppxPackage", Duration::from_secs(1));
    assert!(!output.success);
    assert!(output.output.starts_with("failed to start appsweep-missing-shell-binary"));
}
