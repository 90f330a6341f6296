use std::fmt;

use crate::checkpoint::Checkpoint;

pub const MANUAL_REINSTALL_ADVICE: &str =
    "Some packages may need to be reinstalled manually from the Microsoft Store.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StrategyKind {
    Reregister,
    Provisioned,
    FamilyRegistration,
}

impl StrategyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reregister => "reregister",
            Self::Provisioned => "provisioned",
            Self::FamilyRegistration => "family-registration",
        }
    }

    /// One-based position in the full reinstall ladder.
    pub fn rank(self) -> u8 {
        match self {
            Self::Reregister => 1,
            Self::Provisioned => 2,
            Self::FamilyRegistration => 3,
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Unprivileged,
    ExternalCommandFailure,
    VerificationMismatch,
    StrategiesExhausted,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unprivileged => "unprivileged",
            Self::ExternalCommandFailure => "command-failed",
            Self::VerificationMismatch => "verification-mismatch",
            Self::StrategiesExhausted => "strategies-exhausted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    Unprivileged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Remove,
    Reinstall,
    RestoreDefaults,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Remove => "remove",
            Self::Reinstall => "reinstall",
            Self::RestoreDefaults => "restore-defaults",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyAttempt {
    pub strategy: StrategyKind,
    pub command_succeeded: bool,
    pub verified: bool,
    pub diagnostic: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationOutcome {
    pub package_id: String,
    pub outcome: Outcome,
    pub strategy_used: Option<StrategyKind>,
    pub failure: Option<FailureKind>,
    pub diagnostic: Option<String>,
    pub already_present: bool,
    pub attempts: Vec<StrategyAttempt>,
    pub cleanup_failures: Vec<String>,
}

impl OperationOutcome {
    pub fn succeeded(package_id: impl Into<String>) -> Self {
        Self {
            package_id: package_id.into(),
            outcome: Outcome::Succeeded,
            strategy_used: None,
            failure: None,
            diagnostic: None,
            already_present: false,
            attempts: Vec::new(),
            cleanup_failures: Vec::new(),
        }
    }

    pub fn failed(
        package_id: impl Into<String>,
        failure: FailureKind,
        diagnostic: impl Into<String>,
    ) -> Self {
        Self {
            package_id: package_id.into(),
            outcome: Outcome::Failed,
            strategy_used: None,
            failure: Some(failure),
            diagnostic: Some(diagnostic.into()),
            already_present: false,
            attempts: Vec::new(),
            cleanup_failures: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Succeeded
    }

    pub fn attempted_strategies(&self) -> Vec<StrategyKind> {
        self.attempts.iter().map(|attempt| attempt.strategy).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TweakOutcome {
    pub tweak_id: String,
    pub applied: bool,
    pub diagnostic: Option<String>,
}

/// Per-call result of a package sweep. The counts always sum to the number of
/// packages that were attempted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateResult {
    pub operation: OperationKind,
    pub success_count: usize,
    pub failed_count: usize,
    pub per_package: Vec<OperationOutcome>,
    pub aborted: Option<AbortReason>,
    pub cancelled: bool,
    pub checkpoint: Option<Checkpoint>,
    pub tweaks: Vec<TweakOutcome>,
}

impl AggregateResult {
    pub fn new(operation: OperationKind) -> Self {
        Self {
            operation,
            success_count: 0,
            failed_count: 0,
            per_package: Vec::new(),
            aborted: None,
            cancelled: false,
            checkpoint: None,
            tweaks: Vec::new(),
        }
    }

    pub fn record(&mut self, outcome: OperationOutcome) {
        match outcome.outcome {
            Outcome::Succeeded => self.success_count += 1,
            Outcome::Failed => self.failed_count += 1,
        }
        self.per_package.push(outcome);
    }

    /// Partial success counts: one processed package is enough.
    pub fn succeeded(&self) -> bool {
        self.success_count > 0
    }

    pub fn attempted(&self) -> usize {
        self.success_count + self.failed_count
    }

    pub fn counts(&self) -> (usize, usize) {
        (self.success_count, self.failed_count)
    }

    pub fn failures(&self) -> impl Iterator<Item = &OperationOutcome> {
        self.per_package.iter().filter(|outcome| !outcome.is_success())
    }

    pub fn summary_line(&self) -> String {
        let mut line = format!("Successfully processed {}", self.success_count);
        if self.failed_count > 0 {
            line.push_str(&format!("; Failed {}", self.failed_count));
        }
        line
    }

    pub fn advisory(&self) -> Option<&'static str> {
        match self.operation {
            OperationKind::Reinstall | OperationKind::RestoreDefaults
                if self.failed_count > 0 && self.aborted.is_none() =>
            {
                Some(MANUAL_REINSTALL_ADVICE)
            }
            _ => None,
        }
    }
}
