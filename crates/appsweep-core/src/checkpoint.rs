use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointFailure {
    AccessDenied,
    SubsystemDisabled,
    Unknown(String),
}

impl CheckpointFailure {
    pub fn advice(&self) -> &'static str {
        match self {
            Self::AccessDenied => "run appsweep from an elevated (administrator) prompt",
            Self::SubsystemDisabled => {
                "enable System Protection for the system drive in the System Properties dialog"
            }
            Self::Unknown(_) => "see the log for the package manager's output",
        }
    }
}

impl fmt::Display for CheckpointFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AccessDenied => f.write_str("access denied"),
            Self::SubsystemDisabled => f.write_str("system restore is disabled"),
            Self::Unknown(reason) if reason.trim().is_empty() => f.write_str("unknown error"),
            Self::Unknown(reason) => write!(f, "unknown error: {}", reason.trim()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointOutcome {
    Created,
    SkippedServiceUnavailable,
    Failed(CheckpointFailure),
}

/// A restore point this tool asked the OS to create. Never read back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub description: String,
    pub outcome: CheckpointOutcome,
}

impl Checkpoint {
    pub fn is_created(&self) -> bool {
        self.outcome == CheckpointOutcome::Created
    }
}
