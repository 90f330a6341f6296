use crate::outcome::OperationKind;

/// Every user-facing action, independent of how the front end names it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    RemoveAll,
    Remove(Vec<String>),
    Reinstall(Vec<String>),
    ReinstallMissing,
    RestoreDefaults,
    CreateCheckpoint,
}

impl Operation {
    pub fn kind(&self) -> Option<OperationKind> {
        match self {
            Self::RemoveAll | Self::Remove(_) => Some(OperationKind::Remove),
            Self::Reinstall(_) | Self::ReinstallMissing => Some(OperationKind::Reinstall),
            Self::RestoreDefaults => Some(OperationKind::RestoreDefaults),
            Self::CreateCheckpoint => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::RemoveAll => "remove-all",
            Self::Remove(_) => "remove",
            Self::Reinstall(_) => "reinstall",
            Self::ReinstallMissing => "reinstall-missing",
            Self::RestoreDefaults => "restore-defaults",
            Self::CreateCheckpoint => "checkpoint",
        }
    }

    pub fn is_mutating(&self) -> bool {
        !matches!(self, Self::CreateCheckpoint)
    }
}
