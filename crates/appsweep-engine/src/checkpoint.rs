use std::sync::Arc;
use std::thread;
use std::time::Duration;

use appsweep_core::{Checkpoint, CheckpointFailure, CheckpointOutcome, EngineConfig};
use chrono::{DateTime, Local, TimeZone};
use tracing::{debug, info, warn};

use crate::commands::{
    checkpoint_service_status, create_restore_point, enable_restore, probe_restore_points,
    start_checkpoint_service, SERVICE_RUNNING_TOKEN,
};
use crate::executor::CommandExecutor;
use crate::privilege::PrivilegeGate;

const DESCRIPTION_TIME_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Best-effort restore point creation. Every step runs even when an earlier
/// one failed; only missing privilege stops it early.
pub struct CheckpointManager {
    executor: Arc<dyn CommandExecutor>,
    privilege: Arc<dyn PrivilegeGate>,
    timeout: Duration,
    settle: Duration,
    system_drive: String,
    description_prefix: String,
}

impl CheckpointManager {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        privilege: Arc<dyn PrivilegeGate>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            executor,
            privilege,
            timeout: config.command_timeout(),
            settle: config.checkpoint_settle(),
            system_drive: config.system_drive.clone(),
            description_prefix: config.checkpoint_description_prefix.clone(),
        }
    }

    pub fn create(&self) -> Checkpoint {
        let description = checkpoint_description(&self.description_prefix, &Local::now());
        let outcome = self.create_with_description(&description);
        match &outcome {
            CheckpointOutcome::Created => info!("created restore point '{description}'"),
            CheckpointOutcome::SkippedServiceUnavailable => {
                warn!("restore point skipped: checkpoint service is unavailable")
            }
            CheckpointOutcome::Failed(failure) => {
                warn!("restore point failed: {failure}; {}", failure.advice())
            }
        }
        Checkpoint {
            description,
            outcome,
        }
    }

    fn create_with_description(&self, description: &str) -> CheckpointOutcome {
        if !self.privilege.is_elevated() {
            return CheckpointOutcome::Failed(CheckpointFailure::AccessDenied);
        }

        let service_available = self.ensure_service_running();
        self.ensure_restore_enabled();

        let result = self
            .executor
            .execute(&create_restore_point(description), self.timeout);
        if result.success {
            return CheckpointOutcome::Created;
        }
        if !service_available {
            debug!("restore point creation failed with the service down: {}", result.summary());
            return CheckpointOutcome::SkippedServiceUnavailable;
        }
        CheckpointOutcome::Failed(classify_checkpoint_failure(&result.output))
    }

    fn ensure_service_running(&self) -> bool {
        let status = self
            .executor
            .execute(&checkpoint_service_status(), self.timeout);
        if status.success
            && status
                .output
                .lines()
                .any(|line| line.trim() == SERVICE_RUNNING_TOKEN)
        {
            return true;
        }

        info!("starting checkpoint service");
        let started = self
            .executor
            .execute(&start_checkpoint_service(), self.timeout);
        if !started.success {
            warn!("failed to start checkpoint service: {}", started.summary());
            return false;
        }
        if !self.settle.is_zero() {
            thread::sleep(self.settle);
        }
        true
    }

    fn ensure_restore_enabled(&self) {
        if self
            .executor
            .execute(&probe_restore_points(), self.timeout)
            .success
        {
            return;
        }
        info!("enabling system restore on {}", self.system_drive);
        let enabled = self
            .executor
            .execute(&enable_restore(&self.system_drive), self.timeout);
        if !enabled.success {
            warn!("failed to enable system restore: {}", enabled.summary());
        }
    }
}

pub fn checkpoint_description<Tz>(prefix: &str, now: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    format!("{prefix} - {}", now.format(DESCRIPTION_TIME_FORMAT))
}

pub fn classify_checkpoint_failure(output: &str) -> CheckpointFailure {
    let lowered = output.to_ascii_lowercase();
    if ["access is denied", "access denied", "administrator", "0x80070005"]
        .iter()
        .any(|needle| lowered.contains(needle))
    {
        return CheckpointFailure::AccessDenied;
    }
    if ["disabled", "turned off", "0x80070422", "system protection"]
        .iter()
        .any(|needle| lowered.contains(needle))
    {
        return CheckpointFailure::SubsystemDisabled;
    }
    CheckpointFailure::Unknown(output.trim().to_string())
}
