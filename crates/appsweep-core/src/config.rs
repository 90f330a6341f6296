use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context};
use serde::Deserialize;

const MAX_COMMAND_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub command_timeout_secs: u64,
    pub checkpoint_settle_secs: u64,
    pub verify_removal: bool,
    pub system_drive: String,
    pub checkpoint_description_prefix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: 120,
            checkpoint_settle_secs: 3,
            verify_removal: true,
            system_drive: "C:\\".to_string(),
            checkpoint_description_prefix: "appsweep".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn checkpoint_settle(&self) -> Duration {
        Duration::from_secs(self.checkpoint_settle_secs)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.command_timeout_secs == 0 || self.command_timeout_secs > MAX_COMMAND_TIMEOUT_SECS {
            return Err(anyhow!(
                "engine.command_timeout_secs must be between 1 and {MAX_COMMAND_TIMEOUT_SECS}, got {}",
                self.command_timeout_secs
            ));
        }
        if self.system_drive.trim().is_empty() {
            return Err(anyhow!("engine.system_drive must not be empty"));
        }
        if self.checkpoint_description_prefix.chars().any(char::is_control) {
            return Err(anyhow!(
                "engine.checkpoint_description_prefix must not contain control characters"
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub filter: Option<String>,
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    pub fn from_toml_str(input: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(input).context("failed to parse appsweep config")?;
        config.engine.validate()?;
        Ok(config)
    }
}
