use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use appsweep_core::{AppConfig, Catalog, LoggingConfig};
use tracing_subscriber::EnvFilter;

const CONFIG_FILE_NAME: &str = "config.toml";
const LOG_ENV_VAR: &str = "APPSWEEP_LOG";
const CONSOLE_DEFAULT_FILTER: &str = "warn";
const FILE_DEFAULT_FILTER: &str = "info";

pub(crate) fn default_config_dir() -> Result<PathBuf> {
    if cfg!(windows) {
        let local = std::env::var_os("LOCALAPPDATA")
            .ok_or_else(|| anyhow!("LOCALAPPDATA is not set"))?;
        return Ok(PathBuf::from(local).join("appsweep"));
    }

    let home = std::env::var_os("HOME").ok_or_else(|| anyhow!("HOME is not set"))?;
    Ok(PathBuf::from(home).join(".appsweep"))
}

/// An explicit path must exist; the default location is optional.
pub(crate) fn load_config(explicit: Option<&Path>) -> Result<AppConfig> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => {
            let Ok(dir) = default_config_dir() else {
                return Ok(AppConfig::default());
            };
            let path = dir.join(CONFIG_FILE_NAME);
            if !path.exists() {
                return Ok(AppConfig::default());
            }
            path
        }
    };

    let raw = fs::read_to_string(&path)
        .with_context(|| format!("failed to read config: {}", path.display()))?;
    AppConfig::from_toml_str(&raw).with_context(|| format!("invalid config: {}", path.display()))
}

pub(crate) fn load_catalog(explicit: Option<&Path>) -> Result<Catalog> {
    let Some(path) = explicit else {
        return Catalog::builtin();
    };
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read catalog: {}", path.display()))?;
    Catalog::from_toml_str(&raw).with_context(|| format!("invalid catalog: {}", path.display()))
}

pub(crate) fn log_filter(env_value: Option<&str>, logging: &LoggingConfig) -> String {
    if let Some(value) = env_value.filter(|value| !value.trim().is_empty()) {
        return value.to_string();
    }
    if let Some(filter) = logging.filter.as_deref() {
        return filter.to_string();
    }
    if logging.file.is_some() {
        FILE_DEFAULT_FILTER.to_string()
    } else {
        CONSOLE_DEFAULT_FILTER.to_string()
    }
}

pub(crate) fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let env_value = std::env::var(LOG_ENV_VAR).ok();
    let filter = EnvFilter::try_new(log_filter(env_value.as_deref(), logging))
        .context("invalid log filter")?;

    match &logging.file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create log directory: {}", parent.display())
                })?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file: {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
                .map_err(|err| anyhow!("failed to install logger: {err}"))?;
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .try_init()
                .map_err(|err| anyhow!("failed to install logger: {err}"))?;
        }
    }
    Ok(())
}
