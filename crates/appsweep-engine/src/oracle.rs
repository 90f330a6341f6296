use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::commands::{
    batch_installed_query, installed_query, BATCH_END_MARKER, BATCH_START_SUFFIX,
    INSTALLED_TOKEN, NOT_INSTALLED_TOKEN,
};
use crate::executor::CommandExecutor;

/// Answers "is this package installed right now". Never fails: anything that
/// cannot be verified is reported as not installed.
pub trait InstallationOracle: Send + Sync {
    fn is_installed(&self, id: &str) -> bool;

    /// Every requested id is present in the returned map.
    fn is_installed_batch(&self, ids: &[String]) -> BTreeMap<String, bool>;
}

pub struct PackageManagerOracle {
    executor: Arc<dyn CommandExecutor>,
    timeout: Duration,
}

impl PackageManagerOracle {
    pub fn new(executor: Arc<dyn CommandExecutor>, timeout: Duration) -> Self {
        Self { executor, timeout }
    }
}

impl InstallationOracle for PackageManagerOracle {
    fn is_installed(&self, id: &str) -> bool {
        let result = self.executor.execute(&installed_query(id), self.timeout);
        if !result.success {
            warn!("installation query for {id} failed: {}", result.summary());
            return false;
        }
        let installed = result
            .output
            .lines()
            .map(str::trim)
            .any(|line| line == INSTALLED_TOKEN);
        debug!("{id} installed={installed}");
        installed
    }

    fn is_installed_batch(&self, ids: &[String]) -> BTreeMap<String, bool> {
        if ids.is_empty() {
            return BTreeMap::new();
        }
        let result = self
            .executor
            .execute(&batch_installed_query(ids), self.timeout);
        if !result.success {
            warn!(
                "batched installation query for {} packages failed: {}",
                ids.len(),
                result.summary()
            );
            return all_absent(ids);
        }
        parse_batch_output(&result.output, ids)
    }
}

fn all_absent(ids: &[String]) -> BTreeMap<String, bool> {
    ids.iter().map(|id| (id.clone(), false)).collect()
}

/// Reads `<id>---START---`, `INSTALLED`/`NOT_INSTALLED`, `---END---` blocks.
/// Ids that were not asked for are ignored and ids that never appear stay
/// `false`, so the key set always equals the request.
pub fn parse_batch_output(raw: &str, ids: &[String]) -> BTreeMap<String, bool> {
    let mut statuses = all_absent(ids);
    let mut current: Option<&str> = None;

    for line in raw.lines().map(str::trim) {
        if line.is_empty() {
            continue;
        }
        if line == BATCH_END_MARKER {
            current = None;
            continue;
        }
        if let Some(id) = line.strip_suffix(BATCH_START_SUFFIX) {
            current = Some(id);
            continue;
        }
        let Some(id) = current else {
            continue;
        };
        let Some(status) = statuses.get_mut(id) else {
            continue;
        };
        match line {
            INSTALLED_TOKEN => *status = true,
            NOT_INSTALLED_TOKEN => *status = false,
            other => debug!("ignoring unexpected batch line for {id}: {other}"),
        }
    }

    statuses
}
