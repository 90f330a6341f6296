use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use anyhow::{anyhow, Context};
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::commands::{
    installed_packages_json, program_inventory_events_json, recent_app_usage_json,
};
use crate::executor::CommandExecutor;

const FILETIME_TICKS_PER_SECOND: i64 = 10_000_000;
const FILETIME_UNIX_EPOCH_OFFSET_SECS: i64 = 11_644_473_600;
const FILETIME_MIN_DIGITS: usize = 18;
const APP_ID_PREFIX: &str = "App\\";
const EVENT_APP_ID_MARKER: &str = "Application Id=";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnusedPackage {
    pub name: String,
    pub family_name: String,
    /// `None` when the usage history has no record of the package.
    pub last_used: Option<DateTime<Local>>,
    pub days_since_used: i64,
    pub launch_count: u64,
}

#[derive(Debug, Deserialize)]
struct InstalledRow {
    #[serde(rename = "Name", default)]
    name: Option<String>,
    #[serde(rename = "PackageFamilyName", default)]
    family_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsageRow {
    #[serde(rename = "AppId", default)]
    app_id: Option<String>,
    #[serde(rename = "LastAccessedTime", default)]
    last_accessed: Value,
    #[serde(rename = "LaunchCount", default)]
    launch_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct InventoryEventRow {
    #[serde(rename = "TimeCreated", default)]
    time_created: Value,
    #[serde(rename = "Message", default)]
    message: Option<String>,
}

#[derive(Debug, Clone, Copy)]
struct Usage {
    last_used: DateTime<Local>,
    launch_count: u64,
}

/// Installed packages not launched within `days_threshold` days, most stale
/// first. Usage comes from the recent-apps history and the program inventory
/// event log; a missing or unreadable source counts as "never used".
pub fn scan_unused_packages(
    executor: &dyn CommandExecutor,
    timeout: Duration,
    days_threshold: i64,
    now: DateTime<Local>,
) -> anyhow::Result<Vec<UnusedPackage>> {
    info!("scanning for packages unused for {days_threshold} days");
    let installed = executor.execute(&installed_packages_json(), timeout);
    if !installed.success {
        return Err(anyhow!(
            "failed to list installed packages: {}",
            installed.summary()
        ));
    }

    let usage = executor.execute(&recent_app_usage_json(), timeout);
    let usage_output = if usage.success {
        Some(usage.output.as_str())
    } else {
        warn!("failed to read app usage history: {}", usage.summary());
        None
    };

    let events = executor.execute(&program_inventory_events_json(), timeout);
    let events_output = if events.success {
        Some(events.output.as_str())
    } else {
        debug!("program inventory events unavailable: {}", events.summary());
        None
    };

    let unused = unused_from_json(
        &installed.output,
        usage_output,
        events_output,
        days_threshold,
        now,
    )?;
    info!("found {} packages unused for {days_threshold}+ days", unused.len());
    Ok(unused)
}

pub(crate) fn unused_from_json(
    installed_raw: &str,
    usage_raw: Option<&str>,
    events_raw: Option<&str>,
    days_threshold: i64,
    now: DateTime<Local>,
) -> anyhow::Result<Vec<UnusedPackage>> {
    let installed: Vec<InstalledRow> =
        parse_json_rows(installed_raw).context("failed to parse installed package list")?;
    let mut usage = usage_raw.map(parse_usage).unwrap_or_default();
    if let Some(raw) = events_raw {
        merge_inventory_events(&mut usage, raw);
    }

    let mut seen = HashSet::new();
    let mut unused = Vec::new();
    for row in installed {
        let Some(name) = row.name.filter(|name| !name.trim().is_empty()) else {
            continue;
        };
        if name.to_ascii_lowercase().contains("framework") || !seen.insert(name.clone()) {
            continue;
        }
        let family_name = row.family_name.unwrap_or_default();

        match latest_usage(&usage, &family_name) {
            Some(usage) => {
                let days = (now - usage.last_used).num_days();
                if days >= days_threshold {
                    unused.push(UnusedPackage {
                        name,
                        family_name,
                        last_used: Some(usage.last_used),
                        days_since_used: days,
                        launch_count: usage.launch_count,
                    });
                }
            }
            None => unused.push(UnusedPackage {
                name,
                family_name,
                last_used: None,
                days_since_used: days_threshold,
                launch_count: 0,
            }),
        }
    }

    unused.sort_by(|left, right| {
        right
            .days_since_used
            .cmp(&left.days_since_used)
            .then_with(|| left.name.cmp(&right.name))
    });
    Ok(unused)
}

fn parse_usage(raw: &str) -> BTreeMap<String, Usage> {
    let rows: Vec<UsageRow> = match parse_json_rows(raw) {
        Ok(rows) => rows,
        Err(err) => {
            warn!("ignoring unreadable app usage history: {err:#}");
            return BTreeMap::new();
        }
    };

    let mut usage: BTreeMap<String, Usage> = BTreeMap::new();
    for row in rows {
        let Some(app_id) = row.app_id else {
            continue;
        };
        let Some(last_used) = parse_last_accessed(&row.last_accessed) else {
            debug!("no usable timestamp for {app_id}");
            continue;
        };
        let app_id = app_id
            .strip_prefix(APP_ID_PREFIX)
            .unwrap_or(&app_id)
            .to_string();
        let entry = Usage {
            last_used,
            launch_count: row.launch_count.unwrap_or(0),
        };
        usage
            .entry(app_id)
            .and_modify(|existing| {
                if entry.last_used > existing.last_used {
                    *existing = entry;
                }
            })
            .or_insert(entry);
    }
    usage
}

/// Program inventory events only carry a timestamp. A newer event moves the
/// last-used time forward but keeps any launch count already known; an
/// unknown app counts as launched once.
fn merge_inventory_events(usage: &mut BTreeMap<String, Usage>, raw: &str) {
    let rows: Vec<InventoryEventRow> = match parse_json_rows(raw) {
        Ok(rows) => rows,
        Err(err) => {
            warn!("ignoring unreadable program inventory events: {err:#}");
            return;
        }
    };

    for row in rows {
        let Some(app_id) = row.message.as_deref().and_then(event_app_id) else {
            continue;
        };
        let Some(last_used) = parse_last_accessed(&row.time_created) else {
            debug!("no usable event timestamp for {app_id}");
            continue;
        };
        usage
            .entry(app_id)
            .and_modify(|existing| {
                if last_used > existing.last_used {
                    existing.last_used = last_used;
                }
            })
            .or_insert(Usage {
                last_used,
                launch_count: 1,
            });
    }
}

pub(crate) fn event_app_id(message: &str) -> Option<String> {
    let (_, rest) = message.split_once(EVENT_APP_ID_MARKER)?;
    let app_id = rest.split(',').next().unwrap_or_default().trim();
    if app_id.is_empty() {
        return None;
    }
    Some(app_id.strip_prefix(APP_ID_PREFIX).unwrap_or(app_id).to_string())
}

/// Usage ids are either the family name itself or `<family>!<entry point>`.
fn latest_usage(usage: &BTreeMap<String, Usage>, family_name: &str) -> Option<Usage> {
    if family_name.is_empty() {
        return None;
    }
    let entry_prefix = format!("{family_name}!");
    usage
        .iter()
        .filter(|(app_id, _)| app_id.as_str() == family_name || app_id.starts_with(&entry_prefix))
        .map(|(_, usage)| *usage)
        .max_by_key(|usage| usage.last_used)
}

/// The package manager emits a bare object for a single row and an array
/// otherwise.
fn parse_json_rows<T: DeserializeOwned>(raw: &str) -> anyhow::Result<Vec<T>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let value: Value = serde_json::from_str(trimmed).context("output is not valid JSON")?;
    let rows = match value {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => vec![other],
    };
    rows.into_iter()
        .filter(|row| !row.is_null())
        .map(|row| serde_json::from_value(row).context("unexpected JSON row shape"))
        .collect()
}

pub(crate) fn parse_last_accessed(value: &Value) -> Option<DateTime<Local>> {
    match value {
        Value::Number(number) => number.as_i64().and_then(filetime_to_local),
        Value::String(text) => parse_timestamp_text(text.trim()),
        _ => None,
    }
}

fn parse_timestamp_text(text: &str) -> Option<DateTime<Local>> {
    if text.len() >= FILETIME_MIN_DIGITS && text.chars().all(|ch| ch.is_ascii_digit()) {
        return text.parse::<i64>().ok().and_then(filetime_to_local);
    }
    if let Some(millis) = text
        .strip_prefix("/Date(")
        .and_then(|rest| rest.strip_suffix(")/"))
    {
        let millis = millis.parse::<i64>().ok()?;
        return DateTime::<Utc>::from_timestamp_millis(millis).map(|utc| utc.with_timezone(&Local));
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Local));
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S"))
        .ok()
        .and_then(|naive| Local.from_local_datetime(&naive).earliest())
}

pub(crate) fn filetime_to_local(ticks: i64) -> Option<DateTime<Local>> {
    let secs = ticks.div_euclid(FILETIME_TICKS_PER_SECOND) - FILETIME_UNIX_EPOCH_OFFSET_SECS;
    let nanos = (ticks.rem_euclid(FILETIME_TICKS_PER_SECOND) * 100) as u32;
    DateTime::<Utc>::from_timestamp(secs, nanos).map(|utc| utc.with_timezone(&Local))
}
