use std::collections::{BTreeMap, HashSet};

use anyhow::{anyhow, Context};
use serde::Deserialize;

const BUILTIN_CATALOG: &str = include_str!("../catalog/default.toml");

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PackageDescriptor {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub cleanup_targets: Vec<String>,
}

impl PackageDescriptor {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            cleanup_targets: Vec::new(),
        }
    }

    pub fn with_cleanup_targets<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cleanup_targets = targets.into_iter().map(Into::into).collect();
        self
    }

    pub fn display_name(&self) -> &str {
        if self.description.trim().is_empty() {
            &self.id
        } else {
            &self.description
        }
    }
}

/// Registry policy value written after removals, e.g. turning off an assistant
/// that is not delivered as a removable package.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PolicyTweak {
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub key: String,
    pub value_name: String,
    pub value: u32,
    #[serde(default)]
    pub triggers: Vec<String>,
    #[serde(default)]
    pub on_remove_all: bool,
}

impl PolicyTweak {
    pub fn applies_to(&self, removed_ids: &[String], remove_all: bool) -> bool {
        (remove_all && self.on_remove_all)
            || self
                .triggers
                .iter()
                .any(|trigger| removed_ids.iter().any(|id| id == trigger))
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CatalogFile {
    #[serde(default)]
    packages: Vec<PackageDescriptor>,
    #[serde(default)]
    tweaks: Vec<PolicyTweak>,
}

/// Ordered, immutable table of known packages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    packages: Vec<PackageDescriptor>,
    index: BTreeMap<String, usize>,
    tweaks: Vec<PolicyTweak>,
}

impl Catalog {
    pub fn new(packages: Vec<PackageDescriptor>, tweaks: Vec<PolicyTweak>) -> anyhow::Result<Self> {
        let mut index = BTreeMap::new();
        for (position, package) in packages.iter().enumerate() {
            validate_package_id(&package.id)
                .with_context(|| format!("invalid catalog entry at position {}", position + 1))?;
            for target in &package.cleanup_targets {
                validate_cleanup_target(target).with_context(|| {
                    format!("invalid cleanup target for package '{}'", package.id)
                })?;
            }
            if index.insert(package.id.clone(), position).is_some() {
                return Err(anyhow!("duplicate catalog package '{}'", package.id));
            }
        }

        let mut seen_tweaks = HashSet::new();
        for tweak in &tweaks {
            validate_tweak(tweak)?;
            if !seen_tweaks.insert(tweak.id.as_str()) {
                return Err(anyhow!("duplicate catalog tweak '{}'", tweak.id));
            }
        }

        Ok(Self {
            packages,
            index,
            tweaks,
        })
    }

    pub fn from_toml_str(input: &str) -> anyhow::Result<Self> {
        let file: CatalogFile = toml::from_str(input).context("failed to parse appsweep catalog")?;
        Self::new(file.packages, file.tweaks)
    }

    pub fn builtin() -> anyhow::Result<Self> {
        Self::from_toml_str(BUILTIN_CATALOG).context("built-in catalog is invalid")
    }

    pub fn packages(&self) -> &[PackageDescriptor] {
        &self.packages
    }

    pub fn tweaks(&self) -> &[PolicyTweak] {
        &self.tweaks
    }

    pub fn get(&self, id: &str) -> Option<&PackageDescriptor> {
        self.index.get(id).map(|position| &self.packages[*position])
    }

    pub fn ids(&self) -> Vec<String> {
        self.packages.iter().map(|package| package.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    pub fn cleanup_targets(&self, id: &str) -> &[String] {
        self.get(id)
            .map(|package| package.cleanup_targets.as_slice())
            .unwrap_or(&[])
    }

    pub fn tweaks_for_removal(&self, removed_ids: &[String], remove_all: bool) -> Vec<&PolicyTweak> {
        self.tweaks
            .iter()
            .filter(|tweak| tweak.applies_to(removed_ids, remove_all))
            .collect()
    }
}

/// Identifiers are embedded in package-manager queries and in the line-oriented
/// batch protocol, so whitespace, control characters and the protocol
/// delimiter are refused.
pub fn validate_package_id(id: &str) -> anyhow::Result<()> {
    if id.trim().is_empty() {
        return Err(anyhow!("package id must not be empty"));
    }
    if id.chars().any(|ch| ch.is_whitespace() || ch.is_control()) {
        return Err(anyhow!(
            "package id must not contain whitespace or control characters: {id:?}"
        ));
    }
    if id.contains("---") {
        return Err(anyhow!("package id must not contain '---': {id}"));
    }
    Ok(())
}

fn validate_cleanup_target(target: &str) -> anyhow::Result<()> {
    if target.trim().is_empty() {
        return Err(anyhow!("cleanup target must not be empty"));
    }
    if target.chars().any(char::is_control) {
        return Err(anyhow!(
            "cleanup target must not contain control characters: {target:?}"
        ));
    }
    Ok(())
}

fn validate_tweak(tweak: &PolicyTweak) -> anyhow::Result<()> {
    if tweak.id.trim().is_empty() {
        return Err(anyhow!("tweak id must not be empty"));
    }
    if tweak.key.trim().is_empty() || tweak.key.chars().any(char::is_control) {
        return Err(anyhow!("tweak '{}' has an invalid registry key", tweak.id));
    }
    if tweak.value_name.trim().is_empty() || tweak.value_name.chars().any(char::is_control) {
        return Err(anyhow!("tweak '{}' has an invalid value name", tweak.id));
    }
    for trigger in &tweak.triggers {
        validate_package_id(trigger)
            .with_context(|| format!("invalid trigger for tweak '{}'", tweak.id))?;
    }
    Ok(())
}
