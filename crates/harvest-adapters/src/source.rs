use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Cron bucket a source is crawled in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleBucket {
    #[default]
    Daily,
    Weekly,
    Monthly,
    Frequent,
}

impl ScheduleBucket {
    pub const ALL: [ScheduleBucket; 4] = [
        ScheduleBucket::Daily,
        ScheduleBucket::Weekly,
        ScheduleBucket::Monthly,
        ScheduleBucket::Frequent,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Frequent => "frequent",
        }
    }
}

impl fmt::Display for ScheduleBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CSS selectors for one site. `event_container` scopes every other selector.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorMap {
    pub event_container: String,
    pub title: String,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub venue: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub base_url: String,
    #[serde(default)]
    pub event_urls: Vec<String>,
    #[serde(default)]
    pub selectors: Option<SelectorMap>,
    #[serde(default)]
    pub date_formats: Vec<String>,
    /// Lowercase keyword to canonical category.
    #[serde(default)]
    pub category_mapping: BTreeMap<String, String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub schedule: ScheduleBucket,
}

impl SourceConfig {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            event_urls: Vec::new(),
            selectors: None,
            date_formats: Vec::new(),
            category_mapping: BTreeMap::new(),
            enabled: true,
            schedule: ScheduleBucket::Daily,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let mut registry: SourceRegistry = serde_yaml::from_str(text)?;
        registry.validate()?;
        Ok(registry)
    }

    /// Rejects duplicate or blank names and lowercases category keys.
    pub fn validate(&mut self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for source in &mut self.sources {
            if source.name.trim().is_empty() {
                bail!("source with base_url {} has no name", source.base_url);
            }
            if !seen.insert(source.name.clone()) {
                bail!("duplicate source name {}", source.name);
            }
            source.category_mapping = std::mem::take(&mut source.category_mapping)
                .into_iter()
                .map(|(k, v)| (k.trim().to_lowercase(), v))
                .collect();
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.name == name)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    pub fn enabled_names(&self) -> Vec<String> {
        self.enabled().map(|s| s.name.clone()).collect()
    }

    pub fn bucket_names(&self, bucket: ScheduleBucket) -> Vec<String> {
        self.enabled()
            .filter(|s| s.schedule == bucket)
            .map(|s| s.name.clone())
            .collect()
    }
}
