/// Item attribution rules. Maps a damage event's free-text cause to a
/// canonical item name when the event carries no usable item.
///
/// The default table is embedded at compile time from `data/item_rules.toml`.
/// A config can point `rules_path` at another file with the same layout to
/// replace it wholesale. Rules are ordered and the first substring match wins.
use crate::config::AppConfig;
use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::Path;

const EMBEDDED_RULES: &str = include_str!("../data/item_rules.toml");

static DEFAULT_TABLE: Lazy<RuleTable> = Lazy::new(|| {
    RuleTable::from_toml(EMBEDDED_RULES).unwrap_or_else(|e| {
        tracing::error!("Embedded item rules failed to parse: {}", e);
        RuleTable::default()
    })
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRule {
    /// Substring searched for in the cause text.
    pub pattern: String,
    /// Canonical item name assigned on match.
    pub item:    String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleTable {
    #[serde(rename = "rule", default)]
    pub rules: Vec<ItemRule>,
}

impl RuleTable {
    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| anyhow::anyhow!("Rule table parse error: {}", e))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read rule table {}", path.display()))?;
        Self::from_toml(&raw)
    }

    /// The compiled-in table.
    pub fn embedded() -> &'static RuleTable {
        &DEFAULT_TABLE
    }

    /// The table a run should use: the configured file, else the embedded one.
    pub fn for_config(cfg: &AppConfig) -> Result<Self> {
        if cfg.rules_path.as_os_str().is_empty() {
            return Ok(Self::embedded().clone());
        }
        let table = Self::load(&cfg.rules_path)?;
        tracing::info!("Loaded {} item rules from {:?}", table.rules.len(), cfg.rules_path);
        Ok(table)
    }

    /// First rule whose pattern occurs in `cause`.
    pub fn match_cause(&self, cause: &str) -> Option<&str> {
        self.rules
            .iter()
            .find(|r| cause.contains(r.pattern.as_str()))
            .map(|r| r.item.as_str())
    }

    /// Resolve the item credited for a damage event. A present item wins
    /// unless it is the unknown label; otherwise the cause rules apply.
    pub fn attribute(&self, item: Option<&str>, cause: Option<&str>, unknown: &str) -> String {
        if let Some(item) = item.filter(|i| !i.is_empty() && *i != unknown) {
            return item.to_owned();
        }
        cause
            .and_then(|c| self.match_cause(c))
            .unwrap_or(unknown)
            .to_owned()
    }
}
