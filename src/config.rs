//! TOML configuration parsing and validation.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub watch: WatchConfig,
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub matching: MatchingConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatchConfig {
    /// The watched inbox root. Terminal subdirectories (`done/`,
    /// `manual-review/`, `failed/`, `skipped/`) are created beside it on
    /// demand.
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default = "default_poll_secs")]
    pub poll_interval_secs: u64,
}

fn default_include_globs() -> Vec<String> {
    vec![
        "**/*.pdf".to_string(),
        "**/*.png".to_string(),
        "**/*.jpg".to_string(),
        "**/*.tif".to_string(),
        "**/*.tiff".to_string(),
    ]
}

fn default_poll_secs() -> u64 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct ArchiveConfig {
    /// Destination root for verified copies. May live on a volume the
    /// primary runtime cannot reach; the bridge handles that case.
    pub root: PathBuf,
    /// Group archived files into per-year subdirectories.
    #[serde(default = "default_true")]
    pub year_subdirs: bool,
}

fn default_true() -> bool {
    true
}

/// One extraction source: an external command that receives the document
/// path as its last argument and prints a FieldSet as JSON on stdout.
#[derive(Debug, Deserialize, Clone)]
pub struct ExtractionCommand {
    pub source: String,
    pub command: Vec<String>,
    #[serde(default = "default_extract_timeout")]
    pub timeout_secs: u64,
}

fn default_extract_timeout() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ExtractionConfig {
    #[serde(default)]
    pub commands: Vec<ExtractionCommand>,
    /// Run the built-in identifier scan (PDF text layer + DOI/arXiv/ISBN
    /// patterns) alongside the configured commands.
    #[serde(default = "default_true")]
    pub identifier_scan: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CatalogConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default = "default_catalog_timeout")]
    pub timeout_secs: u64,
    /// How many operator-declined retries before a catalog outage routes
    /// the document to manual review.
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
}

fn default_catalog_timeout() -> u64 {
    30
}

fn default_retry_budget() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct MatchingConfig {
    #[serde(default = "default_author_weight")]
    pub author_weight: f64,
    #[serde(default = "default_year_weight")]
    pub year_weight: f64,
    #[serde(default = "default_title_weight")]
    pub title_weight: f64,
    /// Candidates scoring below this are omitted rather than shown as noise.
    #[serde(default = "default_min_score")]
    pub min_score: f64,
}

fn default_author_weight() -> f64 {
    0.5
}
fn default_year_weight() -> f64 {
    0.3
}
fn default_title_weight() -> f64 {
    0.2
}
fn default_min_score() -> f64 {
    0.15
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            author_weight: default_author_weight(),
            year_weight: default_year_weight(),
            title_weight: default_title_weight(),
            min_score: default_min_score(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct BridgeConfig {
    /// Helper command used for paths the primary runtime cannot reach.
    /// Invoked as `<command...> <op> <args...>` with JSON on stdout.
    #[serde(default)]
    pub helper_command: Vec<String>,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.watch.poll_interval_secs == 0 {
        anyhow::bail!("watch.poll_interval_secs must be > 0");
    }

    if config.watch.include_globs.is_empty() {
        anyhow::bail!("watch.include_globs must not be empty");
    }

    let m = &config.matching;
    for (name, w) in [
        ("matching.author_weight", m.author_weight),
        ("matching.year_weight", m.year_weight),
        ("matching.title_weight", m.title_weight),
    ] {
        if !(0.0..=1.0).contains(&w) {
            anyhow::bail!("{} must be in [0.0, 1.0]", name);
        }
    }
    if !(0.0..=1.0).contains(&m.min_score) {
        anyhow::bail!("matching.min_score must be in [0.0, 1.0]");
    }

    if config.catalog.base_url.trim().is_empty() {
        anyhow::bail!("catalog.base_url must not be empty");
    }

    for cmd in &config.extraction.commands {
        if cmd.command.is_empty() {
            anyhow::bail!("extraction command '{}' has an empty command line", cmd.source);
        }
        match cmd.source.as_str() {
            "structured" | "fallback-model" => {}
            other => anyhow::bail!(
                "Unknown extraction source: '{}'. Must be structured or fallback-model.",
                other
            ),
        }
    }

    Ok(config)
}

/// Example configuration written by `pdk init`.
pub const EXAMPLE_CONFIG: &str = r#"[watch]
root = "./inbox"
include_globs = ["**/*.pdf"]
poll_interval_secs = 5

[archive]
root = "./archive"
year_subdirs = true

[extraction]
identifier_scan = true

# [[extraction.commands]]
# source = "structured"
# command = ["docmeta", "--json"]

# [[extraction.commands]]
# source = "fallback-model"
# command = ["llm-bib", "extract"]

[catalog]
base_url = "http://127.0.0.1:7919"
retry_budget = 3

[matching]
author_weight = 0.5
year_weight = 0.3
title_weight = 0.2
min_score = 0.15

[bridge]
# helper_command = ["pdk-helper"]
"#;
