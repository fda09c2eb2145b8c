use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tallybook_engine::MineParams;

pub const CONFIG_ENV: &str = "TALLYBOOK_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "tallybook.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub database_path: PathBuf,
    /// `None` disables the `x-api-key` check.
    pub api_key: Option<String>,
    pub cache_ttl_secs: u64,
    /// Minimum ML confidence for the model's main category to be used.
    pub ml_threshold: f64,
    pub rules_file: PathBuf,
    /// `"pretty"` or `"json"`.
    pub log_format: String,
    pub max_body_bytes: usize,
    pub ml: MlSection,
    pub llm: LlmSection,
    pub learn: LearnSection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MlSection {
    /// HTTP scorer; unset means every prediction is "Uncategorized" at 0.0.
    pub endpoint: Option<String>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
    pub temperature: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LearnSection {
    pub min_frequency: u32,
    pub min_confidence: f64,
    pub reviewed_only: bool,
    pub max_rules: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
            database_path: PathBuf::from("tallybook.db"),
            api_key: None,
            cache_ttl_secs: 300,
            ml_threshold: 0.75,
            rules_file: PathBuf::from("rules/script_rules.toml"),
            log_format: "pretty".to_string(),
            max_body_bytes: 2 * 1024 * 1024,
            ml: MlSection::default(),
            llm: LlmSection::default(),
            learn: LearnSection::default(),
        }
    }
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            base_url: "https://api.openai.com".to_string(),
            temperature: 0.1,
        }
    }
}

impl Default for LearnSection {
    fn default() -> Self {
        let mine = MineParams::default();
        Self {
            min_frequency: mine.min_frequency,
            min_confidence: mine.min_confidence,
            reviewed_only: mine.reviewed_only,
            max_rules: 50,
        }
    }
}

impl ServerConfig {
    /// Reads the TOML file if it exists, then applies environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let s = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
            toml::from_str(&s).with_context(|| format!("parse {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self> {
        let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load(Path::new(&path))
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(bind) = lookup("TALLYBOOK_BIND") {
            self.bind = bind.parse().with_context(|| format!("TALLYBOOK_BIND={bind}"))?;
        }
        if let Some(db) = lookup("TALLYBOOK_DB") {
            self.database_path = PathBuf::from(db);
        }
        if let Some(key) = lookup("API_KEY") {
            self.api_key = Some(key);
        }
        if let Some(t) = lookup("ML_THRESHOLD") {
            self.ml_threshold = t.parse().with_context(|| format!("ML_THRESHOLD={t}"))?;
        }
        if let Some(endpoint) = lookup("ML_ENDPOINT") {
            self.ml.endpoint = Some(endpoint);
        }
        if let Some(key) = lookup("OPENAI_API_KEY") {
            self.llm.api_key = Some(key);
        }
        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}
