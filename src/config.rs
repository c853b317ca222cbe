use crate::error::ConfigError;
use crate::hashing::compute_hash;
use crate::planner::DEFAULT_BATCH_SIZE;
use crate::provider::ProviderSettings;
use crate::validation::ValidationConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "translation.config.json";

const LANG_PLACEHOLDER: &str = "{lang}";

fn default_source_locale() -> String {
    "en".to_string()
}

/// The `advanced` config section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdvancedSettings {
    pub batch_size: usize,
    pub concurrency: usize,
    pub ledger_path: PathBuf,
    pub max_retries: u32,
    /// Run-history rows kept after each sync.
    pub history_retention: usize,
}

impl Default for AdvancedSettings {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            concurrency: 4,
            ledger_path: PathBuf::from(".translation/ledger.db"),
            max_retries: 3,
            history_retention: 10,
        }
    }
}

/// Project configuration, read from `translation.config.json`.
///
/// Relative paths are resolved against the directory holding the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_source_locale")]
    pub source_locale: String,
    pub target_locales: Vec<String>,
    pub source: PathBuf,
    /// Target path pattern containing `{lang}`.
    pub output: String,
    pub provider: ProviderSettings,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub advanced: AdvancedSettings,
    #[serde(skip)]
    base_dir: PathBuf,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config: Config =
            serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        config.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate config text; relative paths resolve against `base_dir`.
    pub fn from_json_str(content: &str, base_dir: &Path) -> Result<Self, ConfigError> {
        let mut config: Config =
            serde_json::from_str(content).map_err(|source| ConfigError::Parse {
                path: base_dir.join(DEFAULT_CONFIG_FILE),
                source,
            })?;
        config.base_dir = base_dir.to_path_buf();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(model) = std::env::var("TRANSLATION_MODEL") {
            if !model.trim().is_empty() {
                self.provider.model = model;
            }
        }
        if let Ok(ledger_path) = std::env::var("TRANSLATION_LEDGER_PATH") {
            if !ledger_path.trim().is_empty() {
                self.advanced.ledger_path = PathBuf::from(ledger_path);
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source_locale.trim().is_empty() {
            return Err(ConfigError::Invalid("sourceLocale must not be empty".to_string()));
        }
        if self.target_locales.is_empty() {
            return Err(ConfigError::Invalid(
                "targetLocales must list at least one locale".to_string(),
            ));
        }
        if let Some(lang) = self
            .target_locales
            .iter()
            .find(|lang| lang.trim().is_empty() || **lang == self.source_locale)
        {
            return Err(ConfigError::Invalid(format!(
                "target locale '{}' is empty or equal to the source locale",
                lang
            )));
        }
        if !self.output.contains(LANG_PLACEHOLDER) {
            return Err(ConfigError::Invalid(format!(
                "output '{}' must contain {}",
                self.output, LANG_PLACEHOLDER
            )));
        }
        if self.advanced.batch_size == 0 {
            return Err(ConfigError::Invalid("advanced.batchSize must be at least 1".to_string()));
        }
        if self.advanced.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "advanced.concurrency must be at least 1".to_string(),
            ));
        }
        if self.advanced.max_retries == 0 {
            return Err(ConfigError::Invalid("advanced.maxRetries must be at least 1".to_string()));
        }
        if !(self.validation.max_length_ratio > 0.0) {
            return Err(ConfigError::Invalid(
                "validation.maxLengthRatio must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// API key for the configured provider, from the environment.
    pub fn api_key(&self) -> Result<String, ConfigError> {
        let var = self.provider.kind.api_key_env();
        std::env::var(var)
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or(ConfigError::MissingApiKey(var))
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    pub fn source_path(&self) -> PathBuf {
        self.resolve(&self.source)
    }

    pub fn output_path(&self, lang_code: &str) -> PathBuf {
        self.resolve(Path::new(&self.output.replace(LANG_PLACEHOLDER, lang_code)))
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.resolve(&self.advanced.ledger_path)
    }

    /// Hash of the canonical JSON form, recorded on each run.
    pub fn config_hash(&self) -> String {
        // Derived Serialize over plain fields cannot fail
        let canonical = serde_json::to_string(self).unwrap_or_default();
        compute_hash(&canonical)
    }
}
