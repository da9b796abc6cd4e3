use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::model::{self, ModelId, PricingTable};
use crate::retry::RetryPolicy;
use crate::window::HistoryConfig;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

const DEFAULT_API_VERSION: &str = "2023-06-01";

const PROJECT_CONFIG_FILE: &str = "parley.json";

#[derive(Debug, Clone, Serialize)]
pub struct AppConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub api_version: String,
    pub model: ModelId,
    pub max_tokens: u32,
    pub request_timeout_secs: u64,
    pub system_prompt: Option<String>,
    pub retry: RetryPolicy,
    pub history: HistoryConfig,
    /// Per-model overrides layered over the built-in table.
    pub pricing: PricingTable,
    pub data_dir: Option<PathBuf>,
    pub debug: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.into(),
            api_version: DEFAULT_API_VERSION.into(),
            model: model::default_model(),
            max_tokens: 4096,
            request_timeout_secs: 120,
            system_prompt: None,
            retry: RetryPolicy::default(),
            history: HistoryConfig::default(),
            pricing: PricingTable::new(),
            data_dir: None,
            debug: false,
        }
    }
}

/// On-disk shape: every field optional so files only override what they set.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    api_key: Option<String>,
    base_url: Option<String>,
    api_version: Option<String>,
    model: Option<ModelId>,
    max_tokens: Option<u32>,
    request_timeout_secs: Option<u64>,
    system_prompt: Option<String>,
    #[serde(default)]
    retry: RetryOverlay,
    #[serde(default)]
    history: HistoryOverlay,
    #[serde(default)]
    pricing: PricingTable,
    data_dir: Option<PathBuf>,
    debug: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct RetryOverlay {
    max_retries: Option<u32>,
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct HistoryOverlay {
    enabled: Option<bool>,
    max_messages: Option<usize>,
}

/// Global file, then `--config` (or `./parley.json`), then environment.
pub fn load_config(
    working_dir: Option<PathBuf>,
    explicit_path: Option<&Path>,
) -> Result<AppConfig, ConfigError> {
    let wd = working_dir.unwrap_or_else(|| std::env::current_dir().unwrap_or_default());
    let global_path = dirs::config_dir().map(|dir| dir.join("parley").join("config.json"));
    load_layers(global_path.as_deref(), &wd, explicit_path, |key| std::env::var(key).ok())
}

/// Defaults, then the global file, then the project or explicit file, then env.
fn load_layers(
    global_path: Option<&Path>,
    working_dir: &Path,
    explicit_path: Option<&Path>,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<AppConfig, ConfigError> {
    let mut config = AppConfig::default();

    if let Some(global_path) = global_path.filter(|p| p.exists()) {
        merge_config(&mut config, read_config_file(global_path)?);
    }

    match explicit_path {
        Some(path) => merge_config(&mut config, read_config_file(path)?),
        None => {
            let local_path = working_dir.join(PROJECT_CONFIG_FILE);
            if local_path.exists() {
                merge_config(&mut config, read_config_file(&local_path)?);
            }
        }
    }

    apply_env(&mut config, lookup);

    config.validate()?;
    Ok(config)
}

fn read_config_file(path: &Path) -> Result<ConfigFile, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::File(format!("{}: {e}", path.display())))?;
    parse_config(&content).map_err(|e| match e {
        ConfigError::Invalid(msg) => ConfigError::Invalid(format!("{}: {msg}", path.display())),
        other => other,
    })
}

fn parse_config(content: &str) -> Result<ConfigFile, ConfigError> {
    serde_json::from_str(content).map_err(|e| ConfigError::Invalid(e.to_string()))
}

fn merge_config(base: &mut AppConfig, overlay: ConfigFile) {
    if overlay.api_key.is_some() {
        base.api_key = overlay.api_key;
    }
    if let Some(url) = overlay.base_url {
        base.base_url = url;
    }
    if let Some(version) = overlay.api_version {
        base.api_version = version;
    }
    if let Some(model) = overlay.model {
        base.model = model;
    }
    if let Some(max_tokens) = overlay.max_tokens {
        base.max_tokens = max_tokens;
    }
    if let Some(secs) = overlay.request_timeout_secs {
        base.request_timeout_secs = secs;
    }
    if overlay.system_prompt.is_some() {
        base.system_prompt = overlay.system_prompt;
    }
    if let Some(n) = overlay.retry.max_retries {
        base.retry.max_retries = n;
    }
    if let Some(ms) = overlay.retry.base_delay_ms {
        base.retry.base_delay_ms = ms;
    }
    if let Some(ms) = overlay.retry.max_delay_ms {
        base.retry.max_delay_ms = ms;
    }
    if let Some(enabled) = overlay.history.enabled {
        base.history.enabled = enabled;
    }
    if let Some(n) = overlay.history.max_messages {
        base.history.max_messages = n;
    }
    base.pricing.extend(overlay.pricing);
    if overlay.data_dir.is_some() {
        base.data_dir = overlay.data_dir;
    }
    if let Some(debug) = overlay.debug {
        base.debug = debug;
    }
}

fn apply_env(config: &mut AppConfig, lookup: impl Fn(&str) -> Option<String>) {
    let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    // PARLEY_API_KEY wins over the vendor variable, and both over files
    if let Some(key) = non_empty("PARLEY_API_KEY").or_else(|| non_empty("ANTHROPIC_API_KEY")) {
        config.api_key = Some(key);
    }
    if let Some(model) = non_empty("PARLEY_MODEL") {
        config.model = ModelId(model);
    }
    if let Some(url) = non_empty("PARLEY_BASE_URL") {
        config.base_url = url;
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.base_delay_ms == 0 {
            return Err(ConfigError::Invalid("retry.base_delay_ms must be > 0".into()));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(ConfigError::Invalid(
                "retry.max_delay_ms must be >= retry.base_delay_ms".into(),
            ));
        }
        if self.max_tokens == 0 {
            return Err(ConfigError::Invalid("max_tokens must be > 0".into()));
        }
        for (id, price) in &self.pricing {
            if price.input_per_1k < 0.0 || price.output_per_1k < 0.0 {
                return Err(ConfigError::Invalid(format!("negative pricing for model {id}")));
            }
        }
        Ok(())
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.as_ref().is_some_and(|k| !k.is_empty())
    }

    pub fn require_api_key(&self) -> Result<&str, ConfigError> {
        self.api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or(ConfigError::MissingApiKey)
    }

    /// Built-in prices with config overrides applied.
    pub fn pricing_table(&self) -> PricingTable {
        let mut table = model::builtin_pricing();
        table.extend(self.pricing.iter().map(|(k, v)| (k.clone(), *v)));
        table
    }

    pub fn data_path(&self) -> PathBuf {
        match &self.data_dir {
            Some(dir) => dir.clone(),
            None => dirs::data_dir()
                .map(|d| d.join("parley"))
                .unwrap_or_else(|| PathBuf::from(".parley")),
        }
    }
}
