use crate::backends::lambda::ModelTiers;
use crate::budget::{BudgetLimits, DEFAULT_ALERT_THRESHOLD};
use crate::error::AppError;
use crate::gateway::cache::CacheSettings;
use crate::gateway::catalog::{default_catalog, GatewayProfile};
use crate::gateway::validate::QualityThresholds;
use crate::router::DEFAULT_SERVERLESS_RATIO;
use config::{Config, Environment, File, FileFormat};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const SERVICE_NAME: &str = "llm-router";
pub const ENV_PREFIX: &str = "LLM_ROUTER";

pub fn normalize_backend_name(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

fn app_home_dir() -> Result<PathBuf, AppError> {
    if let Ok(custom) = std::env::var("LLM_ROUTER_HOME") {
        return Ok(PathBuf::from(custom));
    }

    if let Some(dirs) = ProjectDirs::from("dev", "llm-router", SERVICE_NAME) {
        let candidate = dirs.data_local_dir().to_path_buf();
        if fs::create_dir_all(&candidate).is_ok() {
            return Ok(candidate);
        }
    }

    let cwd = std::env::current_dir()?;
    Ok(cwd.join(".llm-router"))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub refresh_seconds: u64,
    pub routing: RoutingSettings,
    pub budget: BudgetSettings,
    pub cache: CacheSettings,
    pub quality: QualityThresholds,
    pub logging: LoggingSettings,
    pub backend_settings: HashMap<String, BackendSettings>,
    pub gateways: Vec<GatewayProfile>,
    pub pricing_overrides: Vec<PricingOverride>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            refresh_seconds: 30,
            routing: RoutingSettings::default(),
            budget: BudgetSettings::default(),
            cache: CacheSettings::default(),
            quality: QualityThresholds::default(),
            logging: LoggingSettings::default(),
            backend_settings: HashMap::new(),
            gateways: default_catalog(),
            pricing_overrides: vec![],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingSettings {
    pub serverless_ratio: f64,
    pub timeout_seconds: u64,
    pub small_model: String,
    pub default_model: String,
    pub large_model: String,
    /// Fixes the traffic split sequence; leave unset in production.
    pub seed: Option<u64>,
}

impl Default for RoutingSettings {
    fn default() -> Self {
        let tiers = ModelTiers::default();
        Self {
            serverless_ratio: DEFAULT_SERVERLESS_RATIO,
            timeout_seconds: 45,
            small_model: tiers.small,
            default_model: tiers.default,
            large_model: tiers.large,
            seed: None,
        }
    }
}

impl RoutingSettings {
    pub fn model_tiers(&self) -> ModelTiers {
        ModelTiers {
            small: self.small_model.clone(),
            default: self.default_model.clone(),
            large: self.large_model.clone(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetSettings {
    pub daily_usd: f64,
    pub monthly_usd: f64,
    pub alert_threshold: f64,
    pub webhook_url: Option<String>,
    /// Upper bound for one webhook delivery.
    pub alert_timeout_ms: u64,
    /// Refuse new requests while over budget instead of only reporting.
    pub enforce: bool,
}

impl Default for BudgetSettings {
    fn default() -> Self {
        let limits = BudgetLimits::default();
        Self {
            daily_usd: limits.daily_usd,
            monthly_usd: limits.monthly_usd,
            alert_threshold: DEFAULT_ALERT_THRESHOLD,
            webhook_url: None,
            alert_timeout_ms: 5_000,
            enforce: false,
        }
    }
}

impl BudgetSettings {
    pub fn limits(&self) -> BudgetLimits {
        BudgetLimits {
            daily_usd: self.daily_usd,
            monthly_usd: self.monthly_usd,
            alert_threshold: self.alert_threshold,
        }
    }

    pub fn alert_timeout(&self) -> Duration {
        Duration::from_millis(self.alert_timeout_ms.max(1))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::Compact,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BackendSettings {
    pub base_url: Option<String>,
    pub default_model: Option<String>,
    pub virtual_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingOverride {
    pub model_pattern: String,
    pub input_per_1m: f64,
    pub output_per_1m: f64,
}

pub fn config_dir() -> Result<PathBuf, AppError> {
    Ok(app_home_dir()?.join("config"))
}

pub fn data_dir() -> Result<PathBuf, AppError> {
    Ok(app_home_dir()?.join("data"))
}

pub fn config_path() -> Result<PathBuf, AppError> {
    Ok(config_dir()?.join("config.toml"))
}

pub fn db_path() -> Result<PathBuf, AppError> {
    Ok(data_dir()?.join("usage.sqlite"))
}

pub fn ensure_dirs() -> Result<(), AppError> {
    fs::create_dir_all(config_dir()?)?;
    fs::create_dir_all(data_dir()?)?;
    Ok(())
}

fn normalize_config(config: &mut AppConfig) -> bool {
    let mut changed = false;

    let mut normalized_settings: HashMap<String, BackendSettings> = HashMap::new();
    for (name, settings) in std::mem::take(&mut config.backend_settings) {
        let normalized = normalize_backend_name(&name);
        if normalized != name {
            changed = true;
        }
        normalized_settings.insert(normalized, settings);
    }
    config.backend_settings = normalized_settings;

    let mut gateways: Vec<GatewayProfile> = Vec::new();
    for mut profile in std::mem::take(&mut config.gateways) {
        let normalized = normalize_backend_name(&profile.name);
        if normalized != profile.name {
            profile.name = normalized;
            changed = true;
        }
        if gateways.iter().any(|g| g.name == profile.name) {
            changed = true;
            continue;
        }
        gateways.push(profile);
    }
    config.gateways = gateways;

    let ratio = config.routing.serverless_ratio;
    let clamped = if ratio.is_nan() {
        DEFAULT_SERVERLESS_RATIO
    } else {
        ratio.clamp(0.0, 1.0)
    };
    if clamped != ratio || ratio.is_nan() {
        config.routing.serverless_ratio = clamped;
        changed = true;
    }

    changed
}

/// Layers defaults, the TOML file at `path` (if present) and
/// `LLM_ROUTER__SECTION__KEY` environment overrides.
pub fn load_config_from(path: &Path) -> Result<AppConfig, AppError> {
    let settings = Config::builder()
        .add_source(
            File::from(path.to_path_buf())
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let mut parsed: AppConfig = settings.try_deserialize()?;
    if normalize_config(&mut parsed) {
        tracing::debug!(
            event_name = "config.normalized",
            path = %path.display(),
            "configuration normalised on load"
        );
    }
    Ok(parsed)
}

pub fn load_config() -> Result<AppConfig, AppError> {
    load_config_from(&config_path()?)
}

pub fn save_config(config: &AppConfig) -> Result<(), AppError> {
    ensure_dirs()?;
    let path = config_path()?;
    let raw = toml::to_string_pretty(config)?;
    fs::write(path, raw)?;
    Ok(())
}

fn keyring_entry(backend: &str) -> Result<keyring::Entry, AppError> {
    let normalized = normalize_backend_name(backend);
    Ok(keyring::Entry::new(
        SERVICE_NAME,
        &format!("backend:{normalized}"),
    )?)
}

fn env_key_name(backend: &str) -> String {
    format!(
        "{}_API_KEY",
        normalize_backend_name(backend)
            .to_ascii_uppercase()
            .replace('-', "_")
    )
}

/// Stores the key and reads it back through a fresh entry, so a credential
/// store that silently drops secrets is reported instead of ignored.
pub fn set_api_key(backend: &str, key: &str) -> Result<(), AppError> {
    keyring_entry(backend)?.set_password(key)?;
    match keyring_entry(backend)?.get_password() {
        Ok(stored) if stored == key => Ok(()),
        Ok(_) | Err(keyring::Error::NoEntry) => Err(AppError::Config(format!(
            "The system keyring did not keep the API key for '{}'. Set {} instead.",
            normalize_backend_name(backend),
            env_key_name(backend)
        ))),
        Err(err) => Err(err.into()),
    }
}

/// Keyring first, then `<NAME>_API_KEY`. A broken keyring is logged and
/// treated as a miss so env-only deployments keep working.
pub fn lookup_api_key(backend: &str) -> Option<String> {
    let stored = keyring_entry(backend).and_then(|entry| match entry.get_password() {
        Ok(value) => Ok(Some(value)),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(err) => Err(err.into()),
    });
    match stored {
        Ok(Some(value)) if !value.is_empty() => return Some(value),
        Ok(_) => {}
        Err(err) => tracing::warn!(
            event_name = "config.keyring_unavailable",
            backend,
            error = %err,
            "keyring lookup failed"
        ),
    }

    std::env::var(env_key_name(backend))
        .ok()
        .filter(|value| !value.is_empty())
}

pub fn ensure_initialized() -> Result<(), AppError> {
    ensure_dirs()?;
    let cfg_path = config_path()?;
    if !Path::new(&cfg_path).exists() {
        save_config(&AppConfig::default())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::classify::RequestType;

    #[test]
    fn normalize_backend_name_trims_and_lowercases() {
        assert_eq!(normalize_backend_name(" Serverless "), "serverless");
        assert_eq!(normalize_backend_name("OpenRouter"), "openrouter");
    }

    #[test]
    fn stored_api_key_reads_back_or_fails_loudly() {
        let backend = "keyring-roundtrip-check";
        match set_api_key(backend, "sk-roundtrip") {
            Ok(()) => {
                assert_eq!(lookup_api_key(backend).as_deref(), Some("sk-roundtrip"));
                if let Ok(entry) = keyring_entry(backend) {
                    let _ = entry.delete_credential();
                }
            }
            Err(err) => assert!(
                matches!(err, AppError::Keyring(_))
                    || err.to_string().contains("did not keep the API key"),
                "unexpected error: {err}"
            ),
        }
    }

    #[test]
    fn env_key_names_are_upper_snake() {
        assert_eq!(env_key_name("gpu"), "GPU_API_KEY");
        assert_eq!(env_key_name(" my-gateway "), "MY_GATEWAY_API_KEY");
    }

    #[test]
    fn normalize_config_dedupes_gateways_and_clamps_ratio() {
        let mut cfg = AppConfig {
            backend_settings: HashMap::from([(
                " GPU ".into(),
                BackendSettings {
                    base_url: Some("http://10.0.0.5:8000/v1".into()),
                    ..BackendSettings::default()
                },
            )]),
            gateways: vec![
                GatewayProfile {
                    name: "Portkey".into(),
                    capabilities: vec!["chat".into()],
                    best_for: vec![RequestType::General],
                    quality_boost: 0.3,
                    data_oriented: true,
                },
                GatewayProfile {
                    name: "portkey".into(),
                    capabilities: vec![],
                    best_for: vec![],
                    quality_boost: 0.0,
                    data_oriented: false,
                },
            ],
            ..AppConfig::default()
        };
        cfg.routing.serverless_ratio = 1.7;

        assert!(normalize_config(&mut cfg));
        assert!(cfg.backend_settings.contains_key("gpu"));
        assert_eq!(cfg.gateways.len(), 1);
        assert_eq!(cfg.gateways[0].quality_boost, 0.3);
        assert_eq!(cfg.routing.serverless_ratio, 1.0);
    }

    #[test]
    fn default_config_survives_a_toml_round_trip() {
        let raw = toml::to_string_pretty(&AppConfig::default()).expect("serialize");
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        fs::write(&path, raw).expect("write");

        let loaded = load_config_from(&path).expect("load");
        assert_eq!(loaded.gateways, default_catalog());
        assert_eq!(loaded.routing.serverless_ratio, DEFAULT_SERVERLESS_RATIO);
        assert!(!loaded.budget.enforce);
    }

    #[test]
    fn partial_files_fall_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[budget]\ndaily_usd = 5.0\nenforce = true\n\n[backend_settings.gpu]\nbase_url = \"http://gpu:8000/v1\"\n",
        )
        .expect("write");

        let loaded = load_config_from(&path).expect("load");
        assert_eq!(loaded.budget.daily_usd, 5.0);
        assert_eq!(loaded.budget.monthly_usd, BudgetLimits::default().monthly_usd);
        assert!(loaded.budget.enforce);
        assert_eq!(
            loaded.backend_settings["gpu"].base_url.as_deref(),
            Some("http://gpu:8000/v1")
        );
        assert_eq!(loaded.logging.format, LogFormat::Compact);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let loaded = load_config_from(&dir.path().join("absent.toml")).expect("load");
        assert_eq!(loaded.refresh_seconds, AppConfig::default().refresh_seconds);
    }
}
