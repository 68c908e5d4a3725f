//! Configuration loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::agents::{Stage, StageModels};
use crate::budget::{ModelRegistry, DEFAULT_ALERT_THRESHOLD};
use crate::pipeline::PipelineOptions;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} has invalid value {value:?}: {reason}")]
    Invalid {
        name: String,
        value: String,
        reason: String,
    },

    #[error("{0} contains invalid unicode")]
    NotUnicode(String),

    #[error("{0} is required for this command")]
    Missing(&'static str),
}

/// Remote record storage settings.
#[derive(Debug, Clone)]
pub struct SupabaseConfig {
    pub url: String,
    pub key: String,
    pub table: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub working_dir: PathBuf,
    pub output_dir: PathBuf,
    pub ledger_path: PathBuf,
    pub credits_limit: f64,
    pub alert_threshold: f64,
    pub timeout: Duration,
    pub max_retries: u32,
    pub circuit_breaker: bool,
    /// Wrap each run in an `analysis_pipeline` span.
    pub telemetry: bool,
    pub estimated_run_cost: f64,
    pub stage_models: StageModels,
    pub openrouter_api_key: Option<String>,
    pub openrouter_base_url: Option<String>,
    pub supabase: Option<SupabaseConfig>,
    pub host: String,
    pub port: u16,
}

type Lookup<'a> = &'a dyn Fn(&str) -> Result<Option<String>, ConfigError>;

fn env_lookup(name: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(name) {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => Ok(Some(value.trim().to_string())),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(ConfigError::NotUnicode(name.to_string())),
    }
}

fn invalid(name: &str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        name: name.to_string(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parse_or<T: std::str::FromStr>(lookup: Lookup<'_>, name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match lookup(name)? {
        Some(raw) => raw.parse().map_err(|e: T::Err| invalid(name, &raw, e.to_string())),
        None => Ok(default),
    }
}

fn bool_or(lookup: Lookup<'_>, name: &str, default: bool) -> Result<bool, ConfigError> {
    match lookup(name)? {
        Some(raw) => match raw.to_lowercase().as_str() {
            "1" | "true" | "yes" | "y" | "on" => Ok(true),
            "0" | "false" | "no" | "n" | "off" => Ok(false),
            _ => Err(invalid(name, &raw, "expected a boolean")),
        },
        None => Ok(default),
    }
}

impl Config {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&env_lookup)
    }

    /// Build configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: Lookup<'_>) -> Result<Self, ConfigError> {
        let working_dir = lookup("ARA_WORKING_DIR")?
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let output_dir = lookup("ARA_OUTPUT_DIR")?
            .map(PathBuf::from)
            .unwrap_or_else(|| working_dir.join("outputs"));
        let ledger_path = lookup("ARA_LEDGER_PATH")?
            .map(PathBuf::from)
            .unwrap_or_else(|| working_dir.join(".ara").join("ledger.sqlite"));

        let credits_limit: f64 = parse_or(lookup, "ARA_CREDITS_LIMIT", 300.0)?;
        if !credits_limit.is_finite() || credits_limit <= 0.0 {
            return Err(invalid("ARA_CREDITS_LIMIT", &credits_limit.to_string(), "must be positive"));
        }

        let alert_threshold: f64 = parse_or(lookup, "ARA_ALERT_THRESHOLD", DEFAULT_ALERT_THRESHOLD)?;
        if !(alert_threshold > 0.0 && alert_threshold <= 1.0) {
            return Err(invalid(
                "ARA_ALERT_THRESHOLD",
                &alert_threshold.to_string(),
                "must be in (0, 1]",
            ));
        }

        let timeout_minutes: u64 = parse_or(lookup, "ARA_TIMEOUT_MINUTES", 90)?;
        if timeout_minutes == 0 {
            return Err(invalid("ARA_TIMEOUT_MINUTES", "0", "must be at least 1"));
        }

        let estimated_run_cost: f64 = parse_or(lookup, "ARA_ESTIMATED_RUN_COST", 5.0)?;
        if !estimated_run_cost.is_finite() || estimated_run_cost < 0.0 {
            return Err(invalid(
                "ARA_ESTIMATED_RUN_COST",
                &estimated_run_cost.to_string(),
                "must be non-negative",
            ));
        }

        let registry = ModelRegistry::default();
        let mut stage_models = StageModels::default();
        for stage in Stage::ALL {
            let name = format!("ARA_MODEL_{}", stage.env_suffix());
            if let Some(model) = lookup(&name)? {
                if !registry.contains(&model) {
                    return Err(invalid(&name, &model, "not a registry model"));
                }
                stage_models.set(stage, model);
            }
        }

        let supabase = match (lookup("SUPABASE_URL")?, lookup("SUPABASE_KEY")?) {
            (Some(url), Some(key)) => Some(SupabaseConfig {
                url,
                key,
                table: lookup("SUPABASE_TABLE")?.unwrap_or_else(|| "analyses".to_string()),
            }),
            _ => None,
        };

        Ok(Self {
            working_dir,
            output_dir,
            ledger_path,
            credits_limit,
            alert_threshold,
            timeout: Duration::from_secs(timeout_minutes * 60),
            max_retries: parse_or(lookup, "ARA_MAX_RETRIES", 3)?,
            circuit_breaker: bool_or(lookup, "ARA_CIRCUIT_BREAKER", true)?,
            telemetry: bool_or(lookup, "ARA_TELEMETRY", true)?,
            estimated_run_cost,
            stage_models,
            openrouter_api_key: lookup("OPENROUTER_API_KEY")?,
            openrouter_base_url: lookup("OPENROUTER_BASE_URL")?,
            supabase,
            host: lookup("HOST")?.unwrap_or_else(|| "127.0.0.1".to_string()),
            port: parse_or(lookup, "PORT", 9090)?,
        })
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            timeout: self.timeout,
            circuit_breaker: self.circuit_breaker,
            telemetry: self.telemetry,
            estimated_run_cost: self.estimated_run_cost,
            output_dir: self.output_dir.clone(),
            models: self.stage_models.clone(),
        }
    }

    pub fn require_api_key(&self) -> Result<&str, ConfigError> {
        self.openrouter_api_key
            .as_deref()
            .ok_or(ConfigError::Missing("OPENROUTER_API_KEY"))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_with(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(&move |name: &str| -> Result<Option<String>, ConfigError> {
            Ok(map.get(name).cloned())
        })
    }

    #[test]
    fn defaults() {
        let config = config_with(&[]).unwrap();
        assert_eq!(config.credits_limit, 300.0);
        assert_eq!(config.alert_threshold, 0.8);
        assert_eq!(config.timeout, Duration::from_secs(90 * 60));
        assert_eq!(config.max_retries, 3);
        assert!(config.circuit_breaker);
        assert!(config.telemetry);
        assert_eq!(config.port, 9090);
        assert_eq!(config.output_dir, PathBuf::from(".").join("outputs"));
        assert!(config.supabase.is_none());
        assert!(config.require_api_key().is_err());
    }

    #[test]
    fn overrides() {
        let config = config_with(&[
            ("ARA_WORKING_DIR", "/srv/ara"),
            ("ARA_TIMEOUT_MINUTES", "5"),
            ("ARA_CIRCUIT_BREAKER", "off"),
            ("ARA_MODEL_CONTENT_SYNTHESIZER", "claude-sonnet-4.5"),
            ("SUPABASE_URL", "https://x.supabase.co"),
            ("SUPABASE_KEY", "secret"),
        ])
        .unwrap();
        assert_eq!(config.ledger_path, PathBuf::from("/srv/ara/.ara/ledger.sqlite"));
        assert_eq!(config.timeout, Duration::from_secs(300));
        assert!(!config.circuit_breaker);
        assert_eq!(config.stage_models.get(Stage::ContentSynthesizer), "claude-sonnet-4.5");
        assert_eq!(config.supabase.unwrap().table, "analyses");

        let options = config_with(&[("ARA_ESTIMATED_RUN_COST", "2.5"), ("ARA_TELEMETRY", "off")])
            .unwrap()
            .pipeline_options();
        assert_eq!(options.estimated_run_cost, 2.5);
        assert!(!options.telemetry);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(config_with(&[("ARA_ALERT_THRESHOLD", "1.5")]).is_err());
        assert!(config_with(&[("ARA_ALERT_THRESHOLD", "0")]).is_err());
        assert!(config_with(&[("ARA_CREDITS_LIMIT", "lots")]).is_err());
        assert!(config_with(&[("ARA_CIRCUIT_BREAKER", "maybe")]).is_err());
        assert!(config_with(&[("ARA_TELEMETRY", "sometimes")]).is_err());
        assert!(config_with(&[("ARA_MODEL_NICHE_ANALYST", "gpt-17")]).is_err());
        assert!(config_with(&[("PORT", "99999")]).is_err());
    }
}
