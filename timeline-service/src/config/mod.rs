//! Configuration module for timeline-service.
//!
//! Everything is read once here and handed to constructors; nothing below
//! this module touches the process environment.

use secrecy::Secret;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::time::Duration;

pub const DEFAULT_BANKING_API_BASE_URL: &str = "https://cdr-insights-prod.api.adatree.com.au";

#[derive(Debug, Clone)]
pub struct TimelineConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub mongodb: MongoConfig,
    pub banking: BankingConfig,
    pub ingestion: IngestionConfig,
}

#[derive(Debug, Clone)]
pub struct MongoConfig {
    pub uri: Secret<String>,
    pub database: String,
}

#[derive(Debug, Clone)]
pub struct BankingConfig {
    pub api_base_url: String,
    pub token: Secret<String>,
    pub page_size: u32,
    pub max_pages: u32,
    pub request_timeout: Duration,
    pub max_retries: u32,
}

#[derive(Debug, Clone)]
pub struct IngestionConfig {
    /// Upper bound for one full ingestion run. Exceeding it fails the run.
    pub run_timeout: Duration,
    /// When set, the binary ingests on this period instead of once.
    pub interval: Option<Duration>,
}

impl Default for BankingConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_BANKING_API_BASE_URL.to_string(),
            token: Secret::new(String::new()),
            page_size: 1000,
            max_pages: 20,
            request_timeout: Duration::from_secs(30),
            max_retries: 3,
        }
    }
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            run_timeout: Duration::from_secs(300),
            interval: None,
        }
    }
}

impl TimelineConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;
        let is_prod = common.is_prod();

        let banking_defaults = BankingConfig::default();
        let ingestion_defaults = IngestionConfig::default();

        Ok(Self {
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "timeline-service".to_string()),
            mongodb: MongoConfig {
                uri: Secret::new(get_env("MONGODB_URI", None, is_prod)?),
                database: get_env("MONGODB_DATABASE", Some("florin"), is_prod)?,
            },
            banking: BankingConfig {
                api_base_url: get_env(
                    "BANKING_API_BASE_URL",
                    Some(DEFAULT_BANKING_API_BASE_URL),
                    is_prod,
                )?,
                token: Secret::new(get_env("BANKING_API_TOKEN", Some(""), is_prod)?),
                page_size: parse_env("BANKING_PAGE_SIZE")?.unwrap_or(banking_defaults.page_size),
                max_pages: parse_env("BANKING_MAX_PAGES")?.unwrap_or(banking_defaults.max_pages),
                request_timeout: parse_env("BANKING_REQUEST_TIMEOUT_SECS")?
                    .map(Duration::from_secs)
                    .unwrap_or(banking_defaults.request_timeout),
                max_retries: parse_env("BANKING_MAX_RETRIES")?
                    .unwrap_or(banking_defaults.max_retries),
            },
            ingestion: IngestionConfig {
                run_timeout: parse_env("INGESTION_RUN_TIMEOUT_SECS")?
                    .map(Duration::from_secs)
                    .unwrap_or(ingestion_defaults.run_timeout),
                interval: parse_env("INGESTION_INTERVAL_SECS")?.map(Duration::from_secs),
            },
            common,
        })
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required in production but not set",
                    key
                )))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required but not set",
                    key
                )))
            }
        }
    }
}

fn parse_env<T>(key: &str) -> Result<Option<T>, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map(Some).map_err(|e| {
            AppError::ConfigError(anyhow::anyhow!("{} has an invalid value: {}", key, e))
        }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn test_banking_defaults() {
        let config = BankingConfig::default();
        assert_eq!(config.api_base_url, DEFAULT_BANKING_API_BASE_URL);
        assert_eq!(config.page_size, 1000);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert!(config.token.expose_secret().is_empty());
    }

    #[test]
    fn test_ingestion_defaults_run_once() {
        let config = IngestionConfig::default();
        assert!(config.interval.is_none());
        assert_eq!(config.run_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_get_env_falls_back_outside_prod() {
        let value = get_env("TIMELINE_TEST_UNSET_KEY", Some("fallback"), false).unwrap();
        assert_eq!(value, "fallback");

        assert!(get_env("TIMELINE_TEST_UNSET_KEY", None, false).is_err());
        assert!(get_env("TIMELINE_TEST_UNSET_KEY", Some("fallback"), true).is_err());
    }

    #[test]
    fn test_parse_env_rejects_garbage() {
        env::set_var("TIMELINE_TEST_PAGE_SIZE", "lots");
        assert!(parse_env::<u32>("TIMELINE_TEST_PAGE_SIZE").is_err());

        env::set_var("TIMELINE_TEST_PAGE_SIZE", " 250 ");
        assert_eq!(parse_env::<u32>("TIMELINE_TEST_PAGE_SIZE").unwrap(), Some(250));
        env::remove_var("TIMELINE_TEST_PAGE_SIZE");

        assert_eq!(parse_env::<u32>("TIMELINE_TEST_PAGE_SIZE").unwrap(), None);
    }
}
