use std::time::Duration;

use crate::jobs::model::{Owner, Region};
use crate::jobs::retry::{BackoffConfig, RetryPolicy};
use crate::jobs::verify::DigestAlgorithm;

/// Process configuration, loaded from the environment (and `.env`).
///
/// Every `MWSFLOW_*` key also accepts its unprefixed name as a fallback.
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub instance_id: String,
    pub owner: Owner,
    pub poll_interval: Duration,
    pub lease_seconds: i64,
    pub admin_addr: Option<String>,
    pub migrate_on_startup: bool,
    pub retry: RetryPolicy,
    pub digest: DigestAlgorithm,
    pub callback_timeout: Option<Duration>,
    pub log_json: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL is missing"))?;

        let instance_id = env_or_fallback("MWSFLOW_INSTANCE_ID", "INSTANCE_ID")
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "mwsflow-1".to_string());

        let region_raw = env_or_fallback("MWSFLOW_REGION", "REGION")
            .ok_or_else(|| anyhow::anyhow!("MWSFLOW_REGION is missing"))?;
        let region = Region::parse(&region_raw)
            .ok_or_else(|| anyhow::anyhow!("MWSFLOW_REGION has unknown value {region_raw:?}"))?;
        let merchant_id = env_or_fallback("MWSFLOW_MERCHANT_ID", "MERCHANT_ID")
            .ok_or_else(|| anyhow::anyhow!("MWSFLOW_MERCHANT_ID is missing"))?;

        let poll_interval_secs: u64 =
            env_parse("MWSFLOW_POLL_INTERVAL_SECS", "POLL_INTERVAL_SECS").unwrap_or(120);

        let lease_seconds: i64 = env_parse("MWSFLOW_LEASE_SECONDS", "LEASE_SECONDS")
            .unwrap_or(300)
            .max(1);

        let admin_addr = env_or_fallback("MWSFLOW_ADMIN_ADDR", "ADMIN_ADDR")
            .and_then(|s| normalize_optional_addr(&s));

        let migrate_on_startup = env_bool("MWSFLOW_MIGRATE_ON_STARTUP").unwrap_or(false);

        let defaults = RetryPolicy::default();
        let default_backoff = BackoffConfig::default();
        let retry = RetryPolicy {
            max_request_retries: env_parse("MWSFLOW_MAX_REQUEST_RETRIES", "MAX_REQUEST_RETRIES")
                .unwrap_or(defaults.max_request_retries),
            max_status_retries: env_parse("MWSFLOW_MAX_STATUS_RETRIES", "MAX_STATUS_RETRIES")
                .unwrap_or(defaults.max_status_retries),
            max_download_retries: env_parse(
                "MWSFLOW_MAX_DOWNLOAD_RETRIES",
                "MAX_DOWNLOAD_RETRIES",
            )
            .unwrap_or(defaults.max_download_retries),
            max_verify_retries: env_parse("MWSFLOW_MAX_VERIFY_RETRIES", "MAX_VERIFY_RETRIES")
                .unwrap_or(defaults.max_verify_retries),
            max_invoke_retries: env_parse("MWSFLOW_MAX_INVOKE_RETRIES", "MAX_INVOKE_RETRIES")
                .unwrap_or(defaults.max_invoke_retries),
            backoff: BackoffConfig {
                base_seconds: env_parse("MWSFLOW_BACKOFF_BASE_SECS", "BACKOFF_BASE_SECS")
                    .unwrap_or(default_backoff.base_seconds),
                max_seconds: env_parse("MWSFLOW_BACKOFF_MAX_SECS", "BACKOFF_MAX_SECS")
                    .unwrap_or(default_backoff.max_seconds),
                jitter_pct: env_parse::<f64>("MWSFLOW_BACKOFF_JITTER_PCT", "BACKOFF_JITTER_PCT")
                    .unwrap_or(default_backoff.jitter_pct)
                    .clamp(0.0, 1.0),
            },
        };

        let digest = match env_or_fallback("MWSFLOW_DIGEST", "DIGEST") {
            Some(raw) => DigestAlgorithm::parse(&raw)
                .ok_or_else(|| anyhow::anyhow!("MWSFLOW_DIGEST has unknown value {raw:?}"))?,
            None => DigestAlgorithm::default(),
        };

        // 0 disables the timeout
        let callback_timeout =
            match env_parse::<u64>("MWSFLOW_CALLBACK_TIMEOUT_SECS", "CALLBACK_TIMEOUT_SECS")
                .unwrap_or(300)
            {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            };

        let log_json = env_bool("MWSFLOW_LOG_JSON").unwrap_or(false);

        Ok(Self {
            database_url,
            instance_id,
            owner: Owner::new(region, merchant_id),
            poll_interval: Duration::from_secs(poll_interval_secs.max(1)),
            lease_seconds,
            admin_addr,
            migrate_on_startup,
            retry,
            digest,
            callback_timeout,
            log_json,
        })
    }

    pub fn orchestrator_options(&self) -> OrchestratorOptions {
        OrchestratorOptions {
            owner: self.owner.clone(),
            instance_id: self.instance_id.clone(),
            lease_seconds: self.lease_seconds,
            retry: self.retry.clone(),
            digest: self.digest,
            callback_timeout: self.callback_timeout,
        }
    }
}

/// Settings the orchestrator and both processors are constructed with.
#[derive(Clone, Debug)]
pub struct OrchestratorOptions {
    /// Region and merchant whose entries this instance drives.
    pub owner: Owner,
    pub instance_id: String,
    pub lease_seconds: i64,
    pub retry: RetryPolicy,
    pub digest: DigestAlgorithm,
    pub callback_timeout: Option<Duration>,
}

impl OrchestratorOptions {
    pub fn new(owner: Owner) -> Self {
        Self {
            owner,
            instance_id: "mwsflow-1".to_string(),
            lease_seconds: 300,
            retry: RetryPolicy::default(),
            digest: DigestAlgorithm::default(),
            callback_timeout: Some(Duration::from_secs(300)),
        }
    }

    pub fn instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = id.into();
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn digest(mut self, digest: DigestAlgorithm) -> Self {
        self.digest = digest;
        self
    }

    pub fn lease_seconds(mut self, secs: i64) -> Self {
        self.lease_seconds = secs.max(1);
        self
    }
}

fn env_or_fallback(primary: &str, fallback: &str) -> Option<String> {
    std::env::var(primary)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| std::env::var(fallback).ok().filter(|s| !s.trim().is_empty()))
}

fn env_parse<T: std::str::FromStr>(primary: &str, fallback: &str) -> Option<T> {
    env_or_fallback(primary, fallback).and_then(|s| s.trim().parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

fn normalize_optional_addr(value: &str) -> Option<String> {
    let v = value.trim();
    if v.is_empty() {
        return None;
    }
    if matches!(v.to_lowercase().as_str(), "0" | "off" | "false" | "none") {
        return None;
    }
    Some(v.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const KEYS: &[&str] = &[
        "DATABASE_URL",
        "MWSFLOW_REGION",
        "MWSFLOW_MERCHANT_ID",
        "MWSFLOW_ADMIN_ADDR",
        "MWSFLOW_MAX_REQUEST_RETRIES",
        "MWSFLOW_DIGEST",
        "MWSFLOW_CALLBACK_TIMEOUT_SECS",
    ];

    fn clear() {
        for k in KEYS {
            std::env::remove_var(k);
        }
    }

    #[test]
    fn admin_addr_can_be_switched_off() {
        assert_eq!(normalize_optional_addr(" off "), None);
        assert_eq!(normalize_optional_addr(""), None);
        assert_eq!(
            normalize_optional_addr("127.0.0.1:8080"),
            Some("127.0.0.1:8080".to_string())
        );
    }

    #[test]
    #[serial]
    fn reads_typed_values_from_env() {
        clear();
        std::env::set_var("DATABASE_URL", "postgres://localhost/mwsflow");
        std::env::set_var("MWSFLOW_REGION", "eu");
        std::env::set_var("MWSFLOW_MERCHANT_ID", "A2MERCHANT");
        std::env::set_var("MWSFLOW_ADMIN_ADDR", "none");
        std::env::set_var("MWSFLOW_MAX_REQUEST_RETRIES", "2");
        std::env::set_var("MWSFLOW_DIGEST", "SHA-256");
        std::env::set_var("MWSFLOW_CALLBACK_TIMEOUT_SECS", "0");

        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.owner, Owner::new(Region::Europe, "A2MERCHANT"));
        assert_eq!(cfg.admin_addr, None);
        assert_eq!(cfg.retry.max_request_retries, 2);
        assert_eq!(cfg.retry.max_status_retries, 10);
        assert_eq!(cfg.digest, DigestAlgorithm::Sha256);
        assert_eq!(cfg.callback_timeout, None);

        let opts = cfg.orchestrator_options();
        assert_eq!(opts.owner, cfg.owner);
        clear();
    }

    #[test]
    #[serial]
    fn unknown_region_is_an_error() {
        clear();
        std::env::set_var("DATABASE_URL", "postgres://localhost/mwsflow");
        std::env::set_var("MWSFLOW_REGION", "atlantis");
        std::env::set_var("MWSFLOW_MERCHANT_ID", "A2MERCHANT");
        assert!(Config::from_env().is_err());
        clear();
    }
}
