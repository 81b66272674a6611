use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use lotwatch_adapters::SourceOptions;
use serde::Deserialize;

pub const MAINTENANCE_JOB_ID: &str = "maintenance";

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
}

/// Process-wide settings, read from the environment with defaults.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Absent means the in-memory store.
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    /// Enable every source marked `enabled` when the scheduler boots.
    pub auto_start: bool,
    pub tick_interval: Duration,
    pub adapter_timeout: Duration,
    pub run_timeout: Duration,
    pub http_timeout: Duration,
    pub user_agent: String,
    /// Per-source request pace; zero disables pacing.
    pub requests_per_second: f64,
    pub history_limit: usize,
    pub absent_pass_limit: u32,
    pub default_max_items: usize,
    pub maintenance_interval_minutes: u32,
    pub sources_file: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            database_max_connections: 8,
            auto_start: false,
            tick_interval: Duration::from_secs(30),
            adapter_timeout: Duration::from_secs(600),
            run_timeout: Duration::from_secs(900),
            http_timeout: Duration::from_secs(30),
            user_agent: "lotwatch-bot/0.1".to_string(),
            requests_per_second: 10.0,
            history_limit: 100,
            absent_pass_limit: 3,
            default_max_items: 1000,
            maintenance_interval_minutes: 1440,
            sources_file: None,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.trim().is_empty()),
            database_max_connections: env_parse("LOTWATCH_DB_MAX_CONNECTIONS")
                .unwrap_or(defaults.database_max_connections),
            auto_start: env_flag("LOTWATCH_AUTOSTART").unwrap_or(defaults.auto_start),
            tick_interval: env_parse("LOTWATCH_TICK_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.tick_interval),
            adapter_timeout: env_parse("LOTWATCH_ADAPTER_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.adapter_timeout),
            run_timeout: env_parse("LOTWATCH_RUN_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.run_timeout),
            http_timeout: env_parse("LOTWATCH_HTTP_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.http_timeout),
            user_agent: std::env::var("LOTWATCH_USER_AGENT").unwrap_or(defaults.user_agent),
            requests_per_second: env_parse("LOTWATCH_REQUESTS_PER_SECOND")
                .unwrap_or(defaults.requests_per_second),
            history_limit: env_parse("LOTWATCH_HISTORY_LIMIT").unwrap_or(defaults.history_limit),
            absent_pass_limit: env_parse("LOTWATCH_ABSENT_PASS_LIMIT")
                .unwrap_or(defaults.absent_pass_limit),
            default_max_items: env_parse("LOTWATCH_MAX_ITEMS").unwrap_or(defaults.default_max_items),
            maintenance_interval_minutes: env_parse("LOTWATCH_MAINTENANCE_MINUTES")
                .unwrap_or(defaults.maintenance_interval_minutes),
            sources_file: std::env::var("LOTWATCH_SOURCES_FILE").ok().map(PathBuf::from),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.tick_interval.is_zero() {
            bail!("LOTWATCH_TICK_SECS must be greater than zero");
        }
        if self.adapter_timeout.is_zero() || self.run_timeout.is_zero() {
            bail!("adapter and run timeouts must be greater than zero");
        }
        if self.run_timeout < self.adapter_timeout {
            bail!(
                "run timeout ({}s) must not be shorter than adapter timeout ({}s)",
                self.run_timeout.as_secs(),
                self.adapter_timeout.as_secs()
            );
        }
        if !self.requests_per_second.is_finite() || self.requests_per_second < 0.0 {
            bail!("LOTWATCH_REQUESTS_PER_SECOND must be zero or a positive number");
        }
        if self.history_limit == 0 {
            bail!("LOTWATCH_HISTORY_LIMIT must be at least 1");
        }
        if self.absent_pass_limit == 0 {
            bail!("LOTWATCH_ABSENT_PASS_LIMIT must be at least 1");
        }
        if self.maintenance_interval_minutes == 0 {
            bail!("LOTWATCH_MAINTENANCE_MINUTES must be at least 1");
        }
        Ok(())
    }
}

/// One schedulable source as listed in the sources file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    /// Eligible for auto-start.
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub interval_minutes: u32,
    #[serde(default)]
    pub max_items: Option<usize>,
    /// Overrides `SyncConfig::requests_per_second` for this source.
    #[serde(default)]
    pub requests_per_second: Option<f64>,
    #[serde(flatten)]
    pub options: SourceOptions,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text)?;
        registry.validate()?;
        Ok(registry)
    }

    /// Per-source pacing overrides, keyed by source id.
    pub fn request_rates(&self) -> std::collections::HashMap<String, f64> {
        self.sources
            .iter()
            .filter_map(|s| s.requests_per_second.map(|rate| (s.source_id.clone(), rate)))
            .collect()
    }

    /// Built-in marketplaces and their default cadence.
    pub fn builtin() -> Self {
        let source = |source_id: &str, interval_minutes: u32| SourceConfig {
            source_id: source_id.to_string(),
            enabled: true,
            interval_minutes,
            max_items: None,
            requests_per_second: None,
            options: SourceOptions::default(),
        };
        Self {
            sources: vec![
                source("cardhobby", 30),
                source("gregmorris", 30),
                source("queencity", 60),
                source("pristine", 30),
            ],
        }
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        match &config.sources_file {
            Some(path) => Self::load(path),
            None => Ok(Self::builtin()),
        }
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for source in &self.sources {
            if source.source_id == MAINTENANCE_JOB_ID {
                bail!("`{MAINTENANCE_JOB_ID}` is reserved for the maintenance job");
            }
            if !seen.insert(source.source_id.as_str()) {
                bail!("source `{}` is listed twice", source.source_id);
            }
            if source.interval_minutes == 0 {
                bail!("source `{}` has a zero interval", source.source_id);
            }
            if source
                .requests_per_second
                .is_some_and(|rate| !rate.is_finite() || rate < 0.0)
            {
                bail!("source `{}` has an invalid requests_per_second", source.source_id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        SyncConfig::default().validate().unwrap();
    }

    #[test]
    fn run_timeout_must_cover_adapter_timeout() {
        let config = SyncConfig {
            adapter_timeout: Duration::from_secs(60),
            run_timeout: Duration::from_secs(30),
            ..SyncConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn request_rate_must_be_finite_and_not_negative() {
        for rate in [-1.0, f64::NAN, f64::INFINITY] {
            let config = SyncConfig {
                requests_per_second: rate,
                ..SyncConfig::default()
            };
            assert!(config.validate().is_err(), "{rate} accepted");
        }
        let unpaced = SyncConfig {
            requests_per_second: 0.0,
            ..SyncConfig::default()
        };
        unpaced.validate().unwrap();
    }

    #[test]
    fn per_source_request_rates_are_collected() {
        let registry = SourceRegistry::from_yaml_str(
            "sources:\n  - {source_id: pristine, interval_minutes: 30, requests_per_second: 2.5}\n  - {source_id: cardhobby, interval_minutes: 30}\n",
        )
        .unwrap();
        let rates = registry.request_rates();
        assert_eq!(rates.len(), 1);
        assert_eq!(rates.get("pristine"), Some(&2.5));

        let negative = "sources:\n  - {source_id: a, interval_minutes: 5, requests_per_second: -3}\n";
        assert!(SourceRegistry::from_yaml_str(negative).is_err());
    }

    #[test]
    fn sources_file_parses_per_source_options() {
        let registry = SourceRegistry::from_yaml_str(
            r#"
sources:
  - source_id: cardhobby
    interval_minutes: 15
    max_items: 500
    min_price: 250
  - source_id: manual
    enabled: false
    interval_minutes: 1440
    path: ./manual/batch.json
"#,
        )
        .unwrap();
        assert_eq!(registry.sources.len(), 2);
        let cardhobby = &registry.sources[0];
        assert!(cardhobby.enabled);
        assert_eq!(cardhobby.max_items, Some(500));
        assert_eq!(cardhobby.options.min_price, Some(250.0));
        let manual = &registry.sources[1];
        assert!(!manual.enabled);
        assert_eq!(
            manual.options.path.as_deref(),
            Some(Path::new("./manual/batch.json"))
        );
    }

    #[test]
    fn duplicate_and_reserved_ids_are_rejected() {
        let dup = "sources:\n  - {source_id: a, interval_minutes: 5}\n  - {source_id: a, interval_minutes: 5}\n";
        assert!(SourceRegistry::from_yaml_str(dup).is_err());
        let reserved = "sources:\n  - {source_id: maintenance, interval_minutes: 5}\n";
        assert!(SourceRegistry::from_yaml_str(reserved).is_err());
    }

    #[test]
    fn builtin_sources_have_default_intervals() {
        let builtin = SourceRegistry::builtin();
        let queencity = builtin
            .sources
            .iter()
            .find(|s| s.source_id == "queencity")
            .unwrap();
        assert_eq!(queencity.interval_minutes, 60);
        let ids: Vec<_> = builtin.sources.iter().map(|s| s.source_id.as_str()).collect();
        assert_eq!(ids, vec!["cardhobby", "gregmorris", "queencity", "pristine"]);
    }
}
