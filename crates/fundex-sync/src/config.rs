use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use fundex_adapters::{SourceKind, EASTMONEY_DETAIL_URL, EASTMONEY_RATE_URL};
use fundex_storage::{HttpClientConfig, PgConnectOptions, DEFAULT_USER_AGENT};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::info;

pub const REGISTRY_FILE: &str = "sources.yaml";

/// What a run does with a code whose fetch or mapping failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Propagate the first failure and end the run.
    #[default]
    Abort,
    /// Log, count as failed, move on. The code stays out of the index.
    Skip,
}

impl FromStr for FailurePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "abort" => Ok(FailurePolicy::Abort),
            "skip" => Ok(FailurePolicy::Skip),
            other => bail!("unknown failure policy {other:?} (expected abort or skip)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchSizes {
    pub identity: usize,
    pub detail: usize,
    pub rate: usize,
}

impl Default for BatchSizes {
    fn default() -> Self {
        Self {
            identity: 1000,
            detail: 1000,
            rate: 100,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    /// Wins over the discrete fields when set.
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: Option<String>,
}

impl DatabaseSettings {
    /// True when nothing in the environment supplies a password.
    pub fn needs_password(&self) -> bool {
        self.url.is_none() && self.password.is_none()
    }

    pub fn connect_options(&self, prompted_password: Option<&str>) -> Result<PgConnectOptions> {
        if let Some(url) = &self.url {
            return url
                .parse::<PgConnectOptions>()
                .context("parsing DATABASE_URL");
        }
        let mut options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.name)
            .username(&self.user);
        if let Some(password) = self.password.as_deref().or(prompted_password) {
            options = options.password(password);
        }
        Ok(options)
    }

    /// Connection target without credentials, for logs.
    pub fn display_target(&self) -> String {
        match &self.url {
            Some(_) => "DATABASE_URL".to_string(),
            None => format!("{}@{}:{}/{}", self.user, self.host, self.port, self.name),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database: DatabaseSettings,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub max_pacing_ms: u64,
    pub batch_sizes: BatchSizes,
    pub failure_policy: FailurePolicy,
    pub scheduler_enabled: bool,
    pub sync_cron_1: String,
    pub sync_cron_2: String,
    pub workspace_root: PathBuf,
    pub log_dir: PathBuf,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

pub(crate) fn parse_flag(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "TRUE" | "True" | "yes")
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        let batch_defaults = BatchSizes::default();
        let failure_policy = match std::env::var("FUNDEX_FAILURE_POLICY") {
            Ok(v) => v.parse().context("reading FUNDEX_FAILURE_POLICY")?,
            Err(_) => FailurePolicy::default(),
        };
        Ok(Self {
            database: DatabaseSettings {
                url: std::env::var("DATABASE_URL").ok(),
                host: env_or("FUNDEX_DB_HOST", "localhost"),
                port: env_parsed("FUNDEX_DB_PORT", 5432),
                name: env_or("FUNDEX_DB_NAME", "fintech"),
                user: std::env::var("FUNDEX_DB_USER")
                    .or_else(|_| std::env::var("USER"))
                    .unwrap_or_else(|_| "postgres".to_string()),
                password: std::env::var("FUNDEX_DB_PASSWORD").ok(),
            },
            user_agent: env_or("FUNDEX_USER_AGENT", DEFAULT_USER_AGENT),
            http_timeout_secs: env_parsed("FUNDEX_HTTP_TIMEOUT_SECS", 20),
            max_pacing_ms: env_parsed("FUNDEX_MAX_PACING_MS", 1000),
            batch_sizes: BatchSizes {
                identity: env_parsed("FUNDEX_IDENTITY_BATCH", batch_defaults.identity).max(1),
                detail: env_parsed("FUNDEX_DETAIL_BATCH", batch_defaults.detail).max(1),
                rate: env_parsed("FUNDEX_RATE_BATCH", batch_defaults.rate).max(1),
            },
            failure_policy,
            scheduler_enabled: std::env::var("FUNDEX_SCHEDULER_ENABLED")
                .map(|v| parse_flag(&v))
                .unwrap_or(false),
            sync_cron_1: env_or("SYNC_CRON_1", "0 0 6 * * *"),
            sync_cron_2: env_or("SYNC_CRON_2", "0 0 18 * * *"),
            workspace_root: std::env::var("FUNDEX_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            log_dir: std::env::var("FUNDEX_LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("log")),
        })
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: self.user_agent.clone(),
            max_pacing: Duration::from_millis(self.max_pacing_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub kind: SourceKind,
    pub enabled: bool,
    /// Overrides the kind's built-in endpoint.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SourceConfig {
    pub fn url(&self) -> &str {
        self.url.as_deref().unwrap_or(self.kind.default_url())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundApiConfig {
    #[serde(default = "default_detail_url")]
    pub detail_url: String,
    #[serde(default = "default_rate_url")]
    pub rate_url: String,
}

fn default_detail_url() -> String {
    EASTMONEY_DETAIL_URL.to_string()
}

fn default_rate_url() -> String {
    EASTMONEY_RATE_URL.to_string()
}

impl Default for FundApiConfig {
    fn default() -> Self {
        Self {
            detail_url: default_detail_url(),
            rate_url: default_rate_url(),
        }
    }
}

/// Listing sources in harvest order, plus the keyed detail/rate endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRegistry {
    pub identity_sources: Vec<SourceConfig>,
    #[serde(default)]
    pub fund_api: FundApiConfig,
}

impl Default for SourceRegistry {
    fn default() -> Self {
        let source = |source_id: &str, display_name: &str, kind, enabled| SourceConfig {
            source_id: source_id.to_string(),
            display_name: display_name.to_string(),
            kind,
            enabled,
            url: None,
            notes: None,
        };
        Self {
            identity_sources: vec![
                source("howbuy-ranking", "Howbuy fund ranking", SourceKind::HowbuyRanking, true),
                source(
                    "eastmoney-suggest",
                    "Eastmoney wap suggest list",
                    SourceKind::EastmoneySuggest,
                    true,
                ),
                source(
                    "eastmoney-code-search",
                    "Eastmoney web code search",
                    SourceKind::EastmoneyCodeSearch,
                    false,
                ),
            ],
            fund_api: FundApiConfig::default(),
        }
    }
}

impl SourceRegistry {
    pub fn enabled_identity_sources(&self) -> impl Iterator<Item = &SourceConfig> {
        self.identity_sources.iter().filter(|s| s.enabled)
    }

    pub fn parse(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing source registry")
    }

    /// `sources.yaml` under `workspace_root`, or the built-in registry when the file is absent.
    pub async fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join(REGISTRY_FILE);
        if !fs::try_exists(&path).await.unwrap_or(false) {
            info!(path = %path.display(), "no source registry on disk; using built-in sources");
            return Ok(Self::default());
        }
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("loading {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_runs_howbuy_then_eastmoney() {
        let registry = SourceRegistry::default();
        let enabled: Vec<_> = registry
            .enabled_identity_sources()
            .map(|s| s.kind)
            .collect();
        assert_eq!(
            enabled,
            vec![SourceKind::HowbuyRanking, SourceKind::EastmoneySuggest]
        );
        assert_eq!(registry.fund_api.rate_url, EASTMONEY_RATE_URL);
    }

    #[test]
    fn registry_yaml_overrides_urls_and_keeps_api_defaults() {
        let registry = SourceRegistry::parse(
            r#"
identity_sources:
  - source_id: em-web
    display_name: Eastmoney web
    kind: eastmoney-code-search
    enabled: true
    url: http://127.0.0.1:9/fundcode_search.js
"#,
        )
        .expect("parse");
        assert_eq!(registry.identity_sources.len(), 1);
        assert_eq!(
            registry.identity_sources[0].url(),
            "http://127.0.0.1:9/fundcode_search.js"
        );
        assert_eq!(registry.fund_api, FundApiConfig::default());
    }

    #[tokio::test]
    async fn missing_registry_file_falls_back_to_builtin() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = SourceRegistry::load(dir.path()).await.expect("load");
        assert_eq!(registry, SourceRegistry::default());
    }

    #[tokio::test]
    async fn registry_file_on_disk_wins() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join(REGISTRY_FILE),
            "identity_sources: []\nfund_api:\n  detail_url: http://x/{code}\n",
        )
        .expect("write");
        let registry = SourceRegistry::load(dir.path()).await.expect("load");
        assert!(registry.identity_sources.is_empty());
        assert_eq!(registry.fund_api.detail_url, "http://x/{code}");
        assert_eq!(registry.fund_api.rate_url, EASTMONEY_RATE_URL);
    }

    #[test]
    fn failure_policy_parses_case_insensitively() {
        assert_eq!("Skip".parse::<FailurePolicy>().expect("skip"), FailurePolicy::Skip);
        assert_eq!(" abort ".parse::<FailurePolicy>().expect("abort"), FailurePolicy::Abort);
        assert!("retry".parse::<FailurePolicy>().is_err());
    }

    #[test]
    fn flags_accept_common_truthy_spellings() {
        assert!(parse_flag("1"));
        assert!(parse_flag("true"));
        assert!(!parse_flag("0"));
        assert!(!parse_flag("off"));
    }

    #[test]
    fn discrete_database_settings_need_a_password() {
        let settings = DatabaseSettings {
            url: None,
            host: "db".into(),
            port: 5433,
            name: "fintech".into(),
            user: "harvester".into(),
            password: None,
        };
        assert!(settings.needs_password());
        assert_eq!(settings.display_target(), "harvester@db:5433/fintech");
        let options = settings.connect_options(Some("secret")).expect("options");
        assert_eq!(options.get_host(), "db");
        assert_eq!(options.get_port(), 5433);
    }
}
