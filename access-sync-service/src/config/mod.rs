use secrecy::Secret;
use service_core::config::{self as core_config, get_env, parse_env};
use service_core::error::AppError;
use std::collections::HashMap;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct AccessSyncConfig {
    pub common: core_config::Config,
    pub store: StoreConfig,
    pub source_api: SourceApiConfig,
    pub usernames: UsernameConfig,
    pub codec: CodecConfig,
    pub publish: PublishConfig,
    pub admin: AdminConfig,
    pub otlp_endpoint: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum StoreBackend {
    #[default]
    Memory,
    MongoDb,
}

impl std::str::FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "mongodb" | "mongo" => Ok(StoreBackend::MongoDb),
            _ => Err(format!("Invalid store backend: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub mongodb: Option<MongoConfig>,
}

#[derive(Debug, Clone)]
pub struct MongoConfig {
    pub uri: String,
    pub database: String,
}

/// Throttling knobs for the permission-source API.
#[derive(Debug, Clone)]
pub struct SourceApiConfig {
    pub base_url: String,
    pub min_interval: Duration,
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Longest server-requested wait honoured before a call gives up.
    pub max_retry_after: Duration,
    pub request_timeout: Duration,
    pub quota_tiers: QuotaTiers,
}

/// Extra spacing inserted as the remaining quota shrinks.
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaTiers {
    pub critical: Duration,
    pub low: Duration,
    pub moderate: Duration,
}

impl Default for QuotaTiers {
    fn default() -> Self {
        Self {
            critical: Duration::from_secs(2),
            low: Duration::from_secs(1),
            moderate: Duration::from_millis(250),
        }
    }
}

impl QuotaTiers {
    pub fn delay_for(&self, remaining: u32) -> Duration {
        match remaining {
            0..=10 => self.critical,
            11..=20 => self.low,
            21..=50 => self.moderate,
            _ => Duration::ZERO,
        }
    }
}

impl Default for SourceApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://users.roblox.com".to_string(),
            min_interval: Duration::from_millis(100),
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_retry_after: Duration::from_secs(60),
            request_timeout: Duration::from_secs(30),
            quota_tiers: QuotaTiers::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UsernameConfig {
    pub freshness: chrono::Duration,
    pub batch_concurrency: usize,
    pub refresh_interval: Duration,
    /// Upper bound on one lookup before the cached name is used instead.
    pub lookup_timeout: Duration,
}

impl Default for UsernameConfig {
    fn default() -> Self {
        Self {
            freshness: chrono::Duration::days(7),
            batch_concurrency: 10,
            refresh_interval: Duration::from_secs(6 * 60 * 60),
            lookup_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CodecConfig {
    pub default_key: Option<Secret<String>>,
    pub community_keys: HashMap<String, Secret<String>>,
    /// Community whose key encodes the published artifact.
    pub publish_community_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PublishConfig {
    pub debounce: Duration,
    /// Cap on the backoff between retries of a failed publish.
    pub retry_max_delay: Duration,
    pub expiry_sweep_interval: Duration,
    pub github: Option<GitHubConfig>,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(5),
            retry_max_delay: Duration::from_secs(5 * 60),
            expiry_sweep_interval: Duration::from_secs(60),
            github: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GitHubConfig {
    pub api_url: String,
    pub token: Secret<String>,
    pub owner: String,
    pub repo: String,
    pub branch: String,
    pub plaintext_path: String,
    pub encoded_path: String,
    pub max_conflict_retries: u32,
    pub request_timeout: Duration,
    pub signing: SigningConfig,
}

#[derive(Debug, Clone, Default)]
pub struct SigningConfig {
    pub enabled: bool,
    pub author: Option<CommitIdentity>,
    pub private_key: Option<Secret<String>>,
    pub passphrase: Option<Secret<String>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommitIdentity {
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, Default)]
pub struct AdminConfig {
    pub api_token: Option<Secret<String>>,
}

impl AccessSyncConfig {
    pub fn load() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;
        let is_prod = core_config::is_prod();

        let backend: StoreBackend = get_env("STORE_BACKEND", Some("memory"), false)?
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;
        let mongodb = match backend {
            StoreBackend::MongoDb => Some(MongoConfig {
                uri: get_env("MONGODB_URI", None, is_prod)?,
                database: get_env("MONGODB_DATABASE", Some("access_sync_db"), is_prod)?,
            }),
            StoreBackend::Memory => None,
        };

        let source_defaults = SourceApiConfig::default();
        let source_api = SourceApiConfig {
            base_url: get_env(
                "SOURCE_API_BASE_URL",
                Some(source_defaults.base_url.as_str()),
                false,
            )?,
            min_interval: Duration::from_millis(parse_env("SOURCE_API_MIN_INTERVAL_MS", 100)?),
            max_retries: parse_env("SOURCE_API_MAX_RETRIES", source_defaults.max_retries)?,
            base_delay: Duration::from_millis(parse_env("SOURCE_API_BASE_DELAY_MS", 500)?),
            max_delay: Duration::from_millis(parse_env("SOURCE_API_MAX_DELAY_MS", 30_000)?),
            max_retry_after: Duration::from_secs(parse_env(
                "SOURCE_API_MAX_RETRY_AFTER_SECS",
                60,
            )?),
            request_timeout: Duration::from_secs(parse_env("SOURCE_API_TIMEOUT_SECS", 30)?),
            quota_tiers: QuotaTiers::default(),
        };

        let usernames = UsernameConfig {
            freshness: chrono::Duration::hours(parse_env("USERNAME_FRESHNESS_HOURS", 168)?),
            batch_concurrency: parse_env::<usize>("USERNAME_BATCH_CONCURRENCY", 10)?.max(1),
            refresh_interval: Duration::from_secs(parse_env(
                "USERNAME_REFRESH_INTERVAL_SECS",
                6 * 60 * 60,
            )?),
            lookup_timeout: Duration::from_secs(parse_env("USERNAME_LOOKUP_TIMEOUT_SECS", 15)?),
        };

        // The dev key is only a convenience for local runs; prod must supply one.
        let default_key = get_env("CODEC_DEFAULT_KEY", Some("dev-access-sync-key"), is_prod)?;
        let codec = CodecConfig {
            default_key: Some(Secret::new(default_key)),
            community_keys: parse_community_keys(
                &env::var("CODEC_COMMUNITY_KEYS").unwrap_or_default(),
            )?,
            publish_community_id: env::var("PUBLISH_COMMUNITY_ID").ok(),
        };

        let publish = PublishConfig {
            debounce: Duration::from_millis(parse_env("PUBLISH_DEBOUNCE_MS", 5_000)?),
            retry_max_delay: Duration::from_secs(parse_env(
                "PUBLISH_RETRY_MAX_DELAY_SECS",
                5 * 60,
            )?),
            expiry_sweep_interval: Duration::from_secs(parse_env(
                "EXPIRY_SWEEP_INTERVAL_SECS",
                60,
            )?),
            github: load_github()?,
        };

        let admin = AdminConfig {
            api_token: env::var("ADMIN_API_TOKEN")
                .ok()
                .filter(|t| !t.is_empty())
                .map(Secret::new),
        };

        Ok(AccessSyncConfig {
            common,
            store: StoreConfig { backend, mongodb },
            source_api,
            usernames,
            codec,
            publish,
            admin,
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|e| !e.is_empty()),
        })
    }
}

/// Publishing is enabled only when token, owner and repo are all present.
fn load_github() -> Result<Option<GitHubConfig>, AppError> {
    let (Ok(token), Ok(owner), Ok(repo)) = (
        env::var("GITHUB_TOKEN"),
        env::var("GITHUB_OWNER"),
        env::var("GITHUB_REPO"),
    ) else {
        return Ok(None);
    };

    let signing_enabled: bool = parse_env("COMMIT_SIGNING_ENABLED", false)?;
    let author = match (env::var("COMMIT_AUTHOR_NAME"), env::var("COMMIT_AUTHOR_EMAIL")) {
        (Ok(name), Ok(email)) => Some(CommitIdentity { name, email }),
        _ => None,
    };

    Ok(Some(GitHubConfig {
        api_url: get_env("GITHUB_API_URL", Some("https://api.github.com"), false)?,
        token: Secret::new(token),
        owner,
        repo,
        branch: get_env("GITHUB_BRANCH", Some("main"), false)?,
        plaintext_path: get_env("PUBLISH_PLAINTEXT_PATH", Some("whitelist.txt"), false)?,
        encoded_path: get_env("PUBLISH_ENCODED_PATH", Some("whitelist.encoded.txt"), false)?,
        max_conflict_retries: parse_env("PUBLISH_MAX_CONFLICT_RETRIES", 3)?,
        request_timeout: Duration::from_secs(parse_env("GITHUB_TIMEOUT_SECS", 30)?),
        signing: SigningConfig {
            enabled: signing_enabled,
            author,
            private_key: env::var("COMMIT_SIGNING_KEY").ok().map(Secret::new),
            passphrase: env::var("COMMIT_SIGNING_PASSPHRASE")
                .ok()
                .filter(|p| !p.is_empty())
                .map(Secret::new),
        },
    }))
}

/// Parses `community=key,community=key`.
pub fn parse_community_keys(raw: &str) -> Result<HashMap<String, Secret<String>>, AppError> {
    let mut keys = HashMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (community, key) = pair.split_once('=').ok_or_else(|| {
            AppError::ConfigError(anyhow::anyhow!(
                "CODEC_COMMUNITY_KEYS entry '{}' is not community=key",
                pair
            ))
        })?;
        keys.insert(community.trim().to_string(), Secret::new(key.to_string()));
    }
    Ok(keys)
}
