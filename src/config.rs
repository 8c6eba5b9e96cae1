//! Process configuration read from the environment.
//!
//! Every process (API, bot, worker, migration runner) loads the same
//! [`Settings`]. A `.env` file in the working directory is applied first when
//! present, then real environment variables are read. Durations accept
//! `humantime` syntax such as `30s`, `5m` or `7d`.

use std::env;
use std::time::Duration;

use thiserror::Error;

/// Error raised while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    Missing(&'static str),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("failed to read .env file: {0}")]
    DotEnv(#[from] dotenvy::Error),
}

/// Connection settings for the shared store.
#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub url: String,
    pub max_connections: u32,
    pub busy_timeout: Duration,
    pub acquire_timeout: Duration,
}

impl DatabaseSettings {
    /// Settings for a database URL with default pool parameters.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 8,
            busy_timeout: Duration::from_secs(5),
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

/// Worker loop and retry parameters.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub worker_id: String,
    pub lease: Duration,
    pub handler_timeout: Duration,
    pub max_attempts: u32,
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub concurrency: usize,
    pub shutdown_grace: Duration,
    pub retry_base: Duration,
    pub retry_max: Duration,
    pub retention: Duration,
    pub retention_interval: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            lease: Duration::from_secs(300),
            handler_timeout: Duration::from_secs(240),
            max_attempts: 5,
            poll_interval: Duration::from_secs(1),
            batch_size: 10,
            concurrency: 4,
            shutdown_grace: Duration::from_secs(10),
            retry_base: Duration::from_secs(5),
            retry_max: Duration::from_secs(600),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            retention_interval: Duration::from_secs(60 * 60),
        }
    }
}

/// HTTP API settings.
#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub host: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            allowed_origins: Vec::new(),
        }
    }
}

/// Telegram bot settings. The token is only required by the bot process.
#[derive(Debug, Clone, Default)]
pub struct BotSettings {
    pub token: Option<String>,
    pub allowed_users: Vec<i64>,
}

/// Complete settings shared by all processes.
#[derive(Debug, Clone)]
pub struct Settings {
    pub database: DatabaseSettings,
    /// How long a runtime process waits for a pending migration before failing.
    /// Zero means fail fast.
    pub schema_wait: Duration,
    pub worker: WorkerSettings,
    pub api: ApiSettings,
    pub bot: BotSettings,
    /// Honour `HTTP_PROXY`/`HTTPS_PROXY` for outbound calls made by handlers.
    pub http_use_proxy: bool,
}

impl Settings {
    /// Settings for a database URL with every other value at its default.
    pub fn for_database(url: impl Into<String>) -> Self {
        Self {
            database: DatabaseSettings::new(url),
            schema_wait: Duration::ZERO,
            worker: WorkerSettings::default(),
            api: ApiSettings::default(),
            bot: BotSettings::default(),
            http_use_proxy: false,
        }
    }

    /// Load `.env` (if present) and read settings from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        match dotenvy::dotenv() {
            Ok(_) => {}
            Err(dotenvy::Error::Io(_)) => {}
            Err(e) => return Err(e.into()),
        }
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let url = get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let mut settings = Self::for_database(url);

        let db = &mut settings.database;
        if let Some(v) = get("DB_MAX_CONNECTIONS") {
            db.max_connections = parse_number("DB_MAX_CONNECTIONS", &v)?;
        }
        if let Some(v) = get("DB_BUSY_TIMEOUT") {
            db.busy_timeout = parse_duration("DB_BUSY_TIMEOUT", &v)?;
        }
        if let Some(v) = get("DB_ACQUIRE_TIMEOUT") {
            db.acquire_timeout = parse_duration("DB_ACQUIRE_TIMEOUT", &v)?;
        }
        if let Some(v) = get("SCHEMA_WAIT") {
            settings.schema_wait = parse_duration("SCHEMA_WAIT", &v)?;
        }

        let w = &mut settings.worker;
        if let Some(v) = get("WORKER_ID") {
            w.worker_id = v;
        }
        if let Some(v) = get("WORKER_LEASE") {
            w.lease = parse_duration("WORKER_LEASE", &v)?;
        }
        if let Some(v) = get("WORKER_HANDLER_TIMEOUT") {
            w.handler_timeout = parse_duration("WORKER_HANDLER_TIMEOUT", &v)?;
        }
        if let Some(v) = get("WORKER_MAX_ATTEMPTS") {
            w.max_attempts = parse_number("WORKER_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = get("WORKER_POLL_INTERVAL") {
            w.poll_interval = parse_duration("WORKER_POLL_INTERVAL", &v)?;
        }
        if let Some(v) = get("WORKER_BATCH_SIZE") {
            w.batch_size = parse_number("WORKER_BATCH_SIZE", &v)?;
        }
        if let Some(v) = get("WORKER_CONCURRENCY") {
            w.concurrency = parse_number("WORKER_CONCURRENCY", &v)?;
        }
        if let Some(v) = get("WORKER_SHUTDOWN_GRACE") {
            w.shutdown_grace = parse_duration("WORKER_SHUTDOWN_GRACE", &v)?;
        }
        if let Some(v) = get("WORKER_RETRY_BASE") {
            w.retry_base = parse_duration("WORKER_RETRY_BASE", &v)?;
        }
        if let Some(v) = get("WORKER_RETRY_MAX") {
            w.retry_max = parse_duration("WORKER_RETRY_MAX", &v)?;
        }
        if let Some(v) = get("WORKER_RETENTION") {
            w.retention = parse_duration("WORKER_RETENTION", &v)?;
        }
        if let Some(v) = get("WORKER_RETENTION_INTERVAL") {
            w.retention_interval = parse_duration("WORKER_RETENTION_INTERVAL", &v)?;
        }

        let api = &mut settings.api;
        if let Some(v) = get("API_HOST") {
            api.host = v;
        }
        if let Some(v) = get("API_PORT") {
            api.port = parse_number("API_PORT", &v)?;
        }
        if let Some(v) = get("ALLOWED_ORIGINS") {
            api.allowed_origins = split_csv(&v);
        }

        settings.bot.token = get("BOT_TOKEN");
        if let Some(v) = get("BOT_ALLOWED_USERS") {
            settings.bot.allowed_users = split_csv(&v)
                .iter()
                .map(|id| parse_number::<i64>("BOT_ALLOWED_USERS", id))
                .collect::<Result<_, _>>()?;
        }

        if let Some(v) = get("HTTP_USE_PROXY") {
            settings.http_use_proxy = parse_bool("HTTP_USE_PROXY", &v)?;
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let w = &self.worker;
        if w.lease.is_zero() {
            return Err(invalid("WORKER_LEASE", "must be greater than zero"));
        }
        if w.handler_timeout >= w.lease {
            return Err(invalid(
                "WORKER_HANDLER_TIMEOUT",
                format!(
                    "must be shorter than WORKER_LEASE ({} >= {})",
                    humantime::format_duration(w.handler_timeout),
                    humantime::format_duration(w.lease)
                ),
            ));
        }
        if w.max_attempts == 0 {
            return Err(invalid("WORKER_MAX_ATTEMPTS", "must be at least 1"));
        }
        if w.batch_size == 0 {
            return Err(invalid("WORKER_BATCH_SIZE", "must be at least 1"));
        }
        if w.concurrency == 0 {
            return Err(invalid("WORKER_CONCURRENCY", "must be at least 1"));
        }
        if self.database.max_connections == 0 {
            return Err(invalid("DB_MAX_CONNECTIONS", "must be at least 1"));
        }
        Ok(())
    }
}

fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.into(),
    }
}

fn parse_duration(key: &'static str, value: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(value).map_err(|e| invalid(key, e.to_string()))
}

fn parse_number<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| invalid(key, e.to_string()))
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(invalid(key, format!("expected a boolean, got {other:?}"))),
    }
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn default_worker_id() -> String {
    let host = env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "worker".to_string());
    format!("{host}-{}", std::process::id())
}
