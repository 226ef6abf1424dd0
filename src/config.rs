use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LogConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub connectors: ConnectorsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
}

/// Which catalog store backs the service.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Postgres,
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default = "default_db_host")]
    pub host: String,
    #[serde(default = "default_db_port")]
    pub port: u16,
    #[serde(default = "default_db_name")]
    pub dbname: String,
    #[serde(default = "default_db_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            host: default_db_host(),
            port: default_db_port(),
            dbname: default_db_name(),
            user: default_db_user(),
            password: String::new(),
            pool_size: default_pool_size(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_max_log_files")]
    pub max_log_files: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            log_level: default_log_level(),
            max_log_files: default_max_log_files(),
        }
    }
}

/// How scan bodies are dispatched after a job row is created.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum QueueMode {
    /// Background worker fed through a channel.
    #[default]
    Async,
    /// Run on the enqueuing thread before returning.
    Inline,
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    #[serde(default)]
    pub mode: QueueMode,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            mode: QueueMode::default(),
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay_secs(),
        }
    }
}

impl QueueConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ConnectorsConfig {
    #[serde(default)]
    pub postgres: PostgresSourceConfig,
    #[serde(default)]
    pub snowflake: SnowflakeSourceConfig,
    #[serde(default)]
    pub s3: S3SourceConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PostgresSourceConfig {
    /// libpq connection string of the database to scan; unset means stub metadata.
    pub url: Option<String>,
}

/// Warehouse account read through the Snowflake SQL API.
#[derive(Debug, Deserialize, Clone)]
pub struct SnowflakeSourceConfig {
    #[serde(default)]
    pub enabled: bool,
    pub account: Option<String>,
    pub user: Option<String>,
    pub role: Option<String>,
    pub warehouse: Option<String>,
    /// Databases to scan; the session's current database when empty.
    #[serde(default)]
    pub databases: Vec<String>,
    /// OAuth or programmatic access token sent as a bearer token.
    pub token: Option<String>,
    /// `X-Snowflake-Authorization-Token-Type` header value, `OAUTH` when unset.
    pub token_type: Option<String>,
    /// Overrides `https://<account>.snowflakecomputing.com`.
    pub endpoint: Option<String>,
    #[serde(default = "default_snowflake_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct S3SourceConfig {
    #[serde(default = "default_bucket")]
    pub bucket: String,
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

impl Default for SnowflakeSourceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            account: None,
            user: None,
            role: None,
            warehouse: None,
            databases: Vec::new(),
            token: None,
            token_type: None,
            endpoint: None,
            timeout_secs: default_snowflake_timeout_secs(),
        }
    }
}

impl Default for S3SourceConfig {
    fn default() -> Self {
        Self {
            bucket: default_bucket(),
            prefix: default_prefix(),
        }
    }
}

fn default_snowflake_timeout_secs() -> u64 {
    60
}

fn default_log_dir() -> String {
    "./logs".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    7
}

fn default_pool_size() -> usize {
    16
}

fn default_worker_threads() -> usize {
    4
}

fn default_db_host() -> String {
    "localhost".to_string()
}

fn default_db_port() -> u16 {
    5432
}

fn default_db_name() -> String {
    "catalog".to_string()
}

fn default_db_user() -> String {
    "postgres".to_string()
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_delay_secs() -> u64 {
    10
}

fn default_bucket() -> String {
    "bucket".to_string()
}

fn default_prefix() -> String {
    "prefix/".to_string()
}

impl AppConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config_str = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        Self::from_toml(&config_str)
    }

    pub fn from_toml(config_str: &str) -> Result<Self> {
        toml::from_str(config_str).context("Failed to parse config file")
    }

    pub fn database_url(&self) -> String {
        format!(
            "host={} port={} dbname={} user={} password={}",
            self.database.host,
            self.database.port,
            self.database.dbname,
            self.database.user,
            self.database.password
        )
    }
}
