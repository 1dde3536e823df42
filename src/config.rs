//! Configuration loaded from a TOML file with environment overrides.

use std::path::Path;

use serde::Deserialize;

/// Default host to bind the coordinator to.
const DEFAULT_HOST: &str = "0.0.0.0";

/// Default port to bind the coordinator to.
const DEFAULT_PORT: u16 = 8080;

/// Default database URL.
const DEFAULT_DATABASE_URL: &str = "sqlite://crucible.db";

/// Default job timeout in seconds when a submission omits one.
const DEFAULT_TIMEOUT_SECONDS: i64 = 600;

/// Default maximum characters stored per log chunk.
const DEFAULT_MAX_LOG_CHARS: usize = 4000;

/// Default container image when a submission omits one.
const DEFAULT_CONTAINER_IMAGE: &str = "debian:stable";

/// Default container network mode (`job` = fresh bridge per job).
const DEFAULT_NETWORK_MODE: &str = "job";

/// Default container user.
const DEFAULT_RUN_AS: &str = "root";

/// Capabilities added back after dropping all; the default keeps common
/// build tooling (apt, ping) working.
const DEFAULT_CAP_ADD: &str = "CHOWN,DAC_OVERRIDE,FOWNER,SETUID,SETGID,NET_RAW";

/// Default worker poll interval in milliseconds.
const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Default coordinator URL for workers and clients.
const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:8080";

/// Environment variable overriding the worker shared token.
pub const ENV_WORKER_TOKEN: &str = "CRUCIBLE_WORKER_TOKEN";

/// Environment variable overriding the database URL.
pub const ENV_DATABASE_URL: &str = "CRUCIBLE_DATABASE_URL";

/// Environment variable overriding the consumer key used by the job CLI.
pub const ENV_CONSUMER_KEY: &str = "CRUCIBLE_CONSUMER_KEY";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct Config {
    /// Coordinator settings.
    #[serde(default)]
    pub server: ServerConfig,
    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Container sandbox settings.
    #[serde(default)]
    pub container: ContainerConfig,
    /// Worker agent settings.
    #[serde(default)]
    pub worker: WorkerConfig,
    /// Consumer client settings for the job CLI.
    #[serde(default)]
    pub client: ClientConfig,
}

/// Coordinator-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct ServerConfig {
    /// Host to bind to (default: `0.0.0.0`).
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind to (default: `8080`).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Shared bearer token required on worker endpoints.
    ///
    /// Worker endpoints answer 503 until this is set.
    #[serde(default)]
    pub worker_token: Option<String>,
    /// Job timeout applied when a submission omits one (default: `600`).
    #[serde(default = "default_timeout_seconds")]
    pub default_timeout_seconds: i64,
    /// Whether submissions may request the local sandbox (default: `true`).
    #[serde(default = "default_true")]
    pub allow_local_sandbox: bool,
    /// Maximum characters stored per log chunk (default: `4000`).
    #[serde(default = "default_max_log_chars")]
    pub max_log_chars: usize,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct DatabaseConfig {
    /// Database URL, e.g. `sqlite://crucible.db` or `sqlite::memory:`
    /// (default: `sqlite://crucible.db`).
    #[serde(default = "default_database_url")]
    pub url: String,
}

/// Container sandbox configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct ContainerConfig {
    /// Image used when a container submission omits one.
    #[serde(default = "default_container_image")]
    pub default_image: String,
    /// Network mode: `job`, `bridge`, `none`, or an existing network name.
    #[serde(default = "default_network_mode")]
    pub network_mode: String,
    /// Container user: `root`, `nobody`, or `uid:gid`.
    #[serde(default = "default_run_as")]
    pub run_as: String,
    /// Comma-separated capabilities to add back after dropping all.
    #[serde(default = "default_cap_add")]
    pub cap_add: String,
    /// Run containers with a read-only root filesystem.
    #[serde(default)]
    pub read_only_rootfs: bool,
}

/// Worker agent configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct WorkerConfig {
    /// Coordinator base URL.
    #[serde(default = "default_server_url")]
    pub server: String,
    /// Shared bearer token presented to the coordinator.
    #[serde(default)]
    pub token: Option<String>,
    /// Identifier reported in `X-Worker-Id` (default: `worker`).
    #[serde(default = "default_worker_id")]
    pub worker_id: String,
    /// Poll interval between empty claims, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

/// Consumer client configuration for the job CLI.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct ClientConfig {
    /// Coordinator base URL.
    #[serde(default = "default_server_url")]
    pub server: String,
    /// Consumer token (`kid_….db_…`).
    #[serde(default)]
    pub consumer_key: Option<String>,
    /// Sandbox used when a submission omits one.
    #[serde(default = "default_sandbox")]
    pub default_sandbox: String,
    /// Timeout used when a submission omits one.
    #[serde(default = "default_timeout_seconds")]
    pub default_timeout_seconds: i64,
    /// Image used for container submissions that omit one.
    #[serde(default)]
    pub default_image: Option<String>,
}

/// Default host function for serde.
fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

/// Default port function for serde.
fn default_port() -> u16 {
    DEFAULT_PORT
}

/// Default `true` for serde.
fn default_true() -> bool {
    true
}

/// Default timeout function for serde.
fn default_timeout_seconds() -> i64 {
    DEFAULT_TIMEOUT_SECONDS
}

/// Default log chunk cap function for serde.
fn default_max_log_chars() -> usize {
    DEFAULT_MAX_LOG_CHARS
}

/// Default database URL function for serde.
fn default_database_url() -> String {
    DEFAULT_DATABASE_URL.to_string()
}

/// Default container image function for serde.
fn default_container_image() -> String {
    DEFAULT_CONTAINER_IMAGE.to_string()
}

/// Default network mode function for serde.
fn default_network_mode() -> String {
    DEFAULT_NETWORK_MODE.to_string()
}

/// Default container user function for serde.
fn default_run_as() -> String {
    DEFAULT_RUN_AS.to_string()
}

/// Default capability list function for serde.
fn default_cap_add() -> String {
    DEFAULT_CAP_ADD.to_string()
}

/// Default server URL function for serde.
fn default_server_url() -> String {
    DEFAULT_SERVER_URL.to_string()
}

/// Default worker id function for serde.
fn default_worker_id() -> String {
    "worker".to_string()
}

/// Default sandbox function for serde.
fn default_sandbox() -> String {
    "local".to_string()
}

/// Default poll interval function for serde.
fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            worker_token: None,
            default_timeout_seconds: default_timeout_seconds(),
            allow_local_sandbox: true,
            max_log_chars: default_max_log_chars(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
        }
    }
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            default_image: default_container_image(),
            network_mode: default_network_mode(),
            run_as: default_run_as(),
            cap_add: default_cap_add(),
            read_only_rootfs: false,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            server: default_server_url(),
            token: None,
            worker_id: default_worker_id(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: default_server_url(),
            consumer_key: None,
            default_sandbox: default_sandbox(),
            default_timeout_seconds: default_timeout_seconds(),
            default_image: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then apply environment
    /// overrides.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Load the configuration from an optional file path; defaults plus
    /// environment overrides when no file is given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let mut config = Config::default();
                config.apply_env();
                config.validate()?;
                Ok(config)
            }
        }
    }

    /// Fill secrets and locations from the environment.
    ///
    /// Environment values win over file values so deployments can keep
    /// tokens out of config files.
    fn apply_env(&mut self) {
        if let Ok(token) = std::env::var(ENV_WORKER_TOKEN)
            && !token.is_empty()
        {
            self.server.worker_token = Some(token.clone());
            self.worker.token = Some(token);
        }
        if let Ok(url) = std::env::var(ENV_DATABASE_URL)
            && !url.is_empty()
        {
            self.database.url = url;
        }
        if let Ok(key) = std::env::var(ENV_CONSUMER_KEY)
            && !key.is_empty()
        {
            self.client.consumer_key = Some(key);
        }
    }

    /// Validate configuration.
    fn validate(&self) -> anyhow::Result<()> {
        if self.server.default_timeout_seconds < 1 || self.server.default_timeout_seconds > 86_400
        {
            anyhow::bail!("`server.default_timeout_seconds` must be within 1..=86400");
        }
        if self.server.max_log_chars == 0 {
            anyhow::bail!("`server.max_log_chars` must be at least 1");
        }
        if self.worker.poll_interval_ms == 0 {
            anyhow::bail!("`worker.poll_interval_ms` must be at least 1");
        }
        Ok(())
    }
}
