use serde::Deserialize;

/// Agent configuration, read from `FIELD_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    /// Directory for the durable mutation queue. Unset keeps the queue in memory.
    #[serde(default)]
    pub data_dir: Option<String>,
    #[serde(default = "default_queue_namespace")]
    pub queue_namespace: String,
    #[serde(default = "default_queue_max_entries")]
    pub queue_max_entries: usize,
    #[serde(default)]
    pub lease_backend: LeaseBackend,
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_stale_after")]
    pub lease_stale_after_secs: u64,
    #[serde(default)]
    pub team_id: Option<String>,
    #[serde(default)]
    pub actor_id: Option<String>,
    #[serde(default)]
    pub actor_name: Option<String>,
    /// Backend REST API that replays mutations and resolves holder names.
    #[serde(default)]
    pub api_base_url: Option<String>,
    #[serde(default)]
    pub api_token: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseBackend {
    #[default]
    Memory,
    Postgres,
    Redis,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            log_filter: default_log_filter(),
            data_dir: None,
            queue_namespace: default_queue_namespace(),
            queue_max_entries: default_queue_max_entries(),
            lease_backend: LeaseBackend::Memory,
            database_url: None,
            redis_url: None,
            heartbeat_interval_secs: default_heartbeat_interval(),
            lease_stale_after_secs: default_stale_after(),
            team_id: None,
            actor_id: None,
            actor_name: None,
            api_base_url: None,
            api_token: None,
        }
    }
}

impl AppConfig {
    /// Read `FIELD_*` variables (`FIELD_LEASE_BACKEND`, `FIELD_DATA_DIR`, ...).
    /// A malformed value is an error; nothing is silently defaulted.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let source = config::Config::builder()
            .add_source(config::Environment::with_prefix("FIELD").prefix_separator("_"))
            .build()?;
        Self::from_source(source)
    }

    pub fn from_source(source: config::Config) -> Result<Self, config::ConfigError> {
        source.try_deserialize().map(AppConfig::normalize)
    }

    fn normalize(mut self) -> Self {
        self.data_dir = Self::normalize_opt(self.data_dir.take());
        self.database_url = Self::normalize_opt(self.database_url.take());
        self.redis_url = Self::normalize_opt(self.redis_url.take());
        self.team_id = Self::normalize_opt(self.team_id.take());
        self.actor_id = Self::normalize_opt(self.actor_id.take());
        self.actor_name = Self::normalize_opt(self.actor_name.take());
        self.api_base_url = Self::normalize_opt(self.api_base_url.take())
            .map(|url| url.trim_end_matches('/').to_string());
        self.api_token = Self::normalize_opt(self.api_token.take());
        self.queue_max_entries = self.queue_max_entries.max(1);
        self.heartbeat_interval_secs = self.heartbeat_interval_secs.max(1);
        self
    }

    fn normalize_opt(value: Option<String>) -> Option<String> {
        value.and_then(|s| {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }
}

fn default_bind_addr() -> String {
    "127.0.0.1:8787".to_string()
}

fn default_log_filter() -> String {
    "info,field_sync=debug".to_string()
}

fn default_queue_namespace() -> String {
    crate::queue::DEFAULT_NAMESPACE.to_string()
}

fn default_queue_max_entries() -> usize {
    5_000
}

fn default_heartbeat_interval() -> u64 {
    60
}

fn default_stale_after() -> u64 {
    30 * 60
}
