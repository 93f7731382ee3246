use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc, time::Duration};

use crate::error::{GateError, Result};

/// Default configuration file consulted when `CONFIG_PATH` is unset
pub const DEFAULT_CONFIG_PATH: &str = "config/eventgate";

/// Top-level service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub http_addr: String,
    pub redis: RedisSettings,
    pub store: StoreSettings,
    pub messaging: MessagingSettings,
    pub roles: RoleSettings,
    pub policies: PolicySet,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            http_addr: "0.0.0.0:8080".to_string(),
            redis: RedisSettings::default(),
            store: StoreSettings::default(),
            messaging: MessagingSettings::default(),
            roles: RoleSettings::default(),
            policies: PolicySet::default(),
        }
    }
}

impl Settings {
    pub fn http_addr(&self) -> Result<SocketAddr> {
        self.http_addr
            .parse()
            .map_err(|e| GateError::Config(format!("Invalid http_addr '{}': {}", self.http_addr, e)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisSettings {
    pub url: String,
    pub connection_timeout_ms: u64,
    pub command_timeout_ms: u64,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            connection_timeout_ms: 5_000,
            command_timeout_ms: 1_000,
        }
    }
}

/// Backing store for counters and cached query results
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreType {
    #[default]
    Redis,
    /// Process-local store, for development without Redis
    Memory,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    #[serde(rename = "type")]
    pub store_type: StoreType,
}

/// Messaging type discriminator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagingType {
    /// RabbitMQ topic exchange
    #[default]
    Amqp,
    /// In-process broadcast channel
    Channel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingSettings {
    #[serde(rename = "type")]
    pub messaging_type: MessagingType,
    pub url: String,
    pub exchange: String,
    pub connect_retries: usize,
    pub retry_delay_ms: u64,
}

impl Default for MessagingSettings {
    fn default() -> Self {
        Self {
            messaging_type: MessagingType::Amqp,
            url: "amqp://localhost:5672".to_string(),
            exchange: "social_events".to_string(),
            connect_retries: 5,
            retry_delay_ms: 3_000,
        }
    }
}

/// Which services this process hosts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleSettings {
    pub posts: bool,
    pub search: bool,
    pub media: bool,
}

impl Default for RoleSettings {
    fn default() -> Self {
        Self {
            posts: true,
            search: true,
            media: true,
        }
    }
}

impl RoleSettings {
    /// Search and media exist only to consume events
    pub fn depends_on_bus(&self) -> bool {
        self.search || self.media
    }
}

/// Degraded-mode limits applied per process while the shared store is down
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsuranceConfig {
    pub points: u32,
    pub window_seconds: u64,
}

/// Raw, unvalidated policy as it appears in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub points: u32,
    pub window_seconds: u64,
    #[serde(default)]
    pub block_seconds: u64,
    #[serde(default)]
    pub insurance: Option<InsuranceConfig>,
}

/// The three route classes that carry a limit
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySet {
    pub global: PolicyConfig,
    pub sensitive: PolicyConfig,
    pub create_post: PolicyConfig,
}

impl Default for PolicySet {
    fn default() -> Self {
        Self {
            global: PolicyConfig {
                points: 20,
                window_seconds: 1,
                block_seconds: 60,
                insurance: Some(InsuranceConfig {
                    points: 10,
                    window_seconds: 1,
                }),
            },
            sensitive: PolicyConfig {
                points: 50,
                window_seconds: 900,
                block_seconds: 0,
                insurance: None,
            },
            create_post: PolicyConfig {
                points: 5,
                window_seconds: 60,
                block_seconds: 120,
                insurance: Some(InsuranceConfig {
                    points: 2,
                    window_seconds: 60,
                }),
            },
        }
    }
}

impl PolicySet {
    /// Validate every policy and freeze it for sharing across requests
    pub fn compile(&self) -> Result<Policies> {
        Ok(Policies {
            global: Arc::new(RateLimitPolicy::from_config("global", &self.global)?),
            sensitive: Arc::new(RateLimitPolicy::from_config("sensitive", &self.sensitive)?),
            create_post: Arc::new(RateLimitPolicy::from_config("create_post", &self.create_post)?),
        })
    }
}

/// Compiled policies, one per protected route class
#[derive(Debug, Clone)]
pub struct Policies {
    pub global: Arc<RateLimitPolicy>,
    pub sensitive: Arc<RateLimitPolicy>,
    pub create_post: Arc<RateLimitPolicy>,
}

/// An immutable fixed-window limit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitPolicy {
    key_prefix: String,
    points_per_window: u32,
    window_seconds: u64,
    block_seconds: u64,
    insurance_points: u32,
    insurance_window_seconds: u64,
}

impl RateLimitPolicy {
    pub fn new(
        key_prefix: impl Into<String>,
        points_per_window: u32,
        window_seconds: u64,
        block_seconds: u64,
        insurance_points: u32,
        insurance_window_seconds: u64,
    ) -> Result<Self> {
        let key_prefix = key_prefix.into();
        if key_prefix.is_empty() {
            return Err(GateError::Config("Policy key prefix must not be empty".to_string()));
        }
        if points_per_window == 0 || window_seconds == 0 {
            return Err(GateError::Config(format!(
                "Policy '{}' needs points and window greater than zero",
                key_prefix
            )));
        }
        if insurance_points == 0 || insurance_window_seconds == 0 {
            return Err(GateError::Config(format!(
                "Policy '{}' needs insurance points and window greater than zero",
                key_prefix
            )));
        }

        Ok(Self {
            key_prefix,
            points_per_window,
            window_seconds,
            block_seconds,
            insurance_points,
            insurance_window_seconds,
        })
    }

    /// Build from configuration. Without an explicit insurance section the
    /// fallback allows half the points over the same window.
    pub fn from_config(key_prefix: &str, config: &PolicyConfig) -> Result<Self> {
        let (insurance_points, insurance_window) = match &config.insurance {
            Some(insurance) => (insurance.points, insurance.window_seconds),
            None => ((config.points / 2).max(1), config.window_seconds),
        };

        Self::new(
            key_prefix,
            config.points,
            config.window_seconds,
            config.block_seconds,
            insurance_points,
            insurance_window,
        )
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    pub fn points_per_window(&self) -> u32 {
        self.points_per_window
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }

    pub fn block(&self) -> Duration {
        Duration::from_secs(self.block_seconds)
    }

    pub fn insurance_points(&self) -> u32 {
        self.insurance_points
    }

    pub fn insurance_window(&self) -> Duration {
        Duration::from_secs(self.insurance_window_seconds)
    }

    /// Counter key for a client under this policy. Counters and block
    /// markers live under disjoint segments so no client key can name the
    /// other kind.
    pub fn counter_key(&self, client_key: &str) -> String {
        format!("{}:c:{}", self.key_prefix, client_key)
    }

    /// Blocked-until marker key for a client under this policy
    pub fn block_key(&self, client_key: &str) -> String {
        format!("{}:b:{}", self.key_prefix, client_key)
    }
}

/// Load settings from defaults, an optional YAML file and `EVENTGATE_*`
/// environment variables, in increasing precedence.
pub fn load_settings(path: Option<&str>) -> Result<Settings> {
    let path = path.unwrap_or(DEFAULT_CONFIG_PATH);

    config::Config::builder()
        .add_source(config::File::with_name(path).required(false))
        .add_source(
            config::Environment::with_prefix("EVENTGATE")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()
        .and_then(|c| c.try_deserialize::<Settings>())
        .map_err(|e| GateError::Config(format!("Failed to load settings: {}", e)))
}

/// Load a policy set from a YAML string
pub fn load_policies_from_yaml(yaml: &str) -> Result<PolicySet> {
    serde_yaml::from_str(yaml)
        .map_err(|e| GateError::Config(format!("Failed to parse YAML: {}", e)))
}

/// Load a policy set from a YAML file
pub fn load_policies_from_file(path: &str) -> Result<PolicySet> {
    let content = std::fs::read_to_string(path)?;
    load_policies_from_yaml(&content)
}
