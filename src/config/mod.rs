/// Configuration management for compuerta
use crate::cache::{CacheConfig, InvalidationRule};
use crate::pool::PoolConfig;
use crate::proxy::{ProxyConfig, RewriteRule};
use crate::replica::{Dialect, LoadBalanceStrategy, ReplicaConfig};
use crate::shard::{HashFunction, ShardConfig, ShardingStrategy};
use crate::txn::TransactionConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

pub use crate::error::ConfigError;

/// Main compuerta configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Primary, replica and backup connections
    pub pool: PoolSettings,
    /// Replica selection and monitoring
    #[serde(default)]
    pub replica: ReplicaSettings,
    /// Key-based sharding (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard: Option<ShardSettings>,
    /// Query result cache
    #[serde(default)]
    pub cache: CacheSettings,
    /// Managed transactions
    #[serde(default)]
    pub transaction: TransactionSettings,
    /// Database proxy
    #[serde(default)]
    pub proxy: ProxySettings,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Connection parameters handed to the connection factory
#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default)]
    pub dialect: Dialect,
    #[serde(default = "default_max_open_conns")]
    pub max_open_conns: u32,
    #[serde(default = "default_max_idle_conns")]
    pub max_idle_conns: u32,
    #[serde(default = "default_conn_max_lifetime_sec")]
    pub conn_max_lifetime_sec: u64,
    #[serde(default)]
    pub tls: bool,
}

// Credentials never reach logs.
impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("dialect", &self.dialect)
            .field("max_open_conns", &self.max_open_conns)
            .field("max_idle_conns", &self.max_idle_conns)
            .field("conn_max_lifetime_sec", &self.conn_max_lifetime_sec)
            .field("tls", &self.tls)
            .finish()
    }
}

fn default_max_open_conns() -> u32 {
    25
}

fn default_max_idle_conns() -> u32 {
    5
}

fn default_conn_max_lifetime_sec() -> u64 {
    300
}

impl DatabaseConfig {
    pub fn new(host: &str, port: u16, database: &str, username: &str) -> Self {
        Self {
            host: host.to_string(),
            port,
            database: database.to_string(),
            username: username.to_string(),
            password: None,
            dialect: Dialect::default(),
            max_open_conns: default_max_open_conns(),
            max_idle_conns: default_max_idle_conns(),
            conn_max_lifetime_sec: default_conn_max_lifetime_sec(),
            tls: false,
        }
    }

    /// host:port/database, for logs
    pub fn endpoint(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.database)
    }

    fn validate(&self, owner: &str) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "{owner}: host cannot be empty"
            )));
        }
        if self.port == 0 {
            return Err(ConfigError::ValidationError(format!(
                "{owner}: port must be greater than 0"
            )));
        }
        if self.max_open_conns == 0 {
            return Err(ConfigError::ValidationError(format!(
                "{owner}: max_open_conns must be greater than 0"
            )));
        }
        if self.max_idle_conns > self.max_open_conns {
            return Err(ConfigError::ValidationError(format!(
                "{owner}: max_idle_conns cannot exceed max_open_conns"
            )));
        }
        Ok(())
    }
}

/// Pool membership and health checking
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolSettings {
    /// Health check interval in seconds
    #[serde(default = "default_health_interval_sec")]
    pub health_check_interval_sec: u64,
    /// Per-ping timeout in seconds
    #[serde(default = "default_ping_timeout_sec")]
    pub ping_timeout_sec: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary: Option<DatabaseConfig>,
    #[serde(default)]
    pub replicas: Vec<ReplicaEntry>,
    #[serde(default)]
    pub backups: Vec<BackupEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplicaEntry {
    pub name: String,
    #[serde(default = "default_weight")]
    pub weight: i32,
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackupEntry {
    pub name: String,
    /// Lower values are preferred
    #[serde(default)]
    pub priority: u32,
    pub database: DatabaseConfig,
}

fn default_health_interval_sec() -> u64 {
    30
}

fn default_ping_timeout_sec() -> u64 {
    5
}

fn default_weight() -> i32 {
    1
}

/// Replica selection and monitoring
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ReplicaSettings {
    pub strategy: LoadBalanceStrategy,
    pub max_replica_lag_sec: u64,
    pub failover_threshold: u32,
    pub lag_check_interval_sec: u64,
    pub recovery_check_interval_sec: u64,
    pub auto_recovery: bool,
}

impl Default for ReplicaSettings {
    fn default() -> Self {
        Self {
            strategy: LoadBalanceStrategy::WeightedRoundRobin,
            max_replica_lag_sec: 10,
            failover_threshold: 3,
            lag_check_interval_sec: 10,
            recovery_check_interval_sec: 30,
            auto_recovery: true,
        }
    }
}

/// Shard topology
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShardSettings {
    #[serde(default)]
    pub strategy: ShardingStrategy,
    #[serde(default)]
    pub hash_function: HashFunction,
    #[serde(default = "default_virtual_nodes")]
    pub virtual_nodes: usize,
    #[serde(default = "default_true")]
    pub enable_cross_shard: bool,
    #[serde(default = "default_max_cross_shard")]
    pub max_cross_shard_queries: usize,
    #[serde(default)]
    pub shards: Vec<ShardEntry>,
    #[serde(default)]
    pub ranges: Vec<RangeEntry>,
    #[serde(default)]
    pub lookups: Vec<LookupEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShardEntry {
    pub id: u32,
    pub name: String,
    #[serde(default = "default_weight")]
    pub weight: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RangeEntry {
    pub min: String,
    pub max: String,
    pub shard_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LookupEntry {
    pub key: String,
    pub shard_id: u32,
}

fn default_virtual_nodes() -> usize {
    150
}

fn default_max_cross_shard() -> usize {
    10
}

fn default_true() -> bool {
    true
}

/// Query result cache
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CacheSettings {
    pub enabled: bool,
    pub namespace: String,
    pub default_ttl_sec: u64,
    pub max_size_bytes: usize,
    pub sweep_interval_sec: u64,
    pub rules: Vec<CacheRuleEntry>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            namespace: "compuerta".to_string(),
            default_ttl_sec: 300,
            max_size_bytes: 100 * 1024 * 1024,
            sweep_interval_sec: 60,
            rules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheRuleEntry {
    pub pattern: String,
    pub ttl_sec: u64,
}

/// Managed transactions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TransactionSettings {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    /// 0 disables the per-attempt timeout
    pub timeout_sec: u64,
}

impl Default for TransactionSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 100,
            timeout_sec: 0,
        }
    }
}

/// Database proxy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ProxySettings {
    /// 0 disables the per-call timeout
    pub query_timeout_ms: u64,
    pub slow_query_threshold_ms: u64,
    pub enable_load_balancing: bool,
    pub enable_query_rewrite: bool,
    pub rewrite_rules: Vec<RewriteRuleEntry>,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            query_timeout_ms: 30_000,
            slow_query_threshold_ms: 1_000,
            enable_load_balancing: true,
            enable_query_rewrite: false,
            rewrite_rules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RewriteRuleEntry {
    pub pattern: String,
    pub replacement: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (json, text)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pool: PoolSettings {
                primary: Some(DatabaseConfig::new("127.0.0.1", 5432, "app", "app")),
                replicas: Vec::new(),
                backups: Vec::new(),
                health_check_interval_sec: default_health_interval_sec(),
                ping_timeout_sec: default_ping_timeout_sec(),
            },
            replica: ReplicaSettings::default(),
            shard: None,
            cache: CacheSettings::default(),
            transaction: TransactionSettings::default(),
            proxy: ProxySettings::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_pool()?;
        self.validate_replica()?;
        if let Some(shard) = &self.shard {
            shard.validate()?;
        }

        if self.pool.primary.is_none() && self.shard.is_none() {
            return Err(ConfigError::ValidationError(
                "either pool.primary or a shard section must be configured".to_string(),
            ));
        }

        if self.cache.enabled {
            if self.cache.max_size_bytes == 0 {
                return Err(ConfigError::ValidationError(
                    "cache max_size_bytes must be greater than 0".to_string(),
                ));
            }
            if self.cache.sweep_interval_sec == 0 {
                return Err(ConfigError::ValidationError(
                    "cache sweep_interval_sec must be greater than 0".to_string(),
                ));
            }
        }

        if self.proxy.enable_query_rewrite
            && self.proxy.rewrite_rules.iter().any(|r| r.pattern.is_empty())
        {
            return Err(ConfigError::ValidationError(
                "rewrite rule pattern cannot be empty".to_string(),
            ));
        }

        // Validate logging config
        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {}",
                    self.logging.level
                )))
            }
        }

        match self.logging.format.as_str() {
            "json" | "text" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format: {}",
                    self.logging.format
                )))
            }
        }

        Ok(())
    }

    fn validate_pool(&self) -> Result<(), ConfigError> {
        if let Some(primary) = &self.pool.primary {
            primary.validate("primary")?;
        }

        let mut names = HashSet::new();
        for replica in &self.pool.replicas {
            if replica.name.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "replica name cannot be empty".to_string(),
                ));
            }
            if !names.insert(replica.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate replica name: {}",
                    replica.name
                )));
            }
            replica.database.validate(&replica.name)?;
        }

        for backup in &self.pool.backups {
            if !names.insert(backup.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate backup name: {}",
                    backup.name
                )));
            }
            backup.database.validate(&backup.name)?;
        }

        if self.pool.health_check_interval_sec == 0 {
            return Err(ConfigError::ValidationError(
                "health_check_interval_sec must be greater than 0".to_string(),
            ));
        }

        if self.pool.ping_timeout_sec == 0 {
            return Err(ConfigError::ValidationError(
                "ping_timeout_sec must be greater than 0".to_string(),
            ));
        }

        if self.pool.ping_timeout_sec >= self.pool.health_check_interval_sec {
            return Err(ConfigError::ValidationError(
                "ping_timeout_sec must be less than health_check_interval_sec".to_string(),
            ));
        }

        Ok(())
    }

    fn validate_replica(&self) -> Result<(), ConfigError> {
        let replica = &self.replica;
        if replica.max_replica_lag_sec == 0 {
            return Err(ConfigError::ValidationError(
                "max_replica_lag_sec must be greater than 0".to_string(),
            ));
        }
        if replica.failover_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "failover_threshold must be greater than 0".to_string(),
            ));
        }
        if replica.lag_check_interval_sec == 0 || replica.recovery_check_interval_sec == 0 {
            return Err(ConfigError::ValidationError(
                "replica monitoring intervals must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Create example configuration file
    pub fn create_example_config<P: AsRef<Path>>(path: P, mode: &str) -> Result<(), ConfigError> {
        let config = match mode {
            "replicated" => Config {
                pool: PoolSettings {
                    primary: Some(DatabaseConfig::new("10.0.1.10", 5432, "app", "app")),
                    replicas: vec![
                        ReplicaEntry {
                            name: "replica-1".to_string(),
                            weight: 3,
                            database: DatabaseConfig::new("10.0.1.11", 5432, "app", "app"),
                        },
                        ReplicaEntry {
                            name: "replica-2".to_string(),
                            weight: 1,
                            database: DatabaseConfig::new("10.0.1.12", 5432, "app", "app"),
                        },
                    ],
                    backups: vec![BackupEntry {
                        name: "backup-1".to_string(),
                        priority: 0,
                        database: DatabaseConfig::new("10.0.2.10", 5432, "app", "app"),
                    }],
                    health_check_interval_sec: default_health_interval_sec(),
                    ping_timeout_sec: default_ping_timeout_sec(),
                },
                ..Default::default()
            },
            "sharded" => Config {
                pool: PoolSettings {
                    primary: None,
                    replicas: Vec::new(),
                    backups: Vec::new(),
                    health_check_interval_sec: default_health_interval_sec(),
                    ping_timeout_sec: default_ping_timeout_sec(),
                },
                shard: Some(ShardSettings {
                    strategy: ShardingStrategy::ConsistentHash,
                    hash_function: HashFunction::Crc32,
                    virtual_nodes: default_virtual_nodes(),
                    enable_cross_shard: true,
                    max_cross_shard_queries: default_max_cross_shard(),
                    shards: (0..3)
                        .map(|i| ShardEntry {
                            id: i,
                            name: format!("shard-{i}"),
                            weight: 1,
                            region: Some("eu-west-1".to_string()),
                            database: DatabaseConfig::new(
                                &format!("10.0.3.{}", 10 + i),
                                5432,
                                "app",
                                "app",
                            ),
                        })
                        .collect(),
                    ranges: Vec::new(),
                    lookups: Vec::new(),
                }),
                ..Default::default()
            },
            _ => {
                return Err(ConfigError::ValidationError(
                    "Mode must be 'replicated' or 'sharded'".to_string(),
                ))
            }
        };

        config.save_to_file(path)
    }
}

impl ShardSettings {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.shards.is_empty() {
            return Err(ConfigError::ValidationError(
                "shard section requires at least one shard".to_string(),
            ));
        }
        if self.virtual_nodes == 0 {
            return Err(ConfigError::ValidationError(
                "virtual_nodes must be greater than 0".to_string(),
            ));
        }
        if self.max_cross_shard_queries == 0 {
            return Err(ConfigError::ValidationError(
                "max_cross_shard_queries must be greater than 0".to_string(),
            ));
        }

        let mut ids = HashSet::new();
        let mut names = HashSet::new();
        for shard in &self.shards {
            if !ids.insert(shard.id) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate shard id: {}",
                    shard.id
                )));
            }
            if !names.insert(shard.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate shard name: {}",
                    shard.name
                )));
            }
            shard.database.validate(&shard.name)?;
        }

        for range in &self.ranges {
            if range.min >= range.max {
                return Err(ConfigError::ValidationError(format!(
                    "shard range [{}, {}) is empty",
                    range.min, range.max
                )));
            }
            if !ids.contains(&range.shard_id) {
                return Err(ConfigError::ValidationError(format!(
                    "shard range references unknown shard {}",
                    range.shard_id
                )));
            }
        }

        for lookup in &self.lookups {
            if !ids.contains(&lookup.shard_id) {
                return Err(ConfigError::ValidationError(format!(
                    "lookup for {} references unknown shard {}",
                    lookup.key, lookup.shard_id
                )));
            }
        }

        match self.strategy {
            ShardingStrategy::Range if self.ranges.is_empty() => Err(ConfigError::ValidationError(
                "range sharding requires at least one range".to_string(),
            )),
            ShardingStrategy::Lookup if self.lookups.is_empty() => {
                Err(ConfigError::ValidationError(
                    "lookup sharding requires at least one lookup entry".to_string(),
                ))
            }
            _ => Ok(()),
        }
    }
}

impl From<&PoolSettings> for PoolConfig {
    fn from(settings: &PoolSettings) -> Self {
        PoolConfig {
            health_check_interval: Duration::from_secs(settings.health_check_interval_sec),
            ping_timeout: Duration::from_secs(settings.ping_timeout_sec),
        }
    }
}

impl From<&ReplicaSettings> for ReplicaConfig {
    fn from(settings: &ReplicaSettings) -> Self {
        ReplicaConfig {
            strategy: settings.strategy,
            max_replica_lag: Duration::from_secs(settings.max_replica_lag_sec),
            failover_threshold: settings.failover_threshold,
            lag_check_interval: Duration::from_secs(settings.lag_check_interval_sec),
            recovery_check_interval: Duration::from_secs(settings.recovery_check_interval_sec),
            auto_recovery: settings.auto_recovery,
            ..ReplicaConfig::default()
        }
    }
}

impl From<&ShardSettings> for ShardConfig {
    fn from(settings: &ShardSettings) -> Self {
        ShardConfig {
            strategy: settings.strategy,
            hash_function: settings.hash_function,
            virtual_nodes: settings.virtual_nodes,
            enable_cross_shard: settings.enable_cross_shard,
            max_cross_shard_queries: settings.max_cross_shard_queries,
        }
    }
}

impl From<&CacheSettings> for CacheConfig {
    fn from(settings: &CacheSettings) -> Self {
        CacheConfig {
            enabled: settings.enabled,
            namespace: settings.namespace.clone(),
            default_ttl: Duration::from_secs(settings.default_ttl_sec),
            max_size: settings.max_size_bytes,
            sweep_interval: Duration::from_secs(settings.sweep_interval_sec),
            rules: settings
                .rules
                .iter()
                .map(|r| InvalidationRule::new(&r.pattern, Duration::from_secs(r.ttl_sec)))
                .collect(),
        }
    }
}

impl From<&TransactionSettings> for TransactionConfig {
    fn from(settings: &TransactionSettings) -> Self {
        TransactionConfig {
            max_retries: settings.max_retries,
            retry_delay: Duration::from_millis(settings.retry_delay_ms),
            timeout: (settings.timeout_sec > 0).then(|| Duration::from_secs(settings.timeout_sec)),
        }
    }
}

impl From<&ProxySettings> for ProxyConfig {
    fn from(settings: &ProxySettings) -> Self {
        ProxyConfig {
            query_timeout: (settings.query_timeout_ms > 0)
                .then(|| Duration::from_millis(settings.query_timeout_ms)),
            slow_query_threshold: Duration::from_millis(settings.slow_query_threshold_ms),
            enable_load_balancing: settings.enable_load_balancing,
            enable_query_rewrite: settings.enable_query_rewrite,
            rewrite_rules: settings
                .rewrite_rules
                .iter()
                .map(|r| RewriteRule {
                    pattern: r.pattern.clone(),
                    replacement: r.replacement.clone(),
                    enabled: r.enabled,
                })
                .collect(),
        }
    }
}
