//! Configuration for ArenaCache

use crate::storage::EvictionPolicy;
use serde::Deserialize;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub metrics: MetricsConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on
    pub listen_addr: String,

    /// Maximum number of concurrent connections
    pub max_connections: usize,

    /// Read buffer size per connection (bytes)
    pub read_buffer_size: usize,

    /// Write buffer size per connection (bytes)
    pub write_buffer_size: usize,

    /// Number of Tokio worker threads (0 = number of CPUs)
    pub worker_threads: usize,

    /// Idle connection timeout in seconds (0 = no timeout)
    pub connection_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:11211".to_string(),
            max_connections: 10000,
            read_buffer_size: 8192,
            write_buffer_size: 8192,
            worker_threads: 0,
            connection_timeout_secs: 0,
        }
    }
}

/// Which storage implementation backs the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Partitioned index over block-allocated arenas
    #[default]
    Block,
    /// Plain ownership map, bytes accounted by element size
    Memory,
}

/// Storage engine configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,

    /// Number of independently locked partitions
    pub partitions: usize,

    /// Hash buckets per partition (power of two)
    pub buckets_per_partition: usize,

    /// Allocation unit of each partition's arena
    pub block_size: usize,

    /// Total arena bytes, split evenly across partitions
    pub max_bytes: u64,

    /// Evict from a partition while its free bytes are below this
    pub ceiling_bytes: u64,

    /// Maximum number of live items across all partitions
    pub max_items: usize,

    pub eviction: EvictionPolicy,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Block,
            partitions: 16,
            buckets_per_partition: 32768,
            block_size: 32,
            max_bytes: 64 * 1024 * 1024, // 64MB
            ceiling_bytes: 64 * 1024,    // 64KB per partition
            max_items: 1_000_000,
            eviction: EvictionPolicy::Lru,
        }
    }
}

impl StorageConfig {
    /// Arena bytes owned by each partition
    pub fn partition_bytes(&self) -> u64 {
        self.max_bytes / self.partitions.max(1) as u64
    }

    /// Check that the storage parameters describe a usable engine
    pub fn validate(&self) -> crate::Result<()> {
        let fail = |msg: String| Err(crate::ArenaCacheError::Config(msg));

        if self.partitions == 0 {
            return fail("storage.partitions must be at least 1".to_string());
        }
        if self.max_items == 0 {
            return fail("storage.max_items must be at least 1".to_string());
        }
        if self.backend == StorageBackend::Memory {
            return Ok(());
        }
        if !self.buckets_per_partition.is_power_of_two() {
            return fail(format!(
                "storage.buckets_per_partition must be a power of two, got {}",
                self.buckets_per_partition
            ));
        }
        if self.block_size == 0 {
            return fail("storage.block_size must be at least 1".to_string());
        }
        let per_partition = self.partition_bytes();
        if per_partition < self.block_size as u64 {
            return fail(format!(
                "storage.max_bytes gives {per_partition} bytes per partition, less than one {} byte block",
                self.block_size
            ));
        }
        if u32::try_from(per_partition / self.block_size as u64).is_err() {
            return fail(format!(
                "storage.max_bytes gives more than {} blocks per partition",
                u32::MAX
            ));
        }
        if self.ceiling_bytes >= per_partition {
            return fail(format!(
                "storage.ceiling_bytes ({}) must be below the per-partition arena size ({per_partition})",
                self.ceiling_bytes
            ));
        }
        Ok(())
    }
}

/// Metrics and health check configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable metrics collection
    pub enabled: bool,

    /// Address for metrics/health HTTP server
    pub listen_addr: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: "127.0.0.1:9090".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> crate::Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            crate::ArenaCacheError::Config(format!("Failed to read config file: {e}"))
        })?;

        Self::from_toml(&contents)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(contents: &str) -> crate::Result<Self> {
        let config: Self = toml::from_str(contents)
            .map_err(|e| crate::ArenaCacheError::Config(format!("Failed to parse config: {e}")))?;
        config.storage.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables or use defaults
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("ARENACACHE_LISTEN_ADDR") {
            config.server.listen_addr = addr;
        }

        if let Some(n) = env_number("ARENACACHE_MAX_CONNECTIONS") {
            config.server.max_connections = n;
        }

        if let Some(n) = env_number("ARENACACHE_MAX_BYTES") {
            config.storage.max_bytes = n;
        }

        if let Some(n) = env_number("ARENACACHE_MAX_ITEMS") {
            config.storage.max_items = n;
        }

        if let Some(n) = env_number("ARENACACHE_PARTITIONS") {
            config.storage.partitions = n;
        }

        if let Ok(policy) = std::env::var("ARENACACHE_EVICTION") {
            config.storage.eviction = match policy.to_lowercase().as_str() {
                "fifo" => EvictionPolicy::Fifo,
                "lru" => EvictionPolicy::Lru,
                other => {
                    return Err(crate::ArenaCacheError::Config(format!(
                        "Unknown eviction policy: {other}"
                    )));
                }
            };
        }

        if let Ok(backend) = std::env::var("ARENACACHE_BACKEND") {
            config.storage.backend = match backend.to_lowercase().as_str() {
                "block" => StorageBackend::Block,
                "memory" => StorageBackend::Memory,
                other => {
                    return Err(crate::ArenaCacheError::Config(format!(
                        "Unknown storage backend: {other}"
                    )));
                }
            };
        }

        if let Ok(addr) = std::env::var("ARENACACHE_METRICS_ADDR") {
            config.metrics.listen_addr = addr;
        }

        if let Ok(enabled) = std::env::var("ARENACACHE_METRICS_ENABLED") {
            config.metrics.enabled = enabled.to_lowercase() == "true" || enabled == "1";
        }

        config.storage.validate()?;
        Ok(config)
    }
}

fn env_number<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.storage.validate().is_ok());
        assert_eq!(config.storage.partition_bytes(), 4 * 1024 * 1024);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[server]
listen_addr = "0.0.0.0:22122"

[storage]
backend = "block"
partitions = 4
buckets_per_partition = 1024
block_size = 16
max_bytes = 1048576
ceiling_bytes = 1024
max_items = 999
eviction = "fifo"
"#
        )
        .unwrap();

        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.server.listen_addr, "0.0.0.0:22122");
        assert_eq!(config.server.max_connections, 10000);
        assert_eq!(config.storage.partitions, 4);
        assert_eq!(config.storage.max_items, 999);
        assert_eq!(config.storage.eviction, EvictionPolicy::Fifo);
        assert_eq!(config.storage.backend, StorageBackend::Block);
    }

    #[test]
    fn test_memory_backend_from_toml() {
        let config = Config::from_toml("[storage]\nbackend = \"memory\"\neviction = \"lru\"\n").unwrap();
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.storage.eviction, EvictionPolicy::Lru);
    }

    #[test]
    fn test_rejects_non_power_of_two_buckets() {
        let result = Config::from_toml("[storage]\nbuckets_per_partition = 1000\n");
        assert!(matches!(result, Err(crate::ArenaCacheError::Config(_))));
    }

    #[test]
    fn test_rejects_ceiling_above_partition() {
        let storage = StorageConfig {
            partitions: 2,
            max_bytes: 4096,
            ceiling_bytes: 2048,
            ..StorageConfig::default()
        };
        assert!(storage.validate().is_err());
    }

    #[test]
    fn test_rejects_tiny_partition() {
        let storage = StorageConfig {
            partitions: 8,
            block_size: 64,
            max_bytes: 256,
            ceiling_bytes: 0,
            ..StorageConfig::default()
        };
        assert!(storage.validate().is_err());
    }

    #[test]
    fn test_missing_file() {
        let result = Config::from_file("/nonexistent/arenacache.toml");
        assert!(matches!(result, Err(crate::ArenaCacheError::Config(_))));
    }
}
