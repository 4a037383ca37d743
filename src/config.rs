use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use crate::source::traits::ShardId;
use crate::store::MetadataStore;

/// Backend transfer unit (1 MB). Every fetch is aligned to it.
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// Largest chunk the backend will serve in one call.
pub const MAX_CHUNK_SIZE: u64 = 1024 * 1024;

/// Chunk sizes must be a multiple of this.
pub const CHUNK_ALIGNMENT: u64 = 4096;

/// Default global bandwidth cap (100 GB).
pub const DEFAULT_MAX_BANDWIDTH: u64 = 100 * 1024 * 1024 * 1024;

/// Authorization export/import attempts before a foreign shard is given up on.
pub const DEFAULT_AUTH_IMPORT_ATTEMPTS: u32 = 6;

/// Full descriptor cache flush period (30 minutes).
pub const DEFAULT_DESCRIPTOR_FLUSH_SECS: u64 = 30 * 60;

pub const DEFAULT_SECRET_KEY: &str = "change-this-secret-key";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address, e.g. "0.0.0.0:8080".
    pub bind: String,
    /// Public origin used when rendering stream/download links.
    pub base_url: String,
    /// `max-age` for inline responses.
    pub cache_max_age_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            base_url: String::new(),
            cache_max_age_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Key for deriving public file handles.
    pub secret_key: String,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            secret_key: DEFAULT_SECRET_KEY.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    pub chunk_size: u64,
    /// Total bytes that may be served before new streams are refused.
    pub max_bandwidth: u64,
    pub descriptor_flush_secs: u64,
    pub auth_import_attempts: u32,
    /// Rate-limit waits tolerated for a single chunk fetch.
    pub max_rate_limit_waits: u32,
    /// Upper bound on a single backend-requested wait.
    pub max_rate_limit_wait_secs: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_bandwidth: DEFAULT_MAX_BANDWIDTH,
            descriptor_flush_secs: DEFAULT_DESCRIPTOR_FLUSH_SECS,
            auth_import_attempts: DEFAULT_AUTH_IMPORT_ATTEMPTS,
            max_rate_limit_waits: 5,
            max_rate_limit_wait_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShardEndpoint {
    pub id: ShardId,
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Shard the primary connection is authorized on.
    pub home_shard: ShardId,
    /// Bridge endpoint per shard.
    pub shards: Vec<ShardEndpoint>,
    pub api_key: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            home_shard: 2,
            shards: Vec::new(),
            api_key: None,
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// JSON file with file records to preload into the in-memory store.
    pub seed_path: Option<String>,
}

/// Top-level configuration for the gateway.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub security: SecurityConfig,
    pub streaming: StreamingConfig,
    pub backend: BackendConfig,
    pub store: StoreConfig,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("chunk_size must be a non-zero multiple of 4096 no larger than 1048576, got {0}")]
    ChunkSize(u64),
    #[error("auth_import_attempts must be at least 1")]
    ImportAttempts,
    #[error("home shard {0} has no bridge endpoint")]
    HomeShard(ShardId),
    #[error("descriptor_flush_secs must be at least 1")]
    FlushInterval,
}

/// A chunk size the backend accepts: non-zero, 4 KiB aligned, at most 1 MiB.
pub fn check_chunk_size(chunk: u64) -> Result<(), ConfigError> {
    if chunk == 0 || chunk % CHUNK_ALIGNMENT != 0 || chunk > MAX_CHUNK_SIZE {
        return Err(ConfigError::ChunkSize(chunk));
    }
    Ok(())
}

impl GatewayConfig {
    /// Check the configuration. Returns non-fatal warnings on success.
    pub fn validate(&self) -> Result<Vec<String>, ConfigError> {
        check_chunk_size(self.streaming.chunk_size)?;
        if self.streaming.auth_import_attempts == 0 {
            return Err(ConfigError::ImportAttempts);
        }
        if self.streaming.descriptor_flush_secs == 0 {
            return Err(ConfigError::FlushInterval);
        }
        if !self.backend.shards.is_empty()
            && !self.backend.shards.iter().any(|s| s.id == self.backend.home_shard)
        {
            return Err(ConfigError::HomeShard(self.backend.home_shard));
        }

        let mut warnings = Vec::new();
        if self.security.secret_key == DEFAULT_SECRET_KEY {
            warnings.push("security.secret_key is the default value; handles are predictable".to_string());
        }
        if self.server.base_url.is_empty() {
            warnings.push("server.base_url is not set; links will use localhost".to_string());
        }
        if self.backend.shards.is_empty() {
            warnings.push("backend.shards is empty; every fetch will fail".to_string());
        }
        Ok(warnings)
    }
}

/// Live, operator-adjustable values read at request time.
#[async_trait]
pub trait SettingsProvider: Send + Sync {
    /// Current bandwidth quota in bytes.
    async fn max_bandwidth(&self) -> u64;

    fn chunk_size(&self) -> u64;
}

/// In-process settings that an operator can change at runtime.
pub struct LiveSettings {
    max_bandwidth: AtomicU64,
    chunk_size: AtomicU64,
}

impl LiveSettings {
    pub fn new(max_bandwidth: u64, chunk_size: u64) -> Self {
        Self {
            max_bandwidth: AtomicU64::new(max_bandwidth),
            chunk_size: AtomicU64::new(chunk_size),
        }
    }

    pub fn from_config(config: &StreamingConfig) -> Self {
        Self::new(config.max_bandwidth, config.chunk_size)
    }

    pub fn set_max_bandwidth(&self, bytes: u64) {
        self.max_bandwidth.store(bytes, Ordering::SeqCst);
    }

    /// Change the chunk size used by requests planned from now on.
    pub fn set_chunk_size(&self, bytes: u64) -> Result<(), ConfigError> {
        check_chunk_size(bytes)?;
        self.chunk_size.store(bytes, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl SettingsProvider for LiveSettings {
    async fn max_bandwidth(&self) -> u64 {
        self.max_bandwidth.load(Ordering::SeqCst)
    }

    fn chunk_size(&self) -> u64 {
        self.chunk_size.load(Ordering::SeqCst)
    }
}

/// Reads the quota from the metadata store on every call, so an operator
/// change there applies to the very next admission check.
pub struct StoreSettings {
    store: Arc<dyn MetadataStore>,
    fallback: LiveSettings,
}

impl StoreSettings {
    pub fn new(store: Arc<dyn MetadataStore>, fallback: LiveSettings) -> Self {
        Self { store, fallback }
    }
}

#[async_trait]
impl SettingsProvider for StoreSettings {
    async fn max_bandwidth(&self) -> u64 {
        match self.store.quota().await {
            Ok(Some(quota)) => quota,
            Ok(None) => self.fallback.max_bandwidth().await,
            Err(e) => {
                warn!("quota lookup failed, using configured value: {}", e);
                self.fallback.max_bandwidth().await
            }
        }
    }

    fn chunk_size(&self) -> u64 {
        self.fallback.chunk_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = GatewayConfig::default();
        let warnings = config.validate().unwrap();
        assert_eq!(config.streaming.chunk_size, 1024 * 1024);
        assert_eq!(config.streaming.auth_import_attempts, 6);
        assert!(warnings.iter().any(|w| w.contains("secret_key")));
    }

    #[test]
    fn test_rejects_unaligned_chunk() {
        let mut config = GatewayConfig::default();
        config.streaming.chunk_size = 1000;
        assert_eq!(config.validate(), Err(ConfigError::ChunkSize(1000)));
        config.streaming.chunk_size = 2 * 1024 * 1024;
        assert_eq!(config.validate(), Err(ConfigError::ChunkSize(2 * 1024 * 1024)));
    }

    #[test]
    fn test_rejects_zero_flush_interval() {
        let mut config = GatewayConfig::default();
        config.streaming.descriptor_flush_secs = 0;
        assert_eq!(config.validate(), Err(ConfigError::FlushInterval));
    }

    #[test]
    fn test_rejects_missing_home_endpoint() {
        let mut config = GatewayConfig::default();
        config.backend.home_shard = 2;
        config.backend.shards = vec![ShardEndpoint {
            id: 4,
            url: "http://bridge-4".to_string(),
        }];
        assert_eq!(config.validate(), Err(ConfigError::HomeShard(2)));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: GatewayConfig = serde_json::from_str(
            r#"{"streaming": {"max_bandwidth": 1024}, "server": {"base_url": "https://files.example"}}"#,
        )
        .unwrap();
        assert_eq!(config.streaming.max_bandwidth, 1024);
        assert_eq!(config.streaming.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.server.bind, "0.0.0.0:8080");
    }

    #[tokio::test]
    async fn test_live_settings_update() {
        let settings = LiveSettings::new(10, DEFAULT_CHUNK_SIZE);
        assert_eq!(settings.max_bandwidth().await, 10);
        settings.set_max_bandwidth(20);
        assert_eq!(settings.max_bandwidth().await, 20);
    }

    #[test]
    fn test_live_chunk_size_is_validated() {
        let settings = LiveSettings::new(10, DEFAULT_CHUNK_SIZE);
        assert_eq!(settings.set_chunk_size(0), Err(ConfigError::ChunkSize(0)));
        assert_eq!(settings.set_chunk_size(5000), Err(ConfigError::ChunkSize(5000)));
        assert_eq!(settings.chunk_size(), DEFAULT_CHUNK_SIZE);

        settings.set_chunk_size(512 * 1024).unwrap();
        assert_eq!(settings.chunk_size(), 512 * 1024);
    }
}
