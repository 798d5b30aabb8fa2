//! Configuration for srake

use crate::SrakeError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default configuration as TOML
pub const DEFAULT_CONFIG: &str = r#"# srake Configuration

[ingest]
# Records per write transaction
batch_records = 5000
# Soft cap on serialized bytes per transaction
batch_bytes = 8388608
# Checkpoint every N records...
checkpoint_records = 1000
# ...or after this much time, whichever comes first (e.g., "30s", "5m")
checkpoint_interval = "30s"
# Retry budget for transient network failures
max_retries = 5

[search]
# Close the inverted index after this long without a query
idle_timeout = "5m"
# Weight of vector similarity in hybrid scoring (0 = lexical only, 1 = vector only)
hybrid_weight = 0.5
# Default maximum results returned by queries
default_limit = 20
# Hard timeout for a single search call
timeout = "30s"
# Documents per inverted-index write batch
index_batch_size = 1000

[embedding]
# Embedding endpoint (Ollama-compatible); empty disables the vector tier
endpoint = ""
model = "nomic-embed-text"
dimensions = 768
# Store vectors as int8 with a per-vector scale instead of f32
quantize = false

[http]
# Allow cross-origin requests on the HTTP API
cors = false
max_query_len = 1000
max_limit = 1000
"#;

/// srake configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_batch_records")]
    pub batch_records: usize,
    #[serde(default = "default_batch_bytes")]
    pub batch_bytes: usize,
    #[serde(default = "default_checkpoint_records")]
    pub checkpoint_records: u64,
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: String,
    #[serde(default = "default_hybrid_weight")]
    pub hybrid_weight: f32,
    #[serde(default = "default_limit")]
    pub default_limit: usize,
    #[serde(default = "default_search_timeout")]
    pub timeout: String,
    #[serde(default = "default_index_batch_size")]
    pub index_batch_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub endpoint: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,
    #[serde(default)]
    pub quantize: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default)]
    pub cors: bool,
    #[serde(default = "default_max_query_len")]
    pub max_query_len: usize,
    #[serde(default = "default_max_limit")]
    pub max_limit: usize,
}

// Default value functions
fn default_batch_records() -> usize {
    5000
}
fn default_batch_bytes() -> usize {
    8 * 1024 * 1024
}
fn default_checkpoint_records() -> u64 {
    1000
}
fn default_checkpoint_interval() -> String {
    "30s".to_string()
}
fn default_max_retries() -> u32 {
    5
}
fn default_idle_timeout() -> String {
    "5m".to_string()
}
fn default_hybrid_weight() -> f32 {
    0.5
}
fn default_limit() -> usize {
    20
}
fn default_search_timeout() -> String {
    "30s".to_string()
}
fn default_index_batch_size() -> usize {
    1000
}
fn default_model() -> String {
    "nomic-embed-text".to_string()
}
fn default_dimensions() -> usize {
    768
}
fn default_max_query_len() -> usize {
    1000
}
fn default_max_limit() -> usize {
    1000
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_records: default_batch_records(),
            batch_bytes: default_batch_bytes(),
            checkpoint_records: default_checkpoint_records(),
            checkpoint_interval: default_checkpoint_interval(),
            max_retries: default_max_retries(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            idle_timeout: default_idle_timeout(),
            hybrid_weight: default_hybrid_weight(),
            default_limit: default_limit(),
            timeout: default_search_timeout(),
            index_batch_size: default_index_batch_size(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            model: default_model(),
            dimensions: default_dimensions(),
            quantize: false,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            cors: false,
            max_query_len: default_max_query_len(),
            max_limit: default_max_limit(),
        }
    }
}

impl Config {
    /// Load config from a TOML file
    pub fn load(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Load from `config_home()/config.toml` if present, defaults otherwise.
    pub fn load_default() -> crate::Result<Self> {
        let path = crate::paths::config_home().join("config.toml");
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse config from TOML string
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| SrakeError::ConfigInvalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> crate::Result<()> {
        if !(0.0..=1.0).contains(&self.search.hybrid_weight) {
            return Err(SrakeError::ConfigInvalid(format!(
                "search.hybrid_weight must be within [0, 1], got {}",
                self.search.hybrid_weight
            )));
        }
        if self.ingest.batch_records == 0 {
            return Err(SrakeError::ConfigInvalid(
                "ingest.batch_records must be positive".to_string(),
            ));
        }
        if self.embedding.dimensions == 0 {
            return Err(SrakeError::ConfigInvalid(
                "embedding.dimensions must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Checkpoint interval as Duration
    pub fn checkpoint_interval(&self) -> Duration {
        parse_duration(&self.ingest.checkpoint_interval).unwrap_or(Duration::from_secs(30))
    }

    /// Inverted-index idle timeout as Duration
    pub fn idle_timeout(&self) -> Duration {
        parse_duration(&self.search.idle_timeout).unwrap_or(Duration::from_secs(300))
    }

    /// Search timeout as Duration
    pub fn search_timeout(&self) -> Duration {
        parse_duration(&self.search.timeout).unwrap_or(Duration::from_secs(30))
    }

    /// Whether the vector tier is configured
    pub fn vector_enabled(&self) -> bool {
        !self.embedding.endpoint.is_empty()
    }
}

/// Parse duration string (e.g., "30s", "5m", "1h")
fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    let (num_str, unit) = s.split_at(s.len() - 1);
    let num: u64 = num_str.parse().ok()?;

    match unit {
        "s" => Some(Duration::from_secs(num)),
        "m" => Some(Duration::from_secs(num * 60)),
        "h" => Some(Duration::from_secs(num * 3600)),
        "d" => Some(Duration::from_secs(num * 86400)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_parses() {
        let config = Config::from_toml(DEFAULT_CONFIG).unwrap();
        assert_eq!(config.ingest.batch_records, 5000);
        assert_eq!(config.ingest.checkpoint_records, 1000);
        assert_eq!(config.search.hybrid_weight, 0.5);
        assert_eq!(config.embedding.dimensions, 768);
        assert!(!config.vector_enabled());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("invalid"), None);
    }

    #[test]
    fn test_hybrid_weight_out_of_range_rejected() {
        let toml = "[search]\nhybrid_weight = 1.5\n";
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_idle_timeout_default() {
        let config = Config::from_toml(DEFAULT_CONFIG).unwrap();
        assert_eq!(config.idle_timeout(), Duration::from_secs(300));
    }
}
