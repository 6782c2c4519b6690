//! TOML configuration parsing and validation.
//!
//! The config is an explicitly constructed, passed-in object; there is no
//! process-wide singleton. [`load_config`] validates eagerly so bad
//! settings fail at startup rather than mid-query.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct MeshConfig {
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub server: ServerConfig,
    /// Optional per-agent relevance profile overrides, keyed by agent type.
    #[serde(default)]
    pub profiles: HashMap<String, ProfileConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `"openai"` or `"deterministic"`.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_dims")]
    pub dims: usize,
    /// Base URL of the OpenAI-compatible embeddings API.
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            dims: default_dims(),
            api_base: default_api_base(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "deterministic".to_string()
}
fn default_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_dims() -> usize {
    1536
}
fn default_api_base() -> String {
    "https://api.openai.com".to_string()
}
fn default_batch_size() -> usize {
    32
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// Time-to-live for every cache entry, in seconds.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    /// Memory budget; least-recently-used entries are evicted past this.
    #[serde(default = "default_max_memory_bytes")]
    pub max_memory_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            max_memory_bytes: default_max_memory_bytes(),
        }
    }
}

fn default_ttl_secs() -> u64 {
    900
}
fn default_max_memory_bytes() -> u64 {
    64 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Minimum similarity for a chunk to be returned.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    /// Maximum chunks returned per query.
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    /// Files per batch during bulk ingestion.
    #[serde(default = "default_ingest_batch_size")]
    pub ingest_batch_size: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            max_results: default_max_results(),
            ingest_batch_size: default_ingest_batch_size(),
        }
    }
}

fn default_similarity_threshold() -> f32 {
    0.6
}
fn default_max_results() -> usize {
    10
}
fn default_ingest_batch_size() -> usize {
    16
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7430".to_string()
}

/// A relevance-profile override as it appears in the config file.
///
/// Absent fields fall back to "allow everything" semantics; see
/// [`crate::retrieval::AgentProfile`].
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ProfileConfig {
    #[serde(default)]
    pub sources: Option<Vec<String>>,
    #[serde(default)]
    pub languages: Option<Vec<String>>,
    #[serde(default)]
    pub required_tags: Option<BTreeSet<String>>,
    #[serde(default)]
    pub min_quality: Option<u8>,
}

/// Load and validate a config file.
pub fn load_config(path: &Path) -> Result<MeshConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: MeshConfig =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    validate(&config)?;
    Ok(config)
}

/// Validate a config regardless of where it came from.
pub fn validate(config: &MeshConfig) -> Result<()> {
    match config.embedding.provider.as_str() {
        "openai" | "deterministic" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be openai or deterministic.",
            other
        ),
    }

    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }

    if config.cache.max_memory_bytes == 0 {
        anyhow::bail!("cache.max_memory_bytes must be > 0");
    }
    if config.cache.ttl_secs == 0 {
        anyhow::bail!("cache.ttl_secs must be > 0");
    }

    if !(0.0..=1.0).contains(&config.retrieval.similarity_threshold) {
        anyhow::bail!("retrieval.similarity_threshold must be in [0.0, 1.0]");
    }
    if config.retrieval.max_results == 0 {
        anyhow::bail!("retrieval.max_results must be >= 1");
    }
    if config.retrieval.ingest_batch_size == 0 {
        anyhow::bail!("retrieval.ingest_batch_size must be >= 1");
    }

    for (agent, profile) in &config.profiles {
        if let Some(q) = profile.min_quality {
            if q > 100 {
                anyhow::bail!("profiles.{}.min_quality must be <= 100", agent);
            }
        }
    }

    Ok(())
}
