//! Retrieval and ranking engine.
//!
//! Turns a raw query into an embedding, searches the vector store, and
//! shapes the candidate set for one specific agent:
//!
//! 1. Embed the query (one provider call).
//! 2. Oversample: fetch `2 × max_results` candidates.
//! 3. Filter by the agent's relevance profile.
//! 4. Rank with the three-key comparator ([`compare_chunks`]): similarity
//!    in 0.1-wide bands, then quality in 10-point bands, then recency.
//!    Chunks in the same band tie on that key.
//! 5. Drop candidates below the similarity threshold.
//! 6. Truncate to `max_results`.
//!
//! Profiles are a plain data-driven lookup table keyed by agent type,
//! with a permissive default for unknown agents. An empty result set is
//! a valid outcome, not an error.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::debug;

use crate::config::{MeshConfig, ProfileConfig};
use crate::embedding::EmbeddingProvider;
use crate::error::{MeshError, Result};
use crate::models::{ContextChunk, SourceKind};
use crate::vector_store::VectorStore;

/// Width of a similarity band; values in the same band tie on similarity.
pub const SIMILARITY_NOISE: f32 = 0.1;
/// Width of a quality band; scores in the same band tie on quality.
pub const QUALITY_NOISE: u8 = 10;

/// Relevance profile for one agent type. `None` allowances mean
/// "everything is allowed".
#[derive(Debug, Clone)]
pub struct AgentProfile {
    pub sources: Option<Vec<SourceKind>>,
    pub languages: Option<Vec<String>>,
    /// When non-empty, a chunk must share at least one tag.
    pub required_tags: BTreeSet<String>,
    pub min_quality: u8,
}

impl Default for AgentProfile {
    /// The fallback profile for unknown agent types: all sources and
    /// languages, no tag requirement, quality ≥ 50.
    fn default() -> Self {
        Self {
            sources: None,
            languages: None,
            required_tags: BTreeSet::new(),
            min_quality: 50,
        }
    }
}

impl AgentProfile {
    /// Whether a chunk passes this profile.
    pub fn allows(&self, chunk: &ContextChunk) -> bool {
        if let Some(sources) = &self.sources {
            if !sources.contains(&chunk.metadata.source) {
                return false;
            }
        }
        if let Some(languages) = &self.languages {
            if !languages.iter().any(|l| l == &chunk.metadata.language) {
                return false;
            }
        }
        if !self.required_tags.is_empty()
            && self.required_tags.is_disjoint(&chunk.metadata.tags)
        {
            return false;
        }
        chunk.metadata.quality >= self.min_quality
    }
}

/// Data-driven mapping from agent type to relevance profile.
#[derive(Debug, Clone, Default)]
pub struct ProfileTable {
    profiles: HashMap<String, AgentProfile>,
    fallback: AgentProfile,
}

fn parse_source(s: &str) -> Option<SourceKind> {
    match s {
        "workspace" => Some(SourceKind::Workspace),
        "documentation" => Some(SourceKind::Documentation),
        "best-practices" => Some(SourceKind::BestPractices),
        _ => None,
    }
}

impl ProfileTable {
    /// Built-in profiles for the known agent types.
    pub fn builtin() -> Self {
        let mut profiles = HashMap::new();
        profiles.insert(
            "code-generation".to_string(),
            AgentProfile {
                sources: Some(vec![SourceKind::Workspace, SourceKind::BestPractices]),
                languages: None,
                required_tags: BTreeSet::new(),
                min_quality: 60,
            },
        );
        profiles.insert(
            "architecture".to_string(),
            AgentProfile {
                sources: None,
                languages: None,
                required_tags: BTreeSet::new(),
                min_quality: 70,
            },
        );
        profiles.insert(
            "debugging".to_string(),
            AgentProfile {
                sources: Some(vec![SourceKind::Workspace]),
                languages: None,
                required_tags: BTreeSet::new(),
                min_quality: 40,
            },
        );
        profiles.insert(
            "documentation".to_string(),
            AgentProfile {
                sources: Some(vec![SourceKind::Documentation, SourceKind::Workspace]),
                languages: None,
                required_tags: BTreeSet::new(),
                min_quality: 50,
            },
        );
        profiles.insert(
            "testing".to_string(),
            AgentProfile {
                sources: Some(vec![SourceKind::Workspace, SourceKind::BestPractices]),
                languages: None,
                required_tags: BTreeSet::new(),
                min_quality: 50,
            },
        );
        Self {
            profiles,
            fallback: AgentProfile::default(),
        }
    }

    /// Built-in profiles with config-file overrides applied on top.
    pub fn from_config(config: &MeshConfig) -> Self {
        let mut table = Self::builtin();
        for (agent, override_cfg) in &config.profiles {
            let profile = table
                .profiles
                .entry(agent.clone())
                .or_insert_with(AgentProfile::default);
            apply_override(profile, override_cfg);
        }
        table
    }

    /// Profile for an agent type, falling back to the default profile.
    pub fn for_agent(&self, agent_type: &str) -> &AgentProfile {
        self.profiles.get(agent_type).unwrap_or(&self.fallback)
    }
}

fn apply_override(profile: &mut AgentProfile, cfg: &ProfileConfig) {
    if let Some(sources) = &cfg.sources {
        profile.sources = Some(sources.iter().filter_map(|s| parse_source(s)).collect());
    }
    if let Some(languages) = &cfg.languages {
        profile.languages = Some(languages.clone());
    }
    if let Some(tags) = &cfg.required_tags {
        profile.required_tags = tags.clone();
    }
    if let Some(quality) = cfg.min_quality {
        profile.min_quality = quality;
    }
}

/// Band index of a similarity value. Chunks in the same band are
/// indistinguishable on similarity.
pub fn similarity_band(similarity: f32) -> i32 {
    (similarity / SIMILARITY_NOISE).floor() as i32
}

/// Band index of a quality score. Chunks in the same band are
/// indistinguishable on quality.
pub fn quality_band(quality: u8) -> u8 {
    quality / QUALITY_NOISE
}

/// Three-key ranking comparator.
///
/// Higher similarity band first, then higher quality band, then newer
/// `created_at`. Comparing band indices rather than raw deltas keeps the
/// order total, which `sort_by` requires.
pub fn compare_chunks(a: &ContextChunk, b: &ContextChunk) -> Ordering {
    let sim_a = similarity_band(a.similarity.unwrap_or(0.0));
    let sim_b = similarity_band(b.similarity.unwrap_or(0.0));
    sim_b
        .cmp(&sim_a)
        .then_with(|| quality_band(b.metadata.quality).cmp(&quality_band(a.metadata.quality)))
        .then_with(|| b.metadata.created_at.cmp(&a.metadata.created_at))
}

/// Rank chunks in place with [`compare_chunks`].
pub fn rank_chunks(chunks: &mut [ContextChunk]) {
    chunks.sort_by(compare_chunks);
}

/// One retrieval invocation.
#[derive(Debug, Clone)]
pub struct RetrievalRequest {
    pub query: String,
    pub agent_type: String,
    /// Opaque caller context, currently unused by ranking.
    pub context: Option<serde_json::Value>,
    /// Overrides the configured maximum when set.
    pub max_results: Option<usize>,
    /// Overrides the configured threshold when set.
    pub similarity_threshold: Option<f32>,
}

impl RetrievalRequest {
    pub fn new(query: impl Into<String>, agent_type: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            agent_type: agent_type.into(),
            context: None,
            max_results: None,
            similarity_threshold: None,
        }
    }
}

/// Ranked, filtered retrieval result.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievalOutcome {
    pub chunks: Vec<ContextChunk>,
    pub total_results: usize,
    pub query_time_ms: u64,
    /// 0.7 × mean similarity + 0.3 × mean quality (normalized to 0–1).
    pub relevance_score: f64,
}

/// The retrieval engine: embedding provider + vector store + profiles.
pub struct RetrievalEngine {
    provider: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn VectorStore>,
    profiles: ProfileTable,
    default_max_results: usize,
    default_threshold: f32,
}

impl RetrievalEngine {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn VectorStore>,
        profiles: ProfileTable,
        default_max_results: usize,
        default_threshold: f32,
    ) -> Self {
        Self {
            provider,
            store,
            profiles,
            default_max_results,
            default_threshold,
        }
    }

    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    pub fn provider(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.provider
    }

    fn validate(&self, req: &RetrievalRequest) -> Result<(usize, f32)> {
        if req.query.trim().is_empty() {
            return Err(MeshError::invalid_query("query text must not be empty"));
        }
        let max_results = req.max_results.unwrap_or(self.default_max_results);
        if max_results == 0 {
            return Err(MeshError::invalid_query("max_results must be >= 1"));
        }
        let threshold = req.similarity_threshold.unwrap_or(self.default_threshold);
        if !(0.0..=1.0).contains(&threshold) {
            return Err(MeshError::invalid_query(
                "similarity_threshold must be in [0.0, 1.0]",
            ));
        }
        Ok((max_results, threshold))
    }

    /// Run the full embed → oversample → filter → rank → threshold →
    /// truncate pipeline.
    ///
    /// Embedding and vector-store failures propagate with their original
    /// error kind.
    pub async fn retrieve(&self, req: &RetrievalRequest) -> Result<RetrievalOutcome> {
        let (max_results, threshold) = self.validate(req)?;
        let started = Instant::now();

        let query_vec = self.provider.embed(&req.query).await?;

        // Oversample so profile filtering still leaves enough candidates.
        let candidates = self
            .store
            .similarity_search(&query_vec, max_results * 2)
            .await?;
        let candidate_count = candidates.len();

        let profile = self.profiles.for_agent(&req.agent_type);
        let mut chunks: Vec<ContextChunk> =
            candidates.into_iter().filter(|c| profile.allows(c)).collect();

        rank_chunks(&mut chunks);

        chunks.retain(|c| c.similarity.unwrap_or(0.0) >= threshold);
        chunks.truncate(max_results);

        let outcome = RetrievalOutcome {
            total_results: chunks.len(),
            relevance_score: relevance_score(&chunks),
            query_time_ms: started.elapsed().as_millis() as u64,
            chunks,
        };

        debug!(
            query = %req.query,
            agent = %req.agent_type,
            candidates = candidate_count,
            returned = outcome.total_results,
            "retrieval complete"
        );

        Ok(outcome)
    }
}

/// Blend of mean similarity (0.7) and mean normalized quality (0.3).
/// Zero for an empty result set.
pub fn relevance_score(chunks: &[ContextChunk]) -> f64 {
    if chunks.is_empty() {
        return 0.0;
    }
    let n = chunks.len() as f64;
    let mean_similarity: f64 = chunks
        .iter()
        .map(|c| c.similarity.unwrap_or(0.0) as f64)
        .sum::<f64>()
        / n;
    let mean_quality: f64 = chunks
        .iter()
        .map(|c| c.metadata.quality as f64 / 100.0)
        .sum::<f64>()
        / n;
    0.7 * mean_similarity + 0.3 * mean_quality
}
