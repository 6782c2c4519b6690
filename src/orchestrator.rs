//! Context orchestration across the three memory layers.
//!
//! [`ContextService`] is the single entry point callers use. It owns the
//! retrieval engine (semantic memory), the working-memory cache, and the
//! code graph (structural memory), and composes them per request:
//!
//! - Queries are cache-first: a live cached result is returned without
//!   touching the embedding provider. Cache failures are soft; the
//!   pipeline falls through to a fresh retrieval and logs a warning.
//! - File updates are write-through: the cache snapshot and the file's
//!   graph subtree are replaced together.
//! - Impact analysis blends the graph traversal with a semantic search
//!   for related content and classifies the overall risk.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::{CacheBackend, InMemoryCache, WorkingMemory};
use crate::config::MeshConfig;
use crate::embedding::provider_from_config;
use crate::error::Result;
use crate::graph::{ArchitectureAnalysis, GraphStore, InMemoryGraph};
use crate::models::{
    CacheStats, ChangeType, CodeNode, ContextChunk, ConversationHistory, Direction,
    EmbeddingMetadata, FileContext, GraphStats, ImpactAnalysis, Message, NodeKind, RelationKind,
    RiskLevel, SourceKind, SyntaxTree, SystemHealth, VectorStats,
};
use crate::retrieval::{
    rank_chunks, relevance_score, ProfileTable, RetrievalEngine, RetrievalRequest,
};
use crate::vector_store::InMemoryVectorStore;

/// Quality assigned to chunks synthesized from syntax-tree nodes.
const AST_CHUNK_QUALITY: u8 = 70;
/// Similarity assigned to synthesized chunks; below direct hits, above
/// the default threshold.
const AST_CHUNK_SIMILARITY: f32 = 0.75;
/// Related chunks fetched for an impact report.
const IMPACT_RELATED_LIMIT: usize = 5;

/// A served context result, with cache provenance.
#[derive(Debug, Clone, Serialize)]
pub struct ContextResponse {
    pub chunks: Vec<ContextChunk>,
    pub total_results: usize,
    pub query_time_ms: u64,
    pub relevance_score: f64,
    pub from_cache: bool,
}

/// Impact report: graph blast radius plus semantically related content.
#[derive(Debug, Clone, Serialize)]
pub struct ImpactReport {
    pub analysis: ImpactAnalysis,
    pub related_chunks: Vec<ContextChunk>,
    pub risk_level: RiskLevel,
}

/// Architecture overview with cycle detection.
#[derive(Debug, Clone, Serialize)]
pub struct ArchitectureInsights {
    pub analysis: ArchitectureAnalysis,
    pub circular_dependencies: Vec<CodeNode>,
}

/// One response bundling retrieval with the caller's file and session
/// state.
#[derive(Debug, Clone, Serialize)]
pub struct ComprehensiveContext {
    pub retrieval: ContextResponse,
    pub file_context: Option<FileContext>,
    /// Direct graph neighborhood of the focus file, both directions.
    pub dependencies: Vec<CodeNode>,
    pub conversation: Option<ConversationHistory>,
}

/// Aggregated observability snapshot across all three layers.
#[derive(Debug, Clone, Serialize)]
pub struct SystemStats {
    pub cache: CacheStats,
    pub graph: GraphStats,
    pub vector: VectorStats,
    pub health: SystemHealth,
}

/// Classify overall risk from the aggregate impact score and the number
/// of affected nodes.
pub fn risk_level(impact_score: u32, total_affected: usize) -> RiskLevel {
    if impact_score > 50 || total_affected > 30 {
        RiskLevel::Critical
    } else if impact_score > 25 || total_affected > 15 {
        RiskLevel::High
    } else if impact_score > 10 || total_affected > 5 {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

/// Blend the per-layer stats into one health classification.
pub fn classify_health(cache: &CacheStats, graph: &GraphStats, vector: &VectorStats) -> SystemHealth {
    let active = cache.entries > 0 || graph.node_count > 0 || vector.total_chunks > 0;
    if cache.hit_rate >= 0.8 && graph.node_count >= 100 {
        SystemHealth::Excellent
    } else if cache.hit_rate >= 0.5 || graph.node_count >= 100 {
        SystemHealth::Good
    } else if active {
        SystemHealth::Fair
    } else {
        SystemHealth::Poor
    }
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Canonical graph id of the file node for a path.
pub fn file_node_id(path: &str) -> String {
    CodeNode::derive_id(Some(path), NodeKind::File, file_name(path))
}

/// The orchestrator over semantic, working, and structural memory.
pub struct ContextService {
    engine: RetrievalEngine,
    memory: WorkingMemory,
    graph: Arc<dyn GraphStore>,
    config: MeshConfig,
}

impl ContextService {
    pub fn new(
        engine: RetrievalEngine,
        memory: WorkingMemory,
        graph: Arc<dyn GraphStore>,
        config: MeshConfig,
    ) -> Self {
        Self {
            engine,
            memory,
            graph,
            config,
        }
    }

    /// Assemble a service with in-memory backends from configuration.
    pub fn from_config(config: MeshConfig) -> Result<Self> {
        let provider = Arc::from(provider_from_config(&config.embedding)?);
        let store = Arc::new(InMemoryVectorStore::new(config.embedding.dims));
        let backend: Arc<dyn CacheBackend> =
            Arc::new(InMemoryCache::new(config.cache.max_memory_bytes));
        let memory = WorkingMemory::new(backend, Duration::from_secs(config.cache.ttl_secs));
        let engine = RetrievalEngine::new(
            provider,
            store,
            ProfileTable::from_config(&config),
            config.retrieval.max_results,
            config.retrieval.similarity_threshold,
        );
        Ok(Self {
            engine,
            memory,
            graph: Arc::new(InMemoryGraph::new()),
            config,
        })
    }

    pub fn memory(&self) -> &WorkingMemory {
        &self.memory
    }

    pub fn graph(&self) -> &Arc<dyn GraphStore> {
        &self.graph
    }

    pub fn engine(&self) -> &RetrievalEngine {
        &self.engine
    }

    // ---- retrieval ----

    /// Cache-first context retrieval.
    pub async fn retrieve_context(&self, req: &RetrievalRequest) -> Result<ContextResponse> {
        let started = Instant::now();

        match self.memory.get_query_result(&req.query, &req.agent_type).await {
            Ok(Some(cached)) => {
                debug!(query = %req.query, agent = %req.agent_type, "query cache hit");
                return Ok(ContextResponse {
                    total_results: cached.chunks.len(),
                    relevance_score: relevance_score(&cached.chunks),
                    query_time_ms: started.elapsed().as_millis() as u64,
                    chunks: cached.chunks,
                    from_cache: true,
                });
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "query cache read failed, retrieving fresh");
            }
        }

        let outcome = self.engine.retrieve(req).await?;

        if let Err(e) = self
            .memory
            .put_query_result(&req.query, &req.agent_type, &outcome.chunks, Utc::now())
            .await
        {
            warn!(error = %e, "query cache write failed");
        }

        Ok(ContextResponse {
            total_results: outcome.total_results,
            relevance_score: outcome.relevance_score,
            query_time_ms: started.elapsed().as_millis() as u64,
            chunks: outcome.chunks,
            from_cache: false,
        })
    }

    /// Retrieval enriched with syntax-tree structure.
    ///
    /// For every file that contributed a result, plus an explicitly
    /// requested `focus_path`, cached syntax-tree nodes matching the
    /// query (or the agent's structural affinity) are synthesized into
    /// `ast`-tagged chunks and re-ranked into the set. Never served from
    /// the query cache; the synthesized chunks depend on cache state
    /// that can change between queries.
    pub async fn context_with_ast(
        &self,
        req: &RetrievalRequest,
        focus_path: Option<&str>,
    ) -> Result<ContextResponse> {
        let started = Instant::now();
        let max_results = req.max_results.unwrap_or(self.config.retrieval.max_results);

        let outcome = self.engine.retrieve(req).await?;
        let mut chunks = outcome.chunks;

        // Per-file language, taken from the base hits.
        let mut languages: BTreeMap<String, String> = BTreeMap::new();
        for chunk in &chunks {
            if let Some(path) = &chunk.metadata.file_path {
                languages
                    .entry(path.clone())
                    .or_insert_with(|| chunk.metadata.language.clone());
            }
        }
        if let Some(path) = focus_path {
            if !languages.contains_key(path) {
                let language = self
                    .memory
                    .get_file_context(path)
                    .await
                    .ok()
                    .flatten()
                    .map(|c| c.language)
                    .unwrap_or_else(|| "unknown".to_string());
                languages.insert(path.to_string(), language);
            }
        }

        for (path, language) in &languages {
            let tree = match self.memory.get_syntax_tree(path).await {
                Ok(Some(tree)) => tree,
                Ok(None) => continue,
                Err(e) => {
                    warn!(error = %e, path = %path, "syntax tree read failed");
                    continue;
                }
            };
            chunks.extend(synthesize_ast_chunks(
                path,
                language,
                &tree,
                &req.query,
                &req.agent_type,
            ));
        }

        rank_chunks(&mut chunks);
        chunks.truncate(max_results);

        Ok(ContextResponse {
            total_results: chunks.len(),
            relevance_score: relevance_score(&chunks),
            query_time_ms: started.elapsed().as_millis() as u64,
            chunks,
            from_cache: false,
        })
    }

    /// Retrieval plus the caller's file snapshot, that file's graph
    /// neighborhood, and conversation, in one call. The optional parts
    /// degrade to empty on cache failure.
    pub async fn comprehensive_context(
        &self,
        req: &RetrievalRequest,
        file_path: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<ComprehensiveContext> {
        let retrieval = self.retrieve_context(req).await?;

        let file_context = match file_path {
            Some(path) => self.memory.get_file_context(path).await.unwrap_or_else(|e| {
                warn!(error = %e, path, "file context read failed");
                None
            }),
            None => None,
        };

        let dependencies = match file_path {
            Some(path) => {
                self.graph
                    .dependencies(&file_node_id(path), Direction::Both)
                    .await?
            }
            None => Vec::new(),
        };

        let conversation = match session_id {
            Some(session) => self.memory.get_conversation(session).await.unwrap_or_else(|e| {
                warn!(error = %e, session, "conversation read failed");
                None
            }),
            None => None,
        };

        Ok(ComprehensiveContext {
            retrieval,
            file_context,
            dependencies,
            conversation,
        })
    }

    // ---- ingestion ----

    /// Embed and store content in sequential batches. Returns the number
    /// of chunks stored.
    pub async fn ingest(&self, items: Vec<(String, EmbeddingMetadata)>) -> Result<usize> {
        let batch_size = self.config.retrieval.ingest_batch_size.max(1);
        let mut stored = 0usize;

        for group in items.chunks(batch_size) {
            let texts: Vec<String> = group.iter().map(|(content, _)| content.clone()).collect();
            let vectors = self.engine.provider().embed_batch(&texts).await?;

            for ((content, metadata), embedding) in group.iter().cloned().zip(vectors) {
                self.engine
                    .store()
                    .insert(ContextChunk::new(content, embedding, metadata))
                    .await?;
                stored += 1;
            }
        }

        info!(stored, "ingestion complete");
        Ok(stored)
    }

    // ---- file state ----

    /// Write-through file update: replace the cached snapshot and rebuild
    /// the file's graph subtree.
    pub async fn store_file_context(&self, context: &FileContext) -> Result<()> {
        self.memory.put_file_context(context).await?;
        self.memory
            .put_syntax_tree(&context.file_path, &context.syntax_tree)
            .await?;
        self.sync_graph(context).await?;
        debug!(path = %context.file_path, "file context stored");
        Ok(())
    }

    pub async fn get_file_context(&self, file_path: &str) -> Result<Option<FileContext>> {
        self.memory.get_file_context(file_path).await
    }

    /// React to a file change: invalidate cached snapshots and the graph
    /// subtree, then rebuild from the fresh parse when one is supplied.
    pub async fn on_file_change(
        &self,
        file_path: &str,
        updated: Option<&FileContext>,
    ) -> Result<()> {
        self.memory.invalidate(file_path).await?;
        self.graph.remove_path(file_path).await?;
        if let Some(context) = updated {
            self.store_file_context(context).await?;
        }
        debug!(path = %file_path, rebuilt = updated.is_some(), "file state invalidated");
        Ok(())
    }

    /// Rebuild the graph subtree for one file from its parsed structure.
    async fn sync_graph(&self, context: &FileContext) -> Result<()> {
        self.graph.remove_path(&context.file_path).await?;

        let file_node = CodeNode::new(
            NodeKind::File,
            file_name(&context.file_path),
            Some(context.file_path.clone()),
            context.language.clone(),
        );
        self.graph.upsert_node(file_node.clone()).await?;

        for (names, kind, relation) in [
            (&context.functions, NodeKind::Function, RelationKind::DependsOn),
            (&context.classes, NodeKind::Class, RelationKind::DependsOn),
            (&context.exports, NodeKind::Export, RelationKind::Uses),
        ] {
            for name in names {
                let node = CodeNode::new(
                    kind,
                    name.clone(),
                    Some(context.file_path.clone()),
                    context.language.clone(),
                );
                self.graph.upsert_node(node.clone()).await?;
                self.graph
                    .upsert_relationship(crate::models::CodeRelationship {
                        kind: relation,
                        source_id: file_node.id.clone(),
                        target_id: node.id,
                        properties: serde_json::Value::Null,
                    })
                    .await?;
            }
        }

        // Imports are shared across files; they carry no path so they
        // survive remove_path for any single file.
        for import in &context.imports {
            let node = CodeNode::new(NodeKind::Import, import.clone(), None, context.language.clone());
            self.graph.upsert_node(node.clone()).await?;
            self.graph
                .upsert_relationship(crate::models::CodeRelationship {
                    kind: RelationKind::Imports,
                    source_id: file_node.id.clone(),
                    target_id: node.id,
                    properties: serde_json::Value::Null,
                })
                .await?;
        }

        Ok(())
    }

    // ---- conversations ----

    pub async fn store_conversation(
        &self,
        session_id: &str,
        message: Message,
    ) -> Result<ConversationHistory> {
        self.memory.append_conversation(session_id, message).await
    }

    pub async fn get_conversation_history(
        &self,
        session_id: &str,
    ) -> Result<Option<ConversationHistory>> {
        self.memory.get_conversation(session_id).await
    }

    /// Session ids that still have a live conversation in working memory.
    pub async fn active_sessions(&self) -> Result<Vec<String>> {
        self.memory.active_sessions().await
    }

    // ---- analysis ----

    /// Blast radius of a proposed file change, with semantically related
    /// content and an overall risk classification. The semantic part is
    /// best-effort.
    pub async fn analyze_change_impact(
        &self,
        file_path: &str,
        change_type: ChangeType,
    ) -> Result<ImpactReport> {
        let node_id = file_node_id(file_path);
        let analysis = self.graph.impact_analysis(&node_id, change_type).await?;

        let related_chunks = match self.related_chunks(file_path).await {
            Ok(chunks) => chunks,
            Err(e) => {
                warn!(error = %e, path = %file_path, "related-content search failed");
                Vec::new()
            }
        };

        let risk = risk_level(analysis.impact_score, analysis.total_affected);

        Ok(ImpactReport {
            analysis,
            related_chunks,
            risk_level: risk,
        })
    }

    async fn related_chunks(&self, file_path: &str) -> Result<Vec<ContextChunk>> {
        let vector = self.engine.provider().embed(file_path).await?;
        self.engine
            .store()
            .similarity_search(&vector, IMPACT_RELATED_LIMIT)
            .await
    }

    pub async fn architecture_insights(&self) -> Result<ArchitectureInsights> {
        let analysis = self.graph.architecture_analysis().await?;
        let circular_dependencies = self.graph.circular_dependencies().await?;
        Ok(ArchitectureInsights {
            analysis,
            circular_dependencies,
        })
    }

    // ---- observability ----

    pub async fn system_stats(&self) -> Result<SystemStats> {
        let cache = self.memory.stats().await?;
        let graph = self.graph.stats().await?;
        let vector = self.engine.store().stats().await?;
        let health = classify_health(&cache, &graph, &vector);
        Ok(SystemStats {
            cache,
            graph,
            vector,
            health,
        })
    }
}

/// Syntax-tree kinds an agent type is structurally interested in,
/// independent of the query text.
fn ast_affinity(agent_type: &str) -> &'static [&'static str] {
    match agent_type {
        "code-generation" => &["function", "method"],
        "architecture" => &["class", "interface"],
        _ => &[],
    }
}

/// Synthesize `ast`-tagged chunks from the tree nodes relevant to this
/// query and agent.
fn synthesize_ast_chunks(
    file_path: &str,
    language: &str,
    tree: &SyntaxTree,
    query: &str,
    agent_type: &str,
) -> Vec<ContextChunk> {
    let tokens: Vec<String> = query
        .to_lowercase()
        .split_whitespace()
        .filter(|t| t.len() >= 3)
        .map(str::to_string)
        .collect();
    let affinity = ast_affinity(agent_type);

    tree.flatten()
        .into_iter()
        .filter(|node| {
            let name = node.name.to_lowercase();
            tokens.iter().any(|t| name.contains(t.as_str()))
                || affinity.contains(&node.kind.as_str())
        })
        .map(|node| {
            let content = format!(
                "{} {} (lines {}-{}) in {}",
                node.kind, node.name, node.start_line, node.end_line, file_path
            );
            let metadata = EmbeddingMetadata {
                source: SourceKind::Workspace,
                file_path: Some(file_path.to_string()),
                function_name: (node.kind == "function").then(|| node.name.clone()),
                class_name: (node.kind == "class").then(|| node.name.clone()),
                language: language.to_string(),
                tags: std::collections::BTreeSet::from(["ast".to_string()]),
                quality: AST_CHUNK_QUALITY,
                created_at: Utc::now(),
            };
            let mut chunk = ContextChunk::new(content, Vec::new(), metadata);
            chunk.similarity = Some(AST_CHUNK_SIMILARITY);
            chunk
        })
        .collect()
}
