//! Core data models shared across the retrieval, cache, and graph layers.
//!
//! Layers never share mutable state; the only cross-layer reference is a
//! string id carried by these types.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Where a chunk of content originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    Workspace,
    Documentation,
    BestPractices,
}

/// Metadata attached to every embedded chunk. Drives per-agent filtering
/// and ranking; `quality` is advisory and producer-supplied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingMetadata {
    pub source: SourceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    pub language: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Advisory quality score, 0–100.
    pub quality: u8,
    pub created_at: DateTime<Utc>,
}

/// A unit of retrievable content: a code or documentation fragment with
/// its embedding and metadata.
///
/// `similarity` is populated at query time by the vector store and is
/// never persisted. The id is immutable once stored; re-inserting a chunk
/// with an existing id overwrites the stored copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextChunk {
    pub id: String,
    pub content: String,
    pub embedding: Vec<f32>,
    pub metadata: EmbeddingMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f32>,
}

impl ContextChunk {
    /// Build a chunk with a fresh random id.
    pub fn new(content: String, embedding: Vec<f32>, metadata: EmbeddingMetadata) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            content,
            embedding,
            metadata,
            similarity: None,
        }
    }
}

/// Kinds of code entities tracked in the structural graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    File,
    Function,
    Class,
    Variable,
    Import,
    Export,
    ApiEndpoint,
    DatabaseTable,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::File => "file",
            NodeKind::Function => "function",
            NodeKind::Class => "class",
            NodeKind::Variable => "variable",
            NodeKind::Import => "import",
            NodeKind::Export => "export",
            NodeKind::ApiEndpoint => "api_endpoint",
            NodeKind::DatabaseTable => "database_table",
        }
    }
}

/// A node in the code graph: a file, function, class, or other entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeNode {
    pub id: String,
    pub kind: NodeKind,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub language: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl CodeNode {
    /// Derive the canonical node id from path, kind, and name.
    ///
    /// Deterministic so that re-ingesting the same entity upserts the
    /// existing node instead of duplicating it.
    pub fn derive_id(path: Option<&str>, kind: NodeKind, name: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(path.unwrap_or(""));
        hasher.update([0u8]);
        hasher.update(kind.as_str());
        hasher.update([0u8]);
        hasher.update(name);
        hex::encode(&hasher.finalize()[..16])
    }

    pub fn new(
        kind: NodeKind,
        name: impl Into<String>,
        path: Option<String>,
        language: impl Into<String>,
    ) -> Self {
        let name = name.into();
        Self {
            id: Self::derive_id(path.as_deref(), kind, &name),
            kind,
            name,
            path,
            language: language.into(),
            metadata: serde_json::Value::Null,
        }
    }
}

/// Typed, directed relationship between two graph nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationKind {
    Imports,
    Calls,
    InheritsFrom,
    Implements,
    ReferencesTable,
    DependsOn,
    Uses,
    Extends,
}

impl RelationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationKind::Imports => "IMPORTS",
            RelationKind::Calls => "CALLS",
            RelationKind::InheritsFrom => "INHERITS_FROM",
            RelationKind::Implements => "IMPLEMENTS",
            RelationKind::ReferencesTable => "REFERENCES_TABLE",
            RelationKind::DependsOn => "DEPENDS_ON",
            RelationKind::Uses => "USES",
            RelationKind::Extends => "EXTENDS",
        }
    }
}

/// A directed edge in the code graph. Both endpoints must already exist
/// as [`CodeNode`]s; one edge per distinct (source, target, kind).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeRelationship {
    pub kind: RelationKind,
    pub source_id: String,
    pub target_id: String,
    #[serde(default)]
    pub properties: serde_json::Value,
}

/// Traversal direction for dependency queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Incoming,
    Outgoing,
    Both,
}

/// A node in a parsed syntax tree snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyntaxNode {
    /// Node kind as reported by the parser (e.g. `"function"`, `"class"`).
    pub kind: String,
    pub name: String,
    pub start_line: u32,
    pub end_line: u32,
    #[serde(default)]
    pub children: Vec<SyntaxNode>,
}

/// Parsed syntax tree for one file, as cached in working memory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyntaxTree {
    pub roots: Vec<SyntaxNode>,
}

impl SyntaxTree {
    /// Flatten the tree into a preorder node list.
    pub fn flatten(&self) -> Vec<&SyntaxNode> {
        fn walk<'a>(node: &'a SyntaxNode, out: &mut Vec<&'a SyntaxNode>) {
            out.push(node);
            for child in &node.children {
                walk(child, out);
            }
        }
        let mut out = Vec::new();
        for root in &self.roots {
            walk(root, &mut out);
        }
        out
    }
}

/// Cached snapshot of a file's content and extracted structure.
///
/// Created or overwritten on ingestion or edit, deleted whenever the
/// underlying file changes, and never outlives its TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileContext {
    pub file_path: String,
    pub content: String,
    pub syntax_tree: SyntaxTree,
    #[serde(default)]
    pub functions: Vec<String>,
    #[serde(default)]
    pub classes: Vec<String>,
    #[serde(default)]
    pub imports: Vec<String>,
    #[serde(default)]
    pub exports: Vec<String>,
    pub last_modified: DateTime<Utc>,
    pub size: u64,
    pub language: String,
}

/// A single message within a cached conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Per-session conversation history held in working memory.
///
/// Append-only within a session; mutated only via the cache layer's
/// read-push-write append. Expires with the cache TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationHistory {
    pub session_id: String,
    pub messages: Vec<Message>,
    pub last_updated: DateTime<Utc>,
    pub message_count: usize,
}

/// Kind of code change being analyzed for impact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Modify,
    Delete,
    Add,
}

/// Severity classification for an affected node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImpactLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl ImpactLevel {
    /// Weight contributed to the aggregate impact score.
    pub fn weight(&self) -> u32 {
        match self {
            ImpactLevel::Low => 1,
            ImpactLevel::Medium => 3,
            ImpactLevel::High => 5,
            ImpactLevel::Critical => 10,
        }
    }
}

/// A node reached by impact traversal, with its severity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AffectedNode {
    pub node: CodeNode,
    pub impact_level: ImpactLevel,
}

/// Result of a change-impact traversal. Derived per request, never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImpactAnalysis {
    pub source_node_id: String,
    pub change_type: ChangeType,
    pub affected_nodes: Vec<AffectedNode>,
    pub total_affected: usize,
    pub impact_score: u32,
    pub recommendations: Vec<String>,
}

impl ImpactAnalysis {
    /// Empty analysis for a missing or isolated starting node.
    pub fn empty(source_node_id: impl Into<String>, change_type: ChangeType) -> Self {
        Self {
            source_node_id: source_node_id.into(),
            change_type,
            affected_nodes: Vec::new(),
            total_affected: 0,
            impact_score: 0,
            recommendations: Vec::new(),
        }
    }
}

/// Point-in-time cache observability snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub memory_used: u64,
    pub memory_budget: u64,
    /// Best-effort: derived from hit/miss counters since the last clear.
    pub hit_rate: f64,
}

/// Point-in-time graph observability snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphStats {
    pub node_count: usize,
    pub relationship_count: usize,
    pub nodes_by_kind: Vec<(NodeKind, usize)>,
}

/// Vector store observability snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorStats {
    pub total_chunks: usize,
    pub total_size: u64,
}

/// Overall risk classification for a proposed change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// Blended system-health classification reported by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemHealth {
    Excellent,
    Good,
    Fair,
    Poor,
}
