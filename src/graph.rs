//! Structural memory: the code relationship graph.
//!
//! The [`GraphStore`] trait defines the fixed contract for graph
//! backends: node/relationship upsert with merge semantics, dependency
//! traversal, change-impact analysis, architecture scoring, and
//! circular-dependency flagging.
//!
//! [`InMemoryGraph`] is the reference implementation: adjacency maps
//! behind `std::sync::RwLock`. Impact analysis is a breadth-first
//! traversal over outgoing relationships, capped at [`MAX_IMPACT_DEPTH`]
//! hops; every reached node is classified by a change-type-aware rule
//! table and the aggregate score is a weighted sum over impact levels.
//!
//! Traversals from a node the graph does not know about return empty
//! results rather than erroring.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{MeshError, Result};
use crate::models::{
    AffectedNode, ChangeType, CodeNode, CodeRelationship, Direction, GraphStats, ImpactAnalysis,
    ImpactLevel, NodeKind, RelationKind,
};

/// Impact traversal stops after this many hops from the source.
pub const MAX_IMPACT_DEPTH: usize = 3;

/// Architecture-level overview of the indexed codebase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchitectureAnalysis {
    /// Component counts grouped by node kind.
    pub components: Vec<(NodeKind, usize)>,
    /// Relationship counts grouped by relationship kind.
    pub relationships: Vec<(RelationKind, usize)>,
    /// `(total relationships / total components) × ln(total components)`,
    /// with both totals floored at 1.
    pub complexity_score: f64,
    pub recommendations: Vec<String>,
}

/// Abstract graph backend.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Insert or update a node. Re-creating an existing id replaces its
    /// properties rather than duplicating the node.
    async fn upsert_node(&self, node: CodeNode) -> Result<()>;

    /// Insert or update a relationship. Both endpoints must already
    /// exist; a duplicate (source, target, kind) merges properties.
    async fn upsert_relationship(&self, relationship: CodeRelationship) -> Result<()>;

    /// Fetch a node by id.
    async fn get_node(&self, id: &str) -> Result<Option<CodeNode>>;

    /// Direct neighbors of a node in the given direction. Unknown node
    /// ids yield an empty list.
    async fn dependencies(&self, node_id: &str, direction: Direction) -> Result<Vec<CodeNode>>;

    /// Remove every node rooted at a file path, along with its edges.
    /// Used when a file's graph subtree is rebuilt after a change.
    async fn remove_path(&self, path: &str) -> Result<()>;

    /// Traverse outward from a node and estimate the blast radius of a
    /// change. A missing starting node yields an empty analysis.
    async fn impact_analysis(&self, node_id: &str, change_type: ChangeType) -> Result<ImpactAnalysis>;

    /// Whole-graph composition and complexity overview.
    async fn architecture_analysis(&self) -> Result<ArchitectureAnalysis>;

    /// Nodes participating in a dependency cycle: flagged when the
    /// node's outgoing-dependency set and incoming-dependent set
    /// intersect within [`MAX_IMPACT_DEPTH`] hops.
    async fn circular_dependencies(&self) -> Result<Vec<CodeNode>>;

    /// Point-in-time graph statistics.
    async fn stats(&self) -> Result<GraphStats>;
}

/// Classify one affected node for a given change type.
///
/// Rule table: deletions are the most disruptive (a deleted file's
/// dependents are critical, a deleted class's or function's are high),
/// modifications matter most for files, and additions are always low.
pub fn impact_level(change_type: ChangeType, kind: NodeKind) -> ImpactLevel {
    match (change_type, kind) {
        (ChangeType::Delete, NodeKind::File) => ImpactLevel::Critical,
        (ChangeType::Delete, NodeKind::Class) => ImpactLevel::High,
        (ChangeType::Delete, NodeKind::Function) => ImpactLevel::High,
        (ChangeType::Delete, _) => ImpactLevel::Medium,
        (ChangeType::Modify, NodeKind::File) => ImpactLevel::High,
        (ChangeType::Modify, NodeKind::Class) => ImpactLevel::Medium,
        (ChangeType::Modify, NodeKind::Function) => ImpactLevel::Medium,
        (ChangeType::Modify, _) => ImpactLevel::Low,
        (ChangeType::Add, _) => ImpactLevel::Low,
    }
}

struct GraphInner {
    nodes: HashMap<String, CodeNode>,
    /// One edge per (source, target, kind).
    edges: HashMap<(String, String, RelationKind), CodeRelationship>,
    outgoing: HashMap<String, HashSet<String>>,
    incoming: HashMap<String, HashSet<String>>,
}

/// In-memory [`GraphStore`] for tests and single-process deployments.
pub struct InMemoryGraph {
    inner: RwLock<GraphInner>,
}

impl InMemoryGraph {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(GraphInner {
                nodes: HashMap::new(),
                edges: HashMap::new(),
                outgoing: HashMap::new(),
                incoming: HashMap::new(),
            }),
        }
    }
}

impl Default for InMemoryGraph {
    fn default() -> Self {
        Self::new()
    }
}

/// Breadth-first reachable set from `start`, capped at `max_depth` hops.
/// The start node itself is not included.
fn reachable(adjacency: &HashMap<String, HashSet<String>>, start: &str, max_depth: usize) -> HashSet<String> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<(String, usize)> = VecDeque::new();
    queue.push_back((start.to_string(), 0));

    while let Some((id, depth)) = queue.pop_front() {
        if depth >= max_depth {
            continue;
        }
        if let Some(neighbors) = adjacency.get(&id) {
            for next in neighbors {
                if next != start && seen.insert(next.clone()) {
                    queue.push_back((next.clone(), depth + 1));
                }
            }
        }
    }
    seen
}

#[async_trait]
impl GraphStore for InMemoryGraph {
    async fn upsert_node(&self, node: CodeNode) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    async fn upsert_relationship(&self, relationship: CodeRelationship) -> Result<()> {
        let mut inner = self.inner.write().unwrap();

        if !inner.nodes.contains_key(&relationship.source_id) {
            return Err(MeshError::Graph {
                reason: format!("source node not found: {}", relationship.source_id),
                recoverable: false,
            });
        }
        if !inner.nodes.contains_key(&relationship.target_id) {
            return Err(MeshError::Graph {
                reason: format!("target node not found: {}", relationship.target_id),
                recoverable: false,
            });
        }

        let key = (
            relationship.source_id.clone(),
            relationship.target_id.clone(),
            relationship.kind,
        );
        inner
            .outgoing
            .entry(relationship.source_id.clone())
            .or_default()
            .insert(relationship.target_id.clone());
        inner
            .incoming
            .entry(relationship.target_id.clone())
            .or_default()
            .insert(relationship.source_id.clone());
        inner.edges.insert(key, relationship);
        Ok(())
    }

    async fn get_node(&self, id: &str) -> Result<Option<CodeNode>> {
        let inner = self.inner.read().unwrap();
        Ok(inner.nodes.get(id).cloned())
    }

    async fn dependencies(&self, node_id: &str, direction: Direction) -> Result<Vec<CodeNode>> {
        let inner = self.inner.read().unwrap();

        let mut ids: HashSet<&String> = HashSet::new();
        if matches!(direction, Direction::Outgoing | Direction::Both) {
            if let Some(out) = inner.outgoing.get(node_id) {
                ids.extend(out.iter());
            }
        }
        if matches!(direction, Direction::Incoming | Direction::Both) {
            if let Some(inc) = inner.incoming.get(node_id) {
                ids.extend(inc.iter());
            }
        }

        let mut nodes: Vec<CodeNode> = ids
            .into_iter()
            .filter_map(|id| inner.nodes.get(id).cloned())
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(nodes)
    }

    async fn remove_path(&self, path: &str) -> Result<()> {
        let mut inner = self.inner.write().unwrap();

        let doomed: HashSet<String> = inner
            .nodes
            .values()
            .filter(|n| n.path.as_deref() == Some(path))
            .map(|n| n.id.clone())
            .collect();

        if doomed.is_empty() {
            return Ok(());
        }

        inner.nodes.retain(|id, _| !doomed.contains(id));
        inner
            .edges
            .retain(|(source, target, _), _| !doomed.contains(source) && !doomed.contains(target));

        inner.outgoing.retain(|id, _| !doomed.contains(id));
        inner.incoming.retain(|id, _| !doomed.contains(id));
        for targets in inner.outgoing.values_mut() {
            targets.retain(|id| !doomed.contains(id));
        }
        for sources in inner.incoming.values_mut() {
            sources.retain(|id| !doomed.contains(id));
        }
        Ok(())
    }

    async fn impact_analysis(&self, node_id: &str, change_type: ChangeType) -> Result<ImpactAnalysis> {
        let inner = self.inner.read().unwrap();

        if !inner.nodes.contains_key(node_id) {
            return Ok(ImpactAnalysis::empty(node_id, change_type));
        }

        let reached = reachable(&inner.outgoing, node_id, MAX_IMPACT_DEPTH);

        let mut affected: Vec<AffectedNode> = reached
            .iter()
            .filter_map(|id| inner.nodes.get(id))
            .map(|node| AffectedNode {
                node: node.clone(),
                impact_level: impact_level(change_type, node.kind),
            })
            .collect();
        affected.sort_by(|a, b| {
            b.impact_level
                .cmp(&a.impact_level)
                .then_with(|| a.node.id.cmp(&b.node.id))
        });

        let impact_score: u32 = affected.iter().map(|a| a.impact_level.weight()).sum();
        let total_affected = affected.len();

        let mut recommendations = Vec::new();
        if total_affected > 0 {
            if total_affected > 10 {
                recommendations.push(
                    "Change affects a large portion of the graph; consider splitting it into smaller changes".to_string(),
                );
            }
            if affected
                .iter()
                .any(|a| a.impact_level == ImpactLevel::Critical)
            {
                recommendations.push(
                    "Critical components are affected; run comprehensive tests before shipping".to_string(),
                );
            }
            if change_type == ChangeType::Delete {
                recommendations.push(
                    "Deletion detected; verify all dependents before removing this entity".to_string(),
                );
            }
        }

        Ok(ImpactAnalysis {
            source_node_id: node_id.to_string(),
            change_type,
            affected_nodes: affected,
            total_affected,
            impact_score,
            recommendations,
        })
    }

    async fn architecture_analysis(&self) -> Result<ArchitectureAnalysis> {
        let inner = self.inner.read().unwrap();

        let mut by_kind: BTreeMap<NodeKind, usize> = BTreeMap::new();
        for node in inner.nodes.values() {
            *by_kind.entry(node.kind).or_insert(0) += 1;
        }

        let mut rel_histogram: BTreeMap<RelationKind, usize> = BTreeMap::new();
        for (_, _, kind) in inner.edges.keys() {
            *rel_histogram.entry(*kind).or_insert(0) += 1;
        }

        // Floors avoid division by zero and ln(0) on an empty graph.
        let total_components = inner.nodes.len().max(1) as f64;
        let total_relationships = inner.edges.len().max(1) as f64;
        let complexity_score = (total_relationships / total_components) * total_components.ln();

        let function_count = by_kind.get(&NodeKind::Function).copied().unwrap_or(0);
        let class_count = by_kind.get(&NodeKind::Class).copied().unwrap_or(0);
        let import_count = by_kind.get(&NodeKind::Import).copied().unwrap_or(0);

        let mut recommendations = Vec::new();
        if complexity_score > 10.0 {
            recommendations.push(
                "High architectural complexity; consider extracting modules with clearer boundaries".to_string(),
            );
        }
        if function_count > 5 * class_count.max(1) {
            recommendations.push(
                "Many free functions relative to classes; consider grouping related functions".to_string(),
            );
        }
        if import_count > 50 {
            recommendations
                .push("Large number of imports; review dependency management".to_string());
        }

        Ok(ArchitectureAnalysis {
            components: by_kind.into_iter().collect(),
            relationships: rel_histogram.into_iter().collect(),
            complexity_score,
            recommendations,
        })
    }

    async fn circular_dependencies(&self) -> Result<Vec<CodeNode>> {
        let inner = self.inner.read().unwrap();

        let mut circular: Vec<CodeNode> = inner
            .nodes
            .values()
            .filter(|node| {
                let out = reachable(&inner.outgoing, &node.id, MAX_IMPACT_DEPTH);
                if out.is_empty() {
                    return false;
                }
                let inc = reachable(&inner.incoming, &node.id, MAX_IMPACT_DEPTH);
                out.intersection(&inc).next().is_some()
            })
            .cloned()
            .collect();
        circular.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(circular)
    }

    async fn stats(&self) -> Result<GraphStats> {
        let inner = self.inner.read().unwrap();

        let mut by_kind: BTreeMap<NodeKind, usize> = BTreeMap::new();
        for node in inner.nodes.values() {
            *by_kind.entry(node.kind).or_insert(0) += 1;
        }

        Ok(GraphStats {
            node_count: inner.nodes.len(),
            relationship_count: inner.edges.len(),
            nodes_by_kind: by_kind.into_iter().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(kind: NodeKind, name: &str, path: &str) -> CodeNode {
        CodeNode::new(kind, name, Some(path.to_string()), "rust")
    }

    fn edge(source: &CodeNode, target: &CodeNode, kind: RelationKind) -> CodeRelationship {
        CodeRelationship {
            kind,
            source_id: source.id.clone(),
            target_id: target.id.clone(),
            properties: serde_json::Value::Null,
        }
    }

    async fn chain_graph() -> (InMemoryGraph, CodeNode, CodeNode, CodeNode) {
        // a -> b -> c
        let graph = InMemoryGraph::new();
        let a = node(NodeKind::File, "a.rs", "/src/a.rs");
        let b = node(NodeKind::File, "b.rs", "/src/b.rs");
        let c = node(NodeKind::Function, "handle", "/src/c.rs");
        graph.upsert_node(a.clone()).await.unwrap();
        graph.upsert_node(b.clone()).await.unwrap();
        graph.upsert_node(c.clone()).await.unwrap();
        graph
            .upsert_relationship(edge(&a, &b, RelationKind::Imports))
            .await
            .unwrap();
        graph
            .upsert_relationship(edge(&b, &c, RelationKind::Calls))
            .await
            .unwrap();
        (graph, a, b, c)
    }

    #[tokio::test]
    async fn test_upsert_node_is_idempotent() {
        let graph = InMemoryGraph::new();
        let mut n = node(NodeKind::Class, "Auth", "/src/auth.rs");
        graph.upsert_node(n.clone()).await.unwrap();

        n.metadata = serde_json::json!({ "lines": 120 });
        graph.upsert_node(n.clone()).await.unwrap();

        let stats = graph.stats().await.unwrap();
        assert_eq!(stats.node_count, 1);
        let stored = graph.get_node(&n.id).await.unwrap().unwrap();
        assert_eq!(stored.metadata["lines"], 120);
    }

    #[tokio::test]
    async fn test_relationship_requires_endpoints() {
        let graph = InMemoryGraph::new();
        let a = node(NodeKind::File, "a.rs", "/src/a.rs");
        graph.upsert_node(a.clone()).await.unwrap();

        let dangling = CodeRelationship {
            kind: RelationKind::Imports,
            source_id: a.id.clone(),
            target_id: "missing".to_string(),
            properties: serde_json::Value::Null,
        };
        let err = graph.upsert_relationship(dangling).await.unwrap_err();
        assert!(!err.recoverable());
    }

    #[tokio::test]
    async fn test_duplicate_relationship_merges() {
        let graph = InMemoryGraph::new();
        let a = node(NodeKind::File, "a.rs", "/src/a.rs");
        let b = node(NodeKind::File, "b.rs", "/src/b.rs");
        graph.upsert_node(a.clone()).await.unwrap();
        graph.upsert_node(b.clone()).await.unwrap();

        graph
            .upsert_relationship(edge(&a, &b, RelationKind::Imports))
            .await
            .unwrap();
        let mut second = edge(&a, &b, RelationKind::Imports);
        second.properties = serde_json::json!({ "weight": 2 });
        graph.upsert_relationship(second).await.unwrap();

        let stats = graph.stats().await.unwrap();
        assert_eq!(stats.relationship_count, 1);
    }

    #[tokio::test]
    async fn test_dependencies_directions() {
        let (graph, a, b, c) = chain_graph().await;

        let out = graph.dependencies(&a.id, Direction::Outgoing).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, b.id);

        let inc = graph.dependencies(&c.id, Direction::Incoming).await.unwrap();
        assert_eq!(inc.len(), 1);
        assert_eq!(inc[0].id, b.id);

        let both = graph.dependencies(&b.id, Direction::Both).await.unwrap();
        assert_eq!(both.len(), 2);
    }

    #[tokio::test]
    async fn test_dependencies_of_unknown_node_is_empty() {
        let graph = InMemoryGraph::new();
        assert!(graph
            .dependencies("ghost", Direction::Both)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_impact_no_relationships() {
        let graph = InMemoryGraph::new();
        let n = node(NodeKind::Function, "lonely", "/src/lonely.rs");
        graph.upsert_node(n.clone()).await.unwrap();

        let analysis = graph
            .impact_analysis(&n.id, ChangeType::Modify)
            .await
            .unwrap();
        assert_eq!(analysis.total_affected, 0);
        assert_eq!(analysis.impact_score, 0);
        assert!(analysis.recommendations.is_empty());
    }

    #[tokio::test]
    async fn test_impact_missing_node_is_empty_not_error() {
        let graph = InMemoryGraph::new();
        let analysis = graph
            .impact_analysis("missing", ChangeType::Delete)
            .await
            .unwrap();
        assert_eq!(analysis.total_affected, 0);
    }

    #[tokio::test]
    async fn test_impact_delete_file_classifies_critical() {
        let (graph, a, b, c) = chain_graph().await;

        let analysis = graph
            .impact_analysis(&a.id, ChangeType::Delete)
            .await
            .unwrap();

        assert_eq!(analysis.total_affected, 2);
        let file_hit = analysis
            .affected_nodes
            .iter()
            .find(|n| n.node.id == b.id)
            .unwrap();
        assert_eq!(file_hit.impact_level, ImpactLevel::Critical);
        let fn_hit = analysis
            .affected_nodes
            .iter()
            .find(|n| n.node.id == c.id)
            .unwrap();
        assert_eq!(fn_hit.impact_level, ImpactLevel::High);
        // Deletion recommendation plus the critical-node testing one.
        assert!(analysis.recommendations.len() >= 2);
    }

    #[tokio::test]
    async fn test_impact_score_increases_with_severity() {
        // Same affected count; delete classifies nodes more severely
        // than modify, so the weighted score must be strictly larger.
        let (graph, a, _b, _c) = chain_graph().await;

        let modify = graph
            .impact_analysis(&a.id, ChangeType::Modify)
            .await
            .unwrap();
        let delete = graph
            .impact_analysis(&a.id, ChangeType::Delete)
            .await
            .unwrap();
        assert_eq!(modify.total_affected, delete.total_affected);
        assert!(delete.impact_score > modify.impact_score);
    }

    #[tokio::test]
    async fn test_impact_depth_capped_at_three_hops() {
        // a -> b -> c -> d -> e; e is 4 hops away and must not be reached.
        let graph = InMemoryGraph::new();
        let names = ["a", "b", "c", "d", "e"];
        let nodes: Vec<CodeNode> = names
            .iter()
            .map(|n| node(NodeKind::Function, n, &format!("/src/{n}.rs")))
            .collect();
        for n in &nodes {
            graph.upsert_node(n.clone()).await.unwrap();
        }
        for pair in nodes.windows(2) {
            graph
                .upsert_relationship(edge(&pair[0], &pair[1], RelationKind::Calls))
                .await
                .unwrap();
        }

        let analysis = graph
            .impact_analysis(&nodes[0].id, ChangeType::Modify)
            .await
            .unwrap();
        assert_eq!(analysis.total_affected, 3);
        assert!(!analysis
            .affected_nodes
            .iter()
            .any(|n| n.node.id == nodes[4].id));
    }

    #[tokio::test]
    async fn test_architecture_complexity_floors() {
        let graph = InMemoryGraph::new();
        let analysis = graph.architecture_analysis().await.unwrap();
        // Empty graph: (1/1) * ln(1) = 0, not NaN.
        assert_eq!(analysis.complexity_score, 0.0);
    }

    #[tokio::test]
    async fn test_architecture_grouping_recommendation() {
        let graph = InMemoryGraph::new();
        for i in 0..6 {
            graph
                .upsert_node(node(NodeKind::Function, &format!("f{i}"), "/src/lib.rs"))
                .await
                .unwrap();
        }
        let analysis = graph.architecture_analysis().await.unwrap();
        assert_eq!(analysis.components, vec![(NodeKind::Function, 6)]);
        assert!(analysis
            .recommendations
            .iter()
            .any(|r| r.contains("grouping")));
    }

    #[tokio::test]
    async fn test_architecture_relationship_histogram_sorted_by_kind() {
        let graph = InMemoryGraph::new();
        let a = node(NodeKind::File, "a.rs", "/src/a.rs");
        let b = node(NodeKind::File, "b.rs", "/src/b.rs");
        let f = node(NodeKind::Function, "run", "/src/a.rs");
        for n in [&a, &b, &f] {
            graph.upsert_node(n.clone()).await.unwrap();
        }
        graph
            .upsert_relationship(edge(&a, &b, RelationKind::Imports))
            .await
            .unwrap();
        graph
            .upsert_relationship(edge(&a, &f, RelationKind::DependsOn))
            .await
            .unwrap();
        graph
            .upsert_relationship(edge(&b, &f, RelationKind::Calls))
            .await
            .unwrap();

        let analysis = graph.architecture_analysis().await.unwrap();
        let kinds: Vec<RelationKind> =
            analysis.relationships.iter().map(|(k, _)| *k).collect();
        let mut sorted = kinds.clone();
        sorted.sort();
        assert_eq!(kinds, sorted);
        assert_eq!(analysis.relationships.iter().map(|(_, n)| n).sum::<usize>(), 3);
    }

    #[tokio::test]
    async fn test_circular_dependency_flagged() {
        let graph = InMemoryGraph::new();
        let a = node(NodeKind::File, "a.rs", "/src/a.rs");
        let b = node(NodeKind::File, "b.rs", "/src/b.rs");
        let lone = node(NodeKind::File, "z.rs", "/src/z.rs");
        graph.upsert_node(a.clone()).await.unwrap();
        graph.upsert_node(b.clone()).await.unwrap();
        graph.upsert_node(lone.clone()).await.unwrap();
        graph
            .upsert_relationship(edge(&a, &b, RelationKind::Imports))
            .await
            .unwrap();
        graph
            .upsert_relationship(edge(&b, &a, RelationKind::Imports))
            .await
            .unwrap();

        let circular = graph.circular_dependencies().await.unwrap();
        let ids: Vec<&str> = circular.iter().map(|n| n.id.as_str()).collect();
        assert!(ids.contains(&a.id.as_str()));
        assert!(ids.contains(&b.id.as_str()));
        assert!(!ids.contains(&lone.id.as_str()));
    }

    #[tokio::test]
    async fn test_remove_path_drops_nodes_and_edges() {
        let (graph, a, b, _c) = chain_graph().await;

        graph.remove_path("/src/b.rs").await.unwrap();

        assert!(graph.get_node(&b.id).await.unwrap().is_none());
        assert!(graph
            .dependencies(&a.id, Direction::Outgoing)
            .await
            .unwrap()
            .is_empty());
        let stats = graph.stats().await.unwrap();
        assert_eq!(stats.node_count, 2);
        assert_eq!(stats.relationship_count, 0);
    }
}
