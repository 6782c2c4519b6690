//! Behavioral properties of the individual layers, exercised through the
//! public API: ranking order, idempotent graph writes, TTL and eviction
//! under a simulated clock, and impact classification.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use context_mesh::cache::{CacheBackend, InMemoryCache, ManualClock, WorkingMemory};
use context_mesh::graph::{GraphStore, InMemoryGraph, MAX_IMPACT_DEPTH};
use context_mesh::models::{
    ChangeType, CodeNode, CodeRelationship, ContextChunk, EmbeddingMetadata, ImpactLevel, Message,
    NodeKind, RelationKind, SourceKind,
};
use context_mesh::retrieval::{compare_chunks, quality_band, rank_chunks, similarity_band};

fn chunk(id: &str, similarity: f32, quality: u8, age_minutes: i64) -> ContextChunk {
    ContextChunk {
        id: id.to_string(),
        content: format!("content {id}"),
        embedding: vec![0.0; 8],
        metadata: EmbeddingMetadata {
            source: SourceKind::Workspace,
            file_path: None,
            function_name: None,
            class_name: None,
            language: "rust".to_string(),
            tags: BTreeSet::new(),
            quality,
            created_at: Utc::now() - chrono::Duration::minutes(age_minutes),
        },
        similarity: Some(similarity),
    }
}

/// For every adjacent pair in a ranked list, the higher-placed chunk must
/// win on one of the three keys: a higher similarity band, a higher
/// quality band within a similarity tie, or recency within both ties.
fn assert_rank_invariant(chunks: &[ContextChunk]) {
    for pair in chunks.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        let sim_a = similarity_band(a.similarity.unwrap_or(0.0));
        let sim_b = similarity_band(b.similarity.unwrap_or(0.0));
        let quality_a = quality_band(a.metadata.quality);
        let quality_b = quality_band(b.metadata.quality);

        let ok = sim_a > sim_b
            || (sim_a == sim_b && quality_a > quality_b)
            || (sim_a == sim_b
                && quality_a == quality_b
                && a.metadata.created_at >= b.metadata.created_at);
        assert!(
            ok,
            "ranking violated between {} (sim band {sim_a}, q band {quality_a}) and {} (sim band {sim_b}, q band {quality_b})",
            a.id, b.id
        );
    }
}

#[test]
fn ranking_satisfies_the_three_key_order() {
    let mut chunks = vec![
        chunk("a", 0.95, 50, 10),
        chunk("b", 0.90, 95, 200),
        chunk("c", 0.60, 80, 5),
        chunk("d", 0.58, 80, 500),
        chunk("e", 0.30, 100, 1),
    ];
    rank_chunks(&mut chunks);
    assert_rank_invariant(&chunks);

    // The comparator itself is antisymmetric.
    for x in &chunks {
        for y in &chunks {
            assert_eq!(compare_chunks(x, y), compare_chunks(y, x).reverse());
        }
    }
}

fn lcg(state: &mut u64) -> u32 {
    *state = state
        .wrapping_mul(6364136223846793005)
        .wrapping_add(1442695040888963407);
    (*state >> 33) as u32
}

#[test]
fn ranking_a_large_mixed_population_does_not_panic() {
    // A dense population hits every band boundary; sort_by rejects a
    // comparator that is not a total order.
    let mut state = 0x9e37_79b9_7f4a_7c15u64;
    let mut chunks: Vec<ContextChunk> = (0..500)
        .map(|i| {
            let similarity = (lcg(&mut state) % 1000) as f32 / 1000.0;
            let quality = (lcg(&mut state) % 101) as u8;
            let age = (lcg(&mut state) % 10_000) as i64;
            chunk(&format!("c{i}"), similarity, quality, age)
        })
        .collect();

    rank_chunks(&mut chunks);
    assert_rank_invariant(&chunks);
}

#[test]
fn clear_similarity_beats_quality_and_recency() {
    let mut chunks = vec![chunk("worse", 0.5, 100, 0), chunk("better", 0.9, 0, 999)];
    rank_chunks(&mut chunks);
    assert_eq!(chunks[0].id, "better");
}

#[tokio::test]
async fn graph_upserts_are_idempotent() {
    let graph = InMemoryGraph::new();
    let node = CodeNode::new(
        NodeKind::Function,
        "handler",
        Some("/src/api.rs".to_string()),
        "rust",
    );

    for _ in 0..3 {
        graph.upsert_node(node.clone()).await.unwrap();
    }
    assert_eq!(graph.stats().await.unwrap().node_count, 1);

    let target = CodeNode::new(
        NodeKind::Function,
        "helper",
        Some("/src/api.rs".to_string()),
        "rust",
    );
    graph.upsert_node(target.clone()).await.unwrap();
    let edge = CodeRelationship {
        kind: RelationKind::Calls,
        source_id: node.id.clone(),
        target_id: target.id.clone(),
        properties: serde_json::Value::Null,
    };
    for _ in 0..3 {
        graph.upsert_relationship(edge.clone()).await.unwrap();
    }
    assert_eq!(graph.stats().await.unwrap().relationship_count, 1);
}

#[tokio::test]
async fn impact_of_isolated_node_is_zero() {
    let graph = InMemoryGraph::new();
    let node = CodeNode::new(NodeKind::File, "lone.rs", Some("/lone.rs".to_string()), "rust");
    graph.upsert_node(node.clone()).await.unwrap();

    let analysis = graph
        .impact_analysis(&node.id, ChangeType::Delete)
        .await
        .unwrap();
    assert_eq!(analysis.total_affected, 0);
    assert_eq!(analysis.impact_score, 0);
}

#[tokio::test]
async fn deleting_a_file_marks_reached_files_critical() {
    let graph = InMemoryGraph::new();
    let a = CodeNode::new(NodeKind::File, "a.rs", Some("/a.rs".to_string()), "rust");
    let b = CodeNode::new(NodeKind::File, "b.rs", Some("/b.rs".to_string()), "rust");
    graph.upsert_node(a.clone()).await.unwrap();
    graph.upsert_node(b.clone()).await.unwrap();
    graph
        .upsert_relationship(CodeRelationship {
            kind: RelationKind::Imports,
            source_id: a.id.clone(),
            target_id: b.id.clone(),
            properties: serde_json::Value::Null,
        })
        .await
        .unwrap();

    let analysis = graph.impact_analysis(&a.id, ChangeType::Delete).await.unwrap();
    assert_eq!(analysis.affected_nodes[0].impact_level, ImpactLevel::Critical);
    assert_eq!(analysis.impact_score, ImpactLevel::Critical.weight());
}

#[tokio::test]
async fn impact_traversal_respects_the_depth_cap() {
    let graph = InMemoryGraph::new();
    let nodes: Vec<CodeNode> = (0..MAX_IMPACT_DEPTH + 2)
        .map(|i| {
            CodeNode::new(
                NodeKind::Function,
                format!("f{i}"),
                Some(format!("/f{i}.rs")),
                "rust",
            )
        })
        .collect();
    for node in &nodes {
        graph.upsert_node(node.clone()).await.unwrap();
    }
    for pair in nodes.windows(2) {
        graph
            .upsert_relationship(CodeRelationship {
                kind: RelationKind::Calls,
                source_id: pair[0].id.clone(),
                target_id: pair[1].id.clone(),
                properties: serde_json::Value::Null,
            })
            .await
            .unwrap();
    }

    let analysis = graph
        .impact_analysis(&nodes[0].id, ChangeType::Modify)
        .await
        .unwrap();
    assert_eq!(analysis.total_affected, MAX_IMPACT_DEPTH);
}

#[tokio::test]
async fn cache_entries_expire_exactly_at_ttl() {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap(),
    ));
    let cache = InMemoryCache::with_clock(4096, clock.clone());

    cache
        .set("k", "v".to_string(), Duration::from_secs(300))
        .await
        .unwrap();

    clock.advance(Duration::from_secs(299));
    assert!(cache.get("k").await.unwrap().is_some());

    clock.advance(Duration::from_secs(1));
    assert!(cache.get("k").await.unwrap().is_none());
}

#[tokio::test]
async fn eviction_is_by_recency_not_ttl() {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap(),
    ));
    // Budget fits two 12-byte entries but not three.
    let cache = InMemoryCache::with_clock(24, clock);

    cache
        .set("a", "0123456789".to_string(), Duration::from_secs(9999))
        .await
        .unwrap();
    cache
        .set("b", "0123456789".to_string(), Duration::from_secs(10))
        .await
        .unwrap();
    cache.get("a").await.unwrap();
    cache
        .set("c", "0123456789".to_string(), Duration::from_secs(10))
        .await
        .unwrap();

    // "b" was least recently used, so it goes despite "a"'s longer life.
    assert!(cache.get("a").await.unwrap().is_some());
    assert!(cache.get("b").await.unwrap().is_none());
}

#[tokio::test]
async fn conversation_survives_unrelated_invalidation() {
    let memory = WorkingMemory::new(
        Arc::new(InMemoryCache::new(64 * 1024)),
        Duration::from_secs(600),
    );
    memory
        .append_conversation(
            "s",
            Message {
                role: "user".to_string(),
                content: "keep me".to_string(),
                timestamp: Utc::now(),
            },
        )
        .await
        .unwrap();

    memory.invalidate("/any/file.rs").await.unwrap();

    assert!(memory.get_conversation("s").await.unwrap().is_some());
}

#[test]
fn chunk_serialization_roundtrips() {
    let original = chunk("roundtrip", 0.82, 77, 42);
    let json = serde_json::to_string(&original).unwrap();
    let restored: ContextChunk = serde_json::from_str(&json).unwrap();

    assert_eq!(restored.id, original.id);
    assert_eq!(restored.metadata.quality, original.metadata.quality);
    assert_eq!(restored.metadata.created_at, original.metadata.created_at);
    assert_eq!(restored.similarity, original.similarity);
}
