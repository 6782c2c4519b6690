//! End-to-end exercise of the context service over its public API:
//! ingest, retrieve, cache behavior, syntax-tree enrichment, file
//! invalidation, and impact analysis, all against in-memory backends
//! with the deterministic embedding provider.

use std::collections::BTreeSet;

use chrono::Utc;
use context_mesh::config::MeshConfig;
use context_mesh::models::{
    ChangeType, EmbeddingMetadata, FileContext, Message, RiskLevel, SourceKind, SyntaxNode,
    SyntaxTree,
};
use context_mesh::orchestrator::ContextService;
use context_mesh::retrieval::RetrievalRequest;

fn test_config() -> MeshConfig {
    let mut config = MeshConfig::default();
    config.embedding.dims = 64;
    config
}

fn meta(file_path: &str, quality: u8) -> EmbeddingMetadata {
    EmbeddingMetadata {
        source: SourceKind::Workspace,
        file_path: Some(file_path.to_string()),
        function_name: None,
        class_name: None,
        language: "typescript".to_string(),
        tags: BTreeSet::new(),
        quality,
        created_at: Utc::now(),
    }
}

fn auth_file() -> FileContext {
    FileContext {
        file_path: "/src/auth.ts".to_string(),
        content: "export function login() {}\nexport function logout() {}".to_string(),
        syntax_tree: SyntaxTree {
            roots: vec![
                SyntaxNode {
                    kind: "function".to_string(),
                    name: "login".to_string(),
                    start_line: 1,
                    end_line: 1,
                    children: vec![],
                },
                SyntaxNode {
                    kind: "function".to_string(),
                    name: "logout".to_string(),
                    start_line: 2,
                    end_line: 2,
                    children: vec![],
                },
            ],
        },
        functions: vec!["login".to_string(), "logout".to_string()],
        classes: vec![],
        imports: vec!["express".to_string()],
        exports: vec!["login".to_string()],
        last_modified: Utc::now(),
        size: 54,
        language: "typescript".to_string(),
    }
}

async fn seeded_service() -> ContextService {
    let service = ContextService::from_config(test_config()).unwrap();
    service
        .ingest(vec![
            (
                "login handler validates credentials and issues a token".to_string(),
                meta("/src/auth.ts", 85),
            ),
            (
                "payment settlement batches daily transactions".to_string(),
                meta("/src/pay.ts", 75),
            ),
            (
                "render helpers for the dashboard widgets".to_string(),
                meta("/src/ui.ts", 60),
            ),
        ])
        .await
        .unwrap();
    service
}

#[tokio::test]
async fn ingest_then_retrieve_ranks_the_relevant_chunk_first() {
    let service = seeded_service().await;

    let mut req = RetrievalRequest::new("login credentials token", "debugging");
    req.similarity_threshold = Some(0.3);
    let response = service.retrieve_context(&req).await.unwrap();

    assert!(!response.from_cache);
    assert!(response.total_results >= 1);
    assert_eq!(
        response.chunks[0].metadata.file_path.as_deref(),
        Some("/src/auth.ts")
    );
    assert!(response.relevance_score > 0.0);
}

#[tokio::test]
async fn repeated_query_is_served_from_cache() {
    let service = seeded_service().await;

    let mut req = RetrievalRequest::new("login credentials token", "debugging");
    req.similarity_threshold = Some(0.3);

    let first = service.retrieve_context(&req).await.unwrap();
    let second = service.retrieve_context(&req).await.unwrap();

    assert!(!first.from_cache);
    assert!(second.from_cache);
    let first_ids: Vec<&str> = first.chunks.iter().map(|c| c.id.as_str()).collect();
    let second_ids: Vec<&str> = second.chunks.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(first_ids, second_ids);

    // A different agent type is a different cache key.
    let mut other = req.clone();
    other.agent_type = "architecture".to_string();
    let third = service.retrieve_context(&other).await.unwrap();
    assert!(!third.from_cache);
}

#[tokio::test]
async fn ast_enrichment_merges_structural_chunks() {
    let service = seeded_service().await;
    service.store_file_context(&auth_file()).await.unwrap();

    // Exact-match query: the direct hit scores 1.0 and sits well above
    // the fixed similarity of the synthesized chunks.
    let mut req = RetrievalRequest::new(
        "login handler validates credentials and issues a token",
        "debugging",
    );
    req.similarity_threshold = Some(0.3);
    let response = service.context_with_ast(&req, None).await.unwrap();

    let ast_chunks: Vec<_> = response
        .chunks
        .iter()
        .filter(|c| c.metadata.tags.contains("ast"))
        .collect();
    assert!(!ast_chunks.is_empty());
    assert!(ast_chunks.iter().all(|c| c.metadata.quality == 70));
    // Direct vector hits outrank the synthesized chunks.
    assert!(!response.chunks[0].metadata.tags.contains("ast"));
}

#[tokio::test]
async fn file_change_invalidates_cache_but_not_conversations() {
    let service = seeded_service().await;
    service.store_file_context(&auth_file()).await.unwrap();
    service
        .store_conversation(
            "s1",
            Message {
                role: "user".to_string(),
                content: "refactor auth".to_string(),
                timestamp: Utc::now(),
            },
        )
        .await
        .unwrap();

    assert!(service
        .get_file_context("/src/auth.ts")
        .await
        .unwrap()
        .is_some());

    service.on_file_change("/src/auth.ts", None).await.unwrap();

    assert!(service
        .get_file_context("/src/auth.ts")
        .await
        .unwrap()
        .is_none());
    let history = service.get_conversation_history("s1").await.unwrap().unwrap();
    assert_eq!(history.message_count, 1);
}

#[tokio::test]
async fn conversation_appends_preserve_order() {
    let service = ContextService::from_config(test_config()).unwrap();

    for i in 0..4 {
        service
            .store_conversation(
                "session",
                Message {
                    role: if i % 2 == 0 { "user" } else { "assistant" }.to_string(),
                    content: format!("turn {i}"),
                    timestamp: Utc::now(),
                },
            )
            .await
            .unwrap();
    }

    let history = service
        .get_conversation_history("session")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(history.message_count, 4);
    assert_eq!(history.messages[0].content, "turn 0");
    assert_eq!(history.messages[3].content, "turn 3");
    assert_eq!(service.active_sessions().await.unwrap(), vec!["session"]);
}

#[tokio::test]
async fn impact_report_reflects_stored_structure() {
    let service = seeded_service().await;
    service.store_file_context(&auth_file()).await.unwrap();

    let report = service
        .analyze_change_impact("/src/auth.ts", ChangeType::Delete)
        .await
        .unwrap();

    // File node reaches two functions, one export, and one import.
    assert_eq!(report.analysis.total_affected, 4);
    assert!(report.analysis.impact_score > 0);
    assert_ne!(report.risk_level, RiskLevel::Critical);
    assert!(!report.related_chunks.is_empty());
    assert!(report
        .analysis
        .recommendations
        .iter()
        .any(|r| r.contains("Deletion")));
}

#[tokio::test]
async fn architecture_insights_count_components() {
    let service = ContextService::from_config(test_config()).unwrap();
    service.store_file_context(&auth_file()).await.unwrap();

    let insights = service.architecture_insights().await.unwrap();
    let total: usize = insights.analysis.components.iter().map(|(_, n)| n).sum();
    assert_eq!(total, 5);
    assert!(insights.circular_dependencies.is_empty());
    assert!(insights.analysis.complexity_score >= 0.0);
}

#[tokio::test]
async fn system_stats_track_activity_across_layers() {
    let service = ContextService::from_config(test_config()).unwrap();

    let before = service.system_stats().await.unwrap();
    assert_eq!(before.vector.total_chunks, 0);
    assert_eq!(before.graph.node_count, 0);

    let service = seeded_service().await;
    service.store_file_context(&auth_file()).await.unwrap();

    let after = service.system_stats().await.unwrap();
    assert_eq!(after.vector.total_chunks, 3);
    assert!(after.graph.node_count >= 5);
    assert!(after.cache.entries >= 1);
}

#[tokio::test]
async fn empty_query_is_rejected_and_empty_store_is_not() {
    let service = ContextService::from_config(test_config()).unwrap();

    let err = service
        .retrieve_context(&RetrievalRequest::new("", "debugging"))
        .await
        .unwrap_err();
    assert!(!err.recoverable());

    let response = service
        .retrieve_context(&RetrievalRequest::new("anything at all", "debugging"))
        .await
        .unwrap();
    assert_eq!(response.total_results, 0);
    assert_eq!(response.relevance_score, 0.0);
}
