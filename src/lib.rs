//! # Context Mesh
//!
//! A unified context retrieval service for AI coding agents.
//!
//! Context Mesh combines three memory layers behind one orchestrator:
//! semantic memory (embedded content with similarity search), working
//! memory (a TTL cache with LRU eviction), and structural memory (a code
//! relationship graph). Callers get ranked, agent-profiled context in a
//! single call, served over a JSON HTTP API.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────────────────────────┐
//! │  Clients  │──▶│         Orchestrator          │
//! │ CLI/HTTP  │   │  cache-first, profile-ranked  │
//! └───────────┘   └──────┬───────┬───────┬───────┘
//!                        ▼       ▼       ▼
//!                 ┌─────────┐ ┌──────┐ ┌───────┐
//!                 │ Vectors │ │Cache │ │ Graph │
//!                 │ +Embed  │ │TTL/LRU│ │ BFS  │
//!                 └─────────┘ └──────┘ └───────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! cmx check                            # validate configuration
//! cmx query "auth flow" --ingest corpus.json
//! cmx serve                            # start HTTP server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Error taxonomy with recoverability |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`vector_store`] | Vector storage and similarity search |
//! | [`cache`] | Working memory: TTL + LRU cache |
//! | [`graph`] | Code relationship graph and impact analysis |
//! | [`retrieval`] | Ranking engine and agent profiles |
//! | [`orchestrator`] | Cross-layer context service |
//! | [`server`] | JSON HTTP server |

pub mod cache;
pub mod config;
pub mod embedding;
pub mod error;
pub mod graph;
pub mod models;
pub mod orchestrator;
pub mod retrieval;
pub mod server;
pub mod vector_store;
