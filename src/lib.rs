//! # repo-rag
//!
//! Embedding pipeline, hybrid code search and grounded chat over source
//! repositories.
//!
//! Chunks of source code arrive from an external extractor. The embedding
//! pipeline turns them into vectors in the background, search fuses vector
//! similarity with BM25, and the chat orchestrator answers questions from
//! the retrieved chunks, streaming the reply and keeping the history.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │  Ingest   │──▶│ SQLite store │──▶│   Pipeline   │──▶│ Vector store │
//! │ (chunks)  │   │ chunks + FTS │   │ jobs/workers │   │ sqlite/qdrant│
//! └───────────┘   └──────┬───────┘   └──────────────┘   └──────┬───────┘
//!                        │          ┌────────────┐             │
//!                        └─────────▶│   Search   │◀────────────┘
//!                                   │ BM25+vector│
//!                                   └─────┬──────┘
//!                                         ▼
//!                                   ┌────────────┐
//!                                   │    Chat    │──▶ generation provider
//!                                   └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! rrag init                             # create database
//! rrag ingest chunks.json --repo api    # store extractor output
//! rrag embed pending                    # embed it
//! rrag search "token refresh" --mode hybrid
//! rrag serve                            # HTTP API + background pipeline
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`services`] | Service wiring shared by CLI and server |
//! | [`embedding`] | Embedding providers |
//! | [`embed_service`] | Batching, retries and collection lifecycle |
//! | [`pipeline`] | Background embedding jobs |
//! | [`search`] | Vector, lexical and hybrid search |
//! | [`generation`] | Streaming generation providers |
//! | [`chat`] | Chat RAG orchestration |
//! | [`ingest`] | Chunk ingestion |
//! | [`server`] | HTTP server |
//! | [`sqlite_store`] | SQLite metadata store |
//! | [`vector`] | Vector store adapters |

pub mod chat;
pub mod config;
pub mod db;
pub mod embed_cmd;
pub mod embed_service;
pub mod embedding;
pub mod generation;
pub mod ingest;
pub mod migrate;
pub mod pipeline;
pub mod rate_limit;
pub mod search;
pub mod server;
pub mod services;
pub mod sqlite_store;
pub mod stats;
pub mod vector;
