//! # repo-rag core
//!
//! Runtime-free logic for repo-rag: data models, the error taxonomy,
//! capability traits for embedding providers and stores, the BM25 lexical
//! index, hybrid score fusion, and in-memory store implementations.
//!
//! This crate contains no tokio, sqlx, or HTTP dependencies.

pub mod embedding;
pub mod error;
pub mod lexical;
pub mod models;
pub mod search;
pub mod store;
