//! Qdrant vector store over its REST API.
//!
//! Endpoints used:
//!
//! - `GET  /collections/{name}` inspect, `PUT /collections/{name}` create
//! - `PUT  /collections/{name}/points?wait=true` upsert
//! - `POST /collections/{name}/points/search` query with payload filter
//! - `POST /collections/{name}/points/delete?wait=true` delete by id or filter
//! - `GET  /healthz`
//!
//! Chunk ids are UUID-formatted, which Qdrant accepts as point ids. The API
//! key, if any, comes from `QDRANT_API_KEY`.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};
use tracing::{debug, info};

use repo_rag_core::embedding::DistanceMetric;
use repo_rag_core::error::RagError;
use repo_rag_core::store::{
    ChunkCandidate, CollectionSpec, CollectionStatus, SearchFilter, VectorPoint, VectorStore,
};

use crate::config::VectorStoreConfig;

pub struct QdrantVectorStore {
    client: reqwest::Client,
    base_url: String,
    collection: String,
    metric: DistanceMetric,
    api_key: Option<String>,
}

impl QdrantVectorStore {
    pub fn new(config: &VectorStoreConfig, metric: DistanceMetric) -> Result<Self> {
        let base_url = config
            .url
            .clone()
            .ok_or_else(|| anyhow!("vector_store.url required for Qdrant"))?
            .trim_end_matches('/')
            .to_string();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url,
            collection: config.collection.clone(),
            metric,
            api_key: std::env::var("QDRANT_API_KEY").ok(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/collections/{}{}", self.base_url, self.collection, path)
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        let req = self.client.request(method, url);
        match &self.api_key {
            Some(key) => req.header("api-key", key),
            None => req,
        }
    }

    async fn send(&self, req: reqwest::RequestBuilder, what: &str) -> Result<Value> {
        let response = req
            .send()
            .await
            .map_err(|e| RagError::IndexUnavailable(format!("qdrant {what}: {e}")))?;
        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .with_context(|| format!("qdrant {what}: invalid response body"));
        }
        let body = response.text().await.unwrap_or_default();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(RagError::IndexUnavailable(format!("qdrant {what}: {status} {body}")).into());
        }
        Err(anyhow!("qdrant {what} failed: {status} {body}"))
    }
}

fn distance_name(metric: DistanceMetric) -> &'static str {
    match metric {
        DistanceMetric::Cosine => "Cosine",
        DistanceMetric::Dot => "Dot",
        DistanceMetric::Euclid => "Euclid",
    }
}

/// Build a Qdrant `filter` object from a search filter.
pub(crate) fn build_filter(filter: &SearchFilter) -> Option<Value> {
    let mut must = Vec::new();
    if let Some(repo) = &filter.repository_id {
        must.push(json!({ "key": "repository_id", "match": { "value": repo } }));
    }
    if let Some(lang) = &filter.language {
        must.push(json!({ "key": "language", "match": { "value": lang.to_lowercase() } }));
    }
    if must.is_empty() {
        None
    } else {
        Some(json!({ "must": must }))
    }
}

/// Parse `result[]` of a points search into candidates.
///
/// Qdrant reports Euclidean scores as distances; they are negated so that
/// higher is always better.
pub(crate) fn parse_search_result(body: &Value, metric: DistanceMetric) -> Result<Vec<ChunkCandidate>> {
    let hits = body
        .get("result")
        .and_then(|r| r.as_array())
        .ok_or_else(|| anyhow!("Invalid Qdrant response: missing result array"))?;
    hits.iter()
        .map(|hit| {
            let id = match hit.get("id") {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Number(n)) => n.to_string(),
                _ => return Err(anyhow!("Invalid Qdrant response: missing point id")),
            };
            let score = hit
                .get("score")
                .and_then(|s| s.as_f64())
                .ok_or_else(|| anyhow!("Invalid Qdrant response: missing score"))?;
            let score = match metric {
                DistanceMetric::Euclid => -score,
                _ => score,
            };
            Ok(ChunkCandidate::new(id, score))
        })
        .collect()
}

#[async_trait]
impl VectorStore for QdrantVectorStore {
    async fn ensure_collection(&self, spec: &CollectionSpec) -> Result<CollectionStatus> {
        let response = self
            .request(reqwest::Method::GET, self.url(""))
            .send()
            .await
            .map_err(|e| RagError::IndexUnavailable(format!("qdrant inspect collection: {e}")))?;

        if response.status().is_success() {
            let body: Value = response.json().await?;
            let params = &body["result"]["config"]["params"]["vectors"];
            let dims = params["size"]
                .as_u64()
                .ok_or_else(|| anyhow!("Qdrant collection {} has no single vector size", self.collection))?;
            let existing = CollectionSpec {
                dims: dims as usize,
                metric: params["distance"]
                    .as_str()
                    .and_then(DistanceMetric::parse)
                    .unwrap_or(self.metric),
                model: String::new(),
            };
            existing.ensure_compatible(spec)?;
            return Ok(CollectionStatus::Existing);
        }
        if response.status() != StatusCode::NOT_FOUND {
            let status = response.status();
            return Err(RagError::IndexUnavailable(format!(
                "qdrant inspect collection: {status}"
            ))
            .into());
        }

        let body = json!({
            "vectors": { "size": spec.dims, "distance": distance_name(spec.metric) }
        });
        self.send(
            self.request(reqwest::Method::PUT, self.url("")).json(&body),
            "create collection",
        )
        .await?;
        info!(collection = %self.collection, dims = spec.dims, "created Qdrant collection");
        Ok(CollectionStatus::Created)
    }

    async fn upsert(&self, points: &[VectorPoint]) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }
        let points: Vec<Value> = points
            .iter()
            .map(|p| {
                json!({
                    "id": p.id,
                    "vector": p.vector,
                    "payload": {
                        "repository_id": p.payload.repository_id,
                        "file_path": p.payload.file_path,
                        "language": p.payload.language.to_lowercase(),
                        "content_hash": p.payload.content_hash,
                    }
                })
            })
            .collect();
        debug!(count = points.len(), "qdrant upsert");
        self.send(
            self.request(reqwest::Method::PUT, self.url("/points?wait=true"))
                .json(&json!({ "points": points })),
            "upsert points",
        )
        .await?;
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ChunkCandidate>> {
        let mut body = json!({
            "vector": vector,
            "limit": k,
            "with_payload": false,
        });
        if let Some(f) = build_filter(filter) {
            body["filter"] = f;
        }
        let response = self
            .send(
                self.request(reqwest::Method::POST, self.url("/points/search"))
                    .json(&body),
                "search points",
            )
            .await?;
        parse_search_result(&response, self.metric)
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.send(
            self.request(reqwest::Method::POST, self.url("/points/delete?wait=true"))
                .json(&json!({ "points": ids })),
            "delete points",
        )
        .await?;
        Ok(())
    }

    async fn delete_repository(&self, repository_id: &str) -> Result<()> {
        let filter = build_filter(&SearchFilter::repository(repository_id));
        self.send(
            self.request(reqwest::Method::POST, self.url("/points/delete?wait=true"))
                .json(&json!({ "filter": filter })),
            "delete repository points",
        )
        .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let response = self
            .request(reqwest::Method::GET, format!("{}/healthz", self.base_url))
            .send()
            .await
            .map_err(|e| RagError::IndexUnavailable(format!("qdrant health: {e}")))?;
        if !response.status().is_success() {
            return Err(
                RagError::IndexUnavailable(format!("qdrant health: {}", response.status())).into(),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_builds_must_clauses() {
        assert!(build_filter(&SearchFilter::default()).is_none());
        let f = build_filter(&SearchFilter {
            repository_id: Some("r1".into()),
            language: Some("Rust".into()),
        })
        .unwrap();
        let must = f["must"].as_array().unwrap();
        assert_eq!(must.len(), 2);
        assert_eq!(must[0]["match"]["value"], "r1");
        assert_eq!(must[1]["match"]["value"], "rust");
    }

    #[test]
    fn search_result_parsing_negates_euclid() {
        let body = json!({
            "result": [
                { "id": "a", "score": 0.5 },
                { "id": 7, "score": 2.0 }
            ]
        });
        let cos = parse_search_result(&body, DistanceMetric::Cosine).unwrap();
        assert_eq!(cos[0], ChunkCandidate::new("a", 0.5));
        assert_eq!(cos[1].chunk_id, "7");
        let euclid = parse_search_result(&body, DistanceMetric::Euclid).unwrap();
        assert!((euclid[1].raw_score + 2.0).abs() < 1e-9);
        assert!(parse_search_result(&json!({}), DistanceMetric::Dot).is_err());
    }
}
