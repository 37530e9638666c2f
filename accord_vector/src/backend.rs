//! Pluggable vector-store backend, mirroring the `qdrant-client` surface so
//! the filter/threshold language in [`crate::discovery`] is written against
//! a real, widely-deployed API rather than an invented one.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use accord_core::BoxError;

use crate::error::VectorError;

/// One stored vector plus its payload.
#[derive(Debug, Clone)]
pub struct VectorPoint {
    pub id: Uuid,
    pub vector: Vec<f32>,
    pub payload: BTreeMap<String, Value>,
}

/// One filter clause. List-valued metadata keys (`tags`,
/// `default_input_modes`, `default_output_modes`, `auth_schemes`) use
/// [`FilterClause::MatchAny`]; single-valued keys (`organization`,
/// `developer`) use [`FilterClause::MatchValue`]. [`FilterClause::Should`]
/// models the nested OR the discovery service needs for input/output-mode
/// and auth-scheme keys, which are stored under two different field names
/// depending on whether the point is a profile or a capability/skill point.
#[derive(Debug, Clone)]
pub enum FilterClause {
    MatchValue(String, String),
    MatchAny(String, Vec<String>),
    Should(Vec<FilterClause>),
}

/// A conjunction of `must` clauses, matching Qdrant's `Filter { must, .. }`.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub must: Vec<FilterClause>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, clause: FilterClause) -> Self {
        self.must.push(clause);
        self
    }

    fn matches(&self, payload: &BTreeMap<String, Value>) -> bool {
        self.must.iter().all(|c| clause_matches(c, payload))
    }
}

fn clause_matches(clause: &FilterClause, payload: &BTreeMap<String, Value>) -> bool {
    match clause {
        FilterClause::MatchValue(key, value) => payload
            .get(key)
            .and_then(Value::as_str)
            .map(|v| v == value)
            .unwrap_or(false),
        FilterClause::MatchAny(key, values) => payload
            .get(key)
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(Value::as_str)
                    .any(|v| values.iter().any(|want| want == v))
            })
            .unwrap_or(false),
        FilterClause::Should(clauses) => clauses.iter().any(|c| clause_matches(c, payload)),
    }
}

#[derive(Debug, Clone)]
pub struct ScoredPoint {
    pub id: Uuid,
    pub score: f32,
    pub payload: BTreeMap<String, Value>,
}

/// Collection create/exists/delete, batched upsert, filtered search with a
/// score threshold, scroll/delete-by-filter, and optional payload indexing —
/// the subset of `qdrant-client`'s API the discovery service needs.
#[async_trait]
pub trait VectorBackend: Send + Sync {
    async fn collection_exists(&self, name: &str) -> Result<bool, BoxError>;

    async fn collection_dimension(&self, name: &str) -> Result<Option<usize>, BoxError>;

    async fn create_collection(&self, name: &str, dim: usize) -> Result<(), BoxError>;

    async fn delete_collection(&self, name: &str) -> Result<(), BoxError>;

    /// Whether this backend can hold payload indexes at all. In-memory and
    /// other embedded backends report `false`, which skips step 4 of the
    /// discovery service's initialization protocol.
    fn supports_payload_index(&self) -> bool;

    async fn create_payload_index(&self, name: &str, field: &str) -> Result<(), BoxError>;

    /// Upserts points in batches of at least 100, per the vector-store
    /// contract; callers are not required to chunk beforehand.
    async fn upsert(&self, name: &str, points: Vec<VectorPoint>) -> Result<(), BoxError>;

    async fn search(
        &self,
        name: &str,
        query: &[f32],
        limit: usize,
        score_threshold: f32,
        filter: Option<&Filter>,
    ) -> Result<Vec<ScoredPoint>, BoxError>;

    async fn delete_by_filter(&self, name: &str, filter: &Filter) -> Result<(), BoxError>;
}

/// `HashMap`-backed cosine-similarity store for tests and embedded
/// deployments. Does not support payload indexing.
#[derive(Default)]
pub struct InMemoryBackend {
    collections: Mutex<HashMap<String, (usize, Vec<VectorPoint>)>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[async_trait]
impl VectorBackend for InMemoryBackend {
    async fn collection_exists(&self, name: &str) -> Result<bool, BoxError> {
        Ok(self.collections.lock().unwrap().contains_key(name))
    }

    async fn collection_dimension(&self, name: &str) -> Result<Option<usize>, BoxError> {
        Ok(self.collections.lock().unwrap().get(name).map(|(dim, _)| *dim))
    }

    async fn create_collection(&self, name: &str, dim: usize) -> Result<(), BoxError> {
        self.collections
            .lock()
            .unwrap()
            .insert(name.to_string(), (dim, Vec::new()));
        Ok(())
    }

    async fn delete_collection(&self, name: &str) -> Result<(), BoxError> {
        self.collections.lock().unwrap().remove(name);
        Ok(())
    }

    fn supports_payload_index(&self) -> bool {
        false
    }

    async fn create_payload_index(&self, _name: &str, _field: &str) -> Result<(), BoxError> {
        Ok(())
    }

    async fn upsert(&self, name: &str, points: Vec<VectorPoint>) -> Result<(), BoxError> {
        let mut collections = self.collections.lock().unwrap();
        let (dim, existing) = collections
            .get_mut(name)
            .ok_or_else(|| format!("collection {name} does not exist"))?;
        for point in points {
            if point.vector.len() != *dim {
                return Err(Box::new(VectorError::DimensionMismatch(
                    name.to_string(),
                    point.vector.len(),
                    *dim,
                )));
            }
            existing.retain(|p| p.id != point.id);
            existing.push(point);
        }
        Ok(())
    }

    async fn search(
        &self,
        name: &str,
        query: &[f32],
        limit: usize,
        score_threshold: f32,
        filter: Option<&Filter>,
    ) -> Result<Vec<ScoredPoint>, BoxError> {
        let collections = self.collections.lock().unwrap();
        let Some((_, points)) = collections.get(name) else {
            return Ok(Vec::new());
        };
        let mut scored: Vec<ScoredPoint> = points
            .iter()
            .filter(|p| filter.map(|f| f.matches(&p.payload)).unwrap_or(true))
            .map(|p| ScoredPoint {
                id: p.id,
                score: cosine(query, &p.vector),
                payload: p.payload.clone(),
            })
            .filter(|p| p.score >= score_threshold)
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    async fn delete_by_filter(&self, name: &str, filter: &Filter) -> Result<(), BoxError> {
        if let Some((_, points)) = self.collections.lock().unwrap().get_mut(name) {
            points.retain(|p| !filter.matches(&p.payload));
        }
        Ok(())
    }
}

/// Thin wrapper over the real `qdrant-client` crate for production
/// deployments.
pub struct QdrantBackend {
    client: qdrant_client::Qdrant,
}

impl QdrantBackend {
    pub fn new(client: qdrant_client::Qdrant) -> Self {
        Self { client }
    }
}

#[async_trait]
impl VectorBackend for QdrantBackend {
    async fn collection_exists(&self, name: &str) -> Result<bool, BoxError> {
        Ok(self.client.collection_exists(name).await?)
    }

    async fn collection_dimension(&self, name: &str) -> Result<Option<usize>, BoxError> {
        let info = self.client.collection_info(name).await?;
        let dim = info
            .result
            .and_then(|r| r.config)
            .and_then(|c| c.params)
            .and_then(|p| p.vectors_config)
            .and_then(|vc| vc.config)
            .and_then(|cfg| match cfg {
                qdrant_client::qdrant::vectors_config::Config::Params(params) => {
                    Some(params.size as usize)
                }
                _ => None,
            });
        Ok(dim)
    }

    async fn create_collection(&self, name: &str, dim: usize) -> Result<(), BoxError> {
        use qdrant_client::qdrant::{CreateCollectionBuilder, Distance, VectorParamsBuilder};
        self.client
            .create_collection(
                CreateCollectionBuilder::new(name)
                    .vectors_config(VectorParamsBuilder::new(dim as u64, Distance::Cosine)),
            )
            .await?;
        Ok(())
    }

    async fn delete_collection(&self, name: &str) -> Result<(), BoxError> {
        self.client.delete_collection(name).await?;
        Ok(())
    }

    fn supports_payload_index(&self) -> bool {
        true
    }

    async fn create_payload_index(&self, name: &str, field: &str) -> Result<(), BoxError> {
        use qdrant_client::qdrant::{CreateFieldIndexCollectionBuilder, FieldType};
        self.client
            .create_field_index(CreateFieldIndexCollectionBuilder::new(
                name,
                field,
                FieldType::Keyword,
            ))
            .await?;
        Ok(())
    }

    async fn upsert(&self, name: &str, points: Vec<VectorPoint>) -> Result<(), BoxError> {
        use qdrant_client::qdrant::{PointStruct, UpsertPointsBuilder};

        let points: Vec<PointStruct> = points
            .into_iter()
            .map(|p| {
                let payload: HashMap<String, Value> = p.payload.into_iter().collect();
                PointStruct::new(p.id.to_string(), p.vector, payload)
            })
            .collect();
        self.client
            .upsert_points(UpsertPointsBuilder::new(name, points))
            .await?;
        Ok(())
    }

    async fn search(
        &self,
        name: &str,
        query: &[f32],
        limit: usize,
        score_threshold: f32,
        filter: Option<&Filter>,
    ) -> Result<Vec<ScoredPoint>, BoxError> {
        use qdrant_client::qdrant::SearchPointsBuilder;

        let mut builder = SearchPointsBuilder::new(name, query.to_vec(), limit as u64)
            .score_threshold(score_threshold)
            .with_payload(true);
        if let Some(filter) = filter {
            builder = builder.filter(to_qdrant_filter(filter));
        }
        let response = self.client.search_points(builder).await?;
        Ok(response
            .result
            .into_iter()
            .filter_map(|p| {
                let id = p.id.as_ref().and_then(point_id_to_uuid)?;
                let payload = p
                    .payload
                    .into_iter()
                    .map(|(k, v)| (k, qdrant_value_to_json(v)))
                    .collect();
                Some(ScoredPoint {
                    id,
                    score: p.score,
                    payload,
                })
            })
            .collect())
    }

    async fn delete_by_filter(&self, name: &str, filter: &Filter) -> Result<(), BoxError> {
        use qdrant_client::qdrant::DeletePointsBuilder;
        self.client
            .delete_points(DeletePointsBuilder::new(name).points(to_qdrant_filter(filter)))
            .await?;
        Ok(())
    }
}

fn to_qdrant_filter(filter: &Filter) -> qdrant_client::qdrant::Filter {
    use qdrant_client::qdrant::{Condition, Filter as QFilter};
    let must: Vec<Condition> = filter.must.iter().map(to_qdrant_condition).collect();
    QFilter::must(must)
}

fn to_qdrant_condition(clause: &FilterClause) -> qdrant_client::qdrant::Condition {
    use qdrant_client::qdrant::{Condition, Filter as QFilter};
    match clause {
        FilterClause::MatchValue(key, value) => Condition::matches(key, value.clone()),
        FilterClause::MatchAny(key, values) => Condition::matches(key, values.clone()),
        FilterClause::Should(clauses) => {
            let should: Vec<Condition> = clauses.iter().map(to_qdrant_condition).collect();
            Condition::from(QFilter::should(should))
        }
    }
}

fn point_id_to_uuid(id: &qdrant_client::qdrant::PointId) -> Option<Uuid> {
    match &id.point_id_options {
        Some(qdrant_client::qdrant::point_id::PointIdOptions::Uuid(s)) => Uuid::parse_str(s).ok(),
        _ => None,
    }
}

fn qdrant_value_to_json(v: qdrant_client::qdrant::Value) -> Value {
    serde_json::to_value(&v).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(id: Uuid, vector: Vec<f32>, tags: &[&str]) -> VectorPoint {
        let mut payload = BTreeMap::new();
        payload.insert(
            "tags".to_string(),
            Value::Array(tags.iter().map(|t| Value::String(t.to_string())).collect()),
        );
        VectorPoint { id, vector, payload }
    }

    #[tokio::test]
    async fn in_memory_search_respects_threshold_and_filter() {
        let backend = InMemoryBackend::new();
        backend.create_collection("agents", 2).await.unwrap();
        backend
            .upsert(
                "agents",
                vec![
                    point(Uuid::new_v4(), vec![1.0, 0.0], &["weather"]),
                    point(Uuid::new_v4(), vec![0.0, 1.0], &["finance"]),
                ],
            )
            .await
            .unwrap();

        let filter = Filter::new().with(FilterClause::MatchAny(
            "tags".to_string(),
            vec!["weather".to_string()],
        ));
        let results = backend
            .search("agents", &[1.0, 0.0], 10, 0.5, Some(&filter))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].score > 0.99);
    }

    #[tokio::test]
    async fn in_memory_delete_by_filter_removes_matching_points() {
        let backend = InMemoryBackend::new();
        backend.create_collection("agents", 2).await.unwrap();
        let id = Uuid::new_v4();
        backend
            .upsert("agents", vec![point(id, vec![1.0, 0.0], &["weather"])])
            .await
            .unwrap();
        let filter = Filter::new().with(FilterClause::MatchAny(
            "tags".to_string(),
            vec!["weather".to_string()],
        ));
        backend.delete_by_filter("agents", &filter).await.unwrap();
        let results = backend
            .search("agents", &[1.0, 0.0], 10, 0.0, None)
            .await
            .unwrap();
        assert!(results.is_empty());
    }
}
