//! Semantic capability discovery: document generation, the service's
//! initialization protocol, filtered search, and the Jaccard degraded mode.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use md5::{Digest, Md5};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use uuid::{Builder, Uuid};

use accord_core::model::{AgentProfile, AgentRegistration, EmbeddingModelDyn};
use accord_core::BoxError;

use crate::backend::{Filter, FilterClause, VectorBackend, VectorPoint};

const COLLECTION_NAME: &str = "accord_agents";

struct Document {
    id: String,
    text: String,
    payload: BTreeMap<String, Value>,
}

/// Plain profile text kept for the Jaccard fallback, independent of whatever
/// vector infrastructure is or isn't configured.
#[derive(Clone)]
struct FallbackDoc {
    agent_id: String,
    text: String,
    payload: BTreeMap<String, Value>,
}

/// Semantic search over agent profiles, capabilities, and skills, degrading
/// to Jaccard string similarity when no embedding model or vector backend
/// is configured.
pub struct VectorDiscoveryService {
    embedding: Option<Arc<dyn EmbeddingModelDyn>>,
    backend: Option<Arc<dyn VectorBackend>>,
    degraded: Mutex<bool>,
    fallback: Mutex<Vec<FallbackDoc>>,
}

impl VectorDiscoveryService {
    pub fn new(
        embedding: Option<Arc<dyn EmbeddingModelDyn>>,
        backend: Option<Arc<dyn VectorBackend>>,
    ) -> Self {
        Self {
            embedding,
            backend,
            degraded: Mutex::new(false),
            fallback: Mutex::new(Vec::new()),
        }
    }

    /// Runs the initialization protocol: probes both collaborators, creates
    /// or recreates the collection to match the probed dimension, and
    /// creates payload indexes where the backend supports them. Failing to
    /// find either collaborator is not an error: the service silently
    /// drops into degraded (Jaccard) mode and still answers queries.
    pub async fn init(&self) -> Result<(), BoxError> {
        let (Some(embedding), Some(backend)) = (self.embedding.as_ref(), self.backend.as_ref())
        else {
            log::warn!("no embedding model or vector backend configured, falling back to Jaccard similarity search");
            *self.degraded.lock().await = true;
            return Ok(());
        };

        let probe = embedding.embed_query_dyn("accord capability discovery probe".to_string()).await?;
        let dim = probe.len();

        let needs_recreate = match backend.collection_dimension(COLLECTION_NAME).await? {
            Some(existing_dim) if existing_dim != dim => true,
            Some(_) => false,
            None => false,
        };
        if needs_recreate {
            backend.delete_collection(COLLECTION_NAME).await?;
        }
        if !backend.collection_exists(COLLECTION_NAME).await? || needs_recreate {
            backend.create_collection(COLLECTION_NAME, dim).await?;
        }

        if backend.supports_payload_index() {
            for field in ["agent_id", "agent_type", "organization", "developer", "tags"] {
                backend.create_payload_index(COLLECTION_NAME, field).await?;
            }
        }

        *self.degraded.lock().await = false;
        Ok(())
    }

    pub async fn is_degraded(&self) -> bool {
        *self.degraded.lock().await
    }

    /// Indexes `registration`'s profile, capability, and skill documents.
    pub async fn update_capability_embeddings(
        &self,
        registration: &AgentRegistration,
    ) -> Result<(), BoxError> {
        let documents = generate_documents(registration);

        self.fallback
            .lock()
            .await
            .retain(|d| d.agent_id != registration.agent_id);
        self.fallback.lock().await.extend(documents.iter().map(|d| FallbackDoc {
            agent_id: registration.agent_id.clone(),
            text: d.text.clone(),
            payload: d.payload.clone(),
        }));

        if self.is_degraded().await {
            return Ok(());
        }
        let (Some(embedding), Some(backend)) = (self.embedding.as_ref(), self.backend.as_ref())
        else {
            return Ok(());
        };

        let agent_filter = Filter::new().with(FilterClause::MatchValue(
            "agent_id".to_string(),
            registration.agent_id.clone(),
        ));
        backend.delete_by_filter(COLLECTION_NAME, &agent_filter).await?;

        let texts: Vec<String> = documents.iter().map(|d| d.text.clone()).collect();
        let vectors = embedding.embed_documents_dyn(texts).await?;

        let points = documents
            .into_iter()
            .zip(vectors)
            .map(|(doc, vector)| VectorPoint {
                id: doc_id_to_uuid(&doc.id),
                vector,
                payload: doc.payload,
            })
            .collect();
        backend.upsert(COLLECTION_NAME, points).await?;
        Ok(())
    }

    pub async fn clear_agent_embeddings_cache(&self, agent_id: &str) -> Result<(), BoxError> {
        self.fallback.lock().await.retain(|d| d.agent_id != agent_id);
        if let Some(backend) = self.backend.as_ref() {
            let filter = Filter::new().with(FilterClause::MatchValue(
                "agent_id".to_string(),
                agent_id.to_string(),
            ));
            backend.delete_by_filter(COLLECTION_NAME, &filter).await?;
        }
        Ok(())
    }

    /// Semantic search with metadata filter conjunction, returning
    /// `(agent_id, score)` pairs deduplicated by agent, highest score kept.
    pub async fn find_by_capability_semantic(
        &self,
        query: &str,
        limit: usize,
        threshold: f32,
        filters: &HashMap<String, Vec<String>>,
    ) -> Result<Vec<(String, f32)>, BoxError> {
        if self.is_degraded().await {
            return Ok(self.fallback_search(query, threshold, filters));
        }
        let (Some(embedding), Some(backend)) = (self.embedding.as_ref(), self.backend.as_ref())
        else {
            return Ok(self.fallback_search(query, threshold, filters));
        };

        let vector = embedding.embed_query_dyn(query.to_string()).await?;
        let filter = build_filter(filters);
        let candidates = backend
            .search(COLLECTION_NAME, &vector, limit * 3, threshold, filter.as_ref())
            .await?;

        let mut best: HashMap<String, f32> = HashMap::new();
        for point in candidates {
            let Some(agent_id) = point.payload.get("agent_id").and_then(Value::as_str) else {
                continue;
            };
            let entry = best.entry(agent_id.to_string()).or_insert(point.score);
            if point.score > *entry {
                *entry = point.score;
            }
        }
        let mut results: Vec<(String, f32)> = best.into_iter().collect();
        results.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(limit);
        Ok(results)
    }

    fn fallback_search(
        &self,
        query: &str,
        threshold: f32,
        filters: &HashMap<String, Vec<String>>,
    ) -> Vec<(String, f32)> {
        let docs = self.fallback.try_lock().map(|g| g.clone()).unwrap_or_default();
        let mut by_agent: HashMap<String, f32> = HashMap::new();
        for doc in docs {
            if !filters_match(&doc.payload, filters) {
                continue;
            }
            let score = jaccard(query, &doc.text);
            let entry = by_agent.entry(doc.agent_id).or_insert(0.0);
            if score > *entry {
                *entry = score;
            }
        }
        let mut results: Vec<(String, f32)> = by_agent
            .into_iter()
            .filter(|(_, score)| *score >= threshold)
            .collect();
        results.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        results
    }
}

fn filters_match(payload: &BTreeMap<String, Value>, filters: &HashMap<String, Vec<String>>) -> bool {
    filters.iter().all(|(key, wanted)| match payload.get(key) {
        Some(Value::Array(arr)) => arr
            .iter()
            .filter_map(Value::as_str)
            .any(|v| wanted.iter().any(|w| w == v)),
        Some(Value::String(s)) => wanted.iter().any(|w| w == s),
        _ => false,
    })
}

fn build_filter(filters: &HashMap<String, Vec<String>>) -> Option<Filter> {
    if filters.is_empty() {
        return None;
    }
    const LIST_KEYS: &[&str] = &["tags", "default_input_modes", "default_output_modes", "auth_schemes"];
    const NESTED_KEYS: &[&str] = &["default_input_modes", "default_output_modes", "auth_schemes"];

    let mut filter = Filter::new();
    for (key, values) in filters {
        if NESTED_KEYS.contains(&key.as_str()) {
            filter = filter.with(FilterClause::Should(vec![
                FilterClause::MatchAny(key.clone(), values.clone()),
                FilterClause::MatchAny(format!("agent_{key}"), values.clone()),
            ]));
        } else if LIST_KEYS.contains(&key.as_str()) {
            filter = filter.with(FilterClause::MatchAny(key.clone(), values.clone()));
        } else if let Some(first) = values.first() {
            filter = filter.with(FilterClause::MatchValue(key.clone(), first.clone()));
        }
    }
    Some(filter)
}

fn jaccard(a: &str, b: &str) -> f32 {
    let tokens = |s: &str| -> HashSet<String> { s.to_lowercase().split_whitespace().map(str::to_string).collect() };
    let a = tokens(a);
    let b = tokens(b);
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(&b).count();
    let union = a.union(&b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f32 / union as f32
    }
}

/// MD5 digest of the readable id, first 16 bytes reinterpreted with RFC 4122
/// v4 variant/version bits forced — deterministic, no registry round-trip
/// needed to map a point back to its document id.
fn doc_id_to_uuid(readable_id: &str) -> Uuid {
    let digest = Md5::digest(readable_id.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Builder::from_bytes(bytes)
        .with_version(uuid::Version::Random)
        .into_uuid()
}

fn generate_documents(registration: &AgentRegistration) -> Vec<Document> {
    let profile = &registration.profile;
    let mut documents = vec![profile_document(registration, profile)];

    for (idx, cap) in profile.capabilities.iter().enumerate() {
        let mut payload = base_payload(registration, profile);
        payload.insert("capability_name".to_string(), json!(cap.name));
        documents.push(Document {
            id: format!("{}:capability:{}:{}", registration.agent_id, idx, cap.name),
            text: format!("{} {}", cap.name, cap.description),
            payload,
        });
    }

    for (idx, skill) in profile.skills.iter().enumerate() {
        let mut payload = base_payload(registration, profile);
        payload.insert("skill_name".to_string(), json!(skill.name));
        documents.push(Document {
            id: format!("{}:skill:{}:{}", registration.agent_id, idx, skill.name),
            text: format!("{} {}", skill.name, skill.description),
            payload,
        });
    }

    documents
}

fn base_payload(registration: &AgentRegistration, profile: &AgentProfile) -> BTreeMap<String, Value> {
    let mut payload = BTreeMap::new();
    payload.insert("agent_id".to_string(), json!(registration.agent_id));
    payload.insert("agent_type".to_string(), json!(profile.agent_type));
    if let Some(org) = &profile.organization {
        payload.insert("organization".to_string(), json!(org));
    }
    if let Some(dev) = &profile.developer {
        payload.insert("developer".to_string(), json!(dev));
    }
    payload.insert("tags".to_string(), json!(profile.tags));
    payload.insert(
        "agent_default_input_modes".to_string(),
        json!(profile.default_input_modes),
    );
    payload.insert(
        "agent_default_output_modes".to_string(),
        json!(profile.default_output_modes),
    );
    payload.insert("agent_auth_schemes".to_string(), json!(profile.auth_schemes));
    payload
}

fn profile_document(registration: &AgentRegistration, profile: &AgentProfile) -> Document {
    let mut parts: Vec<String> = Vec::new();
    if let Some(v) = &profile.name {
        parts.push(v.clone());
    }
    if let Some(v) = &profile.summary {
        parts.push(v.clone());
    }
    if let Some(v) = &profile.description {
        parts.push(v.clone());
    }
    for cap in &profile.capabilities {
        parts.push(format!("- {}: {}", cap.name, cap.description));
    }
    for skill in &profile.skills {
        parts.push(format!("- {}: {}", skill.name, skill.description));
    }
    parts.extend(profile.examples.iter().cloned());
    parts.extend(profile.tags.iter().cloned());
    parts.extend(profile.default_input_modes.iter().cloned());
    parts.extend(profile.default_output_modes.iter().cloned());
    parts.extend(profile.auth_schemes.iter().cloned());

    let mut payload = base_payload(registration, profile);
    payload.insert("default_input_modes".to_string(), json!(profile.default_input_modes));
    payload.insert("default_output_modes".to_string(), json!(profile.default_output_modes));
    payload.insert("auth_schemes".to_string(), json!(profile.auth_schemes));

    Document {
        id: format!("{}_profile", registration.agent_id),
        text: parts.join(" "),
        payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use accord_core::identity::AgentIdentity;
    use accord_core::model::{AgentType, Capability, InteractionMode};
    use chrono::Utc;

    fn registration(agent_id: &str, org: &str, summary: &str) -> AgentRegistration {
        AgentRegistration {
            agent_id: agent_id.to_string(),
            profile: AgentProfile {
                agent_type: AgentType::Ai,
                interaction_modes: vec![InteractionMode::AgentToAgent],
                name: Some("Weather Forecaster".to_string()),
                summary: Some(summary.to_string()),
                description: None,
                version: None,
                organization: Some(org.to_string()),
                developer: None,
                url: None,
                capabilities: vec![Capability {
                    name: "weather_forecast".to_string(),
                    description: "forecasts for locations".to_string(),
                    input_schema: None,
                    output_schema: None,
                    version: None,
                }],
                skills: vec![],
                examples: vec![],
                tags: vec!["weather".to_string()],
                auth_schemes: vec![],
                default_input_modes: vec![],
                default_output_modes: vec![],
            },
            identity: AgentIdentity::create_key_based().unwrap(),
            payment_address: None,
            custom_metadata: BTreeMap::new(),
            registered_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn degraded_mode_exact_match_capability_search_finds_agent() {
        let service = VectorDiscoveryService::new(None, None);
        service.init().await.unwrap();
        assert!(service.is_degraded().await);

        let reg = registration("weather-1", "Weather Corp", "forecasts for locations");
        service.update_capability_embeddings(&reg).await.unwrap();

        let results = service
            .find_by_capability_semantic("predict weather conditions", 5, 0.0, &HashMap::new())
            .await
            .unwrap();
        assert!(results.iter().any(|(id, _)| id == "weather-1"));
    }

    #[tokio::test]
    async fn filtered_search_excludes_other_organizations() {
        let service = VectorDiscoveryService::new(None, None);
        service.init().await.unwrap();

        service
            .update_capability_embeddings(&registration("weather-1", "Weather Corp", "forecasts"))
            .await
            .unwrap();
        service
            .update_capability_embeddings(&registration("weather-2", "Other Inc", "forecasts"))
            .await
            .unwrap();

        let mut filters = HashMap::new();
        filters.insert("organization".to_string(), vec!["Weather Corp".to_string()]);
        let results = service
            .find_by_capability_semantic("forecasts", 5, 0.0, &filters)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "weather-1");
    }

    #[test]
    fn doc_id_to_uuid_is_deterministic() {
        assert_eq!(doc_id_to_uuid("weather-1:profile"), doc_id_to_uuid("weather-1:profile"));
        assert_ne!(doc_id_to_uuid("weather-1:profile"), doc_id_to_uuid("weather-2:profile"));
    }
}
