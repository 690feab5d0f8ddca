use anyhow::{Context, Result};
use async_trait::async_trait;
use qdrant_client::qdrant::{
    point_id::PointIdOptions, with_payload_selector::SelectorOptions, Condition, Filter,
    GetPointsBuilder, PointId, PointStruct, ScoredPoint, SearchPoints, WithPayloadSelector,
};
use qdrant_client::Qdrant;
use std::collections::HashMap;

/// A single nearest-neighbour hit from a collection search.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub point_key: String,
    pub score: f32,
    pub payload: HashMap<String, serde_json::Value>,
}

/// Adapter over the two vector collections (`code`, `intent`) spec.md §3/§4.4
/// describe. One point per `(repoId, prNumber, kind)` key, per the
/// at-most-one-point-per-collection invariant.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn upsert(
        &self,
        collection: &str,
        point_key: &str,
        vector: Vec<f32>,
        payload: HashMap<String, serde_json::Value>,
    ) -> Result<()>;

    async fn search(
        &self,
        collection: &str,
        vector: Vec<f32>,
        limit: u64,
        filter_repo_id: Option<i64>,
    ) -> Result<Vec<VectorHit>>;

    /// Retrieves a single point's vector by key, used by cluster to fetch a
    /// PR's own stored vector before searching its neighbourhood.
    async fn get_point(&self, collection: &str, point_key: &str) -> Result<Option<Vec<f32>>>;

    async fn delete_by_repo(&self, collection: &str, repo_id: i64) -> Result<()>;
}

pub struct QdrantVectorStore {
    client: Qdrant,
}

impl QdrantVectorStore {
    pub fn new(url: &str) -> Result<Self> {
        let client = Qdrant::from_url(url)
            .build()
            .context("failed to build qdrant client")?;
        Ok(Self { client })
    }

    /// Creates `code` and `intent` collections if they do not already exist.
    /// Idempotent, safe to call on every worker startup.
    pub async fn ensure_collections(&self, dim: u64, collections: &[&str]) -> Result<()> {
        for name in collections {
            let exists = self
                .client
                .collection_exists(*name)
                .await
                .with_context(|| format!("checking collection {name}"))?;
            if !exists {
                self.client
                    .create_collection(
                        qdrant_client::qdrant::CreateCollectionBuilder::new(*name)
                            .vectors_config(qdrant_client::qdrant::VectorParamsBuilder::new(
                                dim,
                                qdrant_client::qdrant::Distance::Cosine,
                            )),
                    )
                    .await
                    .with_context(|| format!("creating collection {name}"))?;
            }
        }
        Ok(())
    }
}

fn qdrant_value_to_json(v: &qdrant_client::qdrant::Value) -> serde_json::Value {
    use qdrant_client::qdrant::value::Kind;
    match &v.kind {
        Some(Kind::StringValue(s)) => serde_json::Value::String(s.clone()),
        Some(Kind::IntegerValue(i)) => serde_json::json!(i),
        Some(Kind::DoubleValue(d)) => serde_json::json!(d),
        Some(Kind::BoolValue(b)) => serde_json::Value::Bool(*b),
        Some(Kind::NullValue(_)) | None => serde_json::Value::Null,
        Some(Kind::ListValue(list)) => {
            serde_json::Value::Array(list.values.iter().map(qdrant_value_to_json).collect())
        }
        Some(Kind::StructValue(s)) => serde_json::Value::Object(
            s.fields
                .iter()
                .map(|(k, v)| (k.clone(), qdrant_value_to_json(v)))
                .collect(),
        ),
    }
}

fn payload_to_json_map(
    payload: &HashMap<String, qdrant_client::qdrant::Value>,
) -> HashMap<String, serde_json::Value> {
    payload
        .iter()
        .map(|(k, v)| (k.clone(), qdrant_value_to_json(v)))
        .collect()
}

fn point_key_of(point: &ScoredPoint) -> String {
    match point.id.as_ref().and_then(|id| id.point_id_options.as_ref()) {
        Some(PointIdOptions::Uuid(s)) => s.clone(),
        Some(PointIdOptions::Num(n)) => n.to_string(),
        None => String::new(),
    }
}

#[async_trait]
impl VectorStore for QdrantVectorStore {
    async fn upsert(
        &self,
        collection: &str,
        point_key: &str,
        vector: Vec<f32>,
        payload: HashMap<String, serde_json::Value>,
    ) -> Result<()> {
        let mut qpayload: HashMap<String, qdrant_client::qdrant::Value> = HashMap::new();
        for (k, v) in payload {
            if let Some(s) = v.as_str() {
                qpayload.insert(k, s.into());
            } else if let Some(n) = v.as_i64() {
                qpayload.insert(k, n.into());
            } else if let Some(f) = v.as_f64() {
                qpayload.insert(k, f.into());
            }
        }
        let point = PointStruct::new(
            PointId::from(point_key.to_string()),
            vector,
            qpayload,
        );
        self.client
            .upsert_points(qdrant_client::qdrant::UpsertPointsBuilder::new(
                collection,
                vec![point],
            ))
            .await
            .with_context(|| format!("upsert into {collection} for point {point_key}"))?;
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        vector: Vec<f32>,
        limit: u64,
        filter_repo_id: Option<i64>,
    ) -> Result<Vec<VectorHit>> {
        let filter = filter_repo_id.map(|repo_id| Filter {
            must: vec![Condition::matches("repo_id", repo_id)],
            ..Default::default()
        });

        let response = self
            .client
            .search_points(SearchPoints {
                collection_name: collection.to_string(),
                vector,
                limit,
                filter,
                with_payload: Some(WithPayloadSelector {
                    selector_options: Some(SelectorOptions::Enable(true)),
                }),
                ..Default::default()
            })
            .await
            .with_context(|| format!("search in {collection}"))?;

        Ok(response
            .result
            .iter()
            .map(|p| VectorHit {
                point_key: point_key_of(p),
                score: p.score,
                payload: payload_to_json_map(&p.payload),
            })
            .collect())
    }

    async fn get_point(&self, collection: &str, point_key: &str) -> Result<Option<Vec<f32>>> {
        let response = self
            .client
            .get_points(
                GetPointsBuilder::new(collection, vec![PointId::from(point_key.to_string())])
                    .with_vectors(true),
            )
            .await
            .with_context(|| format!("get_point in {collection} for {point_key}"))?;

        Ok(response.result.into_iter().next().and_then(|p| {
            p.vectors.and_then(|v| match v.vectors_options {
                Some(qdrant_client::qdrant::vectors::VectorsOptions::Vector(dense)) => {
                    Some(dense.data)
                }
                _ => None,
            })
        }))
    }

    async fn delete_by_repo(&self, collection: &str, repo_id: i64) -> Result<()> {
        let filter = Filter {
            must: vec![Condition::matches("repo_id", repo_id)],
            ..Default::default()
        };
        self.client
            .delete_points(qdrant_client::qdrant::DeletePointsBuilder::new(collection).points(filter))
            .await
            .with_context(|| format!("delete_by_repo in {collection} for repo {repo_id}"))?;
        Ok(())
    }
}

/// In-memory fake implementing [`VectorStore`] for tests, using the same
/// trait-object-polymorphism pattern as the pluggable provider backends.
#[derive(Default)]
pub struct InMemoryVectorStore {
    points: std::sync::Mutex<HashMap<String, HashMap<String, (Vec<f32>, HashMap<String, serde_json::Value>)>>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm_a == 0.0 || norm_b == 0.0 {
            0.0
        } else {
            dot / (norm_a * norm_b)
        }
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert(
        &self,
        collection: &str,
        point_key: &str,
        vector: Vec<f32>,
        payload: HashMap<String, serde_json::Value>,
    ) -> Result<()> {
        let mut points = self.points.lock().unwrap_or_else(|e| e.into_inner());
        points
            .entry(collection.to_string())
            .or_default()
            .insert(point_key.to_string(), (vector, payload));
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        vector: Vec<f32>,
        limit: u64,
        filter_repo_id: Option<i64>,
    ) -> Result<Vec<VectorHit>> {
        let points = self.points.lock().unwrap_or_else(|e| e.into_inner());
        let Some(in_collection) = points.get(collection) else {
            return Ok(Vec::new());
        };

        let mut hits: Vec<VectorHit> = in_collection
            .iter()
            .filter(|(_, (_, payload))| match filter_repo_id {
                Some(repo_id) => payload
                    .get("repo_id")
                    .and_then(|v| v.as_i64())
                    .map(|v| v == repo_id)
                    .unwrap_or(false),
                None => true,
            })
            .map(|(key, (v, payload))| VectorHit {
                point_key: key.clone(),
                score: Self::cosine(&vector, v),
                payload: payload.clone(),
            })
            .collect();

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit as usize);
        Ok(hits)
    }

    async fn get_point(&self, collection: &str, point_key: &str) -> Result<Option<Vec<f32>>> {
        let points = self.points.lock().unwrap_or_else(|e| e.into_inner());
        Ok(points
            .get(collection)
            .and_then(|in_collection| in_collection.get(point_key))
            .map(|(vector, _)| vector.clone()))
    }

    async fn delete_by_repo(&self, collection: &str, repo_id: i64) -> Result<()> {
        let mut points = self.points.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(in_collection) = points.get_mut(collection) {
            in_collection.retain(|_, (_, payload)| {
                payload
                    .get("repo_id")
                    .and_then(|v| v.as_i64())
                    .map(|v| v != repo_id)
                    .unwrap_or(true)
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_store_returns_closest_first() {
        let store = InMemoryVectorStore::new();
        let mut payload_a = HashMap::new();
        payload_a.insert("repo_id".to_string(), serde_json::json!(1));
        let mut payload_b = payload_a.clone();

        store
            .upsert("code", "1-1-code", vec![1.0, 0.0], payload_a)
            .await
            .unwrap();
        store
            .upsert("code", "1-2-code", vec![0.0, 1.0], {
                payload_b.insert("repo_id".to_string(), serde_json::json!(1));
                payload_b
            })
            .await
            .unwrap();

        let hits = store.search("code", vec![1.0, 0.0], 2, Some(1)).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].point_key, "1-1-code");
    }

    #[tokio::test]
    async fn get_point_returns_stored_vector() {
        let store = InMemoryVectorStore::new();
        store
            .upsert("code", "1-1-code", vec![1.0, 2.0], HashMap::new())
            .await
            .unwrap();

        let found = store.get_point("code", "1-1-code").await.unwrap();
        assert_eq!(found, Some(vec![1.0, 2.0]));
        assert_eq!(store.get_point("code", "missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_by_repo_removes_only_that_repos_points() {
        let store = InMemoryVectorStore::new();
        let mut p1 = HashMap::new();
        p1.insert("repo_id".to_string(), serde_json::json!(1));
        let mut p2 = HashMap::new();
        p2.insert("repo_id".to_string(), serde_json::json!(2));

        store.upsert("code", "1-1-code", vec![1.0, 0.0], p1).await.unwrap();
        store.upsert("code", "2-1-code", vec![0.0, 1.0], p2).await.unwrap();

        store.delete_by_repo("code", 1).await.unwrap();
        let hits = store.search("code", vec![1.0, 0.0], 10, None).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].point_key, "2-1-code");
    }
}
