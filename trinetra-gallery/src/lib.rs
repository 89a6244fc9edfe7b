//! Face-embedding gallery.
//!
//! A Qdrant collection of 512-dim L2-normalized vectors under cosine
//! distance, HNSW-indexed and held in memory. Each point's payload carries
//! the enrolled `customer_id` (and optionally a `vip_tier`). The identity
//! resolver only searches; enrollment is an external concern, but the upsert
//! call lives here because tests and bootstrap tooling need it.

use qdrant_client::qdrant::{
    value::Kind, CreateCollectionBuilder, Distance, HnswConfigDiffBuilder, PointStruct,
    SearchPointsBuilder, UpsertPointsBuilder, VectorParamsBuilder,
};
use qdrant_client::{Payload, Qdrant};
use uuid::Uuid;

use trinetra_types::{unix_time_now, CustomerId, EMBEDDING_DIM};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("qdrant error: {source}")]
    Qdrant {
        #[from]
        source: qdrant_client::QdrantError,
    },
}

type Result<T> = std::result::Result<T, Error>;

/// One ANN search hit, in descending score order.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub customer_id: CustomerId,
    /// Cosine similarity to the query vector.
    pub score: f32,
}

/// The ANN lookup the identity resolver performs.
///
/// A trait so resolver logic can be exercised against an in-memory gallery.
#[allow(async_fn_in_trait)]
pub trait GallerySearch {
    /// Top-`limit` neighbors with score ≥ `score_threshold`, best first.
    async fn search(
        &self,
        embedding: &[f32],
        limit: usize,
        score_threshold: f32,
    ) -> Result<Vec<Neighbor>>;
}

pub struct Gallery {
    client: Qdrant,
    collection: String,
}

impl Gallery {
    pub fn connect(url: &str, api_key: Option<String>, collection: String) -> Result<Self> {
        let client = Qdrant::from_url(url).api_key(api_key).build()?;
        Ok(Gallery { client, collection })
    }

    /// Create the collection if it does not exist yet.
    ///
    /// 512-dim cosine vectors, HNSW `m=16, ef_construct=200,
    /// full_scan_threshold=10000`, kept in memory for sub-millisecond search.
    pub async fn ensure_collection(&self) -> Result<()> {
        if self.client.collection_exists(&self.collection).await? {
            tracing::info!("gallery collection \"{}\" already exists", self.collection);
            return Ok(());
        }
        self.client
            .create_collection(
                CreateCollectionBuilder::new(&self.collection)
                    .vectors_config(VectorParamsBuilder::new(
                        EMBEDDING_DIM as u64,
                        Distance::Cosine,
                    ))
                    .hnsw_config(
                        HnswConfigDiffBuilder::default()
                            .m(16)
                            .ef_construct(200)
                            .full_scan_threshold(10_000)
                            .on_disk(false),
                    ),
            )
            .await?;
        tracing::info!("created gallery collection \"{}\"", self.collection);
        Ok(())
    }

    /// Enroll (or refresh) one customer's embedding.
    ///
    /// The point id is derived from the customer id, so re-enrollment
    /// replaces the previous vector instead of accumulating duplicates.
    pub async fn enroll(
        &self,
        customer_id: &CustomerId,
        embedding: Vec<f32>,
        vip_tier: Option<&str>,
    ) -> Result<()> {
        let point_id = Uuid::new_v5(&Uuid::NAMESPACE_OID, customer_id.as_str().as_bytes());
        let mut payload = serde_json::json!({
            "customer_id": customer_id.as_str(),
            "enrollment_ts": unix_time_now(),
        });
        if let Some(tier) = vip_tier {
            payload["vip_tier"] = serde_json::Value::String(tier.to_string());
        }
        let payload = Payload::try_from(payload).expect("payload is a JSON object");
        let point = PointStruct::new(point_id.to_string(), embedding, payload);
        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection, vec![point]).wait(true))
            .await?;
        Ok(())
    }
}

impl GallerySearch for Gallery {
    async fn search(
        &self,
        embedding: &[f32],
        limit: usize,
        score_threshold: f32,
    ) -> Result<Vec<Neighbor>> {
        let response = self
            .client
            .search_points(
                SearchPointsBuilder::new(&self.collection, embedding.to_vec(), limit as u64)
                    .score_threshold(score_threshold)
                    .with_payload(true),
            )
            .await?;

        let mut neighbors = Vec::with_capacity(response.result.len());
        for point in response.result {
            let customer_id = point.payload.get("customer_id").and_then(|v| {
                match v.kind.as_ref() {
                    Some(Kind::StringValue(s)) => Some(s.clone()),
                    _ => None,
                }
            });
            match customer_id {
                Some(id) => neighbors.push(Neighbor {
                    customer_id: CustomerId::new(id),
                    score: point.score,
                }),
                None => {
                    tracing::warn!("gallery point without customer_id payload; skipping");
                }
            }
        }
        Ok(neighbors)
    }
}
