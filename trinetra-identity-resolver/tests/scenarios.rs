//! End-to-end resolution scenarios against an in-memory gallery.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use trinetra_config_data::TravelMatrix;
use trinetra_gallery::{GallerySearch, Neighbor};
use trinetra_identity_resolver::gate::SpatiotemporalGate;
use trinetra_identity_resolver::registry::ActiveIdentityRegistry;
use trinetra_identity_resolver::resolver::IdentityResolver;
use trinetra_types::{
    unix_time_now, AlertType, CameraType, CustomerId, Detection, InferenceEvent, MatchMethod,
    Severity, EMBEDDING_DIM, PERSON_CLASS_ID,
};

const COSINE_THRESHOLD: f32 = 0.72;

/// Gallery stand-in with the same contract as the Qdrant-backed one:
/// descending-score order and a server-side score threshold.
struct MemoryGallery {
    entries: Vec<(CustomerId, Vec<f32>)>,
}

impl MemoryGallery {
    fn new() -> Self {
        MemoryGallery {
            entries: Vec::new(),
        }
    }

    fn enroll(&mut self, customer_id: &str, embedding: Vec<f32>) {
        self.entries
            .push((CustomerId::new(customer_id.to_string()), embedding));
    }
}

impl GallerySearch for MemoryGallery {
    async fn search(
        &self,
        embedding: &[f32],
        limit: usize,
        score_threshold: f32,
    ) -> Result<Vec<Neighbor>, trinetra_gallery::Error> {
        let mut neighbors: Vec<Neighbor> = self
            .entries
            .iter()
            .map(|(customer_id, enrolled)| Neighbor {
                customer_id: customer_id.clone(),
                score: cosine(embedding, enrolled),
            })
            .filter(|n| n.score >= score_threshold)
            .collect();
        neighbors.sort_by(|a, b| b.score.total_cmp(&a.score));
        neighbors.truncate(limit);
        Ok(neighbors)
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    dot / (na * nb).max(1e-8)
}

fn unit_embedding(seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    let v: Vec<f32> = (0..EMBEDDING_DIM)
        .map(|_| rng.random_range(-1.0f32..1.0))
        .collect();
    normalize(v)
}

fn normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    for x in &mut v {
        *x /= norm;
    }
    v
}

/// The enrolled embedding plus sensor noise; cosine similarity to the clean
/// vector stays around 0.95.
fn noisy(embedding: &[f32], seed: u64) -> Vec<f32> {
    let noise = unit_embedding(seed);
    normalize(
        embedding
            .iter()
            .zip(&noise)
            .map(|(e, n)| e + 0.3 * n)
            .collect(),
    )
}

fn event(camera_id: &str, camera_type: CameraType, ingest_ts: f64, embedding: Vec<f32>) -> InferenceEvent {
    InferenceEvent {
        camera_id: camera_id.into(),
        camera_type,
        ingest_ts,
        worker_ts: ingest_ts + 0.01,
        detections: vec![Detection {
            track_id: 0,
            bbox: [0.2, 0.1, 0.8, 0.9],
            confidence: 0.9,
            class_id: PERSON_CLASS_ID,
        }],
        embeddings: vec![embedding],
    }
}

fn store_matrix() -> TravelMatrix {
    let mut entries = BTreeMap::new();
    let mut entrance = BTreeMap::new();
    entrance.insert("cam_billing_01".into(), 10.0);
    entries.insert("cam_entrance_01".into(), entrance);
    let mut billing = BTreeMap::new();
    billing.insert("cam_entrance_01".into(), 10.0);
    entries.insert("cam_billing_01".into(), billing);
    TravelMatrix::new(entries)
}

fn resolver_with(gallery: MemoryGallery) -> IdentityResolver<MemoryGallery> {
    IdentityResolver::new(
        gallery,
        SpatiotemporalGate::new(store_matrix(), 3600.0),
        ActiveIdentityRegistry::new(3600.0),
        COSINE_THRESHOLD,
    )
}

#[tokio::test]
async fn happy_path_matches_enrolled_customer() {
    let alice = unit_embedding(1);
    let mut gallery = MemoryGallery::new();
    gallery.enroll("alice", alice.clone());
    let mut resolver = resolver_with(gallery);

    let t0 = unix_time_now();
    let (resolved, alert) = resolver
        .resolve(&event("cam_entrance_01", CameraType::Entrance, t0, noisy(&alice, 99)))
        .await;

    assert_eq!(resolved.customer_id, Some("alice".into()));
    assert_eq!(resolved.match_method, MatchMethod::Ann);
    assert!(resolved.confidence >= 0.9);
    assert!(resolved.resolve_ts >= resolved.ingest_ts);
    assert!(alert.is_none());
    assert_eq!(resolver.registry().len(), 1);
}

#[tokio::test]
async fn physically_impossible_transition_resolves_unknown() {
    let alice = unit_embedding(1);
    let mut gallery = MemoryGallery::new();
    gallery.enroll("alice", alice.clone());
    let mut resolver = resolver_with(gallery);

    let t0 = unix_time_now();
    resolver
        .resolve(&event("cam_entrance_01", CameraType::Entrance, t0, noisy(&alice, 2)))
        .await;

    // Entrance → billing in 3 s, against a 10 s minimum.
    let (resolved, alert) = resolver
        .resolve(&event("cam_billing_01", CameraType::Billing, t0 + 3.0, noisy(&alice, 3)))
        .await;

    assert_eq!(resolved.customer_id, None);
    assert_eq!(resolved.match_method, MatchMethod::Unknown);
    let alert = alert.expect("unknown at billing must alert");
    assert_eq!(alert.alert_type, AlertType::UnknownAtBilling);
    assert_eq!(alert.severity, Severity::Medium);
    assert_eq!(alert.metadata["track_id"], 0);
}

#[tokio::test]
async fn plausible_transition_is_accepted() {
    let alice = unit_embedding(1);
    let mut gallery = MemoryGallery::new();
    gallery.enroll("alice", alice.clone());
    let mut resolver = resolver_with(gallery);

    let t0 = unix_time_now();
    resolver
        .resolve(&event("cam_entrance_01", CameraType::Entrance, t0, noisy(&alice, 2)))
        .await;

    // Same route, 12 s later: beyond the 10 s minimum.
    let (resolved, alert) = resolver
        .resolve(&event("cam_billing_01", CameraType::Billing, t0 + 12.0, noisy(&alice, 3)))
        .await;

    assert_eq!(resolved.customer_id, Some("alice".into()));
    assert!(alert.is_none());
}

#[tokio::test]
async fn reentry_after_gate_window_is_accepted() {
    let alice = unit_embedding(1);
    let mut gallery = MemoryGallery::new();
    gallery.enroll("alice", alice.clone());
    let mut resolver = resolver_with(gallery);

    let t0 = unix_time_now();
    resolver
        .resolve(&event("cam_entrance_01", CameraType::Entrance, t0, noisy(&alice, 2)))
        .await;

    let (resolved, _) = resolver
        .resolve(&event(
            "cam_entrance_01",
            CameraType::Entrance,
            t0 + 3700.0,
            noisy(&alice, 3),
        ))
        .await;

    assert_eq!(resolved.customer_id, Some("alice".into()));
    assert_eq!(resolver.registry().len(), 1);
}

#[tokio::test]
async fn stranger_at_billing_raises_alert() {
    let alice = unit_embedding(1);
    let mut gallery = MemoryGallery::new();
    gallery.enroll("alice", alice);
    let mut resolver = resolver_with(gallery);

    // An embedding unrelated to anything enrolled: no neighbor clears the
    // threshold.
    let (resolved, alert) = resolver
        .resolve(&event(
            "cam_billing_01",
            CameraType::Billing,
            unix_time_now(),
            unit_embedding(777),
        ))
        .await;

    assert_eq!(resolved.customer_id, None);
    assert_eq!(resolved.match_method, MatchMethod::Unknown);
    assert_eq!(resolved.confidence, 0.0);
    let alert = alert.expect("alert expected");
    assert_eq!(alert.alert_type, AlertType::UnknownAtBilling);
}

#[tokio::test]
async fn empty_event_resolves_unknown_without_alert() {
    let mut resolver = resolver_with(MemoryGallery::new());
    let mut no_people = event(
        "cam_billing_01",
        CameraType::Billing,
        unix_time_now(),
        vec![],
    );
    no_people.detections.clear();
    no_people.embeddings.clear();

    let (resolved, alert) = resolver.resolve(&no_people).await;
    assert_eq!(resolved.customer_id, None);
    assert!(resolved.bbox.is_empty());
    assert!(alert.is_none(), "empty events never alert");
}

#[tokio::test]
async fn matched_confidence_always_clears_threshold() {
    let alice = unit_embedding(1);
    let mut gallery = MemoryGallery::new();
    gallery.enroll("alice", alice.clone());
    let mut resolver = resolver_with(gallery);

    let t0 = unix_time_now();
    for seed in 0..20 {
        let (resolved, _) = resolver
            .resolve(&event(
                "cam_entrance_01",
                CameraType::Entrance,
                t0 + seed as f64,
                noisy(&alice, seed),
            ))
            .await;
        if resolved.customer_id.is_some() {
            assert!(resolved.confidence >= COSINE_THRESHOLD);
        }
    }
}

#[tokio::test]
async fn resolution_is_idempotent_for_identical_input() {
    let alice = unit_embedding(1);
    let probe = noisy(&alice, 5);
    let t0 = unix_time_now();
    let probe_event = event("cam_entrance_01", CameraType::Entrance, t0, probe);

    for _ in 0..2 {
        let mut gallery = MemoryGallery::new();
        gallery.enroll("alice", alice.clone());
        let mut resolver = resolver_with(gallery);
        let (resolved, _) = resolver.resolve(&probe_event).await;
        assert_eq!(resolved.customer_id, Some("alice".into()));
    }
}

#[tokio::test]
async fn gate_skips_to_next_plausible_candidate() {
    // Two enrollees with near-identical embeddings: "alice" is pinned at the
    // entrance moments ago, so the gate rejects her at billing and the
    // resolver falls through to "alice_twin".
    let base = unit_embedding(1);
    let twin = noisy(&base, 40);
    let mut gallery = MemoryGallery::new();
    gallery.enroll("alice", base.clone());
    gallery.enroll("alice_twin", twin);
    let mut resolver = resolver_with(gallery);

    let t0 = unix_time_now();
    let (first, _) = resolver
        .resolve(&event("cam_entrance_01", CameraType::Entrance, t0, base.clone()))
        .await;
    assert_eq!(first.customer_id, Some("alice".into()));

    let (resolved, _) = resolver
        .resolve(&event("cam_billing_01", CameraType::Billing, t0 + 3.0, base))
        .await;
    assert_eq!(resolved.customer_id, Some("alice_twin".into()));
    assert_eq!(resolved.match_method, MatchMethod::Ann);
}
