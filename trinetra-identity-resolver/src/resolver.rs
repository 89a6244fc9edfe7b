//! The per-event resolution pipeline.

use std::time::Instant;

use metrics::{counter, histogram};
use uuid::Uuid;

use trinetra_gallery::GallerySearch;
use trinetra_types::{
    unix_time_now, AlertEvent, AlertType, CameraType, InferenceEvent, MatchMethod,
    ResolvedIdentity, Severity,
};

use crate::gate::{GateDecision, SpatiotemporalGate};
use crate::metric_names;
use crate::registry::ActiveIdentityRegistry;
use trinetra_config_data::TravelMatrix;

/// Candidates requested from the gallery per event.
const TOP_K: usize = 5;
/// Registry eviction sweep cadence, in processed events.
const EVICT_EVERY: u64 = 1000;

pub struct IdentityResolver<G: GallerySearch> {
    gallery: G,
    gate: SpatiotemporalGate,
    registry: ActiveIdentityRegistry,
    cosine_threshold: f32,
    events_processed: u64,
}

impl<G: GallerySearch> IdentityResolver<G> {
    pub fn new(
        gallery: G,
        gate: SpatiotemporalGate,
        registry: ActiveIdentityRegistry,
        cosine_threshold: f32,
    ) -> Self {
        IdentityResolver {
            gallery,
            gate,
            registry,
            cosine_threshold,
            events_processed: 0,
        }
    }

    /// Swap in a freshly loaded travel matrix without restarting.
    pub fn reload_travel_matrix(&mut self, matrix: TravelMatrix) {
        self.gate.set_matrix(matrix);
    }

    pub fn registry(&self) -> &ActiveIdentityRegistry {
        &self.registry
    }

    /// Resolve one inference event to at most one customer identity.
    ///
    /// Candidates are tried in descending similarity; the first one the gate
    /// accepts wins. Gallery failures and gate rejections both fall through
    /// to an UNKNOWN result — never to a guessed identity.
    pub async fn resolve(
        &mut self,
        event: &InferenceEvent,
    ) -> (ResolvedIdentity, Option<AlertEvent>) {
        self.events_processed += 1;
        if self.events_processed % EVICT_EVERY == 0 {
            self.registry.evict_expired(unix_time_now());
        }

        // The first (highest-confidence) detection carries the identity for
        // single-person framings; the rest of the frame is not resolved.
        let (Some(embedding), Some(detection)) =
            (event.embeddings.first(), event.detections.first())
        else {
            // Nothing to resolve; still emit an UNKNOWN so downstream sees
            // the frame, but alerts never fire without a detection.
            counter!(metric_names::REID_UNKNOWNS, "camera_id" => event.camera_id.to_string())
                .increment(1);
            return (self.unknown_result(event), None);
        };

        let query_started = Instant::now();
        let search = self
            .gallery
            .search(embedding, TOP_K, self.cosine_threshold)
            .await;
        histogram!(metric_names::QDRANT_QUERY_LATENCY)
            .record(query_started.elapsed().as_secs_f64());

        let candidates = match search {
            Ok(candidates) => candidates,
            Err(e) => {
                tracing::error!("gallery search failed: {e}");
                counter!(metric_names::REID_UNKNOWNS, "camera_id" => event.camera_id.to_string())
                    .increment(1);
                let mut unknown = self.unknown_result(event);
                unknown.track_id = detection.track_id;
                unknown.bbox = detection.bbox.to_vec();
                unknown.embedding = embedding.clone();
                return (unknown, None);
            }
        };

        let mut accepted = None;
        for candidate in candidates {
            let last_seen = self
                .registry
                .get_last_seen(&candidate.customer_id, unix_time_now());
            let decision = self
                .gate
                .evaluate(&event.camera_id, event.ingest_ts, last_seen);
            match decision {
                GateDecision::Accept => {
                    accepted = Some(candidate);
                    break;
                }
                GateDecision::RejectPhysics | GateDecision::RejectTimeout => {
                    counter!(
                        metric_names::GATE_REJECTIONS,
                        "reason" => decision.reject_reason().unwrap_or("unknown")
                    )
                    .increment(1);
                }
            }
        }

        let resolved = match accepted {
            Some(candidate) => {
                self.registry.record(
                    candidate.customer_id.clone(),
                    event.camera_id.clone(),
                    event.ingest_ts,
                    embedding.clone(),
                );
                counter!(metric_names::REID_MATCHES, "camera_id" => event.camera_id.to_string())
                    .increment(1);
                ResolvedIdentity {
                    event_id: Uuid::new_v4(),
                    camera_id: event.camera_id.clone(),
                    camera_type: event.camera_type,
                    track_id: detection.track_id,
                    customer_id: Some(candidate.customer_id),
                    confidence: candidate.score,
                    match_method: MatchMethod::Ann,
                    ingest_ts: event.ingest_ts,
                    resolve_ts: unix_time_now(),
                    bbox: detection.bbox.to_vec(),
                    embedding: embedding.clone(),
                }
            }
            None => {
                counter!(metric_names::REID_UNKNOWNS, "camera_id" => event.camera_id.to_string())
                    .increment(1);
                let mut unknown = self.unknown_result(event);
                unknown.track_id = detection.track_id;
                unknown.bbox = detection.bbox.to_vec();
                unknown.embedding = embedding.clone();
                unknown
            }
        };

        let alert = self.check_alert(&resolved);
        (resolved, alert)
    }

    /// UNKNOWN result carrying the event's metadata.
    fn unknown_result(&self, event: &InferenceEvent) -> ResolvedIdentity {
        ResolvedIdentity {
            event_id: Uuid::new_v4(),
            camera_id: event.camera_id.clone(),
            camera_type: event.camera_type,
            track_id: 0,
            customer_id: None,
            confidence: 0.0,
            match_method: MatchMethod::Unknown,
            ingest_ts: event.ingest_ts,
            resolve_ts: unix_time_now(),
            bbox: Vec::new(),
            embedding: Vec::new(),
        }
    }

    /// An unknown customer at a billing counter is the one condition the
    /// downstream demands an alert for.
    fn check_alert(&self, resolved: &ResolvedIdentity) -> Option<AlertEvent> {
        if resolved.customer_id.is_none() && resolved.camera_type == CameraType::Billing {
            counter!(
                metric_names::ALERTS_EMITTED,
                "alert_type" => AlertType::UnknownAtBilling.as_str()
            )
            .increment(1);
            return Some(AlertEvent {
                alert_id: Uuid::new_v4(),
                alert_type: AlertType::UnknownAtBilling,
                camera_id: resolved.camera_id.clone(),
                customer_id: None,
                severity: Severity::Medium,
                ts: resolved.resolve_ts,
                metadata: serde_json::json!({"track_id": resolved.track_id}),
            });
        }
        None
    }
}
