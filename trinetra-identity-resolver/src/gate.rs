//! Spatiotemporal gating of candidate identity matches.
//!
//! If a person was last seen at the entrance two seconds ago, they cannot be
//! at a billing counter fifty meters away now; an embedding match that says
//! otherwise is a false positive and is rejected. A false accept here causes
//! wrong billing attribution (hard error); a false reject merely yields
//! UNKNOWN (soft error), so the gate is deliberately conservative.

use trinetra_config_data::TravelMatrix;
use trinetra_types::CameraId;

use crate::registry::LastSeen;

/// Outcome of gating one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Accept,
    /// Transition faster than the minimum travel time between the cameras.
    RejectPhysics,
    /// Sighting too stale to gate against. The current rule set resolves
    /// stale sightings as re-entries (accept), so this is only produced by
    /// deployments overriding the decision table; the resolver handles it.
    RejectTimeout,
}

impl GateDecision {
    /// Label for the rejection-reason metric.
    pub fn reject_reason(&self) -> Option<&'static str> {
        match self {
            GateDecision::Accept => None,
            GateDecision::RejectPhysics => Some("physics"),
            GateDecision::RejectTimeout => Some("timeout"),
        }
    }
}

pub struct SpatiotemporalGate {
    matrix: TravelMatrix,
    gate_window_s: f64,
}

impl SpatiotemporalGate {
    pub fn new(matrix: TravelMatrix, gate_window_s: f64) -> Self {
        SpatiotemporalGate {
            matrix,
            gate_window_s,
        }
    }

    /// Replace the travel matrix (configuration reload without restart).
    pub fn set_matrix(&mut self, matrix: TravelMatrix) {
        self.matrix = matrix;
    }

    /// Decide whether a candidate's transition to `current_camera` at
    /// `current_ts` is physically plausible. First matching rule wins:
    ///
    /// 1. never seen → accept (first sighting)
    /// 2. same camera → accept (no travel)
    /// 3. elapsed beyond the gate window → accept (assumed re-entry)
    /// 4. elapsed below the minimum travel time → reject
    /// 5. otherwise → accept
    pub fn evaluate(
        &self,
        current_camera: &CameraId,
        current_ts: f64,
        last_seen: Option<&LastSeen>,
    ) -> GateDecision {
        let Some(last_seen) = last_seen else {
            return GateDecision::Accept;
        };

        if last_seen.camera_id == *current_camera {
            return GateDecision::Accept;
        }

        let elapsed = current_ts - last_seen.last_seen_ts;
        if elapsed > self.gate_window_s {
            return GateDecision::Accept;
        }

        let min_travel = self.matrix.min_travel(&last_seen.camera_id, current_camera);
        if elapsed < min_travel {
            tracing::debug!(
                "physics gate rejected transition {}→{} in {elapsed:.1}s (min {min_travel:.1}s)",
                last_seen.camera_id,
                current_camera,
            );
            return GateDecision::RejectPhysics;
        }

        GateDecision::Accept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn matrix() -> TravelMatrix {
        let mut entries = BTreeMap::new();
        let mut row = BTreeMap::new();
        row.insert("cam_billing_01".into(), 10.0);
        entries.insert("cam_entrance_01".into(), row);
        TravelMatrix::new(entries)
    }

    fn seen_at(camera: &str, ts: f64) -> LastSeen {
        LastSeen {
            camera_id: camera.into(),
            last_seen_ts: ts,
            embedding: vec![],
        }
    }

    #[test]
    fn first_sighting_accepts() {
        let gate = SpatiotemporalGate::new(matrix(), 3600.0);
        assert_eq!(
            gate.evaluate(&"cam_entrance_01".into(), 100.0, None),
            GateDecision::Accept
        );
    }

    #[test]
    fn same_camera_accepts_regardless_of_elapsed() {
        let gate = SpatiotemporalGate::new(matrix(), 3600.0);
        let seen = seen_at("cam_entrance_01", 100.0);
        assert_eq!(
            gate.evaluate(&"cam_entrance_01".into(), 100.5, Some(&seen)),
            GateDecision::Accept
        );
    }

    #[test]
    fn impossible_transition_rejects() {
        let gate = SpatiotemporalGate::new(matrix(), 3600.0);
        let seen = seen_at("cam_entrance_01", 100.0);
        assert_eq!(
            gate.evaluate(&"cam_billing_01".into(), 103.0, Some(&seen)),
            GateDecision::RejectPhysics
        );
    }

    #[test]
    fn plausible_transition_accepts() {
        let gate = SpatiotemporalGate::new(matrix(), 3600.0);
        let seen = seen_at("cam_entrance_01", 100.0);
        assert_eq!(
            gate.evaluate(&"cam_billing_01".into(), 112.0, Some(&seen)),
            GateDecision::Accept
        );
    }

    #[test]
    fn elapsed_exactly_min_travel_accepts() {
        let gate = SpatiotemporalGate::new(matrix(), 3600.0);
        let seen = seen_at("cam_entrance_01", 100.0);
        assert_eq!(
            gate.evaluate(&"cam_billing_01".into(), 110.0, Some(&seen)),
            GateDecision::Accept
        );
    }

    #[test]
    fn beyond_gate_window_accepts_as_reentry() {
        let gate = SpatiotemporalGate::new(matrix(), 3600.0);
        let seen = seen_at("cam_entrance_01", 100.0);
        assert_eq!(
            gate.evaluate(&"cam_billing_01".into(), 100.0 + 3700.0, Some(&seen)),
            GateDecision::Accept
        );
    }

    #[test]
    fn elapsed_exactly_gate_window_still_gates_physics() {
        // At exactly the window boundary the re-entry rule does not fire;
        // the physics check still applies (and passes, 3600 > 10).
        let gate = SpatiotemporalGate::new(matrix(), 3600.0);
        let seen = seen_at("cam_entrance_01", 100.0);
        assert_eq!(
            gate.evaluate(&"cam_billing_01".into(), 3700.0, Some(&seen)),
            GateDecision::Accept
        );
    }

    #[test]
    fn unknown_camera_pair_uses_default_travel_time() {
        let gate = SpatiotemporalGate::new(matrix(), 3600.0);
        let seen = seen_at("cam_vehicle_01", 100.0);
        // 2.0 s elapsed < 3.0 s default minimum.
        assert_eq!(
            gate.evaluate(&"cam_tracking_01".into(), 102.0, Some(&seen)),
            GateDecision::RejectPhysics
        );
        assert_eq!(
            gate.evaluate(&"cam_tracking_01".into(), 103.0, Some(&seen)),
            GateDecision::Accept
        );
    }

    #[test]
    fn out_of_order_arrival_rejects() {
        // A detection timestamped before the last sighting has negative
        // elapsed time, which can never satisfy the minimum travel time.
        let gate = SpatiotemporalGate::new(matrix(), 3600.0);
        let seen = seen_at("cam_entrance_01", 100.0);
        assert_eq!(
            gate.evaluate(&"cam_billing_01".into(), 95.0, Some(&seen)),
            GateDecision::RejectPhysics
        );
    }

    #[test]
    fn reject_reasons_label_the_metric() {
        assert_eq!(GateDecision::Accept.reject_reason(), None);
        assert_eq!(GateDecision::RejectPhysics.reject_reason(), Some("physics"));
        assert_eq!(GateDecision::RejectTimeout.reject_reason(), Some("timeout"));
    }
}
