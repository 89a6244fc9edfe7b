//! In-memory registry of currently-in-store identities.

use std::collections::HashMap;

use metrics::gauge;

use trinetra_types::{CameraId, CustomerId};

use crate::metric_names;

/// Last accepted sighting of one customer.
#[derive(Debug, Clone, PartialEq)]
pub struct LastSeen {
    pub camera_id: CameraId,
    pub last_seen_ts: f64,
    pub embedding: Vec<f32>,
}

/// Maps `customer_id` to the last accepted sighting, with a TTL.
///
/// Deliberately process-local: lookups are O(1) on the resolution hot path,
/// and the content is rebuilt from event replay after a restart — it is
/// never persisted. Time is passed in by the caller, so expiry is
/// deterministic under test and under event replay.
pub struct ActiveIdentityRegistry {
    entries: HashMap<CustomerId, LastSeen>,
    ttl_s: f64,
}

impl ActiveIdentityRegistry {
    pub fn new(ttl_s: f64) -> Self {
        ActiveIdentityRegistry {
            entries: HashMap::new(),
            ttl_s,
        }
    }

    /// Upsert the sighting for `customer_id`.
    pub fn record(
        &mut self,
        customer_id: CustomerId,
        camera_id: CameraId,
        ts: f64,
        embedding: Vec<f32>,
    ) {
        self.entries.insert(
            customer_id,
            LastSeen {
                camera_id,
                last_seen_ts: ts,
                embedding,
            },
        );
        gauge!(metric_names::ACTIVE_IDENTITIES).set(self.entries.len() as f64);
    }

    /// The sighting for `customer_id`, unless it has aged past the TTL.
    pub fn get_last_seen(&self, customer_id: &CustomerId, now: f64) -> Option<&LastSeen> {
        self.entries
            .get(customer_id)
            .filter(|seen| now - seen.last_seen_ts < self.ttl_s)
    }

    /// Drop every entry older than the TTL.
    pub fn evict_expired(&mut self, now: f64) {
        let cutoff = now - self.ttl_s;
        self.entries.retain(|_, seen| seen.last_seen_ts >= cutoff);
        gauge!(metric_names::ACTIVE_IDENTITIES).set(self.entries.len() as f64);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_and_lookup() {
        let mut registry = ActiveIdentityRegistry::new(3600.0);
        registry.record("alice".into(), "cam_entrance_01".into(), 100.0, vec![1.0]);
        let seen = registry.get_last_seen(&"alice".into(), 200.0).unwrap();
        assert_eq!(seen.camera_id, "cam_entrance_01".into());
        assert_eq!(seen.last_seen_ts, 100.0);
    }

    #[test]
    fn lookup_respects_ttl() {
        let mut registry = ActiveIdentityRegistry::new(3600.0);
        registry.record("alice".into(), "cam_entrance_01".into(), 100.0, vec![]);
        assert!(registry.get_last_seen(&"alice".into(), 3699.9).is_some());
        assert!(registry.get_last_seen(&"alice".into(), 3700.1).is_none());
    }

    #[test]
    fn record_upserts() {
        let mut registry = ActiveIdentityRegistry::new(3600.0);
        registry.record("alice".into(), "cam_entrance_01".into(), 100.0, vec![]);
        registry.record("alice".into(), "cam_billing_01".into(), 150.0, vec![]);
        assert_eq!(registry.len(), 1);
        let seen = registry.get_last_seen(&"alice".into(), 160.0).unwrap();
        assert_eq!(seen.camera_id, "cam_billing_01".into());
    }

    #[test]
    fn eviction_sweeps_expired_entries() {
        let mut registry = ActiveIdentityRegistry::new(100.0);
        registry.record("alice".into(), "cam_a".into(), 0.0, vec![]);
        registry.record("bob".into(), "cam_b".into(), 90.0, vec![]);
        registry.evict_expired(150.0);
        assert_eq!(registry.len(), 1);
        assert!(registry.get_last_seen(&"bob".into(), 150.0).is_some());
    }
}
