//! Identity resolver.
//!
//! Consumes inference events, looks up the face-embedding gallery, applies
//! the spatiotemporal gate to each candidate in score order, and publishes a
//! resolved identity (possibly UNKNOWN) plus any alert the downstream
//! semantics demand. The resolver fails open on identity: it never
//! substitutes a probable-but-ungated match for UNKNOWN.

pub mod gate;
pub mod registry;
pub mod resolver;

/// Metric names exported by this service.
pub mod metric_names {
    pub const REID_LATENCY: &str = "trinetra_reid_latency_seconds";
    pub const QDRANT_QUERY_LATENCY: &str = "trinetra_qdrant_query_latency_seconds";
    pub const REID_MATCHES: &str = "trinetra_reid_matches_total";
    pub const REID_UNKNOWNS: &str = "trinetra_reid_unknowns_total";
    pub const GATE_REJECTIONS: &str = "trinetra_spatiotemporal_gate_rejections_total";
    pub const ALERTS_EMITTED: &str = "trinetra_alerts_total";
    pub const ACTIVE_IDENTITIES: &str = "trinetra_active_identities";
}
