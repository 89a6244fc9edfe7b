//! Management endpoints: `GET /health` and `GET /cameras`.

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use parking_lot::Mutex;

/// Names of the currently running per-camera activities.
///
/// Readers and publishers register on start; the guard deregisters when the
/// activity ends, so `/cameras` reflects what is actually alive.
#[derive(Default)]
pub struct TaskRegistry {
    names: Mutex<BTreeSet<String>>,
}

impl TaskRegistry {
    pub fn register(self: &Arc<Self>, name: String) -> TaskGuard {
        self.names.lock().insert(name.clone());
        TaskGuard {
            registry: self.clone(),
            name,
        }
    }

    pub fn active(&self) -> Vec<String> {
        self.names.lock().iter().cloned().collect()
    }
}

pub struct TaskGuard {
    registry: Arc<TaskRegistry>,
    name: String,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.registry.names.lock().remove(&self.name);
    }
}

pub fn router(registry: Arc<TaskRegistry>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/cameras", get(cameras))
        .with_state(registry)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok", "service": "stream-ingestor"}))
}

async fn cameras(State(registry): State<Arc<TaskRegistry>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({"active_tasks": registry.active()}))
}

#[test]
fn test_registry_tracks_guard_lifetime() {
    let registry = Arc::new(TaskRegistry::default());
    let guard = registry.register("reader-cam_x".to_string());
    let _guard2 = registry.register("publisher-cam_x".to_string());
    assert_eq!(
        registry.active(),
        vec!["publisher-cam_x".to_string(), "reader-cam_x".to_string()]
    );
    drop(guard);
    assert_eq!(registry.active(), vec!["publisher-cam_x".to_string()]);
}
