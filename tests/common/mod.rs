//! Common test utilities for integration tests
//!
//! Shared fixtures and helpers used across the integration test files.

use std::collections::HashMap;
use std::sync::Arc;

use hivemind::domain::models::ResourceSpec;
use hivemind::services::session_bridge::LoopbackGateway;
use hivemind::{ControlPlane, ControlPlaneConfig};

/// Build an in-memory control plane with the loopback session gateway.
pub fn control_plane() -> Arc<ControlPlane> {
    Arc::new(ControlPlane::new(
        ControlPlaneConfig::default(),
        Arc::new(LoopbackGateway::new()),
        None,
    ))
}

/// Build a label map from literal pairs.
#[allow(dead_code)]
pub fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

/// Register a cpu/memory-only node.
#[allow(dead_code)]
pub async fn register_node(
    plane: &ControlPlane,
    node_id: &str,
    node_labels: HashMap<String, String>,
    cpu: f64,
    memory_mb: u64,
) {
    plane
        .index
        .register_node(node_id, node_labels, ResourceSpec::cpu_memory(cpu, memory_mb))
        .await;
}

/// Setup test logging
///
/// Initializes tracing subscriber for test output.
#[allow(dead_code)]
pub fn setup_test_logging() {
    use tracing_subscriber::fmt;

    let _ = fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
