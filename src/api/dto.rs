//! Data Transfer Objects
//!
//! Request and response types for the API endpoints.
//! Query strings use the camelCase names profiling agents send.

use serde::{Deserialize, Serialize};

use crate::storage::tree::{Node, Tree};
use crate::storage::StorageStats;

// ============================================
// INGEST DTOs
// ============================================

/// `POST /ingest` query string
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestParams {
    /// Series key, e.g. `app.cpu{env=prod}`
    pub name: String,
    /// Start of the sampled interval (unix seconds), defaults to `until - 10`
    #[serde(default)]
    pub from: Option<String>,
    /// End of the sampled interval (unix seconds), defaults to now
    #[serde(default)]
    pub until: Option<String>,
    #[serde(default)]
    pub spy_name: Option<String>,
    #[serde(default)]
    pub sample_rate: Option<u32>,
}

// ============================================
// RENDER DTOs
// ============================================

/// `GET /render` query string
#[derive(Debug, Deserialize)]
pub struct RenderParams {
    /// Series key
    pub query: String,
    /// Window start: unix seconds, RFC 3339, `now` or `now-<n><unit>`
    #[serde(default = "default_from")]
    pub from: String,
    #[serde(default = "default_until")]
    pub until: String,
    /// `json` (default) or `collapsed`
    #[serde(default = "default_format")]
    pub format: String,
}

fn default_from() -> String {
    "now-1h".to_string()
}

fn default_until() -> String {
    "now".to_string()
}

fn default_format() -> String {
    "json".to_string()
}

/// One frame of a rendered flame graph
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlameNode {
    pub name: String,
    /// Samples in this frame and below
    pub total: u64,
    /// Samples ending in this frame
    #[serde(rename = "self")]
    pub self_count: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<FlameNode>,
}

impl FlameNode {
    /// Convert a profile tree, naming the root `total`
    pub fn from_tree(tree: &Tree) -> Self {
        Self::from_node("total", tree.root())
    }

    fn from_node(name: &str, node: &Node<String>) -> Self {
        Self {
            name: name.to_string(),
            total: node.total(),
            self_count: node.self_count(),
            children: node
                .children()
                .map(|(label, child)| Self::from_node(label, child))
                .collect(),
        }
    }
}

/// `GET /render?format=json` response
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderResponse {
    pub flamegraph: FlameNode,
    pub spy_name: String,
    pub sample_rate: u32,
    /// Covered window start (unix seconds), if any data matched
    pub from: Option<i64>,
    pub until: Option<i64>,
}

// ============================================
// LABEL DTOs
// ============================================

/// `GET /label-values` query string
#[derive(Debug, Deserialize)]
pub struct LabelValuesParams {
    pub label: String,
}

// ============================================
// HEALTH DTOs
// ============================================

/// Cache statistics
#[derive(Debug, Serialize, Deserialize)]
pub struct StatsDto {
    pub dimensions: usize,
    pub segments: usize,
    pub dictionaries: usize,
    pub trees: usize,
    pub resident_bytes: usize,
}

impl From<StorageStats> for StatsDto {
    fn from(stats: StorageStats) -> Self {
        Self {
            dimensions: stats.dimensions,
            segments: stats.segments,
            dictionaries: stats.dictionaries,
            trees: stats.trees,
            resident_bytes: stats.resident_bytes,
        }
    }
}

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_seconds: u64,
    pub version: String,
    pub cache: StatsDto,
}
