use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single stored point: an opaque, caller-defined msgpack object keyed by id.
///
/// The core never inspects `data`; this concrete engine peeks at one conventional field
/// (`vector`) to support `near` queries, documented in SPEC_FULL.md's data-model addendum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub id: Uuid,
    pub data: Vec<u8>,
}

impl Point {
    /// Best-effort extraction of the `vector` field from `data`, if present and well-formed.
    pub fn vector(&self) -> Option<Vec<f32>> {
        let value: serde_json::Value = rmp_serde::from_slice(&self.data).ok()?;
        let arr = value.get("vector")?.as_array()?;
        arr.iter().map(|v| v.as_f64().map(|f| f as f32)).collect()
    }

    pub fn decoded_data(&self) -> Option<serde_json::Map<String, serde_json::Value>> {
        let value: serde_json::Value = rmp_serde::from_slice(&self.data).ok()?;
        value.as_object().cloned()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchQuery {
    pub vector: Vec<f32>,
    pub operator: String,
    #[serde(default, rename = "searchSize")]
    pub search_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortSpec {
    pub property: String,
    #[serde(default)]
    pub descending: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: SearchQuery,
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub sort: Vec<SortSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub point: Point,
    pub distance: Option<f32>,
    pub score: Option<f32>,
    #[serde(default, rename = "hybridScore")]
    pub hybrid_score: f64,
    #[serde(default, rename = "decodedData")]
    pub decoded_data: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ShardInfo {
    #[serde(rename = "pointCount")]
    pub point_count: usize,
    pub size: u64,
}
