//! Discovery data model.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Instant;

/// Canonical record of one tool known to the proxy.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredTool {
    /// Origin session's server name.
    pub server_name: String,
    /// Name as the downstream advertises it.
    pub original_name: String,
    /// Published name, unique across the catalog.
    pub namespaced_name: String,
    pub description: Option<String>,
    /// Opaque JSON schema payload from the downstream.
    pub input_schema: Value,
    /// Hash of the callable contract (name + input schema).
    pub structure_hash: String,
    /// Stable reference id; survives renames with identical content.
    #[serde(rename = "refId")]
    pub full_hash: String,
    pub discovered_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

/// A cached tool with its expiry and read counter.
#[derive(Debug, Clone)]
pub(crate) struct CacheEntry {
    pub tool: DiscoveredTool,
    pub expires_at: Instant,
    pub hits: u64,
}

/// Search criteria for [`crate::discovery::DiscoveryEngine::search`].
#[derive(Debug, Clone, Default)]
pub struct ToolFilter {
    /// Restrict to one server.
    pub server: Option<String>,
    /// Regex matched against both the namespaced and original name.
    pub name_pattern: Option<String>,
    /// Only tools whose session is currently connected.
    pub connected_only: bool,
}

/// Shadow state the engine keeps per configured server.
#[derive(Debug, Clone, Default)]
pub struct ServerShadow {
    pub status: ServerStatus,
    pub last_pass_at: Option<DateTime<Utc>>,
    /// Warnings from the most recent pass (tool-cap enforcement, conflicts).
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ServerStatus {
    #[default]
    Unknown,
    Discovered,
    Disconnected,
    Failed(String),
}

/// Aggregate counters for the engine.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryStats {
    pub total_servers: usize,
    pub connected_servers: usize,
    pub total_tools: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate: f64,
    pub last_discovery_at: Option<DateTime<Utc>>,
    pub average_discovery_ms: f64,
    pub tools_by_server: HashMap<String, usize>,
}
