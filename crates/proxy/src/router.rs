//! Request routing: map an inbound tool call to a downstream session and
//! forward it.
//!
//! Local failures (unknown tool, disconnected server, missing arguments,
//! deadline) surface as errors to the caller. A downstream tool reporting
//! failure is a *result*, not an error; the split is never blurred here.

use crate::connection::ConnectionManager;
use crate::discovery::{DiscoveredTool, DiscoveryEngine};
use crate::error::{ProxyError, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rmcp::model::CallToolResult;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// An inbound tool call, by namespaced name (or unambiguous original name).
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub name: String,
    pub arguments: Option<serde_json::Map<String, Value>>,
}

/// Rolling call counters, kept globally and per server.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallStats {
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub average_latency_ms: f64,
    pub last_call_at: Option<DateTime<Utc>>,
}

impl CallStats {
    fn record(&mut self, ok: bool, elapsed: Duration) {
        self.calls += 1;
        if ok {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        let latency = elapsed.as_secs_f64() * 1000.0;
        self.average_latency_ms += (latency - self.average_latency_ms) / self.calls as f64;
        self.last_call_at = Some(Utc::now());
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterStats {
    pub global: CallStats,
    pub by_server: HashMap<String, CallStats>,
}

pub struct Router {
    connections: Arc<ConnectionManager>,
    discovery: Arc<DiscoveryEngine>,
    call_timeout: Duration,
    validate_params: bool,
    stats: RwLock<RouterStats>,
}

impl Router {
    #[must_use]
    pub fn new(
        connections: Arc<ConnectionManager>,
        discovery: Arc<DiscoveryEngine>,
        call_timeout: Duration,
        validate_params: bool,
    ) -> Self {
        Self {
            connections,
            discovery,
            call_timeout,
            validate_params,
            stats: RwLock::new(RouterStats::default()),
        }
    }

    /// Resolve and forward one tool call.
    ///
    /// # Errors
    ///
    /// `ToolNotFound`, `ServerNotConnected`, `InvalidParameters`, `Timeout`
    /// or `Transport` per the routing contract; downstream tool-level
    /// failures come back as `Ok` with `is_error = true`.
    pub async fn route_call(&self, call: ToolCall) -> Result<CallToolResult> {
        let tool = self
            .discovery
            .get_by_name(&call.name)
            .ok_or_else(|| ProxyError::ToolNotFound(call.name.clone()))?;

        let session = self
            .connections
            .get(&tool.server_name)
            .filter(|s| s.is_connected())
            .ok_or_else(|| ProxyError::ServerNotConnected(tool.server_name.clone()))?;

        if self.validate_params {
            check_required_arguments(&tool, call.arguments.as_ref())?;
        }

        tracing::debug!(
            tool = %call.name,
            server = %tool.server_name,
            original = %tool.original_name,
            "routing tool call"
        );

        let started = Instant::now();
        let outcome = tokio::time::timeout(
            self.call_timeout,
            session.call_tool(&tool.original_name, call.arguments),
        )
        .await;

        let elapsed = started.elapsed();
        let result = match outcome {
            Ok(Ok(mut result)) => {
                // Normalize: a downstream that omits the flag means success.
                if result.is_error.is_none() {
                    result.is_error = Some(false);
                }
                self.record(&tool.server_name, true, elapsed);
                Ok(result)
            }
            Ok(Err(e)) => {
                self.record(&tool.server_name, false, elapsed);
                Err(e)
            }
            Err(_) => {
                self.record(&tool.server_name, false, elapsed);
                Err(ProxyError::Timeout(self.call_timeout.as_millis()))
            }
        };

        if let Err(e) = &result {
            tracing::warn!(tool = %call.name, server = %tool.server_name, error = %e, "tool call failed");
        }
        result
    }

    fn record(&self, server: &str, ok: bool, elapsed: Duration) {
        let mut stats = self.stats.write();
        stats.global.record(ok, elapsed);
        stats
            .by_server
            .entry(server.to_string())
            .or_default()
            .record(ok, elapsed);
    }

    #[must_use]
    pub fn stats(&self) -> RouterStats {
        self.stats.read().clone()
    }
}

/// Verify every schema-required field is present in the arguments. Further
/// JSON-Schema validation is an extension point, not done here.
fn check_required_arguments(
    tool: &DiscoveredTool,
    arguments: Option<&serde_json::Map<String, Value>>,
) -> Result<()> {
    let required: Vec<&str> = tool
        .input_schema
        .get("required")
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let missing: Vec<&str> = required
        .into_iter()
        .filter(|field| !arguments.is_some_and(|args| args.contains_key(*field)))
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(ProxyError::InvalidParameters(format!(
            "tool '{}' missing required arguments: {}",
            tool.namespaced_name,
            missing.join(", ")
        )))
    }
}
