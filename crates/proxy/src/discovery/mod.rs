//! Tool discovery: enumeration, namespacing, change detection, and the
//! TTL'd catalog cache.
//!
//! One engine owns the catalog for all downstreams. A discovery pass per
//! server fetches `tools/list`, hashes every tool, diffs against the
//! previous pass and emits a single aggregated [`ToolsChanged`] event.
//! Passes are serialized per server (a manual refresh coalesces with any
//! in-flight pass) and run in parallel across servers.

pub mod types;

pub use types::{DiscoveredTool, DiscoveryStats, ServerShadow, ServerStatus, ToolFilter};

use crate::config::{ConflictPolicy, ProxySettings};
use crate::connection::ConnectionManager;
use crate::error::{ProxyError, Result};
use crate::events::{EVENT_CHANNEL_CAPACITY, ToolsChanged};
use crate::hashing;
use chrono::Utc;
use futures::StreamExt as _;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use types::CacheEntry;

/// A tool as returned by one `tools/list`, before reconciliation.
#[derive(Debug, Clone)]
pub(crate) struct FetchedTool {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Value,
}

impl From<rmcp::model::Tool> for FetchedTool {
    fn from(tool: rmcp::model::Tool) -> Self {
        Self {
            name: tool.name.to_string(),
            description: tool.description.as_deref().map(str::to_string),
            input_schema: Value::Object(tool.input_schema.as_ref().clone()),
        }
    }
}

pub struct DiscoveryEngine {
    connections: Arc<ConnectionManager>,
    /// Catalog keyed by `namespaced_name`.
    cache: RwLock<HashMap<String, CacheEntry>>,
    shadows: RwLock<HashMap<String, ServerShadow>>,
    /// Per-server pass serialization; a waiting refresh observes the result
    /// of the pass it waited on instead of running its own.
    pass_locks: HashMap<String, Arc<tokio::sync::Mutex<()>>>,
    events: broadcast::Sender<ToolsChanged>,
    stats: RwLock<StatsInner>,
    cache_ttl: Duration,
    refresh_interval: Duration,
    discovery_timeout: Duration,
    auto_discovery: bool,
    namespace_separator: String,
    conflict_policy: ConflictPolicy,
    max_tools_per_server: Option<usize>,
    enable_metrics: bool,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct StatsInner {
    cache_hits: u64,
    cache_misses: u64,
    passes: u64,
    total_pass_ms: u128,
    last_discovery_at: Option<chrono::DateTime<Utc>>,
}

impl DiscoveryEngine {
    #[must_use]
    pub fn new(connections: Arc<ConnectionManager>, settings: &ProxySettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let pass_locks = connections
            .server_names()
            .into_iter()
            .map(|name| (name, Arc::new(tokio::sync::Mutex::new(()))))
            .collect();

        Self {
            connections,
            cache: RwLock::new(HashMap::new()),
            shadows: RwLock::new(HashMap::new()),
            pass_locks,
            events,
            stats: RwLock::new(StatsInner::default()),
            cache_ttl: settings.cache_ttl(),
            refresh_interval: settings.refresh_interval(),
            discovery_timeout: settings.discovery_timeout(),
            auto_discovery: settings.auto_discovery,
            namespace_separator: settings.namespace_separator.clone(),
            conflict_policy: settings.conflict_policy,
            max_tools_per_server: settings.max_tools_per_server,
            enable_metrics: settings.enable_metrics,
            cancel: CancellationToken::new(),
        }
    }

    /// Subscribe to aggregated per-pass change events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ToolsChanged> {
        self.events.subscribe()
    }

    /// Install the periodic refresh timer (when auto-discovery is on).
    pub fn start(self: &Arc<Self>) {
        if !self.auto_discovery {
            return;
        }
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(engine.refresh_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await;

            loop {
                tokio::select! {
                    () = engine.cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                engine.discover_all().await;
            }
        });
    }

    /// Stop the refresh timer.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Run a discovery pass against one server, or all servers when `None`.
    pub async fn discover(self: &Arc<Self>, server: Option<&str>) {
        match server {
            Some(name) => {
                self.discover_server(name).await;
            }
            None => self.discover_all().await,
        }
    }

    /// Alias for [`Self::discover`]; reads better at call sites that react
    /// to external change signals.
    pub async fn refresh(self: &Arc<Self>, server: Option<&str>) {
        self.discover(server).await;
    }

    async fn discover_all(self: &Arc<Self>) {
        let servers = self.connections.server_names();
        futures::stream::iter(servers)
            .for_each_concurrent(None, |name| {
                let engine = Arc::clone(self);
                async move {
                    engine.discover_server(&name).await;
                }
            })
            .await;
    }

    /// One pass: fetch, cap, hash, diff, commit, emit.
    async fn discover_server(&self, server: &str) {
        let Some(lock) = self.pass_locks.get(server) else {
            tracing::warn!(server = %server, "discovery requested for unknown server");
            return;
        };

        // Coalesce: if a pass is already running, wait for it and take its
        // result rather than immediately re-enumerating.
        let guard = match lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                let _wait = lock.lock().await;
                return;
            }
        };

        let Some(session) = self.connections.get(server) else {
            return;
        };
        if !session.is_connected() {
            self.set_shadow(server, ServerStatus::Disconnected, Vec::new());
            return;
        }

        let started = Instant::now();
        let fetched = match tokio::time::timeout(self.discovery_timeout, session.list_tools()).await
        {
            Ok(Ok(tools)) => tools.into_iter().map(FetchedTool::from).collect::<Vec<_>>(),
            Ok(Err(e)) => {
                // Keep the previous catalog; the next refresh tick retries.
                tracing::warn!(server = %server, error = %e, "tools/list failed");
                self.set_shadow(server, ServerStatus::Failed(e.to_string()), Vec::new());
                return;
            }
            Err(_) => {
                tracing::warn!(
                    server = %server,
                    timeout_ms = self.discovery_timeout.as_millis() as u64,
                    "tools/list timed out"
                );
                self.set_shadow(
                    server,
                    ServerStatus::Failed("discovery timed out".to_string()),
                    Vec::new(),
                );
                return;
            }
        };

        let change = self.apply_snapshot(server, fetched);
        drop(guard);

        let elapsed = started.elapsed();
        if self.enable_metrics {
            let mut stats = self.stats.write();
            stats.passes += 1;
            stats.total_pass_ms += elapsed.as_millis();
            stats.last_discovery_at = Some(Utc::now());
        }

        if !change.is_empty() {
            tracing::info!(
                server = %server,
                added = change.added.len(),
                updated = change.updated.len(),
                removed = change.removed.len(),
                "tool catalog changed"
            );
            let _ = self.events.send(change);
        }
    }

    /// Reconcile one server's fetched tool list with the catalog.
    ///
    /// Enforces the per-server cap, computes hashes, classifies every tool
    /// as added/updated/unchanged, and purges entries the server no longer
    /// advertises.
    pub(crate) fn apply_snapshot(&self, server: &str, mut fetched: Vec<FetchedTool>) -> ToolsChanged {
        let mut warnings = Vec::new();

        if let Some(cap) = self.max_tools_per_server
            && fetched.len() > cap
        {
            for dropped in &fetched[cap..] {
                warnings.push(format!(
                    "server '{server}' exceeds tool cap ({cap}); dropping '{}'",
                    dropped.name
                ));
            }
            tracing::warn!(
                server = %server,
                advertised = fetched.len(),
                cap = cap,
                "per-server tool cap exceeded; dropping excess tools"
            );
            fetched.truncate(cap);
        }

        let now = Utc::now();
        let expires_at = Instant::now() + self.cache_ttl;
        let mut change = ToolsChanged {
            server: server.to_string(),
            ..ToolsChanged::default()
        };

        let mut cache = self.cache.write();

        // Previous view of this server, keyed by original name.
        let previous: HashMap<String, (String, String, chrono::DateTime<Utc>)> = cache
            .values()
            .filter(|e| e.tool.server_name == server)
            .map(|e| {
                (
                    e.tool.original_name.clone(),
                    (
                        e.tool.structure_hash.clone(),
                        e.tool.full_hash.clone(),
                        e.tool.discovered_at,
                    ),
                )
            })
            .collect();

        let mut seen: HashSet<String> = HashSet::new();
        for tool in fetched {
            if !seen.insert(tool.name.clone()) {
                warnings.push(format!(
                    "server '{server}' advertised duplicate tool '{}'",
                    tool.name
                ));
                continue;
            }

            let namespaced = self.namespaced_name(server, &tool.name);

            // Pathological cross-server collision on the published name.
            if let Some(existing) = cache.get(&namespaced)
                && existing.tool.server_name != server
            {
                let keep_existing = existing.tool.server_name.as_str() < server;
                if keep_existing || self.conflict_policy == ConflictPolicy::Error {
                    warnings.push(format!(
                        "tool '{namespaced}' conflicts with server '{}'; not published",
                        existing.tool.server_name
                    ));
                    continue;
                }
                warnings.push(format!(
                    "tool '{namespaced}' from '{}' displaced by server '{server}'",
                    existing.tool.server_name
                ));
            }

            let structure = hashing::structure_hash(&tool.name, &tool.input_schema);
            let full =
                hashing::full_hash(server, tool.description.as_deref(), &tool.input_schema);

            let (discovered_at, classification) = match previous.get(&tool.name) {
                None => (now, Classification::Added),
                Some((prev_structure, prev_full, first_seen)) => {
                    if *prev_structure == structure && *prev_full == full {
                        (*first_seen, Classification::Unchanged)
                    } else {
                        (*first_seen, Classification::Updated)
                    }
                }
            };

            match classification {
                Classification::Added => change.added.push(namespaced.clone()),
                Classification::Updated => change.updated.push(namespaced.clone()),
                Classification::Unchanged => {}
            }

            let hits = cache.get(&namespaced).map_or(0, |e| e.hits);
            cache.insert(
                namespaced.clone(),
                CacheEntry {
                    tool: DiscoveredTool {
                        server_name: server.to_string(),
                        original_name: tool.name,
                        namespaced_name: namespaced,
                        description: tool.description,
                        input_schema: tool.input_schema,
                        structure_hash: structure,
                        full_hash: full,
                        discovered_at,
                        last_updated: if classification == Classification::Unchanged {
                            discovered_at
                        } else {
                            now
                        },
                    },
                    expires_at,
                    hits,
                },
            );
        }

        // Purge entries this server no longer advertises.
        let stale: Vec<String> = cache
            .values()
            .filter(|e| e.tool.server_name == server && !seen.contains(&e.tool.original_name))
            .map(|e| e.tool.namespaced_name.clone())
            .collect();
        for key in stale {
            cache.remove(&key);
            change.removed.push(key);
        }
        drop(cache);

        change.added.sort();
        change.updated.sort();
        change.removed.sort();

        self.set_shadow(server, ServerStatus::Discovered, warnings);
        change
    }

    fn namespaced_name(&self, server: &str, original: &str) -> String {
        match self.conflict_policy {
            ConflictPolicy::NamespaceAlways => {
                format!("{server}{}{original}", self.namespace_separator)
            }
            ConflictPolicy::PrefixServer => format!("{server}_{original}"),
            ConflictPolicy::Error => original.to_string(),
        }
    }

    fn set_shadow(&self, server: &str, status: ServerStatus, warnings: Vec<String>) {
        let mut shadows = self.shadows.write();
        let shadow = shadows.entry(server.to_string()).or_default();
        shadow.status = status;
        shadow.last_pass_at = Some(Utc::now());
        shadow.warnings = warnings;
    }

    /// Resolve a tool by namespaced name, falling back to the original name
    /// when it is unambiguous across all servers.
    #[must_use]
    pub fn get_by_name(&self, name: &str) -> Option<DiscoveredTool> {
        let now = Instant::now();
        let mut cache = self.cache.write();

        let key = if cache.contains_key(name) {
            Some(name.to_string())
        } else {
            let matches: Vec<String> = cache
                .values()
                .filter(|e| e.tool.original_name == name)
                .map(|e| e.tool.namespaced_name.clone())
                .collect();
            match matches.len() {
                1 => matches.into_iter().next(),
                _ => None,
            }
        };

        let Some(key) = key else {
            drop(cache);
            if self.enable_metrics {
                self.stats.write().cache_misses += 1;
            }
            return None;
        };

        let entry = cache.get_mut(&key).expect("key just resolved");
        entry.hits += 1;
        // Expired entries still serve (the refresh loop replaces them) but
        // count as misses for hit-rate purposes.
        let expired = entry.expires_at <= now;
        let tool = entry.tool.clone();
        drop(cache);

        if self.enable_metrics {
            let mut stats = self.stats.write();
            if expired {
                stats.cache_misses += 1;
            } else {
                stats.cache_hits += 1;
            }
        }
        Some(tool)
    }

    /// Look a tool up by its stable reference id.
    #[must_use]
    pub fn get_by_ref_id(&self, ref_id: &str) -> Option<DiscoveredTool> {
        self.cache
            .read()
            .values()
            .find(|e| e.tool.full_hash == ref_id)
            .map(|e| e.tool.clone())
    }

    /// All cached tools, sorted by namespaced name.
    #[must_use]
    pub fn available_tools(&self, connected_only: bool) -> Vec<DiscoveredTool> {
        let mut tools: Vec<DiscoveredTool> = self
            .cache
            .read()
            .values()
            .filter(|e| !connected_only || self.connections.is_connected(&e.tool.server_name))
            .map(|e| e.tool.clone())
            .collect();
        tools.sort_by(|a, b| a.namespaced_name.cmp(&b.namespaced_name));
        tools
    }

    /// Filtered catalog search.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameters` when the name pattern is not a valid
    /// regular expression.
    pub fn search(&self, filter: &ToolFilter) -> Result<Vec<DiscoveredTool>> {
        let pattern = filter
            .name_pattern
            .as_deref()
            .map(regex::Regex::new)
            .transpose()
            .map_err(|e| ProxyError::InvalidParameters(format!("bad name pattern: {e}")))?;

        let mut tools: Vec<DiscoveredTool> = self
            .cache
            .read()
            .values()
            .map(|e| &e.tool)
            .filter(|t| filter.server.as_deref().is_none_or(|s| t.server_name == s))
            .filter(|t| {
                pattern.as_ref().is_none_or(|re| {
                    re.is_match(&t.namespaced_name) || re.is_match(&t.original_name)
                })
            })
            .filter(|t| !filter.connected_only || self.connections.is_connected(&t.server_name))
            .cloned()
            .collect();
        tools.sort_by(|a, b| a.namespaced_name.cmp(&b.namespaced_name));
        Ok(tools)
    }

    /// Drop cached tools for one server, or the whole catalog.
    pub fn clear(&self, server: Option<&str>) {
        let mut cache = self.cache.write();
        match server {
            Some(name) => cache.retain(|_, e| e.tool.server_name != name),
            None => cache.clear(),
        }
    }

    /// Shadow state for one server.
    #[must_use]
    pub fn server_shadow(&self, server: &str) -> Option<ServerShadow> {
        self.shadows.read().get(server).cloned()
    }

    /// Warnings recorded by the most recent pass of every server.
    #[must_use]
    pub fn warnings(&self) -> Vec<String> {
        let shadows = self.shadows.read();
        let mut keys: Vec<&String> = shadows.keys().collect();
        keys.sort();
        keys.into_iter()
            .flat_map(|k| shadows[k].warnings.clone())
            .collect()
    }

    #[must_use]
    pub fn stats(&self) -> DiscoveryStats {
        let cache = self.cache.read();
        let mut tools_by_server: HashMap<String, usize> = HashMap::new();
        for entry in cache.values() {
            *tools_by_server
                .entry(entry.tool.server_name.clone())
                .or_default() += 1;
        }
        let total_tools = cache.len();
        drop(cache);

        let stats = self.stats.read();
        let lookups = stats.cache_hits + stats.cache_misses;
        DiscoveryStats {
            total_servers: self.connections.server_names().len(),
            connected_servers: self.connections.connected_names().len(),
            total_tools,
            cache_hits: stats.cache_hits,
            cache_misses: stats.cache_misses,
            cache_hit_rate: if lookups == 0 {
                0.0
            } else {
                stats.cache_hits as f64 / lookups as f64
            },
            last_discovery_at: stats.last_discovery_at,
            average_discovery_ms: if stats.passes == 0 {
                0.0
            } else {
                stats.total_pass_ms as f64 / stats.passes as f64
            },
            tools_by_server,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Classification {
    Added,
    Updated,
    Unchanged,
}
