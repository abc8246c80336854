//! Toolset management: the persisted catalog of saved toolsets, the active
//! selection, reference validation, and the filtered view the front-end
//! publishes.
//!
//! All mutations are serialized behind one async lock; events are emitted
//! after state is committed. The exposed view is re-derived from discovery
//! on demand, never cached across catalog changes.

pub mod flatten;
pub mod types;

pub use types::{
    ActiveToolsetInfo, ExposedTool, ExposureSnapshot, ToolAnnotation, ToolNote, ToolReference,
    ToolsetConfig, valid_slug,
};

use crate::config::ProxySettings;
use crate::connection::ConnectionManager;
use crate::discovery::DiscoveryEngine;
use crate::error::{ProxyError, Result};
use crate::events::{EVENT_CHANNEL_CAPACITY, ToolsetEvent};
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use toolscope_store::{KIND_PREFERENCES, KIND_TOOLSETS, Store};

/// Preference key remembering the most recently equipped toolset.
const LAST_EQUIPPED_KEY: &str = "last-equipped";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LastEquipped {
    name: String,
    equipped_at: chrono::DateTime<Utc>,
}

/// Result of equipping a toolset.
#[derive(Debug, Clone)]
pub struct EquipOutcome {
    pub toolset: ToolsetConfig,
    pub snapshot: ExposureSnapshot,
}

pub struct ToolsetManager {
    store: Store,
    discovery: Arc<DiscoveryEngine>,
    connections: Arc<ConnectionManager>,
    secure_mode: AtomicBool,
    namespace_separator: String,
    flatten_delimiter: Option<String>,
    /// Active-toolset pointer; the lock serializes every mutation.
    active: tokio::sync::Mutex<Option<ToolsetConfig>>,
    /// Most recently derived exposure, for name resolution and status.
    last_exposure: RwLock<ExposureSnapshot>,
    events: broadcast::Sender<ToolsetEvent>,
}

impl ToolsetManager {
    #[must_use]
    pub fn new(
        store: Store,
        discovery: Arc<DiscoveryEngine>,
        connections: Arc<ConnectionManager>,
        settings: &ProxySettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            discovery,
            connections,
            secure_mode: AtomicBool::new(settings.secure_mode),
            namespace_separator: settings.namespace_separator.clone(),
            flatten_delimiter: settings.flatten_delimiter.clone(),
            active: tokio::sync::Mutex::new(None),
            last_exposure: RwLock::new(ExposureSnapshot::default()),
            events,
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ToolsetEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn secure_mode(&self) -> bool {
        self.secure_mode.load(Ordering::Relaxed)
    }

    /// Toggle structural-drift enforcement at runtime.
    pub fn set_secure_mode(&self, enabled: bool) {
        self.secure_mode.store(enabled, Ordering::Relaxed);
    }

    /// Saved toolsets, sorted by name.
    pub fn list_saved(&self) -> Result<Vec<ToolsetConfig>> {
        let mut toolsets: Vec<ToolsetConfig> = self.store.list(KIND_TOOLSETS)?;
        toolsets.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(toolsets)
    }

    /// Validate and persist a new toolset.
    ///
    /// References that resolve against the current catalog get their
    /// `structure_hash` stamped for later drift checks; references that do
    /// not resolve are kept and reported as warnings.
    pub fn build(
        &self,
        name: &str,
        mut tools: Vec<ToolReference>,
        description: Option<String>,
    ) -> Result<(ToolsetConfig, Vec<String>)> {
        ToolsetConfig::validate(name, &tools)?;
        if self.store.get::<ToolsetConfig>(KIND_TOOLSETS, name)?.is_some() {
            return Err(ProxyError::InvalidToolset(format!(
                "toolset '{name}' already exists; delete it first"
            )));
        }

        let mut warnings = Vec::new();
        for reference in &mut tools {
            match self.resolve_reference(reference) {
                Some((tool, _)) => {
                    if reference.structure_hash.is_none() {
                        reference.structure_hash = Some(tool.structure_hash.clone());
                    }
                    if reference.ref_id.is_none() {
                        reference.ref_id = Some(tool.full_hash.clone());
                    }
                }
                None => warnings.push(format!(
                    "reference '{}' does not match any discovered tool",
                    reference.display()
                )),
            }
        }

        let toolset = ToolsetConfig {
            name: name.to_string(),
            description,
            version: 1,
            created_at: Utc::now(),
            tools,
            annotations: Vec::new(),
        };
        self.store.put(KIND_TOOLSETS, name, &toolset)?;
        tracing::info!(
            toolset = %name,
            references = toolset.tools.len(),
            warnings = warnings.len(),
            "toolset saved"
        );
        Ok((toolset, warnings))
    }

    /// Load a saved toolset, re-validate it, and make it active.
    pub async fn equip(&self, name: &str) -> Result<EquipOutcome> {
        let toolset: ToolsetConfig = self
            .store
            .get(KIND_TOOLSETS, name)?
            .ok_or_else(|| ProxyError::ToolsetNotFound(name.to_string()))?;

        let snapshot = {
            let mut active = self.active.lock().await;
            let snapshot = self.resolve_exposure(Some(&toolset));
            *active = Some(toolset.clone());
            *self.last_exposure.write() = snapshot.clone();
            self.store.put(
                KIND_PREFERENCES,
                LAST_EQUIPPED_KEY,
                &LastEquipped {
                    name: name.to_string(),
                    equipped_at: Utc::now(),
                },
            )?;
            snapshot
        };

        let _ = self.events.send(ToolsetEvent::Equipped(name.to_string()));
        tracing::info!(
            toolset = %name,
            exposed = snapshot.exposed.len(),
            unavailable = snapshot.unavailable.len(),
            "toolset equipped"
        );
        Ok(EquipOutcome { toolset, snapshot })
    }

    /// Clear the active pointer. Returns whether anything was equipped.
    pub async fn unequip(&self) -> Result<bool> {
        let was_active = {
            let mut active = self.active.lock().await;
            let was = active.take().is_some();
            *self.last_exposure.write() = ExposureSnapshot::default();
            self.store.delete(KIND_PREFERENCES, LAST_EQUIPPED_KEY)?;
            was
        };
        if was_active {
            let _ = self.events.send(ToolsetEvent::Unequipped);
            tracing::info!("toolset unequipped");
        }
        Ok(was_active)
    }

    /// Delete a saved toolset. Refused for the active toolset; `confirm`
    /// must be set.
    pub async fn delete(&self, name: &str, confirm: bool) -> Result<()> {
        if !confirm {
            return Err(ProxyError::InvalidParameters(
                "deletion requires confirm=true".to_string(),
            ));
        }
        let active = self.active.lock().await;
        if active.as_ref().is_some_and(|t| t.name == name) {
            return Err(ProxyError::InvalidToolset(format!(
                "toolset '{name}' is equipped; unequip it before deleting"
            )));
        }
        if !self.store.delete(KIND_TOOLSETS, name)? {
            return Err(ProxyError::ToolsetNotFound(name.to_string()));
        }
        tracing::info!(toolset = %name, "toolset deleted");
        Ok(())
    }

    /// Re-equip the most recently equipped toolset, if it still exists.
    /// Returns the restored name.
    pub async fn restore_last_equipped(&self) -> Result<Option<String>> {
        let Some(last) = self
            .store
            .get::<LastEquipped>(KIND_PREFERENCES, LAST_EQUIPPED_KEY)?
        else {
            return Ok(None);
        };

        if self
            .store
            .get::<ToolsetConfig>(KIND_TOOLSETS, &last.name)?
            .is_none()
        {
            tracing::warn!(toolset = %last.name, "last-equipped toolset no longer exists");
            self.store.delete(KIND_PREFERENCES, LAST_EQUIPPED_KEY)?;
            return Ok(None);
        }

        self.equip(&last.name).await?;
        Ok(Some(last.name))
    }

    pub async fn has_active(&self) -> bool {
        self.active.lock().await.is_some()
    }

    pub async fn active_name(&self) -> Option<String> {
        self.active.lock().await.as_ref().map(|t| t.name.clone())
    }

    /// Detailed status of the active toolset, including unavailable servers
    /// and validation warnings.
    pub async fn active_info(&self) -> Option<ActiveToolsetInfo> {
        let active = self.active.lock().await;
        let toolset = active.as_ref()?;
        let snapshot = self.resolve_exposure(Some(toolset));
        Some(ActiveToolsetInfo {
            name: toolset.name.clone(),
            description: toolset.description.clone(),
            version: toolset.version,
            created_at: toolset.created_at,
            total_references: toolset.tools.len(),
            exposed_tools: snapshot.exposed.len(),
            unavailable_tools: snapshot
                .unavailable
                .iter()
                .map(ToolReference::display)
                .chain(snapshot.excluded_drift.iter().cloned())
                .collect(),
            unavailable_servers: snapshot.unavailable_servers.clone(),
            warnings: snapshot.warnings.clone(),
            secure_mode: self.secure_mode(),
        })
    }

    /// The front-end-facing tool list: the active toolset filtered through
    /// current discovery. Empty when nothing is equipped.
    pub async fn get_tools_for_exposure(&self) -> Vec<rmcp::model::Tool> {
        let active = self.active.lock().await;
        let snapshot = self.resolve_exposure(active.as_ref());
        let tools = snapshot
            .exposed
            .iter()
            .map(|exposed| {
                let schema = exposed
                    .tool
                    .input_schema
                    .as_object()
                    .cloned()
                    .unwrap_or_default();
                rmcp::model::Tool::new(
                    exposed.exposed_name.clone(),
                    exposed.description.clone().unwrap_or_default(),
                    Arc::new(schema),
                )
            })
            .collect();
        *self.last_exposure.write() = snapshot;
        tools
    }

    /// Inverse of the exposure flattening: recover the namespaced name the
    /// router understands from a peer-facing tool name.
    #[must_use]
    pub fn resolve_original(&self, exposed_name: &str) -> Option<String> {
        self.last_exposure
            .read()
            .name_map
            .get(exposed_name)
            .cloned()
    }

    /// Append annotations to a tool of the active toolset. Additive-only:
    /// existing note names are kept, incoming duplicates ignored.
    pub async fn add_annotations(
        &self,
        tool_ref: ToolReference,
        notes: Vec<ToolNote>,
    ) -> Result<ToolsetConfig> {
        if tool_ref.key().is_empty() {
            return Err(ProxyError::InvalidParameters(
                "toolRef needs a namespacedName or refId".to_string(),
            ));
        }
        for note in &notes {
            if !valid_slug(&note.name) {
                return Err(ProxyError::InvalidParameters(format!(
                    "note name '{}' must match ^[a-z0-9-]+$",
                    note.name
                )));
            }
        }

        let (updated, changed_view) = {
            let mut active = self.active.lock().await;
            let toolset = active
                .as_mut()
                .ok_or_else(|| ProxyError::InvalidToolset("no toolset equipped".to_string()))?;

            if !toolset.tools.iter().any(|r| references_overlap(r, &tool_ref)) {
                return Err(ProxyError::InvalidParameters(format!(
                    "'{}' is not part of toolset '{}'",
                    tool_ref.display(),
                    toolset.name
                )));
            }

            let index = toolset
                .annotations
                .iter()
                .position(|a| references_overlap(&a.tool_ref, &tool_ref))
                .unwrap_or_else(|| {
                    toolset.annotations.push(ToolAnnotation {
                        tool_ref,
                        notes: Vec::new(),
                    });
                    toolset.annotations.len() - 1
                });
            let entry = &mut toolset.annotations[index];

            let mut appended = 0usize;
            for note in notes {
                if entry.notes.iter().any(|n| n.name == note.name) {
                    continue;
                }
                entry.notes.push(note);
                appended += 1;
            }

            if appended > 0 {
                toolset.version += 1;
            }
            self.store.put(KIND_TOOLSETS, &toolset.name, toolset)?;

            let before = self.last_exposure.read().fingerprint();
            let snapshot = self.resolve_exposure(Some(toolset));
            let changed = snapshot.fingerprint() != before;
            *self.last_exposure.write() = snapshot;
            (toolset.clone(), changed)
        };

        if changed_view {
            let _ = self
                .events
                .send(ToolsetEvent::Updated(updated.name.clone()));
        }
        Ok(updated)
    }

    /// Re-derive the active exposure after a catalog or connectivity
    /// change; emits `Updated` when the visible view moved.
    pub async fn revalidate_active(&self) {
        let changed = {
            let active = self.active.lock().await;
            let Some(toolset) = active.as_ref() else {
                return;
            };
            let before = self.last_exposure.read().fingerprint();
            let snapshot = self.resolve_exposure(Some(toolset));
            let changed = snapshot.fingerprint() != before;
            let name = toolset.name.clone();
            *self.last_exposure.write() = snapshot;
            changed.then_some(name)
        };

        if let Some(name) = changed {
            tracing::debug!(toolset = %name, "active toolset view changed");
            let _ = self.events.send(ToolsetEvent::Updated(name));
        }
    }

    /// Resolve one reference against the full catalog (connected or not).
    /// Returns the tool and whether the match was by name.
    fn resolve_reference(&self, reference: &ToolReference) -> Option<(crate::discovery::DiscoveredTool, bool)> {
        if let Some(name) = reference.namespaced_name.as_deref()
            && let Some(tool) = self.discovery.get_by_name(name)
        {
            return Some((tool, true));
        }
        if let Some(ref_id) = reference.ref_id.as_deref()
            && let Some(tool) = self.discovery.get_by_ref_id(ref_id)
        {
            return Some((tool, false));
        }
        None
    }

    /// Materialize the exposed view for a toolset against current
    /// discovery and connectivity.
    fn resolve_exposure(&self, toolset: Option<&ToolsetConfig>) -> ExposureSnapshot {
        let Some(toolset) = toolset else {
            return ExposureSnapshot::default();
        };

        let mut snapshot = ExposureSnapshot {
            toolset: Some(toolset.name.clone()),
            ..ExposureSnapshot::default()
        };
        let secure = self.secure_mode();
        let mut unavailable_servers: BTreeSet<String> = BTreeSet::new();
        let mut matched: Vec<(crate::discovery::DiscoveredTool, bool)> = Vec::new();

        for reference in &toolset.tools {
            match self.resolve_reference(reference) {
                None => {
                    snapshot.warnings.push(format!(
                        "reference '{}' does not match any discovered tool",
                        reference.display()
                    ));
                    snapshot.unavailable.push(reference.clone());
                }
                Some((tool, by_name)) => {
                    if !self.connections.is_connected(&tool.server_name) {
                        unavailable_servers.insert(tool.server_name.clone());
                        snapshot.unavailable.push(reference.clone());
                        continue;
                    }
                    // Structural drift only applies to name matches: a
                    // ref-id match proves the content is unchanged.
                    if by_name
                        && secure
                        && let Some(saved) = reference.structure_hash.as_deref()
                        && saved != tool.structure_hash
                    {
                        snapshot.warnings.push(format!(
                            "'{}' changed its callable contract since it was saved; \
                             excluded in secure mode",
                            tool.namespaced_name
                        ));
                        snapshot.excluded_drift.push(tool.namespaced_name.clone());
                        continue;
                    }
                    matched.push((tool, by_name));
                }
            }
        }

        matched.sort_by(|a, b| a.0.namespaced_name.cmp(&b.0.namespaced_name));
        let namespaced: Vec<String> = matched
            .iter()
            .map(|(t, _)| t.namespaced_name.clone())
            .collect();
        let pairs = flatten::flatten_names(
            &namespaced,
            &self.namespace_separator,
            self.flatten_delimiter.as_deref(),
        );
        snapshot.name_map = flatten::name_map(&pairs);

        for ((tool, _), (exposed_name, _)) in matched.into_iter().zip(pairs) {
            let description = annotated_description(&tool, toolset);
            snapshot.exposed.push(ExposedTool {
                tool,
                exposed_name,
                description,
            });
        }

        snapshot.unavailable_servers = unavailable_servers.into_iter().collect();
        snapshot
    }
}

/// Do two references plausibly name the same tool?
fn references_overlap(a: &ToolReference, b: &ToolReference) -> bool {
    (a.namespaced_name.is_some() && a.namespaced_name == b.namespaced_name)
        || (a.ref_id.is_some() && a.ref_id == b.ref_id)
}

/// Tool description with the toolset's annotations appended as a Markdown
/// section.
fn annotated_description(
    tool: &crate::discovery::DiscoveredTool,
    toolset: &ToolsetConfig,
) -> Option<String> {
    let notes = toolset.notes_for(tool);
    if notes.is_empty() {
        return tool.description.clone();
    }

    let mut out = tool.description.clone().unwrap_or_default();
    if !out.is_empty() {
        out.push_str("\n\n");
    }
    out.push_str("## Additional Tool Notes");
    for note in notes {
        out.push_str(&format!("\n\n### {}\n{}", note.name, note.note));
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ServerConfig, TransportConfig};
    use crate::connection::SessionState;
    use crate::discovery::DiscoveryEngine;
    use serde_json::json;
    use std::collections::HashMap;

    struct Fixture {
        manager: ToolsetManager,
        discovery: Arc<DiscoveryEngine>,
        connections: Arc<ConnectionManager>,
    }

    fn fixture(settings: ProxySettings) -> Fixture {
        let configs = vec![server_config("srv"), server_config("db")];
        let connections = Arc::new(ConnectionManager::new(configs, &settings));
        let discovery = Arc::new(DiscoveryEngine::new(Arc::clone(&connections), &settings));
        let manager = ToolsetManager::new(
            Store::open_temporary().expect("store"),
            Arc::clone(&discovery),
            Arc::clone(&connections),
            &settings,
        );
        Fixture {
            manager,
            discovery,
            connections,
        }
    }

    fn server_config(name: &str) -> ServerConfig {
        ServerConfig {
            name: name.to_string(),
            transport: TransportConfig::Stdio {
                command: format!("{name}-bin"),
                args: Vec::new(),
                env: HashMap::new(),
            },
        }
    }

    fn connect(fx: &Fixture, server: &str) {
        fx.connections
            .get(server)
            .expect("session")
            .force_state(SessionState::Connected);
    }

    fn seed_tool(fx: &Fixture, server: &str, name: &str, description: &str) {
        fx.discovery.apply_snapshot(
            server,
            vec![crate::discovery::FetchedTool {
                name: name.to_string(),
                description: Some(description.to_string()),
                input_schema: json!({
                    "type": "object",
                    "properties": {"msg": {"type": "string"}},
                    "required": ["msg"],
                }),
            }],
        );
    }

    #[tokio::test]
    async fn build_stamps_hashes_and_persists() {
        let fx = fixture(ProxySettings::default());
        connect(&fx, "srv");
        seed_tool(&fx, "srv", "echo", "Echo");

        let (toolset, warnings) = fx
            .manager
            .build("dev", vec![ToolReference::by_name("srv.echo")], None)
            .expect("build");

        assert!(warnings.is_empty());
        assert!(toolset.tools[0].structure_hash.is_some());
        assert!(toolset.tools[0].ref_id.is_some());

        let saved = fx.manager.list_saved().expect("list");
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].tools, toolset.tools);
    }

    #[tokio::test]
    async fn build_rejects_duplicates_and_existing_names() {
        let fx = fixture(ProxySettings::default());
        let reference = ToolReference::by_name("srv.echo");

        assert!(
            fx.manager
                .build("dev", vec![reference.clone(), reference.clone()], None)
                .is_err()
        );

        fx.manager
            .build("dev", vec![reference.clone()], None)
            .expect("build");
        assert!(fx.manager.build("dev", vec![reference], None).is_err());
    }

    #[tokio::test]
    async fn build_warns_on_unresolved_references() {
        let fx = fixture(ProxySettings::default());
        let (_, warnings) = fx
            .manager
            .build("dev", vec![ToolReference::by_name("ghost.tool")], None)
            .expect("build");
        assert_eq!(warnings.len(), 1);
    }

    #[tokio::test]
    async fn equip_exposes_connected_tools_only() {
        let fx = fixture(ProxySettings::default());
        connect(&fx, "srv");
        seed_tool(&fx, "srv", "echo", "Echo");
        seed_tool(&fx, "db", "query", "Query");

        fx.manager
            .build(
                "dev",
                vec![
                    ToolReference::by_name("srv.echo"),
                    ToolReference::by_name("db.query"),
                ],
                None,
            )
            .expect("build");

        let outcome = fx.manager.equip("dev").await.expect("equip");
        let exposed: Vec<_> = outcome
            .snapshot
            .exposed
            .iter()
            .map(|e| e.exposed_name.clone())
            .collect();
        assert_eq!(exposed, vec!["srv.echo"]);
        assert_eq!(outcome.snapshot.unavailable_servers, vec!["db"]);
        assert!(fx.manager.has_active().await);
    }

    #[tokio::test]
    async fn equip_unknown_toolset_fails() {
        let fx = fixture(ProxySettings::default());
        assert!(matches!(
            fx.manager.equip("nope").await.unwrap_err(),
            ProxyError::ToolsetNotFound(_)
        ));
    }

    #[tokio::test]
    async fn delete_requires_confirm_and_unequip() {
        let fx = fixture(ProxySettings::default());
        connect(&fx, "srv");
        seed_tool(&fx, "srv", "echo", "Echo");
        fx.manager
            .build("dev", vec![ToolReference::by_name("srv.echo")], None)
            .expect("build");
        fx.manager.equip("dev").await.expect("equip");

        assert!(fx.manager.delete("dev", false).await.is_err());
        assert!(fx.manager.delete("dev", true).await.is_err());

        assert!(fx.manager.unequip().await.expect("unequip"));
        fx.manager.delete("dev", true).await.expect("delete");
        assert!(fx.manager.list_saved().expect("list").is_empty());
    }

    #[tokio::test]
    async fn restore_last_equipped_roundtrip() {
        let fx = fixture(ProxySettings::default());
        connect(&fx, "srv");
        seed_tool(&fx, "srv", "echo", "Echo");
        fx.manager
            .build("dev", vec![ToolReference::by_name("srv.echo")], None)
            .expect("build");
        fx.manager.equip("dev").await.expect("equip");

        // Simulate restart: a fresh manager over the same store.
        let manager2 = ToolsetManager::new(
            fx.manager.store.clone(),
            Arc::clone(&fx.discovery),
            Arc::clone(&fx.connections),
            &ProxySettings::default(),
        );
        let restored = manager2.restore_last_equipped().await.expect("restore");
        assert_eq!(restored.as_deref(), Some("dev"));
        assert!(manager2.has_active().await);

        assert!(fx.manager.unequip().await.expect("unequip"));
        let restored = manager2.restore_last_equipped().await.expect("restore");
        assert!(restored.is_none());
    }

    #[tokio::test]
    async fn stale_rename_resolves_through_ref_id() {
        let fx = fixture(ProxySettings::default());
        connect(&fx, "srv");
        seed_tool(&fx, "srv", "echo", "Echo");

        fx.manager
            .build("dev", vec![ToolReference::by_name("srv.echo")], None)
            .expect("build");
        fx.manager.equip("dev").await.expect("equip");

        // Downstream renames echo -> say; content is otherwise identical.
        seed_tool(&fx, "srv", "say", "Echo");
        fx.discovery.apply_snapshot(
            "srv",
            vec![crate::discovery::FetchedTool {
                name: "say".to_string(),
                description: Some("Echo".to_string()),
                input_schema: json!({
                    "type": "object",
                    "properties": {"msg": {"type": "string"}},
                    "required": ["msg"],
                }),
            }],
        );

        let tools = fx.manager.get_tools_for_exposure().await;
        let names: Vec<String> = tools.iter().map(|t| t.name.to_string()).collect();
        assert_eq!(names, vec!["srv.say"]);
    }

    #[tokio::test]
    async fn secure_mode_excludes_schema_drift_and_insecure_allows_it() {
        let fx = fixture(ProxySettings::default());
        connect(&fx, "srv");
        seed_tool(&fx, "srv", "echo", "Echo");
        fx.manager
            .build("dev", vec![ToolReference::by_name("srv.echo")], None)
            .expect("build");
        fx.manager.equip("dev").await.expect("equip");

        // Same name, new schema: the callable contract drifted.
        fx.discovery.apply_snapshot(
            "srv",
            vec![crate::discovery::FetchedTool {
                name: "echo".to_string(),
                description: Some("Echo".to_string()),
                input_schema: json!({
                    "type": "object",
                    "properties": {"text": {"type": "string"}},
                    "required": ["text"],
                }),
            }],
        );

        assert!(fx.manager.get_tools_for_exposure().await.is_empty());
        let info = fx.manager.active_info().await.expect("active");
        assert!(!info.warnings.is_empty());
        assert_eq!(info.exposed_tools, 0);

        fx.manager.set_secure_mode(false);
        let tools = fx.manager.get_tools_for_exposure().await;
        assert_eq!(tools.len(), 1);
    }

    #[tokio::test]
    async fn annotations_are_append_only_and_rendered() {
        let fx = fixture(ProxySettings::default());
        connect(&fx, "srv");
        seed_tool(&fx, "srv", "echo", "Echoes input");
        fx.manager
            .build("dev", vec![ToolReference::by_name("srv.echo")], None)
            .expect("build");
        fx.manager.equip("dev").await.expect("equip");

        fx.manager
            .add_annotations(
                ToolReference::by_name("srv.echo"),
                vec![ToolNote {
                    name: "usage".to_string(),
                    note: "Prefer short messages.".to_string(),
                }],
            )
            .await
            .expect("annotate");

        // Duplicate note names are ignored, not overwritten.
        let updated = fx
            .manager
            .add_annotations(
                ToolReference::by_name("srv.echo"),
                vec![ToolNote {
                    name: "usage".to_string(),
                    note: "Something else.".to_string(),
                }],
            )
            .await
            .expect("annotate");
        assert_eq!(updated.annotations[0].notes.len(), 1);
        assert_eq!(updated.annotations[0].notes[0].note, "Prefer short messages.");

        let tools = fx.manager.get_tools_for_exposure().await;
        let description = tools[0].description.as_deref().unwrap_or_default();
        assert!(description.contains("Echoes input"));
        assert!(description.contains("## Additional Tool Notes"));
        assert!(description.contains("### usage"));
        assert!(description.contains("Prefer short messages."));
    }

    #[tokio::test]
    async fn annotations_reject_bad_note_names_and_foreign_tools() {
        let fx = fixture(ProxySettings::default());
        connect(&fx, "srv");
        seed_tool(&fx, "srv", "echo", "Echo");
        fx.manager
            .build("dev", vec![ToolReference::by_name("srv.echo")], None)
            .expect("build");
        fx.manager.equip("dev").await.expect("equip");

        assert!(
            fx.manager
                .add_annotations(
                    ToolReference::by_name("srv.echo"),
                    vec![ToolNote {
                        name: "Bad Name".to_string(),
                        note: "x".to_string(),
                    }],
                )
                .await
                .is_err()
        );
        assert!(
            fx.manager
                .add_annotations(
                    ToolReference::by_name("srv.other"),
                    vec![ToolNote {
                        name: "usage".to_string(),
                        note: "x".to_string(),
                    }],
                )
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn revalidate_emits_updated_only_on_view_change() {
        let fx = fixture(ProxySettings::default());
        connect(&fx, "srv");
        seed_tool(&fx, "srv", "echo", "Echo");
        fx.manager
            .build("dev", vec![ToolReference::by_name("srv.echo")], None)
            .expect("build");
        fx.manager.equip("dev").await.expect("equip");
        let mut events = fx.manager.subscribe();

        // No catalog change: no event.
        fx.manager.revalidate_active().await;
        assert!(events.try_recv().is_err());

        // Server disconnects: the exposed view shrinks.
        fx.connections
            .get("srv")
            .expect("session")
            .force_state(SessionState::Reconnecting);
        fx.manager.revalidate_active().await;
        assert_eq!(
            events.try_recv().expect("event"),
            ToolsetEvent::Updated("dev".to_string())
        );

        // Reconnects: view restored, one more event.
        fx.connections
            .get("srv")
            .expect("session")
            .force_state(SessionState::Connected);
        fx.manager.revalidate_active().await;
        assert_eq!(
            events.try_recv().expect("event"),
            ToolsetEvent::Updated("dev".to_string())
        );
    }

    #[tokio::test]
    async fn flattened_names_resolve_back_to_namespaced() {
        let mut settings = ProxySettings::default();
        settings.flatten_delimiter = Some("_".to_string());
        let fx = fixture(settings);
        connect(&fx, "srv");
        seed_tool(&fx, "srv", "echo", "Echo");
        fx.manager
            .build("dev", vec![ToolReference::by_name("srv.echo")], None)
            .expect("build");
        fx.manager.equip("dev").await.expect("equip");

        let tools = fx.manager.get_tools_for_exposure().await;
        let names: Vec<String> = tools.iter().map(|t| t.name.to_string()).collect();
        assert_eq!(names, vec!["srv_echo"]);
        assert_eq!(
            fx.manager.resolve_original("srv_echo").as_deref(),
            Some("srv.echo")
        );
        assert!(fx.manager.resolve_original("srv.echo").is_none());
    }

    #[tokio::test]
    async fn exposure_is_empty_without_active_toolset() {
        let fx = fixture(ProxySettings::default());
        connect(&fx, "srv");
        seed_tool(&fx, "srv", "echo", "Echo");
        assert!(fx.manager.get_tools_for_exposure().await.is_empty());
        assert!(fx.manager.active_info().await.is_none());
    }
}
