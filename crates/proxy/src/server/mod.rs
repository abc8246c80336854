//! The upstream-facing MCP endpoint and mode controller.
//!
//! One server terminates the peer connection, publishes the tool list for
//! the current mode, dispatches calls (administrative tools in-process,
//! everything else through the router), and emits `tools/list_changed`
//! when the exposed surface moves.

pub mod admin;
pub mod notify;

pub use notify::ListChangedNotifier;

use crate::connection::ConnectionManager;
use crate::discovery::{DiscoveredTool, DiscoveryEngine};
use crate::error::ProxyError;
use crate::events::ToolsetEvent;
use crate::router::{Router, ToolCall};
use crate::toolset::ToolsetManager;
use parking_lot::Mutex;
use rmcp::model::{
    CallToolRequestParams, CallToolResult, Content, ErrorData, InitializeRequestParams,
    InitializeResult, JsonObject, ListToolsResult, PaginatedRequestParams, ServerCapabilities,
    ServerInfo, Tool,
};
use rmcp::ServerHandler;
use rmcp::service::{RequestContext, RoleServer};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Which tool surface the front-end currently publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Administrative tools for managing toolsets.
    Configuration,
    /// The active toolset's tools plus mode navigation.
    Normal,
}

pub struct ProxyServer {
    discovery: Arc<DiscoveryEngine>,
    router: Option<Arc<Router>>,
    toolsets: Arc<ToolsetManager>,
    connections: Arc<ConnectionManager>,
    mode: Mutex<Mode>,
    legacy_combined: bool,
    notifier: Arc<ListChangedNotifier>,
}

impl ProxyServer {
    #[must_use]
    pub fn new(
        connections: Arc<ConnectionManager>,
        discovery: Arc<DiscoveryEngine>,
        router: Option<Arc<Router>>,
        toolsets: Arc<ToolsetManager>,
        notifier: Arc<ListChangedNotifier>,
        initial_mode: Mode,
        legacy_combined: bool,
    ) -> Self {
        Self {
            discovery,
            router,
            toolsets,
            connections,
            mode: Mutex::new(initial_mode),
            legacy_combined,
            notifier,
        }
    }

    #[must_use]
    pub fn mode(&self) -> Mode {
        *self.mode.lock()
    }

    /// Set the mode; returns whether it changed.
    fn set_mode(&self, mode: Mode) -> bool {
        let mut current = self.mode.lock();
        let changed = *current != mode;
        *current = mode;
        changed
    }

    /// The tool list for the current mode.
    pub(crate) async fn current_tool_list(&self) -> Vec<Tool> {
        if self.legacy_combined {
            let mut tools = admin::admin_tools();
            tools.extend(self.toolsets.get_tools_for_exposure().await);
            return tools;
        }
        match self.mode() {
            Mode::Configuration => {
                let mut tools = admin::admin_tools();
                tools.push(admin::exit_configuration_tool());
                tools
            }
            Mode::Normal => {
                let mut tools = self.toolsets.get_tools_for_exposure().await;
                tools.push(admin::enter_configuration_tool());
                tools
            }
        }
    }

    pub(crate) async fn handle_admin(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> Result<CallToolResult, ErrorData> {
        match name {
            admin::LIST_AVAILABLE_TOOLS => Ok(success(self.list_available_tools())),
            admin::LIST_SAVED_TOOLSETS => self.list_saved_toolsets(),
            admin::BUILD_TOOLSET => self.build_toolset(parse_args(arguments)?).await,
            admin::EQUIP_TOOLSET => self.equip_toolset(parse_args(arguments)?).await,
            admin::DELETE_TOOLSET => self.delete_toolset(parse_args(arguments)?).await,
            admin::UNEQUIP_TOOLSET => self.unequip_toolset().await,
            admin::GET_ACTIVE_TOOLSET => Ok(success(self.get_active_toolset().await)),
            admin::ADD_TOOL_ANNOTATION => self.add_tool_annotation(parse_args(arguments)?).await,
            admin::ENTER_CONFIGURATION_MODE => self.switch_mode(Mode::Configuration).await,
            admin::EXIT_CONFIGURATION_MODE => self.switch_mode(Mode::Normal).await,
            other => Err(ErrorData::invalid_params(
                format!("unknown administrative tool: {other}"),
                None,
            )),
        }
    }

    fn list_available_tools(&self) -> Value {
        let tools = self.discovery.available_tools(false);
        let mut by_server: BTreeMap<String, Vec<&DiscoveredTool>> = BTreeMap::new();
        for tool in &tools {
            by_server
                .entry(tool.server_name.clone())
                .or_default()
                .push(tool);
        }

        let servers: Vec<Value> = by_server
            .iter()
            .map(|(server, tools)| {
                json!({
                    "serverName": server,
                    "toolCount": tools.len(),
                    "tools": tools
                        .iter()
                        .map(|t| {
                            json!({
                                "name": t.original_name,
                                "description": t.description,
                                "namespacedName": t.namespaced_name,
                                "serverName": t.server_name,
                                "refId": t.full_hash,
                            })
                        })
                        .collect::<Vec<_>>(),
                })
            })
            .collect();

        json!({
            "summary": {
                "totalTools": tools.len(),
                "totalServers": self.connections.server_names().len(),
            },
            "toolsByServer": servers,
        })
    }

    fn list_saved_toolsets(&self) -> Result<CallToolResult, ErrorData> {
        let toolsets = match self.toolsets.list_saved() {
            Ok(toolsets) => toolsets,
            Err(e) => return Ok(admin_failure(&e)),
        };
        let entries: Vec<Value> = toolsets
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "toolCount": t.tools.len(),
                    "version": t.version,
                    "createdAt": t.created_at,
                })
            })
            .collect();
        Ok(success(json!({ "toolsets": entries, "count": entries.len() })))
    }

    async fn build_toolset(
        &self,
        args: admin::BuildToolsetArgs,
    ) -> Result<CallToolResult, ErrorData> {
        let (toolset, warnings) =
            match self
                .toolsets
                .build(&args.name, args.tools, args.description)
            {
                Ok(built) => built,
                Err(e) => return Ok(admin_failure(&e)),
            };

        let mut auto_equipped = false;
        if args.auto_equip {
            match self.toolsets.equip(&args.name).await {
                Ok(_) => {
                    auto_equipped = true;
                    self.set_mode(Mode::Normal);
                    self.notifier.notify_tool_list_changed().await;
                }
                Err(e) => return Ok(admin_failure(&e)),
            }
        }

        Ok(success(json!({
            "success": true,
            "toolsetName": toolset.name,
            "configuration": toolset,
            "createdAt": toolset.created_at,
            "autoEquipped": auto_equipped,
            "warnings": warnings,
        })))
    }

    async fn equip_toolset(
        &self,
        args: admin::EquipToolsetArgs,
    ) -> Result<CallToolResult, ErrorData> {
        let outcome = match self.toolsets.equip(&args.name).await {
            Ok(outcome) => outcome,
            Err(e) => return Ok(admin_failure(&e)),
        };
        // A successful equip implicitly leaves configuration mode.
        self.set_mode(Mode::Normal);
        self.notifier.notify_tool_list_changed().await;

        Ok(success(json!({
            "success": true,
            "equipped": outcome.toolset.name,
            "mode": "normal",
            "exposedTools": outcome.snapshot.exposed.len(),
            "unavailableServers": outcome.snapshot.unavailable_servers,
            "warnings": outcome.snapshot.warnings,
        })))
    }

    async fn delete_toolset(
        &self,
        args: admin::DeleteToolsetArgs,
    ) -> Result<CallToolResult, ErrorData> {
        match self.toolsets.delete(&args.name, args.confirm).await {
            Ok(()) => Ok(success(json!({ "success": true, "deleted": args.name }))),
            Err(e) => Ok(admin_failure(&e)),
        }
    }

    async fn unequip_toolset(&self) -> Result<CallToolResult, ErrorData> {
        match self.toolsets.unequip().await {
            Ok(was_active) => {
                if was_active {
                    self.notifier.notify_tool_list_changed().await;
                }
                Ok(success(json!({ "success": true, "unequipped": was_active })))
            }
            Err(e) => Ok(admin_failure(&e)),
        }
    }

    async fn get_active_toolset(&self) -> Value {
        match self.toolsets.active_info().await {
            Some(info) => json!({ "active": true, "toolset": info }),
            None => json!({ "active": false }),
        }
    }

    async fn add_tool_annotation(
        &self,
        args: admin::AddAnnotationArgs,
    ) -> Result<CallToolResult, ErrorData> {
        match self.toolsets.add_annotations(args.tool_ref, args.notes).await {
            Ok(toolset) => Ok(success(json!({
                "success": true,
                "toolsetName": toolset.name,
                "annotatedTools": toolset.annotations.len(),
            }))),
            Err(e) => Ok(admin_failure(&e)),
        }
    }

    async fn switch_mode(&self, mode: Mode) -> Result<CallToolResult, ErrorData> {
        if self.legacy_combined {
            return Err(ErrorData::invalid_params(
                "mode switching is disabled in combined mode",
                None,
            ));
        }
        let changed = self.set_mode(mode);
        if changed {
            self.notifier.notify_tool_list_changed().await;
        }
        let label = match mode {
            Mode::Configuration => "configuration",
            Mode::Normal => "normal",
        };
        Ok(success(json!({ "success": true, "mode": label })))
    }

    async fn dispatch_toolset_call(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> Result<CallToolResult, ErrorData> {
        if !self.legacy_combined && self.mode() == Mode::Configuration {
            return Err(ErrorData::invalid_params(
                format!("unknown tool: {name}"),
                None,
            ));
        }

        let Some(router) = &self.router else {
            return Err(ErrorData::internal_error(
                "routing is not initialized yet",
                None,
            ));
        };

        // Only tools of the active exposure are callable; the manager also
        // undoes any name flattening.
        let Some(namespaced) = self.toolsets.resolve_original(name) else {
            return Err(ErrorData::invalid_params(
                format!("unknown tool: {name}"),
                None,
            ));
        };

        router
            .route_call(ToolCall {
                name: namespaced,
                arguments,
            })
            .await
            .map_err(|e| protocol_error(&e))
    }
}

impl ServerHandler for ProxyServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            instructions: Some(
                "Aggregates tools from configured MCP servers behind curated toolsets. \
                 In configuration mode, use list-available-tools and build-toolset to \
                 define a toolset, then equip-toolset to expose its tools."
                    .to_string(),
            ),
            ..Default::default()
        }
    }

    async fn initialize(
        &self,
        _request: InitializeRequestParams,
        context: RequestContext<RoleServer>,
    ) -> Result<InitializeResult, ErrorData> {
        self.notifier.observe_peer(context.peer);
        Ok(self.get_info())
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, ErrorData> {
        Ok(ListToolsResult {
            tools: self.current_tool_list().await,
            ..Default::default()
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, ErrorData> {
        let name = request.name.to_string();
        tracing::debug!(tool = %name, mode = ?self.mode(), "tools/call received");

        if admin::is_admin_tool(&name) {
            self.handle_admin(&name, request.arguments).await
        } else {
            self.dispatch_toolset_call(&name, request.arguments).await
        }
    }
}

/// Forward background exposure changes (discovery drift, annotations) to
/// the peer as `tools/list_changed`. Synchronous admin paths notify
/// directly, so only `Updated` events are forwarded here.
pub fn spawn_update_forwarder(
    toolsets: &Arc<ToolsetManager>,
    notifier: &Arc<ListChangedNotifier>,
    cancel: CancellationToken,
) {
    let mut events = toolsets.subscribe();
    let notifier = Arc::clone(notifier);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Ok(ToolsetEvent::Updated(_)) => {
                        notifier.notify_tool_list_changed().await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "toolset event stream lagged; notifying once");
                        notifier.notify_tool_list_changed().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    });
}

fn parse_args<T: DeserializeOwned>(arguments: Option<JsonObject>) -> Result<T, ErrorData> {
    serde_json::from_value(Value::Object(arguments.unwrap_or_default()))
        .map_err(|e| ErrorData::invalid_params(format!("invalid arguments: {e}"), None))
}

fn success(value: Value) -> CallToolResult {
    let text = serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string());
    CallToolResult::success(vec![Content::text(text)])
}

/// Domain failures of administrative tools come back as tool-level errors,
/// not protocol errors.
fn admin_failure(error: &ProxyError) -> CallToolResult {
    tracing::debug!(error = %error, "administrative tool failed");
    CallToolResult::error(vec![Content::text(error.to_string())])
}

/// Map routing failures onto protocol-level errors. Internal faults are
/// logged in full and surfaced generically.
fn protocol_error(error: &ProxyError) -> ErrorData {
    match error {
        ProxyError::ToolNotFound(_)
        | ProxyError::InvalidParameters(_)
        | ProxyError::InvalidToolset(_)
        | ProxyError::ToolsetNotFound(_) => ErrorData::invalid_params(error.to_string(), None),
        ProxyError::ServerNotConnected(_)
        | ProxyError::Timeout(_)
        | ProxyError::Transport(_)
        | ProxyError::Unavailable(_) => ErrorData::internal_error(error.to_string(), None),
        other => {
            tracing::error!(error = %other, "internal error while routing tool call");
            ErrorData::internal_error("internal error", None)
        }
    }
}
