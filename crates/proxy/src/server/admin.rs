//! The administrative tool surface.
//!
//! Administrative tools are a closed set dispatched by name in
//! [`super::ProxyServer::call_tool`]; nothing here is pluggable, so the
//! whole surface is auditable in one place.

use crate::toolset::{ToolNote, ToolReference};
use rmcp::model::{JsonObject, Tool};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

pub const LIST_AVAILABLE_TOOLS: &str = "list-available-tools";
pub const BUILD_TOOLSET: &str = "build-toolset";
pub const LIST_SAVED_TOOLSETS: &str = "list-saved-toolsets";
pub const EQUIP_TOOLSET: &str = "equip-toolset";
pub const DELETE_TOOLSET: &str = "delete-toolset";
pub const UNEQUIP_TOOLSET: &str = "unequip-toolset";
pub const GET_ACTIVE_TOOLSET: &str = "get-active-toolset";
pub const ADD_TOOL_ANNOTATION: &str = "add-tool-annotation";
pub const ENTER_CONFIGURATION_MODE: &str = "enter-configuration-mode";
pub const EXIT_CONFIGURATION_MODE: &str = "exit-configuration-mode";

/// Every administrative tool name, including the mode-navigation pair.
pub const ADMIN_TOOL_NAMES: &[&str] = &[
    LIST_AVAILABLE_TOOLS,
    BUILD_TOOLSET,
    LIST_SAVED_TOOLSETS,
    EQUIP_TOOLSET,
    DELETE_TOOLSET,
    UNEQUIP_TOOLSET,
    GET_ACTIVE_TOOLSET,
    ADD_TOOL_ANNOTATION,
    ENTER_CONFIGURATION_MODE,
    EXIT_CONFIGURATION_MODE,
];

#[must_use]
pub fn is_admin_tool(name: &str) -> bool {
    ADMIN_TOOL_NAMES.contains(&name)
}

/// Arguments of `build-toolset`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildToolsetArgs {
    pub name: String,
    pub tools: Vec<ToolReference>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub auto_equip: bool,
}

/// Arguments of `equip-toolset`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EquipToolsetArgs {
    pub name: String,
}

/// Arguments of `delete-toolset`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteToolsetArgs {
    pub name: String,
    #[serde(default)]
    pub confirm: bool,
}

/// Arguments of `add-tool-annotation`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddAnnotationArgs {
    pub tool_ref: ToolReference,
    pub notes: Vec<ToolNote>,
}

fn schema(value: Value) -> Arc<JsonObject> {
    match value {
        Value::Object(map) => Arc::new(map),
        _ => Arc::new(JsonObject::new()),
    }
}

fn no_args_schema() -> Arc<JsonObject> {
    schema(json!({ "type": "object", "properties": {} }))
}

fn tool_reference_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "namespacedName": {
                "type": "string",
                "description": "Published tool name, e.g. 'github.create_issue'"
            },
            "refId": {
                "type": "string",
                "description": "Stable content hash of the tool record"
            }
        }
    })
}

/// The tools exposed in configuration mode. The mode-navigation pair is
/// appended by the caller according to the current mode.
#[must_use]
pub fn admin_tools() -> Vec<Tool> {
    vec![
        Tool::new(
            LIST_AVAILABLE_TOOLS,
            "List every tool discovered from the configured MCP servers, grouped by server.",
            no_args_schema(),
        ),
        Tool::new(
            BUILD_TOOLSET,
            "Create and persist a named toolset from a list of tool references.",
            schema(json!({
                "type": "object",
                "properties": {
                    "name": {
                        "type": "string",
                        "description": "Toolset name (lowercase letters, digits, dashes; 2-50 chars)"
                    },
                    "tools": {
                        "type": "array",
                        "items": tool_reference_schema(),
                        "description": "Tools to include"
                    },
                    "description": { "type": "string" },
                    "autoEquip": {
                        "type": "boolean",
                        "description": "Equip the toolset immediately after saving"
                    }
                },
                "required": ["name", "tools"]
            })),
        ),
        Tool::new(
            LIST_SAVED_TOOLSETS,
            "List stored toolsets with tool counts and timestamps.",
            no_args_schema(),
        ),
        Tool::new(
            EQUIP_TOOLSET,
            "Equip a saved toolset and switch to normal mode.",
            schema(json!({
                "type": "object",
                "properties": { "name": { "type": "string" } },
                "required": ["name"]
            })),
        ),
        Tool::new(
            DELETE_TOOLSET,
            "Delete a saved toolset. The active toolset must be unequipped first.",
            schema(json!({
                "type": "object",
                "properties": {
                    "name": { "type": "string" },
                    "confirm": { "type": "boolean" }
                },
                "required": ["name", "confirm"]
            })),
        ),
        Tool::new(
            UNEQUIP_TOOLSET,
            "Clear the active toolset.",
            no_args_schema(),
        ),
        Tool::new(
            GET_ACTIVE_TOOLSET,
            "Detailed status of the active toolset, including unavailable servers and warnings.",
            no_args_schema(),
        ),
        Tool::new(
            ADD_TOOL_ANNOTATION,
            "Append named notes to a tool of the active toolset. Notes are additive-only.",
            schema(json!({
                "type": "object",
                "properties": {
                    "toolRef": tool_reference_schema(),
                    "notes": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "name": { "type": "string" },
                                "note": { "type": "string" }
                            },
                            "required": ["name", "note"]
                        }
                    }
                },
                "required": ["toolRef", "notes"]
            })),
        ),
    ]
}

/// The `enter-configuration-mode` navigation tool, visible in normal mode.
#[must_use]
pub fn enter_configuration_tool() -> Tool {
    Tool::new(
        ENTER_CONFIGURATION_MODE,
        "Switch to configuration mode to manage toolsets.",
        no_args_schema(),
    )
}

/// The `exit-configuration-mode` navigation tool, visible in configuration
/// mode.
#[must_use]
pub fn exit_configuration_tool() -> Tool {
    Tool::new(
        EXIT_CONFIGURATION_MODE,
        "Leave configuration mode and expose the active toolset's tools.",
        no_args_schema(),
    )
}
