//! Persisted toolset model.

use crate::discovery::DiscoveredTool;
use crate::error::{ProxyError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Bounds for toolset and annotation-note names: `^[a-z0-9-]+$`, 2–50 chars.
pub const NAME_MIN: usize = 2;
pub const NAME_MAX: usize = 50;

/// Validate a toolset (or note) name against the slug rule.
#[must_use]
pub fn valid_slug(name: &str) -> bool {
    (NAME_MIN..=NAME_MAX).contains(&name.len())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// How a saved toolset names one tool.
///
/// Resolution prefers `namespaced_name`; `ref_id` (the tool's content hash)
/// is the fallback that tolerates renames. `structure_hash` records the
/// callable contract at save time for drift detection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespaced_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structure_hash: Option<String>,
}

impl ToolReference {
    #[must_use]
    pub fn by_name(namespaced_name: &str) -> Self {
        Self {
            namespaced_name: Some(namespaced_name.to_string()),
            ..Self::default()
        }
    }

    /// Identity used for duplicate rejection and annotation matching.
    #[must_use]
    pub fn key(&self) -> String {
        match (&self.namespaced_name, &self.ref_id) {
            (Some(name), _) => format!("name:{name}"),
            (None, Some(id)) => format!("ref:{id}"),
            (None, None) => String::new(),
        }
    }

    /// Whether this reference points at the given discovered tool.
    #[must_use]
    pub fn matches(&self, tool: &DiscoveredTool) -> bool {
        self.namespaced_name.as_deref() == Some(tool.namespaced_name.as_str())
            || self.ref_id.as_deref() == Some(tool.full_hash.as_str())
    }

    #[must_use]
    pub fn display(&self) -> String {
        self.namespaced_name
            .clone()
            .or_else(|| self.ref_id.clone())
            .unwrap_or_else(|| "<empty>".to_string())
    }
}

/// One named annotation attached to a tool inside a toolset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolNote {
    pub name: String,
    pub note: String,
}

/// All annotations for one referenced tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolAnnotation {
    pub tool_ref: ToolReference,
    pub notes: Vec<ToolNote>,
}

/// A named, persisted selection of tool references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsetConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub tools: Vec<ToolReference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<ToolAnnotation>,
}

impl ToolsetConfig {
    /// Validate name and reference invariants for a new toolset.
    ///
    /// # Errors
    ///
    /// `InvalidToolset` on a bad name, empty references, references with no
    /// selector, or duplicates.
    pub fn validate(name: &str, tools: &[ToolReference]) -> Result<()> {
        if !valid_slug(name) {
            return Err(ProxyError::InvalidToolset(format!(
                "name '{name}' must match ^[a-z0-9-]+$ and be {NAME_MIN}-{NAME_MAX} characters"
            )));
        }
        if tools.is_empty() {
            return Err(ProxyError::InvalidToolset(
                "a toolset needs at least one tool reference".to_string(),
            ));
        }

        let mut seen = HashMap::new();
        for reference in tools {
            let key = reference.key();
            if key.is_empty() {
                return Err(ProxyError::InvalidToolset(
                    "a tool reference needs a namespacedName or refId".to_string(),
                ));
            }
            if seen.insert(key, ()).is_some() {
                return Err(ProxyError::InvalidToolset(format!(
                    "duplicate tool reference '{}'",
                    reference.display()
                )));
            }
        }
        Ok(())
    }

    /// Notes attached to the given tool, in insertion order.
    #[must_use]
    pub fn notes_for(&self, tool: &DiscoveredTool) -> Vec<&ToolNote> {
        self.annotations
            .iter()
            .filter(|a| a.tool_ref.matches(tool))
            .flat_map(|a| a.notes.iter())
            .collect()
    }
}

/// One tool as it will appear to the upstream peer.
#[derive(Debug, Clone, PartialEq)]
pub struct ExposedTool {
    pub tool: DiscoveredTool,
    /// Published (possibly flattened) name.
    pub exposed_name: String,
    /// Description with any annotation section appended.
    pub description: Option<String>,
}

/// Result of resolving the active toolset against current discovery.
#[derive(Debug, Clone, Default)]
pub struct ExposureSnapshot {
    pub toolset: Option<String>,
    pub exposed: Vec<ExposedTool>,
    /// References that did not resolve to any catalog entry.
    pub unavailable: Vec<ToolReference>,
    /// Namespaced names excluded by secure-mode drift checks.
    pub excluded_drift: Vec<String>,
    /// Servers whose tools are referenced but not currently connected.
    pub unavailable_servers: Vec<String>,
    pub warnings: Vec<String>,
    /// Exposed name → namespaced name, rebuilt on every exposure.
    pub name_map: HashMap<String, String>,
}

impl ExposureSnapshot {
    /// Order-insensitive fingerprint of the exposed view, for change
    /// detection.
    #[must_use]
    pub fn fingerprint(&self) -> Vec<(String, String, Option<String>)> {
        let mut fp: Vec<(String, String, Option<String>)> = self
            .exposed
            .iter()
            .map(|e| {
                (
                    e.exposed_name.clone(),
                    e.tool.structure_hash.clone(),
                    e.description.clone(),
                )
            })
            .collect();
        fp.sort();
        fp
    }
}

/// Status summary for the active toolset.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveToolsetInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub total_references: usize,
    pub exposed_tools: usize,
    pub unavailable_tools: Vec<String>,
    pub unavailable_servers: Vec<String>,
    pub warnings: Vec<String>,
    pub secure_mode: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_rule_boundaries() {
        assert!(valid_slug("dev-tools"));
        assert!(valid_slug("a1"));
        assert!(!valid_slug(""));
        assert!(!valid_slug("a"));
        assert!(!valid_slug("A"));
        assert!(!valid_slug("has space"));
        assert!(!valid_slug("under_score"));
        assert!(!valid_slug(&"x".repeat(51)));
        assert!(valid_slug(&"x".repeat(50)));
    }

    #[test]
    fn validate_rejects_empty_and_duplicate_references() {
        let reference = ToolReference::by_name("srv.echo");

        assert!(ToolsetConfig::validate("dev", &[]).is_err());
        assert!(ToolsetConfig::validate("dev", &[ToolReference::default()]).is_err());
        assert!(
            ToolsetConfig::validate("dev", &[reference.clone(), reference.clone()]).is_err()
        );
        assert!(ToolsetConfig::validate("dev", &[reference]).is_ok());
    }

    #[test]
    fn reference_matches_by_name_or_ref_id() {
        let tool = DiscoveredTool {
            server_name: "srv".to_string(),
            original_name: "echo".to_string(),
            namespaced_name: "srv.echo".to_string(),
            description: None,
            input_schema: serde_json::json!({}),
            structure_hash: "sh".to_string(),
            full_hash: "fh".to_string(),
            discovered_at: Utc::now(),
            last_updated: Utc::now(),
        };

        assert!(ToolReference::by_name("srv.echo").matches(&tool));
        assert!(
            ToolReference {
                ref_id: Some("fh".to_string()),
                ..ToolReference::default()
            }
            .matches(&tool)
        );
        assert!(!ToolReference::by_name("srv.say").matches(&tool));
    }
}
