//! In-process event types.
//!
//! Events flow over bounded `tokio::sync::broadcast` channels. Emitters
//! commit state first and send after; a lagging or dropped receiver never
//! blocks the emitter.

use serde::Serialize;

/// Capacity of every event channel. Lagged receivers skip ahead.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Lifecycle transition of one downstream session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub server: String,
    pub kind: SessionEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEventKind {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
    Failed,
    Error(String),
}

impl SessionEventKind {
    /// Stable label used in logs.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
            Self::Error(_) => "error",
        }
    }
}

/// Aggregate result of one discovery pass against one server.
///
/// The vectors carry namespaced names; counts are their lengths.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsChanged {
    pub server: String,
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
}

impl ToolsChanged {
    /// True when the pass left the catalog exactly as it was.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Change to the active toolset or its exposed view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolsetEvent {
    Equipped(String),
    Unequipped,
    /// The active toolset's exposed view changed under it (discovery drift,
    /// downstream connect/disconnect, new annotations).
    Updated(String),
}
