//! Error types for the proxy.

use thiserror::Error;

/// Main error type for the proxy.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Configuration errors (invalid JSON/YAML, missing fields, bad values).
    /// Fatal at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The requested tool is not in the discovery catalog.
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// The named downstream exists but its session is not connected.
    #[error("Server not connected: {0}")]
    ServerNotConnected(String),

    /// A tool call was missing required arguments or carried malformed ones.
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    /// A downstream call exceeded its deadline.
    #[error("Timed out after {0}ms")]
    Timeout(u128),

    /// Transport-level failures (connect, dropped connection, protocol I/O).
    /// Non-fatal; surfaced as lifecycle events and per-call errors.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Toolset validation failures (bad name, empty or duplicate references).
    #[error("Invalid toolset: {0}")]
    InvalidToolset(String),

    /// The named toolset does not exist in the store.
    #[error("Toolset not found: {0}")]
    ToolsetNotFound(String),

    /// Persistence-layer failures.
    #[error("Storage error: {0}")]
    Store(#[from] toolscope_store::StoreError),

    /// A subsystem was used before it finished initializing.
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// Broken internal invariants. Logged in full, surfaced generically.
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
