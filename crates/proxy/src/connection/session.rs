//! A live connection to one downstream MCP server.
//!
//! All three transports collapse into the same capability set once
//! connected: `list_tools`, `call_tool`, `ping`, `close`. The session owns
//! the running client; callers hold only a shared peer handle, so calls are
//! serialized through the client's request channel in issue order.

use crate::config::{ServerConfig, TransportConfig};
use crate::error::{ProxyError, Result};
use crate::events::{SessionEvent, SessionEventKind};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rmcp::model::{CallToolRequestParams, CallToolResult, Tool};
use rmcp::service::{Peer, RoleClient, RunningService, ServiceExt as _};
use rmcp::transport::{
    SseClientTransport, StreamableHttpClientTransport, TokioChildProcess,
    sse_client::SseClientConfig,
    streamable_http_client::StreamableHttpClientTransportConfig,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;

type McpClient = RunningService<RoleClient, ()>;

/// Consecutive ping failures tolerated before a session is declared
/// unhealthy and moved to `Reconnecting`.
pub const MAX_PING_FAILURES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
    Closed,
}

impl SessionState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
            Self::Closed => "closed",
        }
    }
}

pub struct Session {
    config: ServerConfig,
    state: RwLock<SessionState>,
    /// Shared request handle. Cleared while disconnected so in-flight
    /// lookups fail fast instead of hanging on a dead transport.
    peer: RwLock<Option<Peer<RoleClient>>>,
    /// The running service, kept only for cancellation on close.
    service: tokio::sync::Mutex<Option<McpClient>>,
    created_at: DateTime<Utc>,
    last_ping_at: RwLock<Option<DateTime<Utc>>>,
    reconnect_attempts: AtomicU32,
    ping_failures: AtomicU32,
    events: broadcast::Sender<SessionEvent>,
}

impl Session {
    pub(crate) fn new(config: ServerConfig, events: broadcast::Sender<SessionEvent>) -> Self {
        Self {
            config,
            state: RwLock::new(SessionState::Idle),
            peer: RwLock::new(None),
            service: tokio::sync::Mutex::new(None),
            created_at: Utc::now(),
            last_ping_at: RwLock::new(None),
            reconnect_attempts: AtomicU32::new(0),
            ping_failures: AtomicU32::new(0),
            events,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub fn last_ping_at(&self) -> Option<DateTime<Utc>> {
        *self.last_ping_at.read()
    }

    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::Relaxed)
    }

    fn set_state(&self, state: SessionState) {
        *self.state.write() = state;
    }

    #[cfg(test)]
    pub(crate) fn force_state(&self, state: SessionState) {
        self.set_state(state);
    }

    fn emit(&self, kind: SessionEventKind) {
        // Fire-and-forget: a send only fails when nobody subscribes.
        let _ = self.events.send(SessionEvent {
            server: self.config.name.clone(),
            kind,
        });
    }

    /// Open the transport and complete the MCP handshake.
    ///
    /// On failure the session is left in `Failed` state; start-up treats
    /// that as non-fatal and the session stays retriable.
    pub async fn connect(&self) -> Result<()> {
        self.set_state(SessionState::Connecting);
        self.emit(SessionEventKind::Connecting);

        match connect_client(&self.config).await {
            Ok(service) => {
                *self.peer.write() = Some(service.peer().clone());
                *self.service.lock().await = Some(service);
                self.ping_failures.store(0, Ordering::Relaxed);
                self.set_state(SessionState::Connected);
                self.emit(SessionEventKind::Connected);
                tracing::info!(
                    server = %self.config.name,
                    transport = %self.config.transport.kind(),
                    "connected to downstream"
                );
                Ok(())
            }
            Err(e) => {
                self.set_state(SessionState::Failed);
                self.emit(SessionEventKind::Error(e.to_string()));
                self.emit(SessionEventKind::Failed);
                tracing::warn!(
                    server = %self.config.name,
                    error = %e,
                    "failed to connect to downstream"
                );
                Err(e)
            }
        }
    }

    /// Tear down any existing client and connect again. Used by the
    /// reconnect task; the attempt counter survives until a connect
    /// succeeds.
    pub async fn reconnect(&self) -> Result<()> {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
        self.drop_client().await;

        match connect_client(&self.config).await {
            Ok(service) => {
                *self.peer.write() = Some(service.peer().clone());
                *self.service.lock().await = Some(service);
                self.ping_failures.store(0, Ordering::Relaxed);
                self.reconnect_attempts.store(0, Ordering::Relaxed);
                self.set_state(SessionState::Connected);
                self.emit(SessionEventKind::Connected);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Mark the session unhealthy after a mid-session transport error.
    /// The manager's health loop picks it up for reconnection.
    pub fn mark_reconnecting(&self) {
        let mut state = self.state.write();
        if *state == SessionState::Connected {
            *state = SessionState::Reconnecting;
            drop(state);
            self.emit(SessionEventKind::Reconnecting);
            tracing::warn!(server = %self.config.name, "session marked for reconnection");
        }
    }

    /// Close the session. Idempotent.
    pub async fn close(&self) {
        self.peer.write().take();
        if let Some(service) = self.service.lock().await.take()
            && let Err(e) = service.cancel().await
        {
            tracing::warn!(server = %self.config.name, error = %e, "error closing session");
        }
        self.set_state(SessionState::Closed);
        self.emit(SessionEventKind::Disconnected);
    }

    async fn drop_client(&self) {
        self.peer.write().take();
        if let Some(service) = self.service.lock().await.take() {
            let _ = service.cancel().await;
        }
    }

    fn peer_handle(&self) -> Result<Peer<RoleClient>> {
        self.peer
            .read()
            .clone()
            .ok_or_else(|| ProxyError::ServerNotConnected(self.config.name.clone()))
    }

    /// Fetch the downstream's current tool list.
    pub async fn list_tools(&self) -> Result<Vec<Tool>> {
        if !self.is_connected() {
            return Err(ProxyError::ServerNotConnected(self.config.name.clone()));
        }
        let peer = self.peer_handle()?;
        peer.list_all_tools()
            .await
            .map_err(|e| ProxyError::Transport(format!("tools/list on '{}': {e}", self.config.name)))
    }

    /// Forward a tool call using the downstream's *original* tool name.
    ///
    /// Transport failures mark the session for reconnection; tool-level
    /// failures come back inside the result and are not treated as session
    /// health signals.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<CallToolResult> {
        if !self.is_connected() {
            return Err(ProxyError::ServerNotConnected(self.config.name.clone()));
        }
        let peer = self.peer_handle()?;
        let params = CallToolRequestParams {
            meta: None,
            name: name.to_string().into(),
            arguments,
            task: None,
        };
        match peer.call_tool(params).await {
            Ok(result) => Ok(result),
            Err(e) => {
                self.mark_reconnecting();
                Err(ProxyError::Transport(format!(
                    "tools/call '{name}' on '{}': {e}",
                    self.config.name
                )))
            }
        }
    }

    /// Lightweight liveness probe: a `tools/list` under a short deadline,
    /// result discarded. Updates the consecutive-failure counter and
    /// returns whether the threshold was crossed.
    pub async fn ping(&self, deadline: Duration) -> PingOutcome {
        let Ok(peer) = self.peer_handle() else {
            return PingOutcome::NotConnected;
        };

        let alive = matches!(
            tokio::time::timeout(deadline, peer.list_all_tools()).await,
            Ok(Ok(_))
        );

        if alive {
            *self.last_ping_at.write() = Some(Utc::now());
            self.ping_failures.store(0, Ordering::Relaxed);
            PingOutcome::Healthy
        } else {
            let failures = self.ping_failures.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::debug!(
                server = %self.config.name,
                consecutive_failures = failures,
                "ping failed"
            );
            if failures >= MAX_PING_FAILURES {
                PingOutcome::Unhealthy
            } else {
                PingOutcome::Degraded
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingOutcome {
    Healthy,
    /// Failed, but still under the consecutive-failure threshold.
    Degraded,
    /// Crossed the threshold; the session should reconnect.
    Unhealthy,
    NotConnected,
}

/// Open a transport per the config's tagged variant and complete the MCP
/// handshake.
async fn connect_client(config: &ServerConfig) -> Result<McpClient> {
    match &config.transport {
        TransportConfig::Stdio { command, args, env } => {
            let mut cmd = tokio::process::Command::new(command);
            cmd.args(args);
            for (k, v) in env {
                cmd.env(k, v);
            }
            cmd.stderr(std::process::Stdio::inherit());

            let transport = TokioChildProcess::new(cmd)
                .map_err(|e| ProxyError::Transport(format!("spawn '{command}': {e}")))?;
            ().serve(transport)
                .await
                .map_err(|e| ProxyError::Transport(format!("initialize stdio client: {e}")))
        }

        TransportConfig::Http { url, headers } => {
            let mut cfg = StreamableHttpClientTransportConfig::with_uri(url.clone());
            // The streamable transport carries a single auth header natively;
            // other headers are not supported on this variant.
            for (k, v) in headers {
                if k.eq_ignore_ascii_case("authorization") {
                    cfg = cfg.auth_header(v.clone());
                } else {
                    tracing::warn!(
                        server = %config.name,
                        header = %k,
                        "ignoring unsupported header on http transport"
                    );
                }
            }
            let transport = StreamableHttpClientTransport::from_config(cfg);
            ().serve(transport)
                .await
                .map_err(|e| ProxyError::Transport(format!("initialize http client: {e}")))
        }

        TransportConfig::Sse { url, headers } => {
            let client = http_client_with_headers(headers)?;
            let cfg = SseClientConfig {
                sse_endpoint: url.clone().into(),
                ..Default::default()
            };
            let transport = SseClientTransport::start_with_client(client, cfg)
                .await
                .map_err(|e| ProxyError::Transport(format!("create sse transport: {e}")))?;
            ().serve(transport)
                .await
                .map_err(|e| ProxyError::Transport(format!("initialize sse client: {e}")))
        }
    }
}

fn http_client_with_headers(headers: &std::collections::HashMap<String, String>) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().connect_timeout(Duration::from_secs(10));
    if !headers.is_empty() {
        let mut map = reqwest::header::HeaderMap::new();
        for (k, v) in headers {
            let name: reqwest::header::HeaderName = k
                .parse()
                .map_err(|e| ProxyError::Config(format!("header name '{k}': {e}")))?;
            let value = v
                .parse()
                .map_err(|e| ProxyError::Config(format!("header value for '{k}': {e}")))?;
            map.insert(name, value);
        }
        builder = builder.default_headers(map);
    }
    builder
        .build()
        .map_err(|e| ProxyError::Transport(format!("build http client: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EVENT_CHANNEL_CAPACITY;
    use std::collections::HashMap;

    fn stdio_session(name: &str) -> (Session, broadcast::Receiver<SessionEvent>) {
        let (tx, rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let session = Session::new(
            ServerConfig {
                name: name.to_string(),
                transport: TransportConfig::Stdio {
                    command: "true".to_string(),
                    args: Vec::new(),
                    env: HashMap::new(),
                },
            },
            tx,
        );
        (session, rx)
    }

    #[test]
    fn new_session_is_idle() {
        let (session, _rx) = stdio_session("s1");
        assert_eq!(session.state(), SessionState::Idle);
        assert!(!session.is_connected());
        assert_eq!(session.reconnect_attempts(), 0);
        assert!(session.last_ping_at().is_none());
    }

    #[tokio::test]
    async fn call_tool_on_disconnected_session_fails() {
        let (session, _rx) = stdio_session("s1");
        let err = session.call_tool("echo", None).await.unwrap_err();
        assert!(matches!(err, ProxyError::ServerNotConnected(name) if name == "s1"));
    }

    #[tokio::test]
    async fn list_tools_on_disconnected_session_fails() {
        let (session, _rx) = stdio_session("s1");
        assert!(matches!(
            session.list_tools().await.unwrap_err(),
            ProxyError::ServerNotConnected(_)
        ));
    }

    #[tokio::test]
    async fn ping_without_client_reports_not_connected() {
        let (session, _rx) = stdio_session("s1");
        let outcome = session.ping(Duration::from_millis(100)).await;
        assert_eq!(outcome, PingOutcome::NotConnected);
    }

    #[test]
    fn mark_reconnecting_only_affects_connected_sessions() {
        let (session, mut rx) = stdio_session("s1");
        session.mark_reconnecting();
        assert_eq!(session.state(), SessionState::Idle);
        assert!(rx.try_recv().is_err());

        session.set_state(SessionState::Connected);
        session.mark_reconnecting();
        assert_eq!(session.state(), SessionState::Reconnecting);
        let event = rx.try_recv().expect("reconnecting event");
        assert_eq!(event.kind, SessionEventKind::Reconnecting);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (session, _rx) = stdio_session("s1");
        session.close().await;
        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);
    }
}
