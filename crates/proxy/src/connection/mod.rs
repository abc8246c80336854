//! Downstream connection management.
//!
//! The manager owns one [`Session`] per configured downstream, brings them
//! up in bounded parallel at startup, monitors health with a periodic ping,
//! and reconnects unhealthy sessions with exponential backoff until told to
//! stop. The registry is fixed at construction; only the manager mutates
//! session lifecycle.

pub mod guard;
pub mod session;

pub use session::{MAX_PING_FAILURES, PingOutcome, Session, SessionState};

use crate::config::{ProxySettings, ServerConfig};
use crate::events::{EVENT_CHANNEL_CAPACITY, SessionEvent};
use backoff::backoff::Backoff as _;
use futures::StreamExt as _;
use guard::SelfIdentity;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Deadline for a single health-check probe.
const PING_DEADLINE: Duration = Duration::from_secs(10);

pub struct ConnectionManager {
    sessions: HashMap<String, Arc<Session>>,
    /// Configs dropped by the self-reference guard: `(name, reason)`.
    skipped: Vec<(String, String)>,
    reconnect_in_flight: HashMap<String, Arc<AtomicBool>>,
    events: broadcast::Sender<SessionEvent>,
    max_concurrent_connections: usize,
    health_check_interval: Duration,
    cancel: CancellationToken,
}

impl ConnectionManager {
    /// Register configurations without connecting. Configs matching the
    /// self-reference guard are dropped here with a warning.
    #[must_use]
    pub fn new(configs: Vec<ServerConfig>, settings: &ProxySettings) -> Self {
        Self::with_identity(configs, settings, &SelfIdentity::current())
    }

    fn with_identity(
        configs: Vec<ServerConfig>,
        settings: &ProxySettings,
        identity: &SelfIdentity,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let mut sessions = HashMap::new();
        let mut reconnect_in_flight = HashMap::new();
        let mut skipped = Vec::new();

        for config in configs {
            if let Some(reason) = guard::self_reference(&config, identity) {
                tracing::warn!(server = %config.name, reason = %reason, "dropping self-referential server config");
                skipped.push((config.name, reason));
                continue;
            }
            let name = config.name.clone();
            sessions.insert(name.clone(), Arc::new(Session::new(config, events.clone())));
            reconnect_in_flight.insert(name, Arc::new(AtomicBool::new(false)));
        }

        Self {
            sessions,
            skipped,
            reconnect_in_flight,
            events,
            max_concurrent_connections: settings.max_concurrent_connections,
            health_check_interval: settings.health_check_interval(),
            cancel: CancellationToken::new(),
        }
    }

    /// Open every session, at most `max_concurrent_connections` connects in
    /// flight at once, then install the health-check loop. Individual
    /// connect failures are non-fatal.
    pub async fn start(self: &Arc<Self>) {
        futures::stream::iter(self.sessions.values().cloned())
            .for_each_concurrent(self.max_concurrent_connections, |session| async move {
                let _ = session.connect().await;
            })
            .await;

        tracing::info!(
            configured = self.sessions.len(),
            connected = self.connected_names().len(),
            skipped = self.skipped.len(),
            "connection manager started"
        );

        self.spawn_health_loop();
    }

    /// Close all sessions concurrently, swallowing individual errors, and
    /// stop the health loop.
    pub async fn stop(&self) {
        self.cancel.cancel();
        futures::future::join_all(
            self.sessions
                .values()
                .map(|session| async move { session.close().await }),
        )
        .await;
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Session>> {
        self.sessions.get(name).cloned()
    }

    #[must_use]
    pub fn is_connected(&self, name: &str) -> bool {
        self.sessions.get(name).is_some_and(|s| s.is_connected())
    }

    #[must_use]
    pub fn connected_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .sessions
            .values()
            .filter(|s| s.is_connected())
            .map(|s| s.name().to_string())
            .collect();
        names.sort();
        names
    }

    #[must_use]
    pub fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sessions.keys().cloned().collect();
        names.sort();
        names
    }

    /// Configs dropped by the self-reference guard, for diagnostics.
    #[must_use]
    pub fn skipped_servers(&self) -> &[(String, String)] {
        &self.skipped
    }

    /// Subscribe to session lifecycle events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn spawn_health_loop(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.health_check_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so startup results
            // settle before the first probe.
            interval.tick().await;

            loop {
                tokio::select! {
                    () = manager.cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }

                for session in manager.sessions.values() {
                    match session.state() {
                        SessionState::Connected => {
                            if session.ping(PING_DEADLINE).await == PingOutcome::Unhealthy {
                                session.mark_reconnecting();
                                manager.spawn_reconnect(Arc::clone(session));
                            }
                        }
                        SessionState::Reconnecting => {
                            manager.spawn_reconnect(Arc::clone(session));
                        }
                        _ => {}
                    }
                }
            }
        });
    }

    /// Reconnect with exponential backoff (1 s base, ×2, ±20 % jitter,
    /// 60 s cap) until success or shutdown. At most one task per session.
    fn spawn_reconnect(self: &Arc<Self>, session: Arc<Session>) {
        let Some(flag) = self.reconnect_in_flight.get(session.name()).cloned() else {
            return;
        };
        if flag.swap(true, Ordering::SeqCst) {
            return;
        }

        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut policy = backoff::ExponentialBackoffBuilder::new()
                .with_initial_interval(Duration::from_secs(1))
                .with_multiplier(2.0)
                .with_randomization_factor(0.2)
                .with_max_interval(Duration::from_secs(60))
                .with_max_elapsed_time(None)
                .build();

            loop {
                if cancel.is_cancelled() {
                    break;
                }
                match session.reconnect().await {
                    Ok(()) => {
                        tracing::info!(
                            server = %session.name(),
                            "reconnected to downstream"
                        );
                        break;
                    }
                    Err(e) => {
                        let delay = policy
                            .next_backoff()
                            .unwrap_or(Duration::from_secs(60));
                        tracing::warn!(
                            server = %session.name(),
                            attempt = session.reconnect_attempts(),
                            error = %e,
                            retry_in_ms = delay.as_millis() as u64,
                            "reconnect attempt failed"
                        );
                        tokio::select! {
                            () = cancel.cancelled() => break,
                            () = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
            flag.store(false, Ordering::SeqCst);
        });
    }
}
