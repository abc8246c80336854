//! Component wiring and startup/shutdown sequencing.
//!
//! Startup order matters: sessions connect first, the initial discovery
//! pass fills the catalog, the refresh timer starts, then the last
//! equipped toolset is restored so the front-end can pick its initial
//! mode. Watcher tasks keep the active toolset re-validated as the catalog
//! and connectivity move underneath it.

use crate::config::ProxyConfig;
use crate::connection::ConnectionManager;
use crate::discovery::DiscoveryEngine;
use crate::events::SessionEventKind;
use crate::router::Router;
use crate::server::Mode;
use crate::toolset::ToolsetManager;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use toolscope_store::Store;

pub struct ProxyRuntime {
    pub connections: Arc<ConnectionManager>,
    pub discovery: Arc<DiscoveryEngine>,
    pub router: Arc<Router>,
    pub toolsets: Arc<ToolsetManager>,
    cancel: CancellationToken,
}

impl ProxyRuntime {
    /// Wire all components from configuration. Nothing connects yet.
    #[must_use]
    pub fn build(config: &ProxyConfig, store: Store) -> Self {
        let settings = &config.proxy;
        let connections = Arc::new(ConnectionManager::new(config.server_configs(), settings));
        let discovery = Arc::new(DiscoveryEngine::new(Arc::clone(&connections), settings));
        let router = Arc::new(Router::new(
            Arc::clone(&connections),
            Arc::clone(&discovery),
            settings.call_timeout(),
            settings.validate_params,
        ));
        let toolsets = Arc::new(ToolsetManager::new(
            store,
            Arc::clone(&discovery),
            Arc::clone(&connections),
            settings,
        ));

        Self {
            connections,
            discovery,
            router,
            toolsets,
            cancel: CancellationToken::new(),
        }
    }

    /// Bring the proxy up and return the front-end's initial mode.
    pub async fn start(&self) -> Mode {
        self.connections.start().await;
        self.discovery.discover(None).await;
        self.discovery.start();

        match self.toolsets.restore_last_equipped().await {
            Ok(Some(name)) => tracing::info!(toolset = %name, "restored last equipped toolset"),
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "failed to restore last equipped toolset"),
        }

        self.spawn_catalog_watcher();
        self.spawn_session_watcher();

        if self.toolsets.has_active().await {
            Mode::Normal
        } else {
            Mode::Configuration
        }
    }

    /// Cooperative shutdown: stop timers and watchers, then close all
    /// downstream sessions.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.discovery.stop();
        self.connections.stop().await;
    }

    /// Re-validate the active toolset whenever the catalog changes.
    fn spawn_catalog_watcher(&self) {
        let mut events = self.discovery.subscribe();
        let toolsets = Arc::clone(&self.toolsets);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(change) => {
                            tracing::debug!(server = %change.server, "catalog changed; revalidating toolset");
                            toolsets.revalidate_active().await;
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => {
                            toolsets.revalidate_active().await;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
    }

    /// React to session lifecycle: a (re)connected server gets a fresh
    /// discovery pass; any connectivity change re-validates the exposure.
    fn spawn_session_watcher(&self) {
        let mut events = self.connections.subscribe();
        let discovery = Arc::clone(&self.discovery);
        let toolsets = Arc::clone(&self.toolsets);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = cancel.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(event) => match event.kind {
                        SessionEventKind::Connected => {
                            discovery.discover(Some(&event.server)).await;
                            toolsets.revalidate_active().await;
                        }
                        SessionEventKind::Disconnected
                        | SessionEventKind::Reconnecting
                        | SessionEventKind::Failed => {
                            toolsets.revalidate_active().await;
                        }
                        SessionEventKind::Connecting | SessionEventKind::Error(_) => {}
                    },
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        toolsets.revalidate_active().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}
