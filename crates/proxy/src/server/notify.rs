//! Best-effort `tools/list_changed` broadcasting.
//!
//! Peers register at `initialize` time and are notified whenever the
//! exposed tool surface changes. Unreachable peers are pruned on send; a
//! failed notification never propagates to the caller.

use parking_lot::RwLock;
use rmcp::service::{Peer, RoleServer};

#[derive(Default)]
pub struct ListChangedNotifier {
    peers: RwLock<Vec<Peer<RoleServer>>>,
}

impl ListChangedNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe_peer(&self, peer: Peer<RoleServer>) {
        self.peers.write().push(peer);
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    /// Send `tools/list_changed` to every live peer, dropping peers whose
    /// transport has gone away.
    pub async fn notify_tool_list_changed(&self) {
        let peers: Vec<Peer<RoleServer>> = self.peers.read().clone();
        if peers.is_empty() {
            return;
        }

        for peer in peers {
            if peer.is_transport_closed() {
                continue;
            }
            if let Err(e) = peer.notify_tool_list_changed().await {
                tracing::debug!(error = %e, "failed to send tools/list_changed");
            }
        }

        // Prune peers whose transport has gone away. Registration can race
        // with a send, so pruning works on the live list, not a snapshot.
        self.peers.write().retain(|p| !p.is_transport_closed());
    }
}
