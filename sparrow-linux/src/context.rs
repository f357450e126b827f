//! State shared by the facade and every session task, and the lifecycle events they emit.

use std::sync::{Arc, RwLock};

use sparrow_core::{KeyDerivation, NmdcKey, User};
use tokio::sync::broadcast;

use crate::registry::Registry;
use crate::router::Router;

/// Connection lifecycle, reported to whoever holds `Client::events()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// `$Hello` received; the hub session is ready.
    HubReady,
    /// The hub session ended. The rest of the client keeps running.
    HubLost { reason: String },
    PeerConnected { nick: String },
    /// A peer session ended, cleanly or not. Its route and topic are already released.
    PeerDisconnected { nick: String, error: Option<String> },
    /// A peer delivered an announced payload.
    PayloadReceived { nick: String, bytes: u64 },
}

/// Handles every task needs. Cheap to clone.
#[derive(Clone)]
pub struct Shared {
    pub registry: Arc<Registry>,
    pub router: Arc<Router>,
    pub events: broadcast::Sender<ClientEvent>,
    pub keys: Arc<dyn KeyDerivation>,
    pub user: Arc<RwLock<User>>,
}

impl Shared {
    pub fn new(registry: Registry, router: Router, user: User) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            registry: Arc::new(registry),
            router: Arc::new(router),
            events,
            keys: Arc::new(NmdcKey),
            user: Arc::new(RwLock::new(user)),
        }
    }

    /// Emit a lifecycle event. Nobody listening is fine.
    pub fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    pub fn nick(&self) -> String {
        self.user.read().unwrap_or_else(|e| e.into_inner()).nick.clone()
    }

    pub fn share_size(&self) -> u64 {
        self.user.read().unwrap_or_else(|e| e.into_inner()).share_size
    }
}
