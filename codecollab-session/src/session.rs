//! One collaborative session: a [`ConnectionManager`] wired to a
//! [`SessionReconciler`].
//!
//! ```text
//!  surface edit ─► emit_edit ─► SessionReconciler ─► ConnectionManager ─► server
//!                                     ▲                     │
//!  surface ◄─ SessionEvent (mpsc) ◄───┴── handle_inbound ◄──┘
//! ```
//!
//! Connectivity is read from [`CollabSession::subscribe_status`]; document,
//! language and presence changes arrive as [`SessionEvent`]s.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, watch};

use crate::client::{ConnectionManager, ConnectionStatus};
use crate::config::{ConfigError, SessionConfig};
use crate::protocol::{Language, ParticipantId};
use crate::reconciler::{SessionDocument, SessionEvent, SessionReconciler};

pub struct CollabSession {
    space_id: String,
    endpoint: String,
    connection: ConnectionManager,
    reconciler: Arc<Mutex<SessionReconciler>>,
    event_rx: Option<mpsc::UnboundedReceiver<SessionEvent>>,
}

impl CollabSession {
    /// Create a session for `space_id`, seeded with the fetched snapshot.
    ///
    /// Nothing connects until [`start`](Self::start).
    pub fn new(
        config: &SessionConfig,
        space_id: &str,
        snapshot: SessionDocument,
    ) -> Result<Self, ConfigError> {
        let endpoint = config.endpoint(space_id)?;
        let reconciler = Arc::new(Mutex::new(SessionReconciler::new(
            snapshot,
            config.echo_guard(),
        )));
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let connection = ConnectionManager::new(config.reconnect.clone());
        let inbound = reconciler.clone();
        connection.on_message(move |envelope| {
            let event = lock(&inbound).handle_inbound(envelope);
            if let Some(event) = event {
                let _ = event_tx.send(event);
            }
        });

        Ok(Self {
            space_id: space_id.to_string(),
            endpoint,
            connection,
            reconciler,
            event_rx: Some(event_rx),
        })
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.event_rx.take()
    }

    pub fn start(&self) {
        self.set_enabled(true);
    }

    /// Enable or disable the connection without discarding session state.
    pub fn set_enabled(&self, enabled: bool) {
        self.connection.start(self.endpoint.clone(), enabled);
    }

    /// Forward a surface change. Returns `false` when it was swallowed as
    /// the surface's own reaction to a remote update.
    pub fn emit_edit(&self, content: impl Into<String>) -> bool {
        let outbound = lock(&self.reconciler).emit_edit(content);
        match outbound {
            Some(envelope) => {
                self.connection.send(envelope);
                true
            }
            None => false,
        }
    }

    pub fn emit_language_change(&self, language: Language) {
        let envelope = lock(&self.reconciler).emit_language_change(language);
        self.connection.send(envelope);
    }

    pub fn document(&self) -> SessionDocument {
        lock(&self.reconciler).document().clone()
    }

    pub fn presence(&self) -> u32 {
        lock(&self.reconciler).presence()
    }

    pub fn participant(&self) -> Option<ParticipantId> {
        lock(&self.reconciler).participant().cloned()
    }

    /// `false` while waiting for the handshake.
    pub fn is_joined(&self) -> bool {
        lock(&self.reconciler).is_joined()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.connection.subscribe()
    }

    pub fn space_id(&self) -> &str {
        &self.space_id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Close the connection and cancel any pending reconnect.
    pub async fn stop(&self) {
        self.connection.stop().await;
    }

    /// Stop and release the connection driver.
    pub async fn shutdown(self) {
        self.connection.shutdown().await;
    }
}

fn lock(reconciler: &Mutex<SessionReconciler>) -> MutexGuard<'_, SessionReconciler> {
    reconciler.lock().unwrap_or_else(PoisonError::into_inner)
}
