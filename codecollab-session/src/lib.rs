//! # codecollab-session: Realtime session client for shared code documents
//!
//! Keeps one participant's view of a shared document in step with every
//! other participant over a single WebSocket per session.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐   local edit    ┌───────────────────┐
//! │ editing surface  │ ──────────────► │ SessionReconciler │
//! │ (external)       │ ◄────────────── │ (echo filtering)  │
//! └──────────────────┘  SessionEvent   └─────────┬─────────┘
//!                                                │ Envelope
//!                                      ┌─────────▼─────────┐
//!                                      │ ConnectionManager │
//!                                      │ (reconnect loop)  │
//!                                      └─────────┬─────────┘
//!                                                │ JSON text frames
//!                                      ┌─────────▼─────────┐
//!                                      │ session server    │
//!                                      │ (broadcast to all)│
//!                                      └───────────────────┘
//! ```
//!
//! The protocol is "last full document wins": every edit carries the whole
//! document and there is no merge. The client's job is keeping the
//! connection alive and never re-applying its own echoed edits.
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire envelopes, languages, participant identity
//! - [`reconnect`]: Backoff policy and the pure connection lifecycle
//! - [`client`]: Connection manager driving the socket
//! - [`reconciler`]: Inbound/outbound reconciliation and echo suppression
//! - [`session`]: Connection manager and reconciler wired together
//! - [`config`]: Configuration layering and endpoint construction

pub mod protocol;
pub mod reconnect;
pub mod client;
pub mod reconciler;
pub mod session;
pub mod config;

// Re-exports for convenience
pub use protocol::{
    CreateSpace, CreatedSpace, Envelope, Language, ParticipantId, ProtocolError, SpaceSnapshot,
};
pub use reconnect::{
    ConnectionError, ConnectionState, Directive, Lifecycle, ReconnectConfig, ReconnectPolicy,
};
pub use client::{ConnectionManager, ConnectionStatus, MessageHandler};
pub use reconciler::{SessionDocument, SessionEvent, SessionReconciler, DEFAULT_ECHO_GUARD};
pub use session::CollabSession;
pub use config::{invite_link, ConfigError, SessionConfig};
