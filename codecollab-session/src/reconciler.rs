//! Session reconciler: wire messages in, document state and outbound
//! messages out.
//!
//! The server broadcasts every edit to every participant, the author
//! included. An inbound update stamped with our own identity is an echo of
//! an edit the surface already shows, so it is dropped instead of being
//! re-applied over the user's cursor.
//!
//! Applying a remote document replaces the surface content, and the surface
//! reports that as a change event of its own. The echo guard swallows that
//! single event so it does not bounce back to the server. Only an accepted
//! remote document update arms it; the handshake does not. The guard is
//! one-shot and expires after a short window, so a late clear can never
//! freeze local editing.

use std::time::Duration;

use tokio::time::Instant;

use crate::protocol::{Envelope, Language, ParticipantId, ProtocolError, SpaceSnapshot};

/// What the editing surface displays.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionDocument {
    pub content: String,
    pub language: Language,
}

impl SessionDocument {
    pub fn new(content: impl Into<String>, language: Language) -> Self {
        Self {
            content: content.into(),
            language,
        }
    }
}

impl TryFrom<SpaceSnapshot> for SessionDocument {
    type Error = ProtocolError;

    fn try_from(snapshot: SpaceSnapshot) -> Result<Self, Self::Error> {
        let language = snapshot.language()?;
        Ok(Self {
            content: snapshot.code,
            language,
        })
    }
}

/// Domain events produced from inbound messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Handshake received; the document was replaced wholesale.
    Joined {
        participant: ParticipantId,
        document: SessionDocument,
        presence: u32,
    },
    /// A peer replaced the document content.
    DocumentReplaced(String),
    /// A peer switched the language.
    LanguageChanged(Language),
    /// Participant count changed.
    PresenceChanged(u32),
}

/// Default lifetime of the echo guard.
pub const DEFAULT_ECHO_GUARD: Duration = Duration::from_millis(100);

pub struct SessionReconciler {
    document: SessionDocument,
    participant: Option<ParticipantId>,
    presence: u32,
    /// Deadline of the armed echo guard
    echo_guard: Option<Instant>,
    echo_window: Duration,
}

impl SessionReconciler {
    /// Start from the fetched snapshot. Presence is 1 (ourselves) until the
    /// server says otherwise.
    pub fn new(document: SessionDocument, echo_window: Duration) -> Self {
        Self {
            document,
            participant: None,
            presence: 1,
            echo_guard: None,
            echo_window,
        }
    }

    pub fn document(&self) -> &SessionDocument {
        &self.document
    }

    pub fn participant(&self) -> Option<&ParticipantId> {
        self.participant.as_ref()
    }

    pub fn presence(&self) -> u32 {
        self.presence
    }

    /// `false` until the handshake arrives.
    pub fn is_joined(&self) -> bool {
        self.participant.is_some()
    }

    /// Whether the next surface change will be treated as remote-caused.
    pub fn echo_guard_armed(&self) -> bool {
        self.echo_guard
            .is_some_and(|deadline| Instant::now() < deadline)
    }

    /// Apply one inbound message. Returns the event the surface should see,
    /// or `None` when the message was an echo of our own edit.
    pub fn handle_inbound(&mut self, envelope: Envelope) -> Option<SessionEvent> {
        match envelope {
            Envelope::Init {
                user_id,
                code,
                language,
                active_users,
            } => {
                log::info!("joined session as {user_id} ({active_users} online)");
                self.participant = Some(user_id.clone());
                self.document = SessionDocument::new(code, language);
                self.presence = active_users;
                Some(SessionEvent::Joined {
                    participant: user_id,
                    document: self.document.clone(),
                    presence: active_users,
                })
            }
            Envelope::CodeChange { user_id, code } => {
                if self.is_own(user_id.as_ref()) {
                    log::debug!("ignoring echo of own code_change");
                    return None;
                }
                self.document.content = code.clone();
                self.arm_echo_guard();
                Some(SessionEvent::DocumentReplaced(code))
            }
            Envelope::LanguageChange { user_id, language } => {
                if self.is_own(user_id.as_ref()) {
                    log::debug!("ignoring echo of own language_change");
                    return None;
                }
                self.document.language = language;
                Some(SessionEvent::LanguageChanged(language))
            }
            Envelope::UserJoin { active_users } | Envelope::UserLeave { active_users } => {
                self.presence = active_users;
                Some(SessionEvent::PresenceChanged(active_users))
            }
        }
    }

    /// The surface reported new content. Returns the message to transmit,
    /// or `None` if the change was caused by a remote update.
    pub fn emit_edit(&mut self, content: impl Into<String>) -> Option<Envelope> {
        if let Some(deadline) = self.echo_guard.take() {
            if Instant::now() < deadline {
                log::debug!("surface change caused by remote update, not re-emitting");
                return None;
            }
        }
        let content = content.into();
        self.document.content = content.clone();
        Some(Envelope::code_change(content))
    }

    /// The user picked a language. Always transmitted.
    pub fn emit_language_change(&mut self, language: Language) -> Envelope {
        self.document.language = language;
        Envelope::language_change(language)
    }

    fn is_own(&self, origin: Option<&ParticipantId>) -> bool {
        matches!((origin, self.participant.as_ref()), (Some(a), Some(b)) if a == b)
    }

    fn arm_echo_guard(&mut self) {
        self.echo_guard = Some(Instant::now() + self.echo_window);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn joined(id: &str) -> SessionReconciler {
        let mut reconciler = SessionReconciler::new(
            SessionDocument::new("// Loading...", Language::Python),
            DEFAULT_ECHO_GUARD,
        );
        reconciler.handle_inbound(Envelope::Init {
            user_id: ParticipantId::new(id),
            code: String::new(),
            language: Language::Python,
            active_users: 2,
        });
        reconciler
    }

    fn code_from(origin: &str, code: &str) -> Envelope {
        Envelope::CodeChange {
            user_id: Some(ParticipantId::new(origin)),
            code: code.into(),
        }
    }

    #[tokio::test]
    async fn test_init_replaces_everything() {
        let mut reconciler =
            SessionReconciler::new(SessionDocument::new("old", Language::Go), DEFAULT_ECHO_GUARD);
        assert!(!reconciler.is_joined());
        assert_eq!(reconciler.presence(), 1);

        let event = reconciler.handle_inbound(Envelope::Init {
            user_id: ParticipantId::new("me"),
            code: "fn main() {}".into(),
            language: Language::Rust,
            active_users: 3,
        });

        let expected_doc = SessionDocument::new("fn main() {}", Language::Rust);
        assert_eq!(
            event,
            Some(SessionEvent::Joined {
                participant: ParticipantId::new("me"),
                document: expected_doc.clone(),
                presence: 3,
            })
        );
        assert!(reconciler.is_joined());
        assert_eq!(reconciler.presence(), 3);
        assert_eq!(reconciler.document(), &expected_doc);
    }

    #[tokio::test]
    async fn test_own_echo_is_ignored() {
        let mut reconciler = joined("alice");

        // Local edit goes out
        let outbound = reconciler.emit_edit("x=1").expect("local edit is sent");
        assert_eq!(outbound, Envelope::code_change("x=1"));

        // User keeps typing before the echo arrives
        reconciler.emit_edit("x=12");

        // Echo of the first edit must not revert the live document
        assert_eq!(reconciler.handle_inbound(code_from("alice", "x=1")), None);
        assert_eq!(reconciler.document().content, "x=12");
        assert!(!reconciler.echo_guard_armed());

        // And produces no extra outbound traffic
        assert!(reconciler.emit_edit("x=123").is_some());
    }

    #[tokio::test]
    async fn test_peer_edit_is_applied() {
        let mut reconciler = joined("bob");

        let event = reconciler.handle_inbound(code_from("alice", "x=1"));

        assert_eq!(event, Some(SessionEvent::DocumentReplaced("x=1".into())));
        assert_eq!(reconciler.document().content, "x=1");
    }

    #[tokio::test]
    async fn test_edit_without_origin_is_foreign() {
        let mut reconciler = joined("bob");
        let event = reconciler.handle_inbound(Envelope::code_change("anon"));
        assert_eq!(event, Some(SessionEvent::DocumentReplaced("anon".into())));
    }

    #[tokio::test]
    async fn test_edits_before_join_are_applied() {
        let mut reconciler = SessionReconciler::new(SessionDocument::default(), DEFAULT_ECHO_GUARD);
        reconciler.handle_inbound(code_from("someone", "early"));
        assert_eq!(reconciler.document().content, "early");
    }

    #[tokio::test]
    async fn test_last_peer_message_wins() {
        let mut reconciler = joined("bob");

        for i in 0..50 {
            let code = format!("v{i}");
            let event = reconciler.handle_inbound(code_from("alice", &code));
            assert_eq!(event, Some(SessionEvent::DocumentReplaced(code)));
        }
        assert_eq!(reconciler.document().content, "v49");
    }

    #[tokio::test(start_paused = true)]
    async fn test_surface_echo_of_remote_update_is_not_resent() {
        let mut reconciler = joined("bob");
        reconciler.handle_inbound(code_from("alice", "remote"));
        assert!(reconciler.echo_guard_armed());

        // The surface reports the value we just set
        assert_eq!(reconciler.emit_edit("remote"), None);

        // One-shot: the next keystroke goes out
        assert_eq!(
            reconciler.emit_edit("remote!"),
            Some(Envelope::code_change("remote!"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_echo_guard_expires() {
        let mut reconciler = joined("bob");
        reconciler.handle_inbound(code_from("alice", "remote"));

        tokio::time::advance(DEFAULT_ECHO_GUARD + Duration::from_millis(1)).await;
        assert!(!reconciler.echo_guard_armed());

        assert_eq!(
            reconciler.emit_edit("typed later"),
            Some(Envelope::code_change("typed later"))
        );
        assert_eq!(reconciler.document().content, "typed later");
    }

    #[tokio::test(start_paused = true)]
    async fn test_edit_right_after_handshake_is_emitted() {
        let mut reconciler = SessionReconciler::new(
            SessionDocument::new("same", Language::Python),
            DEFAULT_ECHO_GUARD,
        );
        reconciler.handle_inbound(Envelope::Init {
            user_id: ParticipantId::new("me"),
            code: "same".into(),
            language: Language::Python,
            active_users: 1,
        });
        assert!(!reconciler.echo_guard_armed());

        assert_eq!(
            reconciler.emit_edit("same!"),
            Some(Envelope::code_change("same!"))
        );
        assert_eq!(reconciler.document().content, "same!");
    }

    #[tokio::test]
    async fn test_language_echo_and_peer_change() {
        let mut reconciler = joined("bob");

        let own = Envelope::LanguageChange {
            user_id: Some(ParticipantId::new("bob")),
            language: Language::Java,
        };
        assert_eq!(reconciler.handle_inbound(own), None);
        assert_eq!(reconciler.document().language, Language::Python);

        let peer = Envelope::LanguageChange {
            user_id: Some(ParticipantId::new("alice")),
            language: Language::Kotlin,
        };
        assert_eq!(
            reconciler.handle_inbound(peer),
            Some(SessionEvent::LanguageChanged(Language::Kotlin))
        );
        assert_eq!(reconciler.document().language, Language::Kotlin);
    }

    #[tokio::test(start_paused = true)]
    async fn test_language_change_always_emitted() {
        let mut reconciler = joined("bob");
        reconciler.handle_inbound(code_from("alice", "remote"));

        // Not subject to the echo guard
        let outbound = reconciler.emit_language_change(Language::Rust);
        assert_eq!(outbound, Envelope::language_change(Language::Rust));
        assert_eq!(reconciler.document().language, Language::Rust);
        assert!(reconciler.echo_guard_armed());
    }

    #[tokio::test]
    async fn test_presence_updates_unconditionally() {
        let mut reconciler = SessionReconciler::new(SessionDocument::default(), DEFAULT_ECHO_GUARD);

        assert_eq!(
            reconciler.handle_inbound(Envelope::UserJoin { active_users: 4 }),
            Some(SessionEvent::PresenceChanged(4))
        );
        assert_eq!(
            reconciler.handle_inbound(Envelope::UserLeave { active_users: 3 }),
            Some(SessionEvent::PresenceChanged(3))
        );
        assert_eq!(reconciler.presence(), 3);
        assert!(!reconciler.is_joined());
    }

    #[test]
    fn test_document_from_snapshot() {
        let snapshot = SpaceSnapshot {
            code: "<p></p>".into(),
            language: "html".into(),
        };
        let doc = SessionDocument::try_from(snapshot).unwrap();
        assert_eq!(doc, SessionDocument::new("<p></p>", Language::Html));

        let bad = SpaceSnapshot {
            code: String::new(),
            language: "klingon".into(),
        };
        assert!(SessionDocument::try_from(bad).is_err());
    }
}
