//! JSON wire protocol for session messages.
//!
//! Every frame is one JSON object discriminated by its `type` field:
//!
//! ```text
//! type              direction         fields
//! ────────────────  ────────────────  ─────────────────────────────────────────
//! init              server → client   user_id, code, language, active_users
//! code_change       both              user_id (origin, server-stamped), code
//! language_change   both              user_id (origin, server-stamped), language
//! user_join         server → client   active_users
//! user_leave        server → client   active_users
//! ```
//!
//! Outbound edits leave `user_id` out; the server attaches the origin before
//! broadcasting the message to every participant, the author included.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Server-assigned identity of one participant.
///
/// Opaque to the client; only ever compared for equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Languages a session document can be declared as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    Python,
    JavaScript,
    TypeScript,
    Java,
    Cpp,
    CSharp,
    Go,
    Rust,
    Php,
    Ruby,
    Swift,
    Kotlin,
    Sql,
    Html,
    Css,
    Json,
    Markdown,
}

impl Language {
    /// Every supported language, in selector order.
    pub const ALL: [Language; 17] = [
        Language::Python,
        Language::JavaScript,
        Language::TypeScript,
        Language::Java,
        Language::Cpp,
        Language::CSharp,
        Language::Go,
        Language::Rust,
        Language::Php,
        Language::Ruby,
        Language::Swift,
        Language::Kotlin,
        Language::Sql,
        Language::Html,
        Language::Css,
        Language::Json,
        Language::Markdown,
    ];

    /// Wire tag, e.g. `"cpp"`.
    pub fn tag(self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::TypeScript => "typescript",
            Language::Java => "java",
            Language::Cpp => "cpp",
            Language::CSharp => "csharp",
            Language::Go => "go",
            Language::Rust => "rust",
            Language::Php => "php",
            Language::Ruby => "ruby",
            Language::Swift => "swift",
            Language::Kotlin => "kotlin",
            Language::Sql => "sql",
            Language::Html => "html",
            Language::Css => "css",
            Language::Json => "json",
            Language::Markdown => "markdown",
        }
    }

    /// Human-readable label, e.g. `"C++"`.
    pub fn label(self) -> &'static str {
        match self {
            Language::Python => "Python",
            Language::JavaScript => "JavaScript",
            Language::TypeScript => "TypeScript",
            Language::Java => "Java",
            Language::Cpp => "C++",
            Language::CSharp => "C#",
            Language::Go => "Go",
            Language::Rust => "Rust",
            Language::Php => "PHP",
            Language::Ruby => "Ruby",
            Language::Swift => "Swift",
            Language::Kotlin => "Kotlin",
            Language::Sql => "SQL",
            Language::Html => "HTML",
            Language::Css => "CSS",
            Language::Json => "JSON",
            Language::Markdown => "Markdown",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Language {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Language::ALL
            .iter()
            .copied()
            .find(|lang| lang.tag() == s)
            .ok_or_else(|| ProtocolError::UnsupportedLanguage(s.to_string()))
    }
}

/// One wire message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// Handshake, sent once per connection right after the server accepts it.
    Init {
        user_id: ParticipantId,
        code: String,
        language: Language,
        active_users: u32,
    },
    /// Full document replacement.
    CodeChange {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<ParticipantId>,
        code: String,
    },
    LanguageChange {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<ParticipantId>,
        language: Language,
    },
    UserJoin {
        active_users: u32,
    },
    UserLeave {
        active_users: u32,
    },
}

/// `type` tags this client understands.
const KNOWN_TYPES: [&str; 5] = [
    "init",
    "code_change",
    "language_change",
    "user_join",
    "user_leave",
];

impl Envelope {
    /// Outbound document edit (origin left for the server to stamp).
    pub fn code_change(code: impl Into<String>) -> Self {
        Envelope::CodeChange {
            user_id: None,
            code: code.into(),
        }
    }

    /// Outbound language selection.
    pub fn language_change(language: Language) -> Self {
        Envelope::LanguageChange {
            user_id: None,
            language,
        }
    }

    /// The `type` tag of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Init { .. } => "init",
            Envelope::CodeChange { .. } => "code_change",
            Envelope::LanguageChange { .. } => "language_change",
            Envelope::UserJoin { .. } => "user_join",
            Envelope::UserLeave { .. } => "user_leave",
        }
    }

    /// Participant identity carried by the message: the assigned identity for
    /// `init`, the stamped origin for document and language updates.
    pub fn origin(&self) -> Option<&ParticipantId> {
        match self {
            Envelope::Init { user_id, .. } => Some(user_id),
            Envelope::CodeChange { user_id, .. } | Envelope::LanguageChange { user_id, .. } => {
                user_id.as_ref()
            }
            Envelope::UserJoin { .. } | Envelope::UserLeave { .. } => None,
        }
    }

    /// Serialize to a text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse one text frame.
    ///
    /// Distinguishes garbage, unknown message types and unsupported languages
    /// so the caller can log something useful before discarding the frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        let kind = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| ProtocolError::Malformed("missing `type` field".to_string()))?;
        if !KNOWN_TYPES.contains(&kind) {
            return Err(ProtocolError::UnknownType(kind.to_string()));
        }

        if let Some(tag) = value.get("language").and_then(|l| l.as_str()) {
            tag.parse::<Language>()?;
        }

        serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Parse a binary frame holding UTF-8 JSON.
    pub fn decode_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(bytes).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        Self::decode(text)
    }
}

/// Body of the document snapshot fetched before a session starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceSnapshot {
    pub code: String,
    pub language: String,
}

impl SpaceSnapshot {
    pub fn language(&self) -> Result<Language, ProtocolError> {
        self.language.parse()
    }
}

/// Body of a session creation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSpace {
    pub language: Language,
    pub initial_code: String,
}

/// Placeholder document of a freshly created session.
pub const DEFAULT_INITIAL_CODE: &str = "# Start coding here...\n";

impl CreateSpace {
    pub fn new(language: Language) -> Self {
        Self {
            language,
            initial_code: DEFAULT_INITIAL_CODE.to_string(),
        }
    }
}

/// Reply to a session creation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedSpace {
    pub space_id: String,
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("unknown message type `{0}`")]
    UnknownType(String),
    #[error("unsupported language `{0}`")]
    UnsupportedLanguage(String),
}
