//! Shared types for the message processing pipeline.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Inbound message ─────────────────────────────────────────────────

/// One completed mail transaction, as handed over by the listener.
///
/// Nothing in the pipeline mutates it; the handler takes ownership and
/// only ever lends it out by shared reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Generated per transaction, used to correlate log lines.
    pub id: Uuid,
    /// Envelope sender (`MAIL FROM`).
    pub envelope_from: String,
    /// Envelope recipients (`RCPT TO`), in order.
    pub recipients: Recipients,
    /// Raw `Subject` header value, still encoded. `None` if absent.
    pub subject: Option<String>,
    /// Body structure.
    pub body: Body,
    /// When the transaction completed.
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(
        envelope_from: impl Into<String>,
        recipients: impl Into<Recipients>,
        subject: Option<String>,
        body: Body,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            envelope_from: envelope_from.into(),
            recipients: recipients.into(),
            subject,
            body,
            received_at: Utc::now(),
        }
    }
}

// ── Recipients ──────────────────────────────────────────────────────

/// Envelope recipient list.
///
/// Transports sometimes yield a bare address instead of a list; both
/// shapes normalize here so nothing downstream has to check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RecipientField")]
pub struct Recipients(Vec<String>);

#[derive(Deserialize)]
#[serde(untagged)]
enum RecipientField {
    One(String),
    Many(Vec<String>),
}

impl From<RecipientField> for Recipients {
    fn from(field: RecipientField) -> Self {
        match field {
            RecipientField::One(address) => Self(vec![address]),
            RecipientField::Many(addresses) => Self(addresses),
        }
    }
}

impl Recipients {
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

impl From<String> for Recipients {
    fn from(address: String) -> Self {
        Self(vec![address])
    }
}

impl From<&str> for Recipients {
    fn from(address: &str) -> Self {
        Self(vec![address.to_string()])
    }
}

impl From<Vec<String>> for Recipients {
    fn from(addresses: Vec<String>) -> Self {
        Self(addresses)
    }
}

impl From<Vec<&str>> for Recipients {
    fn from(addresses: Vec<&str>) -> Self {
        Self(addresses.into_iter().map(str::to_string).collect())
    }
}

impl fmt::Display for Recipients {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(", "))
    }
}

// ── Body ────────────────────────────────────────────────────────────

/// A leaf MIME part with transfer encoding already undone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyPart {
    /// Lower-case `type/subtype`.
    pub content_type: String,
    /// Declared charset, if any.
    pub charset: Option<String>,
    /// Payload bytes in `charset`.
    pub payload: Vec<u8>,
}

impl BodyPart {
    pub fn new(
        content_type: impl Into<String>,
        charset: Option<&str>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            content_type: content_type.into().to_ascii_lowercase(),
            charset: charset.map(str::to_string),
            payload: payload.into(),
        }
    }

    /// `text/plain` or `text/html`.
    pub fn is_text(&self) -> bool {
        matches!(self.content_type.as_str(), "text/plain" | "text/html")
    }
}

/// Message body: a single payload, or multipart leaves in original order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "parts", rename_all = "snake_case")]
pub enum Body {
    Single(BodyPart),
    Multipart(Vec<BodyPart>),
}

impl Body {
    /// Single UTF-8 `text/plain` body.
    pub fn plain(text: &str) -> Self {
        Self::Single(BodyPart::new("text/plain", Some("utf-8"), text))
    }

    pub fn is_multipart(&self) -> bool {
        matches!(self, Self::Multipart(_))
    }
}

// ── Decoded message ─────────────────────────────────────────────────

/// Subject and content resolved from an [`InboundMessage`]. Never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedMessage {
    pub subject: String,
    pub content: String,
    /// Byte length of `content` (UTF-8).
    pub size: usize,
}

impl DecodedMessage {
    pub fn new(subject: String, content: String) -> Self {
        let size = content.len();
        Self {
            subject,
            content,
            size,
        }
    }
}

// ── Forward result ──────────────────────────────────────────────────

/// What happened to one webhook delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ForwardOutcome {
    /// The endpoint answered; any status code counts.
    Delivered { status: u16 },
    /// Transport failure before a response arrived.
    Failed { reason: String },
}

/// Outcome of forwarding a message to one recipient's webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardResult {
    pub recipient: String,
    pub endpoint: String,
    #[serde(flatten)]
    pub outcome: ForwardOutcome,
}

impl ForwardResult {
    pub fn is_delivered(&self) -> bool {
        matches!(self.outcome, ForwardOutcome::Delivered { .. })
    }
}
