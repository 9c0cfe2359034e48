//! Audit logger — append-only known/unknown mail logs.
//!
//! Every entry becomes exactly one line handed to its sink in a single
//! write, so concurrent message tasks never interleave partial lines.

use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tracing_appender::non_blocking::{NonBlocking, NonBlockingBuilder, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};

use crate::error::ConfigError;
use crate::pipeline::types::{DecodedMessage, ForwardOutcome, ForwardResult, Recipients};

/// File name of the known-mail log.
pub const KNOWN_LOG_FILE: &str = "known_emails.log";

/// File name of the unknown-mail log.
pub const UNKNOWN_LOG_FILE: &str = "unknown_emails.log";

/// Reason recorded when the envelope sender is not allow-listed.
pub const UNAUTHORIZED_SENDER: &str = "unauthorized sender";

// ── Entries ─────────────────────────────────────────────────────────

/// Which sink an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Known,
    Unknown,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Known => "known",
            Self::Unknown => "unknown",
        })
    }
}

/// What an audit line records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditEvent {
    /// Message summary, written once per message.
    Received {
        sender: String,
        recipients: Recipients,
        subject: String,
        size: usize,
    },
    /// Sender refused by the allow-list.
    Rejected { sender: String, reason: String },
    /// One webhook attempt.
    Forward(ForwardResult),
    /// A message task failed before it could be classified.
    Failed { sender: String, error: String },
}

impl fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Received {
                sender,
                recipients,
                subject,
                size,
            } => write!(
                f,
                "From: {sender}, To: {recipients}, Subject: {subject}, Size: {size} bytes"
            ),
            Self::Rejected { sender, reason } => {
                write!(f, "Rejected email from {reason}: {sender}")
            }
            Self::Forward(ForwardResult {
                endpoint,
                outcome: ForwardOutcome::Delivered { status },
                ..
            }) => write!(f, "Forwarded to {endpoint}: {status}"),
            Self::Forward(ForwardResult {
                endpoint,
                outcome: ForwardOutcome::Failed { reason },
                ..
            }) => write!(f, "Error sending to {endpoint}: {reason}"),
            Self::Failed { sender, error } => {
                write!(f, "Failed to process email from {sender}: {error}")
            }
        }
    }
}

/// A single audit line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub category: Category,
    pub event: AuditEvent,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Entry fields are flattened onto one line.
        let event = self.event.to_string().replace(['\r', '\n'], " ");
        write!(
            f,
            "{} {} {}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.category,
            event
        )
    }
}

// ── Sinks ───────────────────────────────────────────────────────────

/// Destination for audit lines.
pub trait AuditSink: Send + Sync {
    fn append(&self, entry: &LogEntry);
}

/// Sink backed by a non-blocking file writer.
///
/// The returned [`WorkerGuard`] must be held for as long as lines should be
/// flushed; dropping it flushes and stops the writer thread.
#[derive(Clone)]
pub struct FileSink {
    path: PathBuf,
    writer: NonBlocking,
}

impl FileSink {
    /// Open (or create) `dir/file_name` for appending.
    pub fn open(dir: &Path, file_name: &str) -> Result<(Self, WorkerGuard), ConfigError> {
        let path = dir.join(file_name);
        let appender = RollingFileAppender::builder()
            .rotation(Rotation::NEVER)
            .filename_prefix(file_name)
            .build(dir)
            .map_err(|e| ConfigError::AuditLog {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        // Audit lines are never dropped under back-pressure.
        let (writer, guard) = NonBlockingBuilder::default().lossy(false).finish(appender);
        Ok((Self { path, writer }, guard))
    }
}

impl AuditSink for FileSink {
    fn append(&self, entry: &LogEntry) {
        let line = format!("{entry}\n");
        let mut writer = self.writer.clone();
        if let Err(e) = writer.write_all(line.as_bytes()) {
            tracing::error!(path = %self.path.display(), error = %e, "Failed to append audit line");
        }
    }
}

/// Sink keeping entries in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything appended so far.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuditSink for MemorySink {
    fn append(&self, entry: &LogEntry) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.clone());
    }
}

// ── Audit log ───────────────────────────────────────────────────────

/// The pair of audit sinks, shared by all message tasks.
#[derive(Clone)]
pub struct AuditLog {
    known: Arc<dyn AuditSink>,
    unknown: Arc<dyn AuditSink>,
}

impl AuditLog {
    pub fn new(known: Arc<dyn AuditSink>, unknown: Arc<dyn AuditSink>) -> Self {
        Self { known, unknown }
    }

    /// Open `known_emails.log` and `unknown_emails.log` under `dir`.
    pub fn open_files(dir: &Path) -> Result<(Self, Vec<WorkerGuard>), ConfigError> {
        let (known, known_guard) = FileSink::open(dir, KNOWN_LOG_FILE)?;
        let (unknown, unknown_guard) = FileSink::open(dir, UNKNOWN_LOG_FILE)?;
        Ok((
            Self::new(Arc::new(known), Arc::new(unknown)),
            vec![known_guard, unknown_guard],
        ))
    }

    /// In-memory log; returns the known and unknown sinks for inspection.
    pub fn in_memory() -> (Self, Arc<MemorySink>, Arc<MemorySink>) {
        let known = Arc::new(MemorySink::new());
        let unknown = Arc::new(MemorySink::new());
        (
            Self::new(known.clone(), unknown.clone()),
            known,
            unknown,
        )
    }

    /// Append an entry to the sink for `category`.
    pub fn record(&self, category: Category, event: AuditEvent) {
        let entry = LogEntry {
            timestamp: Utc::now(),
            category,
            event,
        };

        match &entry.event {
            AuditEvent::Received { .. } => tracing::info!(%category, "{}", entry.event),
            AuditEvent::Forward(result) if result.is_delivered() => {
                tracing::info!(%category, "{}", entry.event)
            }
            AuditEvent::Rejected { .. } => tracing::warn!(%category, "{}", entry.event),
            AuditEvent::Forward(_) | AuditEvent::Failed { .. } => {
                tracing::error!(%category, "{}", entry.event)
            }
        }

        match category {
            Category::Known => self.known.append(&entry),
            Category::Unknown => self.unknown.append(&entry),
        }
    }

    /// Message summary for a known or unknown message.
    pub fn received(
        &self,
        category: Category,
        sender: &str,
        recipients: &Recipients,
        decoded: &DecodedMessage,
    ) {
        self.record(
            category,
            AuditEvent::Received {
                sender: sender.to_string(),
                recipients: recipients.clone(),
                subject: decoded.subject.clone(),
                size: decoded.size,
            },
        );
    }

    /// Unauthorized sender (unknown sink).
    pub fn rejected(&self, sender: &str) {
        self.record(
            Category::Unknown,
            AuditEvent::Rejected {
                sender: sender.to_string(),
                reason: UNAUTHORIZED_SENDER.to_string(),
            },
        );
    }

    /// Webhook attempt outcome (known sink).
    pub fn forwarded(&self, result: ForwardResult) {
        self.record(Category::Known, AuditEvent::Forward(result));
    }

    /// Failure caught at a message task boundary, written to the sink the
    /// message was classified into.
    pub fn failed(&self, category: Category, sender: &str, error: impl fmt::Display) {
        self.record(
            category,
            AuditEvent::Failed {
                sender: sender.to_string(),
                error: error.to_string(),
            },
        );
    }
}
