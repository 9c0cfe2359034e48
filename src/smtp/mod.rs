//! SMTP intake: accept loop, per-connection sessions and DATA ingestion.

pub mod ingest;
pub mod listener;
pub mod session;

pub use listener::SmtpListener;
pub use session::{MessageSink, SessionSettings};
