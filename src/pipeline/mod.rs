//! Relay pipeline.
//!
//! Every completed SMTP transaction flows through:
//! 1. `MessageHandler::handle()` — spawn a task behind the failure boundary
//! 2. Sender allow-list check — unauthorized mail is logged and dropped
//! 3. `decode::decode_message()` — RFC 2047 subject, first text part
//! 4. `router::route()` — known vs unknown recipients
//! 5. `Forwarder::forward()` — one webhook POST per known recipient
//!
//! **Nothing is retried.** A failed POST is logged and the message moves on.

pub mod decode;
pub mod forwarder;
pub mod handler;
pub mod router;
pub mod types;
