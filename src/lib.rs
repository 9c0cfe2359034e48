//! mailhook — SMTP to webhook relay.

pub mod audit;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod smtp;
