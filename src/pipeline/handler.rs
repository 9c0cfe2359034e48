//! Message handler — per-transaction entry point of the pipeline.
//!
//! `handle()` spawns one task per message and returns at once. Each task
//! runs sender authorization → decoding → routing → forwarding inside a
//! failure boundary: errors and panics are turned into audit entries and
//! never reach the listener.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};

use futures::FutureExt;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::audit::{AuditLog, Category};
use crate::config::{RelayConfig, ShutdownPolicy};
use crate::error::Error;
use crate::pipeline::decode::decode_message;
use crate::pipeline::forwarder::Forwarder;
use crate::pipeline::router::{Delivery, Route, route};
use crate::pipeline::types::{DecodedMessage, ForwardResult, InboundMessage};

/// How a message left the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Sender not allow-listed; dropped.
    Rejected,
    /// No recipient has a webhook; logged only.
    Unknown,
    /// Known message; one result per matching recipient.
    Forwarded(Vec<ForwardResult>),
}

impl Outcome {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Rejected => "rejected",
            Self::Unknown => "unknown",
            Self::Forwarded(_) => "forwarded",
        }
    }
}

/// Result of [`MessageHandler::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Tasks still scheduled when shutdown began.
    pub in_flight: usize,
    /// Whether every task finished before the handler gave up.
    pub drained: bool,
}

struct Inner {
    config: Arc<RelayConfig>,
    audit: AuditLog,
    forwarder: Forwarder,
}

/// Entry point invoked by the listener once per completed transaction.
#[derive(Clone)]
pub struct MessageHandler {
    inner: Arc<Inner>,
    tracker: TaskTracker,
}

impl MessageHandler {
    pub fn new(config: Arc<RelayConfig>, audit: AuditLog, forwarder: Forwarder) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                audit,
                forwarder,
            }),
            tracker: TaskTracker::new(),
        }
    }

    /// Schedule processing of `message` and return immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn handle(&self, message: InboundMessage) {
        let inner = Arc::clone(&self.inner);

        self.tracker.spawn(async move {
            let id = message.id;
            let sender = message.envelope_from.clone();
            let classified = OnceLock::new();

            let result = AssertUnwindSafe(inner.process(message, &classified))
                .catch_unwind()
                .await;
            // Failures before routing have no category yet.
            let category = classified.get().copied().unwrap_or(Category::Unknown);
            match result {
                Ok(Ok(outcome)) => {
                    debug!(%id, outcome = outcome.label(), "Message processed");
                }
                Ok(Err(e)) => inner.audit.failed(category, &sender, &e),
                Err(panic) => {
                    inner
                        .audit
                        .failed(category, &sender, panic_message(panic.as_ref()))
                }
            }
        });
    }

    /// Run the pipeline for one message on the current task.
    ///
    /// This is the body `handle()` schedules, minus the failure boundary.
    pub async fn process(&self, message: InboundMessage) -> Result<Outcome, Error> {
        self.inner.process(message, &OnceLock::new()).await
    }

    /// Number of message tasks not yet finished.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Apply `policy` to the message tasks still scheduled.
    ///
    /// `handle()` may still be called afterwards; those tasks run but are not
    /// waited for by a later `shutdown()`.
    pub async fn shutdown(&self, policy: ShutdownPolicy) -> ShutdownReport {
        self.tracker.close();
        let in_flight = self.tracker.len();

        let drained = match policy {
            ShutdownPolicy::Immediate => in_flight == 0,
            ShutdownPolicy::Drain { timeout } => {
                info!(in_flight, ?timeout, "Draining message tasks");
                tokio::time::timeout(timeout, self.tracker.wait())
                    .await
                    .is_ok()
            }
        };

        if !drained {
            warn!(
                remaining = self.tracker.len(),
                "Abandoning in-flight message tasks"
            );
        }

        ShutdownReport { in_flight, drained }
    }
}

impl Inner {
    /// `classified` is set once the message has a category, so a failure
    /// after that point is logged alongside its summary.
    async fn process(
        &self,
        message: InboundMessage,
        classified: &OnceLock<Category>,
    ) -> Result<Outcome, Error> {
        let sender = message.envelope_from.as_str();

        if !self.config.allowed_senders.contains(sender) {
            self.audit.rejected(sender);
            return Ok(Outcome::Rejected);
        }

        let decoded = decode_message(&message)?;

        match route(&message.recipients, &self.config.endpoints) {
            Route::Unknown => {
                let _ = classified.set(Category::Unknown);
                self.audit
                    .received(Category::Unknown, sender, &message.recipients, &decoded);
                Ok(Outcome::Unknown)
            }
            Route::Known(deliveries) => {
                let _ = classified.set(Category::Known);
                self.audit
                    .received(Category::Known, sender, &message.recipients, &decoded);

                // Recipients are forwarded in order, one at a time.
                let mut results = Vec::with_capacity(deliveries.len());
                for delivery in &deliveries {
                    results.push(self.forward(delivery, &decoded).await);
                }
                Ok(Outcome::Forwarded(results))
            }
        }
    }

    async fn forward(&self, delivery: &Delivery, decoded: &DecodedMessage) -> ForwardResult {
        let result = self.forwarder.forward(delivery, decoded).await;
        self.audit.forwarded(result.clone());
        result
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("task panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("task panicked: {s}")
    } else {
        "task panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::audit::{AuditEvent, MemorySink, UNAUTHORIZED_SENDER};
    use crate::config::{AllowList, EndpointMapping};
    use crate::error::ForwardError;
    use crate::pipeline::forwarder::{WebhookClient, WebhookPayload};
    use crate::pipeline::types::{Body, BodyPart, ForwardOutcome};

    const ENDPOINT: &str = "https://hooks.example.com/known";

    #[derive(Clone, Copy)]
    enum Behaviour {
        Respond(u16),
        Refuse,
        Panic,
        Hang,
    }

    struct StubClient {
        behaviour: Behaviour,
        calls: Mutex<Vec<(String, WebhookPayload)>>,
    }

    impl StubClient {
        fn new(behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                behaviour,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<(String, WebhookPayload)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl WebhookClient for StubClient {
        async fn post(&self, endpoint: &str, payload: &WebhookPayload) -> Result<u16, ForwardError> {
            self.calls
                .lock()
                .unwrap()
                .push((endpoint.to_string(), payload.clone()));
            match self.behaviour {
                Behaviour::Respond(status) => Ok(status),
                Behaviour::Refuse => Err(ForwardError::Request {
                    endpoint: endpoint.to_string(),
                    reason: "connection refused".into(),
                }),
                Behaviour::Panic => panic!("webhook client exploded"),
                Behaviour::Hang => std::future::pending().await,
            }
        }
    }

    struct Fixture {
        handler: MessageHandler,
        client: Arc<StubClient>,
        known: Arc<MemorySink>,
        unknown: Arc<MemorySink>,
    }

    fn fixture(behaviour: Behaviour) -> Fixture {
        let endpoints: EndpointMapping = [("Known@Example.com", ENDPOINT)].into_iter().collect();
        let allowed: AllowList = ["sender@example.com"].into_iter().collect();
        let config = Arc::new(RelayConfig::new(endpoints, allowed));

        let client = StubClient::new(behaviour);
        let (audit, known, unknown) = AuditLog::in_memory();
        let handler = MessageHandler::new(config, audit, Forwarder::new(client.clone()));

        Fixture {
            handler,
            client,
            known,
            unknown,
        }
    }

    fn message(from: &str, to: Vec<&str>, body: Body) -> InboundMessage {
        InboundMessage::new(from, to, Some("Test Email thing".into()), body)
    }

    #[tokio::test]
    async fn unauthorized_sender_is_dropped() {
        let f = fixture(Behaviour::Respond(200));

        let outcome = f
            .handler
            .process(message("evil@x.com", vec!["known@example.com"], Body::plain("hi")))
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Rejected);
        assert!(f.client.calls().is_empty());
        assert!(f.known.is_empty());
        let entries = f.unknown.entries();
        assert_eq!(entries.len(), 1);
        assert!(matches!(
            &entries[0].event,
            AuditEvent::Rejected { sender, reason } if sender == "evil@x.com" && reason == UNAUTHORIZED_SENDER
        ));
    }

    #[tokio::test]
    async fn plain_message_to_known_recipient_is_forwarded() {
        let f = fixture(Behaviour::Respond(200));

        let outcome = f
            .handler
            .process(message("sender@example.com", vec!["known@example.com"], Body::plain("hello")))
            .await
            .unwrap();

        let calls = f.client.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, ENDPOINT);
        assert_eq!(
            calls[0].1,
            WebhookPayload {
                from: "known@example.com".into(),
                subject: "Test Email thing".into(),
                content: "hello".into(),
            }
        );

        let Outcome::Forwarded(results) = outcome else {
            panic!("expected forwarded outcome");
        };
        assert_eq!(results[0].outcome, ForwardOutcome::Delivered { status: 200 });

        // Summary + forward result, nothing unknown.
        let known = f.known.entries();
        assert_eq!(known.len(), 2);
        assert!(matches!(known[0].event, AuditEvent::Received { size: 5, .. }));
        assert!(matches!(known[1].event, AuditEvent::Forward(_)));
        assert!(f.unknown.is_empty());
    }

    #[tokio::test]
    async fn multipart_forwards_first_text_part() {
        let f = fixture(Behaviour::Respond(200));
        let body = Body::Multipart(vec![
            BodyPart::new("text/html", Some("utf-8"), "<b>hi</b>"),
            BodyPart::new("text/plain", Some("utf-8"), "hi"),
        ]);

        f.handler
            .process(message("sender@example.com", vec!["known@example.com"], body))
            .await
            .unwrap();

        assert_eq!(f.client.calls()[0].1.content, "<b>hi</b>");
    }

    #[tokio::test]
    async fn mixed_recipients_forward_once_and_log_known_only() {
        let f = fixture(Behaviour::Respond(200));

        f.handler
            .process(message(
                "sender@example.com",
                vec!["stranger@example.com", "known@example.com"],
                Body::plain("hello"),
            ))
            .await
            .unwrap();

        assert_eq!(f.client.calls().len(), 1);
        assert_eq!(f.client.calls()[0].1.from, "known@example.com");
        assert!(f.unknown.is_empty());
        assert!(matches!(
            &f.known.entries()[0].event,
            AuditEvent::Received { recipients, .. } if recipients.as_slice().len() == 2
        ));
    }

    #[tokio::test]
    async fn unknown_recipients_are_logged_not_forwarded() {
        let f = fixture(Behaviour::Respond(200));

        let outcome = f
            .handler
            .process(message("sender@example.com", vec!["nobody@example.com"], Body::plain("x")))
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Unknown);
        assert!(f.client.calls().is_empty());
        assert!(f.known.is_empty());
        assert_eq!(f.unknown.len(), 1);
    }

    #[tokio::test]
    async fn recipient_case_is_ignored() {
        let f = fixture(Behaviour::Respond(200));

        f.handler
            .process(message("sender@example.com", vec!["known@example.com"], Body::plain("x")))
            .await
            .unwrap();

        // Mapping key was `Known@Example.com`.
        assert_eq!(f.client.calls().len(), 1);
    }

    #[tokio::test]
    async fn forward_failure_is_logged_to_known() {
        let f = fixture(Behaviour::Refuse);

        let outcome = f
            .handler
            .process(message("sender@example.com", vec!["known@example.com"], Body::plain("x")))
            .await
            .unwrap();

        assert!(matches!(outcome, Outcome::Forwarded(ref r) if !r[0].is_delivered()));
        let known = f.known.entries();
        assert_eq!(known.len(), 2);
        assert!(known[1].to_string().contains("Error sending to"));
    }

    #[tokio::test]
    async fn handle_contains_decode_errors() {
        let f = fixture(Behaviour::Respond(200));
        let body = Body::Single(BodyPart::new("text/plain", Some("x-unknown"), "x"));

        f.handler
            .handle(message("sender@example.com", vec!["known@example.com"], body));
        let report = f.handler.shutdown(ShutdownPolicy::Drain {
            timeout: Duration::from_secs(5),
        })
        .await;

        assert!(report.drained);
        assert!(f.client.calls().is_empty());
        let unknown = f.unknown.entries();
        assert_eq!(unknown.len(), 1);
        assert!(matches!(unknown[0].event, AuditEvent::Failed { .. }));
    }

    #[tokio::test]
    async fn handle_contains_panics() {
        let f = fixture(Behaviour::Panic);

        f.handler
            .handle(message("sender@example.com", vec!["known@example.com"], Body::plain("x")));
        let report = f.handler.shutdown(ShutdownPolicy::Drain {
            timeout: Duration::from_secs(5),
        })
        .await;

        assert!(report.drained);
        assert!(f.unknown.is_empty(), "a known message stays out of the unknown log");
        let known = f.known.entries();
        assert_eq!(known.len(), 2);
        assert!(matches!(known[0].event, AuditEvent::Received { .. }));
        assert!(matches!(known[1].event, AuditEvent::Failed { .. }));
        assert!(known[1].to_string().contains("webhook client exploded"));
    }

    #[tokio::test]
    async fn shutdown_drains_completed_work() {
        let f = fixture(Behaviour::Respond(200));

        for _ in 0..3 {
            f.handler
                .handle(message("sender@example.com", vec!["known@example.com"], Body::plain("x")));
        }
        let report = f.handler.shutdown(ShutdownPolicy::Drain {
            timeout: Duration::from_secs(5),
        })
        .await;

        assert_eq!(report.in_flight, 3);
        assert!(report.drained);
        assert_eq!(f.client.calls().len(), 3);
        assert_eq!(f.handler.in_flight(), 0);
    }

    #[tokio::test]
    async fn immediate_shutdown_abandons_work() {
        let f = fixture(Behaviour::Hang);

        f.handler
            .handle(message("sender@example.com", vec!["known@example.com"], Body::plain("x")));
        let report = f.handler.shutdown(ShutdownPolicy::Immediate).await;

        assert_eq!(
            report,
            ShutdownReport {
                in_flight: 1,
                drained: false
            }
        );
    }

    #[tokio::test]
    async fn bounded_drain_gives_up() {
        let f = fixture(Behaviour::Hang);

        f.handler
            .handle(message("sender@example.com", vec!["known@example.com"], Body::plain("x")));
        let report = f
            .handler
            .shutdown(ShutdownPolicy::Drain {
                timeout: Duration::from_millis(50),
            })
            .await;

        assert!(!report.drained);
        assert_eq!(f.handler.in_flight(), 1);
    }
}
