//! TCP accept loop for the SMTP side.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ListenerError;
use crate::smtp::session::{MessageSink, SessionSettings, run_session};

/// Bound SMTP listener. One task per accepted connection.
pub struct SmtpListener {
    listener: TcpListener,
    settings: Arc<SessionSettings>,
    sink: Arc<dyn MessageSink>,
}

impl SmtpListener {
    pub async fn bind(
        addr: SocketAddr,
        settings: SessionSettings,
        sink: Arc<dyn MessageSink>,
    ) -> Result<Self, ListenerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ListenerError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        info!(addr = %listener.local_addr()?, "SMTP listener bound");

        Ok(Self {
            listener,
            settings: Arc::new(settings),
            sink,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ListenerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` fires. Open sessions are not awaited.
    pub async fn serve(self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("SMTP listener stopping");
                    return;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "Connection accepted");
                        let settings = Arc::clone(&self.settings);
                        let sink = Arc::clone(&self.sink);
                        tokio::spawn(async move {
                            if let Err(e) = run_session(stream, settings, sink).await {
                                debug!(%peer, error = %e, "Session ended with error");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "Failed to accept connection"),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpStream;
    use tokio::time::timeout;

    use crate::pipeline::types::InboundMessage;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    struct Discard;

    impl MessageSink for Discard {
        fn accept(&self, _message: InboundMessage) {}
    }

    fn settings() -> SessionSettings {
        SessionSettings {
            hostname: "relay.test".into(),
            max_message_bytes: 1024,
        }
    }

    #[tokio::test]
    async fn bind_conflict_is_reported() {
        let first = SmtpListener::bind("127.0.0.1:0".parse().unwrap(), settings(), Arc::new(Discard))
            .await
            .unwrap();
        let addr = first.local_addr().unwrap();

        let err = SmtpListener::bind(addr, settings(), Arc::new(Discard))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ListenerError::Bind { .. }));
    }

    #[tokio::test]
    async fn greets_and_stops_on_cancel() {
        timeout(TEST_TIMEOUT, async {
            let listener =
                SmtpListener::bind("127.0.0.1:0".parse().unwrap(), settings(), Arc::new(Discard))
                    .await
                    .unwrap();
            let addr = listener.local_addr().unwrap();
            let shutdown = CancellationToken::new();
            let server = tokio::spawn(listener.serve(shutdown.clone()));

            let stream = TcpStream::connect(addr).await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut reader = BufReader::new(reader);

            let mut greeting = String::new();
            reader.read_line(&mut greeting).await.unwrap();
            assert!(greeting.starts_with("220 relay.test"), "{greeting:?}");

            writer.write_all(b"QUIT\r\n").await.unwrap();
            let mut bye = String::new();
            reader.read_line(&mut bye).await.unwrap();
            assert!(bye.starts_with("221"));

            shutdown.cancel();
            server.await.unwrap();
        })
        .await
        .expect("test timed out");
    }
}
