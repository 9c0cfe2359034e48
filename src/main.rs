use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use mailhook::audit::AuditLog;
use mailhook::config::{RelayConfig, ServerConfig, ShutdownPolicy};
use mailhook::pipeline::forwarder::{ForwardPool, Forwarder, HttpWebhookClient};
use mailhook::pipeline::handler::MessageHandler;
use mailhook::smtp::{SessionSettings, SmtpListener};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config_path = RelayConfig::path_from_env();
    let relay = Arc::new(
        RelayConfig::load_or_default(&config_path)
            .with_context(|| format!("loading {}", config_path.display()))?,
    );
    let server = ServerConfig::from_env().context("reading server settings")?;

    eprintln!("📬 mailhook v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Config: {}", config_path.display());
    eprintln!("   Listening: smtp://{}", server.bind);
    eprintln!("   Webhook workers: {}", server.webhook_workers);
    eprintln!("   Audit logs: {}", server.log_dir.display());
    match server.shutdown {
        ShutdownPolicy::Immediate => eprintln!("   Shutdown: immediate"),
        ShutdownPolicy::Drain { timeout } => eprintln!("   Shutdown: drain up to {timeout:?}"),
    }
    eprintln!("   Email endpoints:");
    for (recipient, endpoint) in relay.endpoints.entries() {
        eprintln!("     {recipient} -> {endpoint}");
    }
    eprintln!("   Allowed senders:");
    for sender in relay.allowed_senders.senders() {
        eprintln!("     {sender}");
    }
    eprintln!();

    // ── Audit logs ───────────────────────────────────────────────────────
    // Guards flush the writer threads when dropped at the end of main.
    let (audit, _audit_guards) = AuditLog::open_files(&server.log_dir)?;

    // ── Webhook forwarding ───────────────────────────────────────────────
    let pool = Arc::new(
        ForwardPool::new(server.webhook_workers).context("starting webhook worker pool")?,
    );
    let client = HttpWebhookClient::new(Arc::clone(&pool))?;
    let handler = MessageHandler::new(relay, audit, Forwarder::new(Arc::new(client)));

    // ── SMTP listener ────────────────────────────────────────────────────
    let listener = SmtpListener::bind(
        server.bind,
        SessionSettings::from(&server),
        Arc::new(handler.clone()),
    )
    .await?;

    let shutdown = CancellationToken::new();
    let accept_loop = tokio::spawn(listener.serve(shutdown.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("waiting for interrupt signal")?;
    eprintln!("\nShutting down...");

    shutdown.cancel();
    if let Err(e) = accept_loop.await {
        tracing::warn!(error = %e, "Accept loop ended abnormally");
    }

    let report = handler.shutdown(server.shutdown).await;
    tracing::info!(
        in_flight = report.in_flight,
        drained = report.drained,
        "Message handler stopped"
    );

    Ok(())
}
