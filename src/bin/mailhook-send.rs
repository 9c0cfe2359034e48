//! Submit one test message to a running relay.

use anyhow::Context;
use clap::Parser;
use lettre::message::header::ContentType;
use lettre::{Message, SmtpTransport, Transport};

/// Send a plain-text test email over unencrypted SMTP
#[derive(Parser, Debug)]
#[command(name = "mailhook-send")]
#[command(version)]
struct Cli {
    /// Envelope and header sender
    #[arg(long, default_value = "sender@example.com")]
    from: String,

    /// Recipient address
    #[arg(long, default_value = "known@example.com")]
    to: String,

    #[arg(long, default_value = "Test Email thing")]
    subject: String,

    #[arg(long, default_value = "This is the body of the test email.")]
    body: String,

    /// SMTP server host
    #[arg(long, default_value = "localhost")]
    server: String,

    #[arg(long, default_value_t = 25)]
    port: u16,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let email = Message::builder()
        .from(cli.from.parse().context("invalid --from address")?)
        .to(cli.to.parse().context("invalid --to address")?)
        .subject(cli.subject)
        .header(ContentType::TEXT_PLAIN)
        .body(cli.body)
        .context("failed to build email")?;

    let transport = SmtpTransport::builder_dangerous(&cli.server)
        .port(cli.port)
        .build();

    transport
        .send(&email)
        .with_context(|| format!("SMTP send to {}:{} failed", cli.server, cli.port))?;

    println!("Email sent successfully!");
    Ok(())
}
