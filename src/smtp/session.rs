//! One SMTP conversation.
//!
//! A minimal RFC 5321 receiver: enough of the command set to take a
//! transaction from a mail client and hand the finished message to a
//! [`MessageSink`]. The reply after DATA does not depend on what the
//! pipeline later does with the message.

use std::sync::Arc;

use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf,
    WriteHalf,
};
use tracing::debug;

use crate::config::ServerConfig;
use crate::pipeline::handler::MessageHandler;
use crate::pipeline::types::InboundMessage;
use crate::smtp::ingest::build_message;

/// Longest accepted command line, CRLF included.
const MAX_COMMAND_LINE: u64 = 4096;

/// Read granularity inside DATA.
const DATA_CHUNK: u64 = 64 * 1024;

/// Receiver of completed transactions.
pub trait MessageSink: Send + Sync {
    fn accept(&self, message: InboundMessage);
}

impl MessageSink for MessageHandler {
    fn accept(&self, message: InboundMessage) {
        self.handle(message);
    }
}

/// Per-session settings taken from [`ServerConfig`].
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub hostname: String,
    pub max_message_bytes: usize,
}

impl From<&ServerConfig> for SessionSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            hostname: config.hostname.clone(),
            max_message_bytes: config.max_message_bytes,
        }
    }
}

// ── Command parsing ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Helo,
    Ehlo,
    Mail(String),
    Rcpt(String),
    Data,
    Rset,
    Noop,
    Vrfy,
    Quit,
    Unknown(String),
}

/// Parse a command line (without CRLF). `Err` carries the 501 usage text.
fn parse_command(line: &str) -> Result<Command, &'static str> {
    let (verb, arg) = match line.split_once(' ') {
        Some((verb, arg)) => (verb, arg.trim()),
        None => (line.trim(), ""),
    };

    match verb.to_ascii_uppercase().as_str() {
        "HELO" if arg.is_empty() => Err("Syntax: HELO hostname"),
        "HELO" => Ok(Command::Helo),
        "EHLO" if arg.is_empty() => Err("Syntax: EHLO hostname"),
        "EHLO" => Ok(Command::Ehlo),
        "MAIL" => parse_path(arg, "FROM:")
            .map(Command::Mail)
            .ok_or("Syntax: MAIL FROM:<address>"),
        "RCPT" => parse_path(arg, "TO:")
            .filter(|addr| !addr.is_empty())
            .map(Command::Rcpt)
            .ok_or("Syntax: RCPT TO:<address>"),
        "DATA" => Ok(Command::Data),
        "RSET" => Ok(Command::Rset),
        "NOOP" => Ok(Command::Noop),
        "VRFY" => Ok(Command::Vrfy),
        "QUIT" => Ok(Command::Quit),
        _ => Ok(Command::Unknown(verb.to_string())),
    }
}

/// Extract the address from `FROM:<addr> [params]` / `TO:<addr>`.
fn parse_path(arg: &str, keyword: &str) -> Option<String> {
    let head = arg.get(..keyword.len())?;
    if !head.eq_ignore_ascii_case(keyword) {
        return None;
    }
    let rest = arg[keyword.len()..].trim_start();

    if let Some(bracketed) = rest.strip_prefix('<') {
        let end = bracketed.find('>')?;
        Some(bracketed[..end].trim().to_string())
    } else {
        rest.split_whitespace().next().map(str::to_string)
    }
}

// ── Session ─────────────────────────────────────────────────────────

enum Line {
    Command(String),
    TooLong,
    Eof,
}

struct Session<S> {
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    settings: Arc<SessionSettings>,
    sink: Arc<dyn MessageSink>,
    greeted: bool,
    envelope_from: Option<String>,
    recipients: Vec<String>,
}

/// Drive one connection until QUIT, EOF or an I/O error.
pub async fn run_session<S>(
    stream: S,
    settings: Arc<SessionSettings>,
    sink: Arc<dyn MessageSink>,
) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, writer) = tokio::io::split(stream);
    let mut session = Session {
        reader: BufReader::new(reader),
        writer,
        settings,
        sink,
        greeted: false,
        envelope_from: None,
        recipients: Vec::new(),
    };
    session.run().await
}

impl<S: AsyncRead + AsyncWrite + Unpin> Session<S> {
    async fn run(&mut self) -> std::io::Result<()> {
        let greeting = format!("220 {} ESMTP {}", self.settings.hostname, env!("CARGO_PKG_NAME"));
        self.reply(&greeting).await?;

        loop {
            let line = match self.read_command().await? {
                Line::Command(line) => line,
                Line::TooLong => return self.reply("500 Error: line too long").await,
                Line::Eof => return Ok(()),
            };

            match parse_command(&line) {
                Ok(command) => {
                    if !self.dispatch(command).await? {
                        return Ok(());
                    }
                }
                Err(usage) => self.reply(&format!("501 {usage}")).await?,
            }
        }
    }

    /// Returns `false` once the session should close.
    async fn dispatch(&mut self, command: Command) -> std::io::Result<bool> {
        match command {
            Command::Helo => {
                self.reset();
                self.greeted = true;
                let reply = format!("250 {}", self.settings.hostname);
                self.reply(&reply).await?;
            }
            Command::Ehlo => {
                self.reset();
                self.greeted = true;
                let reply = format!(
                    "250-{}\r\n250-8BITMIME\r\n250 SIZE {}",
                    self.settings.hostname, self.settings.max_message_bytes
                );
                self.reply(&reply).await?;
            }
            Command::Mail(_) if !self.greeted => {
                self.reply("503 Error: send HELO first").await?;
            }
            Command::Mail(_) if self.envelope_from.is_some() => {
                self.reply("503 Error: nested MAIL command").await?;
            }
            Command::Mail(sender) => {
                self.envelope_from = Some(sender);
                self.reply("250 OK").await?;
            }
            Command::Rcpt(_) if self.envelope_from.is_none() => {
                self.reply("503 Error: need MAIL command").await?;
            }
            Command::Rcpt(recipient) => {
                self.recipients.push(recipient);
                self.reply("250 OK").await?;
            }
            Command::Data if self.recipients.is_empty() => {
                self.reply("503 Error: need RCPT command").await?;
            }
            Command::Data => self.receive_data().await?,
            Command::Rset => {
                self.reset();
                self.reply("250 OK").await?;
            }
            Command::Noop => self.reply("250 OK").await?,
            Command::Vrfy => {
                self.reply("252 Cannot VRFY user, but will accept message and attempt delivery")
                    .await?;
            }
            Command::Quit => {
                self.reply("221 Bye").await?;
                return Ok(false);
            }
            Command::Unknown(verb) => {
                self.reply(&format!("502 Error: command \"{verb}\" not implemented"))
                    .await?;
            }
        }
        Ok(true)
    }

    async fn receive_data(&mut self) -> std::io::Result<()> {
        self.reply("354 End data with <CR><LF>.<CR><LF>").await?;

        let data = self.read_data().await?;
        let envelope_from = self.envelope_from.take().unwrap_or_default();
        let recipients = std::mem::take(&mut self.recipients);

        let Some(data) = data else {
            debug!(sender = %envelope_from, "Message over size limit");
            return self.reply("552 Error: too much mail data").await;
        };

        debug!(
            sender = %envelope_from,
            recipients = recipients.len(),
            size = data.len(),
            "Transaction complete"
        );
        self.sink.accept(build_message(envelope_from, recipients, &data));
        self.reply("250 OK").await
    }

    /// Read the DATA section, undoing dot-stuffing. `None` when over the cap.
    async fn read_data(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        let limit = self.settings.max_message_bytes;
        let mut data = Vec::new();
        let mut oversized = false;
        let mut at_line_start = true;
        let mut chunk = Vec::new();

        loop {
            chunk.clear();
            let n = (&mut self.reader)
                .take(DATA_CHUNK)
                .read_until(b'\n', &mut chunk)
                .await?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed during DATA",
                ));
            }

            let complete = chunk.ends_with(b"\n");
            let mut line = chunk.as_slice();
            if at_line_start {
                if line == b".\r\n" || line == b".\n" {
                    break;
                }
                if line.starts_with(b".") {
                    line = &line[1..];
                }
            }
            at_line_start = complete;

            if oversized {
                continue;
            }
            if data.len() + line.len() > limit {
                oversized = true;
                data = Vec::new();
            } else {
                data.extend_from_slice(line);
            }
        }

        Ok((!oversized).then_some(data))
    }

    async fn read_command(&mut self) -> std::io::Result<Line> {
        let mut buf = Vec::new();
        let n = (&mut self.reader)
            .take(MAX_COMMAND_LINE)
            .read_until(b'\n', &mut buf)
            .await?;

        if n == 0 {
            return Ok(Line::Eof);
        }
        if !buf.ends_with(b"\n") {
            return Ok(if n as u64 >= MAX_COMMAND_LINE {
                Line::TooLong
            } else {
                Line::Eof
            });
        }

        let text = String::from_utf8_lossy(&buf);
        Ok(Line::Command(text.trim_end_matches(['\r', '\n']).to_string()))
    }

    async fn reply(&mut self, text: &str) -> std::io::Result<()> {
        self.writer.write_all(format!("{text}\r\n").as_bytes()).await?;
        self.writer.flush().await
    }

    fn reset(&mut self) {
        self.envelope_from = None;
        self.recipients.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;
    use tokio::sync::mpsc;

    use crate::pipeline::decode::extract_content;

    struct ChannelSink(mpsc::UnboundedSender<InboundMessage>);

    impl MessageSink for ChannelSink {
        fn accept(&self, message: InboundMessage) {
            let _ = self.0.send(message);
        }
    }

    struct Client {
        reader: BufReader<ReadHalf<DuplexStream>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl Client {
        async fn send(&mut self, line: &str) {
            self.writer
                .write_all(format!("{line}\r\n").as_bytes())
                .await
                .unwrap();
        }

        /// Read one (possibly multi-line) reply and return all its lines.
        async fn reply(&mut self) -> Vec<String> {
            let mut lines = Vec::new();
            loop {
                let mut line = String::new();
                self.reader.read_line(&mut line).await.unwrap();
                let line = line.trim_end().to_string();
                let last = line.as_bytes().get(3) != Some(&b'-');
                lines.push(line);
                if last {
                    return lines;
                }
            }
        }

        async fn expect(&mut self, code: &str) -> Vec<String> {
            let lines = self.reply().await;
            assert!(
                lines.last().is_some_and(|l| l.starts_with(code)),
                "expected {code}, got {lines:?}"
            );
            lines
        }

        async fn command(&mut self, line: &str, code: &str) -> Vec<String> {
            self.send(line).await;
            self.expect(code).await
        }
    }

    fn start(max_message_bytes: usize) -> (Client, mpsc::UnboundedReceiver<InboundMessage>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (tx, rx) = mpsc::unbounded_channel();
        let settings = Arc::new(SessionSettings {
            hostname: "relay.test".into(),
            max_message_bytes,
        });
        tokio::spawn(run_session(server, settings, Arc::new(ChannelSink(tx))));

        let (reader, writer) = tokio::io::split(client);
        (
            Client {
                reader: BufReader::new(reader),
                writer,
            },
            rx,
        )
    }

    #[test]
    fn parses_paths() {
        assert_eq!(
            parse_command("MAIL FROM:<a@b.com> SIZE=100"),
            Ok(Command::Mail("a@b.com".into()))
        );
        assert_eq!(
            parse_command("mail from: <a@b.com>"),
            Ok(Command::Mail("a@b.com".into()))
        );
        assert_eq!(parse_command("MAIL FROM:<>"), Ok(Command::Mail(String::new())));
        assert_eq!(
            parse_command("RCPT TO:bare@b.com"),
            Ok(Command::Rcpt("bare@b.com".into()))
        );
        assert!(parse_command("RCPT TO:<>").is_err());
        assert!(parse_command("MAIL a@b.com").is_err());
        assert!(parse_command("HELO").is_err());
        assert_eq!(
            parse_command("STARTTLS"),
            Ok(Command::Unknown("STARTTLS".into()))
        );
    }

    #[tokio::test]
    async fn full_transaction() {
        let (mut client, mut rx) = start(1024);
        client.expect("220").await;

        let ehlo = client.command("EHLO client.test", "250").await;
        assert!(ehlo.iter().any(|l| l.contains("8BITMIME")));
        assert!(ehlo.iter().any(|l| l.contains("SIZE 1024")));

        client.command("MAIL FROM:<sender@example.com>", "250").await;
        client.command("RCPT TO:<known@example.com>", "250").await;
        client.command("RCPT TO:<other@example.com>", "250").await;
        client.command("DATA", "354").await;
        client.send("Subject: Hello").await;
        client.send("").await;
        client.send("first line").await;
        client.send("..stuffed").await;
        client.command(".", "250").await;

        let message = rx.recv().await.unwrap();
        assert_eq!(message.envelope_from, "sender@example.com");
        assert_eq!(
            message.recipients.as_slice(),
            ["known@example.com", "other@example.com"]
        );
        assert_eq!(message.subject.as_deref(), Some("Hello"));
        let content = extract_content(&message.body).unwrap();
        assert!(content.contains("first line\r\n.stuffed"), "{content:?}");

        client.command("QUIT", "221").await;
    }

    #[tokio::test]
    async fn second_transaction_on_same_connection() {
        let (mut client, mut rx) = start(1024);
        client.expect("220").await;
        client.command("HELO client.test", "250").await;

        for n in 0..2 {
            client.command("MAIL FROM:<s@example.com>", "250").await;
            client.command(&format!("RCPT TO:<r{n}@example.com>"), "250").await;
            client.command("DATA", "354").await;
            client.send("Subject: x\r\n\r\nbody").await;
            client.command(".", "250").await;
        }

        assert_eq!(rx.recv().await.unwrap().recipients.as_slice(), ["r0@example.com"]);
        assert_eq!(rx.recv().await.unwrap().recipients.as_slice(), ["r1@example.com"]);
    }

    #[tokio::test]
    async fn out_of_sequence_commands() {
        let (mut client, _rx) = start(1024);
        client.expect("220").await;

        client.command("MAIL FROM:<s@example.com>", "503").await;
        client.command("HELO client.test", "250").await;
        client.command("RCPT TO:<r@example.com>", "503").await;
        client.command("DATA", "503").await;
        client.command("MAIL FROM:<s@example.com>", "250").await;
        client.command("MAIL FROM:<s@example.com>", "503").await;
        client.command("DATA", "503").await;
    }

    #[tokio::test]
    async fn rset_clears_transaction() {
        let (mut client, _rx) = start(1024);
        client.expect("220").await;
        client.command("HELO client.test", "250").await;
        client.command("MAIL FROM:<s@example.com>", "250").await;
        client.command("RCPT TO:<r@example.com>", "250").await;
        client.command("RSET", "250").await;
        client.command("DATA", "503").await;
    }

    #[tokio::test]
    async fn misc_commands() {
        let (mut client, _rx) = start(1024);
        client.expect("220").await;
        client.command("NOOP", "250").await;
        client.command("VRFY someone", "252").await;
        client.command("STARTTLS", "502").await;
        client.command("HELO", "501").await;
        client.command("HELO client.test", "250").await;
        client.command("MAIL FROM:nothing-here", "250").await;
        client.command("RCPT TO:<>", "501").await;
    }

    #[tokio::test]
    async fn oversized_message_is_refused() {
        let (mut client, mut rx) = start(16);
        client.expect("220").await;
        client.command("HELO client.test", "250").await;
        client.command("MAIL FROM:<s@example.com>", "250").await;
        client.command("RCPT TO:<r@example.com>", "250").await;
        client.command("DATA", "354").await;
        client.send("Subject: this header alone is over the limit").await;
        client.send("").await;
        client.send("body").await;
        client.command(".", "552").await;

        assert!(rx.try_recv().is_err());

        // Session stays usable and the transaction was reset.
        client.command("DATA", "503").await;
    }

    #[tokio::test]
    async fn overlong_command_closes_session() {
        let (mut client, _rx) = start(1024);
        client.expect("220").await;
        client.send(&"X".repeat(MAX_COMMAND_LINE as usize + 10)).await;
        client.expect("500").await;
    }
}
