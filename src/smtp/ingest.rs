//! DATA ingestion: raw message bytes to [`InboundMessage`].
//!
//! mail-parser supplies the MIME tree; transfer encodings are undone here
//! while charsets are left for the pipeline to apply.

use mail_parser::{Encoding, Message, MessageParser, MessagePart, MimeHeaders, PartType};
use tracing::warn;

use crate::pipeline::decode::{decode_base64_body, decode_quoted_printable};
use crate::pipeline::types::{Body, BodyPart, InboundMessage};

/// Build the pipeline message for one completed transaction.
pub fn build_message(
    envelope_from: String,
    recipients: Vec<String>,
    data: &[u8],
) -> InboundMessage {
    let subject = raw_header(data, "Subject");
    let body = MessageParser::default()
        .parse(data)
        .and_then(|parsed| body_of(&parsed))
        .unwrap_or_else(|| Body::Single(BodyPart::new("text/plain", None, body_bytes(data))));

    InboundMessage::new(envelope_from, recipients, subject, body)
}

fn body_of(message: &Message<'_>) -> Option<Body> {
    let root = message.parts.first()?;
    match &root.body {
        PartType::Multipart(_) => {
            let mut leaves = Vec::new();
            collect_leaves(message, root, &mut leaves);
            Some(Body::Multipart(leaves))
        }
        _ => Some(Body::Single(leaf(message, root))),
    }
}

/// Depth-first, in original order. Attached messages are walked in place;
/// their part offsets are relative to their own raw bytes.
fn collect_leaves(message: &Message<'_>, part: &MessagePart<'_>, out: &mut Vec<BodyPart>) {
    match &part.body {
        PartType::Multipart(children) => {
            for child in children {
                if let Some(child) = message.parts.get(*child as usize) {
                    collect_leaves(message, child, out);
                }
            }
        }
        PartType::Message(nested) => {
            if let Some(root) = nested.parts.first() {
                collect_leaves(nested, root, out);
            }
        }
        _ => out.push(leaf(message, part)),
    }
}

fn leaf(message: &Message<'_>, part: &MessagePart<'_>) -> BodyPart {
    let (content_type, charset) = match part.content_type() {
        Some(ct) => (
            match ct.subtype() {
                Some(sub) => format!("{}/{}", ct.ctype(), sub),
                None => ct.ctype().to_string(),
            },
            ct.attribute("charset"),
        ),
        None => ("text/plain".to_string(), None),
    };

    let raw = message
        .raw_message
        .get(part.offset_body as usize..part.offset_end as usize)
        .unwrap_or_default();

    let payload = match part.encoding {
        Encoding::Base64 => decode_base64_body(raw).unwrap_or_else(|e| {
            warn!(error = %e, "Undecodable base64 part, keeping raw bytes");
            raw.to_vec()
        }),
        Encoding::QuotedPrintable => decode_quoted_printable(raw),
        Encoding::None => raw.to_vec(),
    };

    BodyPart::new(content_type, charset, payload)
}

/// Everything after the header block.
fn body_bytes(data: &[u8]) -> &[u8] {
    if let Some(pos) = find(data, b"\r\n\r\n") {
        &data[pos + 4..]
    } else if let Some(pos) = find(data, b"\n\n") {
        &data[pos + 2..]
    } else {
        data
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Raw (still encoded) value of the first `name` header, unfolded.
///
/// Only the header block is scanned. Raw 8-bit values that are not UTF-8
/// are read as Latin-1 so no byte is lost before subject decoding.
fn raw_header(data: &[u8], name: &str) -> Option<String> {
    let mut value: Option<Vec<u8>> = None;

    for line in data.split(|b| *b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            break;
        }
        let continuation = matches!(line.first(), Some(b' ' | b'\t'));
        match value.as_mut() {
            Some(current) if continuation => {
                current.extend_from_slice(line);
                continue;
            }
            Some(_) => break,
            None => {}
        }
        if let Some(colon) = line.iter().position(|b| *b == b':')
            && line[..colon].trim_ascii_end().eq_ignore_ascii_case(name.as_bytes())
        {
            value = Some(line[colon + 1..].trim_ascii_start().to_vec());
        }
    }

    value.map(|v| header_text(v.trim_ascii_end()))
}

fn header_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => bytes.iter().map(|&b| char::from(b)).collect(),
    }
}
