//! Subject and body decoding.
//!
//! Pure functions: the same header bytes and charset always give the same
//! text. Charsets are resolved through `encoding_rs` and decoded strictly, so
//! malformed input surfaces as a [`DecodeError`] instead of replacement
//! characters.

use std::borrow::Cow;

use base64::Engine as _;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use encoding_rs::Encoding;

use crate::error::DecodeError;
use crate::pipeline::types::{Body, BodyPart, DecodedMessage, InboundMessage};

/// Subject used when the message carries no `Subject` header.
pub const NO_SUBJECT: &str = "No subject";

const DEFAULT_CHARSET: &str = "utf-8";

/// Encoded words are often emitted without padding.
const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Resolve subject and content for a message.
pub fn decode_message(message: &InboundMessage) -> Result<DecodedMessage, DecodeError> {
    let subject = decode_subject(message.subject.as_deref())?;
    let content = extract_content(&message.body)?;
    Ok(DecodedMessage::new(subject, content))
}

// ── Charsets ────────────────────────────────────────────────────────

/// Labels that map every byte to the code point of the same value.
const LATIN1_LABELS: &[&str] = &[
    "iso_8859_1",
    "iso8859_1",
    "iso_8859_1:1987",
    "iso_ir_100",
    "latin_1",
    "latin1",
    "l1",
    "cp819",
    "ibm819",
    "csisolatin1",
];

/// Seven-bit labels; any high byte is malformed.
const ASCII_LABELS: &[&str] = &["us_ascii", "ascii", "ansi_x3.4_1968", "iso646_us", "csascii"];

/// Decode `bytes` in `charset` (UTF-8 when absent).
///
/// `encoding_rs` follows the WHATWG table, which folds ISO-8859-1 and
/// US-ASCII into windows-1252. Those two are decoded literally here.
pub fn decode_charset(
    bytes: &[u8],
    charset: Option<&str>,
    context: &str,
) -> Result<String, DecodeError> {
    let label = charset
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .unwrap_or(DEFAULT_CHARSET);

    let normalized = label.to_ascii_lowercase().replace(['-', ' '], "_");
    if LATIN1_LABELS.contains(&normalized.as_str()) {
        return Ok(bytes.iter().map(|&b| char::from(b)).collect());
    }
    if ASCII_LABELS.contains(&normalized.as_str()) {
        return if bytes.is_ascii() {
            Ok(bytes.iter().map(|&b| char::from(b)).collect())
        } else {
            Err(DecodeError::Malformed {
                charset: "us-ascii".to_string(),
                context: context.to_string(),
            })
        };
    }

    let encoding = Encoding::for_label(label.as_bytes())
        .ok_or_else(|| DecodeError::UnknownCharset(label.to_string()))?;

    encoding
        .decode_without_bom_handling_and_without_replacement(bytes)
        .map(Cow::into_owned)
        .ok_or_else(|| DecodeError::Malformed {
            charset: encoding.name().to_string(),
            context: context.to_string(),
        })
}

// ── Content extractor ───────────────────────────────────────────────

/// Pick and decode the message content.
///
/// Multipart: the first `text/plain` or `text/html` part by position wins,
/// everything after it is ignored. No such part gives an empty string.
/// Single part: the payload is decoded whatever its declared type.
pub fn extract_content(body: &Body) -> Result<String, DecodeError> {
    match body {
        Body::Single(part) => decode_part(part),
        Body::Multipart(parts) => Ok(parts
            .iter()
            .find(|part| part.is_text())
            .map(decode_part)
            .transpose()?
            .unwrap_or_default()),
    }
}

fn decode_part(part: &BodyPart) -> Result<String, DecodeError> {
    decode_charset(&part.payload, part.charset.as_deref(), &part.content_type)
}

// ── Subject decoder ─────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
enum Segment<'a> {
    Plain(&'a str),
    Encoded { charset: &'a str, bytes: Vec<u8> },
}

/// Decode a raw `Subject` header (RFC 2047 encoded words).
///
/// Each encoded word is decoded with its own charset (UTF-8 if it names
/// none) and the pieces are concatenated in order. Whitespace separating two
/// encoded words is dropped; other unencoded text is kept as-is.
pub fn decode_subject(raw: Option<&str>) -> Result<String, DecodeError> {
    let Some(raw) = raw else {
        return Ok(NO_SUBJECT.to_string());
    };

    let unfolded: String = raw.chars().filter(|c| *c != '\r' && *c != '\n').collect();
    let segments = split_encoded_words(unfolded.trim())?;

    let mut decoded = String::new();
    let mut pending: Option<(&str, Vec<u8>)> = None;

    for (i, segment) in segments.iter().enumerate() {
        match segment {
            Segment::Plain(text) => {
                let between_words = text.trim().is_empty()
                    && i > 0
                    && matches!(segments.get(i + 1), Some(Segment::Encoded { .. }))
                    && matches!(segments[i - 1], Segment::Encoded { .. });
                if between_words {
                    continue;
                }
                flush_word(&mut pending, &mut decoded)?;
                decoded.push_str(text);
            }
            Segment::Encoded { charset, bytes } => {
                // Adjacent words in one charset may split a multi-byte sequence.
                if let Some((current, buf)) = pending.as_mut()
                    && current.eq_ignore_ascii_case(charset)
                {
                    buf.extend_from_slice(bytes);
                } else {
                    flush_word(&mut pending, &mut decoded)?;
                    pending = Some((*charset, bytes.clone()));
                }
            }
        }
    }
    flush_word(&mut pending, &mut decoded)?;

    Ok(decoded)
}

fn flush_word(pending: &mut Option<(&str, Vec<u8>)>, out: &mut String) -> Result<(), DecodeError> {
    if let Some((charset, bytes)) = pending.take() {
        let charset = (!charset.is_empty()).then_some(charset);
        out.push_str(&decode_charset(&bytes, charset, "subject")?);
    }
    Ok(())
}

fn split_encoded_words(header: &str) -> Result<Vec<Segment<'_>>, DecodeError> {
    let mut segments = Vec::new();
    let mut plain_start = 0;
    let mut cursor = 0;

    while let Some(offset) = header[cursor..].find("=?") {
        let start = cursor + offset;
        match parse_encoded_word(&header[start..])? {
            Some((segment, len)) => {
                if plain_start < start {
                    segments.push(Segment::Plain(&header[plain_start..start]));
                }
                segments.push(segment);
                cursor = start + len;
                plain_start = cursor;
            }
            None => cursor = start + 2,
        }
    }
    if plain_start < header.len() {
        segments.push(Segment::Plain(&header[plain_start..]));
    }

    Ok(segments)
}

/// Parse `=?charset?enc?text?=` at the start of `input`.
///
/// `Ok(None)` means the text only looks like an encoded word and is plain.
fn parse_encoded_word(input: &str) -> Result<Option<(Segment<'_>, usize)>, DecodeError> {
    let Some(body) = input.strip_prefix("=?") else {
        return Ok(None);
    };
    let Some((charset, rest)) = body.split_once('?') else {
        return Ok(None);
    };
    let Some((encoding, rest)) = rest.split_once('?') else {
        return Ok(None);
    };
    let Some(text_len) = rest.find("?=") else {
        return Ok(None);
    };
    let text = &rest[..text_len];
    if charset.contains(char::is_whitespace) || text.contains(char::is_whitespace) {
        return Ok(None);
    }

    // RFC 2231 language suffix: `utf-8*en`.
    let charset = charset.split('*').next().unwrap_or_default();
    let word_len = input.len() - rest.len() + text_len + 2;
    let word = &input[..word_len];

    let bytes = match encoding {
        "B" | "b" => LENIENT_BASE64
            .decode(text)
            .map_err(|e| DecodeError::InvalidEncodedWord {
                word: word.to_string(),
                reason: e.to_string(),
            })?,
        "Q" | "q" => decode_q(text),
        _ => return Ok(None),
    };

    Ok(Some((Segment::Encoded { charset, bytes }, word_len)))
}

/// Q encoding: quoted-printable with `_` standing for a space.
fn decode_q(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len());
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'_' => {
                out.push(b' ');
                i += 1;
            }
            b'=' if i + 2 < bytes.len() && hex_pair(bytes[i + 1], bytes[i + 2]).is_some() => {
                out.extend(hex_pair(bytes[i + 1], bytes[i + 2]));
                i += 3;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    out
}

// ── Transfer encodings ──────────────────────────────────────────────

/// Undo `Content-Transfer-Encoding: quoted-printable`.
///
/// Soft line breaks are removed; invalid escapes are kept literally.
pub fn decode_quoted_printable(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        if input[i] != b'=' {
            out.push(input[i]);
            i += 1;
            continue;
        }
        match input.get(i + 1..i + 3) {
            Some([b'\r', b'\n']) => i += 3,
            Some([b'\n', _]) => i += 2,
            Some([hi, lo]) if hex_pair(*hi, *lo).is_some() => {
                out.extend(hex_pair(*hi, *lo));
                i += 3;
            }
            None if input.get(i + 1) == Some(&b'\n') => i += 2,
            _ => {
                out.push(b'=');
                i += 1;
            }
        }
    }
    out
}

/// Undo `Content-Transfer-Encoding: base64`, skipping line breaks.
pub fn decode_base64_body(input: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let compact: Vec<u8> = input
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    LENIENT_BASE64
        .decode(&compact)
        .map_err(|e| DecodeError::Malformed {
            charset: "base64".into(),
            context: e.to_string(),
        })
}

fn hex_pair(hi: u8, lo: u8) -> Option<u8> {
    let hi = (hi as char).to_digit(16)?;
    let lo = (lo as char).to_digit(16)?;
    Some((hi * 16 + lo) as u8)
}
