//! Parsing dispatch: declared formats, character-set decoding and the
//! auto-detection rules.

use std::borrow::Cow;
use std::str::FromStr;

use crate::event::Event;
use crate::{json_format, rfc3164, rfc5424};

/// Character set a listener declares for its clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Utf8,
    Latin1,
}

impl FromStr for Encoding {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "utf8" | "utf-8" => Ok(Encoding::Utf8),
            "latin1" | "latin-1" | "iso-8859-1" => Ok(Encoding::Latin1),
            other => Err(ParseError::UnknownEncoding(other.to_string())),
        }
    }
}

/// Message format a listener declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    Rfc5424,
    Rfc3164,
    Json,
    #[default]
    Auto,
}

impl FromStr for Format {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rfc5424" => Ok(Format::Rfc5424),
            "rfc3164" => Ok(Format::Rfc3164),
            "json" => Ok(Format::Json),
            "" | "auto" => Ok(Format::Auto),
            other => Err(ParseError::UnknownFormat(other.to_string())),
        }
    }
}

/// A record that could not be turned into an [`Event`].
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("empty record")]
    Empty,
    #[error("record is not valid {encoding:?}")]
    BadEncoding { encoding: Encoding },
    #[error("unknown format: {0}")]
    UnknownFormat(String),
    #[error("unknown encoding: {0}")]
    UnknownEncoding(String),
    #[error("invalid priority header")]
    InvalidPriority,
    #[error("message does not have enough header parts")]
    TooFewParts,
    #[error("invalid structured data: {0}")]
    InvalidStructuredData(String),
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
    #[error("invalid json record: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

/// Decodes raw bytes to UTF-8 text according to the declared encoding.
pub fn decode(raw: &[u8], encoding: Encoding) -> Result<Cow<'_, str>, ParseError> {
    match encoding {
        Encoding::Utf8 => std::str::from_utf8(raw)
            .map(Cow::Borrowed)
            .map_err(|_| ParseError::BadEncoding { encoding }),
        // Latin-1 maps every byte to the code point of the same value.
        Encoding::Latin1 => Ok(Cow::Owned(raw.iter().map(|&b| b as char).collect())),
    }
}

/// Parses one record into an [`Event`].
///
/// Auto-detection: a leading `{` means JSON; a leading `<` followed by a
/// priority block and a version field of `1` means RFC 5424; everything
/// else is treated as RFC 3164. The audit-agent convention is applied to
/// whatever the parser produced.
pub fn parse(raw: &[u8], encoding: Encoding, format: Format, dont_parse_sd: bool)
    -> Result<Event, ParseError>
{
    let text = decode(raw, encoding)?;
    let text = text.trim();
    if text.is_empty() {
        return Err(ParseError::Empty);
    }

    let mut event = match format {
        Format::Rfc5424 => rfc5424::parse(text, dont_parse_sd)?,
        Format::Rfc3164 => rfc3164::parse(text)?,
        Format::Json => json_format::parse(text)?,
        Format::Auto => parse_auto(text, dont_parse_sd)?,
    };
    event.apply_audit_convention();
    Ok(event)
}

fn parse_auto(text: &str, dont_parse_sd: bool) -> Result<Event, ParseError> {
    let bytes = text.as_bytes();
    if bytes[0] == b'{' {
        return json_format::parse(text);
    }
    if bytes[0] != b'<' {
        return rfc3164::parse(text);
    }
    // A priority block is present; RFC 5424 iff the version field right
    // after it is "1".
    match text.find('>') {
        Some(i) if i >= 2 && text.len() > i + 1 && bytes[i + 1] == b'1' => {
            rfc5424::parse(text, dont_parse_sd)
        }
        _ => rfc3164::parse(text),
    }
}
