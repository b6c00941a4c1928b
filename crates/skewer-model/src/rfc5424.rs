//! RFC 5424 parsing and serialization.
//!
//! The parser is split-based on the six header separators, then hands
//! the remainder to a small recursive-descent scanner for
//! STRUCTURED-DATA. Values inside SD params may escape `"`, `\` and
//! `]`; the scanner unescapes them, and [`serialize`] re-escapes, so a
//! canonical event survives a serialize/parse round trip.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

use crate::event::Event;
use crate::format::ParseError;

/// Key under which parsed STRUCTURED-DATA lands in event properties.
pub const SD_PROPERTY: &str = "rfc5424-sd";

/// Parses an RFC 5424 message.
///
/// With `dont_parse_sd`, STRUCTURED-DATA is kept verbatim in
/// `event.structured`; otherwise it is parsed into
/// `properties["rfc5424-sd"]` as `sdid -> name -> value`.
pub fn parse(text: &str, dont_parse_sd: bool) -> Result<Event, ParseError> {
    // HEADER = PRI VERSION SP TIMESTAMP SP HOSTNAME SP APP-NAME SP PROCID SP MSGID
    // SYSLOG-MSG = HEADER SP STRUCTURED-DATA [SP MSG]
    let splits: Vec<&str> = text.splitn(7, ' ').collect();
    if splits.len() < 7 {
        return Err(ParseError::TooFewParts);
    }

    let mut event = Event::default();
    let (pri, version) = parse_priority_version(splits[0])?;
    event.set_priority(pri);
    event.version = version;

    event.time_reported = match splits[1] {
        "-" => Utc::now(),
        ts => DateTime::parse_from_rfc3339(ts)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    };
    event.time_generated = Utc::now();

    for (slot, part) in [
        (&mut event.hostname, splits[2]),
        (&mut event.appname, splits[3]),
        (&mut event.procid, splits[4]),
        (&mut event.msgid, splits[5]),
    ] {
        if part != "-" {
            *slot = part.to_string();
        }
    }

    let structured_and_msg = splits[6].trim();
    if let Some(rest) = structured_and_msg.strip_prefix('-') {
        event.message = rest.trim().to_string();
    } else if structured_and_msg.starts_with('[') {
        let (sd, msg) = split_structured_and_message(structured_and_msg)?;
        event.message = msg.to_string();
        if dont_parse_sd {
            event.structured = sd.to_string();
        } else {
            let props = parse_structured_data(sd)?;
            event.properties.insert(SD_PROPERTY.to_string(), props);
        }
    } else {
        return Err(ParseError::InvalidStructuredData(
            "expected '-' or '['".to_string(),
        ));
    }

    Ok(event)
}

fn parse_priority_version(pv: &str) -> Result<(u8, u8), ParseError> {
    let rest = pv.strip_prefix('<').ok_or(ParseError::InvalidPriority)?;
    let end = rest.find('>').ok_or(ParseError::InvalidPriority)?;
    if end == 0 || rest.len() <= end + 1 {
        return Err(ParseError::InvalidPriority);
    }
    let pri: u8 = rest[..end].parse().map_err(|_| ParseError::InvalidPriority)?;
    let version: u8 = rest[end + 1..]
        .parse()
        .map_err(|_| ParseError::InvalidPriority)?;
    Ok((pri, version))
}

/// Splits `[sd-element]...[sd-element] message` at the last bracket of
/// the SD block: the first `]` that is followed by a space and not
/// escaped.
fn split_structured_and_message(input: &str) -> Result<(&str, &str), ParseError> {
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 1,
            b']' => {
                if i == bytes.len() - 1 {
                    return Ok((input, ""));
                }
                if bytes[i + 1] == b' ' {
                    return Ok((&input[..=i], input[i + 1..].trim_start()));
                }
            }
            _ => {}
        }
        i += 1;
    }
    Err(ParseError::InvalidStructuredData(
        "unterminated sd element".to_string(),
    ))
}

struct SdScanner<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> SdScanner<'a> {
    fn err(&self, msg: &str) -> ParseError {
        ParseError::InvalidStructuredData(format!("{msg} at offset {}", self.pos))
    }

    fn element(&mut self, out: &mut serde_json::Map<String, Value>) -> Result<(), ParseError> {
        // SD-ID up to SP (params follow) or ']' (bare element)
        let start = self.pos;
        while self.pos < self.bytes.len()
            && self.bytes[self.pos] != b' '
            && self.bytes[self.pos] != b']'
        {
            self.pos += 1;
        }
        if self.pos == start || self.pos == self.bytes.len() {
            return Err(self.err("invalid sd-id"));
        }
        let sdid = std::str::from_utf8(&self.bytes[start..self.pos])
            .map_err(|_| self.err("sd-id is not utf-8"))?
            .to_string();
        let mut params = serde_json::Map::new();
        loop {
            match self.bytes.get(self.pos) {
                Some(b' ') => {
                    self.pos += 1;
                    self.param(&mut params)?;
                }
                Some(b']') => {
                    self.pos += 1;
                    break;
                }
                _ => return Err(self.err("expected SP or ']'")),
            }
        }
        out.insert(sdid, Value::Object(params));
        Ok(())
    }

    fn param(&mut self, params: &mut serde_json::Map<String, Value>) -> Result<(), ParseError> {
        let start = self.pos;
        while self.pos < self.bytes.len() && self.bytes[self.pos] != b'=' {
            self.pos += 1;
        }
        if self.pos == start || self.pos >= self.bytes.len() {
            return Err(self.err("invalid sd-name"));
        }
        let name = std::str::from_utf8(&self.bytes[start..self.pos])
            .map_err(|_| self.err("sd-name is not utf-8"))?
            .to_string();
        self.pos += 1; // '='
        let value = self.value()?;
        params.insert(name, Value::String(value));
        Ok(())
    }

    fn value(&mut self) -> Result<String, ParseError> {
        if self.pos >= self.bytes.len() || self.bytes[self.pos] != b'"' {
            return Err(self.err("sd-value must start with a quote"));
        }
        self.pos += 1;
        let mut value: Vec<u8> = Vec::new();
        while self.pos < self.bytes.len() {
            match self.bytes[self.pos] {
                b'\\' => {
                    self.pos += 1;
                    if self.pos >= self.bytes.len() {
                        return Err(self.err("unexpected end after backslash"));
                    }
                    match self.bytes[self.pos] {
                        c @ (b'"' | b'\\' | b']') => value.push(c),
                        c => {
                            value.push(b'\\');
                            value.push(c);
                        }
                    }
                    self.pos += 1;
                }
                b'"' => {
                    self.pos += 1;
                    return String::from_utf8(value)
                        .map_err(|_| self.err("sd-value is not utf-8"));
                }
                c => {
                    value.push(c);
                    self.pos += 1;
                }
            }
        }
        Err(self.err("unterminated sd-value"))
    }
}

/// Parses one or more `[sdid name="value" ...]` elements.
pub fn parse_structured_data(sd: &str) -> Result<Value, ParseError> {
    let mut scanner = SdScanner {
        bytes: sd.as_bytes(),
        pos: 0,
    };
    let mut out = serde_json::Map::new();
    while scanner.pos < scanner.bytes.len() {
        if scanner.bytes[scanner.pos] != b'[' {
            return Err(scanner.err("expected '['"));
        }
        scanner.pos += 1;
        scanner.element(&mut out)?;
    }
    Ok(Value::Object(out))
}

fn escape_sd_value(value: &str, out: &mut String) {
    for c in value.chars() {
        if c == '"' || c == '\\' || c == ']' {
            out.push('\\');
        }
        out.push(c);
    }
}

fn field(s: &str) -> &str {
    if s.is_empty() {
        "-"
    } else {
        s
    }
}

/// Renders an event as one RFC 5424 line (no trailing newline).
#[must_use]
pub fn serialize(event: &Event) -> String {
    let mut out = String::with_capacity(64 + event.message.len());
    out.push('<');
    out.push_str(&event.priority.0.to_string());
    out.push('>');
    out.push_str(&event.version.max(1).to_string());
    out.push(' ');
    out.push_str(&event.time_reported.to_rfc3339_opts(SecondsFormat::Nanos, true));
    out.push(' ');
    out.push_str(field(&event.hostname));
    out.push(' ');
    out.push_str(field(&event.appname));
    out.push(' ');
    out.push_str(field(&event.procid));
    out.push(' ');
    out.push_str(field(&event.msgid));
    out.push(' ');

    if !event.structured.is_empty() {
        out.push_str(&event.structured);
    } else if let Some(Value::Object(elements)) = event.properties.get(SD_PROPERTY) {
        if elements.is_empty() {
            out.push('-');
        }
        for (sdid, params) in elements {
            out.push('[');
            out.push_str(sdid);
            if let Value::Object(params) = params {
                for (name, value) in params {
                    out.push(' ');
                    out.push_str(name);
                    out.push_str("=\"");
                    if let Value::String(value) = value {
                        escape_sd_value(value, &mut out);
                    }
                    out.push('"');
                }
            }
            out.push(']');
        }
    } else {
        out.push('-');
    }

    if !event.message.is_empty() {
        out.push(' ');
        out.push_str(&event.message);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Facility, Severity};
    use chrono::TimeZone;

    #[test]
    fn test_parse_full_header() {
        let event = parse(
            "<165>1 2003-10-11T22:14:15.003Z mymachine.example.com evntslog 111 ID47 - BOMAn application event log entry",
            false,
        )
        .unwrap();
        assert_eq!(event.priority.0, 165);
        assert_eq!(event.facility, Facility(20));
        assert_eq!(event.severity, Severity(5));
        assert_eq!(event.version, 1);
        assert_eq!(event.hostname, "mymachine.example.com");
        assert_eq!(event.appname, "evntslog");
        assert_eq!(event.procid, "111");
        assert_eq!(event.msgid, "ID47");
        assert_eq!(event.message, "BOMAn application event log entry");
        assert_eq!(
            event.time_reported,
            Utc.with_ymd_and_hms(2003, 10, 11, 22, 14, 15).unwrap()
                + chrono::Duration::milliseconds(3)
        );
    }

    #[test]
    fn test_parse_nil_fields() {
        let event = parse("<13>1 - - - - - - hello", false).unwrap();
        assert!(event.hostname.is_empty());
        assert!(event.appname.is_empty());
        assert!(event.procid.is_empty());
        assert!(event.msgid.is_empty());
        assert_eq!(event.message, "hello");
    }

    #[test]
    fn test_bad_timestamp_falls_back_to_now() {
        let before = Utc::now();
        let event = parse("<13>1 not-a-time h a p m - x", false).unwrap();
        assert!(event.time_reported >= before);
    }

    #[test]
    fn test_parse_structured_data_elements() {
        let event = parse(
            r#"<165>1 2003-10-11T22:14:15Z h a p m [exampleSDID@32473 iut="3" eventSource="Application"][other x="1"] the message"#,
            false,
        )
        .unwrap();
        assert_eq!(event.message, "the message");
        let sd = event.properties.get(SD_PROPERTY).unwrap();
        assert_eq!(sd["exampleSDID@32473"]["iut"], "3");
        assert_eq!(sd["exampleSDID@32473"]["eventSource"], "Application");
        assert_eq!(sd["other"]["x"], "1");
        assert!(event.structured.is_empty());
    }

    #[test]
    fn test_sd_escaped_characters() {
        let event = parse(
            r#"<165>1 - h a p m [e k="a \"quoted\" \] \\ value"] msg"#,
            false,
        )
        .unwrap();
        let sd = event.properties.get(SD_PROPERTY).unwrap();
        assert_eq!(sd["e"]["k"], r#"a "quoted" ] \ value"#);
    }

    #[test]
    fn test_dont_parse_sd_keeps_raw_string() {
        let event = parse(r#"<165>1 - h a p m [e k="v"] msg"#, true).unwrap();
        assert_eq!(event.structured, r#"[e k="v"]"#);
        assert!(event.properties.is_empty());
        assert_eq!(event.message, "msg");
    }

    #[test]
    fn test_sd_without_message() {
        let event = parse(r#"<165>1 - h a p m [e k="v"]"#, false).unwrap();
        assert!(event.message.is_empty());
    }

    #[test]
    fn test_rejects_garbage_structured_data() {
        assert!(parse("<165>1 - h a p m garbage here and more", false).is_err());
        assert!(parse(r#"<165>1 - h a p m [e k=noquote] m"#, false).is_err());
        assert!(parse(r#"<165>1 - h a p m [e k="open] m"#, false).is_err());
    }

    #[test]
    fn test_rejects_short_and_invalid_headers() {
        assert!(matches!(parse("<13>1 short", false), Err(ParseError::TooFewParts)));
        assert!(parse("13>1 - - - - - - x", false).is_err());
        assert!(parse("<999>1 - - - - - - x", false).is_err());
        assert!(parse("<13>x - - - - - - x", false).is_err());
    }

    #[test]
    fn test_serialize_parse_round_trip() {
        let mut event = Event {
            version: 1,
            time_reported: Utc.with_ymd_and_hms(2020, 1, 2, 3, 4, 5).unwrap()
                + chrono::Duration::nanoseconds(123_456_789),
            hostname: "web01".to_string(),
            appname: "nginx".to_string(),
            procid: "77".to_string(),
            msgid: "REQ".to_string(),
            message: "served in 3ms".to_string(),
            ..Event::default()
        };
        event.set_priority(165);
        let mut params = serde_json::Map::new();
        params.insert("path".to_string(), Value::String(r#"/a "b" ]"#.to_string()));
        let mut elements = serde_json::Map::new();
        elements.insert("req@1".to_string(), Value::Object(params));
        event
            .properties
            .insert(SD_PROPERTY.to_string(), Value::Object(elements));

        let line = serialize(&event);
        let mut parsed = parse(&line, false).unwrap();
        parsed.time_generated = event.time_generated;
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_serialize_minimal_event() {
        let mut event = Event {
            version: 1,
            time_reported: Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
            message: "hi".to_string(),
            ..Event::default()
        };
        event.set_priority(14);
        assert_eq!(
            serialize(&event),
            "<14>1 2020-01-01T00:00:00.000000000Z - - - - - hi"
        );
    }
}
