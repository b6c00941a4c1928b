//! The JSON input dialect.
//!
//! Accepts one JSON object per record with the keys `pri`,
//! `timereported`, `timegenerated`, `hostname`, `app-name`, `procid`,
//! `msgid`, `uuid`, `structured-data`, `msg` and `$!` (free-form
//! properties). Numbers and strings are both accepted where senders
//! disagree (`pri`, `procid`). An inbound `uuid` is kept as a property;
//! store identifiers are always generated locally.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::event::Event;
use crate::format::ParseError;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(i64),
    String(String),
}

impl NumberOrString {
    fn into_string(self) -> String {
        match self {
            NumberOrString::Number(n) => n.to_string(),
            NumberOrString::String(s) => s,
        }
    }

    fn as_u8(&self) -> Option<u8> {
        match self {
            NumberOrString::Number(n) => u8::try_from(*n).ok(),
            NumberOrString::String(s) => s.parse().ok(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct JsonRecord {
    pri: Option<NumberOrString>,
    timereported: Option<String>,
    timegenerated: Option<String>,
    hostname: Option<String>,
    #[serde(rename = "app-name")]
    appname: Option<String>,
    procid: Option<NumberOrString>,
    msgid: Option<String>,
    uuid: Option<String>,
    #[serde(rename = "structured-data")]
    structured: Option<String>,
    msg: Option<String>,
    #[serde(rename = "$!")]
    properties: Option<serde_json::Map<String, Value>>,
}

fn parse_time(value: Option<&str>, fallback: DateTime<Utc>) -> DateTime<Utc> {
    value
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map(|ts| ts.with_timezone(&Utc))
        .unwrap_or(fallback)
}

pub fn parse(text: &str) -> Result<Event, ParseError> {
    let record: JsonRecord = serde_json::from_str(text)?;
    let now = Utc::now();

    let mut event = Event::default();
    event.set_priority(
        record
            .pri
            .as_ref()
            .and_then(NumberOrString::as_u8)
            .unwrap_or(13),
    );
    event.version = 1;
    event.time_generated = parse_time(record.timegenerated.as_deref(), now);
    event.time_reported = parse_time(record.timereported.as_deref(), event.time_generated);
    event.hostname = record.hostname.unwrap_or_default();
    event.appname = record.appname.unwrap_or_default();
    event.procid = record.procid.map(NumberOrString::into_string).unwrap_or_default();
    event.msgid = record.msgid.unwrap_or_default();
    event.structured = record.structured.unwrap_or_default();
    event.message = record.msg.unwrap_or_default();
    if let Some(properties) = record.properties {
        event.properties = properties;
    }
    if let Some(uuid) = record.uuid {
        event
            .properties
            .insert("uuid".to_string(), Value::String(uuid));
    }
    Ok(event)
}
