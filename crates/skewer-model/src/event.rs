//! The normalized event record.
//!
//! Every ingestion path (TCP, UDP, RELP, whatever the framing) funnels
//! into an [`Event`]. The serialized form of this struct is what the
//! store persists and what destination encoders render.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Application name that marks a message body as an audit payload.
pub const AUDIT_APPNAME: &str = "go-audit";

/// Raw syslog priority: `facility * 8 + severity`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Priority(pub u8);

impl Priority {
    #[must_use]
    pub fn facility(self) -> Facility {
        Facility(self.0 / 8)
    }

    #[must_use]
    pub fn severity(self) -> Severity {
        Severity(self.0 % 8)
    }
}

/// Syslog facility, 0–23.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Facility(pub u8);

/// Syslog severity, 0–7.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Severity(pub u8);

/// A normalized syslog event.
///
/// `structured` carries the raw RFC5424 STRUCTURED-DATA string when SD
/// parsing is disabled for the listener; otherwise the parsed two-level
/// mapping lands in `properties` under the `rfc5424-sd` key and
/// `structured` stays empty. Both forms never coexist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub priority: Priority,
    pub facility: Facility,
    pub severity: Severity,
    pub version: u8,
    #[serde(rename = "timereported")]
    pub time_reported: DateTime<Utc>,
    #[serde(rename = "timegenerated")]
    pub time_generated: DateTime<Utc>,
    pub hostname: String,
    pub appname: String,
    pub procid: String,
    pub msgid: String,
    #[serde(default)]
    pub structured: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit: Option<Value>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub properties: serde_json::Map<String, Value>,
}

impl Default for Event {
    fn default() -> Self {
        let now = Utc::now();
        Event {
            priority: Priority::default(),
            facility: Facility::default(),
            severity: Severity::default(),
            version: 0,
            time_reported: now,
            time_generated: now,
            hostname: String::new(),
            appname: String::new(),
            procid: String::new(),
            msgid: String::new(),
            structured: String::new(),
            message: String::new(),
            audit: None,
            properties: serde_json::Map::new(),
        }
    }
}

impl Event {
    /// Sets priority together with the facility and severity it encodes.
    pub fn set_priority(&mut self, pri: u8) {
        self.priority = Priority(pri);
        self.facility = self.priority.facility();
        self.severity = self.priority.severity();
    }

    /// When the event came from the audit agent, its body is a JSON
    /// document. Move it into the dedicated audit field so downstream
    /// consumers get structure instead of a string. A body that fails to
    /// parse is left alone.
    pub fn apply_audit_convention(&mut self) {
        if self.appname != AUDIT_APPNAME {
            return;
        }
        if let Ok(audit) = serde_json::from_str::<Value>(&self.message) {
            self.audit = Some(audit);
            self.message = String::new();
        }
    }

    /// True when parsing produced nothing worth keeping.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.message.is_empty()
            && self.structured.is_empty()
            && self.audit.is_none()
            && self.properties.is_empty()
    }
}

/// Validates a Kafka-style topic name: non-empty, at most 249 bytes,
/// restricted to `[a-zA-Z0-9._-]`.
#[must_use]
pub fn topic_name_is_valid(name: &str) -> bool {
    if name.is_empty() || name.len() > 249 {
        return false;
    }
    name.bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || b == b'-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_decomposition() {
        let pri = Priority(165);
        assert_eq!(pri.facility(), Facility(20));
        assert_eq!(pri.severity(), Severity(5));
    }

    #[test]
    fn test_set_priority_updates_all_fields() {
        let mut event = Event::default();
        event.set_priority(13);
        assert_eq!(event.priority, Priority(13));
        assert_eq!(event.facility, Facility(1));
        assert_eq!(event.severity, Severity(5));
    }

    #[test]
    fn test_audit_convention_moves_json_body() {
        let mut event = Event {
            appname: AUDIT_APPNAME.to_string(),
            message: r#"{"sequence":42}"#.to_string(),
            ..Event::default()
        };
        event.apply_audit_convention();
        assert!(event.message.is_empty());
        assert_eq!(event.audit.unwrap()["sequence"], 42);
    }

    #[test]
    fn test_audit_convention_keeps_unparseable_body() {
        let mut event = Event {
            appname: AUDIT_APPNAME.to_string(),
            message: "not json".to_string(),
            ..Event::default()
        };
        event.apply_audit_convention();
        assert_eq!(event.message, "not json");
        assert!(event.audit.is_none());
    }

    #[test]
    fn test_audit_convention_ignores_other_appnames() {
        let mut event = Event {
            appname: "nginx".to_string(),
            message: r#"{"k":1}"#.to_string(),
            ..Event::default()
        };
        event.apply_audit_convention();
        assert!(event.audit.is_none());
    }

    #[test]
    fn test_event_serde_round_trip() {
        let mut event = Event {
            version: 1,
            hostname: "web01".to_string(),
            appname: "nginx".to_string(),
            procid: "1234".to_string(),
            msgid: "ID47".to_string(),
            message: "request served".to_string(),
            ..Event::default()
        };
        event.set_priority(165);
        let bytes = serde_json::to_vec(&event).unwrap();
        let back: Event = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_topic_name_validation() {
        assert!(topic_name_is_valid("logs.web-01_raw"));
        assert!(!topic_name_is_valid(""));
        assert!(!topic_name_is_valid("has space"));
        assert!(!topic_name_is_valid("unicode-é"));
        assert!(!topic_name_is_valid(&"x".repeat(250)));
    }
}
