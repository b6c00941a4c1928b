//! Event model and syslog parsers for the skewer relay.
//!
//! This crate owns everything about a log message that is independent of
//! transport and storage: the normalized [`Event`] record, time-sortable
//! [`EventId`] identifiers, and the parsers that turn raw syslog bytes
//! into events (RFC 5424, RFC 3164, a JSON dialect, and auto-detection).
//!
//! The relay crate layers framing, persistence and delivery on top.

pub mod event;
pub mod format;
pub mod id;
pub mod json_format;
pub mod rfc3164;
pub mod rfc5424;

pub use event::{Event, Facility, Priority, Severity};
pub use format::{parse, Encoding, Format, ParseError};
pub use id::{ConfigId, EventId, IdGenerator};
