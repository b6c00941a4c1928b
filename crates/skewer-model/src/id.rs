//! Time-sortable message identifiers.
//!
//! An [`EventId`] is 128 bits: a 48-bit big-endian unix-millisecond
//! timestamp followed by 80 bits of randomness, so the natural byte
//! order of identifiers is also their time order. The store relies on
//! this: partition scans return events oldest-first without a secondary
//! index.
//!
//! Identifiers produced by one [`IdGenerator`] are strictly monotonic
//! for the lifetime of the process, even when several are drawn within
//! the same millisecond.

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Identifier of the listener/filter configuration that produced an event.
///
/// Stored next to each event so it can be reinterpreted later with the
/// configuration that was active at ingestion time.
pub type ConfigId = uuid::Uuid;

/// A 128-bit lexicographically sortable event identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EventId([u8; 16]);

impl EventId {
    pub const LEN: usize = 16;

    /// Rebuilds an identifier from its 16-byte storage form.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        EventId(bytes)
    }

    /// Reads an identifier from a key slice. Returns `None` when the
    /// slice is not exactly 16 bytes.
    #[must_use]
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        let bytes: [u8; 16] = slice.try_into().ok()?;
        Some(EventId(bytes))
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Millisecond timestamp embedded in the identifier.
    #[must_use]
    pub fn timestamp_ms(&self) -> u64 {
        let mut ts = [0u8; 8];
        ts[2..8].copy_from_slice(&self.0[0..6]);
        u64::from_be_bytes(ts)
    }

    /// The identifier incremented by one, with carry through the random
    /// part into the timestamp. Used to keep same-millisecond draws
    /// monotonic.
    #[must_use]
    fn incremented(&self) -> Self {
        let mut bytes = self.0;
        for b in bytes.iter_mut().rev() {
            let (v, overflow) = b.overflowing_add(1);
            *b = v;
            if !overflow {
                break;
            }
        }
        EventId(bytes)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Error parsing the 32-hex-digit text form of an [`EventId`].
#[derive(Debug, thiserror::Error)]
#[error("invalid event id: expected 32 hex digits")]
pub struct ParseEventIdError;

impl FromStr for EventId {
    type Err = ParseEventIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 32 {
            return Err(ParseEventIdError);
        }
        let mut bytes = [0u8; 16];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hex = std::str::from_utf8(chunk).map_err(|_| ParseEventIdError)?;
            bytes[i] = u8::from_str_radix(hex, 16).map_err(|_| ParseEventIdError)?;
        }
        Ok(EventId(bytes))
    }
}

impl Serialize for EventId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EventId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Process-wide monotonic generator for [`EventId`]s.
///
/// Thread safe; the fast path is a short critical section comparing the
/// candidate against the last identifier handed out.
#[derive(Debug, Default)]
pub struct IdGenerator {
    last: Mutex<EventId>,
}

impl IdGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Draws a fresh identifier, strictly greater than every identifier
    /// previously drawn from this generator.
    pub fn generate(&self) -> EventId {
        let candidate = Self::draw();
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let id = if candidate > *last {
            candidate
        } else {
            last.incremented()
        };
        *last = id;
        id
    }

    fn draw() -> EventId {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let mut bytes = [0u8; 16];
        bytes[0..6].copy_from_slice(&now_ms.to_be_bytes()[2..8]);
        rand::thread_rng().fill_bytes(&mut bytes[6..16]);
        EventId(bytes)
    }
}
