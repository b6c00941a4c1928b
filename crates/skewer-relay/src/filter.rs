//! The scripted-filter seam.
//!
//! Per-listener user functions over events live in an external host
//! (JavaScript, WASM, whatever the embedder provides). The core only
//! depends on this trait: a filter that may drop or rewrite an event,
//! plus the topic and partition-key derivations used by partitioned
//! destinations. Topic names that fail Kafka's naming rules are a
//! permanent error, so they are validated here rather than at send
//! time.

use skewer_model::{event::topic_name_is_valid, Event};

/// Host for per-listener event filters.
pub trait FilterHost: Send + Sync {
    /// Returns the (possibly rewritten) event, or `None` to drop it.
    fn filter(&self, event: &Event) -> Option<Event>;

    /// Topic for partitioned destinations.
    fn topic(&self, event: &Event) -> String;

    /// Partition key for partitioned destinations.
    fn partition_key(&self, event: &Event) -> String;

    /// Validated topic; `None` when the derived name is illegal.
    fn checked_topic(&self, event: &Event) -> Option<String> {
        let topic = self.topic(event);
        topic_name_is_valid(&topic).then_some(topic)
    }
}

/// Pass-through host used when a listener has no filter configured.
#[derive(Debug, Clone, Default)]
pub struct NoopFilter {
    pub default_topic: String,
}

impl NoopFilter {
    #[must_use]
    pub fn new() -> Self {
        NoopFilter {
            default_topic: "syslog".to_string(),
        }
    }
}

impl FilterHost for NoopFilter {
    fn filter(&self, event: &Event) -> Option<Event> {
        Some(event.clone())
    }

    fn topic(&self, _event: &Event) -> String {
        self.default_topic.clone()
    }

    fn partition_key(&self, event: &Event) -> String {
        event.hostname.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_filter_passes_events_through() {
        let host = NoopFilter::new();
        let event = Event {
            hostname: "web01".to_string(),
            message: "hi".to_string(),
            ..Event::default()
        };
        assert_eq!(host.filter(&event).unwrap(), event);
        assert_eq!(host.checked_topic(&event).unwrap(), "syslog");
        assert_eq!(host.partition_key(&event), "web01");
    }

    #[test]
    fn test_checked_topic_rejects_bad_names() {
        let host = NoopFilter {
            default_topic: "not a topic".to_string(),
        };
        assert!(host.checked_topic(&Event::default()).is_none());
    }
}
