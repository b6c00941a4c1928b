//! HTTP destination: one JSON POST per event.
//!
//! Status mapping follows the retryability contract: 2xx is an ACK,
//! any 4xx is a permanent error (the event would never become
//! acceptable), 5xx and transport errors are NACKs and will be
//! retried.

use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::bus::FatalSignal;
use crate::dest::{DestFeedback, Destination};
use crate::store::StoredEvent;

pub struct HttpDestination {
    client: reqwest::Client,
    url: String,
    feedback: DestFeedback,
    fatal: FatalSignal,
}

impl HttpDestination {
    pub fn new(
        url: impl Into<String>,
        timeout: Duration,
        feedback: DestFeedback,
        fatal: FatalSignal,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(HttpDestination {
            client,
            url: url.into(),
            feedback,
            fatal,
        })
    }
}

#[async_trait]
impl Destination for HttpDestination {
    async fn send(&mut self, stored: StoredEvent) {
        let response = self
            .client
            .post(&self.url)
            .json(&stored.event)
            .send()
            .await;
        match response {
            Ok(response) if response.status().is_success() => self.feedback.ack(stored.uid),
            Ok(response) if response.status().is_client_error() => {
                warn!(url = %self.url, status = %response.status(), "http destination rejected event");
                self.feedback.perm_error(stored.uid);
            }
            Ok(response) => {
                warn!(url = %self.url, status = %response.status(), "http destination error");
                self.feedback.nack(stored.uid);
            }
            Err(err) => {
                warn!(url = %self.url, error = %err, "http destination unreachable");
                self.feedback.nack(stored.uid);
            }
        }
    }

    fn fatal(&self) -> FatalSignal {
        self.fatal.clone()
    }
}
