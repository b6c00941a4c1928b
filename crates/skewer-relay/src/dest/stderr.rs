//! Stderr destination: events rendered one per line.

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, Stderr};

use crate::bus::FatalSignal;
use crate::dest::{DestFeedback, Destination, EventEncoder};
use crate::store::StoredEvent;

pub struct StderrDestination {
    writer: Stderr,
    encoder: EventEncoder,
    feedback: DestFeedback,
    fatal: FatalSignal,
}

impl StderrDestination {
    #[must_use]
    pub fn new(encoder: EventEncoder, feedback: DestFeedback, fatal: FatalSignal) -> Self {
        StderrDestination {
            writer: tokio::io::stderr(),
            encoder,
            feedback,
            fatal,
        }
    }
}

#[async_trait]
impl Destination for StderrDestination {
    async fn send(&mut self, stored: StoredEvent) {
        let line = match self.encoder.encode(&stored) {
            Ok(line) => line,
            Err(_) => {
                self.feedback.perm_error(stored.uid);
                return;
            }
        };
        match self.writer.write_all(&line).await {
            Ok(()) => self.feedback.ack(stored.uid),
            Err(_) => {
                self.feedback.nack(stored.uid);
                self.fatal.raise();
            }
        }
    }

    fn fatal(&self) -> FatalSignal {
        self.fatal.clone()
    }

    async fn close(&mut self) {
        let _ = self.writer.flush().await;
    }
}
