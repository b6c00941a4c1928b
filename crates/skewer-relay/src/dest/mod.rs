//! Destinations: the adapter contract and the per-destination runner.
//!
//! A runner owns one destination. It parks on the store's ready
//! condition, pulls batches of events, hands them to the adapter, and
//! feeds the adapter's asynchronous ACK/NACK/PermError completions back
//! into the store. A failed destination only stalls itself; other
//! destinations share nothing but the storage engine.
//!
//! Non-retryable failures (HTTP 4xx, encoding errors, invalid topic
//! names) must be reported as PermError; everything else is a NACK and
//! will be retried after the retry delay.

pub mod file;
pub mod http;
pub mod net;
pub mod stderr;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use skewer_model::{rfc5424, EventId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::FatalSignal;
use crate::config::DestinationKind;
use crate::store::{DeliveryOutcome, MessageStore, StoredEvent};

/// How an adapter renders events onto its wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventEncoder {
    /// One RFC 5424 line per event.
    #[default]
    Rfc5424,
    /// One JSON document per line.
    Json,
}

impl EventEncoder {
    /// Rendered event including the trailing newline.
    pub fn encode(self, stored: &StoredEvent) -> Result<Vec<u8>, serde_json::Error> {
        let mut out = match self {
            EventEncoder::Rfc5424 => rfc5424::serialize(&stored.event).into_bytes(),
            EventEncoder::Json => serde_json::to_vec(&stored.event)?,
        };
        out.push(b'\n');
        Ok(out)
    }
}

/// Handle an adapter uses to report per-event completions.
#[derive(Debug, Clone)]
pub struct DestFeedback {
    tx: mpsc::UnboundedSender<(EventId, DeliveryOutcome)>,
}

impl DestFeedback {
    pub fn ack(&self, uid: EventId) {
        let _ = self.tx.send((uid, DeliveryOutcome::Acked));
    }

    pub fn nack(&self, uid: EventId) {
        let _ = self.tx.send((uid, DeliveryOutcome::Failed));
    }

    pub fn perm_error(&self, uid: EventId) {
        let _ = self.tx.send((uid, DeliveryOutcome::PermError));
    }
}

pub type FeedbackRx = mpsc::UnboundedReceiver<(EventId, DeliveryOutcome)>;

/// Creates the completion channel connecting an adapter to its runner.
#[must_use]
pub fn feedback_channel() -> (DestFeedback, FeedbackRx) {
    let (tx, rx) = mpsc::unbounded_channel();
    (DestFeedback { tx }, rx)
}

/// A destination adapter.
///
/// `send` never blocks delivery on confirmation: outcomes flow through
/// the [`DestFeedback`] handle the adapter was built with, in any
/// order. Raising the fatal signal tells the runner the adapter cannot
/// continue (the supervisor may then rebind or shut down).
#[async_trait]
pub trait Destination: Send {
    async fn send(&mut self, stored: StoredEvent);

    /// The adapter's closed-once failure condition.
    fn fatal(&self) -> FatalSignal;

    async fn close(&mut self) {}
}

/// Groups drained completions and applies them to the store.
fn apply_completions(
    store: &MessageStore,
    kind: DestinationKind,
    completions: &mut Vec<(EventId, DeliveryOutcome)>,
) {
    if completions.is_empty() {
        return;
    }
    let mut acks = Vec::new();
    let mut nacks = Vec::new();
    let mut perms = Vec::new();
    for (uid, outcome) in completions.drain(..) {
        match outcome {
            DeliveryOutcome::Acked => acks.push(uid),
            DeliveryOutcome::Failed => nacks.push(uid),
            DeliveryOutcome::PermError => perms.push(uid),
        }
    }
    if let Err(err) = store.ack(&acks, kind) {
        warn!(dest = kind.name(), error = %err, "ack batch failed");
    }
    if let Err(err) = store.nack(&nacks, kind) {
        warn!(dest = kind.name(), error = %err, "nack batch failed");
    }
    if let Err(err) = store.perm_error(&perms, kind) {
        warn!(dest = kind.name(), error = %err, "permerror batch failed");
    }
}

fn drain_feedback(rx: &mut FeedbackRx, into: &mut Vec<(EventId, DeliveryOutcome)>) {
    while let Ok(completion) = rx.try_recv() {
        into.push(completion);
    }
}

/// Spawns the delivery loop for one destination.
pub fn spawn_runner(
    store: Arc<MessageStore>,
    kind: DestinationKind,
    mut adapter: Box<dyn Destination>,
    mut feedback_rx: FeedbackRx,
    batch_size: usize,
    rebind_period: Option<Duration>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    if let Some(period) = rebind_period {
        let fatal = adapter.fatal();
        let token = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(period) => {
                    info!(dest = kind.name(), "rebind period expired");
                    fatal.raise();
                }
                () = token.cancelled() => {}
            }
        });
    }

    tokio::spawn(async move {
        let notify = store.ready_notify(kind);
        let fatal = adapter.fatal();
        let mut completions: Vec<(EventId, DeliveryOutcome)> = Vec::new();
        loop {
            drain_feedback(&mut feedback_rx, &mut completions);
            apply_completions(&store, kind, &mut completions);
            if shutdown.is_cancelled() || fatal.is_raised() {
                break;
            }

            let ready = match store.retrieve(batch_size, kind) {
                Ok(ready) => ready,
                Err(err) => {
                    warn!(dest = kind.name(), error = %err, "retrieve failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };
            if ready.is_empty() {
                tokio::select! {
                    () = notify.notified() => {}
                    completion = feedback_rx.recv() => {
                        if let Some(completion) = completion {
                            completions.push(completion);
                        }
                    }
                    () = fatal.raised() => break,
                    () = shutdown.cancelled() => break,
                }
                continue;
            }
            for stored in ready {
                adapter.send(stored).await;
            }
        }

        // apply whatever the adapter managed to confirm before exiting
        drain_feedback(&mut feedback_rx, &mut completions);
        apply_completions(&store, kind, &mut completions);
        adapter.close().await;
        debug!(dest = kind.name(), "destination runner ended");
    })
}
