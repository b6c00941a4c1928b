//! Ingestion: listeners, the raw-record ring and the parser pool.
//!
//! Connection readers do no parsing. They frame records off the socket
//! and push [`RawRecord`]s onto a bounded ring shared by a pool of
//! parser workers sized to the hardware. A full ring blocks the reader
//! (backpressure) instead of dropping records. Workers parse, consult
//! the listener's filter host, and stash the resulting events through
//! the [`Stasher`] seam.
//!
//! Shutdown order: listeners stop accepting, readers drain and drop
//! their ring senders, the ring closes, workers drain it and exit.

pub mod tcp;
pub mod udp;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use skewer_model::{ConfigId, Encoding, Format, IdGenerator};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ListenerConfig;
use crate::filter::FilterHost;
use crate::store::{StoreError, StoreHandle, StoredEvent};

/// An unparsed record with its origin metadata.
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub data: Bytes,
    pub client: String,
    pub local_port: u16,
    pub unix_socket_path: Option<PathBuf>,
    pub encoding: Encoding,
    pub format: Format,
    pub dont_parse_sd: bool,
    pub config_id: ConfigId,
}

/// Where a listener ended up listening; useful with ephemeral ports.
#[derive(Debug, Clone)]
pub struct ListenerInfo {
    pub protocol: &'static str,
    pub bind_addr: Option<SocketAddr>,
    pub unix_socket_path: Option<PathBuf>,
}

/// Counters of the ingestion path.
#[derive(Debug, Default)]
pub struct IngressCounters {
    pub connections: AtomicU64,
    pub incoming: AtomicU64,
    pub parse_errors: AtomicU64,
    pub framing_errors: AtomicU64,
    pub filtered: AtomicU64,
    pub invalid_topic: AtomicU64,
}

impl IngressCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Producer half of the raw-record ring. Cloned into every reader.
#[derive(Debug, Clone)]
pub struct RawRing {
    tx: mpsc::Sender<RawRecord>,
}

impl RawRing {
    /// Enqueues one record, waiting while the ring is full. Errors only
    /// when the ring has been disposed.
    pub async fn put(&self, record: RawRecord) -> Result<(), RingClosed> {
        self.tx.send(record).await.map_err(|_| RingClosed)
    }
}

/// Consumer half, shared by the parser workers.
#[derive(Debug, Clone)]
pub struct RawRingConsumer {
    rx: Arc<Mutex<mpsc::Receiver<RawRecord>>>,
}

impl RawRingConsumer {
    /// Next record, or `None` once the ring is disposed and drained.
    pub async fn get(&self) -> Option<RawRecord> {
        self.rx.lock().await.recv().await
    }
}

#[derive(Debug, thiserror::Error)]
#[error("raw-record ring is disposed")]
pub struct RingClosed;

/// Builds the bounded ring connecting readers to parser workers.
#[must_use]
pub fn raw_ring(capacity: usize) -> (RawRing, RawRingConsumer) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        RawRing { tx },
        RawRingConsumer {
            rx: Arc::new(Mutex::new(rx)),
        },
    )
}

/// The seam between parser workers and the store.
#[async_trait]
pub trait Stasher: Send + Sync + 'static {
    async fn stash(&self, stored: StoredEvent) -> Result<(), StoreError>;
}

#[async_trait]
impl Stasher for StoreHandle {
    async fn stash(&self, stored: StoredEvent) -> Result<(), StoreError> {
        StoreHandle::stash(self, stored).await
    }
}

/// Number of parser workers: one per hardware thread.
#[must_use]
pub fn default_workers() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get())
}

/// Spawns the parser pool. Workers exit when the ring is disposed or
/// the stasher refuses further events.
pub fn spawn_parsers<S: Stasher>(
    consumer: RawRingConsumer,
    stasher: Arc<S>,
    filter: Arc<dyn FilterHost>,
    generator: Arc<IdGenerator>,
    counters: Arc<IngressCounters>,
    workers: usize,
) -> Vec<JoinHandle<()>> {
    (0..workers.max(1))
        .map(|worker| {
            let consumer = consumer.clone();
            let stasher = Arc::clone(&stasher);
            let filter = Arc::clone(&filter);
            let generator = Arc::clone(&generator);
            let counters = Arc::clone(&counters);
            tokio::spawn(async move {
                while let Some(raw) = consumer.get().await {
                    if let Err(err) =
                        parse_one(&raw, &*stasher, &*filter, &generator, &counters).await
                    {
                        info!(worker, error = %err, "stashing stopped, parser exiting");
                        break;
                    }
                }
                debug!(worker, "parser worker ended");
            })
        })
        .collect()
}

async fn parse_one<S: Stasher + ?Sized>(
    raw: &RawRecord,
    stasher: &S,
    filter: &dyn FilterHost,
    generator: &IdGenerator,
    counters: &IngressCounters,
) -> Result<(), StoreError> {
    let event = match skewer_model::parse(&raw.data, raw.encoding, raw.format, raw.dont_parse_sd)
    {
        Ok(event) => event,
        Err(err) => {
            IngressCounters::bump(&counters.parse_errors);
            info!(client = %raw.client, format = ?raw.format, error = %err, "parsing error");
            return Ok(());
        }
    };
    if event.is_empty() {
        return Ok(());
    }
    let Some(event) = filter.filter(&event) else {
        IngressCounters::bump(&counters.filtered);
        return Ok(());
    };
    // an illegal topic name can never become deliverable
    if filter.checked_topic(&event).is_none() {
        IngressCounters::bump(&counters.invalid_topic);
        warn!(client = %raw.client, "dropping event with an invalid topic name");
        return Ok(());
    }
    stasher
        .stash(StoredEvent {
            uid: generator.generate(),
            config_id: raw.config_id,
            event,
        })
        .await
}

/// Raw-record constructor shared by the listener implementations.
fn record_from(config: &ListenerConfig, data: Bytes, client: String, local_port: u16)
    -> RawRecord
{
    RawRecord {
        data,
        client,
        local_port,
        unix_socket_path: config.unix_socket_path.clone(),
        encoding: config.encoding,
        format: config.format,
        dont_parse_sd: config.dont_parse_sd,
        config_id: config.config_id,
    }
}

/// Logs and counts a fatal connection-level framing error.
pub(crate) fn note_framing_error(
    counters: &IngressCounters,
    client: &str,
    err: &crate::framing::FramingError,
) {
    IngressCounters::bump(&counters.framing_errors);
    warn!(client = %client, error = %err, "framing error, closing connection");
}

/// A read timeout of zero disables the deadline.
#[must_use]
pub(crate) fn effective_deadline(timeout: std::time::Duration) -> std::time::Duration {
    if timeout.is_zero() {
        // ten years, forever for our purposes
        std::time::Duration::from_secs(10 * 365 * 24 * 3600)
    } else {
        timeout
    }
}
