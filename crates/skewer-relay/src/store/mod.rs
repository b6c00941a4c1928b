//! The persistent message store.
//!
//! A crash-safe multi-queue over sled. Every stashed event gets one
//! shared body row plus an independent lifecycle per enabled
//! destination: `Ready -> Sent -> {Acked (deleted), Failed, PermError}`,
//! with Failed entries promoted back to Ready after the retry delay.
//!
//! All mutations run inside a single sled transaction spanning every
//! touched partition, so readers never observe partial state; sled
//! re-runs the closure on conflict. Scans happen outside transactions
//! (sled transactions cannot iterate) and every scanned key is
//! re-checked inside the transaction before it is moved, which keeps
//! the one-live-state-per-destination invariant even when scan and move
//! race.

mod crypto;
mod partition;

pub use crypto::{BodyCipher, CryptoError};
pub use partition::{config_key, Partition, QueueKind};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sled::transaction::{
    ConflictableTransactionResult, TransactionError, TransactionalTree,
};
use skewer_model::{ConfigId, Event, EventId};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::FatalSignal;
use crate::config::{Config, DestinationKind};

/// Ready markers are this literal token.
const READY_TOKEN: &[u8] = b"true";
/// Batch bound for draining the stash queue and for retry promotion.
const INGEST_BATCH: usize = 1000;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage engine error: {0}")]
    Engine(#[from] sled::Error),
    #[error("event serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("body encryption error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("store is shutting down")]
    Closed,
}

fn txn_error(err: TransactionError<()>) -> StoreError {
    match err {
        TransactionError::Storage(e) => StoreError::Engine(e),
        // our closures never abort
        TransactionError::Abort(()) => StoreError::Closed,
    }
}

/// An event together with its identity and originating config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub uid: EventId,
    pub config_id: ConfigId,
    pub event: Event,
}

/// Delivery outcome reported back by a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acked,
    Failed,
    PermError,
}

/// Completion notification for a watched event.
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    pub uid: EventId,
    pub outcome: DeliveryOutcome,
}

pub type CompletionTx = mpsc::UnboundedSender<Completion>;

/// Persisted snapshot of the listener sub-config that produced an
/// event, so stored events can be reinterpreted after a config change.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ListenerSnapshot {
    pub format: String,
    pub encoding: String,
    pub dont_parse_sd: bool,
    pub topic_template: String,
    pub partition_key_template: String,
}

/// In-memory mirror of partition sizes, rebuilt at startup.
#[derive(Debug)]
pub struct Gauges {
    counts: HashMap<(QueueKind, Option<DestinationKind>), AtomicU64>,
    configs: AtomicU64,
}

impl Gauges {
    fn new() -> Self {
        let mut counts = HashMap::new();
        counts.insert((QueueKind::Messages, None), AtomicU64::new(0));
        for queue in QueueKind::LIFECYCLE {
            for dest in DestinationKind::ALL {
                counts.insert((queue, Some(dest)), AtomicU64::new(0));
            }
        }
        Gauges {
            counts,
            configs: AtomicU64::new(0),
        }
    }

    fn cell(&self, queue: QueueKind, dest: Option<DestinationKind>) -> &AtomicU64 {
        &self.counts[&(queue, dest)]
    }

    fn set(&self, queue: QueueKind, dest: Option<DestinationKind>, value: u64) {
        self.cell(queue, dest).store(value, Ordering::Relaxed);
    }

    fn add(&self, queue: QueueKind, dest: Option<DestinationKind>, n: u64) {
        self.cell(queue, dest).fetch_add(n, Ordering::Relaxed);
    }

    fn sub(&self, queue: QueueKind, dest: Option<DestinationKind>, n: u64) {
        let cell = self.cell(queue, dest);
        let mut current = cell.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(n);
            match cell.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    #[must_use]
    pub fn get(&self, queue: QueueKind, dest: Option<DestinationKind>) -> u64 {
        self.cell(queue, dest).load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn configs(&self) -> u64 {
        self.configs.load(Ordering::Relaxed)
    }
}

/// The durable multi-queue.
pub struct MessageStore {
    db: sled::Db,
    messages: Partition,
    destinations: Vec<DestinationKind>,
    cipher: Option<BodyCipher>,
    gauges: Gauges,
    notifiers: HashMap<DestinationKind, Arc<Notify>>,
    watchers: Mutex<HashMap<EventId, CompletionTx>>,
    fatal: FatalSignal,
    retry_delay: Duration,
    fsync: bool,
}

impl std::fmt::Debug for MessageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageStore")
            .field("destinations", &self.destinations)
            .field("encrypted", &self.cipher.is_some())
            .finish_non_exhaustive()
    }
}

impl MessageStore {
    /// Opens the store and runs startup recovery: every `Sent` entry is
    /// demoted to `Ready` (in-flight deliveries never durably acked),
    /// orphaned bodies are pruned, gauges are rebuilt. Recovery runs
    /// before any runner can observe the store.
    pub fn open(config: &Config) -> Result<Arc<Self>, StoreError> {
        std::fs::create_dir_all(&config.store_dir)
            .map_err(|e| StoreError::Engine(sled::Error::Io(e)))?;
        let db = sled::Config::new().path(&config.store_dir).open()?;

        let cipher = config.secret.as_ref().map(BodyCipher::new);
        if cipher.is_some() {
            info!("message bodies are encrypted at rest");
        }

        let notifiers = DestinationKind::ALL
            .into_iter()
            .map(|dest| (dest, Arc::new(Notify::new())))
            .collect();

        let store = MessageStore {
            db,
            messages: Partition::messages(),
            destinations: config.destinations.kinds(),
            cipher,
            gauges: Gauges::new(),
            notifiers,
            watchers: Mutex::new(HashMap::new()),
            fatal: FatalSignal::new(),
            retry_delay: config.retry_delay,
            fsync: config.fsync,
        };

        debug!("resetting messages stuck in sent");
        store.reset_sent()?;
        debug!("pruning orphaned messages");
        store.prune_orphaned()?;
        debug!("rebuilding store gauges");
        store.init_gauges()?;

        Ok(Arc::new(store))
    }

    /// Fatal condition of the storage engine; the supervisor shuts the
    /// relay down when this is raised.
    #[must_use]
    pub fn fatal(&self) -> FatalSignal {
        self.fatal.clone()
    }

    #[must_use]
    pub fn destinations(&self) -> &[DestinationKind] {
        &self.destinations
    }

    #[must_use]
    pub fn gauges(&self) -> &Gauges {
        &self.gauges
    }

    /// Wake-up handle a destination runner parks on while its ready
    /// queue is empty.
    #[must_use]
    pub fn ready_notify(&self, dest: DestinationKind) -> Arc<Notify> {
        Arc::clone(&self.notifiers[&dest])
    }

    /// Registers a completion watcher for one event. The sender fires
    /// exactly once, on the first terminal-or-failed transition.
    pub fn watch(&self, uid: EventId, tx: CompletionTx) {
        self.watchers.lock().unwrap_or_else(|e| e.into_inner()).insert(uid, tx);
    }

    /// Drops the watcher of an event, if any.
    pub fn unwatch(&self, uid: EventId) {
        self.watchers.lock().unwrap_or_else(|e| e.into_inner()).remove(&uid);
    }

    fn notify_completions(&self, uids: &[EventId], outcome: DeliveryOutcome) {
        if uids.is_empty() {
            return;
        }
        let mut watchers = self.watchers.lock().unwrap_or_else(|e| e.into_inner());
        for &uid in uids {
            if let Some(tx) = watchers.remove(&uid) {
                let _ = tx.send(Completion { uid, outcome });
            }
        }
    }

    fn lifecycle(queue: QueueKind, dest: DestinationKind) -> Partition {
        Partition::lifecycle(queue, dest)
    }

    fn encode_body(&self, stored: &StoredEvent) -> Result<Vec<u8>, StoreError> {
        let plain = serde_json::to_vec(stored)?;
        match &self.cipher {
            Some(cipher) => Ok(cipher.seal(&plain)?),
            None => Ok(plain),
        }
    }

    fn decode_body(&self, raw: &[u8]) -> Result<StoredEvent, StoreError> {
        match &self.cipher {
            Some(cipher) => {
                let plain = cipher.open(raw)?;
                Ok(serde_json::from_slice(&plain)?)
            }
            None => Ok(serde_json::from_slice(raw)?),
        }
    }

    /// Raises the fatal signal for engine failures that cannot heal
    /// (disk full, corruption); plain logical errors stay local.
    fn note_engine_failure(&self, err: &StoreError) {
        if let StoreError::Engine(engine) = err {
            warn!(error = %engine, "storage engine failure");
            self.fatal.raise();
        }
    }

    fn flush_if_needed(&self) -> Result<(), StoreError> {
        if self.fsync {
            self.db.flush()?;
        }
        Ok(())
    }

    /// Runs one serializable transaction; sled re-runs the closure on
    /// conflict, so it must be free of side effects.
    fn txn<T>(
        &self,
        f: impl Fn(&TransactionalTree) -> ConflictableTransactionResult<T, ()>,
    ) -> Result<T, StoreError> {
        self.db.transaction(f).map_err(txn_error)
    }

    // -- startup recovery ---------------------------------------------------

    fn reset_sent(&self) -> Result<(), StoreError> {
        for dest in DestinationKind::ALL {
            let sent = Self::lifecycle(QueueKind::Sent, dest);
            let ready = Self::lifecycle(QueueKind::Ready, dest);
            let uids = sent.keys(&self.db)?;
            if uids.is_empty() {
                continue;
            }
            self.txn(|tx| {
                for &uid in &uids {
                    sent.remove_tx(tx, uid)?;
                    ready.insert_tx(tx, uid, READY_TOKEN)?;
                }
                Ok(())
            })?;
            info!(
                dest = dest.name(),
                count = uids.len(),
                "pushed stuck messages from sent back to ready"
            );
        }
        Ok(())
    }

    fn prune_orphaned(&self) -> Result<(), StoreError> {
        let uids = self.messages.keys(&self.db)?;
        let mut orphans = Vec::new();
        'uid: for uid in uids {
            for queue in QueueKind::LIFECYCLE {
                for dest in DestinationKind::ALL {
                    if Self::lifecycle(queue, dest).contains(&self.db, uid)? {
                        continue 'uid;
                    }
                }
            }
            orphans.push(uid);
        }
        if orphans.is_empty() {
            return Ok(());
        }
        self.txn(|tx| {
            for &uid in &orphans {
                self.messages.remove_tx(tx, uid)?;
            }
            Ok(())
        })?;
        info!(count = orphans.len(), "pruned orphaned messages");
        Ok(())
    }

    fn init_gauges(&self) -> Result<(), StoreError> {
        self.gauges
            .set(QueueKind::Messages, None, self.messages.count(&self.db)?);
        for queue in QueueKind::LIFECYCLE {
            for dest in DestinationKind::ALL {
                let count = Self::lifecycle(queue, dest).count(&self.db)?;
                self.gauges.set(queue, Some(dest), count);
            }
        }
        let configs = self.db.scan_prefix([b'c']).count() as u64;
        self.gauges.configs.store(configs, Ordering::Relaxed);
        Ok(())
    }

    // -- queue operations ---------------------------------------------------

    /// Persists a batch of events: one body row each plus a Ready
    /// marker per enabled destination, atomically. Destinations that
    /// already hold a live entry for an identifier are left untouched,
    /// so replaying a stash is a no-op for them.
    pub fn stash_batch(&self, batch: &[StoredEvent]) -> Result<usize, StoreError> {
        if batch.is_empty() {
            return Ok(0);
        }
        let mut bodies: Vec<(EventId, Vec<u8>)> = Vec::with_capacity(batch.len());
        for stored in batch {
            match self.encode_body(stored) {
                Ok(body) => bodies.push((stored.uid, body)),
                Err(err) => {
                    warn!(uid = %stored.uid, error = %err, "discarded an unserializable event");
                }
            }
        }
        if bodies.is_empty() {
            return Ok(0);
        }

        let dests = &self.destinations;
        let result = self.txn(|tx| {
            let mut new_bodies = 0u64;
            let mut new_ready: HashMap<DestinationKind, u64> = HashMap::new();
            for (uid, body) in &bodies {
                if self.messages.insert_tx(tx, *uid, body)?.is_none() {
                    new_bodies += 1;
                }
                for &dest in dests {
                    let mut live = false;
                    for queue in QueueKind::LIFECYCLE {
                        if Self::lifecycle(queue, dest).contains_tx(tx, *uid)? {
                            live = true;
                            break;
                        }
                    }
                    if !live {
                        Self::lifecycle(QueueKind::Ready, dest)
                            .insert_tx(tx, *uid, READY_TOKEN)?;
                        *new_ready.entry(dest).or_default() += 1;
                    }
                }
            }
            Ok((new_bodies, new_ready))
        });

        match result {
            Ok((new_bodies, new_ready)) => {
                self.flush_if_needed()?;
                self.gauges.add(QueueKind::Messages, None, new_bodies);
                for (&dest, &count) in &new_ready {
                    self.gauges.add(QueueKind::Ready, Some(dest), count);
                }
                for &dest in dests {
                    self.notifiers[&dest].notify_one();
                }
                Ok(bodies.len())
            }
            Err(err) => {
                self.note_engine_failure(&err);
                Err(err)
            }
        }
    }

    /// Moves up to `n` oldest Ready entries of `dest` into Sent and
    /// returns their events, oldest first. Entries whose body is
    /// missing or unreadable are evicted in the same transaction.
    pub fn retrieve(&self, n: usize, dest: DestinationKind)
        -> Result<Vec<StoredEvent>, StoreError>
    {
        let ready = Self::lifecycle(QueueKind::Ready, dest);
        let sent = Self::lifecycle(QueueKind::Sent, dest);
        let candidates: Vec<EventId> = ready
            .entries(&self.db, n)?
            .into_iter()
            .map(|(uid, _)| uid)
            .collect();
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let result = self.txn(|tx| {
            let mut out: Vec<StoredEvent> = Vec::new();
            let mut evicted: Vec<EventId> = Vec::new();
            let mut deleted_bodies = 0u64;
            for &uid in &candidates {
                // may have been taken or retried since the scan
                if !ready.contains_tx(tx, uid)? {
                    continue;
                }
                let decoded = self
                    .messages
                    .get_tx(tx, uid)?
                    .filter(|raw| !raw.is_empty())
                    .and_then(|raw| self.decode_body(&raw).ok());
                match decoded {
                    Some(stored) => {
                        ready.remove_tx(tx, uid)?;
                        sent.insert_tx(tx, uid, READY_TOKEN)?;
                        out.push(stored);
                    }
                    None => {
                        ready.remove_tx(tx, uid)?;
                        // the shared body may already be gone when another
                        // destination evicted the same uid first
                        if self.messages.remove_tx(tx, uid)?.is_some() {
                            deleted_bodies += 1;
                        }
                        evicted.push(uid);
                    }
                }
            }
            Ok((out, evicted, deleted_bodies))
        });

        match result {
            Ok((out, evicted, deleted_bodies)) => {
                if !evicted.is_empty() {
                    warn!(dest = dest.name(), count = evicted.len(), "evicted invalid entries");
                    self.gauges.sub(QueueKind::Ready, Some(dest), evicted.len() as u64);
                    self.gauges.sub(QueueKind::Messages, None, deleted_bodies);
                }
                self.gauges.sub(QueueKind::Ready, Some(dest), out.len() as u64);
                self.gauges.add(QueueKind::Sent, Some(dest), out.len() as u64);
                Ok(out)
            }
            Err(err) => {
                self.note_engine_failure(&err);
                Err(err)
            }
        }
    }

    /// Confirms delivery: removes the Sent markers and, when no
    /// destination still holds a live entry, deletes the shared body.
    /// Applying the same ack twice has no effect beyond the first.
    pub fn ack(&self, uids: &[EventId], dest: DestinationKind) -> Result<(), StoreError> {
        if uids.is_empty() {
            return Ok(());
        }
        let sent = Self::lifecycle(QueueKind::Sent, dest);
        let result = self.txn(|tx| {
            let mut acked = 0u64;
            let mut deleted_bodies = 0u64;
            for &uid in uids {
                if sent.remove_tx(tx, uid)?.is_some() {
                    acked += 1;
                }
                let mut referenced = false;
                'scan: for queue in [QueueKind::Ready, QueueKind::Sent, QueueKind::Failed] {
                    for other in DestinationKind::ALL {
                        if Self::lifecycle(queue, other).contains_tx(tx, uid)? {
                            referenced = true;
                            break 'scan;
                        }
                    }
                }
                if !referenced && self.messages.remove_tx(tx, uid)?.is_some() {
                    deleted_bodies += 1;
                }
            }
            Ok((acked, deleted_bodies))
        });

        match result {
            Ok((acked, deleted_bodies)) => {
                self.flush_if_needed()?;
                self.gauges.sub(QueueKind::Sent, Some(dest), acked);
                self.gauges.sub(QueueKind::Messages, None, deleted_bodies);
                self.notify_completions(uids, DeliveryOutcome::Acked);
                Ok(())
            }
            Err(err) => {
                self.note_engine_failure(&err);
                Err(err)
            }
        }
    }

    /// Records a retryable delivery failure: Sent -> Failed with the
    /// current timestamp.
    pub fn nack(&self, uids: &[EventId], dest: DestinationKind) -> Result<(), StoreError> {
        self.fail_with(uids, dest, QueueKind::Failed, DeliveryOutcome::Failed)
    }

    /// Records a permanent failure: Sent -> PermErrors; never retried.
    pub fn perm_error(&self, uids: &[EventId], dest: DestinationKind) -> Result<(), StoreError> {
        self.fail_with(uids, dest, QueueKind::PermErrors, DeliveryOutcome::PermError)
    }

    fn fail_with(
        &self,
        uids: &[EventId],
        dest: DestinationKind,
        target: QueueKind,
        outcome: DeliveryOutcome,
    ) -> Result<(), StoreError> {
        if uids.is_empty() {
            return Ok(());
        }
        let sent = Self::lifecycle(QueueKind::Sent, dest);
        let queue = Self::lifecycle(target, dest);
        let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true);
        let result = self.txn(|tx| {
            let mut moved = 0u64;
            for &uid in uids {
                if sent.remove_tx(tx, uid)?.is_some() {
                    queue.insert_tx(tx, uid, stamp.as_bytes())?;
                    moved += 1;
                }
            }
            Ok(moved)
        });

        match result {
            Ok(moved) => {
                self.flush_if_needed()?;
                self.gauges.sub(QueueKind::Sent, Some(dest), moved);
                self.gauges.add(target, Some(dest), moved);
                self.notify_completions(uids, outcome);
                Ok(())
            }
            Err(err) => {
                self.note_engine_failure(&err);
                Err(err)
            }
        }
    }

    /// One retry-scheduler pass for `dest`: Failed entries whose stamp
    /// is older than the retry delay move back to Ready; entries with
    /// an unreadable stamp are evicted. Returns the number promoted.
    pub fn promote_failed(&self, dest: DestinationKind) -> Result<usize, StoreError> {
        let failed = Self::lifecycle(QueueKind::Failed, dest);
        let ready = Self::lifecycle(QueueKind::Ready, dest);
        let now = Utc::now();

        let entries = failed.entries(&self.db, usize::MAX)?;
        let mut aged = Vec::new();
        let mut invalid = Vec::new();
        for (uid, stamp) in entries {
            match std::str::from_utf8(&stamp)
                .ok()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            {
                Some(t) if now.signed_duration_since(t.with_timezone(&Utc))
                    >= chrono::Duration::from_std(self.retry_delay).unwrap_or_default() =>
                {
                    aged.push(uid);
                }
                Some(_) => {}
                None => {
                    warn!(uid = %uid, "invalid timestamp in failed entry");
                    invalid.push(uid);
                }
            }
        }
        if aged.is_empty() && invalid.is_empty() {
            return Ok(0);
        }

        let mut promoted_total = 0usize;
        for chunk in aged.chunks(INGEST_BATCH) {
            let promoted = self.txn(|tx| {
                let mut promoted = 0u64;
                for &uid in chunk {
                    if failed.remove_tx(tx, uid)?.is_some() {
                        ready.insert_tx(tx, uid, READY_TOKEN)?;
                        promoted += 1;
                    }
                }
                Ok(promoted)
            })?;
            self.gauges.sub(QueueKind::Failed, Some(dest), promoted);
            self.gauges.add(QueueKind::Ready, Some(dest), promoted);
            promoted_total += promoted as usize;
        }
        if !invalid.is_empty() {
            let removed = self.txn(|tx| {
                let mut removed = 0u64;
                for &uid in &invalid {
                    if failed.remove_tx(tx, uid)?.is_some() {
                        removed += 1;
                    }
                }
                Ok(removed)
            })?;
            self.gauges.sub(QueueKind::Failed, Some(dest), removed);
        }
        if promoted_total > 0 {
            debug!(dest = dest.name(), count = promoted_total, "promoted failed entries");
            self.notifiers[&dest].notify_one();
        }
        Ok(promoted_total)
    }

    // -- listener configs ---------------------------------------------------

    /// Idempotently persists a listener sub-config.
    pub fn store_syslog_config(
        &self,
        id: ConfigId,
        snapshot: &ListenerSnapshot,
    ) -> Result<(), StoreError> {
        let key = config_key(id);
        if self.db.get(key)?.is_some() {
            return Ok(());
        }
        let body = serde_json::to_vec(snapshot)?;
        self.db.insert(key, body)?;
        self.gauges.configs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Looks a persisted listener sub-config back up.
    pub fn syslog_config(&self, id: ConfigId) -> Result<Option<ListenerSnapshot>, StoreError> {
        match self.db.get(config_key(id))? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    // -- introspection ------------------------------------------------------

    /// On-disk entry count of one lifecycle partition.
    pub fn queue_count(&self, queue: QueueKind, dest: DestinationKind) -> Result<u64, StoreError> {
        Ok(Self::lifecycle(queue, dest).count(&self.db)?)
    }

    /// On-disk count of stored bodies.
    pub fn messages_count(&self) -> Result<u64, StoreError> {
        Ok(self.messages.count(&self.db)?)
    }

    /// Seeds a raw body row with no lifecycle entries. Test hook for
    /// exercising orphan pruning.
    #[doc(hidden)]
    pub fn seed_orphan_body(&self, uid: EventId, body: &[u8]) -> Result<(), StoreError> {
        self.db.insert(self.messages.key(uid), body)?;
        Ok(())
    }
}

/// Cloneable ingest handle; senders block when the stash queue is full.
#[derive(Debug, Clone)]
pub struct StoreHandle {
    tx: mpsc::Sender<StoredEvent>,
    store: Arc<MessageStore>,
}

impl StoreHandle {
    /// Enqueues one event for durable ingestion.
    pub async fn stash(&self, stored: StoredEvent) -> Result<(), StoreError> {
        self.tx.send(stored).await.map_err(|_| StoreError::Closed)
    }

    #[must_use]
    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }
}

impl MessageStore {
    /// Spawns the store's background tasks (stash-queue drain, retry
    /// ticker, shutdown wake-ups) and returns the ingest handle.
    pub fn start(
        store: &Arc<Self>,
        shutdown: &CancellationToken,
        queue_size: usize,
    ) -> StoreHandle {
        let (tx, mut rx) = mpsc::channel::<StoredEvent>(queue_size.max(1));

        let this = Arc::clone(store);
        let token = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let mut batch = Vec::with_capacity(INGEST_BATCH);
                tokio::select! {
                    n = rx.recv_many(&mut batch, INGEST_BATCH) => {
                        if n == 0 {
                            break;
                        }
                        if let Err(err) = this.stash_batch(&batch) {
                            warn!(error = %err, "ingestion error");
                        }
                    }
                    () = token.cancelled() => break,
                }
            }
            debug!("store ingest task ended");
        });

        let this = Arc::clone(store);
        let token = shutdown.clone();
        tokio::spawn(async move {
            let period = this.retry_delay.max(Duration::from_millis(50));
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for &dest in &this.destinations {
                            if let Err(err) = this.promote_failed(dest) {
                                warn!(dest = dest.name(), error = %err, "retry promotion error");
                            }
                        }
                    }
                    () = token.cancelled() => break,
                }
            }
            debug!("store retry task ended");
        });

        let this = Arc::clone(store);
        let token = shutdown.clone();
        tokio::spawn(async move {
            token.cancelled().await;
            for notify in this.notifiers.values() {
                notify.notify_waiters();
                notify.notify_one();
            }
        });

        StoreHandle {
            tx,
            store: Arc::clone(store),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DestinationMask;
    use skewer_model::IdGenerator;

    fn test_config(dir: &tempfile::TempDir, dests: &[DestinationKind]) -> Config {
        Config {
            store_dir: dir.path().to_path_buf(),
            destinations: DestinationMask::of(dests),
            retry_delay: Duration::from_millis(100),
            ..Config::default()
        }
    }

    fn stored(gen: &IdGenerator, message: &str) -> StoredEvent {
        StoredEvent {
            uid: gen.generate(),
            config_id: ConfigId::new_v4(),
            event: Event {
                message: message.to_string(),
                ..Event::default()
            },
        }
    }

    #[test]
    fn test_stash_then_retrieve_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            MessageStore::open(&test_config(&dir, &[DestinationKind::Stderr])).unwrap();
        let gen = IdGenerator::new();
        let batch: Vec<_> = (0..5).map(|i| stored(&gen, &format!("m{i}"))).collect();
        assert_eq!(store.stash_batch(&batch).unwrap(), 5);

        let got = store.retrieve(10, DestinationKind::Stderr).unwrap();
        assert_eq!(got.len(), 5);
        let mut uids: Vec<_> = got.iter().map(|s| s.uid).collect();
        let sorted = {
            let mut v = uids.clone();
            v.sort();
            v
        };
        assert_eq!(uids, sorted, "retrieval must be oldest-first");
        uids.dedup();
        assert_eq!(uids.len(), 5);
        assert_eq!(
            store.queue_count(QueueKind::Sent, DestinationKind::Stderr).unwrap(),
            5
        );
        assert_eq!(
            store.queue_count(QueueKind::Ready, DestinationKind::Stderr).unwrap(),
            0
        );
    }

    #[test]
    fn test_ack_removes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            MessageStore::open(&test_config(&dir, &[DestinationKind::Stderr])).unwrap();
        let gen = IdGenerator::new();
        store.stash_batch(&[stored(&gen, "x")]).unwrap();
        let got = store.retrieve(1, DestinationKind::Stderr).unwrap();
        store.ack(&[got[0].uid], DestinationKind::Stderr).unwrap();
        assert_eq!(store.messages_count().unwrap(), 0);
        assert_eq!(
            store.queue_count(QueueKind::Sent, DestinationKind::Stderr).unwrap(),
            0
        );
        // idempotent
        store.ack(&[got[0].uid], DestinationKind::Stderr).unwrap();
        assert_eq!(store.messages_count().unwrap(), 0);
    }

    #[test]
    fn test_body_retained_until_all_destinations_done() {
        let dir = tempfile::tempdir().unwrap();
        let dests = [DestinationKind::Stderr, DestinationKind::File];
        let store = MessageStore::open(&test_config(&dir, &dests)).unwrap();
        let gen = IdGenerator::new();
        store.stash_batch(&[stored(&gen, "x")]).unwrap();

        let got = store.retrieve(1, DestinationKind::Stderr).unwrap();
        let uid = got[0].uid;
        store.ack(&[uid], DestinationKind::Stderr).unwrap();
        // file still holds a ready entry, the body must survive
        assert_eq!(store.messages_count().unwrap(), 1);

        let got = store.retrieve(1, DestinationKind::File).unwrap();
        assert_eq!(got[0].uid, uid);
        store.ack(&[uid], DestinationKind::File).unwrap();
        assert_eq!(store.messages_count().unwrap(), 0);
    }

    #[test]
    fn test_restash_is_noop_for_live_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            MessageStore::open(&test_config(&dir, &[DestinationKind::Stderr])).unwrap();
        let gen = IdGenerator::new();
        let event = stored(&gen, "x");
        store.stash_batch(&[event.clone()]).unwrap();
        let got = store.retrieve(1, DestinationKind::Stderr).unwrap();
        assert_eq!(got.len(), 1);

        // replaying while the entry sits in Sent must not resurrect Ready
        store.stash_batch(&[event]).unwrap();
        assert_eq!(
            store.queue_count(QueueKind::Ready, DestinationKind::Stderr).unwrap(),
            0
        );
        assert_eq!(
            store.queue_count(QueueKind::Sent, DestinationKind::Stderr).unwrap(),
            1
        );
    }

    #[test]
    fn test_nack_then_promote_after_delay() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir, &[DestinationKind::Stderr]);
        config.retry_delay = Duration::from_millis(50);
        let store = MessageStore::open(&config).unwrap();
        let gen = IdGenerator::new();
        store.stash_batch(&[stored(&gen, "x")]).unwrap();
        let got = store.retrieve(1, DestinationKind::Stderr).unwrap();
        let uid = got[0].uid;
        store.nack(&[uid], DestinationKind::Stderr).unwrap();

        // too young to retry
        assert_eq!(store.promote_failed(DestinationKind::Stderr).unwrap(), 0);
        assert!(store.retrieve(1, DestinationKind::Stderr).unwrap().is_empty());

        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(store.promote_failed(DestinationKind::Stderr).unwrap(), 1);
        let got = store.retrieve(1, DestinationKind::Stderr).unwrap();
        assert_eq!(got[0].uid, uid);
    }

    #[test]
    fn test_perm_error_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            MessageStore::open(&test_config(&dir, &[DestinationKind::Stderr])).unwrap();
        let gen = IdGenerator::new();
        store.stash_batch(&[stored(&gen, "x")]).unwrap();
        let got = store.retrieve(1, DestinationKind::Stderr).unwrap();
        store.perm_error(&[got[0].uid], DestinationKind::Stderr).unwrap();

        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(store.promote_failed(DestinationKind::Stderr).unwrap(), 0);
        assert!(store.retrieve(1, DestinationKind::Stderr).unwrap().is_empty());
        assert_eq!(
            store
                .queue_count(QueueKind::PermErrors, DestinationKind::Stderr)
                .unwrap(),
            1
        );
    }

    #[test]
    fn test_shared_body_evicted_by_two_destinations_counts_once() {
        let dir = tempfile::tempdir().unwrap();
        let dests = [DestinationKind::Stderr, DestinationKind::File];
        let store = MessageStore::open(&test_config(&dir, &dests)).unwrap();
        let gen = IdGenerator::new();
        let good = stored(&gen, "good");
        let bad = stored(&gen, "bad");
        store.stash_batch(&[good.clone(), bad.clone()]).unwrap();
        // corrupt one body; both destinations will discover it
        store.db.insert(store.messages.key(bad.uid), &b"not json"[..]).unwrap();
        assert_eq!(store.gauges().get(QueueKind::Messages, None), 2);

        let first = store.retrieve(10, DestinationKind::Stderr).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].uid, good.uid);
        assert_eq!(store.gauges().get(QueueKind::Messages, None), 1);

        // the second destination evicts its own ready marker, but the
        // body deletion already happened and must not be counted again
        let second = store.retrieve(10, DestinationKind::File).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].uid, good.uid);
        assert_eq!(store.messages_count().unwrap(), 1);
        assert_eq!(store.gauges().get(QueueKind::Messages, None), 1);
    }

    #[test]
    fn test_encrypted_bodies_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir, &[DestinationKind::Stderr]);
        config.secret = Some([9u8; 32]);
        let store = MessageStore::open(&config).unwrap();
        let gen = IdGenerator::new();
        let event = stored(&gen, "secret payload");
        store.stash_batch(&[event.clone()]).unwrap();

        // raw on-disk value must not contain the plaintext
        let raw = store.db.get(store.messages.key(event.uid)).unwrap().unwrap();
        assert!(!raw.windows(14).any(|w| w == b"secret payload"));

        let got = store.retrieve(1, DestinationKind::Stderr).unwrap();
        assert_eq!(got[0].event.message, "secret payload");
    }

    #[test]
    fn test_syslog_config_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            MessageStore::open(&test_config(&dir, &[DestinationKind::Stderr])).unwrap();
        let id = ConfigId::new_v4();
        let snapshot = ListenerSnapshot {
            format: "rfc5424".to_string(),
            ..ListenerSnapshot::default()
        };
        store.store_syslog_config(id, &snapshot).unwrap();
        store
            .store_syslog_config(id, &ListenerSnapshot::default())
            .unwrap();
        // first write wins
        assert_eq!(store.syslog_config(id).unwrap().unwrap(), snapshot);
        assert_eq!(store.gauges().configs(), 1);
        assert!(store.syslog_config(ConfigId::new_v4()).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_completion_watchers_fire_once() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            MessageStore::open(&test_config(&dir, &[DestinationKind::Stderr])).unwrap();
        let gen = IdGenerator::new();
        let event = stored(&gen, "x");
        let (tx, mut rx) = mpsc::unbounded_channel();
        store.watch(event.uid, tx);
        store.stash_batch(&[event.clone()]).unwrap();
        let got = store.retrieve(1, DestinationKind::Stderr).unwrap();
        store.ack(&[got[0].uid], DestinationKind::Stderr).unwrap();

        let completion = rx.recv().await.unwrap();
        assert_eq!(completion.uid, event.uid);
        assert_eq!(completion.outcome, DeliveryOutcome::Acked);
        // a second ack produces no further notification
        store.ack(&[got[0].uid], DestinationKind::Stderr).unwrap();
        assert!(rx.try_recv().is_err());
    }
}
