//! Key layout of the store.
//!
//! All partitions share one sled keyspace. Lifecycle keys are
//! `[qtag:1][dtag:1][eventid:16]`; the message-body partition uses a
//! zero destination tag because bodies are written once and shared by
//! every destination; listener configs are `[b'c'][configid:16]`.
//! Because identifiers sort by time, an in-order prefix scan yields the
//! oldest entries first.

use sled::transaction::{TransactionalTree, UnabortableTransactionError};
use sled::{IVec, Tree};
use skewer_model::EventId;

use crate::config::DestinationKind;

/// Length of a lifecycle key.
pub const KEY_LEN: usize = 2 + EventId::LEN;

/// The per-destination queues plus the shared body partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Messages,
    Ready,
    Sent,
    Failed,
    PermErrors,
}

impl QueueKind {
    pub const LIFECYCLE: [QueueKind; 4] = [
        QueueKind::Ready,
        QueueKind::Sent,
        QueueKind::Failed,
        QueueKind::PermErrors,
    ];

    #[must_use]
    pub fn tag(self) -> u8 {
        match self {
            QueueKind::Messages => b'm',
            QueueKind::Ready => b'r',
            QueueKind::Sent => b's',
            QueueKind::Failed => b'f',
            QueueKind::PermErrors => b'p',
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            QueueKind::Messages => "messages",
            QueueKind::Ready => "ready",
            QueueKind::Sent => "sent",
            QueueKind::Failed => "failed",
            QueueKind::PermErrors => "permerrors",
        }
    }
}

/// One key-prefixed view over the shared keyspace.
#[derive(Debug, Clone, Copy)]
pub struct Partition {
    prefix: [u8; 2],
}

impl Partition {
    #[must_use]
    pub fn lifecycle(queue: QueueKind, dest: DestinationKind) -> Self {
        Partition {
            prefix: [queue.tag(), dest.tag()],
        }
    }

    /// The shared message-body partition.
    #[must_use]
    pub fn messages() -> Self {
        Partition {
            prefix: [QueueKind::Messages.tag(), 0],
        }
    }

    #[must_use]
    pub fn key(&self, uid: EventId) -> [u8; KEY_LEN] {
        let mut key = [0u8; KEY_LEN];
        key[..2].copy_from_slice(&self.prefix);
        key[2..].copy_from_slice(uid.as_bytes());
        key
    }

    fn uid_of(&self, key: &[u8]) -> Option<EventId> {
        EventId::from_slice(key.get(2..)?)
    }

    /// All identifiers in this partition, oldest first.
    pub fn keys(&self, tree: &Tree) -> Result<Vec<EventId>, sled::Error> {
        let mut out = Vec::new();
        for entry in tree.scan_prefix(self.prefix) {
            let (key, _) = entry?;
            if let Some(uid) = self.uid_of(&key) {
                out.push(uid);
            }
        }
        Ok(out)
    }

    /// Identifier/value pairs, oldest first, capped at `limit`.
    pub fn entries(
        &self,
        tree: &Tree,
        limit: usize,
    ) -> Result<Vec<(EventId, IVec)>, sled::Error> {
        let mut out = Vec::new();
        for entry in tree.scan_prefix(self.prefix).take(limit) {
            let (key, value) = entry?;
            if let Some(uid) = self.uid_of(&key) {
                out.push((uid, value));
            }
        }
        Ok(out)
    }

    pub fn count(&self, tree: &Tree) -> Result<u64, sled::Error> {
        let mut n = 0;
        for entry in tree.scan_prefix(self.prefix) {
            entry?;
            n += 1;
        }
        Ok(n)
    }

    pub fn contains(&self, tree: &Tree, uid: EventId) -> Result<bool, sled::Error> {
        Ok(tree.get(self.key(uid))?.is_some())
    }

    // transactional accessors

    pub fn get_tx(
        &self,
        tx: &TransactionalTree,
        uid: EventId,
    ) -> Result<Option<IVec>, UnabortableTransactionError> {
        tx.get(self.key(uid))
    }

    pub fn insert_tx(
        &self,
        tx: &TransactionalTree,
        uid: EventId,
        value: &[u8],
    ) -> Result<Option<IVec>, UnabortableTransactionError> {
        tx.insert(&self.key(uid)[..], value)
    }

    pub fn remove_tx(
        &self,
        tx: &TransactionalTree,
        uid: EventId,
    ) -> Result<Option<IVec>, UnabortableTransactionError> {
        tx.remove(&self.key(uid)[..])
    }

    pub fn contains_tx(
        &self,
        tx: &TransactionalTree,
        uid: EventId,
    ) -> Result<bool, UnabortableTransactionError> {
        Ok(tx.get(self.key(uid))?.is_some())
    }
}

/// Key of a persisted listener config.
#[must_use]
pub fn config_key(id: uuid::Uuid) -> [u8; 17] {
    let mut key = [0u8; 17];
    key[0] = b'c';
    key[1..].copy_from_slice(id.as_bytes());
    key
}
