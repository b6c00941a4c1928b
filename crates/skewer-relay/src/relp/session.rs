//! RELP session state, transaction bookkeeping and ACK ordering.
//!
//! The protocol requires responses in strictly increasing transaction
//! order, but downstream completions arrive in whatever order the
//! destination produces them. [`AckWindow`] buffers out-of-order
//! completions and drains them from the commit cursor; [`RelpSession`]
//! layers command sequencing and the event-to-transaction map on top.
//! Everything here is pure so it can be exercised without sockets.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use skewer_model::EventId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Open,
    Closing,
    Failed,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RelpError {
    #[error("received open command twice")]
    DoubleOpen,
    #[error("received {0} before open")]
    NotOpen(&'static str),
    #[error("unknown relp command: {0}")]
    UnknownCommand(String),
    #[error("transaction number {txnr} is not greater than {last}")]
    NonMonotonicTxnr { txnr: u64, last: u64 },
}

/// Buffers downstream completions and emits them in txnr order.
#[derive(Debug)]
pub struct AckWindow {
    last_committed: u64,
    successes: BTreeSet<u64>,
    failures: BTreeSet<u64>,
}

impl AckWindow {
    /// `open_txnr` anchors the cursor: the first syslog transaction to
    /// be acknowledged is `open_txnr + 1`.
    #[must_use]
    pub fn new(open_txnr: u64) -> Self {
        AckWindow {
            last_committed: open_txnr,
            successes: BTreeSet::new(),
            failures: BTreeSet::new(),
        }
    }

    pub fn complete(&mut self, txnr: u64, success: bool) {
        if txnr <= self.last_committed {
            return;
        }
        if success {
            self.successes.insert(txnr);
        } else {
            self.failures.insert(txnr);
        }
    }

    /// Emissions now possible: consecutive completions starting right
    /// after the cursor, each tagged with its success flag.
    pub fn drain(&mut self) -> Vec<(u64, bool)> {
        let mut out = Vec::new();
        loop {
            let next = self.last_committed + 1;
            if self.successes.remove(&next) {
                out.push((next, true));
            } else if self.failures.remove(&next) {
                out.push((next, false));
            } else {
                break;
            }
            self.last_committed = next;
        }
        out
    }

    #[must_use]
    pub fn last_committed(&self) -> u64 {
        self.last_committed
    }
}

/// One RELP session.
#[derive(Debug)]
pub struct RelpSession {
    state: SessionState,
    window: Option<AckWindow>,
    highest_txnr: u64,
    /// uid -> txnr for stashed-but-unconfirmed events.
    txnrs: HashMap<EventId, u64>,
    /// txnr -> uid, kept ordered for the failure flush.
    inflight: BTreeMap<u64, Option<EventId>>,
}

impl Default for RelpSession {
    fn default() -> Self {
        Self::new()
    }
}

impl RelpSession {
    #[must_use]
    pub fn new() -> Self {
        RelpSession {
            state: SessionState::Closed,
            window: None,
            highest_txnr: 0,
            txnrs: HashMap::new(),
            inflight: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }

    fn accept_txnr(&mut self, txnr: u64) -> Result<(), RelpError> {
        if txnr <= self.highest_txnr {
            return Err(RelpError::NonMonotonicTxnr {
                txnr,
                last: self.highest_txnr,
            });
        }
        self.highest_txnr = txnr;
        Ok(())
    }

    pub fn on_open(&mut self, txnr: u64) -> Result<(), RelpError> {
        if self.state != SessionState::Closed {
            return Err(RelpError::DoubleOpen);
        }
        self.accept_txnr(txnr)?;
        self.window = Some(AckWindow::new(txnr));
        self.state = SessionState::Open;
        Ok(())
    }

    pub fn on_close(&mut self, txnr: u64) -> Result<(), RelpError> {
        if self.state != SessionState::Open {
            return Err(RelpError::NotOpen("close"));
        }
        self.accept_txnr(txnr)?;
        self.state = SessionState::Closing;
        Ok(())
    }

    /// Registers a stashed syslog transaction awaiting its downstream
    /// completion.
    pub fn on_syslog(&mut self, txnr: u64, uid: EventId) -> Result<(), RelpError> {
        if self.state != SessionState::Open {
            return Err(RelpError::NotOpen("syslog"));
        }
        self.accept_txnr(txnr)?;
        self.txnrs.insert(uid, txnr);
        self.inflight.insert(txnr, Some(uid));
        Ok(())
    }

    /// Registers a syslog transaction that will be completed locally
    /// (unparseable payload, filtered event) without a stash.
    pub fn on_syslog_unstashed(&mut self, txnr: u64) -> Result<(), RelpError> {
        if self.state != SessionState::Open {
            return Err(RelpError::NotOpen("syslog"));
        }
        self.accept_txnr(txnr)?;
        self.inflight.insert(txnr, None);
        Ok(())
    }

    /// Feeds a downstream completion for `uid`; returns the responses
    /// that can now be emitted, in strictly increasing txnr order.
    pub fn on_completion(&mut self, uid: EventId, success: bool) -> Vec<(u64, bool)> {
        let Some(txnr) = self.txnrs.remove(&uid) else {
            return Vec::new();
        };
        self.complete_txnr(txnr, success)
    }

    /// Feeds a local completion for a transaction registered with
    /// [`on_syslog_unstashed`](Self::on_syslog_unstashed).
    pub fn complete_txnr(&mut self, txnr: u64, success: bool) -> Vec<(u64, bool)> {
        let Some(window) = self.window.as_mut() else {
            return Vec::new();
        };
        window.complete(txnr, success);
        let emitted = window.drain();
        for (txnr, _) in &emitted {
            self.inflight.remove(txnr);
        }
        emitted
    }

    /// Moves the session to Failed and returns the transactions that
    /// never completed, in order, for a best-effort NACK flush.
    pub fn fail(&mut self) -> Vec<u64> {
        self.state = SessionState::Failed;
        let pending: Vec<u64> = self.inflight.keys().copied().collect();
        self.inflight.clear();
        self.txnrs.clear();
        pending
    }

    /// Count of transactions awaiting completion.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }
}
