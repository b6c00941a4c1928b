//! RELP connection driving.
//!
//! One task per connection owns both halves of the socket: it frames
//! commands off the read half, and interleaves command responses with
//! in-order acknowledgments fed back by downstream completions. The
//! at-least-once contract lives here: a `200 OK` for a syslog
//! transaction is only written after the store has durably ingested the
//! event and its destination has acknowledged it; a retryable failure
//! becomes a `500 KO`.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use skewer_model::IdGenerator;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::FatalSignal;
use crate::config::ListenerConfig;
use crate::filter::FilterHost;
use crate::framing::{RelpDecoder, RelpFrame};
use crate::ingress::{effective_deadline, IngressCounters, ListenerInfo};
use crate::relp::session::RelpSession;
use crate::store::{Completion, DeliveryOutcome, StoreError, StoreHandle, StoredEvent};

/// What a syslog frame turned into: a locally-completed transaction
/// (parse error, filtered event) or an event bound for the store.
enum DeliveryVerdict {
    Local(bool),
    Stash(skewer_model::Event),
}

/// Stashes events on behalf of a RELP session and routes their
/// completions back to it.
#[async_trait]
pub trait RelpStasher: Send + Sync + 'static {
    async fn stash(
        &self,
        stored: StoredEvent,
        completions: mpsc::UnboundedSender<Completion>,
    ) -> Result<(), StoreError>;
}

/// Production path: register a completion watcher, then ingest through
/// the store's stash queue.
pub struct StoreRelpStasher {
    handle: StoreHandle,
}

impl StoreRelpStasher {
    #[must_use]
    pub fn new(handle: StoreHandle) -> Self {
        StoreRelpStasher { handle }
    }
}

#[async_trait]
impl RelpStasher for StoreRelpStasher {
    async fn stash(
        &self,
        stored: StoredEvent,
        completions: mpsc::UnboundedSender<Completion>,
    ) -> Result<(), StoreError> {
        self.handle.store().watch(stored.uid, completions);
        self.handle.stash(stored).await
    }
}

/// Every stash succeeds immediately. Lets the framing and ACK-ordering
/// machinery be driven without a store behind it.
#[derive(Debug, Default)]
pub struct ImmediateStasher;

#[async_trait]
impl RelpStasher for ImmediateStasher {
    async fn stash(
        &self,
        stored: StoredEvent,
        completions: mpsc::UnboundedSender<Completion>,
    ) -> Result<(), StoreError> {
        let _ = completions.send(Completion {
            uid: stored.uid,
            outcome: DeliveryOutcome::Acked,
        });
        Ok(())
    }
}

/// Shared context for every connection of one RELP listener.
pub struct RelpConnection<S> {
    pub stasher: Arc<S>,
    pub generator: Arc<IdGenerator>,
    pub filter: Arc<dyn FilterHost>,
    pub counters: Arc<IngressCounters>,
    /// Raised by the store on unrecoverable engine failure; sessions
    /// flush NACKs and disconnect when they see it.
    pub fatal: FatalSignal,
    pub failure_backoff: Duration,
}

impl<S> Clone for RelpConnection<S> {
    fn clone(&self) -> Self {
        RelpConnection {
            stasher: Arc::clone(&self.stasher),
            generator: Arc::clone(&self.generator),
            filter: Arc::clone(&self.filter),
            counters: Arc::clone(&self.counters),
            fatal: self.fatal.clone(),
            failure_backoff: self.failure_backoff,
        }
    }
}

fn ack_response(txnr: u64, success: bool) -> String {
    if success {
        format!("{txnr} rsp 6 200 OK\n")
    } else {
        format!("{txnr} rsp 6 500 KO\n")
    }
}

fn open_response(txnr: u64, offers: &[u8]) -> Vec<u8> {
    let mut out = format!("{txnr} rsp {} 200 OK\n", offers.len() + 7).into_bytes();
    out.extend_from_slice(offers);
    out.push(b'\n');
    out
}

fn close_response(txnr: u64) -> String {
    format!("{txnr} rsp 0\n0 serverclose 0\n")
}

async fn write_acks<W: AsyncWrite + Unpin>(
    writer: &mut W,
    emissions: &[(u64, bool)],
) -> io::Result<()> {
    for &(txnr, success) in emissions {
        writer.write_all(ack_response(txnr, success).as_bytes()).await?;
    }
    if !emissions.is_empty() {
        writer.flush().await?;
    }
    Ok(())
}

/// Best-effort NACK flush before dropping a failed session.
async fn fail_session<W: AsyncWrite + Unpin>(
    session: &mut RelpSession,
    writer: &mut W,
    backoff: Duration,
) {
    let pending = session.fail();
    warn!(pending = pending.len(), "relp session failed, flushing nacks");
    for txnr in pending {
        let _ = writer.write_all(ack_response(txnr, false).as_bytes()).await;
    }
    let _ = writer.flush().await;
    tokio::time::sleep(backoff).await;
}

/// Drives one RELP connection until it closes, errors out, or shutdown.
pub async fn handle_connection<S, T>(
    ctx: RelpConnection<S>,
    io: T,
    client: String,
    config: ListenerConfig,
    shutdown: CancellationToken,
) where
    S: RelpStasher,
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (reader, mut writer) = tokio::io::split(io);
    let mut framed = FramedRead::new(reader, RelpDecoder::new(config.max_record_size));
    let deadline = effective_deadline(config.read_timeout);
    let (comp_tx, mut comp_rx) = mpsc::unbounded_channel::<Completion>();
    let mut session = RelpSession::new();

    info!(client = %client, "new relp client");
    loop {
        tokio::select! {
            next = tokio::time::timeout(deadline, framed.next()) => {
                let frame = match next {
                    Err(_) => {
                        info!(client = %client, "relp read deadline exceeded");
                        break;
                    }
                    Ok(None) => {
                        info!(client = %client, "end of relp stream");
                        break;
                    }
                    Ok(Some(Err(err))) => {
                        crate::ingress::note_framing_error(&ctx.counters, &client, &err);
                        break;
                    }
                    Ok(Some(Ok(frame))) => frame,
                };
                match handle_frame(&ctx, &mut session, &mut writer, &config, frame, &comp_tx)
                    .await
                {
                    FrameOutcome::Continue => {}
                    FrameOutcome::CloseClean => {
                        info!(client = %client, "relp session closed");
                        break;
                    }
                    FrameOutcome::Drop => break,
                    FrameOutcome::Fatal => {
                        fail_session(&mut session, &mut writer, ctx.failure_backoff).await;
                        break;
                    }
                }
            }
            Some(completion) = comp_rx.recv() => {
                let success = completion.outcome == DeliveryOutcome::Acked;
                let emissions = session.on_completion(completion.uid, success);
                if write_acks(&mut writer, &emissions).await.is_err() {
                    break;
                }
            }
            () = ctx.fatal.raised() => {
                fail_session(&mut session, &mut writer, ctx.failure_backoff).await;
                break;
            }
            () = shutdown.cancelled() => break,
        }
    }
    debug!(client = %client, "relp connection handler ended");
}

enum FrameOutcome {
    Continue,
    CloseClean,
    Drop,
    Fatal,
}

async fn handle_frame<S: RelpStasher, W: AsyncWrite + Unpin>(
    ctx: &RelpConnection<S>,
    session: &mut RelpSession,
    writer: &mut W,
    config: &ListenerConfig,
    frame: RelpFrame,
    comp_tx: &mpsc::UnboundedSender<Completion>,
) -> FrameOutcome {
    match frame.command.as_str() {
        "open" => {
            if let Err(err) = session.on_open(frame.txnr) {
                warn!(error = %err, "relp protocol error");
                return FrameOutcome::Drop;
            }
            let response = open_response(frame.txnr, &frame.data);
            if writer.write_all(&response).await.is_err() || writer.flush().await.is_err() {
                return FrameOutcome::Drop;
            }
            FrameOutcome::Continue
        }
        "close" => {
            if let Err(err) = session.on_close(frame.txnr) {
                warn!(error = %err, "relp protocol error");
                return FrameOutcome::Drop;
            }
            let response = close_response(frame.txnr);
            let _ = writer.write_all(response.as_bytes()).await;
            let _ = writer.flush().await;
            FrameOutcome::CloseClean
        }
        "syslog" => {
            ctx.counters
                .incoming
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            handle_syslog(ctx, session, writer, config, frame, comp_tx).await
        }
        other => {
            warn!(command = other, "unknown relp command");
            FrameOutcome::Drop
        }
    }
}

async fn handle_syslog<S: RelpStasher, W: AsyncWrite + Unpin>(
    ctx: &RelpConnection<S>,
    session: &mut RelpSession,
    writer: &mut W,
    config: &ListenerConfig,
    frame: RelpFrame,
    comp_tx: &mpsc::UnboundedSender<Completion>,
) -> FrameOutcome {
    let verdict = match skewer_model::parse(
        &frame.data,
        config.encoding,
        config.format,
        config.dont_parse_sd,
    ) {
        Err(err) => {
            ctx.counters
                .parse_errors
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            info!(txnr = frame.txnr, error = %err, "relp parsing error");
            DeliveryVerdict::Local(false)
        }
        Ok(event) => match ctx.filter.filter(&event) {
            // a filtered event is an accepted event
            None => {
                ctx.counters
                    .filtered
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                DeliveryVerdict::Local(true)
            }
            // an illegal topic name is a permanent error, never retried
            Some(event) if ctx.filter.checked_topic(&event).is_none() => {
                ctx.counters
                    .invalid_topic
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                warn!(txnr = frame.txnr, "invalid topic name for relp event");
                DeliveryVerdict::Local(false)
            }
            Some(event) => DeliveryVerdict::Stash(event),
        },
    };

    match verdict {
        DeliveryVerdict::Local(success) => {
            if let Err(err) = session.on_syslog_unstashed(frame.txnr) {
                warn!(error = %err, "relp protocol error");
                return FrameOutcome::Drop;
            }
            let emissions = session.complete_txnr(frame.txnr, success);
            if write_acks(writer, &emissions).await.is_err() {
                return FrameOutcome::Drop;
            }
            FrameOutcome::Continue
        }
        DeliveryVerdict::Stash(event) => {
            let uid = ctx.generator.generate();
            if let Err(err) = session.on_syslog(frame.txnr, uid) {
                warn!(error = %err, "relp protocol error");
                return FrameOutcome::Drop;
            }
            let stored = StoredEvent {
                uid,
                config_id: config.config_id,
                event,
            };
            if let Err(err) = ctx.stasher.stash(stored, comp_tx.clone()).await {
                warn!(error = %err, "relp stash failed");
                return FrameOutcome::Fatal;
            }
            FrameOutcome::Continue
        }
    }
}

/// Binds a RELP listener and spawns its accept loop.
pub async fn spawn_relp_listener<S: RelpStasher>(
    config: ListenerConfig,
    ctx: RelpConnection<S>,
    shutdown: CancellationToken,
) -> io::Result<ListenerInfo> {
    let listener = TcpListener::bind(&config.bind).await?;
    let local = listener.local_addr()?;
    let info = ListenerInfo {
        protocol: "relp",
        bind_addr: Some(local),
        unix_socket_path: None,
    };
    tokio::spawn(async move {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        ctx.counters
                            .connections
                            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        tokio::spawn(handle_connection(
                            ctx.clone(),
                            stream,
                            peer.ip().to_string(),
                            config.clone(),
                            shutdown.clone(),
                        ));
                    }
                    Err(err) => {
                        warn!(error = %err, "relp accept error");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                () = shutdown.cancelled() => break,
            }
        }
        debug!("relp accept loop ended");
    });
    Ok(info)
}
