//! Wiring and supervision.
//!
//! Builds the pipeline out of the configured pieces, then supervises:
//! a store fatal signal or ctrl-c cancels the token hierarchy, and the
//! relay gets the configured grace period to drain before the process
//! exits. Shutdown order follows the data flow: listeners stop
//! accepting, readers drain and release the raw ring, parser workers
//! drain the ring, then the store and the destination runners wind
//! down.

use std::sync::Arc;

use skewer_model::IdGenerator;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::FatalSignal;
use crate::config::{Config, DestinationKind, ListenerProtocol};
use crate::dest::{
    feedback_channel, file::FileDestination, http::HttpDestination, net::TcpDestination,
    net::UdpDestination, spawn_runner, stderr::StderrDestination, Destination, EventEncoder,
};
use crate::filter::{FilterHost, NoopFilter};
use crate::ingress::{
    default_workers, raw_ring, spawn_parsers, tcp::spawn_stream_listener,
    udp::spawn_datagram_listener, IngressCounters, ListenerInfo,
};
use crate::relp::{spawn_relp_listener, RelpConnection, StoreRelpStasher};
use crate::store::{ListenerSnapshot, MessageStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("listener setup failed: {0}")]
    Listener(#[from] std::io::Error),
}

fn build_adapter(
    kind: DestinationKind,
    config: &Config,
    feedback: crate::dest::DestFeedback,
    fatal: FatalSignal,
) -> Option<Box<dyn Destination>> {
    match kind {
        DestinationKind::Stderr => Some(Box::new(StderrDestination::new(
            EventEncoder::Rfc5424,
            feedback,
            fatal,
        ))),
        DestinationKind::File => match &config.dest.file_path {
            Some(path) => Some(Box::new(FileDestination::new(
                path,
                EventEncoder::Json,
                feedback,
                fatal,
            ))),
            None => {
                warn!("file destination enabled but SKEWER_FILE_PATH is not set");
                None
            }
        },
        DestinationKind::Tcp => match &config.dest.tcp_addr {
            Some(addr) => Some(Box::new(TcpDestination::new(
                addr.clone(),
                EventEncoder::Rfc5424,
                feedback,
                fatal,
            ))),
            None => {
                warn!("tcp destination enabled but SKEWER_TCP_DEST is not set");
                None
            }
        },
        DestinationKind::Udp => match &config.dest.udp_addr {
            Some(addr) => Some(Box::new(UdpDestination::new(
                addr.clone(),
                EventEncoder::Rfc5424,
                feedback,
                fatal,
            ))),
            None => {
                warn!("udp destination enabled but SKEWER_UDP_DEST is not set");
                None
            }
        },
        DestinationKind::Http => match &config.dest.http_url {
            Some(url) => {
                match HttpDestination::new(url.clone(), config.dest.http_timeout, feedback, fatal)
                {
                    Ok(dest) => Some(Box::new(dest)),
                    Err(err) => {
                        warn!(error = %err, "http destination setup failed");
                        None
                    }
                }
            }
            None => {
                warn!("http destination enabled but SKEWER_HTTP_URL is not set");
                None
            }
        },
        // wire protocols owed to external collaborators
        DestinationKind::Kafka
        | DestinationKind::Elasticsearch
        | DestinationKind::Graylog
        | DestinationKind::Relp => {
            warn!(dest = kind.name(), "no built-in adapter for this destination");
            None
        }
    }
}

fn snapshot_of(listener: &crate::config::ListenerConfig) -> ListenerSnapshot {
    ListenerSnapshot {
        format: format!("{:?}", listener.format).to_ascii_lowercase(),
        encoding: format!("{:?}", listener.encoding).to_ascii_lowercase(),
        dont_parse_sd: listener.dont_parse_sd,
        ..ListenerSnapshot::default()
    }
}

/// Runs the relay until ctrl-c or a fatal store failure.
pub async fn run(config: Config) -> Result<(), RelayError> {
    let shutdown = CancellationToken::new();
    let store = MessageStore::open(&config)?;
    let handle = MessageStore::start(&store, &shutdown, config.input_queue_size);
    let generator = Arc::new(IdGenerator::new());
    let filter: Arc<dyn FilterHost> = Arc::new(NoopFilter::new());
    let counters = Arc::new(IngressCounters::default());

    // destination runners
    let mut runners = Vec::new();
    for &kind in store.destinations() {
        let (feedback, feedback_rx) = feedback_channel();
        let fatal = FatalSignal::new();
        let Some(adapter) = build_adapter(kind, &config, feedback, fatal) else {
            continue;
        };
        runners.push(spawn_runner(
            Arc::clone(&store),
            kind,
            adapter,
            feedback_rx,
            config.retrieve_batch,
            config.dest.rebind_period,
            shutdown.child_token(),
        ));
        info!(dest = kind.name(), "destination runner started");
    }

    // parser pool behind the raw ring
    let (ring, consumer) = raw_ring(config.input_queue_size);
    let parser_handles = spawn_parsers(
        consumer,
        Arc::new(handle.clone()),
        Arc::clone(&filter),
        Arc::clone(&generator),
        Arc::clone(&counters),
        default_workers(),
    );

    // listeners
    let mut infos: Vec<ListenerInfo> = Vec::new();
    for listener in &config.listeners {
        store.store_syslog_config(listener.config_id, &snapshot_of(listener))?;
        let info = match listener.protocol {
            ListenerProtocol::Tcp => {
                spawn_stream_listener(
                    listener.clone(),
                    ring.clone(),
                    Arc::clone(&counters),
                    shutdown.child_token(),
                )
                .await?
            }
            ListenerProtocol::Udp => {
                spawn_datagram_listener(
                    listener.clone(),
                    ring.clone(),
                    Arc::clone(&counters),
                    shutdown.child_token(),
                )
                .await?
            }
            ListenerProtocol::Relp => {
                let ctx = RelpConnection {
                    stasher: Arc::new(StoreRelpStasher::new(handle.clone())),
                    generator: Arc::clone(&generator),
                    filter: Arc::clone(&filter),
                    counters: Arc::clone(&counters),
                    fatal: store.fatal(),
                    failure_backoff: config.relp_failure_backoff,
                };
                spawn_relp_listener(listener.clone(), ctx, shutdown.child_token()).await?
            }
        };
        match (&info.bind_addr, &info.unix_socket_path) {
            (Some(addr), _) => info!(protocol = info.protocol, %addr, "listening"),
            (None, Some(path)) => {
                info!(protocol = info.protocol, path = %path.display(), "listening");
            }
            _ => {}
        }
        infos.push(info);
    }
    if infos.is_empty() {
        warn!("no listeners configured; the relay will only drain its backlog");
    }

    // supervise
    let store_fatal = store.fatal();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupt received, shutting down"),
        () = store_fatal.raised() => warn!("store raised its fatal signal, shutting down"),
    }

    shutdown.cancel();
    drop(ring);
    drop(handle);
    let drain = async {
        for parser in parser_handles {
            let _ = parser.await;
        }
        for runner in runners {
            let _ = runner.await;
        }
    };
    if tokio::time::timeout(config.grace_period, drain).await.is_err() {
        warn!("grace period expired before the pipeline drained");
    }
    info!("relay stopped");
    Ok(())
}
