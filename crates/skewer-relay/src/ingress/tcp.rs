//! TCP and unix-stream listeners.
//!
//! One accept loop per listening endpoint; each accepted connection
//! gets a reader task that drives the framer under the configured read
//! deadline and feeds the raw ring. A framing error or an expired
//! deadline closes the connection; the listener keeps accepting.

use std::io;
use std::time::Duration;

use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio::net::{TcpListener, UnixListener};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use std::sync::Arc;

use crate::config::ListenerConfig;
use crate::framing::RecordDecoder;
use crate::ingress::{
    effective_deadline, note_framing_error, record_from, IngressCounters, ListenerInfo, RawRing,
};

/// Binds the listener and spawns its accept loop.
pub async fn spawn_stream_listener(
    config: ListenerConfig,
    ring: RawRing,
    counters: Arc<IngressCounters>,
    shutdown: CancellationToken,
) -> io::Result<ListenerInfo> {
    match config.unix_socket_path.clone() {
        Some(path) => {
            // a stale socket file from a previous run would make bind fail
            let _ = std::fs::remove_file(&path);
            let listener = UnixListener::bind(&path)?;
            let info = ListenerInfo {
                protocol: "tcp",
                bind_addr: None,
                unix_socket_path: Some(path),
            };
            tokio::spawn(accept_unix(listener, config, ring, counters, shutdown));
            Ok(info)
        }
        None => {
            let listener = TcpListener::bind(&config.bind).await?;
            let local = listener.local_addr()?;
            let info = ListenerInfo {
                protocol: "tcp",
                bind_addr: Some(local),
                unix_socket_path: None,
            };
            tokio::spawn(accept_tcp(listener, config, ring, counters, shutdown));
            Ok(info)
        }
    }
}

async fn accept_tcp(
    listener: TcpListener,
    config: ListenerConfig,
    ring: RawRing,
    counters: Arc<IngressCounters>,
    shutdown: CancellationToken,
) {
    let local_port = listener.local_addr().map(|a| a.port()).unwrap_or(0);
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    counters.connections.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    info!(client = %peer, "new tcp client");
                    tokio::spawn(read_stream(
                        stream,
                        peer.ip().to_string(),
                        local_port,
                        config.clone(),
                        ring.clone(),
                        Arc::clone(&counters),
                        shutdown.clone(),
                    ));
                }
                Err(err) => {
                    warn!(error = %err, "tcp accept error");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            () = shutdown.cancelled() => break,
        }
    }
    debug!("tcp accept loop ended");
}

async fn accept_unix(
    listener: UnixListener,
    config: ListenerConfig,
    ring: RawRing,
    counters: Arc<IngressCounters>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    counters.connections.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    info!(path = ?config.unix_socket_path, "new unix-stream client");
                    tokio::spawn(read_stream(
                        stream,
                        "localhost".to_string(),
                        0,
                        config.clone(),
                        ring.clone(),
                        Arc::clone(&counters),
                        shutdown.clone(),
                    ));
                }
                Err(err) => {
                    warn!(error = %err, "unix accept error");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            () = shutdown.cancelled() => break,
        }
    }
    debug!("unix-stream accept loop ended");
}

/// Per-connection reader: frame, refresh the deadline after every
/// record, push onto the ring.
async fn read_stream<S>(
    stream: S,
    client: String,
    local_port: u16,
    config: ListenerConfig,
    ring: RawRing,
    counters: Arc<IngressCounters>,
    shutdown: CancellationToken,
) where
    S: AsyncRead + Unpin + Send + 'static,
{
    let deadline = effective_deadline(config.read_timeout);
    let decoder = RecordDecoder::new(config.framing, config.max_record_size);
    let mut framed = FramedRead::new(stream, decoder);

    loop {
        let next = tokio::select! {
            next = tokio::time::timeout(deadline, framed.next()) => next,
            () = shutdown.cancelled() => break,
        };
        match next {
            Err(_) => {
                info!(client = %client, "read deadline exceeded, closing connection");
                break;
            }
            Ok(None) => {
                info!(client = %client, "end of client connection");
                break;
            }
            Ok(Some(Ok(record))) => {
                counters.incoming.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                let raw = record_from(&config, record, client.clone(), local_port);
                if ring.put(raw).await.is_err() {
                    debug!(client = %client, "raw ring disposed, reader exiting");
                    break;
                }
            }
            Ok(Some(Err(err))) => {
                note_framing_error(&counters, &client, &err);
                break;
            }
        }
    }
}
