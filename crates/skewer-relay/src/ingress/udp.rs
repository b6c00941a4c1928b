//! UDP and unix-datagram readers.
//!
//! No per-packet state: every datagram is one record. Receive buffers
//! are rented from a small pool and returned after the record has been
//! copied onto the ring.

use std::io;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::net::{UdpSocket, UnixDatagram};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ListenerConfig;
use crate::ingress::{record_from, IngressCounters, ListenerInfo, RawRing};

const READ_BUFFER_COUNT: usize = 16;

/// Fixed-size receive buffers, recycled across datagrams.
struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    size: usize,
}

impl BufferPool {
    fn new(size: usize) -> Self {
        BufferPool {
            buffers: Mutex::new(Vec::with_capacity(READ_BUFFER_COUNT)),
            size,
        }
    }

    fn rent(&self) -> Vec<u8> {
        self.buffers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop()
            .unwrap_or_else(|| vec![0u8; self.size])
    }

    fn give_back(&self, buffer: Vec<u8>) {
        let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        if buffers.len() < READ_BUFFER_COUNT {
            buffers.push(buffer);
        }
    }
}

enum DatagramSocket {
    Udp(UdpSocket),
    Unix(UnixDatagram),
}

impl DatagramSocket {
    /// Receives one datagram, returning its size and the peer address
    /// when the transport knows one.
    async fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, Option<std::net::SocketAddr>)> {
        match self {
            DatagramSocket::Udp(socket) => {
                let (n, peer) = socket.recv_from(buf).await?;
                Ok((n, Some(peer)))
            }
            DatagramSocket::Unix(socket) => {
                let (n, _) = socket.recv_from(buf).await?;
                Ok((n, None))
            }
        }
    }
}

/// Binds the datagram socket and spawns its reader loop.
pub async fn spawn_datagram_listener(
    config: ListenerConfig,
    ring: RawRing,
    counters: Arc<IngressCounters>,
    shutdown: CancellationToken,
) -> io::Result<ListenerInfo> {
    let (socket, info, local_port) = match config.unix_socket_path.clone() {
        Some(path) => {
            let _ = std::fs::remove_file(&path);
            let socket = UnixDatagram::bind(&path)?;
            let info = ListenerInfo {
                protocol: "udp",
                bind_addr: None,
                unix_socket_path: Some(path),
            };
            (DatagramSocket::Unix(socket), info, 0)
        }
        None => {
            let socket = UdpSocket::bind(&config.bind).await?;
            let local = socket.local_addr()?;
            let info = ListenerInfo {
                protocol: "udp",
                bind_addr: Some(local),
                unix_socket_path: None,
            };
            (DatagramSocket::Udp(socket), info, local.port())
        }
    };

    tokio::spawn(read_datagrams(
        socket, config, ring, counters, shutdown, local_port,
    ));
    Ok(info)
}

async fn read_datagrams(
    socket: DatagramSocket,
    config: ListenerConfig,
    ring: RawRing,
    counters: Arc<IngressCounters>,
    shutdown: CancellationToken,
    local_port: u16,
) {
    let pool = BufferPool::new(config.max_record_size.max(1024));
    loop {
        let mut buffer = pool.rent();
        let received = tokio::select! {
            received = socket.recv(&mut buffer) => received,
            () = shutdown.cancelled() => break,
        };
        match received {
            Ok((0, _)) => {
                pool.give_back(buffer);
            }
            Ok((n, peer)) => {
                counters.incoming.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                let data = Bytes::copy_from_slice(&buffer[..n]);
                pool.give_back(buffer);
                let client = peer
                    .map_or_else(|| "localhost".to_string(), |p| p.ip().to_string());
                let raw = record_from(&config, data, client, local_port);
                if ring.put(raw).await.is_err() {
                    debug!("raw ring disposed, udp reader exiting");
                    break;
                }
            }
            Err(err) => {
                warn!(error = %err, "udp receive error");
                pool.give_back(buffer);
                break;
            }
        }
    }
    debug!("datagram reader ended");
}
