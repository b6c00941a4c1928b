//! Plain TCP and UDP destinations.
//!
//! The TCP adapter reconnects lazily: a write failure NACKs the event,
//! drops the connection, and the next send dials again. UDP is
//! fire-and-forget at the transport level but still confirms each
//! datagram handed to the socket.

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tracing::warn;

use crate::bus::FatalSignal;
use crate::dest::{DestFeedback, Destination, EventEncoder};
use crate::store::StoredEvent;

pub struct TcpDestination {
    addr: String,
    conn: Option<TcpStream>,
    encoder: EventEncoder,
    feedback: DestFeedback,
    fatal: FatalSignal,
}

impl TcpDestination {
    #[must_use]
    pub fn new(
        addr: impl Into<String>,
        encoder: EventEncoder,
        feedback: DestFeedback,
        fatal: FatalSignal,
    ) -> Self {
        TcpDestination {
            addr: addr.into(),
            conn: None,
            encoder,
            feedback,
            fatal,
        }
    }

    async fn conn(&mut self) -> std::io::Result<&mut TcpStream> {
        if self.conn.is_none() {
            self.conn = Some(TcpStream::connect(&self.addr).await?);
        }
        Ok(self.conn.as_mut().expect("just connected"))
    }
}

#[async_trait]
impl Destination for TcpDestination {
    async fn send(&mut self, stored: StoredEvent) {
        let line = match self.encoder.encode(&stored) {
            Ok(line) => line,
            Err(_) => {
                self.feedback.perm_error(stored.uid);
                return;
            }
        };
        let written = match self.conn().await {
            Ok(conn) => conn.write_all(&line).await,
            Err(err) => Err(err),
        };
        match written {
            Ok(()) => self.feedback.ack(stored.uid),
            Err(err) => {
                warn!(addr = %self.addr, error = %err, "tcp destination write failed");
                self.conn = None;
                self.feedback.nack(stored.uid);
            }
        }
    }

    fn fatal(&self) -> FatalSignal {
        self.fatal.clone()
    }

    async fn close(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            let _ = conn.shutdown().await;
        }
    }
}

pub struct UdpDestination {
    addr: String,
    socket: Option<UdpSocket>,
    encoder: EventEncoder,
    feedback: DestFeedback,
    fatal: FatalSignal,
}

impl UdpDestination {
    #[must_use]
    pub fn new(
        addr: impl Into<String>,
        encoder: EventEncoder,
        feedback: DestFeedback,
        fatal: FatalSignal,
    ) -> Self {
        UdpDestination {
            addr: addr.into(),
            socket: None,
            encoder,
            feedback,
            fatal,
        }
    }

    async fn socket(&mut self) -> std::io::Result<&UdpSocket> {
        if self.socket.is_none() {
            let socket = UdpSocket::bind("0.0.0.0:0").await?;
            socket.connect(&self.addr).await?;
            self.socket = Some(socket);
        }
        Ok(self.socket.as_ref().expect("just bound"))
    }
}

#[async_trait]
impl Destination for UdpDestination {
    async fn send(&mut self, stored: StoredEvent) {
        let line = match self.encoder.encode(&stored) {
            Ok(line) => line,
            Err(_) => {
                self.feedback.perm_error(stored.uid);
                return;
            }
        };
        let sent = match self.socket().await {
            Ok(socket) => socket.send(&line).await.map(|_| ()),
            Err(err) => Err(err),
        };
        match sent {
            Ok(()) => self.feedback.ack(stored.uid),
            Err(err) => {
                warn!(addr = %self.addr, error = %err, "udp destination send failed");
                self.socket = None;
                self.feedback.nack(stored.uid);
            }
        }
    }

    fn fatal(&self) -> FatalSignal {
        self.fatal.clone()
    }
}
