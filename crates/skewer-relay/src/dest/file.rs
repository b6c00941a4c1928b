//! File destination: append-only log of rendered events.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::warn;

use crate::bus::FatalSignal;
use crate::dest::{DestFeedback, Destination, EventEncoder};
use crate::store::StoredEvent;

pub struct FileDestination {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    encoder: EventEncoder,
    feedback: DestFeedback,
    fatal: FatalSignal,
}

impl FileDestination {
    #[must_use]
    pub fn new(
        path: impl AsRef<Path>,
        encoder: EventEncoder,
        feedback: DestFeedback,
        fatal: FatalSignal,
    ) -> Self {
        FileDestination {
            path: path.as_ref().to_path_buf(),
            writer: None,
            encoder,
            feedback,
            fatal,
        }
    }

    async fn writer(&mut self) -> std::io::Result<&mut BufWriter<File>> {
        if self.writer.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            self.writer = Some(BufWriter::new(file));
        }
        Ok(self.writer.as_mut().expect("just created"))
    }
}

#[async_trait]
impl Destination for FileDestination {
    async fn send(&mut self, stored: StoredEvent) {
        let line = match self.encoder.encode(&stored) {
            Ok(line) => line,
            Err(_) => {
                self.feedback.perm_error(stored.uid);
                return;
            }
        };
        let written = match self.writer().await {
            Ok(writer) => {
                let result = writer.write_all(&line).await;
                match result {
                    Ok(()) => writer.flush().await,
                    err => err,
                }
            }
            Err(err) => Err(err),
        };
        match written {
            Ok(()) => self.feedback.ack(stored.uid),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "file write failed");
                self.feedback.nack(stored.uid);
                self.writer = None;
                self.fatal.raise();
            }
        }
    }

    fn fatal(&self) -> FatalSignal {
        self.fatal.clone()
    }

    async fn close(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            let _ = writer.flush().await;
        }
    }
}
