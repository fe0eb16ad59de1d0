pub mod identity;

use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info};

use crate::archive::{ArchiveStore, MessageDraft, PosterDraft};
use crate::config::IngestSection;
use crate::harvester::Shutdown;

/// Buffers observed (message, poster) pairs and commits them to the archive
/// in batches. Flushes when the message buffer reaches `batch_size` or when
/// `flush_interval` has elapsed since the last flush, whichever comes first.
/// A failed flush is logged and the window's data dropped; the producers will
/// re-observe anything that matters.
pub struct IngestBatcher {
    rx: mpsc::Receiver<(MessageDraft, PosterDraft)>,
    store: ArchiveStore,
    config: IngestSection,
    shutdown: Shutdown,
    pending_messages: Vec<MessageDraft>,
    pending_posters: HashMap<String, PosterDraft>,
    last_flush: Instant,
}

impl IngestBatcher {
    pub fn new(
        rx: mpsc::Receiver<(MessageDraft, PosterDraft)>,
        store: ArchiveStore,
        config: IngestSection,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            rx,
            store,
            config,
            shutdown,
            pending_messages: Vec::new(),
            pending_posters: HashMap::new(),
            last_flush: Instant::now(),
        }
    }

    pub async fn run(mut self) {
        info!(batch_size = self.config.batch_size, "ingest batcher started");
        loop {
            if self.shutdown.is_triggered() {
                break;
            }
            match timeout(self.config.poll_timeout(), self.rx.recv()).await {
                Ok(Some((message, poster))) => self.accept(message, poster),
                Ok(None) => break,
                Err(_) => {}
            }
            if self.pending_messages.len() >= self.config.batch_size
                || self.last_flush.elapsed() >= self.config.flush_interval()
            {
                self.flush();
            }
        }
        self.flush();
        info!("ingest batcher stopped");
    }

    fn accept(&mut self, message: MessageDraft, poster: PosterDraft) {
        self.pending_messages.push(message);
        if poster.name.is_empty() {
            debug!("ignoring poster draft without name");
            return;
        }
        // First observation wins within a flush window.
        self.pending_posters
            .entry(poster.name.clone())
            .or_insert(poster);
    }

    /// Commits both buffers and resets the window regardless of outcome.
    fn flush(&mut self) {
        self.last_flush = Instant::now();
        if self.pending_messages.is_empty() && self.pending_posters.is_empty() {
            return;
        }
        let messages = std::mem::take(&mut self.pending_messages);
        let posters: Vec<PosterDraft> = self.pending_posters.drain().map(|(_, v)| v).collect();
        match self.store.upsert_messages(&messages) {
            Ok(written) => {
                info!(messages = written, posters = posters.len(), "flushed ingest batch")
            }
            Err(err) => error!(error = %err, dropped = messages.len(), "message batch upsert failed"),
        }
        if let Err(err) = self.store.upsert_posters(&posters) {
            error!(error = %err, dropped = posters.len(), "poster batch upsert failed");
        }
    }
}
