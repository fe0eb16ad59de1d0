use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::archive::{ArchiveError, ArchiveStore, DurationEntry};
use crate::config::ProcessorSection;
use crate::harvester::Shutdown;

/// Shared map of every duration known to this process: seeded from the
/// archive at startup, extended as the batcher accepts new entries. Processor
/// tasks consult it to skip probing; the batcher uses it to enforce
/// first-write-wins.
#[derive(Clone, Default)]
pub struct DurationLedger {
    inner: Arc<Mutex<HashMap<String, f64>>>,
}

impl DurationLedger {
    pub fn from_store(store: &ArchiveStore) -> Result<Self, ArchiveError> {
        let known = store.all_durations()?;
        Ok(Self {
            inner: Arc::new(Mutex::new(known)),
        })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().map(|map| map.contains_key(id)).unwrap_or(false)
    }

    pub fn get(&self, id: &str) -> Option<f64> {
        self.inner.lock().ok().and_then(|map| map.get(id).copied())
    }

    fn insert(&self, id: String, length: f64) {
        if let Ok(mut map) = self.inner.lock() {
            map.insert(id, length);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Buffers freshly probed durations and commits them to the archive in
/// batches, on its own thresholds and timer, independent of the ingest
/// batcher. The first value recorded for an id wins; later conflicting
/// values are logged and discarded.
pub struct DurationBatcher {
    rx: mpsc::Receiver<DurationEntry>,
    store: ArchiveStore,
    ledger: DurationLedger,
    batch: Vec<DurationEntry>,
    first_pending_at: Option<Instant>,
    batch_size: usize,
    flush_interval: Duration,
    shutdown: Shutdown,
}

impl DurationBatcher {
    pub fn new(
        rx: mpsc::Receiver<DurationEntry>,
        store: ArchiveStore,
        ledger: DurationLedger,
        config: &ProcessorSection,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            rx,
            store,
            ledger,
            batch: Vec::new(),
            first_pending_at: None,
            batch_size: config.metadata_batch_size,
            flush_interval: config.metadata_flush_interval(),
            shutdown,
        }
    }

    pub async fn run(mut self) {
        info!(batch_size = self.batch_size, "duration batcher started");
        loop {
            if self.shutdown.is_triggered() {
                break;
            }
            while let Ok(entry) = self.rx.try_recv() {
                self.accept(entry);
            }
            if self.should_flush() {
                self.flush();
            }
            sleep(Duration::from_millis(200)).await;
        }
        while let Ok(entry) = self.rx.try_recv() {
            self.accept(entry);
        }
        self.flush();
        info!("duration batcher stopped");
    }

    /// Admits one entry into the batch unless its id already has a value.
    pub fn accept(&mut self, entry: DurationEntry) {
        if entry.id.is_empty() || !(entry.length > 0.0) {
            error!(id = %entry.id, length = entry.length, "invalid duration entry skipped");
            return;
        }
        match self.ledger.get(&entry.id) {
            None => {
                self.ledger.insert(entry.id.clone(), entry.length);
                if self.first_pending_at.is_none() {
                    self.first_pending_at = Some(Instant::now());
                }
                debug!(id = %entry.id, length = entry.length, "duration queued for upload");
                self.batch.push(entry);
            }
            Some(existing) if existing != entry.length => {
                warn!(
                    id = %entry.id,
                    existing,
                    conflicting = entry.length,
                    "conflicting duration discarded, keeping first value"
                );
            }
            Some(_) => {
                debug!(id = %entry.id, "duration already recorded, ignoring repeat");
            }
        }
    }

    pub fn should_flush(&self) -> bool {
        if self.batch.is_empty() {
            return false;
        }
        self.batch.len() >= self.batch_size
            || self
                .first_pending_at
                .map(|at| at.elapsed() >= self.flush_interval)
                .unwrap_or(false)
    }

    pub fn flush(&mut self) {
        if self.batch.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.batch);
        self.first_pending_at = None;
        match self.store.apply_durations(&batch) {
            Ok(written) => info!(written, "flushed duration batch"),
            Err(err) => error!(error = %err, dropped = batch.len(), "duration batch write failed"),
        }
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        self.batch.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn batcher(dir: &TempDir) -> DurationBatcher {
        let store = ArchiveStore::new(dir.path().join("archive.sqlite")).unwrap();
        store.initialize().unwrap();
        let (_tx, rx) = mpsc::channel(8);
        let config = ProcessorSection {
            max_concurrent_tasks: 4,
            thumbnail_width: 420,
            frame_offset_s: 0.0,
            subprocess_timeout_s: 30,
            idle_sleep_ms: 1000,
            metadata_batch_size: 50,
            metadata_flush_interval_s: 60,
            ffprobe: "ffprobe".into(),
            ffmpeg: "ffmpeg".into(),
        };
        DurationBatcher::new(rx, store, DurationLedger::default(), &config, Shutdown::new())
    }

    #[test]
    fn first_value_wins_on_conflict() {
        let dir = TempDir::new().unwrap();
        let mut batcher = batcher(&dir);
        batcher.accept(DurationEntry {
            id: "a".into(),
            length: 10.0,
        });
        batcher.accept(DurationEntry {
            id: "a".into(),
            length: 12.0,
        });
        assert_eq!(batcher.pending(), 1);
        assert_eq!(batcher.ledger.get("a"), Some(10.0));
    }

    #[test]
    fn identical_repeat_is_ignored() {
        let dir = TempDir::new().unwrap();
        let mut batcher = batcher(&dir);
        batcher.accept(DurationEntry {
            id: "a".into(),
            length: 10.0,
        });
        batcher.accept(DurationEntry {
            id: "a".into(),
            length: 10.0,
        });
        assert_eq!(batcher.pending(), 1);
    }

    #[test]
    fn invalid_entries_never_enter_the_batch() {
        let dir = TempDir::new().unwrap();
        let mut batcher = batcher(&dir);
        batcher.accept(DurationEntry {
            id: String::new(),
            length: 10.0,
        });
        batcher.accept(DurationEntry {
            id: "a".into(),
            length: 0.0,
        });
        batcher.accept(DurationEntry {
            id: "b".into(),
            length: -3.0,
        });
        assert_eq!(batcher.pending(), 0);
        assert!(batcher.ledger.is_empty());
    }

    #[test]
    fn size_threshold_triggers_flush() {
        let dir = TempDir::new().unwrap();
        let mut batcher = batcher(&dir);
        batcher.batch_size = 3;
        for i in 0..3 {
            batcher.accept(DurationEntry {
                id: format!("id-{i}"),
                length: 5.0 + i as f64,
            });
        }
        assert!(batcher.should_flush());
        batcher.flush();
        assert_eq!(batcher.pending(), 0);
        assert!(!batcher.should_flush());
    }
}
