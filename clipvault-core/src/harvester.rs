use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::archive::{ArchiveStore, MessageDraft, PosterDraft};
use crate::config::{ClipvaultConfig, HarvesterConfig};
use crate::ingest::IngestBatcher;
use crate::platform::{ExtractSinks, PlatformClient};
use crate::processor::{CommandExecutor, MediaJob, MediaProcessor, ProcessorError, ProcessorStats};
use crate::refetch::{RefetchRequest, RefetchScheduler};
use crate::thumbstore::ThumbnailStore;

/// Cooperative stop flag shared by every loop. Queue polls are timeout
/// bounded so each loop notices a trigger within a fraction of a second.
#[derive(Debug, Clone, Default)]
pub struct Shutdown(Arc<AtomicBool>);

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Producer-facing ends of the three input queues plus the spawned loops.
pub struct HarvesterHandles {
    pub ingest: mpsc::Sender<(MessageDraft, PosterDraft)>,
    pub media: mpsc::Sender<MediaJob>,
    pub refetch: mpsc::Sender<RefetchRequest>,
    pub ingest_loop: JoinHandle<()>,
    pub refetch_loop: JoinHandle<()>,
    pub processor_loop: JoinHandle<ProcessorStats>,
}

impl HarvesterHandles {
    pub fn sinks(&self) -> ExtractSinks {
        ExtractSinks {
            ingest: self.ingest.clone(),
            media: self.media.clone(),
            refetch: self.refetch.clone(),
        }
    }

    /// Waits for all three loops to exit. Call after triggering shutdown.
    pub async fn join(self) -> ProcessorStats {
        let _ = self.ingest_loop.await;
        let _ = self.refetch_loop.await;
        self.processor_loop.await.unwrap_or_default()
    }
}

/// Wires the queues and spawns the three engine loops. Restarting a loop
/// that died on an unhandled error is the caller's concern.
pub async fn spawn(
    clipvault: &ClipvaultConfig,
    harvester: &HarvesterConfig,
    store: ArchiveStore,
    thumbs: Arc<dyn ThumbnailStore>,
    client: Arc<dyn PlatformClient>,
    executor: Option<Arc<dyn CommandExecutor>>,
    shutdown: Shutdown,
) -> Result<HarvesterHandles, ProcessorError> {
    let capacity = clipvault.limits.queue_capacity;
    let (ingest_tx, ingest_rx) = mpsc::channel(capacity);
    let (media_tx, media_rx) = mpsc::channel(capacity);
    let (refetch_tx, refetch_rx) = mpsc::channel(capacity);

    let sinks = ExtractSinks {
        ingest: ingest_tx.clone(),
        media: media_tx.clone(),
        refetch: refetch_tx.clone(),
    };

    let batcher = IngestBatcher::new(
        ingest_rx,
        store.clone(),
        harvester.ingest.clone(),
        shutdown.clone(),
    );

    let scheduler = RefetchScheduler::new(
        refetch_rx,
        client,
        sinks,
        clipvault.platform.media_extension.clone(),
        harvester.refetch.clone(),
        shutdown.clone(),
    );

    let processor = MediaProcessor::initialize(
        media_rx,
        store.clone(),
        thumbs,
        &harvester.processor,
        clipvault.resolve_path(&clipvault.paths.temp_dir),
        clipvault.resolve_path(&clipvault.paths.thumb_dir),
        capacity,
        executor,
        shutdown.clone(),
    )
    .await?;

    info!(capacity, "harvester loops starting");
    let scheduler_store = store.clone();
    Ok(HarvesterHandles {
        ingest: ingest_tx,
        media: media_tx,
        refetch: refetch_tx,
        ingest_loop: tokio::spawn(batcher.run()),
        refetch_loop: tokio::spawn(async move { scheduler.run(Some(&scheduler_store)).await }),
        processor_loop: tokio::spawn(processor.run()),
    })
}
