mod error;
mod metadata;
mod probe;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use futures::stream::{FuturesUnordered, StreamExt};
use reqwest::Client;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::archive::{ArchiveStore, DurationEntry};
use crate::config::ProcessorSection;
use crate::harvester::Shutdown;
use crate::thumbstore::ThumbnailStore;

pub use error::{ProcessorError, ProcessorResult};
pub use metadata::{DurationBatcher, DurationLedger};
pub use probe::{CommandExecutor, MediaProbe, SystemCommandExecutor};

/// One attachment awaiting processing.
#[derive(Debug, Clone)]
pub struct MediaJob {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Generated,
    Skipped,
    Error,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessorStats {
    pub generated: u64,
    pub skipped: u64,
    pub errors: u64,
}

impl ProcessorStats {
    fn record(&mut self, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::Generated => self.generated += 1,
            TaskOutcome::Skipped => self.skipped += 1,
            TaskOutcome::Error => self.errors += 1,
        }
    }
}

/// Everything a processing task needs, shared across the task set.
struct TaskContext {
    http_client: Client,
    probe: MediaProbe,
    thumbs: Arc<dyn ThumbnailStore>,
    durations: DurationLedger,
    known_thumbs: HashSet<String>,
    uploaded: Mutex<HashSet<String>>,
    meta_tx: mpsc::Sender<DurationEntry>,
    temp_dir: PathBuf,
    thumb_dir: PathBuf,
}

/// Downloads, probes, and thumbnails each queued attachment exactly once,
/// under a concurrency cap. Work already recorded in the archive or the
/// thumbnail store is skipped via snapshots taken at startup; the co-located
/// duration batcher extends the duration snapshot as it accepts entries.
pub struct MediaProcessor {
    rx: mpsc::Receiver<MediaJob>,
    ctx: Arc<TaskContext>,
    batcher: Option<DurationBatcher>,
    semaphore: Arc<Semaphore>,
    idle_sleep: Duration,
    shutdown: Shutdown,
}

impl MediaProcessor {
    /// Builds the processor and its idempotency snapshots: recorded durations
    /// from the archive, stored thumbnail ids from the object store.
    pub async fn initialize(
        rx: mpsc::Receiver<MediaJob>,
        store: ArchiveStore,
        thumbs: Arc<dyn ThumbnailStore>,
        config: &ProcessorSection,
        temp_dir: impl AsRef<Path>,
        thumb_dir: impl AsRef<Path>,
        queue_capacity: usize,
        executor: Option<Arc<dyn CommandExecutor>>,
        shutdown: Shutdown,
    ) -> ProcessorResult<Self> {
        let temp_dir = temp_dir.as_ref().to_path_buf();
        let thumb_dir = thumb_dir.as_ref().to_path_buf();
        for dir in [&temp_dir, &thumb_dir] {
            fs::create_dir_all(dir)
                .await
                .map_err(|source| ProcessorError::Io {
                    source,
                    path: dir.clone(),
                })?;
        }

        let durations = DurationLedger::from_store(&store)?;
        let known_thumbs = thumbs.list_ids().await?;
        info!(
            durations = durations.len(),
            thumbnails = known_thumbs.len(),
            "processor snapshots loaded"
        );

        let http_client = Client::builder()
            .user_agent("clipvault/0.1")
            .build()
            .map_err(|err| ProcessorError::Network(err.to_string()))?;

        let (meta_tx, meta_rx) = mpsc::channel(queue_capacity);
        let batcher = DurationBatcher::new(
            meta_rx,
            store,
            durations.clone(),
            config,
            shutdown.clone(),
        );

        Ok(Self {
            rx,
            ctx: Arc::new(TaskContext {
                http_client,
                probe: MediaProbe::new(config, executor),
                thumbs,
                durations,
                known_thumbs,
                uploaded: Mutex::new(HashSet::new()),
                meta_tx,
                temp_dir,
                thumb_dir,
            }),
            batcher: Some(batcher),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_tasks)),
            idle_sleep: config.idle_sleep(),
            shutdown,
        })
    }

    /// Runs until shutdown; returns the final outcome tally. In-flight tasks
    /// left behind at shutdown are abandoned; the startup snapshots make a
    /// rerun of the same resources cheap.
    pub async fn run(mut self) -> ProcessorStats {
        info!("media processor started");
        let meta_handle = self.batcher.take().map(|batcher| tokio::spawn(batcher.run()));

        let mut stats = ProcessorStats::default();
        let mut pending = FuturesUnordered::new();
        loop {
            if self.shutdown.is_triggered() {
                break;
            }
            while let Ok(job) = self.rx.try_recv() {
                let ctx = Arc::clone(&self.ctx);
                let semaphore = Arc::clone(&self.semaphore);
                pending.push(tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    process_job(ctx, job).await
                }));
            }
            if !pending.is_empty() {
                if let Some(joined) = pending.next().await {
                    match joined {
                        Ok(outcome) => stats.record(outcome),
                        Err(err) => {
                            error!(error = %err, "processing task panicked");
                            stats.errors += 1;
                        }
                    }
                }
            } else {
                self.idle().await;
            }
        }

        info!(
            generated = stats.generated,
            skipped = stats.skipped,
            errors = stats.errors,
            "media processor stopped"
        );
        if let Some(handle) = meta_handle {
            let _ = handle.await;
        }
        stats
    }

    async fn idle(&self) {
        let slice = Duration::from_millis(200);
        let mut remaining = self.idle_sleep;
        while !remaining.is_zero() {
            if self.shutdown.is_triggered() {
                return;
            }
            let step = remaining.min(slice);
            sleep(step).await;
            remaining -= step;
        }
    }
}

async fn process_job(ctx: Arc<TaskContext>, job: MediaJob) -> TaskOutcome {
    match run_task(&ctx, &job).await {
        Ok(outcome) => outcome,
        Err(err) => {
            error!(id = %job.id, error = %err, "media task failed");
            TaskOutcome::Error
        }
    }
}

async fn run_task(ctx: &TaskContext, job: &MediaJob) -> ProcessorResult<TaskOutcome> {
    let temp_path = ctx.temp_dir.join(format!("{}.mp4", job.id));
    let thumb_name = format!("{}.png", job.id);
    let thumb_path = ctx.thumb_dir.join(&thumb_name);

    let duration_known = ctx.durations.contains(&job.id);
    let thumb_known = ctx.known_thumbs.contains(&job.id);
    if duration_known && thumb_known {
        debug!(id = %job.id, "duration and thumbnail already recorded, skipping");
        return Ok(TaskOutcome::Skipped);
    }

    if !path_exists(&temp_path).await {
        debug!(id = %job.id, "downloading media");
        fetch_to_file(&ctx.http_client, &job.url, &temp_path).await?;
    }

    let mut produced = false;

    if !duration_known {
        match ctx.probe.duration(&temp_path).await {
            Ok(length) => {
                let entry = DurationEntry {
                    id: job.id.clone(),
                    length,
                };
                if ctx.meta_tx.send(entry).await.is_ok() {
                    debug!(id = %job.id, length, "duration probed");
                    produced = true;
                } else {
                    warn!(id = %job.id, "duration queue closed, value dropped");
                }
            }
            Err(err) => {
                warn!(id = %job.id, error = %err, "duration probe failed, left unknown");
            }
        }
    }

    if !thumb_known {
        match ctx.probe.extract_thumbnail(&temp_path, &thumb_path).await {
            Ok(()) => match image::image_dimensions(&thumb_path) {
                Ok((width, height)) => {
                    debug!(id = %job.id, width, height, "thumbnail extracted");
                    produced = true;
                }
                Err(err) => {
                    warn!(id = %job.id, error = %err, "extracted frame does not decode, discarding");
                    let _ = fs::remove_file(&thumb_path).await;
                }
            },
            Err(err) => {
                warn!(id = %job.id, error = %err, "thumbnail extraction failed, left unknown");
            }
        }
    }

    if path_exists(&temp_path).await {
        if let Err(err) = fs::remove_file(&temp_path).await {
            warn!(id = %job.id, error = %err, "failed to remove temporary download");
        }
    }

    if path_exists(&thumb_path).await {
        let already_uploaded = ctx
            .uploaded
            .lock()
            .map(|set| set.contains(&thumb_name))
            .unwrap_or(false);
        if !already_uploaded {
            match ctx.thumbs.upload(&thumb_name, &thumb_path).await {
                Ok(()) => {
                    if let Ok(mut set) = ctx.uploaded.lock() {
                        set.insert(thumb_name.clone());
                    }
                    debug!(id = %job.id, "thumbnail uploaded");
                }
                Err(err) => warn!(id = %job.id, error = %err, "thumbnail upload failed"),
            }
        }
    }

    Ok(if produced {
        TaskOutcome::Generated
    } else {
        TaskOutcome::Skipped
    })
}

async fn path_exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}

/// Streams a URL to a local file. `file://` URLs are copied directly, which
/// tests lean on.
async fn fetch_to_file(client: &Client, url: &str, path: &Path) -> ProcessorResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|source| ProcessorError::Io {
                source,
                path: parent.to_path_buf(),
            })?;
    }
    if let Ok(parsed) = Url::parse(url) {
        if parsed.scheme() == "file" {
            let source_path = parsed
                .to_file_path()
                .map_err(|_| ProcessorError::Download("invalid file url".into()))?;
            fs::copy(&source_path, path)
                .await
                .map_err(|source| ProcessorError::Io {
                    source,
                    path: path.to_path_buf(),
                })?;
            return Ok(());
        }
    }
    let response = client.get(url).send().await?.error_for_status()?;
    let mut stream = response.bytes_stream();
    let mut file = fs::File::create(path)
        .await
        .map_err(|source| ProcessorError::Io {
            source,
            path: path.to_path_buf(),
        })?;
    while let Some(chunk) = stream.next().await {
        let data = chunk?;
        file.write_all(&data)
            .await
            .map_err(|source| ProcessorError::Io {
                source,
                path: path.to_path_buf(),
            })?;
    }
    Ok(())
}
