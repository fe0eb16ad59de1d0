use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::archive::{ArchiveError, ArchiveStore};
use crate::config::RefetchSection;
use crate::harvester::Shutdown;
use crate::ingest::identity;
use crate::platform::{extract_message, ExtractSinks, PlatformClient};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),
}

/// Request to track one resource for re-fetching around its expiry instant.
/// `expire_at` is `None` when the observed URL carried no decodable expiry;
/// such requests never reach the schedule.
#[derive(Debug, Clone)]
pub struct RefetchRequest {
    pub resource_id: String,
    pub platform_message_id: String,
    pub channel_id: String,
    pub expire_at: Option<i64>,
}

/// Schedule entry ordered by expiry instant, soonest first when wrapped in
/// `Reverse` on the heap.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct ScheduleEntry {
    expire_at: i64,
    resource_id: String,
    platform_message_id: String,
    channel_id: String,
}

/// Terminal state of one dispatched re-fetch. Entries leave the working set
/// either way; a fresh entry only reappears when the refreshed attachment
/// still carries an expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefetchOutcome {
    Updated,
    Failed,
}

/// Tracks every known resource by expiry instant and re-fetches each one
/// through the live platform session once its signed URL has lapsed. Due
/// entries are only processed after a full quiet window with no new input,
/// so a history backfill finishes flowing in before re-fetch traffic starts.
pub struct RefetchScheduler {
    rx: mpsc::Receiver<RefetchRequest>,
    client: Arc<dyn PlatformClient>,
    sinks: ExtractSinks,
    media_extension: String,
    config: RefetchSection,
    shutdown: Shutdown,
    heap: BinaryHeap<Reverse<ScheduleEntry>>,
    last_input_at: Option<Instant>,
}

impl RefetchScheduler {
    pub fn new(
        rx: mpsc::Receiver<RefetchRequest>,
        client: Arc<dyn PlatformClient>,
        sinks: ExtractSinks,
        media_extension: String,
        config: RefetchSection,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            rx,
            client,
            sinks,
            media_extension,
            config,
            shutdown,
            heap: BinaryHeap::new(),
            last_input_at: None,
        }
    }

    /// Number of entries currently awaiting their expiry instant.
    pub fn pending(&self) -> usize {
        self.heap.len()
    }

    /// Loads every persisted resource that can be scheduled; rows missing the
    /// expiry, message id, or channel id are skipped with a warning. Seeding
    /// counts as input so the first processing pass waits one quiet window.
    pub fn seed_from_store(&mut self, store: &ArchiveStore) -> Result<usize, SchedulerError> {
        info!("seeding refetch schedule from archive");
        let mut seeded = 0;
        for record in store.all_resources()? {
            if !record.schedulable() {
                warn!(id = %record.id, "resource missing refetch fields, skipping");
                continue;
            }
            self.heap.push(Reverse(ScheduleEntry {
                expire_at: record.expire_at.unwrap_or_default(),
                resource_id: record.id,
                platform_message_id: record.platform_message_id,
                channel_id: record.channel_id,
            }));
            seeded += 1;
        }
        if seeded > 0 {
            self.last_input_at = Some(Instant::now());
        }
        info!(seeded, "refetch schedule seeded");
        Ok(seeded)
    }

    /// Moves everything waiting on the input queue into the schedule.
    /// Requests without a numeric expiry are dropped with a logged error.
    pub fn drain_input(&mut self) {
        while let Ok(request) = self.rx.try_recv() {
            self.last_input_at = Some(Instant::now());
            let Some(expire_at) = request.expire_at else {
                error!(
                    id = %request.resource_id,
                    "invalid expiry for scheduled resource, dropping"
                );
                continue;
            };
            debug!(id = %request.resource_id, expire_at, "resource scheduled for refetch");
            self.heap.push(Reverse(ScheduleEntry {
                expire_at,
                resource_id: request.resource_id,
                platform_message_id: request.platform_message_id,
                channel_id: request.channel_id,
            }));
        }
    }

    /// True when at least one quiet window has elapsed since the last input
    /// (or none has ever arrived).
    pub fn quiet(&self) -> bool {
        self.last_input_at
            .map(|at| at.elapsed() >= self.config.quiet_window())
            .unwrap_or(true)
    }

    /// Pops and re-fetches every entry whose expiry instant has passed,
    /// pacing dispatches to stay inside the platform's rate limits.
    pub async fn process_due(&mut self, now: i64) -> usize {
        let mut dispatched = 0;
        while self
            .heap
            .peek()
            .map(|Reverse(entry)| entry.expire_at <= now)
            .unwrap_or(false)
        {
            let Some(Reverse(entry)) = self.heap.pop() else {
                break;
            };
            debug!(
                id = %entry.resource_id,
                channel = %entry.channel_id,
                "entry due, refetching"
            );
            let outcome = self.refetch(&entry).await;
            debug!(id = %entry.resource_id, ?outcome, "refetch finished");
            dispatched += 1;
            if !self.config.pacing_delay().is_zero() {
                sleep(self.config.pacing_delay()).await;
            }
        }
        dispatched
    }

    /// One re-fetch through the live session. The platform message id and
    /// channel id are the addressable key; the resource id is only ours.
    /// Failures drop the entry permanently: a deleted or inaccessible source
    /// message will not come back on retry.
    async fn refetch(&self, entry: &ScheduleEntry) -> RefetchOutcome {
        match self
            .client
            .fetch_message(&entry.channel_id, &entry.platform_message_id)
            .await
        {
            Ok(message) => {
                let refreshed = message
                    .attachments
                    .iter()
                    .any(|a| identity::decode_expiry(&a.url).is_some());
                let taken = extract_message(&message, &self.media_extension, &self.sinks).await;
                debug!(
                    id = %entry.resource_id,
                    attachments = taken,
                    rescheduled = refreshed,
                    "refetched message re-entered extraction"
                );
                RefetchOutcome::Updated
            }
            Err(err) => {
                warn!(
                    id = %entry.resource_id,
                    channel = %entry.channel_id,
                    error = %err,
                    "refetch failed, dropping entry"
                );
                RefetchOutcome::Failed
            }
        }
    }

    pub async fn run(mut self, store: Option<&ArchiveStore>) {
        info!("refetch scheduler started");
        if !self.config.live_history {
            if let Some(store) = store {
                if let Err(err) = self.seed_from_store(store) {
                    error!(error = %err, "failed to seed refetch schedule");
                }
            }
        }
        loop {
            if self.shutdown.is_triggered() {
                break;
            }
            self.drain_input();
            if self.quiet() {
                let now = Utc::now().timestamp();
                let dispatched = self.process_due(now).await;
                if dispatched > 0 {
                    info!(dispatched, pending = self.pending(), "processed due entries");
                }
            }
            self.idle().await;
        }
        info!(pending = self.pending(), "refetch scheduler stopped");
    }

    /// Sleeps one check interval in short slices so shutdown stays responsive.
    async fn idle(&self) {
        let slice = Duration::from_millis(200);
        let mut remaining = self.config.check_interval();
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
