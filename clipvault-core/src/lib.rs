pub mod archive;
pub mod config;
pub mod error;
pub mod harvester;
pub mod ingest;
pub mod platform;
pub mod processor;
pub mod refetch;
pub mod sqlite;
pub mod thumbstore;

pub use archive::{
    ArchiveError, ArchiveStore, ArchiveStoreBuilder, ArchiveSummary, DurationEntry, MessageDraft,
    PosterDraft, PosterRecord, ResourceFilter, ResourceRecord,
};
pub use config::{
    load_clipvault_config, load_harvester_config, ClipvaultConfig, ConfigBundle, HarvesterConfig,
};
pub use error::{ConfigError, Result};
pub use harvester::{HarvesterHandles, Shutdown};
pub use ingest::IngestBatcher;
pub use platform::{
    extract_message, ExtractSinks, PlatformAttachment, PlatformClient, PlatformError,
    PlatformMessage,
};
pub use processor::{
    CommandExecutor, MediaJob, MediaProcessor, ProcessorError, ProcessorResult, ProcessorStats,
    SystemCommandExecutor, TaskOutcome,
};
pub use refetch::{RefetchOutcome, RefetchRequest, RefetchScheduler, SchedulerError};
pub use thumbstore::{LocalThumbnailStore, ThumbStoreError, ThumbnailStore};
