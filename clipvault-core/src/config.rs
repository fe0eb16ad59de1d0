use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ClipvaultConfig {
    pub system: SystemSection,
    pub paths: PathsSection,
    pub platform: PlatformSection,
    pub limits: LimitsSection,
}

impl ClipvaultConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.base_dir).join(path)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemSection {
    pub node_name: String,
    pub environment: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub base_dir: String,
    pub data_dir: String,
    pub temp_dir: String,
    pub thumb_dir: String,
    pub logs_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlatformSection {
    pub channel_ids: Vec<String>,
    pub media_extension: String,
}

impl PlatformSection {
    pub fn channel_allowed(&self, channel_id: &str) -> bool {
        self.channel_ids.iter().any(|id| id == channel_id)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsSection {
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HarvesterConfig {
    pub ingest: IngestSection,
    pub refetch: RefetchSection,
    pub processor: ProcessorSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestSection {
    pub batch_size: usize,
    pub flush_interval_s: u64,
    pub poll_timeout_ms: u64,
}

impl IngestSection {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_s)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefetchSection {
    pub check_interval_s: u64,
    pub quiet_window_s: u64,
    pub pacing_delay_ms: u64,
    pub live_history: bool,
}

impl RefetchSection {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_s)
    }

    pub fn quiet_window(&self) -> Duration {
        Duration::from_secs(self.quiet_window_s)
    }

    pub fn pacing_delay(&self) -> Duration {
        Duration::from_millis(self.pacing_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessorSection {
    pub max_concurrent_tasks: usize,
    pub thumbnail_width: u32,
    pub frame_offset_s: f64,
    pub subprocess_timeout_s: u64,
    pub idle_sleep_ms: u64,
    pub metadata_batch_size: usize,
    pub metadata_flush_interval_s: u64,
    pub ffprobe: String,
    pub ffmpeg: String,
}

impl ProcessorSection {
    pub fn subprocess_timeout(&self) -> Duration {
        Duration::from_secs(self.subprocess_timeout_s)
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }

    pub fn metadata_flush_interval(&self) -> Duration {
        Duration::from_secs(self.metadata_flush_interval_s)
    }
}

#[derive(Debug, Clone)]
pub struct ConfigBundle {
    pub clipvault: ClipvaultConfig,
    pub harvester: HarvesterConfig,
}

impl ConfigBundle {
    pub fn from_directory<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let clipvault = load_clipvault_config(dir.join("clipvault.toml"))?;
        let harvester = load_harvester_config(dir.join("harvester.toml"))?;
        Ok(Self {
            clipvault,
            harvester,
        })
    }
}

pub fn load_clipvault_config<P: AsRef<Path>>(path: P) -> Result<ClipvaultConfig> {
    load_toml(path)
}

pub fn load_harvester_config<P: AsRef<Path>>(path: P) -> Result<HarvesterConfig> {
    load_toml(path)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
