use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Output};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::sleep;

use clipvault_core::config::ProcessorSection;
use clipvault_core::{
    ArchiveStore, CommandExecutor, LocalThumbnailStore, MediaJob, MediaProcessor, MessageDraft,
    ProcessorStats, Shutdown, ThumbnailStore,
};

/// Stands in for ffprobe/ffmpeg: probing reports a fixed duration, frame
/// extraction writes a real PNG at the requested output path.
#[derive(Default)]
struct StubExecutor {
    invocations: Mutex<Vec<String>>,
}

impl StubExecutor {
    fn count(&self) -> usize {
        self.invocations.lock().unwrap().len()
    }
}

#[async_trait]
impl CommandExecutor for StubExecutor {
    async fn run(&self, command: &mut Command) -> io::Result<Output> {
        let std_command = command.as_std();
        let program = std_command.get_program().to_string_lossy().to_string();
        let args: Vec<String> = std_command
            .get_args()
            .map(|arg| arg.to_string_lossy().to_string())
            .collect();
        self.invocations.lock().unwrap().push(program.clone());

        if program.contains("ffprobe") {
            return Ok(Output {
                status: ExitStatus::from_raw(0),
                stdout: b"12.500000\n".to_vec(),
                stderr: Vec::new(),
            });
        }
        let output_path = args.last().cloned().unwrap_or_default();
        image::RgbImage::new(4, 4)
            .save(&output_path)
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
        Ok(Output {
            status: ExitStatus::from_raw(0),
            stdout: Vec::new(),
            stderr: Vec::new(),
        })
    }
}

fn config() -> ProcessorSection {
    ProcessorSection {
        max_concurrent_tasks: 2,
        thumbnail_width: 420,
        frame_offset_s: 0.0,
        subprocess_timeout_s: 5,
        idle_sleep_ms: 50,
        metadata_batch_size: 50,
        metadata_flush_interval_s: 60,
        ffprobe: "ffprobe".into(),
        ffmpeg: "ffmpeg".into(),
    }
}

fn draft(id: &str, url: &str) -> MessageDraft {
    MessageDraft {
        id: id.into(),
        platform_message_id: format!("msg-{id}"),
        poster_name: "gamer".into(),
        posted_at: 1700000000.0,
        permalink: String::new(),
        description: String::new(),
        attachment_url: url.into(),
        filename: id.into(),
        expire_at: None,
        channel_id: "chan-1".into(),
    }
}

struct Pipeline {
    store: ArchiveStore,
    thumbs: Arc<LocalThumbnailStore>,
    executor: Arc<StubExecutor>,
    base: PathBuf,
}

impl Pipeline {
    fn new(dir: &TempDir) -> Self {
        let store = ArchiveStore::new(dir.path().join("archive.sqlite")).unwrap();
        store.initialize().unwrap();
        Self {
            store,
            thumbs: Arc::new(LocalThumbnailStore::new(dir.path().join("bucket"))),
            executor: Arc::new(StubExecutor::default()),
            base: dir.path().to_path_buf(),
        }
    }

    /// Runs one processor lifetime over the given jobs and returns the tally.
    async fn run_jobs(&self, jobs: Vec<MediaJob>) -> ProcessorStats {
        let (tx, rx) = mpsc::channel(64);
        let shutdown = Shutdown::new();
        let processor = MediaProcessor::initialize(
            rx,
            self.store.clone(),
            self.thumbs.clone(),
            &config(),
            self.base.join("temp"),
            self.base.join("thumb"),
            64,
            Some(self.executor.clone()),
            shutdown.clone(),
        )
        .await
        .expect("initialize processor");
        let handle = tokio::spawn(processor.run());

        for job in jobs {
            tx.send(job).await.unwrap();
        }
        // Stop once tool activity has settled for a few polls.
        let mut last = self.executor.count();
        let mut stable = 0;
        for _ in 0..100 {
            sleep(Duration::from_millis(50)).await;
            let now = self.executor.count();
            if now == last {
                stable += 1;
            } else {
                stable = 0;
                last = now;
            }
            if stable >= 6 {
                break;
            }
        }
        shutdown.trigger();
        handle.await.unwrap()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn new_attachment_yields_one_duration_and_one_thumbnail() {
    let dir = TempDir::new().unwrap();
    let pipeline = Pipeline::new(&dir);

    let source = dir.path().join("source.mp4");
    std::fs::write(&source, b"not really a video").unwrap();
    let url = format!("file://{}", source.display());

    pipeline.store.upsert_messages(&[draft("abc123", &url)]).unwrap();
    let stats = pipeline
        .run_jobs(vec![MediaJob {
            id: "abc123".into(),
            url,
        }])
        .await;

    assert_eq!(stats.generated, 1);
    assert_eq!(stats.errors, 0);

    let ids = pipeline.thumbs.list_ids().await.unwrap();
    assert!(ids.contains("abc123"));

    let record = pipeline.store.get_resource("abc123").unwrap().unwrap();
    assert_eq!(record.duration_s, Some(12.5));

    // One probe plus one extraction.
    assert_eq!(pipeline.executor.count(), 2);
    // The temporary download is gone.
    assert!(!dir.path().join("temp/abc123.mp4").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_observation_skips_all_work() {
    let dir = TempDir::new().unwrap();
    let pipeline = Pipeline::new(&dir);

    let source = dir.path().join("source.mp4");
    std::fs::write(&source, b"not really a video").unwrap();
    let url = format!("file://{}", source.display());

    pipeline.store.upsert_messages(&[draft("abc123", &url)]).unwrap();
    pipeline
        .run_jobs(vec![MediaJob {
            id: "abc123".into(),
            url: url.clone(),
        }])
        .await;
    let invocations_after_first = pipeline.executor.count();

    // Remove the source: any attempted re-download would now fail loudly.
    std::fs::remove_file(&source).unwrap();

    let stats = pipeline
        .run_jobs(vec![MediaJob {
            id: "abc123".into(),
            url,
        }])
        .await;

    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.generated, 0);
    assert_eq!(stats.errors, 0);
    assert_eq!(pipeline.executor.count(), invocations_after_first);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn download_failure_is_contained_to_the_task() {
    let dir = TempDir::new().unwrap();
    let pipeline = Pipeline::new(&dir);

    let missing = dir.path().join("nope.mp4");
    let good = dir.path().join("good.mp4");
    std::fs::write(&good, b"bytes").unwrap();
    let good_url = format!("file://{}", good.display());

    pipeline.store.upsert_messages(&[draft("good", &good_url)]).unwrap();
    let stats = pipeline
        .run_jobs(vec![
            MediaJob {
                id: "broken".into(),
                url: format!("file://{}", missing.display()),
            },
            MediaJob {
                id: "good".into(),
                url: good_url,
            },
        ])
        .await;

    assert_eq!(stats.errors, 1);
    assert_eq!(stats.generated, 1);

    let ids = pipeline.thumbs.list_ids().await.unwrap();
    assert!(ids.contains("good"));
    assert!(!ids.contains("broken"));
}
