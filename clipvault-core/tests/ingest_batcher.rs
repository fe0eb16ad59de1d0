use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::sleep;

use clipvault_core::config::IngestSection;
use clipvault_core::{ArchiveStore, IngestBatcher, MessageDraft, PosterDraft, Shutdown};

fn store(dir: &TempDir) -> ArchiveStore {
    let store = ArchiveStore::new(dir.path().join("archive.sqlite")).unwrap();
    store.initialize().unwrap();
    store
}

fn section(batch_size: usize, flush_interval_s: u64) -> IngestSection {
    IngestSection {
        batch_size,
        flush_interval_s,
        poll_timeout_ms: 20,
    }
}

fn pair(id: &str, poster: &str, avatar: &str) -> (MessageDraft, PosterDraft) {
    (
        MessageDraft {
            id: id.into(),
            platform_message_id: format!("msg-{id}"),
            poster_name: poster.into(),
            posted_at: 1700000000.0,
            permalink: String::new(),
            description: String::new(),
            attachment_url: format!("https://cdn.example.com/{id}.mp4"),
            filename: id.into(),
            expire_at: None,
            channel_id: "chan-1".into(),
        },
        PosterDraft {
            name: poster.into(),
            avatar_url: Some(avatar.into()),
        },
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn size_threshold_flushes_without_waiting() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir);
    let (tx, rx) = mpsc::channel(64);
    let shutdown = Shutdown::new();
    // Interval far in the future; only the size threshold can flush.
    let batcher = IngestBatcher::new(rx, store.clone(), section(5, 3600), shutdown.clone());
    let handle = tokio::spawn(batcher.run());

    for i in 0..5 {
        tx.send(pair(&format!("id-{i}"), "gamer", "a.png"))
            .await
            .unwrap();
    }
    let mut flushed = 0;
    for _ in 0..50 {
        sleep(Duration::from_millis(50)).await;
        flushed = store.summary().unwrap().resources;
        if flushed == 5 {
            break;
        }
    }
    assert_eq!(flushed, 5);

    shutdown.trigger();
    handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn interval_flushes_a_partial_batch() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir);
    let (tx, rx) = mpsc::channel(64);
    let shutdown = Shutdown::new();
    let batcher = IngestBatcher::new(rx, store.clone(), section(1000, 1), shutdown.clone());
    let handle = tokio::spawn(batcher.run());

    tx.send(pair("only", "gamer", "a.png")).await.unwrap();
    tx.send(pair("pair", "gamer", "a.png")).await.unwrap();

    let mut flushed = 0;
    for _ in 0..80 {
        sleep(Duration::from_millis(50)).await;
        flushed = store.summary().unwrap().resources;
        if flushed == 2 {
            break;
        }
    }
    assert_eq!(flushed, 2);

    shutdown.trigger();
    handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn poster_dedup_keeps_first_observation_per_window() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir);
    let (tx, rx) = mpsc::channel(64);
    let shutdown = Shutdown::new();
    let batcher = IngestBatcher::new(rx, store.clone(), section(2, 3600), shutdown.clone());
    let handle = tokio::spawn(batcher.run());

    tx.send(pair("one", "gamer", "first.png")).await.unwrap();
    tx.send(pair("two", "gamer", "second.png")).await.unwrap();

    let mut posters = Vec::new();
    for _ in 0..50 {
        sleep(Duration::from_millis(50)).await;
        posters = store.list_posters(None).unwrap();
        if !posters.is_empty() {
            break;
        }
    }
    assert_eq!(posters.len(), 1);
    assert_eq!(posters[0].avatar_url.as_deref(), Some("first.png"));

    shutdown.trigger();
    handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_flushes_whatever_is_buffered() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir);
    let (tx, rx) = mpsc::channel(64);
    let shutdown = Shutdown::new();
    // Thresholds that would never fire on their own during the test.
    let batcher = IngestBatcher::new(rx, store.clone(), section(1000, 3600), shutdown.clone());
    let handle = tokio::spawn(batcher.run());

    tx.send(pair("buffered", "gamer", "a.png")).await.unwrap();
    sleep(Duration::from_millis(200)).await;
    assert_eq!(store.summary().unwrap().resources, 0);

    shutdown.trigger();
    handle.await.unwrap();
    assert_eq!(store.summary().unwrap().resources, 1);
}
