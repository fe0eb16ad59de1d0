use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::archive::{MessageDraft, PosterDraft};
use crate::ingest::identity;
use crate::processor::MediaJob;
use crate::refetch::RefetchRequest;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("channel {0} not accessible")]
    ChannelInaccessible(String),
    #[error("message {message_id} not found in channel {channel_id}")]
    MessageNotFound {
        channel_id: String,
        message_id: String,
    },
    #[error("platform request failed: {0}")]
    Network(String),
}

/// Live-session handle into the chat platform. The event stream and history
/// walks live with the embedding process; the core only needs fetch-by-id.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    async fn fetch_message(
        &self,
        channel_id: &str,
        message_id: &str,
    ) -> Result<PlatformMessage, PlatformError>;
}

#[derive(Debug, Clone)]
pub struct PlatformAttachment {
    pub url: String,
    pub filename: String,
}

#[derive(Debug, Clone)]
pub struct PlatformMessage {
    pub message_id: String,
    pub channel_id: String,
    pub author_name: String,
    pub author_avatar_url: Option<String>,
    pub created_at: f64,
    pub content: String,
    pub permalink: String,
    pub attachments: Vec<PlatformAttachment>,
}

/// Senders for everything the extraction path produces. Live event adapters
/// and the refetch scheduler both feed these.
#[derive(Clone)]
pub struct ExtractSinks {
    pub ingest: mpsc::Sender<(MessageDraft, PosterDraft)>,
    pub media: mpsc::Sender<MediaJob>,
    pub refetch: mpsc::Sender<RefetchRequest>,
}

/// Turns one platform message into archive drafts, media jobs, and schedule
/// requests, one set per video attachment. Returns how many attachments were
/// taken. Ingest and media sends apply backpressure; the schedule request is
/// dropped with a warning when the refetch queue is full, since the scheduler
/// itself may be the caller.
pub async fn extract_message(
    message: &PlatformMessage,
    media_extension: &str,
    sinks: &ExtractSinks,
) -> usize {
    let mut taken = 0;
    for attachment in &message.attachments {
        if !attachment.url.contains(media_extension) {
            continue;
        }
        let id = identity::resource_id(&message.author_name, message.created_at, &attachment.url);
        let expire_at = identity::decode_expiry(&attachment.url);
        if expire_at.is_none() && attachment.url.contains("?ex=") {
            warn!(id = %id, url = %attachment.url, "attachment carries a malformed expiry parameter");
        }

        let draft = MessageDraft {
            id: id.clone(),
            platform_message_id: message.message_id.clone(),
            poster_name: message.author_name.clone(),
            posted_at: message.created_at,
            permalink: message.permalink.clone(),
            description: message.content.clone(),
            attachment_url: attachment.url.clone(),
            filename: trim_extension(&attachment.filename, media_extension),
            expire_at,
            channel_id: message.channel_id.clone(),
        };
        let poster = PosterDraft {
            name: message.author_name.clone(),
            avatar_url: message.author_avatar_url.clone(),
        };

        let job = MediaJob {
            id: id.clone(),
            url: attachment.url.clone(),
        };
        if sinks.media.send(job).await.is_err() {
            warn!(id = %id, "media queue closed, dropping job");
        }
        if sinks.ingest.send((draft, poster)).await.is_err() {
            warn!(id = %id, "ingest queue closed, dropping drafts");
        }

        if let Some(expire_at) = expire_at {
            let request = RefetchRequest {
                resource_id: id.clone(),
                platform_message_id: message.message_id.clone(),
                channel_id: message.channel_id.clone(),
                expire_at: Some(expire_at),
            };
            if let Err(err) = sinks.refetch.try_send(request) {
                warn!(id = %id, error = %err, "refetch queue full, dropping schedule request");
            }
        }

        debug!(id = %id, poster = %message.author_name, "attachment extracted");
        taken += 1;
    }
    taken
}

fn trim_extension(filename: &str, extension: &str) -> String {
    filename
        .strip_suffix(extension)
        .unwrap_or(filename)
        .to_string()
}
