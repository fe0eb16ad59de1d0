use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::Row;
use serde::{Deserialize, Serialize};

/// Write model for one observed attachment, produced by the extraction path.
/// The same draft is used for first observation and for refreshed re-fetches;
/// upserting it never touches a previously recorded duration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageDraft {
    pub id: String,
    pub platform_message_id: String,
    pub poster_name: String,
    pub posted_at: f64,
    pub permalink: String,
    pub description: String,
    pub attachment_url: String,
    pub filename: String,
    pub expire_at: Option<i64>,
    pub channel_id: String,
}

/// Write model for the author of an observed attachment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PosterDraft {
    pub name: String,
    pub avatar_url: Option<String>,
}

/// Read model for a stored resource row.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceRecord {
    pub id: String,
    pub platform_message_id: String,
    pub poster_name: String,
    pub posted_at: f64,
    pub permalink: Option<String>,
    pub description: Option<String>,
    pub attachment_url: String,
    pub filename: Option<String>,
    pub expire_at: Option<i64>,
    pub channel_id: String,
    pub duration_s: Option<f64>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl ResourceRecord {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            platform_message_id: row.get("platform_message_id")?,
            poster_name: row.get("poster_name")?,
            posted_at: row.get("posted_at")?,
            permalink: row.get("permalink")?,
            description: row.get("description")?,
            attachment_url: row.get("attachment_url")?,
            filename: row.get("filename")?,
            expire_at: row.get("expire_at")?,
            channel_id: row.get("channel_id")?,
            duration_s: row.get("duration_s")?,
            created_at: parse_timestamp(row.get("created_at")?),
            updated_at: parse_timestamp(row.get("updated_at")?),
        })
    }

    /// True when the row carries everything the refetch scheduler needs.
    pub fn schedulable(&self) -> bool {
        self.expire_at.is_some()
            && !self.platform_message_id.is_empty()
            && !self.channel_id.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PosterRecord {
    pub name: String,
    pub avatar_url: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl PosterRecord {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            name: row.get("name")?,
            avatar_url: row.get("avatar_url")?,
            updated_at: parse_timestamp(row.get("updated_at")?),
        })
    }
}

/// One recorded duration, keyed by resource id.
#[derive(Debug, Clone, PartialEq)]
pub struct DurationEntry {
    pub id: String,
    pub length: f64,
}

fn parse_timestamp(value: Option<NaiveDateTime>) -> Option<DateTime<Utc>> {
    value.map(|dt| DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc))
}
