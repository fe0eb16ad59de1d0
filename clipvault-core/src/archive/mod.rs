mod models;

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use flate2::{write::GzEncoder, Compression};
use rusqlite::{params, Connection, OpenFlags};
use thiserror::Error;
use tracing::warn;

use crate::sqlite::configure_connection;

pub use models::{DurationEntry, MessageDraft, PosterDraft, PosterRecord, ResourceRecord};

const ARCHIVE_SCHEMA: &str = include_str!("../../../sql/archive.sql");

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("failed to open archive database {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("failed to execute statement on archive database: {0}")]
    Execute(#[from] rusqlite::Error),
    #[error("archive path not configured")]
    MissingStore,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type ArchiveResult<T> = Result<T, ArchiveError>;

#[derive(Debug, Clone, Default)]
pub struct ResourceFilter {
    pub poster: Option<String>,
    pub channel: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ArchiveSummary {
    pub resources: i64,
    pub posters: i64,
    pub durations_recorded: i64,
    pub with_expiry: i64,
    pub next_expire_at: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct ArchiveStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for ArchiveStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl ArchiveStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> ArchiveResult<ArchiveStore> {
        let path = self.path.ok_or(ArchiveError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Ok(ArchiveStore { path, flags })
    }
}

/// Durable store for resource and poster records. Connections are opened per
/// call; the store handle itself is cheap to clone across components.
#[derive(Debug, Clone)]
pub struct ArchiveStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl ArchiveStore {
    pub fn builder() -> ArchiveStoreBuilder {
        ArchiveStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> ArchiveResult<Self> {
        ArchiveStoreBuilder::new().path(path).build()
    }

    fn open(&self) -> ArchiveResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            ArchiveError::Open {
                source,
                path: self.path.clone(),
            }
        })?;
        configure_connection(&conn).map_err(|source| ArchiveError::Open {
            source,
            path: self.path.clone(),
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> ArchiveResult<()> {
        let conn = self.open()?;
        conn.execute_batch(ARCHIVE_SCHEMA)?;
        Ok(())
    }

    pub fn upsert_message(&self, draft: &MessageDraft) -> ArchiveResult<()> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        upsert_message_tx(&tx, draft)?;
        tx.commit()?;
        Ok(())
    }

    /// Batched upsert. Drafts without an id are skipped individually; the rest
    /// commit as one transaction. Returns the number of rows written.
    pub fn upsert_messages(&self, drafts: &[MessageDraft]) -> ArchiveResult<usize> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let mut written = 0;
        for draft in drafts {
            if draft.id.is_empty() {
                warn!(poster = %draft.poster_name, "skipping message draft without id");
                continue;
            }
            upsert_message_tx(&tx, draft)?;
            written += 1;
        }
        tx.commit()?;
        Ok(written)
    }

    /// Batched poster upsert, last write wins. Drafts without a name are
    /// skipped individually.
    pub fn upsert_posters(&self, drafts: &[PosterDraft]) -> ArchiveResult<usize> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let mut written = 0;
        for draft in drafts {
            if draft.name.is_empty() {
                warn!("skipping poster draft without name");
                continue;
            }
            tx.execute(
                "INSERT INTO posters (name, avatar_url, updated_at)
                 VALUES (?1, ?2, CURRENT_TIMESTAMP)
                 ON CONFLICT(name) DO UPDATE SET
                     avatar_url = excluded.avatar_url,
                     updated_at = CURRENT_TIMESTAMP",
                params![&draft.name, &draft.avatar_url],
            )?;
            written += 1;
        }
        tx.commit()?;
        Ok(written)
    }

    /// Batched duration update. Entries whose resource row does not exist are
    /// skipped with a warning; the rest commit together.
    pub fn apply_durations(&self, entries: &[DurationEntry]) -> ArchiveResult<usize> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let mut written = 0;
        for entry in entries {
            let affected = tx.execute(
                "UPDATE resources SET duration_s = ?2, updated_at = CURRENT_TIMESTAMP
                 WHERE id = ?1",
                params![&entry.id, entry.length],
            )?;
            if affected == 0 {
                warn!(id = %entry.id, "no resource row for duration entry, skipping");
            } else {
                written += 1;
            }
        }
        tx.commit()?;
        Ok(written)
    }

    pub fn get_resource(&self, id: &str) -> ArchiveResult<Option<ResourceRecord>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT * FROM resources WHERE id = ?1")?;
        let mut rows = stmt.query([id])?;
        match rows.next()? {
            Some(row) => Ok(Some(ResourceRecord::from_row(row)?)),
            None => Ok(None),
        }
    }

    pub fn list_resources(&self, filter: &ResourceFilter) -> ArchiveResult<Vec<ResourceRecord>> {
        let conn = self.open()?;
        let mut query = String::from("SELECT * FROM resources");
        let mut clauses = Vec::new();
        let mut params: Vec<rusqlite::types::Value> = Vec::new();
        if let Some(poster) = &filter.poster {
            clauses.push(format!("poster_name = ?{}", params.len() + 1));
            params.push(rusqlite::types::Value::Text(poster.clone()));
        }
        if let Some(channel) = &filter.channel {
            clauses.push(format!("channel_id = ?{}", params.len() + 1));
            params.push(rusqlite::types::Value::Text(channel.clone()));
        }
        if !clauses.is_empty() {
            query.push_str(" WHERE ");
            query.push_str(&clauses.join(" AND "));
        }
        query.push_str(" ORDER BY posted_at DESC");
        if let Some(limit) = filter.limit {
            query.push_str(&format!(" LIMIT ?{}", params.len() + 1));
            params.push(rusqlite::types::Value::Integer(limit as i64));
        }
        let mut stmt = conn.prepare(&query)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(
            params.iter().map(|value| value as &dyn rusqlite::ToSql),
        ))?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(ResourceRecord::from_row(row)?);
        }
        Ok(records)
    }

    /// Full scan used by refetch seeding.
    pub fn all_resources(&self) -> ArchiveResult<Vec<ResourceRecord>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT * FROM resources")?;
        let mut rows = stmt.query([])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(ResourceRecord::from_row(row)?);
        }
        Ok(records)
    }

    /// Snapshot of all recorded durations, used as the processor's
    /// idempotency cache at startup.
    pub fn all_durations(&self) -> ArchiveResult<HashMap<String, f64>> {
        let conn = self.open()?;
        let mut stmt =
            conn.prepare("SELECT id, duration_s FROM resources WHERE duration_s IS NOT NULL")?;
        let mut rows = stmt.query([])?;
        let mut durations = HashMap::new();
        while let Some(row) = rows.next()? {
            let id: String = row.get(0)?;
            let length: f64 = row.get(1)?;
            durations.insert(id, length);
        }
        Ok(durations)
    }

    pub fn expiring_before(&self, cutoff: i64, limit: usize) -> ArchiveResult<Vec<ResourceRecord>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM resources WHERE expire_at IS NOT NULL AND expire_at <= ?1
             ORDER BY expire_at ASC LIMIT ?2",
        )?;
        let mut rows = stmt.query(params![cutoff, limit as i64])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(ResourceRecord::from_row(row)?);
        }
        Ok(records)
    }

    pub fn list_posters(&self, limit: Option<usize>) -> ArchiveResult<Vec<PosterRecord>> {
        let conn = self.open()?;
        let mut query = String::from("SELECT * FROM posters ORDER BY name ASC");
        if let Some(limit) = limit {
            query.push_str(&format!(" LIMIT {limit}"));
        }
        let mut stmt = conn.prepare(&query)?;
        let mut rows = stmt.query([])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(PosterRecord::from_row(row)?);
        }
        Ok(records)
    }

    pub fn summary(&self) -> ArchiveResult<ArchiveSummary> {
        let conn = self.open()?;
        let resources = conn.query_row("SELECT COUNT(*) FROM resources", [], |row| row.get(0))?;
        let posters = conn.query_row("SELECT COUNT(*) FROM posters", [], |row| row.get(0))?;
        let durations_recorded = conn.query_row(
            "SELECT COUNT(*) FROM resources WHERE duration_s IS NOT NULL",
            [],
            |row| row.get(0),
        )?;
        let with_expiry = conn.query_row(
            "SELECT COUNT(*) FROM resources WHERE expire_at IS NOT NULL",
            [],
            |row| row.get(0),
        )?;
        let next_expire_at = conn.query_row(
            "SELECT MIN(expire_at) FROM resources WHERE expire_at IS NOT NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(ArchiveSummary {
            resources,
            posters,
            durations_recorded,
            with_expiry,
            next_expire_at,
        })
    }

    /// Writes a gzip'd SQL dump of both tables, suitable for re-applying with
    /// the sqlite shell.
    pub fn export_backup(&self, output: impl AsRef<Path>) -> ArchiveResult<()> {
        let output = output.as_ref();
        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = self.open()?;
        let mut dump = String::new();
        dump.push_str(ARCHIVE_SCHEMA);
        dump.push('\n');
        dump.push_str("BEGIN;\n");

        for record in self.all_resources()? {
            dump.push_str(&format!(
                "INSERT INTO resources (id, platform_message_id, poster_name, posted_at, permalink, description, attachment_url, filename, expire_at, channel_id, duration_s) VALUES ({}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {});\n",
                sql_quote(&record.id),
                sql_quote(&record.platform_message_id),
                sql_quote(&record.poster_name),
                record.posted_at,
                format_optional_text(record.permalink),
                format_optional_text(record.description),
                sql_quote(&record.attachment_url),
                format_optional_text(record.filename),
                format_optional_integer(record.expire_at),
                sql_quote(&record.channel_id),
                format_optional_float(record.duration_s),
            ));
        }
        {
            let mut stmt = conn.prepare("SELECT name, avatar_url FROM posters ORDER BY name")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let name: String = row.get(0)?;
                let avatar: Option<String> = row.get(1)?;
                dump.push_str(&format!(
                    "INSERT INTO posters (name, avatar_url) VALUES ({}, {});\n",
                    sql_quote(&name),
                    format_optional_text(avatar),
                ));
            }
        }
        dump.push_str("COMMIT;\n");

        let file = File::create(output)?;
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_all(dump.as_bytes())?;
        encoder.finish()?;
        Ok(())
    }
}

fn upsert_message_tx(conn: &Connection, draft: &MessageDraft) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO resources (
            id, platform_message_id, poster_name, posted_at, permalink,
            description, attachment_url, filename, expire_at, channel_id
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        ON CONFLICT(id) DO UPDATE SET
            platform_message_id = excluded.platform_message_id,
            poster_name = excluded.poster_name,
            posted_at = excluded.posted_at,
            permalink = excluded.permalink,
            description = excluded.description,
            attachment_url = excluded.attachment_url,
            filename = excluded.filename,
            expire_at = excluded.expire_at,
            channel_id = excluded.channel_id,
            updated_at = CURRENT_TIMESTAMP",
        params![
            &draft.id,
            &draft.platform_message_id,
            &draft.poster_name,
            draft.posted_at,
            &draft.permalink,
            &draft.description,
            &draft.attachment_url,
            &draft.filename,
            &draft.expire_at,
            &draft.channel_id,
        ],
    )?;
    Ok(())
}

fn sql_quote(value: &str) -> String {
    let escaped = value.replace('\'', "''");
    format!("'{}'", escaped)
}

fn format_optional_integer(value: Option<i64>) -> String {
    value
        .map(|v| v.to_string())
        .unwrap_or_else(|| "NULL".to_string())
}

fn format_optional_float(value: Option<f64>) -> String {
    value
        .map(|v| v.to_string())
        .unwrap_or_else(|| "NULL".to_string())
}

fn format_optional_text(value: Option<String>) -> String {
    value
        .map(|v| sql_quote(&v))
        .unwrap_or_else(|| "NULL".to_string())
}
