#![forbid(unsafe_code)]
#![deny(
    warnings,
    dead_code,
    unused,
    unused_imports,
    unused_must_use,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]

//! Runtime status mirror: the last-known state of every torrent and its
//! filesystem move job, persisted outside the versioned settings so a
//! restart can restore the operator view without replaying the engine.

use std::path::Path;

use anyhow::{Context, Result, anyhow};
use capstan_events::TorrentState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool, sqlite::SqliteRow, types::Json};
use tracing::warn;
use uuid::Uuid;

use crate::config;

const UPSERT_TORRENT_SQL: &str = "INSERT INTO runtime_torrent (
        torrent_id, name, state, state_message, progress_bytes_downloaded,
        progress_bytes_total, progress_eta_seconds, download_bps, upload_bps,
        ratio, sequential, library_path, download_dir, files, added_at,
        completed_at, updated_at
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
        ?15, ?16, ?17)
    ON CONFLICT (torrent_id) DO UPDATE SET
        name = excluded.name,
        state = excluded.state,
        state_message = excluded.state_message,
        progress_bytes_downloaded = excluded.progress_bytes_downloaded,
        progress_bytes_total = excluded.progress_bytes_total,
        progress_eta_seconds = excluded.progress_eta_seconds,
        download_bps = excluded.download_bps,
        upload_bps = excluded.upload_bps,
        ratio = excluded.ratio,
        sequential = excluded.sequential,
        library_path = excluded.library_path,
        download_dir = excluded.download_dir,
        files = excluded.files,
        added_at = excluded.added_at,
        completed_at = excluded.completed_at,
        updated_at = excluded.updated_at";

const SELECT_TORRENT_COLUMNS: &str = "SELECT
        torrent_id, name, state, state_message, progress_bytes_downloaded,
        progress_bytes_total, progress_eta_seconds, download_bps, upload_bps,
        ratio, sequential, library_path, download_dir, files, added_at,
        completed_at, updated_at
    FROM runtime_torrent";

const FS_JOB_STARTED_SQL: &str = "INSERT INTO runtime_fs_job (
        torrent_id, status, attempt, src_path, dst_path, transfer_mode,
        last_error, updated_at
    ) VALUES (?1, 'moving', 1, ?2, NULL, NULL, NULL, ?3)
    ON CONFLICT (torrent_id) DO UPDATE SET
        status = 'moving',
        attempt = runtime_fs_job.attempt + 1,
        src_path = excluded.src_path,
        last_error = NULL,
        updated_at = excluded.updated_at";

const FS_JOB_COMPLETED_SQL: &str = "INSERT INTO runtime_fs_job (
        torrent_id, status, attempt, src_path, dst_path, transfer_mode,
        last_error, updated_at
    ) VALUES (?1, 'moved', 1, ?2, ?3, ?4, NULL, ?5)
    ON CONFLICT (torrent_id) DO UPDATE SET
        status = 'moved',
        src_path = excluded.src_path,
        dst_path = excluded.dst_path,
        transfer_mode = excluded.transfer_mode,
        last_error = NULL,
        updated_at = excluded.updated_at";

const FS_JOB_FAILED_SQL: &str = "INSERT INTO runtime_fs_job (
        torrent_id, status, attempt, src_path, dst_path, transfer_mode,
        last_error, updated_at
    ) VALUES (?1, 'failed', 1, NULL, NULL, NULL, ?2, ?3)
    ON CONFLICT (torrent_id) DO UPDATE SET
        status = 'failed',
        last_error = excluded.last_error,
        updated_at = excluded.updated_at";

const FS_JOB_SKIPPED_SQL: &str = "INSERT INTO runtime_fs_job (
        torrent_id, status, attempt, src_path, dst_path, transfer_mode,
        last_error, updated_at
    ) VALUES (?1, 'skipped', 0, NULL, NULL, NULL, NULL, ?2)
    ON CONFLICT (torrent_id) DO UPDATE SET
        status = 'skipped',
        updated_at = excluded.updated_at";

/// Per-file selection priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilePriority {
    /// Do not download the file.
    Skip,
    /// Download with reduced priority.
    Low,
    /// Download with normal priority.
    #[default]
    Normal,
    /// Download with elevated priority.
    High,
}

/// One file inside a torrent, as last reported by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TorrentFile {
    /// Zero-based index within the torrent.
    pub index: u32,
    /// Path relative to the torrent root.
    pub path: String,
    /// Total size in bytes.
    pub size_bytes: u64,
    /// Bytes downloaded so far.
    pub bytes_completed: u64,
    /// Selection priority.
    #[serde(default)]
    pub priority: FilePriority,
    /// Whether the file is selected for download.
    pub selected: bool,
}

/// Byte-level progress of a torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TorrentProgress {
    /// Bytes downloaded so far.
    pub bytes_downloaded: u64,
    /// Total payload size in bytes.
    pub bytes_total: u64,
    /// Estimated seconds until completion, when known.
    pub eta_seconds: Option<u64>,
}

impl TorrentProgress {
    /// Completion percentage in the range `0.0..=100.0`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn percent_complete(&self) -> f64 {
        if self.bytes_total == 0 {
            0.0
        } else {
            (self.bytes_downloaded as f64 / self.bytes_total as f64) * 100.0
        }
    }
}

/// Transfer rates of a torrent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TorrentRates {
    /// Download rate in bytes per second.
    pub download_bps: u64,
    /// Upload rate in bytes per second.
    pub upload_bps: u64,
    /// Uploaded-to-downloaded ratio.
    pub ratio: f64,
}

/// Last-known status of a torrent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TorrentStatus {
    /// Torrent identifier.
    pub id: Uuid,
    /// Display name, once metadata is known.
    pub name: Option<String>,
    /// Lifecycle state.
    pub state: TorrentState,
    /// Byte-level progress.
    pub progress: TorrentProgress,
    /// Transfer rates.
    pub rates: TorrentRates,
    /// Per-file detail, when the engine has reported it.
    pub files: Option<Vec<TorrentFile>>,
    /// Final library path after import.
    pub library_path: Option<String>,
    /// Staging directory the torrent downloads into.
    pub download_dir: Option<String>,
    /// Whether sequential download is active.
    pub sequential: bool,
    /// When the torrent was added.
    pub added_at: DateTime<Utc>,
    /// When the torrent finished downloading, if it has.
    pub completed_at: Option<DateTime<Utc>>,
    /// When this snapshot was taken.
    pub last_updated: DateTime<Utc>,
}

/// Persistent mirror of engine runtime state.
///
/// Writes here never touch the settings revision; the mirror is telemetry,
/// not configuration.
#[derive(Clone)]
pub struct RuntimeStore {
    pool: SqlitePool,
}

impl RuntimeStore {
    /// Opens the store on an existing pool, applying migrations first.
    ///
    /// # Errors
    ///
    /// Returns an error when migrations cannot be applied.
    #[tracing::instrument(skip(pool))]
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        config::run_migrations(&pool)
            .await
            .context("apply runtime store migrations")?;
        Ok(Self { pool })
    }

    /// Inserts or refreshes the status snapshot for a torrent.
    ///
    /// # Errors
    ///
    /// Returns an error when the write fails.
    pub async fn upsert_status(&self, status: &TorrentStatus) -> Result<()> {
        let (state, state_message) = serialize_state(&status.state);
        sqlx::query(UPSERT_TORRENT_SQL)
            .bind(status.id.to_string())
            .bind(&status.name)
            .bind(state)
            .bind(state_message)
            .bind(clamp_i64(status.progress.bytes_downloaded))
            .bind(clamp_i64(status.progress.bytes_total))
            .bind(status.progress.eta_seconds.map(clamp_i64))
            .bind(clamp_i64(status.rates.download_bps))
            .bind(clamp_i64(status.rates.upload_bps))
            .bind(status.rates.ratio)
            .bind(status.sequential)
            .bind(&status.library_path)
            .bind(&status.download_dir)
            .bind(status.files.as_ref().map(Json))
            .bind(status.added_at)
            .bind(status.completed_at)
            .bind(status.last_updated)
            .execute(&self.pool)
            .await
            .context("upsert torrent status")?;
        Ok(())
    }

    /// Loads every persisted status snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails or a row cannot be decoded.
    pub async fn load_statuses(&self) -> Result<Vec<TorrentStatus>> {
        let rows = sqlx::query(SELECT_TORRENT_COLUMNS)
            .fetch_all(&self.pool)
            .await
            .context("load torrent statuses")?;
        rows.iter().map(map_status_row).collect()
    }

    /// Fetches the status snapshot for one torrent.
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails or the row cannot be decoded.
    pub async fn fetch_status(&self, id: Uuid) -> Result<Option<TorrentStatus>> {
        let sql = format!("{SELECT_TORRENT_COLUMNS} WHERE torrent_id = ?1");
        let row = sqlx::query(sqlx::AssertSqlSafe(sql))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("fetch torrent status")?;
        row.as_ref().map(map_status_row).transpose()
    }

    /// Removes a torrent's status snapshot and fs job record.
    ///
    /// # Errors
    ///
    /// Returns an error when a delete fails.
    pub async fn remove_torrent(&self, id: Uuid) -> Result<()> {
        let id = id.to_string();
        sqlx::query("DELETE FROM runtime_torrent WHERE torrent_id = ?1")
            .bind(&id)
            .execute(&self.pool)
            .await
            .context("remove torrent status")?;
        sqlx::query("DELETE FROM runtime_fs_job WHERE torrent_id = ?1")
            .bind(&id)
            .execute(&self.pool)
            .await
            .context("remove fs job record")?;
        Ok(())
    }

    /// Records the start of a library move, incrementing the attempt counter
    /// on retries.
    ///
    /// # Errors
    ///
    /// Returns an error when the source path is not valid UTF-8 or the write
    /// fails.
    pub async fn mark_fs_job_started(&self, id: Uuid, src: &Path) -> Result<()> {
        let src = path_str(src)?;
        sqlx::query(FS_JOB_STARTED_SQL)
            .bind(id.to_string())
            .bind(src)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .context("mark fs job started")?;
        Ok(())
    }

    /// Records a finished library move.
    ///
    /// # Errors
    ///
    /// Returns an error when a path is not valid UTF-8 or the write fails.
    pub async fn mark_fs_job_completed(
        &self,
        id: Uuid,
        src: &Path,
        dst: &Path,
        transfer_mode: &str,
    ) -> Result<()> {
        let src = path_str(src)?;
        let dst = path_str(dst)?;
        sqlx::query(FS_JOB_COMPLETED_SQL)
            .bind(id.to_string())
            .bind(src)
            .bind(dst)
            .bind(transfer_mode)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .context("mark fs job completed")?;
        Ok(())
    }

    /// Records a failed library move.
    ///
    /// # Errors
    ///
    /// Returns an error when the write fails.
    pub async fn mark_fs_job_failed(&self, id: Uuid, error: &str) -> Result<()> {
        sqlx::query(FS_JOB_FAILED_SQL)
            .bind(id.to_string())
            .bind(error)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .context("mark fs job failed")?;
        Ok(())
    }

    /// Records that a torrent required no library move.
    ///
    /// # Errors
    ///
    /// Returns an error when the write fails.
    pub async fn mark_fs_job_skipped(&self, id: Uuid) -> Result<()> {
        sqlx::query(FS_JOB_SKIPPED_SQL)
            .bind(id.to_string())
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .context("mark fs job skipped")?;
        Ok(())
    }

    /// Fetches the fs job record for a torrent.
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails.
    pub async fn fetch_fs_job_state(&self, id: Uuid) -> Result<Option<FsJobState>> {
        let row = sqlx::query_as::<_, FsJobStateRow>(
            "SELECT status, attempt, src_path, dst_path, transfer_mode, last_error, updated_at
             FROM runtime_fs_job WHERE torrent_id = ?1",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("fetch fs job state")?;
        Ok(row.map(FsJobState::from))
    }
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| anyhow!("path is not valid UTF-8: {}", path.display()))
}

fn map_status_row(row: &SqliteRow) -> Result<TorrentStatus> {
    let id: String = row.try_get("torrent_id")?;
    let id = Uuid::parse_str(&id).context("parse torrent id")?;
    let state_label: String = row.try_get("state")?;
    let state_message: Option<String> = row.try_get("state_message")?;
    let files: Option<Json<Vec<TorrentFile>>> = row.try_get("files")?;
    Ok(TorrentStatus {
        id,
        name: row.try_get("name")?,
        state: deserialize_state(&state_label, state_message),
        progress: TorrentProgress {
            bytes_downloaded: unclamp_u64(row.try_get("progress_bytes_downloaded")?),
            bytes_total: unclamp_u64(row.try_get("progress_bytes_total")?),
            eta_seconds: row
                .try_get::<Option<i64>, _>("progress_eta_seconds")?
                .map(unclamp_u64),
        },
        rates: TorrentRates {
            download_bps: unclamp_u64(row.try_get("download_bps")?),
            upload_bps: unclamp_u64(row.try_get("upload_bps")?),
            ratio: row.try_get("ratio")?,
        },
        files: files.map(|json| json.0),
        library_path: row.try_get("library_path")?,
        download_dir: row.try_get("download_dir")?,
        sequential: row.try_get("sequential")?,
        added_at: row.try_get("added_at")?,
        completed_at: row.try_get("completed_at")?,
        last_updated: row.try_get("updated_at")?,
    })
}

fn serialize_state(state: &TorrentState) -> (&'static str, Option<String>) {
    let message = match state {
        TorrentState::Failed { message } => Some(message.clone()),
        _ => None,
    };
    (state.label(), message)
}

fn deserialize_state(label: &str, message: Option<String>) -> TorrentState {
    match label {
        "queued" => TorrentState::Queued,
        "fetching_metadata" => TorrentState::FetchingMetadata,
        "downloading" => TorrentState::Downloading,
        "seeding" => TorrentState::Seeding,
        "completed" => TorrentState::Completed,
        "stopped" => TorrentState::Stopped,
        "failed" => TorrentState::Failed {
            message: message.unwrap_or_else(|| "unknown failure".to_owned()),
        },
        other => {
            warn!(state = other, "unknown torrent state in runtime store");
            TorrentState::Stopped
        }
    }
}

#[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
const fn clamp_i64(value: u64) -> i64 {
    if value > i64::MAX as u64 {
        i64::MAX
    } else {
        value as i64
    }
}

fn unclamp_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_state_serialisation() {
        let states = [
            TorrentState::Queued,
            TorrentState::FetchingMetadata,
            TorrentState::Downloading,
            TorrentState::Seeding,
            TorrentState::Completed,
            TorrentState::Stopped,
            TorrentState::Failed {
                message: "tracker unreachable".to_owned(),
            },
        ];
        for state in states {
            let (label, message) = serialize_state(&state);
            assert_eq!(deserialize_state(label, message), state);
        }
    }

    #[test]
    fn failed_state_without_message_gets_placeholder() {
        let state = deserialize_state("failed", None);
        assert_eq!(
            state,
            TorrentState::Failed {
                message: "unknown failure".to_owned()
            }
        );
    }

    #[test]
    fn unknown_state_label_degrades_to_stopped() {
        assert_eq!(deserialize_state("smouldering", None), TorrentState::Stopped);
    }

    #[test]
    fn clamp_handles_large_values() {
        assert_eq!(clamp_i64(42), 42);
        assert_eq!(clamp_i64(u64::MAX), i64::MAX);
        assert_eq!(unclamp_u64(-7), 0);
    }
}

/// Snapshot of the filesystem move pipeline for one torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsJobState {
    /// Pipeline status label.
    pub status: String,
    /// Number of move attempts so far.
    pub attempt: i16,
    /// Source path of the move.
    pub src_path: Option<String>,
    /// Destination path of the move.
    pub dst_path: Option<String>,
    /// Transfer mode used (`hardlink`, `copy`, or `move`).
    pub transfer_mode: Option<String>,
    /// Error message from the last failed attempt.
    pub last_error: Option<String>,
    /// When the record last changed.
    pub updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct FsJobStateRow {
    status: String,
    attempt: i16,
    src_path: Option<String>,
    dst_path: Option<String>,
    transfer_mode: Option<String>,
    last_error: Option<String>,
    updated_at: DateTime<Utc>,
}

impl From<FsJobStateRow> for FsJobState {
    fn from(row: FsJobStateRow) -> Self {
        Self {
            status: row.status,
            attempt: row.attempt,
            src_path: row.src_path,
            dst_path: row.dst_path,
            transfer_mode: row.transfer_mode,
            last_error: row.last_error,
            updated_at: row.updated_at,
        }
    }
}
