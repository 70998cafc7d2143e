use anyhow::Result;
use capstan_data::RuntimeStore;
use capstan_data::runtime::{
    FilePriority, TorrentFile, TorrentProgress, TorrentRates, TorrentStatus,
};
use capstan_events::TorrentState;
use chrono::{TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tempfile::TempDir;
use uuid::Uuid;

async fn open_store(dir: &TempDir) -> Result<RuntimeStore> {
    let options = SqliteConnectOptions::new()
        .filename(dir.path().join("runtime.db"))
        .create_if_missing(true)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(2)
        .connect_with(options)
        .await?;
    Ok(RuntimeStore::new(pool).await?)
}

fn sample_status(id: Uuid) -> TorrentStatus {
    TorrentStatus {
        id,
        name: Some("ubuntu-24.04.iso".to_owned()),
        state: TorrentState::Downloading,
        progress: TorrentProgress {
            bytes_downloaded: 1_024,
            bytes_total: 4_096,
            eta_seconds: Some(30),
        },
        rates: TorrentRates {
            download_bps: 512,
            upload_bps: 128,
            ratio: 0.25,
        },
        files: Some(vec![TorrentFile {
            index: 0,
            path: "ubuntu-24.04.iso".to_owned(),
            size_bytes: 4_096,
            bytes_completed: 1_024,
            priority: FilePriority::Normal,
            selected: true,
        }]),
        library_path: None,
        download_dir: Some("/data/staging".to_owned()),
        sequential: false,
        added_at: Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap(),
        completed_at: None,
        last_updated: Utc.with_ymd_and_hms(2025, 1, 1, 12, 5, 0).unwrap(),
    }
}

#[tokio::test]
async fn upsert_and_load_round_trip() -> Result<()> {
    let dir = TempDir::new()?;
    let store = open_store(&dir).await?;
    let id = Uuid::new_v4();
    let status = sample_status(id);

    store.upsert_status(&status).await?;
    let loaded = store.load_statuses().await?;
    assert_eq!(loaded, vec![status.clone()]);
    assert_eq!(store.fetch_status(id).await?, Some(status.clone()));

    let mut updated = status;
    updated.state = TorrentState::Seeding;
    updated.progress.bytes_downloaded = 4_096;
    updated.completed_at = Some(Utc.with_ymd_and_hms(2025, 1, 1, 13, 0, 0).unwrap());
    updated.library_path = Some("/data/library/ubuntu-24.04.iso".to_owned());
    store.upsert_status(&updated).await?;

    let fetched = store.fetch_status(id).await?.expect("status present");
    assert_eq!(fetched, updated);
    assert_eq!(store.load_statuses().await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn failed_state_round_trips_its_message() -> Result<()> {
    let dir = TempDir::new()?;
    let store = open_store(&dir).await?;
    let id = Uuid::new_v4();
    let mut status = sample_status(id);
    status.state = TorrentState::Failed {
        message: "disk full".to_owned(),
    };

    store.upsert_status(&status).await?;
    let fetched = store.fetch_status(id).await?.expect("status present");
    assert_eq!(fetched.state, status.state);
    Ok(())
}

#[tokio::test]
async fn remove_torrent_clears_status_and_job() -> Result<()> {
    let dir = TempDir::new()?;
    let store = open_store(&dir).await?;
    let id = Uuid::new_v4();

    store.upsert_status(&sample_status(id)).await?;
    store
        .mark_fs_job_started(id, "/data/staging/ubuntu".as_ref())
        .await?;
    store.remove_torrent(id).await?;

    assert!(store.load_statuses().await?.is_empty());
    assert!(store.fetch_status(id).await?.is_none());
    assert!(store.fetch_fs_job_state(id).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn fs_job_state_transitions() -> Result<()> {
    let dir = TempDir::new()?;
    let store = open_store(&dir).await?;
    let id = Uuid::new_v4();

    store
        .mark_fs_job_started(id, "/data/staging/ubuntu".as_ref())
        .await?;
    let state = store.fetch_fs_job_state(id).await?.expect("job present");
    assert_eq!(state.status, "moving");
    assert_eq!(state.attempt, 1);
    assert_eq!(state.src_path.as_deref(), Some("/data/staging/ubuntu"));
    assert!(state.last_error.is_none());

    store
        .mark_fs_job_completed(
            id,
            "/data/staging/ubuntu".as_ref(),
            "/data/library/ubuntu".as_ref(),
            "hardlink",
        )
        .await?;
    let state = store.fetch_fs_job_state(id).await?.expect("job present");
    assert_eq!(state.status, "moved");
    assert_eq!(state.attempt, 1);
    assert_eq!(state.dst_path.as_deref(), Some("/data/library/ubuntu"));
    assert_eq!(state.transfer_mode.as_deref(), Some("hardlink"));

    store
        .mark_fs_job_started(id, "/data/staging/ubuntu".as_ref())
        .await?;
    let state = store.fetch_fs_job_state(id).await?.expect("job present");
    assert_eq!(state.status, "moving");
    assert_eq!(state.attempt, 2);

    store.mark_fs_job_failed(id, "destination unwritable").await?;
    let state = store.fetch_fs_job_state(id).await?.expect("job present");
    assert_eq!(state.status, "failed");
    assert_eq!(state.attempt, 2);
    assert_eq!(state.last_error.as_deref(), Some("destination unwritable"));

    store.mark_fs_job_skipped(id).await?;
    let state = store.fetch_fs_job_state(id).await?.expect("job present");
    assert_eq!(state.status, "skipped");
    Ok(())
}
