use capstan_config::{
    AltSpeedScheduleUpdate, AltSpeedUpdate, ApiKeyPatch, ApiKeyUpsert, AppMode, ChangeOp,
    ConfigError, ConfigStore, EngineLimits, EngineListsUpdate, EngineProfileUpdate, IpFilterUpdate,
    PeerClassConfig, PeerClassesUpdate, SecretPatch, SettingsChangeset, SettingsEvent,
    SettingsFacade, TrackerUpdate, engine_profile::MAX_RATE_LIMIT_BPS,
};
use chrono::{Duration, Utc, Weekday};
use tempfile::TempDir;
use uuid::Uuid;

async fn open_store(dir: &TempDir) -> anyhow::Result<ConfigStore> {
    Ok(ConfigStore::open(dir.path().join("settings.db")).await?)
}

fn upsert(key_id: &str, hash: Option<&str>) -> ApiKeyUpsert {
    ApiKeyUpsert {
        key_id: key_id.to_string(),
        hash: hash.map(str::to_string),
        label: None,
        enabled: None,
        expires_at: None,
        rate_limit: None,
    }
}

#[tokio::test]
async fn bootstrap_seeds_defaults_at_revision_zero() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = open_store(&dir).await?;

    let snapshot = store.snapshot().await?;
    assert_eq!(snapshot.revision, 0);
    assert_eq!(snapshot.app_profile.instance_name, "capstan");
    assert_eq!(snapshot.app_profile.mode, AppMode::Setup);
    assert_eq!(snapshot.app_profile.version, 1);
    assert_eq!(snapshot.app_profile.http_port, 8080);
    assert!(snapshot.engine_profile.network.dht.enabled());
    assert_eq!(snapshot.engine_profile.storage.download_root, "/data/staging");
    assert_eq!(snapshot.fs_policy.library_root, "/data/library");
    assert!(!store.has_api_keys().await?);

    // Reopening the same database must not reseed or bump anything.
    drop(store);
    let reopened = open_store(&dir).await?;
    let snapshot = reopened.snapshot().await?;
    assert_eq!(snapshot.revision, 0);
    assert_eq!(snapshot.app_profile.version, 1);
    Ok(())
}

#[tokio::test]
async fn every_mutating_call_bumps_the_revision_once() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = open_store(&dir).await?;
    let profile = store.get_app_profile().await?;

    // Applying the same payload twice still produces two distinct revisions.
    let update = capstan_config::AppProfileUpdate::from(&profile);
    let first = store.update_app_profile(update.clone()).await?;
    assert_eq!(first.revision, 1);
    let second = store.update_app_profile(update).await?;
    assert_eq!(second.revision, 2);

    let profile = second.app_profile.expect("profile returned");
    assert_eq!(profile.version, 3);
    assert_eq!(store.revision().await?, 2);
    Ok(())
}

#[tokio::test]
async fn immutable_keys_freeze_fields_before_any_write() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = open_store(&dir).await?;
    let profile = store.get_app_profile().await?;

    let mut update = capstan_config::AppProfileUpdate::from(&profile);
    update.immutable_keys = vec!["app.instance_name".to_string()];
    store.update_app_profile(update).await?;
    assert_eq!(store.revision().await?, 1);

    let profile = store.get_app_profile().await?;
    let mut update = capstan_config::AppProfileUpdate::from(&profile);
    update.instance_name = "renamed".to_string();
    let err = store.update_app_profile(update).await.unwrap_err();
    assert!(matches!(
        err,
        ConfigError::ImmutableField { ref section, ref field }
            if section == "app" && field == "instance_name"
    ));

    // The rejected update left no trace.
    assert_eq!(store.revision().await?, 1);
    let profile = store.get_app_profile().await?;
    assert_eq!(profile.instance_name, "capstan");

    // Fields outside the frozen set stay editable.
    let mut update = capstan_config::AppProfileUpdate::from(&profile);
    update.http_port = 9090;
    store.update_app_profile(update).await?;
    assert_eq!(store.get_app_profile().await?.http_port, 9090);
    Ok(())
}

#[tokio::test]
async fn string_lists_are_trimmed_and_deduplicated() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = open_store(&dir).await?;

    let update = EngineProfileUpdate {
        lists: Some(EngineListsUpdate {
            listen_interfaces: vec![
                "  eth0 ".to_string(),
                "eth0".to_string(),
                String::new(),
                " wlan0".to_string(),
            ],
            dht_bootstrap_nodes: vec![
                "router.example.net:6881".to_string(),
                "router.example.net:6881 ".to_string(),
            ],
            dht_router_nodes: Vec::new(),
        }),
        ..EngineProfileUpdate::default()
    };
    let applied = store.update_engine_profile(update).await?;
    let engine = applied.engine_profile.expect("engine profile returned");
    assert_eq!(engine.listen_interfaces, vec!["eth0", "wlan0"]);
    assert_eq!(engine.dht_bootstrap_nodes, vec!["router.example.net:6881"]);
    assert!(engine.dht_router_nodes.is_empty());
    Ok(())
}

#[tokio::test]
async fn oversized_tracker_url_rejects_the_whole_update() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = open_store(&dir).await?;

    let update = EngineProfileUpdate {
        tracker: Some(TrackerUpdate {
            extra_trackers: vec!["ok.example".to_string(), "t".repeat(513)],
            ..TrackerUpdate::default()
        }),
        ..EngineProfileUpdate::default()
    };
    let err = store.update_engine_profile(update).await.unwrap_err();
    assert!(matches!(err, ConfigError::InvalidField { .. }));

    assert_eq!(store.revision().await?, 0);
    let engine = store.get_engine_profile().await?;
    assert!(engine.tracker.extra_trackers.is_empty());

    // A URL at exactly the limit is accepted.
    let update = EngineProfileUpdate {
        tracker: Some(TrackerUpdate {
            extra_trackers: vec!["u".repeat(512)],
            ..TrackerUpdate::default()
        }),
        ..EngineProfileUpdate::default()
    };
    store.update_engine_profile(update).await?;
    assert_eq!(store.revision().await?, 1);
    Ok(())
}

#[tokio::test]
async fn alt_speed_schedules_canonicalize_and_clear_when_malformed() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = open_store(&dir).await?;

    // Mixed spellings, duplicates, and an overnight window are all fine.
    let update = EngineProfileUpdate {
        alt_speed: Some(AltSpeedUpdate {
            download_bps: Some(1_000_000),
            upload_bps: Some(-4),
            schedule: Some(AltSpeedScheduleUpdate {
                days: vec![
                    "Friday".to_string(),
                    "mon".to_string(),
                    " tue".to_string(),
                    "monday".to_string(),
                ],
                start: "22:00".to_string(),
                end: "06:00".to_string(),
            }),
        }),
        ..EngineProfileUpdate::default()
    };
    let applied = store.update_engine_profile(update).await?;
    let alt = applied.engine_profile.expect("engine profile").alt_speed;
    assert_eq!(alt.download_bps, Some(1_000_000));
    assert_eq!(alt.upload_bps, None);
    let schedule = alt.schedule.expect("schedule kept");
    assert_eq!(schedule.days, vec![Weekday::Mon, Weekday::Tue, Weekday::Fri]);
    assert_eq!(schedule.start_minutes, 22 * 60);
    assert_eq!(schedule.end_minutes, 6 * 60);

    // A degenerate window clears the whole aggregate, caps included.
    let update = EngineProfileUpdate {
        alt_speed: Some(AltSpeedUpdate {
            download_bps: Some(2_000_000),
            upload_bps: Some(500_000),
            schedule: Some(AltSpeedScheduleUpdate {
                days: vec!["mon".to_string()],
                start: "08:00".to_string(),
                end: "08:00".to_string(),
            }),
        }),
        ..EngineProfileUpdate::default()
    };
    let applied = store.update_engine_profile(update).await?;
    let alt = applied.engine_profile.expect("engine profile").alt_speed;
    assert_eq!(alt.download_bps, None);
    assert_eq!(alt.upload_bps, None);
    assert!(alt.schedule.is_none());
    Ok(())
}

#[tokio::test]
async fn rate_limits_clamp_to_the_supported_range() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = open_store(&dir).await?;

    let update = EngineProfileUpdate {
        limits: Some(EngineLimits {
            max_download_bps: Some(-5),
            max_upload_bps: Some(MAX_RATE_LIMIT_BPS + 1),
            ..EngineLimits::default()
        }),
        ..EngineProfileUpdate::default()
    };
    let applied = store.update_engine_profile(update).await?;
    let limits = applied.engine_profile.expect("engine profile").limits;
    assert_eq!(limits.max_download_bps, None);
    assert_eq!(limits.max_upload_bps, Some(MAX_RATE_LIMIT_BPS));
    Ok(())
}

#[tokio::test]
async fn peer_classes_normalize_definitions_and_defaults() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = open_store(&dir).await?;

    let class = |id: u8, label: &str| PeerClassConfig {
        id,
        label: label.to_string(),
        download_priority: 1,
        upload_priority: 1,
        connection_limit_factor: 1,
        ignore_unchoke_slots: false,
    };

    let update = EngineProfileUpdate {
        peer_classes: Some(PeerClassesUpdate {
            classes: vec![class(3, "seeds"), class(1, "all")],
            default: vec![3, 9, 3, 1],
        }),
        ..EngineProfileUpdate::default()
    };
    let applied = store.update_engine_profile(update).await?;
    let classes = applied.engine_profile.expect("engine profile").peer_classes;
    let ids: Vec<u8> = classes.classes.iter().map(|c| c.id).collect();
    assert_eq!(ids, vec![1, 3]);
    // The dangling default (9) is dropped, duplicates collapse, order is by id.
    assert_eq!(classes.default, vec![1, 3]);

    let update = EngineProfileUpdate {
        peer_classes: Some(PeerClassesUpdate {
            classes: vec![class(2, "a"), class(2, "b")],
            default: Vec::new(),
        }),
        ..EngineProfileUpdate::default()
    };
    let err = store.update_engine_profile(update).await.unwrap_err();
    assert!(matches!(err, ConfigError::DuplicatePeerClass { class_id: 2 }));
    Ok(())
}

#[tokio::test]
async fn ip_filter_status_survives_profile_updates() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = open_store(&dir).await?;

    let filter_update = IpFilterUpdate {
        blocklist_url: Some("https://filters.example/blocklist.gz".to_string()),
        cidrs: vec![" 10.0.0.0/8".to_string(), "10.0.0.0/8".to_string()],
    };
    let update = EngineProfileUpdate {
        ip_filter: Some(filter_update.clone()),
        ..EngineProfileUpdate::default()
    };
    store.update_engine_profile(update).await?;

    let fetched_at = Utc::now();
    store
        .set_ip_filter_status(Some("etag-1"), Some(fetched_at), None)
        .await?;
    assert_eq!(store.revision().await?, 2);

    let filter = store.get_engine_profile().await?.ip_filter;
    assert_eq!(
        filter.blocklist_url.as_deref(),
        Some("https://filters.example/blocklist.gz")
    );
    assert_eq!(filter.cidrs, vec!["10.0.0.0/8"]);
    assert_eq!(filter.etag.as_deref(), Some("etag-1"));

    // Re-applying the filter settings keeps the refresher-owned fields.
    let update = EngineProfileUpdate {
        ip_filter: Some(filter_update),
        ..EngineProfileUpdate::default()
    };
    store.update_engine_profile(update).await?;
    let filter = store.get_engine_profile().await?.ip_filter;
    assert_eq!(filter.etag.as_deref(), Some("etag-1"));
    assert_eq!(filter.last_updated_at, Some(fetched_at));
    Ok(())
}

#[tokio::test]
async fn api_keys_merge_on_upsert_and_gate_on_state() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = open_store(&dir).await?;

    // Creating without a hash is rejected.
    let err = store.upsert_api_key(upsert("ops", None)).await.unwrap_err();
    assert!(matches!(err, ConfigError::InvalidField { .. }));

    store.upsert_api_key(upsert("ops", Some("hash-1"))).await?;
    assert!(store.has_api_keys().await?);
    let auth = store.api_key_auth("ops").await?.expect("key active");
    assert_eq!(auth.hash, "hash-1");

    // An update without a hash keeps the stored one.
    let mut patch = upsert("ops", None);
    patch.label = Some("rotated".to_string());
    store.upsert_api_key(patch).await?;
    let auth = store.api_key_auth("ops").await?.expect("key active");
    assert_eq!(auth.hash, "hash-1");
    assert_eq!(auth.label.as_deref(), Some("rotated"));

    // Disabled and expired keys drop out of the active set but still exist.
    assert!(store.set_api_key_enabled("ops", false).await?);
    assert!(store.api_key_auth("ops").await?.is_none());
    assert!(store.active_api_keys().await?.is_empty());
    assert!(store.has_api_keys().await?);

    assert!(store.set_api_key_enabled("ops", true).await?);
    let expired = Utc::now() - Duration::minutes(5);
    assert!(store.set_api_key_expiry("ops", Some(expired)).await?);
    assert!(store.api_key_auth("ops").await?.is_none());

    // Deletes report the rows removed and only bump when they remove one.
    assert_eq!(store.delete_api_key("ops").await?, 1);
    let revision = store.revision().await?;
    assert_eq!(store.delete_api_key("ops").await?, 0);
    assert_eq!(store.revision().await?, revision);
    Ok(())
}

#[tokio::test]
async fn secrets_record_the_writing_actor() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = open_store(&dir).await?;

    store.put_secret("admin", "webhook_token", b"tok-1").await?;
    let secret = store.get_secret("webhook_token").await?.expect("stored");
    assert_eq!(secret.ciphertext, b"tok-1");
    assert_eq!(secret.created_by.as_deref(), Some("admin"));

    store.put_secret("admin", "webhook_token", b"tok-2").await?;
    let secret = store.get_secret("webhook_token").await?.expect("stored");
    assert_eq!(secret.ciphertext, b"tok-2");

    assert_eq!(store.delete_secret("webhook_token").await?, 1);
    assert!(store.get_secret("webhook_token").await?.is_none());
    assert_eq!(store.delete_secret("webhook_token").await?, 0);
    Ok(())
}

#[tokio::test]
async fn setup_tokens_enforce_a_single_active_token() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = open_store(&dir).await?;

    let token = store
        .issue_setup_token("hash-a", Duration::minutes(10))
        .await?;
    let err = store
        .issue_setup_token("hash-b", Duration::minutes(10))
        .await
        .unwrap_err();
    assert!(matches!(err, ConfigError::SetupTokenActive));

    let active = store.active_setup_token().await?.expect("token active");
    assert_eq!(active.id, token.id);

    let consumed = store.consume_setup_token(token.id).await?;
    assert!(consumed.consumed_at.is_some());
    let err = store.consume_setup_token(token.id).await.unwrap_err();
    assert!(matches!(err, ConfigError::SetupTokenConsumed));
    assert!(store.active_setup_token().await?.is_none());

    let err = store.consume_setup_token(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, ConfigError::SetupTokenMissing));

    // Consuming past the expiry fails, and issuance sweeps the stale row.
    let stale = store
        .issue_setup_token("hash-c", Duration::seconds(-1))
        .await?;
    let err = store.consume_setup_token(stale.id).await.unwrap_err();
    assert!(matches!(err, ConfigError::SetupTokenExpired));
    store
        .issue_setup_token("hash-d", Duration::minutes(10))
        .await?;
    Ok(())
}

#[tokio::test]
async fn changesets_apply_atomically_under_one_revision() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = open_store(&dir).await?;
    let mut stream = store.subscribe_changes();

    let profile = store.get_app_profile().await?;
    let changeset = SettingsChangeset {
        app_profile: Some(capstan_config::AppProfileUpdate::from(&profile)),
        engine_profile: Some(EngineProfileUpdate::default()),
        fs_policy: None,
        api_keys: vec![ApiKeyPatch::Upsert(upsert("ci", Some("hash-ci")))],
        secrets: vec![SecretPatch::Set {
            name: "notify_url".to_string(),
            value: b"https://hooks.example".to_vec(),
        }],
    };
    let applied = store.apply_changeset("tester", changeset).await?;
    assert_eq!(applied.revision, 1);
    assert!(applied.app_profile.is_some());
    assert!(applied.engine_profile.is_some());
    assert!(applied.fs_policy.is_none());

    let mut seen = Vec::new();
    for _ in 0..4 {
        match stream.next().await {
            Some(SettingsEvent::Change(change)) => seen.push(change),
            other => panic!("expected a change event, got {other:?}"),
        }
    }
    assert!(seen.iter().all(|change| change.revision == 1));
    let tables: Vec<&str> = seen.iter().map(|change| change.table.as_str()).collect();
    assert_eq!(
        tables,
        vec!["app_profile", "engine_profile", "auth_api_key", "settings_secret"]
    );
    assert_eq!(seen[0].operation, ChangeOp::Update);
    assert_eq!(seen[2].operation, ChangeOp::Insert);

    // An empty changeset is a no-op: same revision, nothing published.
    let applied = store
        .apply_changeset("tester", SettingsChangeset::default())
        .await?;
    assert_eq!(applied.revision, 1);
    assert!(applied.app_profile.is_none());
    assert_eq!(store.revision().await?, 1);
    Ok(())
}

#[tokio::test]
async fn watcher_coalesces_each_revision_into_one_snapshot() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = open_store(&dir).await?;
    let mut watcher = store.watch_settings().await?;

    let profile = store.get_app_profile().await?;
    let mut update = capstan_config::AppProfileUpdate::from(&profile);
    update.instance_name = "den".to_string();
    store.update_app_profile(update).await?;

    let snapshot = watcher.next().await?;
    assert_eq!(snapshot.revision, 1);
    assert_eq!(snapshot.app_profile.instance_name, "den");

    // A multi-table changeset publishes several records but yields one
    // snapshot; the follow-up update proves the duplicates were skipped.
    let profile = store.get_app_profile().await?;
    let changeset = SettingsChangeset {
        app_profile: Some(capstan_config::AppProfileUpdate::from(&profile)),
        engine_profile: Some(EngineProfileUpdate::default()),
        fs_policy: None,
        api_keys: Vec::new(),
        secrets: vec![SecretPatch::Set {
            name: "s".to_string(),
            value: b"v".to_vec(),
        }],
    };
    store.apply_changeset("tester", changeset).await?;
    let snapshot = watcher.next().await?;
    assert_eq!(snapshot.revision, 2);

    let profile = store.get_app_profile().await?;
    store
        .update_app_profile(capstan_config::AppProfileUpdate::from(&profile))
        .await?;
    let snapshot = watcher.next().await?;
    assert_eq!(snapshot.revision, 3);
    Ok(())
}

#[tokio::test]
async fn factory_reset_returns_the_store_to_first_boot() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = open_store(&dir).await?;

    let profile = store.get_app_profile().await?;
    let mut update = capstan_config::AppProfileUpdate::from(&profile);
    update.instance_name = "customized".to_string();
    store.update_app_profile(update).await?;
    store.upsert_api_key(upsert("ops", Some("hash-1"))).await?;
    store.put_secret("admin", "webhook", b"tok").await?;
    store
        .issue_setup_token("hash-t", Duration::minutes(10))
        .await?;
    assert!(store.revision().await? > 0);

    let mut stream = store.subscribe_changes();
    let snapshot = store.factory_reset().await?;
    assert_eq!(snapshot.revision, 0);
    assert_eq!(snapshot.app_profile.instance_name, "capstan");
    assert_eq!(snapshot.app_profile.version, 1);
    assert!(!store.has_api_keys().await?);
    assert!(store.get_secret("webhook").await?.is_none());
    assert!(store.active_setup_token().await?.is_none());

    let mut seen = Vec::new();
    for _ in 0..6 {
        match stream.next().await {
            Some(SettingsEvent::Change(change)) => seen.push(change),
            other => panic!("expected a change event, got {other:?}"),
        }
    }
    assert!(seen.iter().all(|change| change.revision == 0));
    let inserts: Vec<&str> = seen
        .iter()
        .filter(|change| change.operation == ChangeOp::Insert)
        .map(|change| change.table.as_str())
        .collect();
    assert_eq!(inserts, vec!["app_profile", "engine_profile", "fs_policy"]);
    let deletes: Vec<&str> = seen
        .iter()
        .filter(|change| change.operation == ChangeOp::Delete)
        .map(|change| change.table.as_str())
        .collect();
    assert_eq!(
        deletes,
        vec!["auth_api_key", "settings_secret", "setup_token"]
    );
    Ok(())
}

#[tokio::test]
async fn fs_policy_updates_validate_modes_and_paths() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = open_store(&dir).await?;
    let policy = store.get_fs_policy().await?;

    let mut update = capstan_config::FsPolicyUpdate::from(&policy);
    update.chmod_file = Some("0644".to_string());
    update.cleanup_drop = vec!["*.nfo".to_string(), " *.nfo".to_string()];
    let applied = store.update_fs_policy(update).await?;
    let policy = applied.fs_policy.expect("policy returned");
    assert_eq!(policy.chmod_file.as_deref(), Some("0644"));
    assert_eq!(policy.cleanup_drop, vec!["*.nfo"]);

    let mut update = capstan_config::FsPolicyUpdate::from(&policy);
    update.chmod_dir = Some("0868".to_string());
    let err = store.update_fs_policy(update).await.unwrap_err();
    assert!(matches!(err, ConfigError::InvalidField { .. }));

    let mut update = capstan_config::FsPolicyUpdate::from(&policy);
    update.library_root = "   ".to_string();
    let err = store.update_fs_policy(update).await.unwrap_err();
    assert!(matches!(err, ConfigError::InvalidField { .. }));
    Ok(())
}
