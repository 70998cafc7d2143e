//! Queries backing the settings store: the revision counter, the three
//! singleton profiles and their sub-resource tables, API keys, secrets,
//! and setup tokens.
//!
//! Functions that issue a single statement are generic over the executor
//! so they run against a pool, a connection, or an open transaction.
//! Functions that loop over rows take a [`SqliteConnection`] because they
//! must stay on one connection inside the caller's transaction.

use chrono::{DateTime, Utc};
use sqlx::{Executor, Sqlite, SqliteConnection, SqlitePool};

use crate::error::{DataError, Result};

const INSERT_APP_PROFILE_SQL: &str = "INSERT INTO app_profile (
        id, instance_name, mode, auth_mode, version, http_port, bind_addr,
        telemetry_level, telemetry_format, telemetry_otel_enabled,
        telemetry_otel_service_name, telemetry_otel_endpoint, created_at, updated_at
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)";

const UPDATE_APP_PROFILE_SQL: &str = "UPDATE app_profile SET
        instance_name = ?1, mode = ?2, auth_mode = ?3, version = ?4,
        http_port = ?5, bind_addr = ?6, telemetry_level = ?7,
        telemetry_format = ?8, telemetry_otel_enabled = ?9,
        telemetry_otel_service_name = ?10, telemetry_otel_endpoint = ?11,
        updated_at = ?12
    WHERE id = ?13";

const SELECT_APP_PROFILE_SQL: &str = "SELECT
        id, instance_name, mode, auth_mode, version, http_port, bind_addr,
        telemetry_level, telemetry_format, telemetry_otel_enabled,
        telemetry_otel_service_name, telemetry_otel_endpoint, created_at, updated_at
    FROM app_profile WHERE id = ?1";

const SELECT_LABEL_POLICIES_SQL: &str = "SELECT
        kind, name, download_dir, rate_limit_download_bps, rate_limit_upload_bps,
        queue_position, auto_managed, seed_ratio_limit, seed_time_limit,
        cleanup_seed_ratio_limit, cleanup_seed_time_limit, cleanup_remove_data
    FROM app_label_policy WHERE profile_id = ?1 ORDER BY kind, name";

const INSERT_LABEL_POLICY_SQL: &str = "INSERT INTO app_label_policy (
        profile_id, kind, name, download_dir, rate_limit_download_bps,
        rate_limit_upload_bps, queue_position, auto_managed, seed_ratio_limit,
        seed_time_limit, cleanup_seed_ratio_limit, cleanup_seed_time_limit,
        cleanup_remove_data
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)";

const SELECT_ENGINE_PROFILE_SQL: &str = "SELECT
        id, listen_port, ipv6_mode, enable_dht, enable_lsd, enable_upnp,
        enable_natpmp, enable_pex, enable_outgoing_utp, enable_incoming_utp,
        encryption, anonymous_mode, force_proxy, outgoing_port_min,
        outgoing_port_max, peer_dscp, max_download_bps, max_upload_bps,
        max_active, connections_limit, connections_limit_per_torrent,
        unchoke_slots, half_open_limit, seed_ratio_limit, seed_time_limit,
        auto_managed, prefer_seeds, dont_count_slow_torrents, download_root,
        resume_dir, storage_mode, cache_size_mib, cache_expiry_seconds,
        verify_piece_hashes, sequential_default, super_seeding,
        stats_interval_ms, created_at, updated_at
    FROM engine_profile WHERE id = ?1";

const INSERT_ENGINE_PROFILE_SQL: &str = "INSERT INTO engine_profile (
        id, listen_port, ipv6_mode, enable_dht, enable_lsd, enable_upnp,
        enable_natpmp, enable_pex, enable_outgoing_utp, enable_incoming_utp,
        encryption, anonymous_mode, force_proxy, outgoing_port_min,
        outgoing_port_max, peer_dscp, max_download_bps, max_upload_bps,
        max_active, connections_limit, connections_limit_per_torrent,
        unchoke_slots, half_open_limit, seed_ratio_limit, seed_time_limit,
        auto_managed, prefer_seeds, dont_count_slow_torrents, download_root,
        resume_dir, storage_mode, cache_size_mib, cache_expiry_seconds,
        verify_piece_hashes, sequential_default, super_seeding,
        stats_interval_ms, created_at, updated_at
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
        ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28,
        ?29, ?30, ?31, ?32, ?33, ?34, ?35, ?36, ?37, ?38, ?39)";

const UPDATE_ENGINE_PROFILE_SQL: &str = "UPDATE engine_profile SET
        listen_port = ?1, ipv6_mode = ?2, enable_dht = ?3, enable_lsd = ?4,
        enable_upnp = ?5, enable_natpmp = ?6, enable_pex = ?7,
        enable_outgoing_utp = ?8, enable_incoming_utp = ?9, encryption = ?10,
        anonymous_mode = ?11, force_proxy = ?12, outgoing_port_min = ?13,
        outgoing_port_max = ?14, peer_dscp = ?15, max_download_bps = ?16,
        max_upload_bps = ?17, max_active = ?18, connections_limit = ?19,
        connections_limit_per_torrent = ?20, unchoke_slots = ?21,
        half_open_limit = ?22, seed_ratio_limit = ?23, seed_time_limit = ?24,
        auto_managed = ?25, prefer_seeds = ?26, dont_count_slow_torrents = ?27,
        download_root = ?28, resume_dir = ?29, storage_mode = ?30,
        cache_size_mib = ?31, cache_expiry_seconds = ?32,
        verify_piece_hashes = ?33, sequential_default = ?34,
        super_seeding = ?35, stats_interval_ms = ?36, updated_at = ?37
    WHERE id = ?38";

const SELECT_TRACKER_SQL: &str = "SELECT
        replace_trackers, announce_to_all, user_agent, announce_ip,
        listen_interface, request_timeout_ms, ssl_cert, ssl_private_key,
        ssl_ca_cert, ssl_verify, proxy_host, proxy_port, proxy_kind,
        proxy_username_secret, proxy_password_secret, proxy_peers,
        auth_username_secret, auth_password_secret, auth_cookie_secret
    FROM engine_tracker WHERE profile_id = ?1";

const UPSERT_TRACKER_SQL: &str = "INSERT INTO engine_tracker (
        profile_id, replace_trackers, announce_to_all, user_agent, announce_ip,
        listen_interface, request_timeout_ms, ssl_cert, ssl_private_key,
        ssl_ca_cert, ssl_verify, proxy_host, proxy_port, proxy_kind,
        proxy_username_secret, proxy_password_secret, proxy_peers,
        auth_username_secret, auth_password_secret, auth_cookie_secret
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
        ?15, ?16, ?17, ?18, ?19, ?20)
    ON CONFLICT (profile_id) DO UPDATE SET
        replace_trackers = excluded.replace_trackers,
        announce_to_all = excluded.announce_to_all,
        user_agent = excluded.user_agent,
        announce_ip = excluded.announce_ip,
        listen_interface = excluded.listen_interface,
        request_timeout_ms = excluded.request_timeout_ms,
        ssl_cert = excluded.ssl_cert,
        ssl_private_key = excluded.ssl_private_key,
        ssl_ca_cert = excluded.ssl_ca_cert,
        ssl_verify = excluded.ssl_verify,
        proxy_host = excluded.proxy_host,
        proxy_port = excluded.proxy_port,
        proxy_kind = excluded.proxy_kind,
        proxy_username_secret = excluded.proxy_username_secret,
        proxy_password_secret = excluded.proxy_password_secret,
        proxy_peers = excluded.proxy_peers,
        auth_username_secret = excluded.auth_username_secret,
        auth_password_secret = excluded.auth_password_secret,
        auth_cookie_secret = excluded.auth_cookie_secret";

const UPSERT_ALT_SPEED_SQL: &str = "INSERT INTO engine_alt_speed (
        profile_id, download_bps, upload_bps, schedule_start_minutes,
        schedule_end_minutes, schedule_days
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
    ON CONFLICT (profile_id) DO UPDATE SET
        download_bps = excluded.download_bps,
        upload_bps = excluded.upload_bps,
        schedule_start_minutes = excluded.schedule_start_minutes,
        schedule_end_minutes = excluded.schedule_end_minutes,
        schedule_days = excluded.schedule_days";

const UPSERT_IP_FILTER_SQL: &str = "INSERT INTO engine_ip_filter (
        profile_id, blocklist_url, etag, last_updated_at, last_error
    ) VALUES (?1, ?2, ?3, ?4, ?5)
    ON CONFLICT (profile_id) DO UPDATE SET
        blocklist_url = excluded.blocklist_url,
        etag = excluded.etag,
        last_updated_at = excluded.last_updated_at,
        last_error = excluded.last_error";

const INSERT_FS_POLICY_SQL: &str = "INSERT INTO fs_policy (
        id, library_root, extract, par2, flatten, move_mode, chmod_file,
        chmod_dir, owner, group_name, umask, created_at, updated_at
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)";

const UPDATE_FS_POLICY_SQL: &str = "UPDATE fs_policy SET
        library_root = ?1, extract = ?2, par2 = ?3, flatten = ?4,
        move_mode = ?5, chmod_file = ?6, chmod_dir = ?7, owner = ?8,
        group_name = ?9, umask = ?10, updated_at = ?11
    WHERE id = ?12";

const SELECT_FS_POLICY_SQL: &str = "SELECT
        id, library_root, extract, par2, flatten, move_mode, chmod_file,
        chmod_dir, owner, group_name, umask, created_at, updated_at
    FROM fs_policy WHERE id = ?1";

const UPSERT_API_KEY_SQL: &str = "INSERT INTO auth_api_key (
        key_id, hash, label, enabled, expires_at, rate_limit_burst,
        rate_limit_per_seconds, created_at, updated_at
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
    ON CONFLICT (key_id) DO UPDATE SET
        hash = excluded.hash,
        label = excluded.label,
        enabled = excluded.enabled,
        expires_at = excluded.expires_at,
        rate_limit_burst = excluded.rate_limit_burst,
        rate_limit_per_seconds = excluded.rate_limit_per_seconds,
        updated_at = excluded.updated_at";

const LIST_ACTIVE_API_KEYS_SQL: &str = "SELECT
        key_id, hash, label, enabled, expires_at, rate_limit_burst,
        rate_limit_per_seconds, created_at, updated_at
    FROM auth_api_key
    WHERE enabled = 1 AND (expires_at IS NULL OR expires_at > ?1)
    ORDER BY key_id";

const SELECT_ACTIVE_API_KEY_SQL: &str = "SELECT
        key_id, hash, label, enabled, expires_at, rate_limit_burst,
        rate_limit_per_seconds, created_at, updated_at
    FROM auth_api_key
    WHERE key_id = ?1 AND enabled = 1 AND (expires_at IS NULL OR expires_at > ?2)";

const SELECT_API_KEY_SQL: &str = "SELECT
        key_id, hash, label, enabled, expires_at, rate_limit_burst,
        rate_limit_per_seconds, created_at, updated_at
    FROM auth_api_key
    WHERE key_id = ?1";

const UPSERT_SECRET_SQL: &str = "INSERT INTO settings_secret (
        name, ciphertext, created_by, created_at, updated_at
    ) VALUES (?1, ?2, ?3, ?4, ?5)
    ON CONFLICT (name) DO UPDATE SET
        ciphertext = excluded.ciphertext,
        created_by = excluded.created_by,
        updated_at = excluded.updated_at";

const WIPE_STATEMENTS: &[&str] = &[
    "DELETE FROM setup_token",
    "DELETE FROM settings_secret",
    "DELETE FROM auth_api_key",
    "DELETE FROM app_profile",
    "DELETE FROM engine_profile",
    "DELETE FROM fs_policy",
    "DELETE FROM runtime_torrent",
    "DELETE FROM runtime_fs_job",
];

fn map_query_err(operation: &'static str) -> impl FnOnce(sqlx::Error) -> DataError {
    move |source| DataError::QueryFailed { operation, source }
}

/// Applies the embedded migrations to the given pool.
///
/// # Errors
///
/// Returns [`DataError::MigrationFailed`] when a migration cannot be applied.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    let mut migrator = sqlx::migrate!("./migrations");
    migrator.set_ignore_missing(true);
    migrator
        .run(pool)
        .await
        .map_err(|source| DataError::MigrationFailed { source })
}

/// Seeds the singleton revision counter row when it is absent.
///
/// # Errors
///
/// Returns [`DataError::QueryFailed`] when the insert fails.
pub async fn ensure_revision_row<'e, E>(executor: E, now: DateTime<Utc>) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO settings_revision (id, value, updated_at) VALUES (1, 0, ?1)
         ON CONFLICT (id) DO NOTHING",
    )
    .bind(now)
    .execute(executor)
    .await
    .map_err(map_query_err("seed settings revision"))?;
    Ok(())
}

/// Reads the current settings revision.
///
/// # Errors
///
/// Returns [`DataError::QueryFailed`] when the counter row is missing or the
/// query fails.
pub async fn fetch_revision<'e, E>(executor: E) -> Result<i64>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_scalar::<_, i64>("SELECT value FROM settings_revision WHERE id = 1")
        .fetch_one(executor)
        .await
        .map_err(map_query_err("fetch settings revision"))
}

/// Increments the settings revision and returns the new value.
///
/// # Errors
///
/// Returns [`DataError::QueryFailed`] when the counter row is missing or the
/// update fails.
pub async fn bump_revision<'e, E>(executor: E, now: DateTime<Utc>) -> Result<i64>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_scalar::<_, i64>(
        "UPDATE settings_revision SET value = value + 1, updated_at = ?1
         WHERE id = 1 RETURNING value",
    )
    .bind(now)
    .fetch_one(executor)
    .await
    .map_err(map_query_err("bump settings revision"))
}

/// Forces the settings revision to an absolute value.
///
/// # Errors
///
/// Returns [`DataError::QueryFailed`] when the update fails.
pub async fn set_revision<'e, E>(executor: E, value: i64, now: DateTime<Utc>) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("UPDATE settings_revision SET value = ?1, updated_at = ?2 WHERE id = 1")
        .bind(value)
        .bind(now)
        .execute(executor)
        .await
        .map_err(map_query_err("set settings revision"))?;
    Ok(())
}

/// Persisted columns of the application profile singleton.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AppProfileRow {
    /// Fixed identifier of the singleton row.
    pub id: String,
    /// Operator-visible instance name.
    pub instance_name: String,
    /// Lifecycle mode label (`setup` or `active`).
    pub mode: String,
    /// Authentication mode label (`api_key` or `disabled`).
    pub auth_mode: String,
    /// Monotonic profile version, bumped on every profile update.
    pub version: i64,
    /// HTTP listener port.
    pub http_port: i32,
    /// HTTP bind address.
    pub bind_addr: String,
    /// Telemetry log level override.
    pub telemetry_level: Option<String>,
    /// Telemetry log format override.
    pub telemetry_format: Option<String>,
    /// Whether OpenTelemetry export is enabled.
    pub telemetry_otel_enabled: bool,
    /// OpenTelemetry service name override.
    pub telemetry_otel_service_name: Option<String>,
    /// OpenTelemetry collector endpoint.
    pub telemetry_otel_endpoint: Option<String>,
    /// Row creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
}

/// Reports whether the application profile singleton has been seeded.
///
/// # Errors
///
/// Returns [`DataError::QueryFailed`] when the query fails.
pub async fn app_profile_exists<'e, E>(executor: E) -> Result<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_scalar::<_, bool>("SELECT EXISTS (SELECT 1 FROM app_profile)")
        .fetch_one(executor)
        .await
        .map_err(map_query_err("check app profile presence"))
}

/// Fetches the application profile row.
///
/// # Errors
///
/// Returns [`DataError::QueryFailed`] when the row is missing or the query
/// fails; the row is seeded at startup, so absence is fatal.
pub async fn fetch_app_profile_row<'e, E>(executor: E, id: &str) -> Result<AppProfileRow>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, AppProfileRow>(SELECT_APP_PROFILE_SQL)
        .bind(id)
        .fetch_one(executor)
        .await
        .map_err(map_query_err("fetch app profile"))
}

/// Inserts the application profile row.
///
/// # Errors
///
/// Returns [`DataError::QueryFailed`] when the insert fails.
pub async fn insert_app_profile_row<'e, E>(executor: E, row: &AppProfileRow) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(INSERT_APP_PROFILE_SQL)
        .bind(&row.id)
        .bind(&row.instance_name)
        .bind(&row.mode)
        .bind(&row.auth_mode)
        .bind(row.version)
        .bind(row.http_port)
        .bind(&row.bind_addr)
        .bind(&row.telemetry_level)
        .bind(&row.telemetry_format)
        .bind(row.telemetry_otel_enabled)
        .bind(&row.telemetry_otel_service_name)
        .bind(&row.telemetry_otel_endpoint)
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(executor)
        .await
        .map_err(map_query_err("insert app profile"))?;
    Ok(())
}

/// Updates the scalar columns of the application profile row.
///
/// # Errors
///
/// Returns [`DataError::QueryFailed`] when the update fails.
pub async fn update_app_profile_row<'e, E>(executor: E, row: &AppProfileRow) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(UPDATE_APP_PROFILE_SQL)
        .bind(&row.instance_name)
        .bind(&row.mode)
        .bind(&row.auth_mode)
        .bind(row.version)
        .bind(row.http_port)
        .bind(&row.bind_addr)
        .bind(&row.telemetry_level)
        .bind(&row.telemetry_format)
        .bind(row.telemetry_otel_enabled)
        .bind(&row.telemetry_otel_service_name)
        .bind(&row.telemetry_otel_endpoint)
        .bind(row.updated_at)
        .bind(&row.id)
        .execute(executor)
        .await
        .map_err(map_query_err("update app profile"))?;
    Ok(())
}

/// Fetches the immutable-key list for a profile, in declaration order.
///
/// # Errors
///
/// Returns [`DataError::QueryFailed`] when the query fails.
pub async fn fetch_immutable_keys<'e, E>(executor: E, profile_id: &str) -> Result<Vec<String>>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_scalar::<_, String>(
        "SELECT key FROM app_immutable_key WHERE profile_id = ?1 ORDER BY ordinal",
    )
    .bind(profile_id)
    .fetch_all(executor)
    .await
    .map_err(map_query_err("fetch immutable keys"))
}

/// Replaces the immutable-key list for a profile.
///
/// # Errors
///
/// Returns [`DataError::QueryFailed`] when a statement fails.
pub async fn replace_immutable_keys(
    conn: &mut SqliteConnection,
    profile_id: &str,
    keys: &[String],
) -> Result<()> {
    sqlx::query("DELETE FROM app_immutable_key WHERE profile_id = ?1")
        .bind(profile_id)
        .execute(&mut *conn)
        .await
        .map_err(map_query_err("clear immutable keys"))?;
    for (ordinal, key) in (0_i64..).zip(keys) {
        sqlx::query("INSERT INTO app_immutable_key (profile_id, ordinal, key) VALUES (?1, ?2, ?3)")
            .bind(profile_id)
            .bind(ordinal)
            .bind(key)
            .execute(&mut *conn)
            .await
            .map_err(map_query_err("insert immutable key"))?;
    }
    Ok(())
}

/// Persisted columns of a per-label override row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LabelPolicyRow {
    /// Label kind (`category` or `tag`).
    pub kind: String,
    /// Label name, unique within its kind.
    pub name: String,
    /// Download directory override.
    pub download_dir: Option<String>,
    /// Download rate cap override in bytes per second.
    pub rate_limit_download_bps: Option<i64>,
    /// Upload rate cap override in bytes per second.
    pub rate_limit_upload_bps: Option<i64>,
    /// Queue position override.
    pub queue_position: Option<i64>,
    /// Auto-managed override.
    pub auto_managed: Option<bool>,
    /// Seed ratio limit override.
    pub seed_ratio_limit: Option<f64>,
    /// Seed time limit override in seconds.
    pub seed_time_limit: Option<i64>,
    /// Cleanup seed ratio threshold.
    pub cleanup_seed_ratio_limit: Option<f64>,
    /// Cleanup seed time threshold in seconds.
    pub cleanup_seed_time_limit: Option<i64>,
    /// Whether cleanup removes downloaded data.
    pub cleanup_remove_data: Option<bool>,
}

/// Fetches all per-label override rows for a profile.
///
/// # Errors
///
/// Returns [`DataError::QueryFailed`] when the query fails.
pub async fn fetch_label_policy_rows<'e, E>(
    executor: E,
    profile_id: &str,
) -> Result<Vec<LabelPolicyRow>>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, LabelPolicyRow>(SELECT_LABEL_POLICIES_SQL)
        .bind(profile_id)
        .fetch_all(executor)
        .await
        .map_err(map_query_err("fetch label policies"))
}

/// Replaces all per-label override rows for a profile.
///
/// # Errors
///
/// Returns [`DataError::QueryFailed`] when a statement fails.
pub async fn replace_label_policies(
    conn: &mut SqliteConnection,
    profile_id: &str,
    rows: &[LabelPolicyRow],
) -> Result<()> {
    sqlx::query("DELETE FROM app_label_policy WHERE profile_id = ?1")
        .bind(profile_id)
        .execute(&mut *conn)
        .await
        .map_err(map_query_err("clear label policies"))?;
    for row in rows {
        sqlx::query(INSERT_LABEL_POLICY_SQL)
            .bind(profile_id)
            .bind(&row.kind)
            .bind(&row.name)
            .bind(&row.download_dir)
            .bind(row.rate_limit_download_bps)
            .bind(row.rate_limit_upload_bps)
            .bind(row.queue_position)
            .bind(row.auto_managed)
            .bind(row.seed_ratio_limit)
            .bind(row.seed_time_limit)
            .bind(row.cleanup_seed_ratio_limit)
            .bind(row.cleanup_seed_time_limit)
            .bind(row.cleanup_remove_data)
            .execute(&mut *conn)
            .await
            .map_err(map_query_err("insert label policy"))?;
    }
    Ok(())
}

/// Persisted scalar columns of the engine profile singleton.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EngineProfileRow {
    /// Fixed identifier of the singleton row.
    pub id: String,
    /// Inbound listen port.
    pub listen_port: Option<i32>,
    /// IPv6 mode label (`disabled`, `enabled`, or `preferred`).
    pub ipv6_mode: String,
    /// Whether the DHT is enabled.
    pub enable_dht: bool,
    /// Whether local service discovery is enabled.
    pub enable_lsd: bool,
    /// Whether UPnP port mapping is enabled.
    pub enable_upnp: bool,
    /// Whether NAT-PMP port mapping is enabled.
    pub enable_natpmp: bool,
    /// Whether peer exchange is enabled.
    pub enable_pex: bool,
    /// Whether outgoing uTP connections are enabled.
    pub enable_outgoing_utp: bool,
    /// Whether incoming uTP connections are enabled.
    pub enable_incoming_utp: bool,
    /// Encryption policy label (`require`, `prefer`, or `disable`).
    pub encryption: String,
    /// Whether anonymous mode is enabled.
    pub anonymous_mode: bool,
    /// Whether all peer traffic is forced through the proxy.
    pub force_proxy: bool,
    /// Lower bound of the outgoing port range.
    pub outgoing_port_min: Option<i32>,
    /// Upper bound of the outgoing port range.
    pub outgoing_port_max: Option<i32>,
    /// DSCP value applied to peer sockets.
    pub peer_dscp: Option<i32>,
    /// Global download rate cap in bytes per second.
    pub max_download_bps: Option<i64>,
    /// Global upload rate cap in bytes per second.
    pub max_upload_bps: Option<i64>,
    /// Maximum number of active torrents.
    pub max_active: Option<i64>,
    /// Global connection limit.
    pub connections_limit: Option<i64>,
    /// Per-torrent connection limit.
    pub connections_limit_per_torrent: Option<i64>,
    /// Number of unchoke slots.
    pub unchoke_slots: Option<i64>,
    /// Half-open connection limit.
    pub half_open_limit: Option<i64>,
    /// Stop-seeding ratio threshold.
    pub seed_ratio_limit: Option<f64>,
    /// Stop-seeding time threshold in seconds.
    pub seed_time_limit: Option<i64>,
    /// Whether torrents are auto-managed by default.
    pub auto_managed: bool,
    /// Whether seeding torrents are preferred in the queue.
    pub prefer_seeds: bool,
    /// Whether slow torrents are excluded from the active count.
    pub dont_count_slow_torrents: bool,
    /// Staging directory for in-progress downloads.
    pub download_root: String,
    /// Directory holding fast-resume state.
    pub resume_dir: String,
    /// Storage allocation mode label (`sparse` or `allocate`).
    pub storage_mode: String,
    /// Disk cache size in MiB.
    pub cache_size_mib: Option<i64>,
    /// Disk cache expiry in seconds.
    pub cache_expiry_seconds: Option<i64>,
    /// Whether piece hashes are verified on read.
    pub verify_piece_hashes: bool,
    /// Whether new torrents default to sequential download.
    pub sequential_default: bool,
    /// Whether super seeding is enabled.
    pub super_seeding: bool,
    /// Session statistics polling interval in milliseconds.
    pub stats_interval_ms: Option<i64>,
    /// Row creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
}

/// Fetches the engine profile row.
///
/// # Errors
///
/// Returns [`DataError::QueryFailed`] when the row is missing or the query
/// fails; the row is seeded at startup, so absence is fatal.
pub async fn fetch_engine_profile_row<'e, E>(executor: E, id: &str) -> Result<EngineProfileRow>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, EngineProfileRow>(SELECT_ENGINE_PROFILE_SQL)
        .bind(id)
        .fetch_one(executor)
        .await
        .map_err(map_query_err("fetch engine profile"))
}

fn bind_engine_profile<'q>(
    query: sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments>,
    row: &'q EngineProfileRow,
) -> sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments> {
    query
        .bind(row.listen_port)
        .bind(&row.ipv6_mode)
        .bind(row.enable_dht)
        .bind(row.enable_lsd)
        .bind(row.enable_upnp)
        .bind(row.enable_natpmp)
        .bind(row.enable_pex)
        .bind(row.enable_outgoing_utp)
        .bind(row.enable_incoming_utp)
        .bind(&row.encryption)
        .bind(row.anonymous_mode)
        .bind(row.force_proxy)
        .bind(row.outgoing_port_min)
        .bind(row.outgoing_port_max)
        .bind(row.peer_dscp)
        .bind(row.max_download_bps)
        .bind(row.max_upload_bps)
        .bind(row.max_active)
        .bind(row.connections_limit)
        .bind(row.connections_limit_per_torrent)
        .bind(row.unchoke_slots)
        .bind(row.half_open_limit)
        .bind(row.seed_ratio_limit)
        .bind(row.seed_time_limit)
        .bind(row.auto_managed)
        .bind(row.prefer_seeds)
        .bind(row.dont_count_slow_torrents)
        .bind(&row.download_root)
        .bind(&row.resume_dir)
        .bind(&row.storage_mode)
        .bind(row.cache_size_mib)
        .bind(row.cache_expiry_seconds)
        .bind(row.verify_piece_hashes)
        .bind(row.sequential_default)
        .bind(row.super_seeding)
        .bind(row.stats_interval_ms)
}

/// Inserts the engine profile row.
///
/// # Errors
///
/// Returns [`DataError::QueryFailed`] when the insert fails.
pub async fn insert_engine_profile_row<'e, E>(executor: E, row: &EngineProfileRow) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    let query = sqlx::query(INSERT_ENGINE_PROFILE_SQL).bind(&row.id);
    bind_engine_profile(query, row)
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(executor)
        .await
        .map_err(map_query_err("insert engine profile"))?;
    Ok(())
}

/// Updates the scalar columns of the engine profile row.
///
/// # Errors
///
/// Returns [`DataError::QueryFailed`] when the update fails.
pub async fn update_engine_profile_row<'e, E>(executor: E, row: &EngineProfileRow) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    let query = sqlx::query(UPDATE_ENGINE_PROFILE_SQL);
    bind_engine_profile(query, row)
        .bind(row.updated_at)
        .bind(&row.id)
        .execute(executor)
        .await
        .map_err(map_query_err("update engine profile"))?;
    Ok(())
}

/// One ordered value from an engine string-list table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EngineListValueRow {
    /// List discriminator (`listen_interfaces`, `dht_bootstrap_nodes`, or
    /// `dht_router_nodes`).
    pub kind: String,
    /// List entry.
    pub value: String,
}

/// Fetches every engine string-list entry for a profile, ordered within each
/// list.
///
/// # Errors
///
/// Returns [`DataError::QueryFailed`] when the query fails.
pub async fn fetch_engine_list_values<'e, E>(
    executor: E,
    profile_id: &str,
) -> Result<Vec<EngineListValueRow>>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, EngineListValueRow>(
        "SELECT kind, value FROM engine_list_value WHERE profile_id = ?1 ORDER BY kind, ordinal",
    )
    .bind(profile_id)
    .fetch_all(executor)
    .await
    .map_err(map_query_err("fetch engine list values"))
}

/// Replaces one engine string list for a profile.
///
/// # Errors
///
/// Returns [`DataError::QueryFailed`] when a statement fails.
pub async fn replace_engine_list_values(
    conn: &mut SqliteConnection,
    profile_id: &str,
    kind: &str,
    values: &[String],
) -> Result<()> {
    sqlx::query("DELETE FROM engine_list_value WHERE profile_id = ?1 AND kind = ?2")
        .bind(profile_id)
        .bind(kind)
        .execute(&mut *conn)
        .await
        .map_err(map_query_err("clear engine list values"))?;
    for (ordinal, value) in (0_i64..).zip(values) {
        sqlx::query(
            "INSERT INTO engine_list_value (profile_id, kind, ordinal, value)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(profile_id)
        .bind(kind)
        .bind(ordinal)
        .bind(value)
        .execute(&mut *conn)
        .await
        .map_err(map_query_err("insert engine list value"))?;
    }
    Ok(())
}

/// Persisted IP filter metadata for a profile.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct IpFilterRow {
    /// Blocklist download URL.
    pub blocklist_url: Option<String>,
    /// ETag returned by the last blocklist fetch.
    pub etag: Option<String>,
    /// Timestamp of the last successful blocklist refresh.
    pub last_updated_at: Option<DateTime<Utc>>,
    /// Error message from the last failed refresh.
    pub last_error: Option<String>,
}

/// Fetches the IP filter metadata row for a profile.
///
/// # Errors
///
/// Returns [`DataError::QueryFailed`] when the query fails.
pub async fn fetch_ip_filter_row<'e, E>(
    executor: E,
    profile_id: &str,
) -> Result<Option<IpFilterRow>>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, IpFilterRow>(
        "SELECT blocklist_url, etag, last_updated_at, last_error
         FROM engine_ip_filter WHERE profile_id = ?1",
    )
    .bind(profile_id)
    .fetch_optional(executor)
    .await
    .map_err(map_query_err("fetch ip filter"))
}

/// Inserts or overwrites the IP filter metadata row for a profile.
///
/// # Errors
///
/// Returns [`DataError::QueryFailed`] when the statement fails.
pub async fn upsert_ip_filter_row<'e, E>(
    executor: E,
    profile_id: &str,
    row: &IpFilterRow,
) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(UPSERT_IP_FILTER_SQL)
        .bind(profile_id)
        .bind(&row.blocklist_url)
        .bind(&row.etag)
        .bind(row.last_updated_at)
        .bind(&row.last_error)
        .execute(executor)
        .await
        .map_err(map_query_err("upsert ip filter"))?;
    Ok(())
}

/// Records the outcome of a blocklist refresh without touching the URL.
///
/// Returns the number of rows updated; zero means no filter row exists yet.
///
/// # Errors
///
/// Returns [`DataError::QueryFailed`] when the update fails.
pub async fn update_ip_filter_status<'e, E>(
    executor: E,
    profile_id: &str,
    etag: Option<&str>,
    last_updated_at: Option<DateTime<Utc>>,
    last_error: Option<&str>,
) -> Result<u64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        "UPDATE engine_ip_filter SET etag = ?2, last_updated_at = ?3, last_error = ?4
         WHERE profile_id = ?1",
    )
    .bind(profile_id)
    .bind(etag)
    .bind(last_updated_at)
    .bind(last_error)
    .execute(executor)
    .await
    .map_err(map_query_err("update ip filter status"))?;
    Ok(result.rows_affected())
}

/// Fetches the ordered CIDR rules of a profile's IP filter.
///
/// # Errors
///
/// Returns [`DataError::QueryFailed`] when the query fails.
pub async fn fetch_ip_filter_rules<'e, E>(executor: E, profile_id: &str) -> Result<Vec<String>>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_scalar::<_, String>(
        "SELECT cidr FROM engine_ip_filter_rule WHERE profile_id = ?1 ORDER BY ordinal",
    )
    .bind(profile_id)
    .fetch_all(executor)
    .await
    .map_err(map_query_err("fetch ip filter rules"))
}

/// Replaces the CIDR rules of a profile's IP filter.
///
/// # Errors
///
/// Returns [`DataError::QueryFailed`] when a statement fails.
pub async fn replace_ip_filter_rules(
    conn: &mut SqliteConnection,
    profile_id: &str,
    cidrs: &[String],
) -> Result<()> {
    sqlx::query("DELETE FROM engine_ip_filter_rule WHERE profile_id = ?1")
        .bind(profile_id)
        .execute(&mut *conn)
        .await
        .map_err(map_query_err("clear ip filter rules"))?;
    for (ordinal, cidr) in (0_i64..).zip(cidrs) {
        sqlx::query(
            "INSERT INTO engine_ip_filter_rule (profile_id, ordinal, cidr) VALUES (?1, ?2, ?3)",
        )
        .bind(profile_id)
        .bind(ordinal)
        .bind(cidr)
        .execute(&mut *conn)
        .await
        .map_err(map_query_err("insert ip filter rule"))?;
    }
    Ok(())
}

/// Persisted alternate speed limits and schedule for a profile.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AltSpeedRow {
    /// Alternate download cap in bytes per second.
    pub download_bps: Option<i64>,
    /// Alternate upload cap in bytes per second.
    pub upload_bps: Option<i64>,
    /// Schedule window start, minutes after midnight.
    pub schedule_start_minutes: Option<i64>,
    /// Schedule window end, minutes after midnight.
    pub schedule_end_minutes: Option<i64>,
    /// Comma-separated canonical weekday labels.
    pub schedule_days: Option<String>,
}

/// Fetches the alternate speed row for a profile.
///
/// # Errors
///
/// Returns [`DataError::QueryFailed`] when the query fails.
pub async fn fetch_alt_speed_row<'e, E>(
    executor: E,
    profile_id: &str,
) -> Result<Option<AltSpeedRow>>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, AltSpeedRow>(
        "SELECT download_bps, upload_bps, schedule_start_minutes, schedule_end_minutes,
                schedule_days
         FROM engine_alt_speed WHERE profile_id = ?1",
    )
    .bind(profile_id)
    .fetch_optional(executor)
    .await
    .map_err(map_query_err("fetch alt speed"))
}

/// Inserts or overwrites the alternate speed row for a profile.
///
/// # Errors
///
/// Returns [`DataError::QueryFailed`] when the statement fails.
pub async fn upsert_alt_speed_row<'e, E>(
    executor: E,
    profile_id: &str,
    row: &AltSpeedRow,
) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(UPSERT_ALT_SPEED_SQL)
        .bind(profile_id)
        .bind(row.download_bps)
        .bind(row.upload_bps)
        .bind(row.schedule_start_minutes)
        .bind(row.schedule_end_minutes)
        .bind(&row.schedule_days)
        .execute(executor)
        .await
        .map_err(map_query_err("upsert alt speed"))?;
    Ok(())
}

/// Persisted tracker defaults for a profile.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TrackerRow {
    /// Whether configured trackers replace per-torrent trackers.
    pub replace_trackers: bool,
    /// Whether every tracker is announced to.
    pub announce_to_all: bool,
    /// User agent sent to trackers.
    pub user_agent: Option<String>,
    /// IP address reported in announces.
    pub announce_ip: Option<String>,
    /// Interface used for tracker traffic.
    pub listen_interface: Option<String>,
    /// Tracker request timeout in milliseconds.
    pub request_timeout_ms: Option<i64>,
    /// Secret name of the client TLS certificate.
    pub ssl_cert: Option<String>,
    /// Secret name of the client TLS private key.
    pub ssl_private_key: Option<String>,
    /// Secret name of the CA certificate bundle.
    pub ssl_ca_cert: Option<String>,
    /// Whether tracker TLS certificates are verified.
    pub ssl_verify: bool,
    /// Proxy host.
    pub proxy_host: Option<String>,
    /// Proxy port.
    pub proxy_port: Option<i32>,
    /// Proxy kind label (`http`, `https`, or `socks5`).
    pub proxy_kind: Option<String>,
    /// Secret name of the proxy username.
    pub proxy_username_secret: Option<String>,
    /// Secret name of the proxy password.
    pub proxy_password_secret: Option<String>,
    /// Whether peer connections also flow through the proxy.
    pub proxy_peers: Option<bool>,
    /// Secret name of the tracker auth username.
    pub auth_username_secret: Option<String>,
    /// Secret name of the tracker auth password.
    pub auth_password_secret: Option<String>,
    /// Secret name of the tracker auth cookie.
    pub auth_cookie_secret: Option<String>,
}

/// Fetches the tracker defaults row for a profile.
///
/// # Errors
///
/// Returns [`DataError::QueryFailed`] when the query fails.
pub async fn fetch_tracker_row<'e, E>(executor: E, profile_id: &str) -> Result<Option<TrackerRow>>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, TrackerRow>(SELECT_TRACKER_SQL)
        .bind(profile_id)
        .fetch_optional(executor)
        .await
        .map_err(map_query_err("fetch tracker config"))
}

/// Inserts or overwrites the tracker defaults row for a profile.
///
/// # Errors
///
/// Returns [`DataError::QueryFailed`] when the statement fails.
pub async fn upsert_tracker_row<'e, E>(
    executor: E,
    profile_id: &str,
    row: &TrackerRow,
) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(UPSERT_TRACKER_SQL)
        .bind(profile_id)
        .bind(row.replace_trackers)
        .bind(row.announce_to_all)
        .bind(&row.user_agent)
        .bind(&row.announce_ip)
        .bind(&row.listen_interface)
        .bind(row.request_timeout_ms)
        .bind(&row.ssl_cert)
        .bind(&row.ssl_private_key)
        .bind(&row.ssl_ca_cert)
        .bind(row.ssl_verify)
        .bind(&row.proxy_host)
        .bind(row.proxy_port)
        .bind(&row.proxy_kind)
        .bind(&row.proxy_username_secret)
        .bind(&row.proxy_password_secret)
        .bind(row.proxy_peers)
        .bind(&row.auth_username_secret)
        .bind(&row.auth_password_secret)
        .bind(&row.auth_cookie_secret)
        .execute(executor)
        .await
        .map_err(map_query_err("upsert tracker config"))?;
    Ok(())
}

/// One ordered tracker URL.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TrackerUrlRow {
    /// URL list discriminator (`default` or `extra`).
    pub kind: String,
    /// Announce URL.
    pub url: String,
}

/// Fetches every tracker URL for a profile, ordered within each list.
///
/// # Errors
///
/// Returns [`DataError::QueryFailed`] when the query fails.
pub async fn fetch_tracker_urls<'e, E>(executor: E, profile_id: &str) -> Result<Vec<TrackerUrlRow>>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, TrackerUrlRow>(
        "SELECT kind, url FROM engine_tracker_url WHERE profile_id = ?1 ORDER BY kind, ordinal",
    )
    .bind(profile_id)
    .fetch_all(executor)
    .await
    .map_err(map_query_err("fetch tracker urls"))
}

/// Replaces one tracker URL list for a profile.
///
/// # Errors
///
/// Returns [`DataError::QueryFailed`] when a statement fails.
pub async fn replace_tracker_urls(
    conn: &mut SqliteConnection,
    profile_id: &str,
    kind: &str,
    urls: &[String],
) -> Result<()> {
    sqlx::query("DELETE FROM engine_tracker_url WHERE profile_id = ?1 AND kind = ?2")
        .bind(profile_id)
        .bind(kind)
        .execute(&mut *conn)
        .await
        .map_err(map_query_err("clear tracker urls"))?;
    for (ordinal, url) in (0_i64..).zip(urls) {
        sqlx::query(
            "INSERT INTO engine_tracker_url (profile_id, kind, ordinal, url)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(profile_id)
        .bind(kind)
        .bind(ordinal)
        .bind(url)
        .execute(&mut *conn)
        .await
        .map_err(map_query_err("insert tracker url"))?;
    }
    Ok(())
}

/// Persisted peer class definition.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PeerClassRow {
    /// Class identifier, 0 through 31.
    pub class_id: i16,
    /// Operator-visible class label.
    pub label: String,
    /// Download priority, 1 through 255.
    pub download_priority: i16,
    /// Upload priority, 1 through 255.
    pub upload_priority: i16,
    /// Connection limit multiplier, at least 1.
    pub connection_limit_factor: i32,
    /// Whether the class ignores unchoke slot limits.
    pub ignore_unchoke_slots: bool,
}

/// Fetches the peer class definitions for a profile, ordered by class id.
///
/// # Errors
///
/// Returns [`DataError::QueryFailed`] when the query fails.
pub async fn fetch_peer_class_rows<'e, E>(
    executor: E,
    profile_id: &str,
) -> Result<Vec<PeerClassRow>>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, PeerClassRow>(
        "SELECT class_id, label, download_priority, upload_priority,
                connection_limit_factor, ignore_unchoke_slots
         FROM engine_peer_class WHERE profile_id = ?1 ORDER BY class_id",
    )
    .bind(profile_id)
    .fetch_all(executor)
    .await
    .map_err(map_query_err("fetch peer classes"))
}

/// Replaces the peer class definitions for a profile.
///
/// Clearing the definitions cascades to the default assignments, so callers
/// must replace those afterwards.
///
/// # Errors
///
/// Returns [`DataError::QueryFailed`] when a statement fails.
pub async fn replace_peer_classes(
    conn: &mut SqliteConnection,
    profile_id: &str,
    rows: &[PeerClassRow],
) -> Result<()> {
    sqlx::query("DELETE FROM engine_peer_class WHERE profile_id = ?1")
        .bind(profile_id)
        .execute(&mut *conn)
        .await
        .map_err(map_query_err("clear peer classes"))?;
    for row in rows {
        sqlx::query(
            "INSERT INTO engine_peer_class (
                profile_id, class_id, label, download_priority, upload_priority,
                connection_limit_factor, ignore_unchoke_slots
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(profile_id)
        .bind(row.class_id)
        .bind(&row.label)
        .bind(row.download_priority)
        .bind(row.upload_priority)
        .bind(row.connection_limit_factor)
        .bind(row.ignore_unchoke_slots)
        .execute(&mut *conn)
        .await
        .map_err(map_query_err("insert peer class"))?;
    }
    Ok(())
}

/// Fetches the class ids assigned to new peers by default, ordered by id.
///
/// # Errors
///
/// Returns [`DataError::QueryFailed`] when the query fails.
pub async fn fetch_peer_class_defaults<'e, E>(executor: E, profile_id: &str) -> Result<Vec<i16>>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_scalar::<_, i16>(
        "SELECT class_id FROM engine_peer_class_default WHERE profile_id = ?1 ORDER BY class_id",
    )
    .bind(profile_id)
    .fetch_all(executor)
    .await
    .map_err(map_query_err("fetch peer class defaults"))
}

/// Replaces the default peer class assignments for a profile.
///
/// # Errors
///
/// Returns [`DataError::QueryFailed`] when a statement fails.
pub async fn replace_peer_class_defaults(
    conn: &mut SqliteConnection,
    profile_id: &str,
    class_ids: &[i16],
) -> Result<()> {
    sqlx::query("DELETE FROM engine_peer_class_default WHERE profile_id = ?1")
        .bind(profile_id)
        .execute(&mut *conn)
        .await
        .map_err(map_query_err("clear peer class defaults"))?;
    for class_id in class_ids {
        sqlx::query("INSERT INTO engine_peer_class_default (profile_id, class_id) VALUES (?1, ?2)")
            .bind(profile_id)
            .bind(class_id)
            .execute(&mut *conn)
            .await
            .map_err(map_query_err("insert peer class default"))?;
    }
    Ok(())
}

/// Persisted scalar columns of the filesystem policy singleton.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FsPolicyRow {
    /// Fixed identifier of the singleton row.
    pub id: String,
    /// Root directory of the completed-download library.
    pub library_root: String,
    /// Whether archives are extracted after completion.
    pub extract: bool,
    /// PAR2 handling label (`off`, `verify`, or `repair`).
    pub par2: String,
    /// Whether single-file directories are flattened on import.
    pub flatten: bool,
    /// Import transfer mode label (`hardlink`, `copy`, or `move`).
    pub move_mode: String,
    /// Octal mode applied to imported files.
    pub chmod_file: Option<String>,
    /// Octal mode applied to imported directories.
    pub chmod_dir: Option<String>,
    /// Owner applied to imported entries.
    pub owner: Option<String>,
    /// Group applied to imported entries.
    pub group_name: Option<String>,
    /// Umask applied while importing.
    pub umask: Option<String>,
    /// Row creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
}

/// Fetches the filesystem policy row.
///
/// # Errors
///
/// Returns [`DataError::QueryFailed`] when the row is missing or the query
/// fails; the row is seeded at startup, so absence is fatal.
pub async fn fetch_fs_policy_row<'e, E>(executor: E, id: &str) -> Result<FsPolicyRow>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, FsPolicyRow>(SELECT_FS_POLICY_SQL)
        .bind(id)
        .fetch_one(executor)
        .await
        .map_err(map_query_err("fetch fs policy"))
}

/// Inserts the filesystem policy row.
///
/// # Errors
///
/// Returns [`DataError::QueryFailed`] when the insert fails.
pub async fn insert_fs_policy_row<'e, E>(executor: E, row: &FsPolicyRow) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(INSERT_FS_POLICY_SQL)
        .bind(&row.id)
        .bind(&row.library_root)
        .bind(row.extract)
        .bind(&row.par2)
        .bind(row.flatten)
        .bind(&row.move_mode)
        .bind(&row.chmod_file)
        .bind(&row.chmod_dir)
        .bind(&row.owner)
        .bind(&row.group_name)
        .bind(&row.umask)
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(executor)
        .await
        .map_err(map_query_err("insert fs policy"))?;
    Ok(())
}

/// Updates the scalar columns of the filesystem policy row.
///
/// # Errors
///
/// Returns [`DataError::QueryFailed`] when the update fails.
pub async fn update_fs_policy_row<'e, E>(executor: E, row: &FsPolicyRow) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(UPDATE_FS_POLICY_SQL)
        .bind(&row.library_root)
        .bind(row.extract)
        .bind(&row.par2)
        .bind(row.flatten)
        .bind(&row.move_mode)
        .bind(&row.chmod_file)
        .bind(&row.chmod_dir)
        .bind(&row.owner)
        .bind(&row.group_name)
        .bind(&row.umask)
        .bind(row.updated_at)
        .bind(&row.id)
        .execute(executor)
        .await
        .map_err(map_query_err("update fs policy"))?;
    Ok(())
}

/// One ordered path from a filesystem policy path list.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FsPathRow {
    /// Path list discriminator (`cleanup_keep`, `cleanup_drop`, or
    /// `allow_paths`).
    pub kind: String,
    /// Path or glob pattern.
    pub path: String,
}

/// Fetches every path-list entry for a policy, ordered within each list.
///
/// # Errors
///
/// Returns [`DataError::QueryFailed`] when the query fails.
pub async fn fetch_fs_policy_paths<'e, E>(executor: E, policy_id: &str) -> Result<Vec<FsPathRow>>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, FsPathRow>(
        "SELECT kind, path FROM fs_policy_path WHERE policy_id = ?1 ORDER BY kind, ordinal",
    )
    .bind(policy_id)
    .fetch_all(executor)
    .await
    .map_err(map_query_err("fetch fs policy paths"))
}

/// Replaces one path list for a policy.
///
/// # Errors
///
/// Returns [`DataError::QueryFailed`] when a statement fails.
pub async fn replace_fs_policy_paths(
    conn: &mut SqliteConnection,
    policy_id: &str,
    kind: &str,
    paths: &[String],
) -> Result<()> {
    sqlx::query("DELETE FROM fs_policy_path WHERE policy_id = ?1 AND kind = ?2")
        .bind(policy_id)
        .bind(kind)
        .execute(&mut *conn)
        .await
        .map_err(map_query_err("clear fs policy paths"))?;
    for (ordinal, path) in (0_i64..).zip(paths) {
        sqlx::query(
            "INSERT INTO fs_policy_path (policy_id, kind, ordinal, path) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(policy_id)
        .bind(kind)
        .bind(ordinal)
        .bind(path)
        .execute(&mut *conn)
        .await
        .map_err(map_query_err("insert fs policy path"))?;
    }
    Ok(())
}

/// Persisted API key credential.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ApiKeyRow {
    /// Stable key identifier presented by clients.
    pub key_id: String,
    /// Opaque hash of the key material.
    pub hash: String,
    /// Operator-visible label.
    pub label: Option<String>,
    /// Whether the key is accepted for authentication.
    pub enabled: bool,
    /// Expiry instant; `None` means the key never expires.
    pub expires_at: Option<DateTime<Utc>>,
    /// Rate limit burst size.
    pub rate_limit_burst: Option<i64>,
    /// Rate limit refill window in seconds.
    pub rate_limit_per_seconds: Option<i64>,
    /// Row creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
}

/// Reports whether a key with the given id exists, enabled or not.
///
/// # Errors
///
/// Returns [`DataError::QueryFailed`] when the query fails.
pub async fn api_key_exists<'e, E>(executor: E, key_id: &str) -> Result<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_scalar::<_, bool>("SELECT EXISTS (SELECT 1 FROM auth_api_key WHERE key_id = ?1)")
        .bind(key_id)
        .fetch_one(executor)
        .await
        .map_err(map_query_err("check api key presence"))
}

/// Fetches an API key by id regardless of its enabled or expiry state.
///
/// # Errors
///
/// Returns [`DataError::QueryFailed`] when the query fails.
pub async fn fetch_api_key_row<'e, E>(executor: E, key_id: &str) -> Result<Option<ApiKeyRow>>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, ApiKeyRow>(SELECT_API_KEY_SQL)
        .bind(key_id)
        .fetch_optional(executor)
        .await
        .map_err(map_query_err("fetch api key"))
}

/// Inserts an API key or overwrites every mutable column of an existing one.
///
/// `created_at` is preserved when the key already exists.
///
/// # Errors
///
/// Returns [`DataError::QueryFailed`] when the statement fails.
pub async fn upsert_api_key_row<'e, E>(executor: E, row: &ApiKeyRow) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(UPSERT_API_KEY_SQL)
        .bind(&row.key_id)
        .bind(&row.hash)
        .bind(&row.label)
        .bind(row.enabled)
        .bind(row.expires_at)
        .bind(row.rate_limit_burst)
        .bind(row.rate_limit_per_seconds)
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(executor)
        .await
        .map_err(map_query_err("upsert api key"))?;
    Ok(())
}

/// Enables or disables an API key, returning the number of rows touched.
///
/// # Errors
///
/// Returns [`DataError::QueryFailed`] when the update fails.
pub async fn set_api_key_enabled<'e, E>(
    executor: E,
    key_id: &str,
    enabled: bool,
    now: DateTime<Utc>,
) -> Result<u64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result =
        sqlx::query("UPDATE auth_api_key SET enabled = ?2, updated_at = ?3 WHERE key_id = ?1")
            .bind(key_id)
            .bind(enabled)
            .bind(now)
            .execute(executor)
            .await
            .map_err(map_query_err("set api key enabled"))?;
    Ok(result.rows_affected())
}

/// Sets or clears an API key expiry, returning the number of rows touched.
///
/// # Errors
///
/// Returns [`DataError::QueryFailed`] when the update fails.
pub async fn set_api_key_expiry<'e, E>(
    executor: E,
    key_id: &str,
    expires_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<u64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result =
        sqlx::query("UPDATE auth_api_key SET expires_at = ?2, updated_at = ?3 WHERE key_id = ?1")
            .bind(key_id)
            .bind(expires_at)
            .bind(now)
            .execute(executor)
            .await
            .map_err(map_query_err("set api key expiry"))?;
    Ok(result.rows_affected())
}

/// Sets or clears an API key rate limit, returning the number of rows touched.
///
/// # Errors
///
/// Returns [`DataError::QueryFailed`] when the update fails.
pub async fn set_api_key_rate_limit<'e, E>(
    executor: E,
    key_id: &str,
    limit: Option<(i64, i64)>,
    now: DateTime<Utc>,
) -> Result<u64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let (burst, per_seconds) = limit.map_or((None, None), |(b, p)| (Some(b), Some(p)));
    let result = sqlx::query(
        "UPDATE auth_api_key SET rate_limit_burst = ?2, rate_limit_per_seconds = ?3,
                updated_at = ?4
         WHERE key_id = ?1",
    )
    .bind(key_id)
    .bind(burst)
    .bind(per_seconds)
    .bind(now)
    .execute(executor)
    .await
    .map_err(map_query_err("set api key rate limit"))?;
    Ok(result.rows_affected())
}

/// Deletes an API key, returning the number of rows removed.
///
/// # Errors
///
/// Returns [`DataError::QueryFailed`] when the delete fails.
pub async fn delete_api_key<'e, E>(executor: E, key_id: &str) -> Result<u64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query("DELETE FROM auth_api_key WHERE key_id = ?1")
        .bind(key_id)
        .execute(executor)
        .await
        .map_err(map_query_err("delete api key"))?;
    Ok(result.rows_affected())
}

/// Lists keys that are enabled and unexpired as of `now`.
///
/// # Errors
///
/// Returns [`DataError::QueryFailed`] when the query fails.
pub async fn list_active_api_keys<'e, E>(executor: E, now: DateTime<Utc>) -> Result<Vec<ApiKeyRow>>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, ApiKeyRow>(LIST_ACTIVE_API_KEYS_SQL)
        .bind(now)
        .fetch_all(executor)
        .await
        .map_err(map_query_err("list active api keys"))
}

/// Point lookup of a single key, applying the same enabled and expiry gates
/// as [`list_active_api_keys`].
///
/// # Errors
///
/// Returns [`DataError::QueryFailed`] when the query fails.
pub async fn fetch_active_api_key<'e, E>(
    executor: E,
    key_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<ApiKeyRow>>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, ApiKeyRow>(SELECT_ACTIVE_API_KEY_SQL)
        .bind(key_id)
        .bind(now)
        .fetch_optional(executor)
        .await
        .map_err(map_query_err("fetch active api key"))
}

/// Reports whether any API key exists, regardless of state.
///
/// # Errors
///
/// Returns [`DataError::QueryFailed`] when the query fails.
pub async fn any_api_keys<'e, E>(executor: E) -> Result<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_scalar::<_, bool>("SELECT EXISTS (SELECT 1 FROM auth_api_key)")
        .fetch_one(executor)
        .await
        .map_err(map_query_err("check api key presence"))
}

/// Persisted named secret.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SecretRow {
    /// Unique secret name.
    pub name: String,
    /// Sealed secret payload.
    pub ciphertext: Vec<u8>,
    /// Actor that last wrote the secret.
    pub created_by: Option<String>,
    /// Row creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
}

/// Reports whether a secret with the given name exists.
///
/// # Errors
///
/// Returns [`DataError::QueryFailed`] when the query fails.
pub async fn secret_exists<'e, E>(executor: E, name: &str) -> Result<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_scalar::<_, bool>("SELECT EXISTS (SELECT 1 FROM settings_secret WHERE name = ?1)")
        .bind(name)
        .fetch_one(executor)
        .await
        .map_err(map_query_err("check secret presence"))
}

/// Inserts a secret or overwrites an existing one under the same name.
///
/// # Errors
///
/// Returns [`DataError::QueryFailed`] when the statement fails.
pub async fn upsert_secret<'e, E>(
    executor: E,
    name: &str,
    ciphertext: &[u8],
    created_by: Option<&str>,
    now: DateTime<Utc>,
) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(UPSERT_SECRET_SQL)
        .bind(name)
        .bind(ciphertext)
        .bind(created_by)
        .bind(now)
        .bind(now)
        .execute(executor)
        .await
        .map_err(map_query_err("upsert secret"))?;
    Ok(())
}

/// Fetches a secret by name.
///
/// # Errors
///
/// Returns [`DataError::QueryFailed`] when the query fails.
pub async fn fetch_secret<'e, E>(executor: E, name: &str) -> Result<Option<SecretRow>>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, SecretRow>(
        "SELECT name, ciphertext, created_by, created_at, updated_at
         FROM settings_secret WHERE name = ?1",
    )
    .bind(name)
    .fetch_optional(executor)
    .await
    .map_err(map_query_err("fetch secret"))
}

/// Deletes a secret, returning the number of rows removed.
///
/// # Errors
///
/// Returns [`DataError::QueryFailed`] when the delete fails.
pub async fn delete_secret<'e, E>(executor: E, name: &str) -> Result<u64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query("DELETE FROM settings_secret WHERE name = ?1")
        .bind(name)
        .execute(executor)
        .await
        .map_err(map_query_err("delete secret"))?;
    Ok(result.rows_affected())
}

/// Persisted one-time setup token.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SetupTokenRow {
    /// Token identifier.
    pub id: String,
    /// Opaque hash of the token material.
    pub token_hash: String,
    /// Issuance instant.
    pub issued_at: DateTime<Utc>,
    /// Expiry instant.
    pub expires_at: DateTime<Utc>,
    /// Consumption instant; `None` while the token is still live.
    pub consumed_at: Option<DateTime<Utc>>,
}

/// Inserts a freshly issued setup token.
///
/// # Errors
///
/// Returns [`DataError::QueryFailed`] when the insert fails, including when
/// the single-active uniqueness index rejects a second unconsumed token.
pub async fn insert_setup_token<'e, E>(executor: E, row: &SetupTokenRow) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO setup_token (id, token_hash, issued_at, expires_at, consumed_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )
    .bind(&row.id)
    .bind(&row.token_hash)
    .bind(row.issued_at)
    .bind(row.expires_at)
    .bind(row.consumed_at)
    .execute(executor)
    .await
    .map_err(map_query_err("insert setup token"))?;
    Ok(())
}

/// Fetches a setup token by id, regardless of state.
///
/// # Errors
///
/// Returns [`DataError::QueryFailed`] when the query fails.
pub async fn fetch_setup_token<'e, E>(executor: E, id: &str) -> Result<Option<SetupTokenRow>>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, SetupTokenRow>(
        "SELECT id, token_hash, issued_at, expires_at, consumed_at
         FROM setup_token WHERE id = ?1",
    )
    .bind(id)
    .fetch_optional(executor)
    .await
    .map_err(map_query_err("fetch setup token"))
}

/// Fetches the unconsumed, unexpired token if one exists.
///
/// At most one unconsumed token can exist at a time, enforced by a partial
/// unique index.
///
/// # Errors
///
/// Returns [`DataError::QueryFailed`] when the query fails.
pub async fn fetch_active_setup_token<'e, E>(
    executor: E,
    now: DateTime<Utc>,
) -> Result<Option<SetupTokenRow>>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, SetupTokenRow>(
        "SELECT id, token_hash, issued_at, expires_at, consumed_at
         FROM setup_token WHERE consumed_at IS NULL AND expires_at > ?1",
    )
    .bind(now)
    .fetch_optional(executor)
    .await
    .map_err(map_query_err("fetch active setup token"))
}

/// Marks a token consumed, returning the number of rows touched.
///
/// Zero means the token was already consumed or never existed.
///
/// # Errors
///
/// Returns [`DataError::QueryFailed`] when the update fails.
pub async fn consume_setup_token_row<'e, E>(
    executor: E,
    id: &str,
    now: DateTime<Utc>,
) -> Result<u64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result =
        sqlx::query("UPDATE setup_token SET consumed_at = ?2 WHERE id = ?1 AND consumed_at IS NULL")
            .bind(id)
            .bind(now)
            .execute(executor)
            .await
            .map_err(map_query_err("consume setup token"))?;
    Ok(result.rows_affected())
}

/// Deletes every token whose expiry has passed, consumed or not, returning
/// the number of rows removed.
///
/// # Errors
///
/// Returns [`DataError::QueryFailed`] when the delete fails.
pub async fn delete_expired_setup_tokens<'e, E>(executor: E, now: DateTime<Utc>) -> Result<u64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query("DELETE FROM setup_token WHERE expires_at <= ?1")
        .bind(now)
        .execute(executor)
        .await
        .map_err(map_query_err("sweep setup tokens"))?;
    Ok(result.rows_affected())
}

/// Empties every settings and runtime table ahead of a factory reset.
///
/// Sub-resource tables are cleared through foreign key cascades.
///
/// # Errors
///
/// Returns [`DataError::QueryFailed`] when a delete fails.
pub async fn wipe_store_tables(conn: &mut SqliteConnection) -> Result<()> {
    for sql in WIPE_STATEMENTS {
        sqlx::query(*sql)
            .execute(&mut *conn)
            .await
            .map_err(map_query_err("wipe settings tables"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_query_err_labels_operation() {
        let err = map_query_err("fetch settings revision")(sqlx::Error::RowNotFound);
        match err {
            DataError::QueryFailed { operation, .. } => {
                assert_eq!(operation, "fetch settings revision");
            }
            DataError::MigrationFailed { .. } => panic!("unexpected variant"),
        }
    }
}
