//! SQLite-backed settings facade.
//!
//! Layout: `model.rs` and `engine_profile.rs` (typed aggregates and update
//! types), `validate.rs` (parsing helpers), with this module hosting the
//! `SettingsFacade`/`ConfigStore` implementation, the transactional change
//! scope, and the snapshot watcher.

use async_trait::async_trait;
use capstan_data::config::{
    self as data, AltSpeedRow, ApiKeyRow, AppProfileRow, EngineProfileRow, FsPathRow, FsPolicyRow,
    IpFilterRow, LabelPolicyRow, PeerClassRow, SetupTokenRow, TrackerRow,
};
use capstan_events::{ChangeBus, ChangeOp, SettingsChange, SettingsEvent, SettingsStream};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::defaults::{
    APP_PROFILE_ID, ENGINE_PROFILE_ID, FS_POLICY_ID, default_app_profile, default_engine_profile,
    default_fs_policy,
};
use crate::engine_profile::{
    AltSpeedConfig, AltSpeedSchedule, EncryptionPolicy, EngineBehavior, EngineLimits,
    EngineNetwork, EngineProfile, EngineProfileUpdate, EngineQueueing, EngineStorage,
    IpFilterConfig, Ipv6Mode, PeerClassConfig, PeerClassesConfig, StorageMode, TrackerAuthConfig,
    TrackerConfig, TrackerProxyConfig, TrackerProxyType, clamp_rate_limit, merge_update,
};
use crate::error::{ConfigError, ConfigResult};
use crate::model::{
    ApiKeyAuth, ApiKeyPatch, ApiKeyRateLimit, ApiKeyUpsert, AppProfile, AppProfileUpdate,
    AppliedChanges, ConfigSnapshot, FsPolicy, FsPolicyUpdate, LabelPolicy, Secret, SecretPatch,
    SettingsChangeset, SetupToken, TelemetryConfig, Toggle,
};
use crate::validate::{
    non_empty, normalize_string_list, parse_bind_addr, parse_uuid, parse_weekday_label,
    validate_octal_mode, weekday_label,
};

type Result<T> = ConfigResult<T>;

const APP_PROFILE_TABLE: &str = "app_profile";
const ENGINE_PROFILE_TABLE: &str = "engine_profile";
const FS_POLICY_TABLE: &str = "fs_policy";
const AUTH_API_KEY_TABLE: &str = "auth_api_key";
const SETTINGS_SECRET_TABLE: &str = "settings_secret";
const SETUP_TOKEN_TABLE: &str = "setup_token";

const LIST_LISTEN_INTERFACES: &str = "listen_interfaces";
const LIST_DHT_BOOTSTRAP: &str = "dht_bootstrap_nodes";
const LIST_DHT_ROUTERS: &str = "dht_router_nodes";
const URL_KIND_DEFAULT: &str = "default";
const URL_KIND_EXTRA: &str = "extra";
const PATH_CLEANUP_KEEP: &str = "cleanup_keep";
const PATH_CLEANUP_DROP: &str = "cleanup_drop";
const PATH_ALLOW: &str = "allow_paths";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_POOL_CONNECTIONS: u32 = 5;

fn map_sqlx_err(operation: &'static str) -> impl FnOnce(sqlx::Error) -> ConfigError {
    move |source| ConfigError::Database { operation, source }
}

fn map_data_err(operation: &'static str) -> impl FnOnce(capstan_data::DataError) -> ConfigError {
    move |source| ConfigError::DataAccess { operation, source }
}

#[async_trait]
/// Abstraction over the settings store consumed by the rest of the system.
///
/// Every mutating call runs in a single transaction, bumps the shared
/// revision counter exactly once, and publishes its change records only
/// after the transaction commits.
pub trait SettingsFacade: Send + Sync {
    /// Retrieve the current application profile.
    async fn get_app_profile(&self) -> Result<AppProfile>;
    /// Retrieve the current engine profile.
    async fn get_engine_profile(&self) -> Result<EngineProfile>;
    /// Retrieve the current filesystem policy.
    async fn get_fs_policy(&self) -> Result<FsPolicy>;
    /// Read every aggregate plus the revision in one consistent view.
    async fn snapshot(&self) -> Result<ConfigSnapshot>;
    /// Read the current revision counter.
    async fn revision(&self) -> Result<i64>;
    /// Subscribe to raw change records published after this call.
    fn subscribe_changes(&self) -> SettingsStream;
    /// Replace the application profile, bumping its version.
    async fn update_app_profile(&self, update: AppProfileUpdate) -> Result<AppliedChanges>;
    /// Apply the provided engine profile sections.
    async fn update_engine_profile(&self, update: EngineProfileUpdate) -> Result<AppliedChanges>;
    /// Replace the filesystem policy.
    async fn update_fs_policy(&self, update: FsPolicyUpdate) -> Result<AppliedChanges>;
    /// Apply a batched changeset atomically under one revision.
    async fn apply_changeset(
        &self,
        actor: &str,
        changeset: SettingsChangeset,
    ) -> Result<AppliedChanges>;
    /// Record the outcome of a blocklist fetch on the engine profile.
    async fn set_ip_filter_status(
        &self,
        etag: Option<&str>,
        last_updated_at: Option<DateTime<Utc>>,
        last_error: Option<&str>,
    ) -> Result<()>;
    /// Create or update an API key, returning the revision it landed at.
    async fn upsert_api_key(&self, upsert: ApiKeyUpsert) -> Result<i64>;
    /// Delete an API key, returning how many rows were removed.
    async fn delete_api_key(&self, key_id: &str) -> Result<u64>;
    /// Enable or disable an API key; reports whether a row changed.
    async fn set_api_key_enabled(&self, key_id: &str, enabled: bool) -> Result<bool>;
    /// Set or clear an API key expiry; reports whether a row changed.
    async fn set_api_key_expiry(
        &self,
        key_id: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<bool>;
    /// Set or clear an API key rate limit; reports whether a row changed.
    async fn set_api_key_rate_limit(
        &self,
        key_id: &str,
        limit: Option<ApiKeyRateLimit>,
    ) -> Result<bool>;
    /// List the keys currently accepted for authentication.
    async fn active_api_keys(&self) -> Result<Vec<ApiKeyAuth>>;
    /// Look up one key, honouring the enabled and expiry gates.
    async fn api_key_auth(&self, key_id: &str) -> Result<Option<ApiKeyAuth>>;
    /// Check whether any API keys exist at all, active or not.
    async fn has_api_keys(&self) -> Result<bool>;
    /// Store or overwrite a named secret on behalf of an actor.
    async fn put_secret(&self, actor: &str, name: &str, value: &[u8]) -> Result<()>;
    /// Retrieve a secret by name if present.
    async fn get_secret(&self, name: &str) -> Result<Option<Secret>>;
    /// Delete a secret, returning how many rows were removed.
    async fn delete_secret(&self, name: &str) -> Result<u64>;
    /// Issue a setup token valid for `ttl`, failing if one is outstanding.
    async fn issue_setup_token(&self, token_hash: &str, ttl: ChronoDuration) -> Result<SetupToken>;
    /// Retrieve the unconsumed, unexpired setup token if one exists.
    async fn active_setup_token(&self) -> Result<Option<SetupToken>>;
    /// Permanently consume a setup token.
    async fn consume_setup_token(&self, id: Uuid) -> Result<SetupToken>;
    /// Remove expired setup tokens, returning how many were dropped.
    async fn sweep_setup_tokens(&self) -> Result<u64>;
    /// Wipe every settings and runtime table and reseed factory defaults.
    async fn factory_reset(&self) -> Result<ConfigSnapshot>;
}

/// Concrete store backed by `SQLite` + `SQLx`.
#[derive(Clone)]
pub struct ConfigStore {
    pool: SqlitePool,
    bus: ChangeBus,
}

impl ConfigStore {
    /// Open (creating if needed) the settings database at `path`, apply
    /// migrations, and seed factory defaults on an empty database.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrations fail.
    #[instrument(name = "config_store.open", skip(path))]
    pub async fn open(path: impl AsRef<Path> + Send) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_POOL_CONNECTIONS)
            .connect_with(options)
            .await
            .map_err(map_sqlx_err("open settings database"))?;
        Self::with_pool(pool).await
    }

    /// Build a store over an existing pool, applying migrations and seeding
    /// factory defaults on an empty database.
    ///
    /// # Errors
    ///
    /// Returns an error if migrations or the seed transaction fail.
    #[instrument(name = "config_store.with_pool", skip(pool))]
    pub async fn with_pool(pool: SqlitePool) -> Result<Self> {
        data::run_migrations(&pool)
            .await
            .map_err(map_data_err("apply settings migrations"))?;
        let store = Self {
            pool,
            bus: ChangeBus::new(),
        };
        store.ensure_seeded().await?;
        Ok(store)
    }

    /// Subscribe to coalesced snapshots, one per committed revision.
    ///
    /// # Errors
    ///
    /// Returns an error if the current revision cannot be read.
    pub async fn watch_settings(&self) -> Result<ConfigWatcher> {
        let stream = self.bus.subscribe();
        let last_revision = data::fetch_revision(&self.pool)
            .await
            .map_err(map_data_err("read settings revision"))?;
        Ok(ConfigWatcher {
            store: self.clone(),
            stream,
            last_revision,
        })
    }

    /// Seeding is not a settings mutation: it neither bumps the revision
    /// counter nor publishes change records.
    async fn ensure_seeded(&self) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(map_sqlx_err("begin seed transaction"))?;
        let now = Utc::now();
        data::ensure_revision_row(tx.as_mut(), now)
            .await
            .map_err(map_data_err("seed revision row"))?;
        let seeded = data::app_profile_exists(tx.as_mut())
            .await
            .map_err(map_data_err("check seeded profiles"))?;
        if !seeded {
            seed_defaults(tx.as_mut(), now).await?;
            info!("seeded default configuration profiles");
        }
        tx.commit()
            .await
            .map_err(map_sqlx_err("commit seed transaction"))?;
        Ok(())
    }
}

/// Change-feed consumer that turns change records into whole snapshots.
pub struct ConfigWatcher {
    store: ConfigStore,
    stream: SettingsStream,
    last_revision: i64,
}

impl ConfigWatcher {
    /// Await the next snapshot reflecting a revision this watcher has not
    /// seen yet. Records sharing one revision yield a single snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ChangeFeedClosed`] once every bus handle is
    /// gone, or a storage error if the snapshot read fails.
    pub async fn next(&mut self) -> Result<ConfigSnapshot> {
        loop {
            match self.stream.next().await {
                Some(SettingsEvent::Change(change)) => {
                    if change.revision == self.last_revision {
                        continue;
                    }
                    let snapshot = self.store.snapshot().await?;
                    self.last_revision = snapshot.revision;
                    return Ok(snapshot);
                }
                Some(SettingsEvent::Lagged(skipped)) => {
                    warn!(skipped, "settings watcher lagged; resynchronising");
                    let snapshot = self.store.snapshot().await?;
                    self.last_revision = snapshot.revision;
                    return Ok(snapshot);
                }
                None => return Err(ConfigError::ChangeFeedClosed),
            }
        }
    }
}

#[async_trait]
impl SettingsFacade for ConfigStore {
    async fn get_app_profile(&self) -> Result<AppProfile> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(map_sqlx_err("acquire connection"))?;
        load_app_profile(&mut conn).await
    }

    async fn get_engine_profile(&self) -> Result<EngineProfile> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(map_sqlx_err("acquire connection"))?;
        load_engine_profile(&mut conn).await
    }

    async fn get_fs_policy(&self) -> Result<FsPolicy> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(map_sqlx_err("acquire connection"))?;
        load_fs_policy(&mut conn).await
    }

    async fn snapshot(&self) -> Result<ConfigSnapshot> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(map_sqlx_err("begin snapshot read"))?;
        let revision = data::fetch_revision(tx.as_mut())
            .await
            .map_err(map_data_err("read settings revision"))?;
        let app_profile = load_app_profile(tx.as_mut()).await?;
        let engine_profile = load_engine_profile(tx.as_mut()).await?;
        let fs_policy = load_fs_policy(tx.as_mut()).await?;
        tx.rollback()
            .await
            .map_err(map_sqlx_err("finish snapshot read"))?;
        Ok(ConfigSnapshot {
            revision,
            app_profile,
            engine_profile,
            fs_policy,
        })
    }

    async fn revision(&self) -> Result<i64> {
        data::fetch_revision(&self.pool)
            .await
            .map_err(map_data_err("read settings revision"))
    }

    fn subscribe_changes(&self) -> SettingsStream {
        self.bus.subscribe()
    }

    async fn update_app_profile(&self, update: AppProfileUpdate) -> Result<AppliedChanges> {
        let mut scope = ChangeScope::begin(&self.pool, Utc::now()).await?;
        let profile = apply_app_update(&mut scope, update).await?;
        let revision = scope.commit(&self.bus).await?;
        Ok(AppliedChanges {
            revision,
            app_profile: Some(profile),
            engine_profile: None,
            fs_policy: None,
        })
    }

    async fn update_engine_profile(&self, update: EngineProfileUpdate) -> Result<AppliedChanges> {
        let mut scope = ChangeScope::begin(&self.pool, Utc::now()).await?;
        let profile = apply_engine_update(&mut scope, update).await?;
        let revision = scope.commit(&self.bus).await?;
        Ok(AppliedChanges {
            revision,
            app_profile: None,
            engine_profile: Some(profile),
            fs_policy: None,
        })
    }

    async fn update_fs_policy(&self, update: FsPolicyUpdate) -> Result<AppliedChanges> {
        let mut scope = ChangeScope::begin(&self.pool, Utc::now()).await?;
        let policy = apply_fs_update(&mut scope, update).await?;
        let revision = scope.commit(&self.bus).await?;
        Ok(AppliedChanges {
            revision,
            app_profile: None,
            engine_profile: None,
            fs_policy: Some(policy),
        })
    }

    async fn apply_changeset(
        &self,
        actor: &str,
        changeset: SettingsChangeset,
    ) -> Result<AppliedChanges> {
        if changeset.is_empty() {
            let revision = self.revision().await?;
            return Ok(AppliedChanges {
                revision,
                app_profile: None,
                engine_profile: None,
                fs_policy: None,
            });
        }
        let mut scope = ChangeScope::begin(&self.pool, Utc::now()).await?;
        let mut app_profile = None;
        let mut engine_profile = None;
        let mut fs_policy = None;
        if let Some(update) = changeset.app_profile {
            app_profile = Some(apply_app_update(&mut scope, update).await?);
        }
        if let Some(update) = changeset.engine_profile {
            engine_profile = Some(apply_engine_update(&mut scope, update).await?);
        }
        if let Some(update) = changeset.fs_policy {
            fs_policy = Some(apply_fs_update(&mut scope, update).await?);
        }
        for patch in changeset.api_keys {
            apply_api_key_patch(&mut scope, patch).await?;
        }
        for patch in changeset.secrets {
            apply_secret_patch(&mut scope, actor, patch).await?;
        }
        let revision = scope.commit(&self.bus).await?;
        info!(actor, revision, "settings changeset applied");
        Ok(AppliedChanges {
            revision,
            app_profile,
            engine_profile,
            fs_policy,
        })
    }

    async fn set_ip_filter_status(
        &self,
        etag: Option<&str>,
        last_updated_at: Option<DateTime<Utc>>,
        last_error: Option<&str>,
    ) -> Result<()> {
        let mut scope = ChangeScope::begin(&self.pool, Utc::now()).await?;
        let id = ENGINE_PROFILE_ID.to_string();
        let touched =
            data::update_ip_filter_status(scope.conn(), &id, etag, last_updated_at, last_error)
                .await
                .map_err(map_data_err("update ip filter status"))?;
        if touched > 0 {
            scope.touch(ENGINE_PROFILE_TABLE, ChangeOp::Update).await?;
        }
        scope.commit(&self.bus).await?;
        Ok(())
    }

    async fn upsert_api_key(&self, upsert: ApiKeyUpsert) -> Result<i64> {
        let mut scope = ChangeScope::begin(&self.pool, Utc::now()).await?;
        apply_api_key_upsert(&mut scope, upsert).await?;
        scope.commit(&self.bus).await
    }

    async fn delete_api_key(&self, key_id: &str) -> Result<u64> {
        let mut scope = ChangeScope::begin(&self.pool, Utc::now()).await?;
        let removed = data::delete_api_key(scope.conn(), key_id)
            .await
            .map_err(map_data_err("delete api key"))?;
        if removed > 0 {
            scope.touch(AUTH_API_KEY_TABLE, ChangeOp::Delete).await?;
        }
        scope.commit(&self.bus).await?;
        Ok(removed)
    }

    async fn set_api_key_enabled(&self, key_id: &str, enabled: bool) -> Result<bool> {
        let mut scope = ChangeScope::begin(&self.pool, Utc::now()).await?;
        let now = scope.now;
        let touched = data::set_api_key_enabled(scope.conn(), key_id, enabled, now)
            .await
            .map_err(map_data_err("set api key enabled"))?;
        if touched > 0 {
            scope.touch(AUTH_API_KEY_TABLE, ChangeOp::Update).await?;
        }
        scope.commit(&self.bus).await?;
        Ok(touched > 0)
    }

    async fn set_api_key_expiry(
        &self,
        key_id: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let mut scope = ChangeScope::begin(&self.pool, Utc::now()).await?;
        let now = scope.now;
        let touched = data::set_api_key_expiry(scope.conn(), key_id, expires_at, now)
            .await
            .map_err(map_data_err("set api key expiry"))?;
        if touched > 0 {
            scope.touch(AUTH_API_KEY_TABLE, ChangeOp::Update).await?;
        }
        scope.commit(&self.bus).await?;
        Ok(touched > 0)
    }

    async fn set_api_key_rate_limit(
        &self,
        key_id: &str,
        limit: Option<ApiKeyRateLimit>,
    ) -> Result<bool> {
        if let Some(limit) = limit {
            validate_rate_limit(limit)?;
        }
        let pair = limit.map(|limit| (i64::from(limit.burst), per_seconds_to_i64(limit)));
        let mut scope = ChangeScope::begin(&self.pool, Utc::now()).await?;
        let now = scope.now;
        let touched = data::set_api_key_rate_limit(scope.conn(), key_id, pair, now)
            .await
            .map_err(map_data_err("set api key rate limit"))?;
        if touched > 0 {
            scope.touch(AUTH_API_KEY_TABLE, ChangeOp::Update).await?;
        }
        scope.commit(&self.bus).await?;
        Ok(touched > 0)
    }

    async fn active_api_keys(&self) -> Result<Vec<ApiKeyAuth>> {
        let rows = data::list_active_api_keys(&self.pool, Utc::now())
            .await
            .map_err(map_data_err("list active api keys"))?;
        Ok(rows.into_iter().map(map_api_key_auth).collect())
    }

    async fn api_key_auth(&self, key_id: &str) -> Result<Option<ApiKeyAuth>> {
        let row = data::fetch_active_api_key(&self.pool, key_id, Utc::now())
            .await
            .map_err(map_data_err("fetch active api key"))?;
        Ok(row.map(map_api_key_auth))
    }

    async fn has_api_keys(&self) -> Result<bool> {
        data::any_api_keys(&self.pool)
            .await
            .map_err(map_data_err("check for api keys"))
    }

    async fn put_secret(&self, actor: &str, name: &str, value: &[u8]) -> Result<()> {
        let mut scope = ChangeScope::begin(&self.pool, Utc::now()).await?;
        let patch = SecretPatch::Set {
            name: name.to_owned(),
            value: value.to_vec(),
        };
        apply_secret_patch(&mut scope, actor, patch).await?;
        scope.commit(&self.bus).await?;
        Ok(())
    }

    async fn get_secret(&self, name: &str) -> Result<Option<Secret>> {
        let row = data::fetch_secret(&self.pool, name)
            .await
            .map_err(map_data_err("fetch secret"))?;
        Ok(row.map(|row| Secret {
            name: row.name,
            ciphertext: row.ciphertext,
            created_by: row.created_by,
            updated_at: row.updated_at,
        }))
    }

    async fn delete_secret(&self, name: &str) -> Result<u64> {
        let mut scope = ChangeScope::begin(&self.pool, Utc::now()).await?;
        let removed = data::delete_secret(scope.conn(), name)
            .await
            .map_err(map_data_err("delete secret"))?;
        if removed > 0 {
            scope.touch(SETTINGS_SECRET_TABLE, ChangeOp::Delete).await?;
        }
        scope.commit(&self.bus).await?;
        Ok(removed)
    }

    async fn issue_setup_token(&self, token_hash: &str, ttl: ChronoDuration) -> Result<SetupToken> {
        let Some(token_hash) = non_empty(token_hash) else {
            return Err(ConfigError::InvalidField {
                section: "setup".to_owned(),
                field: "token_hash".to_owned(),
                value: None,
                reason: "token hash must not be empty",
            });
        };
        let mut scope = ChangeScope::begin(&self.pool, Utc::now()).await?;
        let now = scope.now;
        let swept = data::delete_expired_setup_tokens(scope.conn(), now)
            .await
            .map_err(map_data_err("sweep setup tokens"))?;
        if swept > 0 {
            scope.touch(SETUP_TOKEN_TABLE, ChangeOp::Delete).await?;
        }
        // Dropping the scope on conflict rolls the sweep back as well, so a
        // rejected issuance leaves the store untouched.
        let outstanding = data::fetch_active_setup_token(scope.conn(), now)
            .await
            .map_err(map_data_err("check active setup token"))?;
        if outstanding.is_some() {
            return Err(ConfigError::SetupTokenActive);
        }
        let token = SetupToken {
            id: Uuid::new_v4(),
            token_hash,
            issued_at: now,
            expires_at: now
                .checked_add_signed(ttl)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            consumed_at: None,
        };
        let row = setup_token_to_row(&token);
        data::insert_setup_token(scope.conn(), &row)
            .await
            .map_err(map_data_err("insert setup token"))?;
        scope.touch(SETUP_TOKEN_TABLE, ChangeOp::Insert).await?;
        scope.commit(&self.bus).await?;
        info!(token_id = %token.id, "issued setup token");
        Ok(token)
    }

    async fn active_setup_token(&self) -> Result<Option<SetupToken>> {
        let row = data::fetch_active_setup_token(&self.pool, Utc::now())
            .await
            .map_err(map_data_err("fetch active setup token"))?;
        row.map(map_setup_token).transpose()
    }

    async fn consume_setup_token(&self, id: Uuid) -> Result<SetupToken> {
        let mut scope = ChangeScope::begin(&self.pool, Utc::now()).await?;
        let now = scope.now;
        let id_str = id.to_string();
        let Some(row) = data::fetch_setup_token(scope.conn(), &id_str)
            .await
            .map_err(map_data_err("fetch setup token"))?
        else {
            return Err(ConfigError::SetupTokenMissing);
        };
        if row.consumed_at.is_some() {
            return Err(ConfigError::SetupTokenConsumed);
        }
        if row.expires_at <= now {
            // Left in place for the next sweep.
            return Err(ConfigError::SetupTokenExpired);
        }
        let touched = data::consume_setup_token_row(scope.conn(), &id_str, now)
            .await
            .map_err(map_data_err("consume setup token"))?;
        if touched == 0 {
            return Err(ConfigError::SetupTokenConsumed);
        }
        scope.touch(SETUP_TOKEN_TABLE, ChangeOp::Update).await?;
        scope.commit(&self.bus).await?;
        let mut token = map_setup_token(row)?;
        token.consumed_at = Some(now);
        Ok(token)
    }

    async fn sweep_setup_tokens(&self) -> Result<u64> {
        let mut scope = ChangeScope::begin(&self.pool, Utc::now()).await?;
        let now = scope.now;
        let swept = data::delete_expired_setup_tokens(scope.conn(), now)
            .await
            .map_err(map_data_err("sweep setup tokens"))?;
        if swept > 0 {
            scope.touch(SETUP_TOKEN_TABLE, ChangeOp::Delete).await?;
        }
        scope.commit(&self.bus).await?;
        Ok(swept)
    }

    async fn factory_reset(&self) -> Result<ConfigSnapshot> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(map_sqlx_err("begin factory reset"))?;
        let now = Utc::now();
        data::wipe_store_tables(tx.as_mut())
            .await
            .map_err(map_data_err("wipe settings tables"))?;
        data::set_revision(tx.as_mut(), 0, now)
            .await
            .map_err(map_data_err("reset settings revision"))?;
        seed_defaults(tx.as_mut(), now).await?;
        tx.commit()
            .await
            .map_err(map_sqlx_err("commit factory reset"))?;
        for table in [APP_PROFILE_TABLE, ENGINE_PROFILE_TABLE, FS_POLICY_TABLE] {
            self.bus.publish(SettingsChange {
                table: table.to_owned(),
                revision: 0,
                operation: ChangeOp::Insert,
            });
        }
        for table in [AUTH_API_KEY_TABLE, SETTINGS_SECRET_TABLE, SETUP_TOKEN_TABLE] {
            self.bus.publish(SettingsChange {
                table: table.to_owned(),
                revision: 0,
                operation: ChangeOp::Delete,
            });
        }
        warn!("factory reset completed; all settings returned to defaults");
        self.snapshot().await
    }
}

/// One mutating call: a transaction, the revision it bumps, and the change
/// records queued for publication after commit.
struct ChangeScope {
    tx: Transaction<'static, Sqlite>,
    now: DateTime<Utc>,
    revision: Option<i64>,
    pending: Vec<SettingsChange>,
}

impl ChangeScope {
    async fn begin(pool: &SqlitePool, now: DateTime<Utc>) -> Result<Self> {
        let tx = pool
            .begin()
            .await
            .map_err(map_sqlx_err("begin settings transaction"))?;
        Ok(Self {
            tx,
            now,
            revision: None,
            pending: Vec::new(),
        })
    }

    fn conn(&mut self) -> &mut SqliteConnection {
        self.tx.as_mut()
    }

    /// The first touch bumps the revision; later touches in the same scope
    /// reuse it.
    async fn touch(&mut self, table: &str, operation: ChangeOp) -> Result<i64> {
        let revision = match self.revision {
            Some(revision) => revision,
            None => {
                let revision = data::bump_revision(self.tx.as_mut(), self.now)
                    .await
                    .map_err(map_data_err("bump settings revision"))?;
                self.revision = Some(revision);
                revision
            }
        };
        self.pending.push(SettingsChange {
            table: table.to_owned(),
            revision,
            operation,
        });
        Ok(revision)
    }

    /// Commit the transaction; only then are the queued records published.
    async fn commit(mut self, bus: &ChangeBus) -> Result<i64> {
        let revision = match self.revision {
            Some(revision) => revision,
            None => data::fetch_revision(self.tx.as_mut())
                .await
                .map_err(map_data_err("read settings revision"))?,
        };
        self.tx
            .commit()
            .await
            .map_err(map_sqlx_err("commit settings transaction"))?;
        for change in self.pending {
            bus.publish(change);
        }
        Ok(revision)
    }
}

async fn seed_defaults(conn: &mut SqliteConnection, now: DateTime<Utc>) -> Result<()> {
    let app = default_app_profile(now);
    let row = app_profile_to_row(&app);
    data::insert_app_profile_row(&mut *conn, &row)
        .await
        .map_err(map_data_err("seed app profile"))?;
    let engine = default_engine_profile(now);
    write_engine_profile(conn, &engine, true).await?;
    let fs = default_fs_policy(now);
    let row = fs_policy_to_row(&fs);
    data::insert_fs_policy_row(&mut *conn, &row)
        .await
        .map_err(map_data_err("seed fs policy"))?;
    write_fs_paths(conn, &fs).await?;
    Ok(())
}

async fn apply_app_update(scope: &mut ChangeScope, update: AppProfileUpdate) -> Result<AppProfile> {
    let now = scope.now;
    let current = load_app_profile(scope.conn()).await?;
    let next = normalize_app_update(&current, update, now)?;
    let row = app_profile_to_row(&next);
    data::update_app_profile_row(scope.conn(), &row)
        .await
        .map_err(map_data_err("update app profile"))?;
    let profile_id = row.id;
    data::replace_immutable_keys(scope.conn(), &profile_id, &next.immutable_keys)
        .await
        .map_err(map_data_err("replace immutable keys"))?;
    let label_rows = label_policies_to_rows(&next.label_policies);
    data::replace_label_policies(scope.conn(), &profile_id, &label_rows)
        .await
        .map_err(map_data_err("replace label policies"))?;
    scope.touch(APP_PROFILE_TABLE, ChangeOp::Update).await?;
    Ok(next)
}

async fn apply_engine_update(
    scope: &mut ChangeScope,
    update: EngineProfileUpdate,
) -> Result<EngineProfile> {
    let now = scope.now;
    let immutable_keys = load_immutable_keys(scope.conn()).await?;
    let current = load_engine_profile(scope.conn()).await?;
    let mut next = merge_update(&current, update)?;
    next.updated_at = now;
    ensure_mutable(
        &immutable_keys,
        "engine",
        &changed_engine_fields(&current, &next),
    )?;
    write_engine_profile(scope.conn(), &next, false).await?;
    scope.touch(ENGINE_PROFILE_TABLE, ChangeOp::Update).await?;
    Ok(next)
}

async fn apply_fs_update(scope: &mut ChangeScope, update: FsPolicyUpdate) -> Result<FsPolicy> {
    let now = scope.now;
    let immutable_keys = load_immutable_keys(scope.conn()).await?;
    let current = load_fs_policy(scope.conn()).await?;
    let next = normalize_fs_update(&current, update, now)?;
    ensure_mutable(&immutable_keys, "fs", &changed_fs_fields(&current, &next))?;
    let row = fs_policy_to_row(&next);
    data::update_fs_policy_row(scope.conn(), &row)
        .await
        .map_err(map_data_err("update fs policy"))?;
    write_fs_paths(scope.conn(), &next).await?;
    scope.touch(FS_POLICY_TABLE, ChangeOp::Update).await?;
    Ok(next)
}

async fn apply_api_key_patch(scope: &mut ChangeScope, patch: ApiKeyPatch) -> Result<()> {
    match patch {
        ApiKeyPatch::Upsert(upsert) => apply_api_key_upsert(scope, upsert).await,
        ApiKeyPatch::Delete { key_id } => {
            let removed = data::delete_api_key(scope.conn(), &key_id)
                .await
                .map_err(map_data_err("delete api key"))?;
            if removed > 0 {
                scope.touch(AUTH_API_KEY_TABLE, ChangeOp::Delete).await?;
            }
            Ok(())
        }
    }
}

async fn apply_api_key_upsert(scope: &mut ChangeScope, upsert: ApiKeyUpsert) -> Result<()> {
    let now = scope.now;
    let Some(key_id) = non_empty(&upsert.key_id) else {
        return Err(ConfigError::InvalidField {
            section: "auth".to_owned(),
            field: "key_id".to_owned(),
            value: Some(upsert.key_id),
            reason: "key id must not be empty",
        });
    };
    if let Some(limit) = upsert.rate_limit {
        validate_rate_limit(limit)?;
    }
    let existing = data::fetch_api_key_row(scope.conn(), &key_id)
        .await
        .map_err(map_data_err("fetch api key"))?;
    let hash = upsert.hash.as_deref().and_then(non_empty);
    let (row, operation) = match existing {
        Some(current) => {
            let row = ApiKeyRow {
                key_id: current.key_id,
                hash: hash.unwrap_or(current.hash),
                label: upsert.label.as_deref().map_or(current.label, non_empty),
                enabled: upsert.enabled.unwrap_or(current.enabled),
                expires_at: upsert.expires_at.or(current.expires_at),
                rate_limit_burst: upsert
                    .rate_limit
                    .map(|limit| i64::from(limit.burst))
                    .or(current.rate_limit_burst),
                rate_limit_per_seconds: upsert
                    .rate_limit
                    .map(per_seconds_to_i64)
                    .or(current.rate_limit_per_seconds),
                created_at: current.created_at,
                updated_at: now,
            };
            (row, ChangeOp::Update)
        }
        None => {
            let Some(hash) = hash else {
                return Err(ConfigError::InvalidField {
                    section: "auth".to_owned(),
                    field: "hash".to_owned(),
                    value: None,
                    reason: "hash is required when creating a key",
                });
            };
            let row = ApiKeyRow {
                key_id,
                hash,
                label: upsert.label.as_deref().and_then(non_empty),
                enabled: upsert.enabled.unwrap_or(true),
                expires_at: upsert.expires_at,
                rate_limit_burst: upsert.rate_limit.map(|limit| i64::from(limit.burst)),
                rate_limit_per_seconds: upsert.rate_limit.map(per_seconds_to_i64),
                created_at: now,
                updated_at: now,
            };
            (row, ChangeOp::Insert)
        }
    };
    data::upsert_api_key_row(scope.conn(), &row)
        .await
        .map_err(map_data_err("upsert api key"))?;
    scope.touch(AUTH_API_KEY_TABLE, operation).await?;
    Ok(())
}

async fn apply_secret_patch(
    scope: &mut ChangeScope,
    actor: &str,
    patch: SecretPatch,
) -> Result<()> {
    match patch {
        SecretPatch::Set { name, value } => {
            let Some(name) = non_empty(&name) else {
                return Err(ConfigError::InvalidField {
                    section: "secrets".to_owned(),
                    field: "name".to_owned(),
                    value: Some(name),
                    reason: "secret name must not be empty",
                });
            };
            let now = scope.now;
            let exists = data::secret_exists(scope.conn(), &name)
                .await
                .map_err(map_data_err("check secret presence"))?;
            let created_by = non_empty(actor);
            data::upsert_secret(scope.conn(), &name, &value, created_by.as_deref(), now)
                .await
                .map_err(map_data_err("upsert secret"))?;
            let operation = if exists {
                ChangeOp::Update
            } else {
                ChangeOp::Insert
            };
            scope.touch(SETTINGS_SECRET_TABLE, operation).await?;
        }
        SecretPatch::Delete { name } => {
            let removed = data::delete_secret(scope.conn(), &name)
                .await
                .map_err(map_data_err("delete secret"))?;
            if removed > 0 {
                scope.touch(SETTINGS_SECRET_TABLE, ChangeOp::Delete).await?;
            }
        }
    }
    Ok(())
}

fn normalize_app_update(
    current: &AppProfile,
    update: AppProfileUpdate,
    now: DateTime<Utc>,
) -> Result<AppProfile> {
    let Some(instance_name) = non_empty(&update.instance_name) else {
        return Err(ConfigError::InvalidField {
            section: "app".to_owned(),
            field: "instance_name".to_owned(),
            value: Some(update.instance_name),
            reason: "instance name must not be empty",
        });
    };
    if update.http_port == 0 {
        return Err(ConfigError::InvalidField {
            section: "app".to_owned(),
            field: "http_port".to_owned(),
            value: Some("0".to_owned()),
            reason: "port must be between 1 and 65535",
        });
    }
    let bind_addr = parse_bind_addr(&update.bind_addr)?.to_string();
    let next = AppProfile {
        id: current.id,
        instance_name,
        mode: update.mode,
        auth_mode: update.auth_mode,
        version: current.version + 1,
        http_port: update.http_port,
        bind_addr,
        telemetry: normalize_telemetry(update.telemetry),
        immutable_keys: normalize_string_list(&update.immutable_keys),
        label_policies: normalize_label_policies(&update.label_policies)?,
        created_at: current.created_at,
        updated_at: now,
    };
    ensure_mutable(
        &current.immutable_keys,
        "app",
        &changed_app_fields(current, &next),
    )?;
    Ok(next)
}

fn normalize_telemetry(telemetry: TelemetryConfig) -> TelemetryConfig {
    TelemetryConfig {
        level: telemetry.level.as_deref().and_then(non_empty),
        format: telemetry.format.as_deref().and_then(non_empty),
        otel_enabled: telemetry.otel_enabled,
        otel_service_name: telemetry.otel_service_name.as_deref().and_then(non_empty),
        otel_endpoint: telemetry.otel_endpoint.as_deref().and_then(non_empty),
    }
}

fn normalize_label_policies(policies: &[LabelPolicy]) -> Result<Vec<LabelPolicy>> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(policies.len());
    for policy in policies {
        let Some(name) = non_empty(&policy.name) else {
            return Err(ConfigError::InvalidField {
                section: "app".to_owned(),
                field: "label_policies".to_owned(),
                value: None,
                reason: "label name must not be empty",
            });
        };
        if !seen.insert((policy.kind, name.clone())) {
            return Err(ConfigError::DuplicateLabelPolicy {
                kind: policy.kind.as_str().to_owned(),
                name,
            });
        }
        out.push(LabelPolicy {
            name,
            download_dir: policy.download_dir.as_deref().and_then(non_empty),
            rate_limit_download_bps: clamp_rate_limit(
                "label.rate_limit_download_bps",
                policy.rate_limit_download_bps,
            ),
            rate_limit_upload_bps: clamp_rate_limit(
                "label.rate_limit_upload_bps",
                policy.rate_limit_upload_bps,
            ),
            ..policy.clone()
        });
    }
    Ok(out)
}

fn normalize_fs_update(
    current: &FsPolicy,
    update: FsPolicyUpdate,
    now: DateTime<Utc>,
) -> Result<FsPolicy> {
    let Some(library_root) = non_empty(&update.library_root) else {
        return Err(ConfigError::InvalidField {
            section: "fs".to_owned(),
            field: "library_root".to_owned(),
            value: Some(update.library_root),
            reason: "library root must not be empty",
        });
    };
    Ok(FsPolicy {
        id: current.id,
        library_root,
        extract: update.extract,
        par2: update.par2,
        flatten: update.flatten,
        move_mode: update.move_mode,
        chmod_file: normalize_mode_field("chmod_file", update.chmod_file)?,
        chmod_dir: normalize_mode_field("chmod_dir", update.chmod_dir)?,
        owner: update.owner.as_deref().and_then(non_empty),
        group: update.group.as_deref().and_then(non_empty),
        umask: normalize_mode_field("umask", update.umask)?,
        cleanup_keep: normalize_string_list(&update.cleanup_keep),
        cleanup_drop: normalize_string_list(&update.cleanup_drop),
        allow_paths: normalize_string_list(&update.allow_paths),
        created_at: current.created_at,
        updated_at: now,
    })
}

fn normalize_mode_field(field: &str, value: Option<String>) -> Result<Option<String>> {
    match value.as_deref().and_then(non_empty) {
        Some(mode) => {
            validate_octal_mode("fs", field, &mode)?;
            Ok(Some(mode))
        }
        None => Ok(None),
    }
}

fn validate_rate_limit(limit: ApiKeyRateLimit) -> Result<()> {
    if limit.burst == 0 || limit.per_seconds == 0 {
        return Err(ConfigError::InvalidField {
            section: "auth".to_owned(),
            field: "rate_limit".to_owned(),
            value: None,
            reason: "rate limit burst and window must be positive",
        });
    }
    Ok(())
}

fn per_seconds_to_i64(limit: ApiKeyRateLimit) -> i64 {
    i64::try_from(limit.per_seconds).unwrap_or(i64::MAX)
}

/// Immutable keys freeze either a whole section (`"app"`) or a single
/// dotted field (`"app.instance_name"`).
fn is_immutable(keys: &[String], section: &str, field: &str) -> bool {
    keys.iter().any(|key| {
        key.as_str() == section
            || key
                .strip_prefix(section)
                .and_then(|rest| rest.strip_prefix('.'))
                .is_some_and(|rest| rest == field)
    })
}

fn ensure_mutable(keys: &[String], section: &str, changed: &[&'static str]) -> Result<()> {
    for field in changed {
        if is_immutable(keys, section, field) {
            return Err(ConfigError::ImmutableField {
                section: section.to_owned(),
                field: (*field).to_owned(),
            });
        }
    }
    Ok(())
}

fn changed_app_fields(current: &AppProfile, next: &AppProfile) -> Vec<&'static str> {
    let mut changed = Vec::new();
    if current.instance_name != next.instance_name {
        changed.push("instance_name");
    }
    if current.mode != next.mode {
        changed.push("mode");
    }
    if current.auth_mode != next.auth_mode {
        changed.push("auth_mode");
    }
    if current.http_port != next.http_port {
        changed.push("http_port");
    }
    if current.bind_addr != next.bind_addr {
        changed.push("bind_addr");
    }
    if current.telemetry != next.telemetry {
        changed.push("telemetry");
    }
    if current.immutable_keys != next.immutable_keys {
        changed.push("immutable_keys");
    }
    if current.label_policies != next.label_policies {
        changed.push("label_policies");
    }
    changed
}

fn changed_engine_fields(current: &EngineProfile, next: &EngineProfile) -> Vec<&'static str> {
    let mut changed = Vec::new();
    if current.network != next.network {
        changed.push("network");
    }
    if current.limits != next.limits {
        changed.push("limits");
    }
    if current.queueing != next.queueing {
        changed.push("queueing");
    }
    if current.storage != next.storage {
        changed.push("storage");
    }
    if current.behavior != next.behavior {
        changed.push("behavior");
    }
    if current.listen_interfaces != next.listen_interfaces {
        changed.push("listen_interfaces");
    }
    if current.dht_bootstrap_nodes != next.dht_bootstrap_nodes {
        changed.push("dht_bootstrap_nodes");
    }
    if current.dht_router_nodes != next.dht_router_nodes {
        changed.push("dht_router_nodes");
    }
    if current.ip_filter != next.ip_filter {
        changed.push("ip_filter");
    }
    if current.alt_speed != next.alt_speed {
        changed.push("alt_speed");
    }
    if current.tracker != next.tracker {
        changed.push("tracker");
    }
    if current.peer_classes != next.peer_classes {
        changed.push("peer_classes");
    }
    changed
}

fn changed_fs_fields(current: &FsPolicy, next: &FsPolicy) -> Vec<&'static str> {
    let mut changed = Vec::new();
    if current.library_root != next.library_root {
        changed.push("library_root");
    }
    if current.extract != next.extract {
        changed.push("extract");
    }
    if current.par2 != next.par2 {
        changed.push("par2");
    }
    if current.flatten != next.flatten {
        changed.push("flatten");
    }
    if current.move_mode != next.move_mode {
        changed.push("move_mode");
    }
    if current.chmod_file != next.chmod_file {
        changed.push("chmod_file");
    }
    if current.chmod_dir != next.chmod_dir {
        changed.push("chmod_dir");
    }
    if current.owner != next.owner {
        changed.push("owner");
    }
    if current.group != next.group {
        changed.push("group");
    }
    if current.umask != next.umask {
        changed.push("umask");
    }
    if current.cleanup_keep != next.cleanup_keep {
        changed.push("cleanup_keep");
    }
    if current.cleanup_drop != next.cleanup_drop {
        changed.push("cleanup_drop");
    }
    if current.allow_paths != next.allow_paths {
        changed.push("allow_paths");
    }
    changed
}

async fn load_immutable_keys(conn: &mut SqliteConnection) -> Result<Vec<String>> {
    let id = APP_PROFILE_ID.to_string();
    data::fetch_immutable_keys(&mut *conn, &id)
        .await
        .map_err(map_data_err("fetch immutable keys"))
}

async fn load_app_profile(conn: &mut SqliteConnection) -> Result<AppProfile> {
    let id = APP_PROFILE_ID.to_string();
    let row = data::fetch_app_profile_row(&mut *conn, &id)
        .await
        .map_err(map_data_err("fetch app profile"))?;
    let immutable_keys = data::fetch_immutable_keys(&mut *conn, &id)
        .await
        .map_err(map_data_err("fetch immutable keys"))?;
    let labels = data::fetch_label_policy_rows(&mut *conn, &id)
        .await
        .map_err(map_data_err("fetch label policies"))?;
    map_app_profile(row, immutable_keys, labels)
}

fn map_app_profile(
    row: AppProfileRow,
    immutable_keys: Vec<String>,
    labels: Vec<LabelPolicyRow>,
) -> Result<AppProfile> {
    let label_policies = labels
        .into_iter()
        .map(map_label_policy)
        .collect::<Result<Vec<_>>>()?;
    let http_port = u16::try_from(row.http_port).map_err(|_| ConfigError::InvalidField {
        section: "app".to_owned(),
        field: "http_port".to_owned(),
        value: Some(row.http_port.to_string()),
        reason: "port must be between 1 and 65535",
    })?;
    Ok(AppProfile {
        id: parse_uuid(&row.id)?,
        instance_name: row.instance_name,
        mode: row.mode.parse()?,
        auth_mode: row.auth_mode.parse()?,
        version: row.version,
        http_port,
        bind_addr: row.bind_addr,
        telemetry: TelemetryConfig {
            level: row.telemetry_level,
            format: row.telemetry_format,
            otel_enabled: row.telemetry_otel_enabled,
            otel_service_name: row.telemetry_otel_service_name,
            otel_endpoint: row.telemetry_otel_endpoint,
        },
        immutable_keys,
        label_policies,
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}

fn map_label_policy(row: LabelPolicyRow) -> Result<LabelPolicy> {
    Ok(LabelPolicy {
        kind: row.kind.parse()?,
        name: row.name,
        download_dir: row.download_dir,
        rate_limit_download_bps: row.rate_limit_download_bps,
        rate_limit_upload_bps: row.rate_limit_upload_bps,
        queue_position: row.queue_position,
        auto_managed: row.auto_managed,
        seed_ratio_limit: row.seed_ratio_limit,
        seed_time_limit: row.seed_time_limit,
        cleanup_seed_ratio_limit: row.cleanup_seed_ratio_limit,
        cleanup_seed_time_limit: row.cleanup_seed_time_limit,
        cleanup_remove_data: row.cleanup_remove_data,
    })
}

fn app_profile_to_row(profile: &AppProfile) -> AppProfileRow {
    AppProfileRow {
        id: profile.id.to_string(),
        instance_name: profile.instance_name.clone(),
        mode: profile.mode.as_str().to_owned(),
        auth_mode: profile.auth_mode.as_str().to_owned(),
        version: profile.version,
        http_port: i32::from(profile.http_port),
        bind_addr: profile.bind_addr.clone(),
        telemetry_level: profile.telemetry.level.clone(),
        telemetry_format: profile.telemetry.format.clone(),
        telemetry_otel_enabled: profile.telemetry.otel_enabled,
        telemetry_otel_service_name: profile.telemetry.otel_service_name.clone(),
        telemetry_otel_endpoint: profile.telemetry.otel_endpoint.clone(),
        created_at: profile.created_at,
        updated_at: profile.updated_at,
    }
}

fn label_policies_to_rows(policies: &[LabelPolicy]) -> Vec<LabelPolicyRow> {
    policies
        .iter()
        .map(|policy| LabelPolicyRow {
            kind: policy.kind.as_str().to_owned(),
            name: policy.name.clone(),
            download_dir: policy.download_dir.clone(),
            rate_limit_download_bps: policy.rate_limit_download_bps,
            rate_limit_upload_bps: policy.rate_limit_upload_bps,
            queue_position: policy.queue_position,
            auto_managed: policy.auto_managed,
            seed_ratio_limit: policy.seed_ratio_limit,
            seed_time_limit: policy.seed_time_limit,
            cleanup_seed_ratio_limit: policy.cleanup_seed_ratio_limit,
            cleanup_seed_time_limit: policy.cleanup_seed_time_limit,
            cleanup_remove_data: policy.cleanup_remove_data,
        })
        .collect()
}

struct EngineProfileParts {
    row: EngineProfileRow,
    lists: Vec<data::EngineListValueRow>,
    ip_filter: Option<IpFilterRow>,
    ip_rules: Vec<String>,
    alt_speed: Option<AltSpeedRow>,
    tracker: Option<TrackerRow>,
    tracker_urls: Vec<data::TrackerUrlRow>,
    peer_classes: Vec<PeerClassRow>,
    peer_defaults: Vec<i16>,
}

async fn load_engine_profile(conn: &mut SqliteConnection) -> Result<EngineProfile> {
    let parts = load_engine_parts(conn).await?;
    map_engine_profile(parts)
}

async fn load_engine_parts(conn: &mut SqliteConnection) -> Result<EngineProfileParts> {
    let id = ENGINE_PROFILE_ID.to_string();
    let row = data::fetch_engine_profile_row(&mut *conn, &id)
        .await
        .map_err(map_data_err("fetch engine profile"))?;
    let lists = data::fetch_engine_list_values(&mut *conn, &id)
        .await
        .map_err(map_data_err("fetch engine lists"))?;
    let ip_filter = data::fetch_ip_filter_row(&mut *conn, &id)
        .await
        .map_err(map_data_err("fetch ip filter"))?;
    let ip_rules = data::fetch_ip_filter_rules(&mut *conn, &id)
        .await
        .map_err(map_data_err("fetch ip filter rules"))?;
    let alt_speed = data::fetch_alt_speed_row(&mut *conn, &id)
        .await
        .map_err(map_data_err("fetch alt speed"))?;
    let tracker = data::fetch_tracker_row(&mut *conn, &id)
        .await
        .map_err(map_data_err("fetch tracker"))?;
    let tracker_urls = data::fetch_tracker_urls(&mut *conn, &id)
        .await
        .map_err(map_data_err("fetch tracker urls"))?;
    let peer_classes = data::fetch_peer_class_rows(&mut *conn, &id)
        .await
        .map_err(map_data_err("fetch peer classes"))?;
    let peer_defaults = data::fetch_peer_class_defaults(&mut *conn, &id)
        .await
        .map_err(map_data_err("fetch peer class defaults"))?;
    Ok(EngineProfileParts {
        row,
        lists,
        ip_filter,
        ip_rules,
        alt_speed,
        tracker,
        tracker_urls,
        peer_classes,
        peer_defaults,
    })
}

fn map_engine_profile(parts: EngineProfileParts) -> Result<EngineProfile> {
    let EngineProfileParts {
        row,
        lists,
        ip_filter,
        ip_rules,
        alt_speed,
        tracker,
        tracker_urls,
        peer_classes,
        peer_defaults,
    } = parts;
    let mut listen_interfaces = Vec::new();
    let mut dht_bootstrap_nodes = Vec::new();
    let mut dht_router_nodes = Vec::new();
    for value in lists {
        match value.kind.as_str() {
            LIST_LISTEN_INTERFACES => listen_interfaces.push(value.value),
            LIST_DHT_BOOTSTRAP => dht_bootstrap_nodes.push(value.value),
            LIST_DHT_ROUTERS => dht_router_nodes.push(value.value),
            other => warn!(kind = other, "unknown engine list kind in store"),
        }
    }
    let mut default_trackers = Vec::new();
    let mut extra_trackers = Vec::new();
    for url in tracker_urls {
        match url.kind.as_str() {
            URL_KIND_DEFAULT => default_trackers.push(url.url),
            URL_KIND_EXTRA => extra_trackers.push(url.url),
            other => warn!(kind = other, "unknown tracker url kind in store"),
        }
    }
    Ok(EngineProfile {
        id: parse_uuid(&row.id)?,
        network: map_engine_network(&row),
        limits: map_engine_limits(&row),
        queueing: EngineQueueing {
            auto_managed: row.auto_managed,
            prefer_seeds: row.prefer_seeds,
            dont_count_slow_torrents: row.dont_count_slow_torrents,
        },
        storage: EngineStorage {
            storage_mode: StorageMode::parse(&row.storage_mode),
            download_root: row.download_root,
            resume_dir: row.resume_dir,
            cache_size_mib: row.cache_size_mib,
            cache_expiry_seconds: row.cache_expiry_seconds,
            verify_piece_hashes: row.verify_piece_hashes,
        },
        behavior: EngineBehavior {
            sequential_default: row.sequential_default,
            super_seeding: row.super_seeding,
            stats_interval_ms: row.stats_interval_ms,
        },
        listen_interfaces,
        dht_bootstrap_nodes,
        dht_router_nodes,
        ip_filter: map_ip_filter(ip_filter, ip_rules),
        alt_speed: alt_speed
            .as_ref()
            .map_or_else(AltSpeedConfig::default, map_alt_speed),
        tracker: map_tracker(tracker, default_trackers, extra_trackers),
        peer_classes: map_peer_classes(peer_classes, peer_defaults),
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}

fn map_engine_network(row: &EngineProfileRow) -> EngineNetwork {
    EngineNetwork {
        listen_port: row.listen_port.and_then(|port| u16::try_from(port).ok()),
        ipv6_mode: Ipv6Mode::parse(&row.ipv6_mode),
        dht: Toggle(row.enable_dht),
        lsd: Toggle(row.enable_lsd),
        upnp: Toggle(row.enable_upnp),
        natpmp: Toggle(row.enable_natpmp),
        pex: Toggle(row.enable_pex),
        outgoing_utp: Toggle(row.enable_outgoing_utp),
        incoming_utp: Toggle(row.enable_incoming_utp),
        encryption: EncryptionPolicy::parse(&row.encryption),
        anonymous_mode: Toggle(row.anonymous_mode),
        force_proxy: Toggle(row.force_proxy),
        outgoing_port_min: row
            .outgoing_port_min
            .and_then(|port| u16::try_from(port).ok()),
        outgoing_port_max: row
            .outgoing_port_max
            .and_then(|port| u16::try_from(port).ok()),
        peer_dscp: row.peer_dscp.and_then(|dscp| u8::try_from(dscp).ok()),
    }
}

const fn map_engine_limits(row: &EngineProfileRow) -> EngineLimits {
    EngineLimits {
        max_download_bps: row.max_download_bps,
        max_upload_bps: row.max_upload_bps,
        max_active: row.max_active,
        connections_limit: row.connections_limit,
        connections_limit_per_torrent: row.connections_limit_per_torrent,
        unchoke_slots: row.unchoke_slots,
        half_open_limit: row.half_open_limit,
        seed_ratio_limit: row.seed_ratio_limit,
        seed_time_limit: row.seed_time_limit,
    }
}

fn map_ip_filter(row: Option<IpFilterRow>, cidrs: Vec<String>) -> IpFilterConfig {
    let Some(row) = row else {
        return IpFilterConfig {
            cidrs,
            ..IpFilterConfig::default()
        };
    };
    IpFilterConfig {
        blocklist_url: row.blocklist_url,
        etag: row.etag,
        last_updated_at: row.last_updated_at,
        last_error: row.last_error,
        cidrs,
    }
}

fn map_alt_speed(row: &AltSpeedRow) -> AltSpeedConfig {
    AltSpeedConfig {
        download_bps: row.download_bps,
        upload_bps: row.upload_bps,
        schedule: map_alt_schedule(row),
    }
}

fn map_alt_schedule(row: &AltSpeedRow) -> Option<AltSpeedSchedule> {
    let start = row.schedule_start_minutes?;
    let end = row.schedule_end_minutes?;
    let labels = row.schedule_days.as_deref()?;
    let mut days = Vec::new();
    for label in labels.split(',') {
        if label.is_empty() {
            continue;
        }
        let Some(day) = parse_weekday_label(label) else {
            warn!(label, "unknown weekday label in stored schedule");
            continue;
        };
        days.push(day);
    }
    if days.is_empty() {
        return None;
    }
    Some(AltSpeedSchedule {
        days,
        start_minutes: u16::try_from(start).ok()?,
        end_minutes: u16::try_from(end).ok()?,
    })
}

fn map_tracker(
    row: Option<TrackerRow>,
    default_trackers: Vec<String>,
    extra_trackers: Vec<String>,
) -> TrackerConfig {
    let Some(row) = row else {
        return TrackerConfig {
            default_trackers,
            extra_trackers,
            ..TrackerConfig::default()
        };
    };
    let proxy = map_tracker_proxy(&row);
    let auth = map_tracker_auth(&row);
    TrackerConfig {
        default_trackers,
        extra_trackers,
        replace_trackers: row.replace_trackers,
        announce_to_all: row.announce_to_all,
        user_agent: row.user_agent,
        announce_ip: row.announce_ip,
        listen_interface: row.listen_interface,
        request_timeout_ms: row.request_timeout_ms,
        ssl_cert: row.ssl_cert,
        ssl_private_key: row.ssl_private_key,
        ssl_ca_cert: row.ssl_ca_cert,
        ssl_verify: row.ssl_verify,
        proxy,
        auth,
    }
}

fn map_tracker_proxy(row: &TrackerRow) -> Option<TrackerProxyConfig> {
    let host = row.proxy_host.clone()?;
    let port = row.proxy_port.and_then(|port| u16::try_from(port).ok())?;
    Some(TrackerProxyConfig {
        host,
        port,
        kind: TrackerProxyType::parse(row.proxy_kind.as_deref().unwrap_or("http")),
        username_secret: row.proxy_username_secret.clone(),
        password_secret: row.proxy_password_secret.clone(),
        proxy_peers: row.proxy_peers.unwrap_or(false),
    })
}

fn map_tracker_auth(row: &TrackerRow) -> Option<TrackerAuthConfig> {
    if row.auth_username_secret.is_none()
        && row.auth_password_secret.is_none()
        && row.auth_cookie_secret.is_none()
    {
        return None;
    }
    Some(TrackerAuthConfig {
        username_secret: row.auth_username_secret.clone(),
        password_secret: row.auth_password_secret.clone(),
        cookie_secret: row.auth_cookie_secret.clone(),
    })
}

fn map_peer_classes(rows: Vec<PeerClassRow>, defaults: Vec<i16>) -> PeerClassesConfig {
    let classes = rows.into_iter().filter_map(map_peer_class).collect();
    let default = defaults
        .into_iter()
        .filter_map(|id| u8::try_from(id).ok())
        .collect();
    PeerClassesConfig { classes, default }
}

fn map_peer_class(row: PeerClassRow) -> Option<PeerClassConfig> {
    let id = u8::try_from(row.class_id).ok()?;
    Some(PeerClassConfig {
        id,
        label: row.label,
        download_priority: u8::try_from(row.download_priority).unwrap_or(1),
        upload_priority: u8::try_from(row.upload_priority).unwrap_or(1),
        connection_limit_factor: u16::try_from(row.connection_limit_factor).unwrap_or(1),
        ignore_unchoke_slots: row.ignore_unchoke_slots,
    })
}

async fn write_engine_profile(
    conn: &mut SqliteConnection,
    profile: &EngineProfile,
    insert: bool,
) -> Result<()> {
    let row = engine_profile_to_row(profile);
    if insert {
        data::insert_engine_profile_row(&mut *conn, &row)
            .await
            .map_err(map_data_err("insert engine profile"))?;
    } else {
        data::update_engine_profile_row(&mut *conn, &row)
            .await
            .map_err(map_data_err("update engine profile"))?;
    }
    write_engine_subresources(conn, profile).await
}

async fn write_engine_subresources(
    conn: &mut SqliteConnection,
    profile: &EngineProfile,
) -> Result<()> {
    let id = profile.id.to_string();
    data::replace_engine_list_values(
        &mut *conn,
        &id,
        LIST_LISTEN_INTERFACES,
        &profile.listen_interfaces,
    )
    .await
    .map_err(map_data_err("replace listen interfaces"))?;
    data::replace_engine_list_values(
        &mut *conn,
        &id,
        LIST_DHT_BOOTSTRAP,
        &profile.dht_bootstrap_nodes,
    )
    .await
    .map_err(map_data_err("replace dht bootstrap nodes"))?;
    data::replace_engine_list_values(&mut *conn, &id, LIST_DHT_ROUTERS, &profile.dht_router_nodes)
        .await
        .map_err(map_data_err("replace dht router nodes"))?;
    let ip_row = ip_filter_to_row(&profile.ip_filter);
    data::upsert_ip_filter_row(&mut *conn, &id, &ip_row)
        .await
        .map_err(map_data_err("upsert ip filter"))?;
    data::replace_ip_filter_rules(&mut *conn, &id, &profile.ip_filter.cidrs)
        .await
        .map_err(map_data_err("replace ip filter rules"))?;
    let alt_row = alt_speed_to_row(&profile.alt_speed);
    data::upsert_alt_speed_row(&mut *conn, &id, &alt_row)
        .await
        .map_err(map_data_err("upsert alt speed"))?;
    let tracker_row = tracker_to_row(&profile.tracker);
    data::upsert_tracker_row(&mut *conn, &id, &tracker_row)
        .await
        .map_err(map_data_err("upsert tracker"))?;
    data::replace_tracker_urls(
        &mut *conn,
        &id,
        URL_KIND_DEFAULT,
        &profile.tracker.default_trackers,
    )
    .await
    .map_err(map_data_err("replace default trackers"))?;
    data::replace_tracker_urls(
        &mut *conn,
        &id,
        URL_KIND_EXTRA,
        &profile.tracker.extra_trackers,
    )
    .await
    .map_err(map_data_err("replace extra trackers"))?;
    let class_rows = peer_classes_to_rows(&profile.peer_classes);
    data::replace_peer_classes(&mut *conn, &id, &class_rows)
        .await
        .map_err(map_data_err("replace peer classes"))?;
    let default_ids: Vec<i16> = profile
        .peer_classes
        .default
        .iter()
        .map(|id| i16::from(*id))
        .collect();
    data::replace_peer_class_defaults(&mut *conn, &id, &default_ids)
        .await
        .map_err(map_data_err("replace peer class defaults"))?;
    Ok(())
}

fn engine_profile_to_row(profile: &EngineProfile) -> EngineProfileRow {
    EngineProfileRow {
        id: profile.id.to_string(),
        listen_port: profile.network.listen_port.map(i32::from),
        ipv6_mode: profile.network.ipv6_mode.as_str().to_owned(),
        enable_dht: profile.network.dht.enabled(),
        enable_lsd: profile.network.lsd.enabled(),
        enable_upnp: profile.network.upnp.enabled(),
        enable_natpmp: profile.network.natpmp.enabled(),
        enable_pex: profile.network.pex.enabled(),
        enable_outgoing_utp: profile.network.outgoing_utp.enabled(),
        enable_incoming_utp: profile.network.incoming_utp.enabled(),
        encryption: profile.network.encryption.as_str().to_owned(),
        anonymous_mode: profile.network.anonymous_mode.enabled(),
        force_proxy: profile.network.force_proxy.enabled(),
        outgoing_port_min: profile.network.outgoing_port_min.map(i32::from),
        outgoing_port_max: profile.network.outgoing_port_max.map(i32::from),
        peer_dscp: profile.network.peer_dscp.map(i32::from),
        max_download_bps: profile.limits.max_download_bps,
        max_upload_bps: profile.limits.max_upload_bps,
        max_active: profile.limits.max_active,
        connections_limit: profile.limits.connections_limit,
        connections_limit_per_torrent: profile.limits.connections_limit_per_torrent,
        unchoke_slots: profile.limits.unchoke_slots,
        half_open_limit: profile.limits.half_open_limit,
        seed_ratio_limit: profile.limits.seed_ratio_limit,
        seed_time_limit: profile.limits.seed_time_limit,
        auto_managed: profile.queueing.auto_managed,
        prefer_seeds: profile.queueing.prefer_seeds,
        dont_count_slow_torrents: profile.queueing.dont_count_slow_torrents,
        download_root: profile.storage.download_root.clone(),
        resume_dir: profile.storage.resume_dir.clone(),
        storage_mode: profile.storage.storage_mode.as_str().to_owned(),
        cache_size_mib: profile.storage.cache_size_mib,
        cache_expiry_seconds: profile.storage.cache_expiry_seconds,
        verify_piece_hashes: profile.storage.verify_piece_hashes,
        sequential_default: profile.behavior.sequential_default,
        super_seeding: profile.behavior.super_seeding,
        stats_interval_ms: profile.behavior.stats_interval_ms,
        created_at: profile.created_at,
        updated_at: profile.updated_at,
    }
}

fn ip_filter_to_row(filter: &IpFilterConfig) -> IpFilterRow {
    IpFilterRow {
        blocklist_url: filter.blocklist_url.clone(),
        etag: filter.etag.clone(),
        last_updated_at: filter.last_updated_at,
        last_error: filter.last_error.clone(),
    }
}

fn alt_speed_to_row(alt: &AltSpeedConfig) -> AltSpeedRow {
    let schedule = alt.schedule.as_ref();
    AltSpeedRow {
        download_bps: alt.download_bps,
        upload_bps: alt.upload_bps,
        schedule_start_minutes: schedule.map(|s| i64::from(s.start_minutes)),
        schedule_end_minutes: schedule.map(|s| i64::from(s.end_minutes)),
        schedule_days: schedule.map(|s| {
            s.days
                .iter()
                .map(|day| weekday_label(*day))
                .collect::<Vec<_>>()
                .join(",")
        }),
    }
}

fn tracker_to_row(tracker: &TrackerConfig) -> TrackerRow {
    let proxy = tracker.proxy.as_ref();
    let auth = tracker.auth.as_ref();
    TrackerRow {
        replace_trackers: tracker.replace_trackers,
        announce_to_all: tracker.announce_to_all,
        user_agent: tracker.user_agent.clone(),
        announce_ip: tracker.announce_ip.clone(),
        listen_interface: tracker.listen_interface.clone(),
        request_timeout_ms: tracker.request_timeout_ms,
        ssl_cert: tracker.ssl_cert.clone(),
        ssl_private_key: tracker.ssl_private_key.clone(),
        ssl_ca_cert: tracker.ssl_ca_cert.clone(),
        ssl_verify: tracker.ssl_verify,
        proxy_host: proxy.map(|p| p.host.clone()),
        proxy_port: proxy.map(|p| i32::from(p.port)),
        proxy_kind: proxy.map(|p| p.kind.as_str().to_owned()),
        proxy_username_secret: proxy.and_then(|p| p.username_secret.clone()),
        proxy_password_secret: proxy.and_then(|p| p.password_secret.clone()),
        proxy_peers: proxy.map(|p| p.proxy_peers),
        auth_username_secret: auth.and_then(|a| a.username_secret.clone()),
        auth_password_secret: auth.and_then(|a| a.password_secret.clone()),
        auth_cookie_secret: auth.and_then(|a| a.cookie_secret.clone()),
    }
}

fn peer_classes_to_rows(classes: &PeerClassesConfig) -> Vec<PeerClassRow> {
    classes
        .classes
        .iter()
        .map(|class| PeerClassRow {
            class_id: i16::from(class.id),
            label: class.label.clone(),
            download_priority: i16::from(class.download_priority),
            upload_priority: i16::from(class.upload_priority),
            connection_limit_factor: i32::from(class.connection_limit_factor),
            ignore_unchoke_slots: class.ignore_unchoke_slots,
        })
        .collect()
}

async fn load_fs_policy(conn: &mut SqliteConnection) -> Result<FsPolicy> {
    let id = FS_POLICY_ID.to_string();
    let row = data::fetch_fs_policy_row(&mut *conn, &id)
        .await
        .map_err(map_data_err("fetch fs policy"))?;
    let paths = data::fetch_fs_policy_paths(&mut *conn, &id)
        .await
        .map_err(map_data_err("fetch fs policy paths"))?;
    map_fs_policy(row, paths)
}

fn map_fs_policy(row: FsPolicyRow, paths: Vec<FsPathRow>) -> Result<FsPolicy> {
    let mut cleanup_keep = Vec::new();
    let mut cleanup_drop = Vec::new();
    let mut allow_paths = Vec::new();
    for path in paths {
        match path.kind.as_str() {
            PATH_CLEANUP_KEEP => cleanup_keep.push(path.path),
            PATH_CLEANUP_DROP => cleanup_drop.push(path.path),
            PATH_ALLOW => allow_paths.push(path.path),
            other => warn!(kind = other, "unknown fs path kind in store"),
        }
    }
    Ok(FsPolicy {
        id: parse_uuid(&row.id)?,
        library_root: row.library_root,
        extract: Toggle(row.extract),
        par2: row.par2.parse()?,
        flatten: Toggle(row.flatten),
        move_mode: row.move_mode.parse()?,
        chmod_file: row.chmod_file,
        chmod_dir: row.chmod_dir,
        owner: row.owner,
        group: row.group_name,
        umask: row.umask,
        cleanup_keep,
        cleanup_drop,
        allow_paths,
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}

fn fs_policy_to_row(policy: &FsPolicy) -> FsPolicyRow {
    FsPolicyRow {
        id: policy.id.to_string(),
        library_root: policy.library_root.clone(),
        extract: policy.extract.enabled(),
        par2: policy.par2.as_str().to_owned(),
        flatten: policy.flatten.enabled(),
        move_mode: policy.move_mode.as_str().to_owned(),
        chmod_file: policy.chmod_file.clone(),
        chmod_dir: policy.chmod_dir.clone(),
        owner: policy.owner.clone(),
        group_name: policy.group.clone(),
        umask: policy.umask.clone(),
        created_at: policy.created_at,
        updated_at: policy.updated_at,
    }
}

async fn write_fs_paths(conn: &mut SqliteConnection, policy: &FsPolicy) -> Result<()> {
    let id = policy.id.to_string();
    data::replace_fs_policy_paths(&mut *conn, &id, PATH_CLEANUP_KEEP, &policy.cleanup_keep)
        .await
        .map_err(map_data_err("replace cleanup keep patterns"))?;
    data::replace_fs_policy_paths(&mut *conn, &id, PATH_CLEANUP_DROP, &policy.cleanup_drop)
        .await
        .map_err(map_data_err("replace cleanup drop patterns"))?;
    data::replace_fs_policy_paths(&mut *conn, &id, PATH_ALLOW, &policy.allow_paths)
        .await
        .map_err(map_data_err("replace allowed paths"))?;
    Ok(())
}

fn map_api_key_auth(row: ApiKeyRow) -> ApiKeyAuth {
    let rate_limit = row
        .rate_limit_burst
        .zip(row.rate_limit_per_seconds)
        .map(|(burst, per_seconds)| ApiKeyRateLimit {
            burst: u32::try_from(burst).unwrap_or(u32::MAX),
            per_seconds: u64::try_from(per_seconds).unwrap_or(u64::MAX),
        });
    ApiKeyAuth {
        key_id: row.key_id,
        hash: row.hash,
        label: row.label,
        rate_limit,
    }
}

fn map_setup_token(row: SetupTokenRow) -> Result<SetupToken> {
    Ok(SetupToken {
        id: parse_uuid(&row.id)?,
        token_hash: row.token_hash,
        issued_at: row.issued_at,
        expires_at: row.expires_at,
        consumed_at: row.consumed_at,
    })
}

fn setup_token_to_row(token: &SetupToken) -> SetupTokenRow {
    SetupTokenRow {
        id: token.id.to_string(),
        token_hash: token.token_hash.clone(),
        issued_at: token.issued_at,
        expires_at: token.expires_at,
        consumed_at: token.consumed_at,
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{
        changed_app_fields, is_immutable, normalize_label_policies, normalize_mode_field,
    };
    use crate::defaults::default_app_profile;
    use crate::error::ConfigError;
    use crate::model::{LabelKind, LabelPolicy};

    fn policy(kind: LabelKind, name: &str) -> LabelPolicy {
        LabelPolicy {
            kind,
            name: name.to_owned(),
            download_dir: None,
            rate_limit_download_bps: None,
            rate_limit_upload_bps: None,
            queue_position: None,
            auto_managed: None,
            seed_ratio_limit: None,
            seed_time_limit: None,
            cleanup_seed_ratio_limit: None,
            cleanup_seed_time_limit: None,
            cleanup_remove_data: None,
        }
    }

    #[test]
    fn immutable_keys_match_sections_and_dotted_fields() {
        let whole_section = vec!["app".to_owned()];
        assert!(is_immutable(&whole_section, "app", "instance_name"));
        assert!(!is_immutable(&whole_section, "engine", "network"));

        let single_field = vec!["app.instance_name".to_owned()];
        assert!(is_immutable(&single_field, "app", "instance_name"));
        assert!(!is_immutable(&single_field, "app", "http_port"));

        let engine_field = vec!["engine.network".to_owned()];
        assert!(is_immutable(&engine_field, "engine", "network"));
        assert!(!is_immutable(&engine_field, "engine", "limits"));
    }

    #[test]
    fn changed_fields_reflect_profile_diffs() {
        let now = Utc::now();
        let current = default_app_profile(now);
        let mut next = current.clone();
        assert!(changed_app_fields(&current, &next).is_empty());

        next.instance_name = "media-box".to_owned();
        next.http_port = 9090;
        assert_eq!(
            changed_app_fields(&current, &next),
            vec!["instance_name", "http_port"]
        );
    }

    #[test]
    fn label_policies_reject_duplicates_within_a_kind() {
        let policies = vec![
            policy(LabelKind::Category, "tv"),
            policy(LabelKind::Tag, "tv"),
        ];
        assert_eq!(normalize_label_policies(&policies).unwrap().len(), 2);

        let duplicated = vec![
            policy(LabelKind::Category, "tv"),
            policy(LabelKind::Category, " tv "),
        ];
        assert!(matches!(
            normalize_label_policies(&duplicated),
            Err(ConfigError::DuplicateLabelPolicy { .. })
        ));
    }

    #[test]
    fn mode_fields_accept_octal_and_clear_on_blank() {
        assert_eq!(
            normalize_mode_field("chmod_file", Some(" 0755 ".to_owned())).unwrap(),
            Some("0755".to_owned())
        );
        assert_eq!(
            normalize_mode_field("chmod_file", Some("   ".to_owned())).unwrap(),
            None
        );
        assert_eq!(normalize_mode_field("chmod_file", None).unwrap(), None);
        assert!(normalize_mode_field("chmod_file", Some("rwx".to_owned())).is_err());
    }
}
