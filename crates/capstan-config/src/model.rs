//! Typed settings aggregates: application profile, filesystem policy,
//! credentials, secrets, and the changeset envelope.
//!
//! The engine profile lives in [`crate::engine_profile`]; everything here is
//! shared across aggregates or small enough not to warrant its own module.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine_profile::{EngineProfile, EngineProfileUpdate};
use crate::error::ConfigError;

/// Lifecycle mode of the application profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppMode {
    /// First-run state; the instance is waiting for initial configuration.
    Setup,
    /// Normal operating state.
    Active,
}

impl AppMode {
    /// Canonical storage label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::Active => "active",
        }
    }
}

impl FromStr for AppMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "setup" => Ok(Self::Setup),
            "active" => Ok(Self::Active),
            other => Err(ConfigError::InvalidAppMode {
                value: other.to_owned(),
            }),
        }
    }
}

/// How API callers authenticate against the HTTP surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// Callers present an API key.
    ApiKey,
    /// Authentication is switched off.
    Disabled,
}

impl AuthMode {
    /// Canonical storage label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ApiKey => "api_key",
            Self::Disabled => "disabled",
        }
    }
}

impl FromStr for AuthMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "api_key" => Ok(Self::ApiKey),
            "disabled" => Ok(Self::Disabled),
            other => Err(ConfigError::InvalidAuthMode {
                value: other.to_owned(),
            }),
        }
    }
}

/// Namespace a label policy applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelKind {
    /// Mutually exclusive grouping label.
    Category,
    /// Free-form tag label.
    Tag,
}

impl LabelKind {
    /// Canonical storage label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Category => "category",
            Self::Tag => "tag",
        }
    }
}

impl FromStr for LabelKind {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "category" => Ok(Self::Category),
            "tag" => Ok(Self::Tag),
            other => Err(ConfigError::InvalidLabelKind {
                value: other.to_owned(),
            }),
        }
    }
}

/// How finished payloads move from the staging area into the library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveMode {
    /// Hard-link into the library, falling back to copy across devices.
    Hardlink,
    /// Copy, leaving the staging payload in place.
    Copy,
    /// Rename into the library.
    Move,
}

impl MoveMode {
    /// Canonical storage label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hardlink => "hardlink",
            Self::Copy => "copy",
            Self::Move => "move",
        }
    }
}

impl FromStr for MoveMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "hardlink" => Ok(Self::Hardlink),
            "copy" => Ok(Self::Copy),
            "move" => Ok(Self::Move),
            other => Err(ConfigError::InvalidMoveMode {
                value: other.to_owned(),
            }),
        }
    }
}

/// Parity-archive handling for completed downloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Par2Policy {
    /// Ignore parity volumes.
    Off,
    /// Verify payloads against parity volumes.
    Verify,
    /// Verify and repair damaged payloads.
    Repair,
}

impl Par2Policy {
    /// Canonical storage label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Verify => "verify",
            Self::Repair => "repair",
        }
    }
}

impl FromStr for Par2Policy {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "off" => Ok(Self::Off),
            "verify" => Ok(Self::Verify),
            "repair" => Ok(Self::Repair),
            other => Err(ConfigError::InvalidPar2Policy {
                value: other.to_owned(),
            }),
        }
    }
}

/// Boolean wrapper keeping structs with many switches readable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Toggle(pub bool);

impl Toggle {
    /// Whether the switch is on.
    #[must_use]
    pub const fn enabled(self) -> bool {
        self.0
    }
}

impl From<bool> for Toggle {
    fn from(value: bool) -> Self {
        Self(value)
    }
}

impl fmt::Display for Toggle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Telemetry knobs carried on the application profile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level filter, e.g. `info` or `debug`.
    pub level: Option<String>,
    /// Log output format, e.g. `json` or `text`.
    pub format: Option<String>,
    /// Whether OpenTelemetry export is on.
    #[serde(default)]
    pub otel_enabled: bool,
    /// Service name reported to the collector.
    pub otel_service_name: Option<String>,
    /// Collector endpoint URL.
    pub otel_endpoint: Option<String>,
}

/// Per-label overrides applied to torrents carrying the label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelPolicy {
    /// Namespace the label lives in.
    pub kind: LabelKind,
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
    /// Auto-management override.
    pub auto_managed: Option<bool>,
    /// Seed ratio at which seeding stops.
    pub seed_ratio_limit: Option<f64>,
    /// Seeding time limit in seconds.
    pub seed_time_limit: Option<i64>,
    /// Seed ratio at which cleanup removes the torrent.
    pub cleanup_seed_ratio_limit: Option<f64>,
    /// Seeding time in seconds at which cleanup removes the torrent.
    pub cleanup_seed_time_limit: Option<i64>,
    /// Whether cleanup also deletes payload data.
    pub cleanup_remove_data: Option<bool>,
}

/// Application-level settings aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppProfile {
    /// Fixed singleton identifier.
    pub id: Uuid,
    /// Human-readable instance name.
    pub instance_name: String,
    /// Lifecycle mode.
    pub mode: AppMode,
    /// API authentication mode.
    pub auth_mode: AuthMode,
    /// Monotonic per-profile version, bumped on every accepted update.
    pub version: i64,
    /// HTTP listener port.
    pub http_port: u16,
    /// HTTP bind address.
    pub bind_addr: String,
    /// Telemetry knobs.
    pub telemetry: TelemetryConfig,
    /// Config keys frozen against further updates.
    pub immutable_keys: Vec<String>,
    /// Per-label overrides.
    pub label_policies: Vec<LabelPolicy>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last-update timestamp.
    pub updated_at: DateTime<Utc>,
}

/// Full-state update for the application profile.
///
/// Identifier and version are managed by the store and intentionally absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppProfileUpdate {
    /// New instance name.
    pub instance_name: String,
    /// New lifecycle mode.
    pub mode: AppMode,
    /// New auth mode.
    pub auth_mode: AuthMode,
    /// New HTTP listener port.
    pub http_port: u16,
    /// New HTTP bind address.
    pub bind_addr: String,
    /// New telemetry knobs.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    /// New immutable key list.
    #[serde(default)]
    pub immutable_keys: Vec<String>,
    /// New label policies.
    #[serde(default)]
    pub label_policies: Vec<LabelPolicy>,
}

impl From<&AppProfile> for AppProfileUpdate {
    fn from(profile: &AppProfile) -> Self {
        Self {
            instance_name: profile.instance_name.clone(),
            mode: profile.mode,
            auth_mode: profile.auth_mode,
            http_port: profile.http_port,
            bind_addr: profile.bind_addr.clone(),
            telemetry: profile.telemetry.clone(),
            immutable_keys: profile.immutable_keys.clone(),
            label_policies: profile.label_policies.clone(),
        }
    }
}

/// Filesystem policy aggregate governing completed-download handling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FsPolicy {
    /// Fixed singleton identifier.
    pub id: Uuid,
    /// Root of the media library.
    pub library_root: String,
    /// Whether archives are extracted after completion.
    pub extract: Toggle,
    /// Parity-archive policy.
    pub par2: Par2Policy,
    /// Whether single-child directory chains are flattened.
    pub flatten: Toggle,
    /// How payloads move into the library.
    pub move_mode: MoveMode,
    /// Octal file mode applied to moved files.
    pub chmod_file: Option<String>,
    /// Octal directory mode applied to created directories.
    pub chmod_dir: Option<String>,
    /// Owner applied to moved payloads.
    pub owner: Option<String>,
    /// Group applied to moved payloads.
    pub group: Option<String>,
    /// Umask applied while writing.
    pub umask: Option<String>,
    /// Filename patterns cleanup always keeps.
    pub cleanup_keep: Vec<String>,
    /// Filename patterns cleanup always drops.
    pub cleanup_drop: Vec<String>,
    /// Path prefixes moves may write beneath.
    pub allow_paths: Vec<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last-update timestamp.
    pub updated_at: DateTime<Utc>,
}

/// Full-state update for the filesystem policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FsPolicyUpdate {
    /// New library root.
    pub library_root: String,
    /// New extraction switch.
    #[serde(default)]
    pub extract: Toggle,
    /// New parity policy.
    pub par2: Par2Policy,
    /// New flattening switch.
    #[serde(default)]
    pub flatten: Toggle,
    /// New move mode.
    pub move_mode: MoveMode,
    /// New file mode.
    pub chmod_file: Option<String>,
    /// New directory mode.
    pub chmod_dir: Option<String>,
    /// New owner.
    pub owner: Option<String>,
    /// New group.
    pub group: Option<String>,
    /// New umask.
    pub umask: Option<String>,
    /// New keep patterns.
    #[serde(default)]
    pub cleanup_keep: Vec<String>,
    /// New drop patterns.
    #[serde(default)]
    pub cleanup_drop: Vec<String>,
    /// New allowed path prefixes.
    #[serde(default)]
    pub allow_paths: Vec<String>,
}

impl From<&FsPolicy> for FsPolicyUpdate {
    fn from(policy: &FsPolicy) -> Self {
        Self {
            library_root: policy.library_root.clone(),
            extract: policy.extract,
            par2: policy.par2,
            flatten: policy.flatten,
            move_mode: policy.move_mode,
            chmod_file: policy.chmod_file.clone(),
            chmod_dir: policy.chmod_dir.clone(),
            owner: policy.owner.clone(),
            group: policy.group.clone(),
            umask: policy.umask.clone(),
            cleanup_keep: policy.cleanup_keep.clone(),
            cleanup_drop: policy.cleanup_drop.clone(),
            allow_paths: policy.allow_paths.clone(),
        }
    }
}

/// Token-bucket rate limit attached to an API key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyRateLimit {
    /// Requests admitted per window.
    pub burst: u32,
    /// Window length in seconds.
    pub per_seconds: u64,
}

/// Create-or-update payload for an API key.
///
/// On update, absent fields keep their stored values; on insert, `hash` is
/// required and `enabled` defaults to on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyUpsert {
    /// Stable key identifier.
    pub key_id: String,
    /// Salted hash of the key material.
    #[serde(default)]
    pub hash: Option<String>,
    /// Operator-facing label.
    #[serde(default)]
    pub label: Option<String>,
    /// Whether the key is accepted.
    #[serde(default)]
    pub enabled: Option<bool>,
    /// Expiry instant, if the key should lapse.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Rate limit applied to the key.
    #[serde(default)]
    pub rate_limit: Option<ApiKeyRateLimit>,
}

/// One API-key mutation inside a changeset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ApiKeyPatch {
    /// Create or update a key.
    Upsert(ApiKeyUpsert),
    /// Delete a key; unknown ids are a no-op.
    Delete {
        /// Identifier of the key to remove.
        key_id: String,
    },
}

/// One secret mutation inside a changeset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum SecretPatch {
    /// Store or overwrite a named secret.
    Set {
        /// Secret name.
        name: String,
        /// Opaque ciphertext.
        value: Vec<u8>,
    },
    /// Delete a named secret; unknown names are a no-op.
    Delete {
        /// Secret name.
        name: String,
    },
}

/// Projection of an API key used by the authentication layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyAuth {
    /// Stable key identifier.
    pub key_id: String,
    /// Salted hash the presented key is verified against.
    pub hash: String,
    /// Operator-facing label.
    pub label: Option<String>,
    /// Rate limit applied to the key.
    pub rate_limit: Option<ApiKeyRateLimit>,
}

/// Stored opaque secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Secret {
    /// Secret name.
    pub name: String,
    /// Opaque ciphertext; the store never interprets it.
    pub ciphertext: Vec<u8>,
    /// Actor that last wrote the secret.
    pub created_by: Option<String>,
    /// Last-write timestamp.
    pub updated_at: DateTime<Utc>,
}

/// One-time bootstrap token handed to the first-run flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupToken {
    /// Token identifier.
    pub id: Uuid,
    /// Hash of the token material.
    pub token_hash: String,
    /// Issuance instant.
    pub issued_at: DateTime<Utc>,
    /// Expiry instant.
    pub expires_at: DateTime<Utc>,
    /// Consumption instant, once used.
    pub consumed_at: Option<DateTime<Utc>>,
}

/// Batched settings mutation applied atomically under one revision.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsChangeset {
    /// Replacement application profile.
    #[serde(default)]
    pub app_profile: Option<AppProfileUpdate>,
    /// Engine profile section updates.
    #[serde(default)]
    pub engine_profile: Option<EngineProfileUpdate>,
    /// Replacement filesystem policy.
    #[serde(default)]
    pub fs_policy: Option<FsPolicyUpdate>,
    /// API-key mutations, applied in order.
    #[serde(default)]
    pub api_keys: Vec<ApiKeyPatch>,
    /// Secret mutations, applied in order.
    #[serde(default)]
    pub secrets: Vec<SecretPatch>,
}

impl SettingsChangeset {
    /// Whether the changeset carries no mutations at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.app_profile.is_none()
            && self.engine_profile.is_none()
            && self.fs_policy.is_none()
            && self.api_keys.is_empty()
            && self.secrets.is_empty()
    }
}

/// Result of an accepted mutation: the new revision plus the aggregates it
/// touched.
#[derive(Debug, Clone)]
pub struct AppliedChanges {
    /// Revision the mutation landed at.
    pub revision: i64,
    /// New application profile, when it changed.
    pub app_profile: Option<AppProfile>,
    /// New engine profile, when it changed.
    pub engine_profile: Option<EngineProfile>,
    /// New filesystem policy, when it changed.
    pub fs_policy: Option<FsPolicy>,
}

/// Consistent read of every aggregate at a single revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    /// Revision the snapshot was taken at.
    pub revision: i64,
    /// Application profile.
    pub app_profile: AppProfile,
    /// Engine profile.
    pub engine_profile: EngineProfile,
    /// Filesystem policy.
    pub fs_policy: FsPolicy,
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::{AppMode, LabelKind, MoveMode, Par2Policy, SettingsChangeset, Toggle};

    #[test]
    fn enum_labels_round_trip_through_from_str() {
        for mode in [AppMode::Setup, AppMode::Active] {
            assert_eq!(AppMode::from_str(mode.as_str()).ok(), Some(mode));
        }
        for kind in [LabelKind::Category, LabelKind::Tag] {
            assert_eq!(LabelKind::from_str(kind.as_str()).ok(), Some(kind));
        }
        for mode in [MoveMode::Hardlink, MoveMode::Copy, MoveMode::Move] {
            assert_eq!(MoveMode::from_str(mode.as_str()).ok(), Some(mode));
        }
        for policy in [Par2Policy::Off, Par2Policy::Verify, Par2Policy::Repair] {
            assert_eq!(Par2Policy::from_str(policy.as_str()).ok(), Some(policy));
        }
        assert!(AppMode::from_str("paused").is_err());
    }

    #[test]
    fn toggles_serialize_transparently() {
        let json = serde_json::to_string(&Toggle(true)).unwrap();
        assert_eq!(json, "true");
        let toggle: Toggle = serde_json::from_str("false").unwrap();
        assert!(!toggle.enabled());
    }

    #[test]
    fn empty_changeset_reports_empty() {
        assert!(SettingsChangeset::default().is_empty());
        let changeset = SettingsChangeset {
            api_keys: vec![super::ApiKeyPatch::Delete {
                key_id: "k1".into(),
            }],
            ..SettingsChangeset::default()
        };
        assert!(!changeset.is_empty());
    }
}
