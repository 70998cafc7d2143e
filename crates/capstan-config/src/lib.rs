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

//! Versioned settings store built on `SQLite`.
//!
//! Layout: `model.rs` (typed profiles, credentials, and changesets),
//! `engine_profile.rs` (engine sections and their normalizers),
//! `validate.rs` (validation/parsing helpers), `service.rs` (`ConfigStore` +
//! `SettingsFacade` + the snapshot watcher).

mod defaults;
pub mod engine_profile;
pub mod error;
pub mod model;
pub mod service;
pub mod validate;

pub use capstan_events::{ChangeOp, SettingsChange, SettingsEvent, SettingsStream};
pub use engine_profile::{
    AltSpeedConfig, AltSpeedSchedule, AltSpeedScheduleUpdate, AltSpeedUpdate, EncryptionPolicy,
    EngineBehavior, EngineLimits, EngineListsUpdate, EngineNetwork, EngineProfile,
    EngineProfileUpdate, EngineQueueing, EngineStorage, IpFilterConfig, IpFilterUpdate, Ipv6Mode,
    MAX_PEER_CLASS_ID, MAX_RATE_LIMIT_BPS, MAX_TRACKER_URL_CHARS, PeerClassConfig,
    PeerClassesConfig, PeerClassesUpdate, StorageMode, TrackerAuthConfig, TrackerAuthUpdate,
    TrackerConfig, TrackerProxyConfig, TrackerProxyType, TrackerProxyUpdate, TrackerUpdate,
};
pub use error::{ConfigError, ConfigResult};
pub use model::{
    ApiKeyAuth, ApiKeyPatch, ApiKeyRateLimit, ApiKeyUpsert, AppMode, AppProfile, AppProfileUpdate,
    AppliedChanges, AuthMode, ConfigSnapshot, FsPolicy, FsPolicyUpdate, LabelKind, LabelPolicy,
    MoveMode, Par2Policy, Secret, SecretPatch, SettingsChangeset, SetupToken, TelemetryConfig,
    Toggle,
};
pub use service::{ConfigStore, ConfigWatcher, SettingsFacade};
