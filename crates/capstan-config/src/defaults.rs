//! Factory defaults written on first boot and on factory reset.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::engine_profile::{
    AltSpeedConfig, EngineBehavior, EngineLimits, EngineNetwork, EngineProfile, EngineQueueing,
    EngineStorage, IpFilterConfig, PeerClassesConfig, TrackerConfig,
};
use crate::model::{
    AppMode, AppProfile, AuthMode, FsPolicy, MoveMode, Par2Policy, TelemetryConfig, Toggle,
};

/// Fixed id of the singleton application profile row.
#[allow(clippy::redundant_pub_crate)]
pub(crate) const APP_PROFILE_ID: Uuid = Uuid::from_u128(1);
/// Fixed id of the singleton engine profile row.
#[allow(clippy::redundant_pub_crate)]
pub(crate) const ENGINE_PROFILE_ID: Uuid = Uuid::from_u128(2);
/// Fixed id of the singleton filesystem policy row.
#[allow(clippy::redundant_pub_crate)]
pub(crate) const FS_POLICY_ID: Uuid = Uuid::from_u128(3);

#[allow(clippy::redundant_pub_crate)]
pub(crate) fn default_app_profile(now: DateTime<Utc>) -> AppProfile {
    AppProfile {
        id: APP_PROFILE_ID,
        instance_name: "capstan".to_owned(),
        mode: AppMode::Setup,
        auth_mode: AuthMode::ApiKey,
        version: 1,
        http_port: 8080,
        bind_addr: "0.0.0.0".to_owned(),
        telemetry: TelemetryConfig {
            level: Some("info".to_owned()),
            format: Some("json".to_owned()),
            otel_enabled: false,
            otel_service_name: None,
            otel_endpoint: None,
        },
        immutable_keys: Vec::new(),
        label_policies: Vec::new(),
        created_at: now,
        updated_at: now,
    }
}

#[allow(clippy::redundant_pub_crate)]
pub(crate) fn default_engine_profile(now: DateTime<Utc>) -> EngineProfile {
    EngineProfile {
        id: ENGINE_PROFILE_ID,
        network: EngineNetwork::default(),
        limits: EngineLimits::default(),
        queueing: EngineQueueing::default(),
        storage: EngineStorage::default(),
        behavior: EngineBehavior::default(),
        listen_interfaces: Vec::new(),
        dht_bootstrap_nodes: Vec::new(),
        dht_router_nodes: Vec::new(),
        ip_filter: IpFilterConfig::default(),
        alt_speed: AltSpeedConfig::default(),
        tracker: TrackerConfig::default(),
        peer_classes: PeerClassesConfig::default(),
        created_at: now,
        updated_at: now,
    }
}

#[allow(clippy::redundant_pub_crate)]
pub(crate) fn default_fs_policy(now: DateTime<Utc>) -> FsPolicy {
    FsPolicy {
        id: FS_POLICY_ID,
        library_root: "/data/library".to_owned(),
        extract: Toggle(false),
        par2: Par2Policy::Off,
        flatten: Toggle(false),
        move_mode: MoveMode::Hardlink,
        chmod_file: None,
        chmod_dir: None,
        owner: None,
        group: None,
        umask: None,
        cleanup_keep: Vec::new(),
        cleanup_drop: Vec::new(),
        allow_paths: Vec::new(),
        created_at: now,
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{default_app_profile, default_engine_profile, default_fs_policy};
    use crate::engine_profile::{EncryptionPolicy, Ipv6Mode};
    use crate::model::{AppMode, AuthMode, MoveMode, Par2Policy};

    #[test]
    fn seeds_match_first_boot_expectations() {
        let now = Utc::now();

        let app = default_app_profile(now);
        assert_eq!(app.instance_name, "capstan");
        assert_eq!(app.mode, AppMode::Setup);
        assert_eq!(app.auth_mode, AuthMode::ApiKey);
        assert_eq!(app.http_port, 8080);
        assert_eq!(app.bind_addr, "0.0.0.0");
        assert_eq!(app.version, 1);
        assert_eq!(app.telemetry.level.as_deref(), Some("info"));
        assert_eq!(app.telemetry.format.as_deref(), Some("json"));
        assert!(!app.telemetry.otel_enabled);

        let engine = default_engine_profile(now);
        assert!(engine.network.dht.enabled());
        assert!(engine.network.pex.enabled());
        assert_eq!(engine.network.ipv6_mode, Ipv6Mode::Enabled);
        assert_eq!(engine.network.encryption, EncryptionPolicy::Prefer);
        assert_eq!(engine.network.listen_port, None);
        assert!(engine.queueing.auto_managed);
        assert!(engine.queueing.dont_count_slow_torrents);
        assert_eq!(engine.storage.download_root, "/data/staging");
        assert_eq!(engine.storage.resume_dir, "/var/lib/capstan/state");
        assert!(engine.storage.verify_piece_hashes);
        assert!(!engine.behavior.sequential_default);
        assert!(engine.tracker.ssl_verify);
        assert!(engine.peer_classes.classes.is_empty());

        let fs = default_fs_policy(now);
        assert_eq!(fs.library_root, "/data/library");
        assert!(!fs.extract.enabled());
        assert_eq!(fs.par2, Par2Policy::Off);
        assert_eq!(fs.move_mode, MoveMode::Hardlink);
        assert!(fs.allow_paths.is_empty());
    }
}
