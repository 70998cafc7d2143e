//! Engine profile aggregate: the torrent session settings, their section
//! update types, and the normalization rules applied on every write.
//!
//! Updates arrive as optional sections; a provided section replaces the
//! stored one wholesale after normalization. Lenient rules degrade bad
//! values with a warning, strict rules reject the whole update.

use std::collections::HashSet;

use chrono::{DateTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::error::{ConfigError, ConfigResult};
use crate::model::Toggle;
use crate::validate::{
    format_minutes, non_empty, normalize_string_list, parse_minutes, parse_weekday_label,
    sanitize_path, weekday_label,
};

/// Largest accepted rate cap in bytes per second; higher values clamp here.
pub const MAX_RATE_LIMIT_BPS: i64 = 5_000_000_000;

/// Longest accepted tracker announce URL.
pub const MAX_TRACKER_URL_CHARS: usize = 512;

/// Peer class ids live in `0..=31`.
pub const MAX_PEER_CLASS_ID: u8 = 31;

pub(crate) const DEFAULT_DOWNLOAD_ROOT: &str = "/data/staging";
pub(crate) const DEFAULT_RESUME_DIR: &str = "/var/lib/capstan/state";

/// IPv6 participation of the session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ipv6Mode {
    /// IPv6 is not used.
    Disabled,
    /// IPv6 is used alongside IPv4.
    #[default]
    Enabled,
    /// IPv6 is preferred over IPv4 where both resolve.
    Preferred,
}

impl Ipv6Mode {
    /// Canonical storage label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Enabled => "enabled",
            Self::Preferred => "preferred",
        }
    }

    pub(crate) fn parse(value: &str) -> Self {
        match value {
            "disabled" => Self::Disabled,
            "preferred" => Self::Preferred,
            _ => Self::Enabled,
        }
    }
}

/// Peer wire encryption policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionPolicy {
    /// Only encrypted connections are accepted.
    Require,
    /// Encryption is preferred but plaintext peers are allowed.
    #[default]
    Prefer,
    /// Encryption is not offered.
    Disable,
}

impl EncryptionPolicy {
    /// Canonical storage label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Require => "require",
            Self::Prefer => "prefer",
            Self::Disable => "disable",
        }
    }

    pub(crate) fn parse(value: &str) -> Self {
        match value {
            "require" => Self::Require,
            "disable" => Self::Disable,
            _ => Self::Prefer,
        }
    }
}

/// On-disk allocation strategy for payload files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    /// Sparse files, allocated as pieces arrive.
    #[default]
    Sparse,
    /// Full allocation up front.
    Allocate,
}

impl StorageMode {
    /// Canonical storage label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sparse => "sparse",
            Self::Allocate => "allocate",
        }
    }

    pub(crate) fn parse(value: &str) -> Self {
        match value {
            "allocate" => Self::Allocate,
            _ => Self::Sparse,
        }
    }
}

/// Protocol used to reach the tracker proxy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerProxyType {
    /// Plain HTTP proxy.
    #[default]
    Http,
    /// HTTPS proxy.
    Https,
    /// SOCKS5 proxy.
    Socks5,
}

impl TrackerProxyType {
    /// Canonical storage label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
            Self::Socks5 => "socks5",
        }
    }

    pub(crate) fn parse(value: &str) -> Self {
        match value {
            "https" => Self::Https,
            "socks5" => Self::Socks5,
            _ => Self::Http,
        }
    }
}

/// Connectivity and peer discovery settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineNetwork {
    /// Inbound listen port; `None` lets the engine pick one.
    pub listen_port: Option<u16>,
    /// IPv6 participation.
    pub ipv6_mode: Ipv6Mode,
    /// Distributed hash table participation.
    pub dht: Toggle,
    /// Local service discovery.
    pub lsd: Toggle,
    /// UPnP port mapping.
    pub upnp: Toggle,
    /// NAT-PMP port mapping.
    pub natpmp: Toggle,
    /// Peer exchange.
    pub pex: Toggle,
    /// Outgoing uTP connections.
    pub outgoing_utp: Toggle,
    /// Incoming uTP connections.
    pub incoming_utp: Toggle,
    /// Peer wire encryption policy.
    pub encryption: EncryptionPolicy,
    /// Anonymous mode; strips identifying fields from the peer wire.
    pub anonymous_mode: Toggle,
    /// Drop all peer traffic that cannot go through the proxy.
    pub force_proxy: Toggle,
    /// Lower bound of the outgoing port range.
    pub outgoing_port_min: Option<u16>,
    /// Upper bound of the outgoing port range.
    pub outgoing_port_max: Option<u16>,
    /// DSCP value applied to peer sockets, `0..=63`.
    pub peer_dscp: Option<u8>,
}

impl Default for EngineNetwork {
    fn default() -> Self {
        Self {
            listen_port: None,
            ipv6_mode: Ipv6Mode::Enabled,
            dht: Toggle(true),
            lsd: Toggle(true),
            upnp: Toggle(true),
            natpmp: Toggle(true),
            pex: Toggle(true),
            outgoing_utp: Toggle(true),
            incoming_utp: Toggle(true),
            encryption: EncryptionPolicy::Prefer,
            anonymous_mode: Toggle(false),
            force_proxy: Toggle(false),
            outgoing_port_min: None,
            outgoing_port_max: None,
            peer_dscp: None,
        }
    }
}

/// Session-wide throughput and connection limits. `None` means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineLimits {
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
    /// Number of upload unchoke slots.
    pub unchoke_slots: Option<i64>,
    /// Half-open connection limit.
    pub half_open_limit: Option<i64>,
    /// Stop-seeding ratio threshold.
    pub seed_ratio_limit: Option<f64>,
    /// Stop-seeding time threshold in seconds.
    pub seed_time_limit: Option<i64>,
}

/// Torrent queueing behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineQueueing {
    /// Whether new torrents are auto-managed.
    pub auto_managed: bool,
    /// Whether seeding torrents outrank downloading ones in the queue.
    pub prefer_seeds: bool,
    /// Whether slow torrents are excluded from the active count.
    pub dont_count_slow_torrents: bool,
}

impl Default for EngineQueueing {
    fn default() -> Self {
        Self {
            auto_managed: true,
            prefer_seeds: false,
            dont_count_slow_torrents: true,
        }
    }
}

/// Paths and disk behavior of the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineStorage {
    /// Staging directory for in-progress downloads.
    pub download_root: String,
    /// Directory holding fast-resume state.
    pub resume_dir: String,
    /// On-disk allocation strategy.
    pub storage_mode: StorageMode,
    /// Disk cache size in MiB; `None` uses the engine default.
    pub cache_size_mib: Option<i64>,
    /// Disk cache expiry in seconds.
    pub cache_expiry_seconds: Option<i64>,
    /// Whether piece hashes are re-verified on read.
    pub verify_piece_hashes: bool,
}

impl Default for EngineStorage {
    fn default() -> Self {
        Self {
            download_root: DEFAULT_DOWNLOAD_ROOT.to_owned(),
            resume_dir: DEFAULT_RESUME_DIR.to_owned(),
            storage_mode: StorageMode::Sparse,
            cache_size_mib: None,
            cache_expiry_seconds: None,
            verify_piece_hashes: true,
        }
    }
}

/// Remaining per-session behavior switches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineBehavior {
    /// Whether new torrents download sequentially by default.
    pub sequential_default: bool,
    /// Whether super seeding is enabled.
    pub super_seeding: bool,
    /// Session statistics polling interval in milliseconds.
    pub stats_interval_ms: Option<i64>,
}

/// IP filter configuration plus the fetch status of the blocklist.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpFilterConfig {
    /// URL the blocklist is fetched from.
    pub blocklist_url: Option<String>,
    /// Entity tag of the last successful fetch.
    pub etag: Option<String>,
    /// Instant of the last successful fetch.
    pub last_updated_at: Option<DateTime<Utc>>,
    /// Message of the last failed fetch.
    pub last_error: Option<String>,
    /// Static CIDR rules applied in addition to the blocklist.
    pub cidrs: Vec<String>,
}

/// Weekly window during which alternate limits apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AltSpeedSchedule {
    /// Days the window is active on, canonically ordered Monday first.
    #[serde(
        serialize_with = "crate::validate::serialize_weekdays",
        deserialize_with = "crate::validate::deserialize_weekdays"
    )]
    pub days: Vec<Weekday>,
    /// Window start in minutes past midnight.
    pub start_minutes: u16,
    /// Window end in minutes past midnight; smaller than the start for
    /// windows that wrap past midnight.
    pub end_minutes: u16,
}

/// Alternate speed limits and their optional schedule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AltSpeedConfig {
    /// Alternate download cap in bytes per second.
    pub download_bps: Option<i64>,
    /// Alternate upload cap in bytes per second.
    pub upload_bps: Option<i64>,
    /// When the alternate caps apply; `None` means manual toggling only.
    pub schedule: Option<AltSpeedSchedule>,
}

/// Proxy used for tracker announces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerProxyConfig {
    /// Proxy host.
    pub host: String,
    /// Proxy port.
    pub port: u16,
    /// Proxy protocol.
    pub kind: TrackerProxyType,
    /// Secret name holding the proxy username.
    pub username_secret: Option<String>,
    /// Secret name holding the proxy password.
    pub password_secret: Option<String>,
    /// Whether peer connections also go through the proxy.
    pub proxy_peers: bool,
}

/// Tracker authentication material, referenced by secret name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerAuthConfig {
    /// Secret name holding the announce username.
    pub username_secret: Option<String>,
    /// Secret name holding the announce password.
    pub password_secret: Option<String>,
    /// Secret name holding the announce cookie.
    pub cookie_secret: Option<String>,
}

/// Tracker behavior: announce lists, TLS material, proxy, and auth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Trackers added to every torrent.
    pub default_trackers: Vec<String>,
    /// Trackers appended on top of each torrent's own list.
    pub extra_trackers: Vec<String>,
    /// Whether the default list replaces per-torrent trackers.
    pub replace_trackers: bool,
    /// Whether every tracker is announced to rather than the first reachable.
    pub announce_to_all: bool,
    /// User agent presented to trackers.
    pub user_agent: Option<String>,
    /// Address reported in announces.
    pub announce_ip: Option<String>,
    /// Interface announces are sent from.
    pub listen_interface: Option<String>,
    /// Announce request timeout in milliseconds.
    pub request_timeout_ms: Option<i64>,
    /// Client certificate presented to HTTPS trackers.
    pub ssl_cert: Option<String>,
    /// Private key for the client certificate.
    pub ssl_private_key: Option<String>,
    /// CA bundle used to verify tracker certificates.
    pub ssl_ca_cert: Option<String>,
    /// Whether tracker TLS certificates are verified.
    pub ssl_verify: bool,
    /// Proxy for announces, when configured.
    pub proxy: Option<TrackerProxyConfig>,
    /// Announce authentication material, when configured.
    pub auth: Option<TrackerAuthConfig>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            default_trackers: Vec::new(),
            extra_trackers: Vec::new(),
            replace_trackers: false,
            announce_to_all: false,
            user_agent: None,
            announce_ip: None,
            listen_interface: None,
            request_timeout_ms: None,
            ssl_cert: None,
            ssl_private_key: None,
            ssl_ca_cert: None,
            ssl_verify: true,
            proxy: None,
            auth: None,
        }
    }
}

/// One peer class definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerClassConfig {
    /// Class id, `0..=31`.
    pub id: u8,
    /// Operator-facing label.
    pub label: String,
    /// Download priority, `1..=255`.
    #[serde(default = "default_priority")]
    pub download_priority: u8,
    /// Upload priority, `1..=255`.
    #[serde(default = "default_priority")]
    pub upload_priority: u8,
    /// Multiplier applied to the per-class connection limit.
    #[serde(default = "default_factor")]
    pub connection_limit_factor: u16,
    /// Whether members bypass the unchoke slot limit.
    #[serde(default)]
    pub ignore_unchoke_slots: bool,
}

/// Peer class table plus the classes new peers join by default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerClassesConfig {
    /// Defined classes, ordered by id.
    pub classes: Vec<PeerClassConfig>,
    /// Ids of classes assigned to new peers, sorted ascending.
    pub default: Vec<u8>,
}

/// Engine-level settings aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineProfile {
    /// Fixed singleton identifier.
    pub id: Uuid,
    /// Connectivity settings.
    pub network: EngineNetwork,
    /// Throughput and connection limits.
    pub limits: EngineLimits,
    /// Queueing behavior.
    pub queueing: EngineQueueing,
    /// Paths and disk behavior.
    pub storage: EngineStorage,
    /// Remaining behavior switches.
    pub behavior: EngineBehavior,
    /// Interfaces the session listens on.
    pub listen_interfaces: Vec<String>,
    /// DHT bootstrap nodes.
    pub dht_bootstrap_nodes: Vec<String>,
    /// DHT router nodes.
    pub dht_router_nodes: Vec<String>,
    /// IP filter configuration.
    pub ip_filter: IpFilterConfig,
    /// Alternate speed limits.
    pub alt_speed: AltSpeedConfig,
    /// Tracker behavior.
    pub tracker: TrackerConfig,
    /// Peer classes.
    pub peer_classes: PeerClassesConfig,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last-update timestamp.
    pub updated_at: DateTime<Utc>,
}

/// Replacement values for the engine string lists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineListsUpdate {
    /// New listen interface list.
    #[serde(default)]
    pub listen_interfaces: Vec<String>,
    /// New DHT bootstrap node list.
    #[serde(default)]
    pub dht_bootstrap_nodes: Vec<String>,
    /// New DHT router node list.
    #[serde(default)]
    pub dht_router_nodes: Vec<String>,
}

/// Replacement IP filter inputs.
///
/// Fetch status fields are owned by the blocklist refresher and are not
/// settable here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IpFilterUpdate {
    /// New blocklist URL.
    pub blocklist_url: Option<String>,
    /// New static CIDR rules.
    #[serde(default)]
    pub cidrs: Vec<String>,
}

/// Wire shape of an alternate speed schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AltSpeedScheduleUpdate {
    /// Weekday labels; full names and common abbreviations are accepted.
    #[serde(default)]
    pub days: Vec<String>,
    /// Window start as `"HH:MM"`.
    pub start: String,
    /// Window end as `"HH:MM"`.
    pub end: String,
}

/// Replacement alternate speed settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AltSpeedUpdate {
    /// New alternate download cap in bytes per second.
    pub download_bps: Option<i64>,
    /// New alternate upload cap in bytes per second.
    pub upload_bps: Option<i64>,
    /// New schedule.
    pub schedule: Option<AltSpeedScheduleUpdate>,
}

/// Replacement tracker proxy settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackerProxyUpdate {
    /// Proxy host; required and non-empty.
    pub host: Option<String>,
    /// Proxy port; required and nonzero.
    pub port: Option<u16>,
    /// Proxy protocol.
    #[serde(default)]
    pub kind: TrackerProxyType,
    /// Secret name holding the proxy username.
    pub username_secret: Option<String>,
    /// Secret name holding the proxy password.
    pub password_secret: Option<String>,
    /// Whether peer connections also go through the proxy.
    #[serde(default)]
    pub proxy_peers: bool,
}

/// Replacement tracker auth settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackerAuthUpdate {
    /// Secret name holding the announce username.
    pub username_secret: Option<String>,
    /// Secret name holding the announce password.
    pub password_secret: Option<String>,
    /// Secret name holding the announce cookie.
    pub cookie_secret: Option<String>,
}

/// Replacement tracker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerUpdate {
    /// New default tracker list.
    #[serde(default)]
    pub default_trackers: Vec<String>,
    /// New extra tracker list.
    #[serde(default)]
    pub extra_trackers: Vec<String>,
    /// Whether the default list replaces per-torrent trackers.
    #[serde(default)]
    pub replace_trackers: bool,
    /// Whether every tracker is announced to.
    #[serde(default)]
    pub announce_to_all: bool,
    /// New user agent.
    pub user_agent: Option<String>,
    /// New announce address.
    pub announce_ip: Option<String>,
    /// New announce interface.
    pub listen_interface: Option<String>,
    /// New announce timeout in milliseconds.
    pub request_timeout_ms: Option<i64>,
    /// New client certificate.
    pub ssl_cert: Option<String>,
    /// New client key.
    pub ssl_private_key: Option<String>,
    /// New CA bundle.
    pub ssl_ca_cert: Option<String>,
    /// Whether tracker TLS certificates are verified.
    #[serde(default = "default_true")]
    pub ssl_verify: bool,
    /// New proxy settings; absent removes the proxy.
    pub proxy: Option<TrackerProxyUpdate>,
    /// New auth settings; absent removes them.
    pub auth: Option<TrackerAuthUpdate>,
}

impl Default for TrackerUpdate {
    fn default() -> Self {
        Self {
            default_trackers: Vec::new(),
            extra_trackers: Vec::new(),
            replace_trackers: false,
            announce_to_all: false,
            user_agent: None,
            announce_ip: None,
            listen_interface: None,
            request_timeout_ms: None,
            ssl_cert: None,
            ssl_private_key: None,
            ssl_ca_cert: None,
            ssl_verify: true,
            proxy: None,
            auth: None,
        }
    }
}

/// Replacement peer class table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerClassesUpdate {
    /// New class definitions.
    #[serde(default)]
    pub classes: Vec<PeerClassConfig>,
    /// New default class assignments.
    #[serde(default)]
    pub default: Vec<u8>,
}

/// Sectioned update for the engine profile.
///
/// Absent sections keep their stored values; present sections replace them
/// wholesale.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineProfileUpdate {
    /// New connectivity settings.
    #[serde(default)]
    pub network: Option<EngineNetwork>,
    /// New limits.
    #[serde(default)]
    pub limits: Option<EngineLimits>,
    /// New queueing behavior.
    #[serde(default)]
    pub queueing: Option<EngineQueueing>,
    /// New storage settings.
    #[serde(default)]
    pub storage: Option<EngineStorage>,
    /// New behavior switches.
    #[serde(default)]
    pub behavior: Option<EngineBehavior>,
    /// New string lists.
    #[serde(default)]
    pub lists: Option<EngineListsUpdate>,
    /// New IP filter inputs.
    #[serde(default)]
    pub ip_filter: Option<IpFilterUpdate>,
    /// New alternate speed settings.
    #[serde(default)]
    pub alt_speed: Option<AltSpeedUpdate>,
    /// New tracker settings.
    #[serde(default)]
    pub tracker: Option<TrackerUpdate>,
    /// New peer classes.
    #[serde(default)]
    pub peer_classes: Option<PeerClassesUpdate>,
}

impl From<&EngineProfile> for EngineProfileUpdate {
    fn from(profile: &EngineProfile) -> Self {
        Self {
            network: Some(profile.network.clone()),
            limits: Some(profile.limits.clone()),
            queueing: Some(profile.queueing.clone()),
            storage: Some(profile.storage.clone()),
            behavior: Some(profile.behavior.clone()),
            lists: Some(EngineListsUpdate {
                listen_interfaces: profile.listen_interfaces.clone(),
                dht_bootstrap_nodes: profile.dht_bootstrap_nodes.clone(),
                dht_router_nodes: profile.dht_router_nodes.clone(),
            }),
            ip_filter: Some(IpFilterUpdate {
                blocklist_url: profile.ip_filter.blocklist_url.clone(),
                cidrs: profile.ip_filter.cidrs.clone(),
            }),
            alt_speed: Some(AltSpeedUpdate {
                download_bps: profile.alt_speed.download_bps,
                upload_bps: profile.alt_speed.upload_bps,
                schedule: profile.alt_speed.schedule.as_ref().map(|schedule| {
                    AltSpeedScheduleUpdate {
                        days: schedule
                            .days
                            .iter()
                            .map(|day| weekday_label(*day).to_owned())
                            .collect(),
                        start: format_minutes(schedule.start_minutes),
                        end: format_minutes(schedule.end_minutes),
                    }
                }),
            }),
            tracker: Some(TrackerUpdate {
                default_trackers: profile.tracker.default_trackers.clone(),
                extra_trackers: profile.tracker.extra_trackers.clone(),
                replace_trackers: profile.tracker.replace_trackers,
                announce_to_all: profile.tracker.announce_to_all,
                user_agent: profile.tracker.user_agent.clone(),
                announce_ip: profile.tracker.announce_ip.clone(),
                listen_interface: profile.tracker.listen_interface.clone(),
                request_timeout_ms: profile.tracker.request_timeout_ms,
                ssl_cert: profile.tracker.ssl_cert.clone(),
                ssl_private_key: profile.tracker.ssl_private_key.clone(),
                ssl_ca_cert: profile.tracker.ssl_ca_cert.clone(),
                ssl_verify: profile.tracker.ssl_verify,
                proxy: profile.tracker.proxy.as_ref().map(|proxy| TrackerProxyUpdate {
                    host: Some(proxy.host.clone()),
                    port: Some(proxy.port),
                    kind: proxy.kind,
                    username_secret: proxy.username_secret.clone(),
                    password_secret: proxy.password_secret.clone(),
                    proxy_peers: proxy.proxy_peers,
                }),
                auth: profile.tracker.auth.as_ref().map(|auth| TrackerAuthUpdate {
                    username_secret: auth.username_secret.clone(),
                    password_secret: auth.password_secret.clone(),
                    cookie_secret: auth.cookie_secret.clone(),
                }),
            }),
            peer_classes: Some(PeerClassesUpdate {
                classes: profile.peer_classes.classes.clone(),
                default: profile.peer_classes.default.clone(),
            }),
        }
    }
}

fn default_true() -> bool {
    true
}

const fn default_priority() -> u8 {
    1
}

const fn default_factor() -> u16 {
    1
}

/// Applies an update to the current profile, normalizing every provided
/// section. Timestamps are left to the caller.
///
/// # Errors
///
/// Returns a validation error when a strict rule rejects a section; nothing
/// is persisted in that case.
pub(crate) fn merge_update(
    current: &EngineProfile,
    update: EngineProfileUpdate,
) -> ConfigResult<EngineProfile> {
    let mut next = current.clone();
    if let Some(network) = update.network {
        next.network = normalize_network(network)?;
    }
    if let Some(limits) = update.limits {
        next.limits = normalize_limits(limits);
    }
    if let Some(queueing) = update.queueing {
        next.queueing = queueing;
    }
    if let Some(storage) = update.storage {
        next.storage = normalize_storage(storage);
    }
    if let Some(behavior) = update.behavior {
        next.behavior = behavior;
    }
    if let Some(lists) = update.lists {
        next.listen_interfaces = normalize_string_list(&lists.listen_interfaces);
        next.dht_bootstrap_nodes = normalize_string_list(&lists.dht_bootstrap_nodes);
        next.dht_router_nodes = normalize_string_list(&lists.dht_router_nodes);
    }
    if let Some(ip_filter) = update.ip_filter {
        next.ip_filter = normalize_ip_filter(&current.ip_filter, ip_filter);
    }
    if let Some(alt_speed) = update.alt_speed {
        next.alt_speed = normalize_alt_speed(alt_speed);
    }
    if let Some(tracker) = update.tracker {
        next.tracker = normalize_tracker(tracker)?;
    }
    if let Some(peer_classes) = update.peer_classes {
        next.peer_classes = normalize_peer_classes(peer_classes)?;
    }
    Ok(next)
}

fn invalid_field(field: &str, value: Option<String>, reason: &'static str) -> ConfigError {
    ConfigError::InvalidField {
        section: "engine".to_owned(),
        field: field.to_owned(),
        value,
        reason,
    }
}

fn validate_port(field: &str, value: Option<u16>) -> ConfigResult<()> {
    if value == Some(0) {
        return Err(invalid_field(
            field,
            Some("0".to_owned()),
            "port must be between 1 and 65535",
        ));
    }
    Ok(())
}

fn normalize_network(network: EngineNetwork) -> ConfigResult<EngineNetwork> {
    validate_port("listen_port", network.listen_port)?;
    validate_port("outgoing_port_min", network.outgoing_port_min)?;
    validate_port("outgoing_port_max", network.outgoing_port_max)?;
    if let (Some(min), Some(max)) = (network.outgoing_port_min, network.outgoing_port_max) {
        if min > max {
            return Err(invalid_field(
                "outgoing_port_min",
                Some(format!("{min}..{max}")),
                "outgoing port range is inverted",
            ));
        }
    }
    if let Some(dscp) = network.peer_dscp {
        if dscp > 63 {
            return Err(invalid_field(
                "peer_dscp",
                Some(dscp.to_string()),
                "dscp value must be at most 63",
            ));
        }
    }
    Ok(network)
}

fn normalize_limits(limits: EngineLimits) -> EngineLimits {
    EngineLimits {
        max_download_bps: clamp_rate_limit("max_download_bps", limits.max_download_bps),
        max_upload_bps: clamp_rate_limit("max_upload_bps", limits.max_upload_bps),
        ..limits
    }
}

/// Lenient rate-cap rule: non-positive values mean unlimited, oversized
/// values clamp to [`MAX_RATE_LIMIT_BPS`]. Both degradations warn.
pub(crate) fn clamp_rate_limit(field: &str, value: Option<i64>) -> Option<i64> {
    match value {
        Some(value) if value <= 0 => {
            warn!(field, value, "non-positive rate limit treated as unlimited");
            None
        }
        Some(value) if value > MAX_RATE_LIMIT_BPS => {
            warn!(field, value, "rate limit clamped to the supported maximum");
            Some(MAX_RATE_LIMIT_BPS)
        }
        other => other,
    }
}

fn normalize_storage(storage: EngineStorage) -> EngineStorage {
    EngineStorage {
        download_root: sanitize_path(&storage.download_root, DEFAULT_DOWNLOAD_ROOT),
        resume_dir: sanitize_path(&storage.resume_dir, DEFAULT_RESUME_DIR),
        ..storage
    }
}

fn normalize_ip_filter(current: &IpFilterConfig, update: IpFilterUpdate) -> IpFilterConfig {
    IpFilterConfig {
        blocklist_url: update.blocklist_url.as_deref().and_then(non_empty),
        etag: current.etag.clone(),
        last_updated_at: current.last_updated_at,
        last_error: current.last_error.clone(),
        cidrs: normalize_string_list(&update.cidrs),
    }
}

/// Lenient alternate-speed rule: a malformed schedule clears the whole
/// aggregate, caps included, with a warning.
pub(crate) fn normalize_alt_speed(update: AltSpeedUpdate) -> AltSpeedConfig {
    let schedule = match update.schedule {
        Some(schedule) => match normalize_schedule(&schedule) {
            Some(schedule) => Some(schedule),
            None => {
                warn!("malformed alternate speed schedule, clearing alternate limits");
                return AltSpeedConfig::default();
            }
        },
        None => None,
    };
    AltSpeedConfig {
        download_bps: clamp_rate_limit("alt_speed.download_bps", update.download_bps),
        upload_bps: clamp_rate_limit("alt_speed.upload_bps", update.upload_bps),
        schedule,
    }
}

fn normalize_schedule(update: &AltSpeedScheduleUpdate) -> Option<AltSpeedSchedule> {
    let start_minutes = parse_minutes(&update.start)?;
    let end_minutes = parse_minutes(&update.end)?;
    if start_minutes == end_minutes {
        return None;
    }
    let mut days = Vec::new();
    for label in &update.days {
        if label.trim().is_empty() {
            continue;
        }
        let day = parse_weekday_label(label)?;
        if !days.contains(&day) {
            days.push(day);
        }
    }
    if days.is_empty() {
        return None;
    }
    days.sort_by_key(|day| day.num_days_from_monday());
    Some(AltSpeedSchedule {
        days,
        start_minutes,
        end_minutes,
    })
}

/// Strict tracker rule: oversized URLs and incomplete proxies reject the
/// whole update.
pub(crate) fn normalize_tracker(update: TrackerUpdate) -> ConfigResult<TrackerConfig> {
    let default_trackers = normalize_string_list(&update.default_trackers);
    let extra_trackers = normalize_string_list(&update.extra_trackers);
    check_tracker_urls("tracker.default_trackers", &default_trackers)?;
    check_tracker_urls("tracker.extra_trackers", &extra_trackers)?;
    let proxy = update.proxy.map(normalize_tracker_proxy).transpose()?;
    let auth = update.auth.and_then(|auth| {
        let auth = TrackerAuthConfig {
            username_secret: auth.username_secret.as_deref().and_then(non_empty),
            password_secret: auth.password_secret.as_deref().and_then(non_empty),
            cookie_secret: auth.cookie_secret.as_deref().and_then(non_empty),
        };
        if auth.username_secret.is_none()
            && auth.password_secret.is_none()
            && auth.cookie_secret.is_none()
        {
            None
        } else {
            Some(auth)
        }
    });
    Ok(TrackerConfig {
        default_trackers,
        extra_trackers,
        replace_trackers: update.replace_trackers,
        announce_to_all: update.announce_to_all,
        user_agent: update.user_agent.as_deref().and_then(non_empty),
        announce_ip: update.announce_ip.as_deref().and_then(non_empty),
        listen_interface: update.listen_interface.as_deref().and_then(non_empty),
        request_timeout_ms: update.request_timeout_ms,
        ssl_cert: update.ssl_cert.as_deref().and_then(non_empty),
        ssl_private_key: update.ssl_private_key.as_deref().and_then(non_empty),
        ssl_ca_cert: update.ssl_ca_cert.as_deref().and_then(non_empty),
        ssl_verify: update.ssl_verify,
        proxy,
        auth,
    })
}

fn check_tracker_urls(field: &str, urls: &[String]) -> ConfigResult<()> {
    for url in urls {
        if url.chars().count() > MAX_TRACKER_URL_CHARS {
            return Err(invalid_field(
                field,
                Some(url.clone()),
                "tracker url exceeds 512 characters",
            ));
        }
    }
    Ok(())
}

fn normalize_tracker_proxy(update: TrackerProxyUpdate) -> ConfigResult<TrackerProxyConfig> {
    let Some(host) = update.host.as_deref().and_then(non_empty) else {
        return Err(invalid_field(
            "tracker.proxy.host",
            update.host,
            "proxy host must not be empty",
        ));
    };
    let port = match update.port {
        Some(port) if port != 0 => port,
        other => {
            return Err(invalid_field(
                "tracker.proxy.port",
                other.map(|port| port.to_string()),
                "proxy port must be between 1 and 65535",
            ));
        }
    };
    Ok(TrackerProxyConfig {
        host,
        port,
        kind: update.kind,
        username_secret: update.username_secret.as_deref().and_then(non_empty),
        password_secret: update.password_secret.as_deref().and_then(non_empty),
        proxy_peers: update.proxy_peers,
    })
}

/// Strict peer-class rule: bad definitions reject the update, while default
/// assignments to undefined classes are dropped with a warning.
pub(crate) fn normalize_peer_classes(
    update: PeerClassesUpdate,
) -> ConfigResult<PeerClassesConfig> {
    let mut classes = Vec::with_capacity(update.classes.len());
    let mut seen = HashSet::new();
    for class in update.classes {
        if class.id > MAX_PEER_CLASS_ID {
            return Err(invalid_field(
                "peer_classes.id",
                Some(class.id.to_string()),
                "peer class id must be at most 31",
            ));
        }
        let Some(label) = non_empty(&class.label) else {
            return Err(invalid_field(
                "peer_classes.label",
                None,
                "peer class label must not be empty",
            ));
        };
        if class.download_priority == 0 || class.upload_priority == 0 {
            return Err(invalid_field(
                "peer_classes.priority",
                Some(class.id.to_string()),
                "peer class priority must be between 1 and 255",
            ));
        }
        if class.connection_limit_factor == 0 {
            return Err(invalid_field(
                "peer_classes.connection_limit_factor",
                Some(class.id.to_string()),
                "connection limit factor must be at least 1",
            ));
        }
        if !seen.insert(class.id) {
            return Err(ConfigError::DuplicatePeerClass { class_id: class.id });
        }
        classes.push(PeerClassConfig { label, ..class });
    }
    classes.sort_by_key(|class| class.id);
    let mut default = Vec::new();
    for id in update.default {
        if !seen.contains(&id) {
            warn!(class_id = id, "dropping default assignment to undefined peer class");
            continue;
        }
        if !default.contains(&id) {
            default.push(id);
        }
    }
    default.sort_unstable();
    Ok(PeerClassesConfig { classes, default })
}

#[cfg(test)]
mod tests {
    use chrono::Weekday;

    use super::{
        AltSpeedScheduleUpdate, AltSpeedUpdate, EngineNetwork, MAX_RATE_LIMIT_BPS,
        PeerClassConfig, PeerClassesUpdate, TrackerProxyUpdate, TrackerUpdate, clamp_rate_limit,
        normalize_alt_speed, normalize_network, normalize_peer_classes, normalize_schedule,
        normalize_tracker,
    };
    use crate::error::ConfigError;

    fn class(id: u8, label: &str) -> PeerClassConfig {
        PeerClassConfig {
            id,
            label: label.to_owned(),
            download_priority: 1,
            upload_priority: 1,
            connection_limit_factor: 1,
            ignore_unchoke_slots: false,
        }
    }

    #[test]
    fn rate_limits_clamp_at_both_ends() {
        assert_eq!(clamp_rate_limit("f", None), None);
        assert_eq!(clamp_rate_limit("f", Some(-10)), None);
        assert_eq!(clamp_rate_limit("f", Some(0)), None);
        assert_eq!(clamp_rate_limit("f", Some(1024)), Some(1024));
        assert_eq!(
            clamp_rate_limit("f", Some(MAX_RATE_LIMIT_BPS + 1)),
            Some(MAX_RATE_LIMIT_BPS)
        );
    }

    #[test]
    fn schedules_canonicalize_days_and_keep_overnight_windows() {
        let update = AltSpeedScheduleUpdate {
            days: vec![
                "Wed".to_owned(),
                "mon".to_owned(),
                "Monday".to_owned(),
                String::new(),
            ],
            start: "07:30".to_owned(),
            end: "09:00".to_owned(),
        };
        let schedule = normalize_schedule(&update).unwrap();
        assert_eq!(schedule.days, vec![Weekday::Mon, Weekday::Wed]);
        assert_eq!(schedule.start_minutes, 450);
        assert_eq!(schedule.end_minutes, 540);

        let overnight = AltSpeedScheduleUpdate {
            days: vec!["fri".to_owned()],
            start: "23:30".to_owned(),
            end: "00:15".to_owned(),
        };
        let schedule = normalize_schedule(&overnight).unwrap();
        assert_eq!(schedule.start_minutes, 1410);
        assert_eq!(schedule.end_minutes, 15);
    }

    #[test]
    fn degenerate_schedules_are_rejected() {
        let base = AltSpeedScheduleUpdate {
            days: vec!["mon".to_owned()],
            start: "07:00".to_owned(),
            end: "07:00".to_owned(),
        };
        assert!(normalize_schedule(&base).is_none());

        let unknown_day = AltSpeedScheduleUpdate {
            days: vec!["mon".to_owned(), "noday".to_owned()],
            start: "07:00".to_owned(),
            end: "08:00".to_owned(),
        };
        assert!(normalize_schedule(&unknown_day).is_none());

        let no_days = AltSpeedScheduleUpdate {
            days: vec![String::new()],
            start: "07:00".to_owned(),
            end: "08:00".to_owned(),
        };
        assert!(normalize_schedule(&no_days).is_none());
    }

    #[test]
    fn malformed_schedule_clears_caps_too() {
        let update = AltSpeedUpdate {
            download_bps: Some(1_000_000),
            upload_bps: Some(500_000),
            schedule: Some(AltSpeedScheduleUpdate {
                days: vec!["mon".to_owned()],
                start: "25:00".to_owned(),
                end: "26:00".to_owned(),
            }),
        };
        let config = normalize_alt_speed(update);
        assert_eq!(config.download_bps, None);
        assert_eq!(config.upload_bps, None);
        assert!(config.schedule.is_none());
    }

    #[test]
    fn peer_classes_reject_duplicates_and_drop_dangling_defaults() {
        let update = PeerClassesUpdate {
            classes: vec![class(4, "vip"), class(1, "default")],
            default: vec![4, 7, 4, 1],
        };
        let config = normalize_peer_classes(update).unwrap();
        assert_eq!(config.classes[0].id, 1);
        assert_eq!(config.classes[1].id, 4);
        assert_eq!(config.default, vec![1, 4]);

        let duplicate = PeerClassesUpdate {
            classes: vec![class(2, "a"), class(2, "b")],
            default: Vec::new(),
        };
        assert!(matches!(
            normalize_peer_classes(duplicate),
            Err(ConfigError::DuplicatePeerClass { class_id: 2 })
        ));

        let out_of_range = PeerClassesUpdate {
            classes: vec![class(32, "wide")],
            default: Vec::new(),
        };
        assert!(normalize_peer_classes(out_of_range).is_err());
    }

    #[test]
    fn tracker_urls_over_the_limit_reject_the_update() {
        let long_url = format!("http://{}/announce", "t".repeat(520));
        let update = TrackerUpdate {
            extra_trackers: vec![long_url],
            ..TrackerUpdate::default()
        };
        assert!(normalize_tracker(update).is_err());
    }

    #[test]
    fn tracker_proxy_requires_host_and_port() {
        let missing_host = TrackerUpdate {
            proxy: Some(TrackerProxyUpdate {
                port: Some(8080),
                ..TrackerProxyUpdate::default()
            }),
            ..TrackerUpdate::default()
        };
        assert!(normalize_tracker(missing_host).is_err());

        let zero_port = TrackerUpdate {
            proxy: Some(TrackerProxyUpdate {
                host: Some("proxy.local".to_owned()),
                port: Some(0),
                ..TrackerProxyUpdate::default()
            }),
            ..TrackerUpdate::default()
        };
        assert!(normalize_tracker(zero_port).is_err());
    }

    #[test]
    fn tracker_auth_collapses_to_none_when_blank() {
        let update = TrackerUpdate {
            auth: Some(super::TrackerAuthUpdate {
                username_secret: Some("  ".to_owned()),
                password_secret: None,
                cookie_secret: None,
            }),
            ..TrackerUpdate::default()
        };
        let config = normalize_tracker(update).unwrap();
        assert!(config.auth.is_none());
    }

    #[test]
    fn network_validation_rejects_bad_ports_and_dscp() {
        let zero_port = EngineNetwork {
            listen_port: Some(0),
            ..EngineNetwork::default()
        };
        assert!(normalize_network(zero_port).is_err());

        let inverted = EngineNetwork {
            outgoing_port_min: Some(7000),
            outgoing_port_max: Some(6000),
            ..EngineNetwork::default()
        };
        assert!(normalize_network(inverted).is_err());

        let dscp = EngineNetwork {
            peer_dscp: Some(64),
            ..EngineNetwork::default()
        };
        assert!(normalize_network(dscp).is_err());

        let valid = EngineNetwork {
            listen_port: Some(6881),
            outgoing_port_min: Some(6000),
            outgoing_port_max: Some(7000),
            peer_dscp: Some(46),
            ..EngineNetwork::default()
        };
        assert!(normalize_network(valid).is_ok());
    }
}
