//! [`RelayConfig`] – persisted relay settings (TOML).
//!
//! Every field has a default, so a partial file (or none at all) is valid.
//! `ROVER_*` environment variables override file values; see
//! [`apply_env_overrides`].

use std::fs;
use std::path::Path;
use std::time::Duration;

use rover_transport::{BrokerConfig, DEFAULT_NAMESPACE, TopicScheme};
use rover_types::{BROADCAST_VEHICLE, QoS, VehicleId};
use serde::{Deserialize, Serialize};
use tracing::warn;
use zeroize::Zeroizing;

use crate::command::CommandPolicy;

#[derive(Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_broker_host")]
    pub broker_host: String,

    #[serde(default = "default_broker_port")]
    pub broker_port: u16,

    #[serde(default)]
    pub use_tls: bool,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,

    /// Stored as plain text; the file is written owner-only.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,

    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Shared topic namespace, e.g. `esp32car` → `esp32car/command`.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Give every vehicle its own namespace named after its id.
    #[serde(default)]
    pub per_vehicle_topics: bool,

    /// Vehicle targeted when the operator does not name one.
    #[serde(default = "default_vehicle")]
    pub default_vehicle: String,

    /// MQTT QoS level (0, 1 or 2) for commands and subscriptions.
    #[serde(default)]
    pub qos: u8,

    #[serde(default = "default_keep_alive_s")]
    pub keep_alive_s: u64,

    #[serde(default = "default_connect_timeout_s")]
    pub connect_timeout_s: u64,

    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    #[serde(default = "default_stale_threshold_s")]
    pub stale_threshold_s: u64,

    #[serde(default = "default_publish_timeout_s")]
    pub publish_timeout_s: u64,
}

impl std::fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConfig")
            .field("broker_host", &self.broker_host)
            .field("broker_port", &self.broker_port)
            .field("use_tls", &self.use_tls)
            .field("username", &self.username)
            .field(
                "password",
                if self.password.is_empty() { &"<not set>" } else { &"<redacted>" },
            )
            .field("client_id", &self.client_id)
            .field("namespace", &self.namespace)
            .field("per_vehicle_topics", &self.per_vehicle_topics)
            .field("default_vehicle", &self.default_vehicle)
            .field("qos", &self.qos)
            .field("keep_alive_s", &self.keep_alive_s)
            .field("connect_timeout_s", &self.connect_timeout_s)
            .field("debounce_ms", &self.debounce_ms)
            .field("stale_threshold_s", &self.stale_threshold_s)
            .field("publish_timeout_s", &self.publish_timeout_s)
            .finish()
    }
}

fn default_broker_host() -> String {
    "broker.hivemq.com".to_string()
}
fn default_broker_port() -> u16 {
    1883
}
fn default_client_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("rover-relay-{}", &suffix[..8])
}
fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}
fn default_vehicle() -> String {
    BROADCAST_VEHICLE.to_string()
}
fn default_keep_alive_s() -> u64 {
    60
}
fn default_connect_timeout_s() -> u64 {
    10
}
fn default_debounce_ms() -> u64 {
    200
}
fn default_stale_threshold_s() -> u64 {
    30
}
fn default_publish_timeout_s() -> u64 {
    5
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            broker_host: default_broker_host(),
            broker_port: default_broker_port(),
            use_tls: false,
            username: String::new(),
            password: String::new(),
            client_id: default_client_id(),
            namespace: default_namespace(),
            per_vehicle_topics: false,
            default_vehicle: default_vehicle(),
            qos: 0,
            keep_alive_s: default_keep_alive_s(),
            connect_timeout_s: default_connect_timeout_s(),
            debounce_ms: default_debounce_ms(),
            stale_threshold_s: default_stale_threshold_s(),
            publish_timeout_s: default_publish_timeout_s(),
        }
    }
}

impl RelayConfig {
    /// Numeric QoS mapped to [`QoS`]; unknown levels fall back to
    /// at-most-once.
    pub fn qos(&self) -> QoS {
        QoS::from_level(self.qos).unwrap_or_else(|| {
            warn!(level = self.qos, "Unknown QoS level; using 0");
            QoS::AtMostOnce
        })
    }

    /// Connection settings for the transport.  The password is moved into a
    /// buffer that is wiped on drop.
    pub fn broker(&self) -> BrokerConfig {
        BrokerConfig {
            host: self.broker_host.clone(),
            port: self.broker_port,
            use_tls: self.use_tls,
            username: (!self.username.is_empty()).then(|| self.username.clone()),
            password: (!self.password.is_empty()).then(|| Zeroizing::new(self.password.clone())),
            client_id: self.client_id.clone(),
            keep_alive: Duration::from_secs(self.keep_alive_s),
            connect_timeout: Duration::from_secs(self.connect_timeout_s),
            publish_timeout: self.publish_timeout(),
            subscribe_qos: self.qos(),
        }
    }

    pub fn topic_scheme(&self) -> TopicScheme {
        if self.per_vehicle_topics {
            TopicScheme::per_vehicle(self.namespace.clone())
        } else {
            TopicScheme::shared(self.namespace.clone())
        }
    }

    pub fn command_policy(&self) -> CommandPolicy {
        CommandPolicy {
            debounce: Duration::from_millis(self.debounce_ms),
            publish_timeout: self.publish_timeout(),
            qos: self.qos(),
        }
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_s)
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_threshold_s)
    }

    pub fn default_vehicle(&self) -> VehicleId {
        if self.default_vehicle.trim().is_empty() {
            VehicleId::broadcast()
        } else {
            VehicleId::new(self.default_vehicle.trim())
        }
    }
}

/// Load a config file as written on disk.  Returns `None` if the file does
/// not exist.
///
/// Environment overrides are not applied here, so the value can be edited
/// and saved back without persisting them; see [`apply_env_overrides`].
pub fn load_from(path: &Path) -> Result<Option<RelayConfig>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg: RelayConfig = toml::from_str(&raw)
        .map_err(|e| format!("Failed to parse config at {}: {}", path.display(), e))?;
    Ok(Some(cfg))
}

/// Apply `ROVER_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `ROVER_BROKER_HOST` | `broker_host` |
/// | `ROVER_BROKER_PORT` | `broker_port` |
/// | `ROVER_USE_TLS` | `use_tls` |
/// | `ROVER_USERNAME` | `username` |
/// | `ROVER_PASSWORD` | `password` |
/// | `ROVER_CLIENT_ID` | `client_id` |
/// | `ROVER_NAMESPACE` | `namespace` |
///
/// Values that do not parse are ignored.  The result is meant for the running
/// session only and should not be passed to [`save_to`].
pub fn apply_env_overrides(cfg: &mut RelayConfig) {
    apply_overrides_with(cfg, |key| std::env::var(key).ok());
}

/// [`apply_env_overrides`] with an explicit variable lookup.
pub fn apply_overrides_with(cfg: &mut RelayConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("ROVER_BROKER_HOST") {
        cfg.broker_host = v;
    }
    if let Some(v) = lookup("ROVER_BROKER_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.broker_port = port;
    }
    if let Some(v) = lookup("ROVER_USE_TLS")
        && let Some(flag) = parse_flag(&v)
    {
        cfg.use_tls = flag;
    }
    if let Some(v) = lookup("ROVER_USERNAME") {
        cfg.username = v;
    }
    if let Some(v) = lookup("ROVER_PASSWORD") {
        cfg.password = v;
    }
    if let Some(v) = lookup("ROVER_CLIENT_ID") {
        cfg.client_id = v;
    }
    if let Some(v) = lookup("ROVER_NAMESPACE") {
        cfg.namespace = v;
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Write `cfg` to `path`, creating the parent directory if necessary.
pub fn save_to(cfg: &RelayConfig, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn overrides(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = RelayConfig::default();
        assert_eq!(cfg.broker_host, "broker.hivemq.com");
        assert_eq!(cfg.broker_port, 1883);
        assert!(!cfg.use_tls);
        assert!(cfg.client_id.starts_with("rover-relay-"));
        assert_eq!(cfg.client_id.len(), "rover-relay-".len() + 8);
        assert_eq!(cfg.topic_scheme(), TopicScheme::default());
        assert_eq!(cfg.default_vehicle(), VehicleId::broadcast());
        let policy = cfg.command_policy();
        assert_eq!(policy.debounce, Duration::from_millis(200));
        assert_eq!(policy.publish_timeout, Duration::from_secs(5));
        assert_eq!(cfg.stale_threshold(), Duration::from_secs(30));
    }

    #[test]
    fn debug_redacts_password() {
        let cfg = RelayConfig {
            password: "hunter2".into(),
            ..RelayConfig::default()
        };
        let debug_str = format!("{:?}", cfg);
        assert!(!debug_str.contains("hunter2"));
        assert!(debug_str.contains("<redacted>"));
        assert!(!format!("{:?}", cfg.broker()).contains("hunter2"));
    }

    #[test]
    fn broker_settings_follow_config() {
        let cfg = RelayConfig {
            username: "operator".into(),
            password: "secret".into(),
            use_tls: true,
            broker_port: 8883,
            keep_alive_s: 30,
            qos: 1,
            ..RelayConfig::default()
        };
        let broker = cfg.broker();
        assert_eq!(broker.port, 8883);
        assert!(broker.use_tls);
        assert_eq!(broker.username.as_deref(), Some("operator"));
        assert_eq!(broker.password.as_deref().map(String::as_str), Some("secret"));
        assert_eq!(broker.keep_alive, Duration::from_secs(30));
        assert_eq!(broker.subscribe_qos, QoS::AtLeastOnce);

        let anonymous = RelayConfig::default().broker();
        assert!(anonymous.username.is_none());
        assert!(anonymous.password.is_none());
    }

    #[test]
    fn unknown_qos_level_falls_back_to_zero() {
        let cfg = RelayConfig {
            qos: 7,
            ..RelayConfig::default()
        };
        assert_eq!(cfg.qos(), QoS::AtMostOnce);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let cfg: RelayConfig = toml::from_str(
            r#"
            broker_host = "10.0.0.5"
            per_vehicle_topics = true
            "#,
        )
        .unwrap();
        assert_eq!(cfg.broker_host, "10.0.0.5");
        assert_eq!(cfg.broker_port, 1883);
        assert!(cfg.topic_scheme().is_per_vehicle());
        assert_eq!(cfg.debounce_ms, 200);
    }

    #[test]
    fn env_overrides_apply_and_ignore_garbage() {
        let mut cfg = RelayConfig::default();
        apply_overrides_with(
            &mut cfg,
            overrides(&[
                ("ROVER_BROKER_HOST", "mqtt.local"),
                ("ROVER_BROKER_PORT", "not-a-port"),
                ("ROVER_USE_TLS", "yes"),
                ("ROVER_NAMESPACE", "lab"),
                ("ROVER_CLIENT_ID", "console-7"),
            ]),
        );
        assert_eq!(cfg.broker_host, "mqtt.local");
        assert_eq!(cfg.broker_port, 1883);
        assert!(cfg.use_tls);
        assert_eq!(cfg.namespace, "lab");
        assert_eq!(cfg.client_id, "console-7");

        apply_overrides_with(
            &mut cfg,
            overrides(&[("ROVER_BROKER_PORT", "8883"), ("ROVER_USE_TLS", "maybe")]),
        );
        assert_eq!(cfg.broker_port, 8883);
        assert!(cfg.use_tls);
    }

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join(".rover-relay").join("config.toml");

        save_to(&RelayConfig::default(), &path).expect("save");

        let file_mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        let dir_mode = std::fs::metadata(path.parent().unwrap())
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, 0o700);
    }

    #[test]
    fn roundtrip_through_disk() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        let cfg = RelayConfig {
            broker_host: "broker.example".into(),
            username: "op".into(),
            debounce_ms: 250,
            ..RelayConfig::default()
        };
        save_to(&cfg, &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.broker_host, "broker.example");
        assert_eq!(loaded.username, "op");
        assert_eq!(loaded.debounce_ms, 250);
        assert_eq!(loaded.client_id, cfg.client_id);
    }

    #[test]
    fn overrides_stay_out_of_the_saved_file() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        let cfg = RelayConfig {
            password: "on-disk".into(),
            ..RelayConfig::default()
        };
        save_to(&cfg, &path).expect("save");

        let mut on_disk = load_from(&path).expect("load ok").expect("some");
        let mut running = on_disk.clone();
        apply_overrides_with(&mut running, overrides(&[("ROVER_PASSWORD", "env-secret")]));
        assert_eq!(running.password, "env-secret");
        assert_eq!(on_disk.password, "on-disk");

        on_disk.namespace = "lab".into();
        save_to(&on_disk, &path).expect("save");
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("env-secret"), "{raw}");
        assert!(raw.contains("on-disk"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        assert!(load_from(&dir.path().join("absent.toml")).unwrap().is_none());
    }

    #[test]
    fn unparsable_file_reports_path() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "broker_port = \"high\"").unwrap();
        let err = load_from(&path).unwrap_err();
        assert!(err.contains("config.toml"), "{err}");
    }
}
