//! Configuration Vault – reads/writes `~/.rover-relay/config.toml`.

use std::path::PathBuf;

use rover_relay::RelayConfig;
use rover_relay::config::{apply_overrides_with, load_from, save_to};

/// Return the path to `~/.rover-relay/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".rover-relay").join("config.toml")
}

/// Load the config file as written.  Returns `None` if the file does not
/// exist.  `ROVER_*` overrides are not applied; use [`effective`] for that.
pub fn load() -> Result<Option<RelayConfig>, String> {
    load_from(&config_path())
}

/// The config a session runs with: `file` plus `ROVER_*` overrides.
/// Never save the result.
pub fn effective(file: RelayConfig) -> RelayConfig {
    effective_with(file, |key| std::env::var(key).ok())
}

fn effective_with(mut cfg: RelayConfig, lookup: impl Fn(&str) -> Option<String>) -> RelayConfig {
    apply_overrides_with(&mut cfg, lookup);
    cfg
}

/// Save the config, creating `~/.rover-relay/` if necessary.
pub fn save(cfg: &RelayConfig) -> Result<(), String> {
    save_to(cfg, &config_path())
}
