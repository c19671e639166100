//! Configuration: serde schema plus a JSON file store

mod schema;
mod store;

pub use schema::*;
pub use store::{ConfigChange, ConfigStore};

use std::path::PathBuf;

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "PEERCAM_CONFIG";

/// Config file path: `$PEERCAM_CONFIG`, else `<config dir>/peercam/config.json`
pub fn default_config_path() -> PathBuf {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
        .unwrap_or_else(std::env::temp_dir);
    base.join("peercam").join("config.json")
}
