//! Read `$XDG_CONFIG_HOME/<app>/config.toml` into its raw tables.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::settings::RawSettings;
use crate::LoadError;

fn config_path(app_name: &str) -> Result<Option<PathBuf>, LoadError> {
    // XDG_CONFIG_HOME takes precedence so tests and containers can redirect it.
    let config_dir = match std::env::var_os("XDG_CONFIG_HOME") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => dirs::config_dir()
            .ok_or_else(|| LoadError::ConfigPath("no config directory for this platform".into()))?,
    };
    let path = config_dir.join(app_name).join("config.toml");
    if path.exists() {
        Ok(Some(path))
    } else {
        Ok(None)
    }
}

/// Raw contents of `config.toml`. Missing file yields all-default tables.
#[derive(serde::Deserialize, Default)]
pub struct ConfigFile {
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(flatten)]
    pub settings: RawSettings,
}

pub fn load(app_name: &str) -> Result<ConfigFile, LoadError> {
    let path = match config_path(app_name)? {
        Some(p) => p,
        None => return Ok(ConfigFile::default()),
    };
    let content = std::fs::read_to_string(&path).map_err(LoadError::ConfigRead)?;
    let file: ConfigFile = toml::from_str(&content)?;
    Ok(file)
}
