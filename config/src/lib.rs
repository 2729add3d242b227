//! Load configuration from `~/.config/slate/config.toml` and project `.env`, then
//! apply the `[env]` table to the process environment with priority:
//! **existing env > .env > config.toml**.
//!
//! Beyond plain environment keys, the config file carries typed [`Settings`]
//! for the runtime: registry roots, uploads/artifact directories, MCP call
//! policy defaults, and manager loop limits. `Settings` resolution applies the
//! same precedence (environment variables named `SLATE_*` win over the file).

mod dotenv;
mod settings;
mod toml_file;

use std::path::Path;
use thiserror::Error;

pub use settings::{ManagerDefaults, McpDefaults, Paths, Settings};

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("config path: {0}")]
    ConfigPath(String),
    #[error("read config.toml: {0}")]
    ConfigRead(std::io::Error),
    #[error("parse config.toml: {0}")]
    ConfigParse(#[from] toml::de::Error),
    #[error("read .env: {0}")]
    DotenvRead(std::io::Error),
}

/// Loads `[env]` entries from `~/.config/slate/config.toml` and an optional
/// project `.env`, then sets environment variables only for keys that are
/// **not** already set (so existing env has highest priority).
///
/// Order of precedence when a key is missing in the process environment:
/// 1. Value from project `.env` (current directory, or `override_dir` if given)
/// 2. Value from the config file `[env]` table
pub fn load_and_apply(app_name: &str, override_dir: Option<&Path>) -> Result<(), LoadError> {
    let file = toml_file::load(app_name)?;
    let dotenv_map = dotenv::load_env_map(override_dir).map_err(LoadError::DotenvRead)?;

    let mut keys: std::collections::HashSet<String> = file.env.keys().cloned().collect();
    keys.extend(dotenv_map.keys().cloned());

    for key in keys {
        if std::env::var(&key).is_ok() {
            continue; // existing env wins
        }
        let value = dotenv_map.get(&key).or_else(|| file.env.get(&key)).cloned();
        if let Some(v) = value {
            std::env::set_var(&key, v);
        }
    }

    Ok(())
}

/// Loads typed [`Settings`] for the given app, layering `SLATE_*` environment
/// variables over the config file and falling back to built-in defaults.
pub fn load_settings(app_name: &str) -> Result<Settings, LoadError> {
    let file = toml_file::load(app_name)?;
    Ok(Settings::resolve(file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn restore_var(key: &str, prev: Option<String>) {
        match prev {
            Some(v) => env::set_var(key, v),
            None => env::remove_var(key),
        }
    }

    #[test]
    fn existing_env_wins_over_file_sources() {
        env::set_var("SLATE_CONFIG_TEST_EXISTING", "from_env");
        let _ = load_and_apply("slate", None);
        assert_eq!(
            env::var("SLATE_CONFIG_TEST_EXISTING").as_deref(),
            Ok("from_env")
        );
        env::remove_var("SLATE_CONFIG_TEST_EXISTING");
    }

    #[test]
    fn load_and_apply_without_any_config_is_ok() {
        let r = load_and_apply("slate-nonexistent-app-xyz", None::<&std::path::Path>);
        assert!(r.is_ok());
    }

    #[test]
    fn dotenv_overrides_config_file() {
        let cfg_dir = tempfile::tempdir().unwrap();
        let app_dir = cfg_dir.path().join("slate");
        std::fs::create_dir_all(&app_dir).unwrap();
        std::fs::write(
            app_dir.join("config.toml"),
            "[env]\nSLATE_CONFIG_TEST_PRIORITY = \"from_file\"\n",
        )
        .unwrap();

        let dotenv_dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dotenv_dir.path().join(".env"),
            "SLATE_CONFIG_TEST_PRIORITY=from_dotenv\n",
        )
        .unwrap();

        let prev = env::var("XDG_CONFIG_HOME").ok();
        env::set_var("XDG_CONFIG_HOME", cfg_dir.path());
        env::remove_var("SLATE_CONFIG_TEST_PRIORITY");

        let _ = load_and_apply("slate", Some(dotenv_dir.path()));
        let val = env::var("SLATE_CONFIG_TEST_PRIORITY").unwrap();
        env::remove_var("SLATE_CONFIG_TEST_PRIORITY");
        restore_var("XDG_CONFIG_HOME", prev);

        assert_eq!(val, "from_dotenv");
    }

    #[test]
    fn file_env_applied_when_no_dotenv() {
        let cfg_dir = tempfile::tempdir().unwrap();
        let app_dir = cfg_dir.path().join("slate");
        std::fs::create_dir_all(&app_dir).unwrap();
        std::fs::write(
            app_dir.join("config.toml"),
            "[env]\nSLATE_CONFIG_TEST_FILE_ONLY = \"from_file\"\n",
        )
        .unwrap();

        let empty_dir = tempfile::tempdir().unwrap();

        let prev = env::var("XDG_CONFIG_HOME").ok();
        env::set_var("XDG_CONFIG_HOME", cfg_dir.path());
        env::remove_var("SLATE_CONFIG_TEST_FILE_ONLY");

        let _ = load_and_apply("slate", Some(empty_dir.path()));
        let val = env::var("SLATE_CONFIG_TEST_FILE_ONLY").unwrap();
        env::remove_var("SLATE_CONFIG_TEST_FILE_ONLY");
        restore_var("XDG_CONFIG_HOME", prev);

        assert_eq!(val, "from_file");
    }

    #[test]
    fn invalid_toml_fails_with_parse_error() {
        let cfg_dir = tempfile::tempdir().unwrap();
        let app_dir = cfg_dir.path().join("slate");
        std::fs::create_dir_all(&app_dir).unwrap();
        std::fs::write(app_dir.join("config.toml"), "broken [[[\n").unwrap();

        let prev = env::var("XDG_CONFIG_HOME").ok();
        env::set_var("XDG_CONFIG_HOME", cfg_dir.path());

        let result = load_and_apply("slate", None::<&std::path::Path>);
        restore_var("XDG_CONFIG_HOME", prev);

        assert!(matches!(result, Err(LoadError::ConfigParse(_))));
    }
}
