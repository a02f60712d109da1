use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::debug;
use qwen_client::ClientConfig;

use crate::token_store::data_dir;

const CONFIG_FILE: &str = "config.toml";

pub fn default_config_path() -> PathBuf {
    data_dir().join(CONFIG_FILE)
}

/// Config file (if present) under process environment overrides.
pub fn load_config(path: &Path) -> Result<ClientConfig> {
    let mut config = read_config_file(path)?;
    config.apply_env_overrides(|key| std::env::var(key).ok());
    Ok(config)
}

fn read_config_file(path: &Path) -> Result<ClientConfig> {
    if !path.exists() {
        debug!("No config file at {}, using defaults", path.display());
        return Ok(ClientConfig::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("Invalid config file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use qwen_client::config::{ProfileKind, DEFAULT_API_BASE};
    use tempfile::tempdir;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempdir().expect("tempdir");
        let config = read_config_file(&dir.path().join("absent.toml")).expect("defaults");
        assert_eq!(config.api_base, DEFAULT_API_BASE);
        assert_eq!(config.profile, ProfileKind::Portal);
    }

    #[test]
    fn partial_file_overrides_only_named_keys() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "profile = \"web_chat\"\nmodel = \"qwen3-max\"\nmax_poll_attempts = 90\n",
        )
        .expect("write");

        let config = read_config_file(&path).expect("parse");
        assert_eq!(config.profile, ProfileKind::WebChat);
        assert_eq!(config.model.as_deref(), Some("qwen3-max"));
        assert_eq!(config.max_poll_attempts, Some(90));
        assert_eq!(config.api_base, DEFAULT_API_BASE);
        assert!(!config.legacy_duplicate_first_chunk);
    }

    #[test]
    fn web_cookie_extras_table() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "profile = \"web_chat\"\n\n[web_cookie_extras]\ncna = \"xyz\"\nssxmod_itna = \"abc\"\n",
        )
        .expect("write");

        let config = read_config_file(&path).expect("parse");
        let extras: Vec<(&str, &str)> = config
            .web_cookie_extras
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        assert_eq!(extras, vec![("cna", "xyz"), ("ssxmod_itna", "abc")]);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "profile = [").expect("write");
        assert!(read_config_file(&path).is_err());
    }
}
