use anyhow::{Context, Result};
use cloudstash_engine::StorageSettings;
use serde::Deserialize;
use std::path::Path;

/// Layout of the `--config` TOML file.
///
/// ```toml
/// log_level = "debug"
///
/// [storage]
/// provider = "oss"
/// region = "oss-cn-hangzhou"
/// bucket = "my-bucket"
/// access_key_id = "..."
/// access_key_secret = "..."
///
/// [storage.tuning]
/// parallelism = 8
/// ```
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub log_level: Option<String>,
    pub storage: StorageSettings,
}

impl CliConfig {
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("invalid configuration file")
    }

    /// Read `path` if given, otherwise take storage settings from the
    /// `STORAGE_*` environment variables.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let content = tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("failed to read {}", path.display()))?;
                Self::parse(&content)
            }
            None => Ok(Self {
                log_level: None,
                storage: StorageSettings::from_env(),
            }),
        }
    }
}

/// Parse `key=value` pairs given on the command line.
pub fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("expected key=value, got '{}'", raw)),
    }
}
