use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::core::config::io::ConfigError;
use crate::core::engine::{EngineOptions, DEFAULT_KEEP_ALIVE_SECS, DEFAULT_MAX_TOOL_ROUNDS};
use crate::core::state::DEFAULT_API_URL;

/// Contents of `config.toml`. Every field is optional; unset fields fall back
/// to built-in defaults through the accessors below.
#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq, Eq)]
pub struct Config {
    /// Base URL of the inference server, used to seed settings on first run.
    pub api_url: Option<String>,
    /// Consecutive tool rounds allowed per user turn.
    pub max_tool_rounds: Option<usize>,
    /// Seconds a model stays resident after `load`.
    pub keep_alive_secs: Option<u64>,
    /// Directory the file-search tool is confined to.
    pub tool_root: Option<PathBuf>,
    /// Durable store file. Defaults to `splat.json` in the data directory.
    pub store_path: Option<PathBuf>,
}

impl Config {
    pub fn api_url(&self) -> &str {
        self.api_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .unwrap_or(DEFAULT_API_URL)
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            max_tool_rounds: self.max_tool_rounds.unwrap_or(DEFAULT_MAX_TOOL_ROUNDS),
            keep_alive_secs: self.keep_alive_secs.unwrap_or(DEFAULT_KEEP_ALIVE_SECS),
        }
    }

    pub fn tool_root(&self) -> PathBuf {
        match &self.tool_root {
            Some(root) => root.clone(),
            None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Keys accepted by [`Config::set_key`] and [`Config::unset_key`].
    pub const KEYS: [&'static str; 5] = [
        "api-url",
        "max-tool-rounds",
        "keep-alive-secs",
        "tool-root",
        "store-path",
    ];

    pub fn set_key(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let value = value.trim();
        let invalid = || ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        };
        match key {
            "api-url" => {
                if value.is_empty() {
                    return Err(invalid());
                }
                self.api_url = Some(value.to_string());
            }
            "max-tool-rounds" => {
                self.max_tool_rounds = Some(value.parse().map_err(|_| invalid())?);
            }
            "keep-alive-secs" => {
                self.keep_alive_secs = Some(value.parse().map_err(|_| invalid())?);
            }
            "tool-root" => self.tool_root = Some(PathBuf::from(value)),
            "store-path" => self.store_path = Some(PathBuf::from(value)),
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    pub fn unset_key(&mut self, key: &str) -> Result<(), ConfigError> {
        match key {
            "api-url" => self.api_url = None,
            "max-tool-rounds" => self.max_tool_rounds = None,
            "keep-alive-secs" => self.keep_alive_secs = None,
            "tool-root" => self.tool_root = None,
            "store-path" => self.store_path = None,
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    pub fn print_all(&self) {
        let options = self.engine_options();
        println!("Current configuration:");
        println!("  api-url: {}", self.api_url());
        println!("  max-tool-rounds: {}", options.max_tool_rounds);
        println!("  keep-alive-secs: {}", options.keep_alive_secs);
        println!("  tool-root: {}", path_display(self.tool_root()));
        match &self.store_path {
            Some(path) => println!("  store-path: {}", path_display(path)),
            None => println!("  store-path: (default)"),
        }
    }
}

/// Render a path for humans, abbreviating the home directory to `~`.
pub fn path_display<P: AsRef<Path>>(path: P) -> String {
    let path = path.as_ref();

    #[cfg(unix)]
    {
        if let Some(home) = std::env::var_os("HOME") {
            let home_path = PathBuf::from(home);
            if let Ok(relative) = path.strip_prefix(&home_path) {
                return format!("~/{}", relative.display());
            }
        }
    }

    path.display().to_string()
}
