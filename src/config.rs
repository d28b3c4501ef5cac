use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use std::fmt;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::crypt::KeyMaterial;

pub const DEFAULT_API_BASE: &str = "https://api.weixin.qq.com/cgi-bin";

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// App ID of the official account
    pub app_id: String,
    /// App secret used to fetch the access token
    pub app_secret: String,
    /// Token shared with the platform for signing requests
    pub token: String,
    /// If set, enables the encrypted mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding_aes_key: Option<String>,
    /// JSON file with the custom menu pushed on startup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub menu: Option<PathBuf>,
    /// Base URL of the platform REST API
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "ServerConfig::default_listen")]
    pub listen: SocketAddr,
    /// Path of the callback endpoint
    #[serde(default = "ServerConfig::default_path")]
    pub path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: Self::default_listen(),
            path: Self::default_path(),
        }
    }
}

impl ServerConfig {
    fn default_listen() -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], 4321))
    }

    fn default_path() -> String {
        "/wechat".to_owned()
    }
}

impl Config {
    /// Create new config in plaintext mode with default server settings.
    pub fn new(
        app_id: impl Into<String>,
        app_secret: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            app_id: app_id.into(),
            app_secret: app_secret.into(),
            token: token.into(),
            encoding_aes_key: None,
            menu: None,
            api_base: default_api_base(),
            server: Default::default(),
        }
    }

    /// Tries to load configuration from one of the default locations:
    ///
    /// 1. $XDG_CONFIG_HOME/wechat-callback/config.toml
    /// 2. $XDG_CONFIG_HOME/wechat-callback.toml
    /// 3. $HOME/.wechat-callback.toml
    ///
    /// If no config is found returns `None`.
    pub fn load_installed() -> anyhow::Result<Option<Self>> {
        installed_config().map(Self::load).transpose()
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let mut config: Self = toml::de::from_str(&content)
            .with_context(|| format!("invalid config file {}", path.display()))?;

        // relative menu paths are relative to the config file
        if let Some(menu) = config.menu.as_mut() {
            if menu.is_relative() {
                if let Some(parent) = path.parent() {
                    *menu = parent.join(&*menu);
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks the values which can't be expressed by the types.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.token.is_empty() {
            bail!("token must not be empty");
        }
        if self.app_id.is_empty() {
            bail!("app_id must not be empty");
        }
        if !self.server.path.starts_with('/') {
            bail!("server.path must start with '/': {}", self.server.path);
        }
        if let Some(key) = &self.encoding_aes_key {
            KeyMaterial::from_encoding_aes_key(key).context("invalid encoding_aes_key")?;
        }
        Ok(())
    }

    pub fn is_encrypted(&self) -> bool {
        self.encoding_aes_key.is_some()
    }

    /// Reads the menu JSON if a menu is configured.
    pub fn read_menu(&self) -> anyhow::Result<Option<String>> {
        let Some(path) = &self.menu else {
            return Ok(None);
        };
        let menu = fs::read_to_string(path)
            .with_context(|| format!("failed to read menu {}", path.display()))?;
        serde_json::from_str::<serde_json::Value>(&menu)
            .with_context(|| format!("menu {} is not valid JSON", path.display()))?;
        Ok(Some(menu))
    }

    #[cfg(test)]
    fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let content = toml::ser::to_string(self)?;
        let parent_dir = path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("invalid config path {}: no parent dir", path.display()))?;
        fs::create_dir_all(parent_dir)?;
        fs::write(path, content)?;
        Ok(())
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("app_id", &self.app_id)
            .field("app_secret", &"<redacted>")
            .field("token", &"<redacted>")
            .field(
                "encoding_aes_key",
                &self.encoding_aes_key.as_ref().map(|_| "<redacted>"),
            )
            .field("menu", &self.menu)
            .field("api_base", &self.api_base)
            .field("server", &self.server)
            .finish()
    }
}

/// Get the location of the first found default config file paths
/// according to the following order:
///
/// 1. $XDG_CONFIG_HOME/wechat-callback/config.toml
/// 2. $XDG_CONFIG_HOME/wechat-callback.toml
/// 3. $HOME/.wechat-callback.toml
fn installed_config() -> Option<PathBuf> {
    let config_dir = dirs::config_dir()?;
    let config_file = config_dir.join("wechat-callback/config.toml");
    if config_file.exists() {
        return Some(config_file);
    }

    let config_file = config_dir.join("wechat-callback.toml");
    if config_file.exists() {
        return Some(config_file);
    }

    let home_dir = dirs::home_dir()?;
    let config_file = home_dir.join(".wechat-callback.toml");
    if config_file.exists() {
        return Some(config_file);
    }

    None
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_owned()
}
