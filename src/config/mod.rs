//! Configuration storage: server endpoints and the user identity, kept as a
//! TOML file in the platform config directory.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Websocket endpoint of the signaling server, including the path.
    pub signaling_url: String,
    /// Backend API base (TURN credentials live under it).
    pub api_base_url: String,
    /// Upload service base for presigned chunk slots.
    pub upload_base_url: String,
    /// Web app base, only used to print invite links.
    pub app_base_url: String,
    /// Default account identity for `join` when `--user-id` is absent.
    pub user_id: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            signaling_url: "ws://127.0.0.1:8080/ws".to_string(),
            api_base_url: "http://127.0.0.1:8080/api/v1".to_string(),
            upload_base_url: "http://127.0.0.1:8081".to_string(),
            app_base_url: "http://127.0.0.1:3000".to_string(),
            user_id: None,
        }
    }
}

impl Config {
    fn config_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "studio-cli", "studio-cli")
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from disk, falling back to defaults when no file
    /// exists yet.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        toml::from_str(&content).context("Failed to parse config file")
    }

    /// Save configuration to disk.
    pub fn save(&self) -> Result<()> {
        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir).context("Failed to create config directory")?;

        let path = Self::config_path()?;
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&path, content).context("Failed to write config file")?;

        // Keep the file private; it may name internal endpoints.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(&path, perms).context("Failed to set config permissions")?;
        }

        Ok(())
    }
}
