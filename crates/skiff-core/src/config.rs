//! Client configuration, stored as JSON in the platform user-config
//! directory. Environment variables take precedence over file values.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SkiffError};

const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub server_url: String,
    /// Optional: the server only requires a token for uploads and deletes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// The skiff user-config directory, created on first use.
pub fn config_dir() -> Result<PathBuf> {
    let base = dirs::config_dir()
        .ok_or_else(|| SkiffError::Config("no user configuration directory".into()))?;
    let dir = base.join("skiff");
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

pub fn load_client() -> Result<ClientConfig> {
    let mut cfg = load_client_from(&config_dir()?)?;
    if let Ok(url) = std::env::var("SKIFF_SERVER_URL") {
        if !url.is_empty() {
            cfg.server_url = url;
        }
    }
    if let Ok(token) = std::env::var("SKIFF_TOKEN") {
        if !token.is_empty() {
            cfg.token = Some(token);
        }
    }
    Ok(cfg)
}

pub fn save_client(cfg: &ClientConfig) -> Result<()> {
    save_client_to(&config_dir()?, cfg)
}

pub(crate) fn load_client_from(dir: &Path) -> Result<ClientConfig> {
    let path = dir.join(CONFIG_FILE);
    let data = match std::fs::read(&path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(ClientConfig::default())
        }
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&data)
        .map_err(|e| SkiffError::Config(format!("{}: {e}", path.display())))
}

pub(crate) fn save_client_to(dir: &Path, cfg: &ClientConfig) -> Result<()> {
    let path = dir.join(CONFIG_FILE);
    let data = serde_json::to_vec_pretty(cfg)?;
    std::fs::write(&path, data)?;
    restrict_permissions(&path)?;
    Ok(())
}

/// Config files carry the token; keep them private to the owner.
fn restrict_permissions(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}
