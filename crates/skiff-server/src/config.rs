//! Server configuration: JSON file in the user-config directory, with
//! `SKIFF_*` environment variables taking precedence over file values.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use skiff_core::error::{Result, SkiffError};

const CONFIG_FILE: &str = "server.json";

/// Days of manifest retention before pruning.
pub const DEFAULT_RETENTION_DAYS: i64 = 90;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bearer token required for uploads and deletes.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token: String,
    pub db_path: String,
    pub listen_addr: String,
    pub retention_days: i64,

    // S3-compatible object store for blocks at or above the inline threshold.
    #[serde(default)]
    pub s3_endpoint: String,
    #[serde(default)]
    pub s3_bucket: String,
    #[serde(default)]
    pub s3_access_key: String,
    #[serde(default)]
    pub s3_secret_key: String,
    #[serde(default = "default_region")]
    pub s3_region: String,

    /// Prometheus exporter port; 0 disables. Accepted for compatibility,
    /// no exporter is linked in this distribution.
    #[serde(default)]
    pub metrics_port: u16,
    /// Title shown by the web UI via `/api/config`.
    #[serde(default = "default_title")]
    pub ui_title: String,
    /// Directory of prebuilt client binaries served at `/cli/{os}/{arch}`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_dist_dir: String,
}

fn default_region() -> String {
    "us-east-1".into()
}

fn default_title() -> String {
    "skiff".into()
}

impl Default for ServerConfig {
    fn default() -> Self {
        let db_path = dirs::config_dir()
            .map(|d| d.join("skiff").join("skiff.db").to_string_lossy().into_owned())
            .unwrap_or_else(|| "skiff.db".into());
        Self {
            token: String::new(),
            db_path,
            listen_addr: ":8080".into(),
            retention_days: DEFAULT_RETENTION_DAYS,
            s3_endpoint: String::new(),
            s3_bucket: String::new(),
            s3_access_key: String::new(),
            s3_secret_key: String::new(),
            s3_region: default_region(),
            metrics_port: 0,
            ui_title: default_title(),
            client_dist_dir: String::new(),
        }
    }
}

impl ServerConfig {
    /// Startup validation: refusing to run without an object store bucket is
    /// a fatal configuration error, not a runtime surprise.
    pub fn validate(&self) -> Result<()> {
        if self.token.is_empty() {
            return Err(SkiffError::Config(
                "no token configured; run `skiff-server init` or set SKIFF_TOKEN".into(),
            ));
        }
        if self.s3_bucket.is_empty() {
            return Err(SkiffError::Config(
                "no S3 bucket configured; set s3_bucket or SKIFF_S3_BUCKET".into(),
            ));
        }
        Ok(())
    }
}

/// The skiff user-config directory, created on first use.
pub fn config_dir() -> Result<PathBuf> {
    let base = dirs::config_dir()
        .ok_or_else(|| SkiffError::Config("no user configuration directory".into()))?;
    let dir = base.join("skiff");
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

pub fn load() -> Result<ServerConfig> {
    let mut cfg = load_from(&config_dir()?)?;
    apply_env(&mut cfg);
    Ok(cfg)
}

pub fn save(cfg: &ServerConfig) -> Result<()> {
    save_to(&config_dir()?, cfg)
}

pub(crate) fn load_from(dir: &Path) -> Result<ServerConfig> {
    let path = dir.join(CONFIG_FILE);
    let data = match std::fs::read(&path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(ServerConfig::default())
        }
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&data)
        .map_err(|e| SkiffError::Config(format!("{}: {e}", path.display())))
}

pub(crate) fn save_to(dir: &Path, cfg: &ServerConfig) -> Result<()> {
    let path = dir.join(CONFIG_FILE);
    let data = serde_json::to_vec_pretty(cfg)?;
    std::fs::write(&path, data)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

fn apply_env(cfg: &mut ServerConfig) {
    let mut set = |name: &str, slot: &mut String| {
        if let Ok(v) = std::env::var(name) {
            if !v.is_empty() {
                *slot = v;
            }
        }
    };
    set("SKIFF_TOKEN", &mut cfg.token);
    set("SKIFF_DB_PATH", &mut cfg.db_path);
    set("SKIFF_LISTEN_ADDR", &mut cfg.listen_addr);
    set("SKIFF_S3_ENDPOINT", &mut cfg.s3_endpoint);
    set("SKIFF_S3_BUCKET", &mut cfg.s3_bucket);
    set("SKIFF_S3_ACCESS_KEY", &mut cfg.s3_access_key);
    set("SKIFF_S3_SECRET_KEY", &mut cfg.s3_secret_key);
    set("SKIFF_S3_REGION", &mut cfg.s3_region);
    set("SKIFF_UI_TITLE", &mut cfg.ui_title);
    set("SKIFF_CLIENT_DIST_DIR", &mut cfg.client_dist_dir);

    if let Ok(v) = std::env::var("SKIFF_RETENTION_DAYS") {
        if let Ok(days) = v.parse() {
            cfg.retention_days = days;
        }
    }
    if let Ok(v) = std::env::var("SKIFF_METRICS_PORT") {
        if let Ok(port) = v.parse() {
            cfg.metrics_port = port;
        }
    }
}
