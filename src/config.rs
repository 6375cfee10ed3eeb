//! Persisted configuration: schema, defaults and the atomic JSON store
//!
//! The on-disk file is the single source of truth. Every mutation goes through
//! [`ConfigStore::update`], a full read-modify-write that lands through a
//! temp-file rename, so a crash mid-write leaves either the old or the new
//! document and never a torn one.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ConfigError;

pub const DEFAULT_ROUTE: &str = "/__select__";
pub const DEFAULT_AUTH_PORT: u16 = 7997;
pub const DEFAULT_AUTH_URL: &str = "/api/auth/verify";
pub const DEFAULT_LOGIN_URL: &str = "/login";
pub const DEFAULT_LOGOUT_URL: &str = "/api/auth/logout";
pub const DEFAULT_CACHE_EXPIRE_SECS: u64 = 60;

/// A path-prefix to backend mapping with behaviour flags
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Path prefix to match, e.g. "/api"
    pub path: String,
    /// Backend URL, e.g. "http://127.0.0.1:8080"
    pub target: String,
    /// Gate this rule behind the global auth check
    #[serde(default)]
    pub use_auth: bool,
    /// Remove the path prefix before forwarding
    #[serde(default)]
    pub strip_path: bool,
    /// Rewrite absolute links in HTML responses to carry the prefix
    #[serde(default)]
    pub rewrite_html: bool,
    /// Present the backend as root-mounted via the affinity cookie
    #[serde(default)]
    pub use_root_mode: bool,
}

impl Rule {
    pub fn new(path: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            target: target.into(),
            use_auth: false,
            strip_path: false,
            rewrite_html: false,
            use_root_mode: false,
        }
    }
}

/// Global authentication settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AuthConfig {
    /// Loopback port of the auth service
    pub auth_port: u16,
    /// Verification path on the auth service
    pub auth_url: String,
    /// Login page, relative to the auth service or absolute
    pub login_url: String,
    /// Logout path on the auth service
    pub logout_url: String,
    /// Positive-result cache lifetime in seconds
    pub cache_expire: u64,
}

impl AuthConfig {
    /// Back-fill every zero-valued field with its default
    pub fn with_defaults(mut self) -> Self {
        if self.auth_port == 0 {
            self.auth_port = DEFAULT_AUTH_PORT;
        }
        if self.auth_url.is_empty() {
            self.auth_url = DEFAULT_AUTH_URL.to_string();
        }
        if self.login_url.is_empty() {
            self.login_url = DEFAULT_LOGIN_URL.to_string();
        }
        if self.logout_url.is_empty() {
            self.logout_url = DEFAULT_LOGOUT_URL.to_string();
        }
        if self.cache_expire == 0 {
            self.cache_expire = DEFAULT_CACHE_EXPIRE_SECS;
        }
        self
    }
}

/// The persisted document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub rules: Vec<Rule>,
    pub default_route: String,
    pub auth_config: AuthConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_cert: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_key: Option<String>,
    #[serde(alias = "iptables_chain_name", skip_serializing_if = "Option::is_none")]
    pub chain_name: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            default_route: DEFAULT_ROUTE.to_string(),
            auth_config: AuthConfig::default().with_defaults(),
            ssl_cert: None,
            ssl_key: None,
            chain_name: None,
        }
    }
}

impl AppConfig {
    /// Back-fill missing or zero sub-fields
    pub fn apply_defaults(&mut self) {
        if self.default_route.is_empty() {
            self.default_route = DEFAULT_ROUTE.to_string();
        }
        self.auth_config = std::mem::take(&mut self.auth_config).with_defaults();
        if self.ssl_cert.as_deref() == Some("") {
            self.ssl_cert = None;
        }
        if self.ssl_key.as_deref() == Some("") {
            self.ssl_key = None;
        }
        if self.chain_name.as_deref() == Some("") {
            self.chain_name = None;
        }
    }

    /// Certificate and key PEM, only when both are present
    pub fn cert_pair(&self) -> Option<(&str, &str)> {
        match (self.ssl_cert.as_deref(), self.ssl_key.as_deref()) {
            (Some(cert), Some(key)) => Some((cert, key)),
            _ => None,
        }
    }
}

/// Atomic load/save of [`AppConfig`]
pub struct ConfigStore {
    path: PathBuf,
    /// Serialises read-modify-write cycles
    lock: Mutex<()>,
}

impl ConfigStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the document; a missing file yields compiled defaults
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let _guard = self.lock.lock();
        self.load_unlocked()
    }

    /// Replace the whole document
    pub fn save(&self, config: &AppConfig) -> Result<(), ConfigError> {
        let _guard = self.lock.lock();
        let mut config = config.clone();
        config.apply_defaults();
        self.save_unlocked(&config)
    }

    /// Read the current document, apply `f`, write the result back
    pub fn update<F>(&self, f: F) -> Result<AppConfig, ConfigError>
    where
        F: FnOnce(&mut AppConfig),
    {
        let _guard = self.lock.lock();
        let mut config = self.load_unlocked()?;
        f(&mut config);
        config.apply_defaults();
        self.save_unlocked(&config)?;
        Ok(config)
    }

    fn load_unlocked(&self) -> Result<AppConfig, ConfigError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Config file {:?} not found, using defaults", self.path);
                return Ok(AppConfig::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: self.path.display().to_string(),
                    source,
                })
            }
        };

        let mut config: AppConfig =
            serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
                path: self.path.display().to_string(),
                source,
            })?;
        config.apply_defaults();
        Ok(config)
    }

    fn save_unlocked(&self, config: &AppConfig) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: self.path.display().to_string(),
            source,
        };

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(io_err)?;
        }

        let data = serde_json::to_vec_pretty(config).map_err(ConfigError::Serialize)?;

        let tmp_path = self.temp_path();
        {
            let mut file: File = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)
                .map_err(io_err)?;
            file.write_all(&data).map_err(io_err)?;
            file.sync_all().map_err(io_err)?;
        }
        fs::rename(&tmp_path, &self.path).map_err(io_err)?;

        debug!("Configuration written to {:?}", self.path);
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "config.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

/// Load the persisted configuration at startup, logging where it came from
pub fn load_startup_config(store: &ConfigStore) -> Result<AppConfig, ConfigError> {
    let existed = store.path().exists();
    let config = store.load()?;
    if existed {
        info!("Configuration loaded from {:?}", store.path());
    } else {
        info!("No configuration at {:?}, starting from defaults", store.path());
    }
    Ok(config)
}
