//! Proxy configuration.
//!
//! Read from `starmer.ini` in the per-user configuration directory, or from
//! the path in `STARMER_CONFIG`. A missing file is created with defaults.
//!
//! ```text
//! listenaddr = :1337
//! toraddr    = localhost:9050
//! patt       = (imgur|sci-?hub|\.onion$)
//! ```

use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use directories::BaseDirs;
use regex::bytes::Regex;
use starmer_ini::{Ini, IniError};
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};

/// Config file name inside the per-user configuration directory.
pub const CONFIG_FILE: &str = "starmer.ini";

/// Environment variable overriding the config file path.
pub const CONFIG_PATH_ENV: &str = "STARMER_CONFIG";

/// Written when no config file exists yet.
pub const DEFAULT_CONFIG: &str = r"listenaddr = :1337
toraddr    = localhost:9050
patt       = (imgur|sci-?hub|\.onion$)
";

/// Keys read from the global section.
pub const KEY_LISTEN: &str = "listenaddr";
pub const KEY_RELAY: &str = "toraddr";
pub const KEY_PATTERN: &str = "patt";

/// Configuration errors. All of them are fatal to the service.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not determine config directory")]
    NoConfigDir,

    #[error("failed to write default config {path}: {source}")]
    WriteDefault {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: IniError,
    },

    #[error("invalid pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("failed to stat {path}: {source}")]
    Stat {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Live proxy configuration. Never mutated; a reload builds a new one.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address as written, e.g. `:1337` or `127.0.0.1:1080`.
    pub listen_addr: String,
    /// SOCKS5 relay, e.g. `localhost:9050`.
    pub relay_addr: String,
    /// Destinations matching this go through the relay.
    pub pattern: Regex,
    /// Modification time of the file this was loaded from.
    pub modified: SystemTime,
}

impl Config {
    /// Addresses to try binding, in order.
    pub fn bind_addrs(&self) -> Vec<String> {
        bind_addrs(&self.listen_addr)
    }

    /// Whether two configs behave the same, regardless of when they were loaded.
    pub fn same_settings(&self, other: &Config) -> bool {
        self.listen_addr == other.listen_addr
            && self.relay_addr == other.relay_addr
            && self.pattern.as_str() == other.pattern.as_str()
    }
}

/// Candidate bind addresses for a listen address.
///
/// An empty host (`:1337`) means every interface: the IPv6 wildcard first,
/// which also takes IPv4 connections unless the host sets `IPV6_V6ONLY`,
/// then the IPv4 wildcard for hosts without IPv6.
pub fn bind_addrs(listen_addr: &str) -> Vec<String> {
    if listen_addr.starts_with(':') {
        vec![format!("[::]{listen_addr}"), format!("0.0.0.0{listen_addr}")]
    } else {
        vec![listen_addr.to_string()]
    }
}

/// Where the configuration lives, and how to read it.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    path: PathBuf,
}

impl ConfigSource {
    /// Use the file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `STARMER_CONFIG` if set, else `starmer.ini` in the user config directory.
    pub fn locate() -> Result<Self, ConfigError> {
        if let Some(path) = std::env::var_os(CONFIG_PATH_ENV) {
            return Ok(Self::new(path));
        }

        let dirs = BaseDirs::new().ok_or(ConfigError::NoConfigDir)?;
        Ok(Self::new(dirs.config_dir().join(CONFIG_FILE)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load and validate the configuration, creating the default file first
    /// if there is none.
    pub async fn load(&self) -> Result<Config, ConfigError> {
        info!(path = %self.path.display(), "Reading config");

        match fs::metadata(&self.path).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => self.write_default().await?,
            Err(source) => {
                return Err(ConfigError::Stat {
                    path: self.path.clone(),
                    source,
                })
            }
        }

        // Stat before reading so a write racing the load is seen as a change.
        let modified = self.modified().await?;

        let text = fs::read_to_string(&self.path)
            .await
            .map_err(|source| ConfigError::Read {
                path: self.path.clone(),
                source,
            })?;

        let ini = Ini::parse(&text).map_err(|source| ConfigError::Parse {
            path: self.path.clone(),
            source,
        })?;

        for key in [KEY_LISTEN, KEY_RELAY, KEY_PATTERN] {
            if ini.value(key).is_empty() {
                warn!(key, "Missing config value");
            }
        }

        let pattern_src = ini.value(KEY_PATTERN);
        let pattern = Regex::new(pattern_src).map_err(|source| ConfigError::Pattern {
            pattern: pattern_src.to_string(),
            source,
        })?;

        Ok(Config {
            listen_addr: ini.value(KEY_LISTEN).to_string(),
            relay_addr: ini.value(KEY_RELAY).to_string(),
            pattern,
            modified,
        })
    }

    /// Current modification time of the config file.
    pub async fn modified(&self) -> Result<SystemTime, ConfigError> {
        fs::metadata(&self.path)
            .await
            .and_then(|meta| meta.modified())
            .map_err(|source| ConfigError::Stat {
                path: self.path.clone(),
                source,
            })
    }

    async fn write_default(&self) -> Result<(), ConfigError> {
        info!(path = %self.path.display(), "Creating default config");

        let write = async {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::write(&self.path, DEFAULT_CONFIG).await
        };

        write.await.map_err(|source| ConfigError::WriteDefault {
            path: self.path.clone(),
            source,
        })
    }
}
