// src/config.rs
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::error::{Error, Result};

pub const ENV_KEYS: &str = "AMIIBO_KEYS";
pub const ENV_IMAGE_DIR: &str = "AMIIBO_DIR";
pub const ENV_BIND: &str = "AMIIBO_BIND";

const DEFAULT_KEYS: &str = "key_retail.bin";
const DEFAULT_IMAGE_DIR: &str = "amiibos";
const DEFAULT_BIND: ([u8; 4], u16) = ([127, 0, 0, 1], 3500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Retail key blob, loaded once at startup.
    pub keys_path: PathBuf,
    /// Directory holding the 540-byte dumps offered for writing.
    pub image_dir: PathBuf,
    /// WebSocket listen address.
    pub bind_addr: SocketAddr,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            keys_path: PathBuf::from(DEFAULT_KEYS),
            image_dir: PathBuf::from(DEFAULT_IMAGE_DIR),
            bind_addr: SocketAddr::from(DEFAULT_BIND),
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from `lookup`, falling back to defaults for unset or
    /// empty variables.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(path) = get(ENV_KEYS) {
            config.keys_path = PathBuf::from(path);
        }
        if let Some(dir) = get(ENV_IMAGE_DIR) {
            config.image_dir = PathBuf::from(dir);
        }
        if let Some(addr) = get(ENV_BIND) {
            config.bind_addr = addr
                .trim()
                .parse()
                .map_err(|e| Error::Config(format!("{ENV_BIND}={addr:?}: {e}")))?;
        }
        Ok(config)
    }
}
