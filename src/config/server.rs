// src/config/server.rs
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::pool::CollectionRef;

pub const DEFAULT_CONFIG_PATH: &str = "config/server.toml";
pub const ENV_CONFIG_PATH: &str = "STIM_CONFIG_PATH";
pub const ENV_MONGO_URI: &str = "MONGO_URI";
pub const ENV_PORT: &str = "PORT";
pub const ENV_STORE_BACKEND: &str = "STORE_BACKEND";

fn default_port() -> u16 {
    8883
}
fn default_static_dir() -> Option<PathBuf> {
    Some(PathBuf::from("public"))
}
fn default_uri() -> String {
    "mongodb://localhost:27017".to_string()
}
fn default_connect_retry_ms() -> u64 {
    2000
}
fn default_call_timeout_ms() -> u64 {
    5000
}
fn default_max_claim_attempts() -> u32 {
    8
}
fn default_read_retries() -> u32 {
    2
}
fn default_read_backoff_ms() -> u64 {
    100
}
fn default_batch_max_records() -> usize {
    500
}
fn default_session_db() -> String {
    "stimuli".to_string()
}
fn default_session_col() -> String {
    "photodraw2".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: HttpSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub assign: AssignConfig,
    #[serde(default)]
    pub session: SessionSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpSection {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Directory with the experiment's HTML/JS; `None` disables static serving.
    #[serde(default = "default_static_dir")]
    pub static_dir: Option<PathBuf>,
    #[serde(default)]
    pub metrics: bool,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            static_dir: default_static_dir(),
            metrics: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Mongo,
    Memory,
}

impl std::str::FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mongo" | "mongodb" => Ok(Self::Mongo),
            "memory" => Ok(Self::Memory),
            other => bail!("unsupported store backend: {other}"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default = "default_uri")]
    pub uri: String,
    #[serde(default = "default_connect_retry_ms")]
    pub connect_retry_ms: u64,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Pools to preload into the memory backend.
    #[serde(default)]
    pub seed_path: Option<PathBuf>,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            uri: default_uri(),
            connect_retry_ms: default_connect_retry_ms(),
            call_timeout_ms: default_call_timeout_ms(),
            seed_path: None,
        }
    }
}

impl StoreSection {
    pub fn connect_retry(&self) -> Duration {
        Duration::from_millis(self.connect_retry_ms)
    }
}

/// How single-item requests record consumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssignMode {
    /// Conditional claim on the observed count; losers retry on the next candidate.
    #[default]
    Atomic,
    /// Read the least-served item, then mark it. Two racing requests can share an item.
    Legacy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssignConfig {
    #[serde(default)]
    pub mode: AssignMode,
    #[serde(default = "default_max_claim_attempts")]
    pub max_claim_attempts: u32,
    #[serde(default = "default_read_retries")]
    pub read_retries: u32,
    #[serde(default = "default_read_backoff_ms")]
    pub read_backoff_ms: u64,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    #[serde(default = "default_batch_max_records")]
    pub batch_max_records: usize,
    #[serde(default)]
    pub fallback_path: Option<PathBuf>,
}

impl Default for AssignConfig {
    fn default() -> Self {
        Self {
            mode: AssignMode::default(),
            max_claim_attempts: default_max_claim_attempts(),
            read_retries: default_read_retries(),
            read_backoff_ms: default_read_backoff_ms(),
            call_timeout_ms: default_call_timeout_ms(),
            batch_max_records: default_batch_max_records(),
            fallback_path: None,
        }
    }
}

impl AssignConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Back-off before read retry `attempt` (1-based): base, 2×base, 4×base … capped at 5 s.
    pub fn read_backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.read_backoff_ms.saturating_mul(factor).min(5_000))
    }
}

/// Pool the websocket `getStim` event draws from.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_session_db")]
    pub dbname: String,
    #[serde(default = "default_session_col")]
    pub colname: String,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            dbname: default_session_db(),
            colname: default_session_col(),
        }
    }
}

impl SessionSection {
    pub fn pool(&self) -> CollectionRef {
        CollectionRef::new(&self.dbname, &self.colname)
    }
}

impl ServerConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading server config from {}", path.display()))?;
        Self::parse(&data).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(s: &str) -> Result<Self> {
        let mut cfg: ServerConfig = toml::from_str(s)?;
        // One timeout governs every store call.
        cfg.assign.call_timeout_ms = cfg.store.call_timeout_ms;
        if cfg.assign.max_claim_attempts == 0 {
            cfg.assign.max_claim_attempts = 1;
        }
        if cfg.assign.batch_max_records == 0 {
            cfg.assign.batch_max_records = default_batch_max_records();
        }
        Ok(cfg)
    }

    /// Resolve config:
    /// 1) explicit path (CLI `--config`)
    /// 2) $STIM_CONFIG_PATH
    /// 3) config/server.toml if present, else built-in defaults
    ///
    /// then apply env overrides (`MONGO_URI`, `PORT`, `STORE_BACKEND`).
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut cfg = if let Some(p) = explicit {
            Self::load_from_file(p)?
        } else if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if !pb.exists() {
                bail!("{ENV_CONFIG_PATH} points to non-existent path {}", pb.display());
            }
            Self::load_from_file(&pb)?
        } else {
            let default_p = PathBuf::from(DEFAULT_CONFIG_PATH);
            if default_p.exists() {
                Self::load_from_file(&default_p)?
            } else {
                Self::parse("")?
            }
        };
        cfg.apply_env()?;
        Ok(cfg)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(uri) = std::env::var(ENV_MONGO_URI) {
            if !uri.trim().is_empty() {
                self.store.uri = uri;
            }
        }
        if let Ok(port) = std::env::var(ENV_PORT) {
            self.server.port = port
                .trim()
                .parse()
                .with_context(|| format!("{ENV_PORT} is not a port number: {port}"))?;
        }
        if let Ok(backend) = std::env::var(ENV_STORE_BACKEND) {
            self.store.backend = backend.parse()?;
        }
        Ok(())
    }
}
