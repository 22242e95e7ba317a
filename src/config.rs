use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::rules::CacheRule;

#[derive(Debug, Deserialize, Default)]
pub struct Bootstrap {
    #[serde(default)]
    pub strict: bool,
    #[serde(default)]
    pub pidfile: Option<String>,
    #[serde(default)]
    pub logger: Logger,
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub upstream: Upstream,
    #[serde(default)]
    pub cache: Cache,
}

impl Bootstrap {
    pub fn validate(&self) -> Result<()> {
        if self.server.addr.trim().is_empty() {
            return Err(anyhow!("server.addr is required"));
        }
        if self.upstream.address.is_empty() {
            return Err(anyhow!("upstream.address must not be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct Logger {
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub max_size: u64,
    #[serde(default)]
    pub max_backups: u64,
}

#[derive(Debug, Deserialize, Default)]
pub struct Server {
    #[serde(default)]
    pub addr: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct Upstream {
    #[serde(default)]
    pub address: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct Cache {
    /// Response header stamped with the cache status; empty disables it.
    #[serde(default)]
    pub status_header: String,
    #[serde(default = "default_max_age", with = "humantime_serde")]
    pub default_max_age: Duration,
    #[serde(default = "default_lock_timeout", with = "humantime_serde")]
    pub lock_timeout: Duration,
    /// Directory for file-backed body storage; empty keeps bodies in memory.
    #[serde(default)]
    pub path: String,
    #[serde(default = "default_key_template")]
    pub cache_key_template: String,
    #[serde(default)]
    pub rules: Vec<CacheRule>,
}

impl Default for Cache {
    fn default() -> Self {
        Self {
            status_header: String::new(),
            default_max_age: default_max_age(),
            lock_timeout: default_lock_timeout(),
            path: String::new(),
            cache_key_template: default_key_template(),
            rules: Vec::new(),
        }
    }
}

fn default_max_age() -> Duration {
    Duration::from_secs(60)
}

fn default_lock_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_key_template() -> String {
    crate::handler::DEFAULT_KEY_TEMPLATE.to_string()
}

pub fn load(path: &Path) -> Result<(Bootstrap, Vec<String>)> {
    let raw = fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    let mut ignored = Vec::new();
    let de = serde_yaml::Deserializer::from_str(&raw);
    let cfg: Bootstrap = serde_ignored::deserialize(de, |path| {
        ignored.push(path.to_string());
    })
    .with_context(|| format!("parse config {}", path.display()))?;

    Ok((cfg, ignored))
}
