use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};

use parley_gateway::connection::HEARTBEAT_INTERVAL;

/// Secrets that ship in sample files and must never reach production.
const PLACEHOLDER_SECRETS: &[&str] = &["", "dev-secret-change-me", "change-me", "secret"];

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    /// Absent: presence lives in process memory.
    pub redis_url: Option<String>,
    /// Absent: the internal event endpoint refuses every call.
    pub internal_key: Option<String>,
    pub blocking_threads: usize,
    pub heartbeat: Duration,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let get = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let optional = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let jwt_secret = lookup("PARLEY_JWT_SECRET").context("PARLEY_JWT_SECRET is not set")?;
        if PLACEHOLDER_SECRETS.contains(&jwt_secret.trim()) {
            bail!("PARLEY_JWT_SECRET is a placeholder; set a real secret");
        }

        let port = get("PARLEY_PORT", "3000")
            .parse()
            .context("PARLEY_PORT must be a port number")?;
        let blocking_threads: usize = get("PARLEY_BLOCKING_THREADS", "32")
            .parse()
            .context("PARLEY_BLOCKING_THREADS must be a number")?;
        if blocking_threads == 0 {
            bail!("PARLEY_BLOCKING_THREADS must be at least 1");
        }
        let heartbeat_secs: u64 = get("PARLEY_HEARTBEAT_SECS", &HEARTBEAT_INTERVAL.as_secs().to_string())
            .parse()
            .context("PARLEY_HEARTBEAT_SECS must be a number of seconds")?;
        if heartbeat_secs == 0 {
            bail!("PARLEY_HEARTBEAT_SECS must be at least 1");
        }

        Ok(Self {
            host: get("PARLEY_HOST", "0.0.0.0"),
            port,
            db_path: PathBuf::from(get("PARLEY_DB_PATH", "parley.db")),
            jwt_secret,
            redis_url: optional("PARLEY_REDIS_URL"),
            internal_key: optional("PARLEY_INTERNAL_KEY"),
            blocking_threads,
            heartbeat: Duration::from_secs(heartbeat_secs),
        })
    }

    pub fn addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.host, self.port))
    }
}
