use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};

/// Secrets that ship in sample `.env` files and must never be used.
const PLACEHOLDER_SECRETS: &[&str] = &["dev-secret-change-me", "change-me", "changeme", "secret"];

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub db_path: PathBuf,
    pub jwt_secret: String,
    pub access_token: String,
    pub heartbeat: Duration,
    pub route_settle: Duration,
}

impl ClientConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let jwt_secret = lookup("BAZAAR_JWT_SECRET").context("BAZAAR_JWT_SECRET is not set")?;
        if jwt_secret.trim().is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            bail!("BAZAAR_JWT_SECRET is a placeholder, set a real secret");
        }

        let access_token = lookup("BAZAAR_ACCESS_TOKEN").context("BAZAAR_ACCESS_TOKEN is not set")?;

        let heartbeat_secs: u64 = lookup("BAZAAR_HEARTBEAT_SECS")
            .unwrap_or_else(|| "30".into())
            .parse()
            .context("BAZAAR_HEARTBEAT_SECS must be a whole number of seconds")?;
        if heartbeat_secs == 0 {
            bail!("BAZAAR_HEARTBEAT_SECS must be at least 1");
        }

        let settle_ms: u64 = lookup("BAZAAR_ROUTE_SETTLE_MS")
            .unwrap_or_else(|| "300".into())
            .parse()
            .context("BAZAAR_ROUTE_SETTLE_MS must be a whole number of milliseconds")?;

        Ok(Self {
            db_path: PathBuf::from(lookup("BAZAAR_DB_PATH").unwrap_or_else(|| "bazaar.db".into())),
            jwt_secret,
            access_token,
            heartbeat: Duration::from_secs(heartbeat_secs),
            route_settle: Duration::from_millis(settle_ms),
        })
    }
}
