use anyhow::{Context, Result};
use reqwest::Url;
use std::{env, net::SocketAddr, path::PathBuf};

pub const DEFAULT_API_BASE: &str = "https://api.telegram.org/";

/// Runtime settings, env-backed with CLI overrides applied by the binary.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Webhook listen address (`BOTFLOW_BIND`).
    pub bind: SocketAddr,
    /// Directory of published bot definitions (`BOTFLOW_BOTS_DIR`).
    pub bots_dir: PathBuf,
    /// Bot API base URL (`TELEGRAM_API_BASE`); overridable for tests.
    pub api_base: Url,
    /// Payment provider token for invoices (`PAYMENT_PROVIDER_TOKEN`).
    pub provider_token: Option<String>,
    /// Idle TTL for per-user sessions (`BOTFLOW_SESSION_TTL_SECS`).
    pub session_ttl_secs: u64,
    /// TTL for the duplicate-delivery cache (`BOTFLOW_DEDUP_TTL_SECS`).
    pub dedup_ttl_secs: u64,
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let bind = env_or("BOTFLOW_BIND", "0.0.0.0:8080")
            .parse::<SocketAddr>()
            .context("parsing BOTFLOW_BIND")?;
        let bots_dir = PathBuf::from(env_or("BOTFLOW_BOTS_DIR", "./bots"));

        // a trailing slash keeps Url::join from eating the last path segment
        let mut base = env_or("TELEGRAM_API_BASE", DEFAULT_API_BASE);
        if !base.ends_with('/') {
            base.push('/');
        }
        let api_base = Url::parse(&base).context("parsing TELEGRAM_API_BASE")?;

        let provider_token = env::var("PAYMENT_PROVIDER_TOKEN")
            .ok()
            .filter(|v| !v.is_empty());
        let session_ttl_secs = env_or("BOTFLOW_SESSION_TTL_SECS", "1800")
            .parse::<u64>()
            .context("parsing BOTFLOW_SESSION_TTL_SECS")?;
        let dedup_ttl_secs = env_or("BOTFLOW_DEDUP_TTL_SECS", "600")
            .parse::<u64>()
            .context("parsing BOTFLOW_DEDUP_TTL_SECS")?;

        Ok(Self {
            bind,
            bots_dir,
            api_base,
            provider_token,
            session_ttl_secs,
            dedup_ttl_secs,
        })
    }
}
