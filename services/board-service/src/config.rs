use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use squares_execution::{EngineConfig, RetryPolicy, DEFAULT_PERIOD_SHARE_BPS};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Squares board lifecycle and settlement service", long_about = None)]
pub struct Args {
    /// Host interface to bind.
    #[arg(long, env = "SQUARES_HOST", default_value = "127.0.0.1")]
    pub host: IpAddr,

    #[arg(short, long, env = "SQUARES_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Path to the SQLite board store (state is kept in memory when omitted).
    #[arg(long, env = "SQUARES_DB_PATH")]
    pub db_path: Option<PathBuf>,

    /// Wallet credit endpoint. Without it credits stay pending.
    #[arg(long, env = "SQUARES_WALLET_URL")]
    pub wallet_url: Option<String>,

    #[arg(long, env = "SQUARES_WALLET_TIMEOUT_MS", default_value_t = 5_000)]
    pub wallet_timeout_ms: u64,

    /// Token required in `x-admin-token` for privileged routes. Empty blocks them.
    #[arg(long, env = "SQUARES_ADMIN_TOKEN", default_value = "", hide_env_values = true)]
    pub admin_token: String,

    /// Share of the pot paid per period on paid boards, in basis points.
    #[arg(long, env = "SQUARES_PERIOD_SHARE_BPS", default_value_t = DEFAULT_PERIOD_SHARE_BPS)]
    pub period_share_bps: u32,

    #[arg(long, env = "SQUARES_RETRY_ATTEMPTS", default_value_t = 5)]
    pub retry_attempts: u32,

    #[arg(long, env = "SQUARES_RETRY_INITIAL_BACKOFF_MS", default_value_t = 200)]
    pub retry_initial_backoff_ms: u64,

    #[arg(long, env = "SQUARES_RETRY_MAX_BACKOFF_MS", default_value_t = 5_000)]
    pub retry_max_backoff_ms: u64,

    /// How often undelivered credits are pushed to the wallet again.
    #[arg(long, env = "SQUARES_SWEEP_INTERVAL_MS", default_value_t = 30_000)]
    pub sweep_interval_ms: u64,
}

#[derive(Clone, Debug)]
pub struct ServiceConfig {
    pub addr: SocketAddr,
    pub db_path: Option<PathBuf>,
    pub wallet_url: Option<String>,
    pub wallet_timeout: Duration,
    pub admin_token: Option<String>,
    pub engine: EngineConfig,
    pub sweep_interval: Duration,
}

pub fn build_config(args: &Args) -> Result<ServiceConfig> {
    if args.sweep_interval_ms == 0 {
        anyhow::bail!("sweep_interval_ms must be > 0");
    }
    if args.wallet_timeout_ms == 0 {
        anyhow::bail!("wallet_timeout_ms must be > 0");
    }
    let engine = EngineConfig {
        period_share_bps: args.period_share_bps,
        retry: RetryPolicy {
            max_attempts: args.retry_attempts,
            initial_backoff: Duration::from_millis(args.retry_initial_backoff_ms),
            max_backoff: Duration::from_millis(args.retry_max_backoff_ms),
        },
    };
    engine.validate().context("invalid engine config")?;

    let admin_token = Some(args.admin_token.trim().to_string()).filter(|t| !t.is_empty());
    let wallet_url = args
        .wallet_url
        .as_deref()
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(str::to_string);

    Ok(ServiceConfig {
        addr: SocketAddr::new(args.host, args.port),
        db_path: args.db_path.clone(),
        wallet_url,
        wallet_timeout: Duration::from_millis(args.wallet_timeout_ms),
        admin_token,
        engine,
        sweep_interval: Duration::from_millis(args.sweep_interval_ms),
    })
}
