//! HTTP service around the squares board engine.

use std::sync::Arc;
use std::time::Duration;

use squares_execution::{
    BoardStore, CreditRequest, Engine, HttpWallet, UnconfiguredWallet, Wallet, WalletError,
};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{info, warn};

pub mod api;
pub mod config;

pub use api::{router, ApiError, AppState};
pub use config::{build_config, Args, ServiceConfig};

/// Wallet picked at startup.
pub enum ServiceWallet {
    Http(HttpWallet),
    Unconfigured(UnconfiguredWallet),
}

impl ServiceWallet {
    pub fn from_config(config: &ServiceConfig) -> anyhow::Result<Self> {
        match &config.wallet_url {
            Some(url) => Ok(Self::Http(HttpWallet::new(url, config.wallet_timeout)?)),
            None => {
                warn!("no wallet endpoint configured; credits stay pending");
                Ok(Self::Unconfigured(UnconfiguredWallet))
            }
        }
    }
}

impl Wallet for ServiceWallet {
    async fn credit(&self, request: &CreditRequest) -> Result<(), WalletError> {
        match self {
            Self::Http(wallet) => wallet.credit(request).await,
            Self::Unconfigured(wallet) => wallet.credit(request).await,
        }
    }
}

/// Periodically pushes undelivered ledger entries to the wallet.
pub fn spawn_delivery_sweep<S: BoardStore, W: Wallet>(
    engine: Arc<Engine<S, W>>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match engine.deliver_pending(None).await {
                Ok(report) if report.delivered > 0 || report.escalated > 0 => {
                    info!(
                        delivered = report.delivered,
                        escalated = report.escalated,
                        "delivery sweep"
                    );
                }
                Ok(_) => {}
                Err(err) => warn!(error = %err, "delivery sweep failed"),
            }
        }
    })
}
