//! Wallet collaborator: the ledger-credit contract and its delivery policy.
//!
//! The wallet must be idempotent on `idempotency_key`. The engine always
//! passes the ledger transaction id, so a credit that is retried after a
//! timeout lands at most once.

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use squares_types::{EngineError, LedgerTransaction};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WalletError {
    /// The wallet refused the credit. Retrying will not help.
    #[error("credit rejected: {0}")]
    Rejected(String),
    /// Transient failure. Safe to retry with the same key.
    #[error("wallet unavailable: {0}")]
    Unavailable(String),
}

impl WalletError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, WalletError::Unavailable(_))
    }
}

impl From<WalletError> for EngineError {
    fn from(value: WalletError) -> Self {
        EngineError::Wallet(value.to_string())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditRequest {
    pub owner_id: String,
    /// Amount in cents.
    pub amount: u64,
    pub reason: String,
    pub idempotency_key: String,
}

impl From<&LedgerTransaction> for CreditRequest {
    fn from(tx: &LedgerTransaction) -> Self {
        Self {
            owner_id: tx.owner.clone(),
            amount: tx.amount,
            reason: tx.reason.clone(),
            idempotency_key: tx.id.clone(),
        }
    }
}

pub trait Wallet: Send + Sync + 'static {
    fn credit(
        &self,
        request: &CreditRequest,
    ) -> impl Future<Output = Result<(), WalletError>> + Send;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.max_attempts == 0 {
            return Err(EngineError::InvalidInput(
                "retry attempts must be at least 1".to_string(),
            ));
        }
        if self.initial_backoff > self.max_backoff {
            return Err(EngineError::InvalidInput(format!(
                "initial backoff {:?} exceeds max backoff {:?}",
                self.initial_backoff, self.max_backoff
            )));
        }
        Ok(())
    }

    /// Delay before attempt `attempt + 1`, doubling from the initial backoff.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Outcome of [`credit_with_backoff`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreditAttempt {
    pub attempts: u32,
    pub result: Result<(), WalletError>,
}

/// Credit through `wallet`, retrying transient failures per `policy`.
pub async fn credit_with_backoff<W: Wallet>(
    wallet: &W,
    request: &CreditRequest,
    policy: &RetryPolicy,
) -> CreditAttempt {
    let mut attempts = 0;
    loop {
        attempts += 1;
        match wallet.credit(request).await {
            Ok(()) => {
                return CreditAttempt {
                    attempts,
                    result: Ok(()),
                }
            }
            Err(err) if err.is_retryable() && attempts < policy.max_attempts => {
                let delay = policy.backoff(attempts);
                debug!(
                    tx_id = %request.idempotency_key,
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "wallet credit failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                warn!(
                    tx_id = %request.idempotency_key,
                    attempts,
                    error = %err,
                    "wallet credit gave up"
                );
                return CreditAttempt {
                    attempts,
                    result: Err(err),
                };
            }
        }
    }
}

/// Wallet reached over HTTP. Credits are POSTed as JSON with the
/// idempotency key repeated in the `Idempotency-Key` header.
#[derive(Clone, Debug)]
pub struct HttpWallet {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpWallet {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

impl Wallet for HttpWallet {
    async fn credit(&self, request: &CreditRequest) -> Result<(), WalletError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("Idempotency-Key", &request.idempotency_key)
            .json(request)
            .send()
            .await
            .map_err(|err| WalletError::Unavailable(err.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        if status.is_client_error()
            && status != reqwest::StatusCode::REQUEST_TIMEOUT
            && status != reqwest::StatusCode::TOO_MANY_REQUESTS
        {
            return Err(WalletError::Rejected(format!("{status}: {body}")));
        }
        Err(WalletError::Unavailable(format!("{status}: {body}")))
    }
}

/// Stand-in used when no wallet endpoint is configured. Every credit fails as
/// unavailable, so ledger entries stay pending until a real wallet is wired.
#[derive(Clone, Copy, Debug, Default)]
pub struct UnconfiguredWallet;

impl Wallet for UnconfiguredWallet {
    async fn credit(&self, request: &CreditRequest) -> Result<(), WalletError> {
        warn!(
            tx_id = %request.idempotency_key,
            owner = %request.owner_id,
            amount = request.amount,
            "no wallet configured, credit left pending"
        );
        Err(WalletError::Unavailable(
            "no wallet endpoint configured".to_string(),
        ))
    }
}
