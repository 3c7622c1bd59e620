use crate::domain::errors::GatewayError;
use crate::domain::types::Uic;
use anyhow::Result;
use async_trait::async_trait;
use std::time::Instant;

/// External key-value storage for state that must survive restarts:
/// the rotated refresh credential, open positions, the active-universe view.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    /// All keys starting with `prefix`.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Cost inputs for the profit guard. Commission mirrors the broker's
/// trading-conditions endpoint and falls back to 0.0 when the estimate is
/// unavailable; FX rates answer 1.0 for same-currency pairs.
#[async_trait]
pub trait CostOracle: Send + Sync {
    async fn commission(&self, uic: Uic, quantity: f64, price: f64) -> f64;
    fn fx_rate(&self, from: &str, to: &str) -> f64;
}

/// REST side-channel of the streaming protocol. Split from the streaming
/// manager so ledger behavior is testable without a live socket.
#[async_trait]
pub trait SubscriptionApi: Send + Sync {
    /// Enroll `uics` under `(context_id, reference_id)`. Returns the
    /// snapshot `Data` array from the 201 response.
    async fn create_price_subscription(
        &self,
        context_id: &str,
        reference_id: &str,
        uics: &[Uic],
    ) -> Result<Vec<serde_json::Value>, GatewayError>;

    async fn delete_price_subscription(
        &self,
        context_id: &str,
        reference_id: &str,
    ) -> Result<(), GatewayError>;
}

/// Injectable time source so subscription ages and rate windows are
/// controllable in tests.
pub trait Clock: Send + Sync {
    fn monotonic(&self) -> Instant;
    fn unix_seconds(&self) -> u64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn monotonic(&self) -> Instant {
        Instant::now()
    }

    fn unix_seconds(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}
