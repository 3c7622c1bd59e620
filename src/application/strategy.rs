//! Per-instrument trend-following state machine.
//!
//! Flat -> Long on an EMA(short) > EMA(long) crossover, Long -> Flat on a
//! trailing stop gated by the profit audit. Every position mutation is
//! written through to the state store so a crash or restart rehydrates
//! mid-flight positions.

use crate::application::audit::ProfitAuditor;
use crate::domain::ports::StateStore;
use crate::domain::types::{Position, Side, Uic};
use crate::infrastructure::persistence::{POSITION_KEY_PREFIX, position_key};
use anyhow::{Context, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct StrategyParams {
    pub short_period: usize,
    pub long_period: usize,
    pub history_cap: usize,
    pub stop_loss_pct: f64,
    pub trade_quantity: f64,
    pub instrument_currency: String,
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            short_period: 5,
            long_period: 20,
            history_cap: 30,
            stop_loss_pct: 0.01,
            trade_quantity: 10.0,
            instrument_currency: "USD".to_string(),
        }
    }
}

pub struct TrendFollower {
    params: StrategyParams,
    auditor: ProfitAuditor,
    store: Arc<dyn StateStore>,
    positions: HashMap<Uic, Position>,
    history: HashMap<Uic, VecDeque<f64>>,
}

impl TrendFollower {
    pub fn new(params: StrategyParams, auditor: ProfitAuditor, store: Arc<dyn StateStore>) -> Self {
        Self {
            params,
            auditor,
            store,
            positions: HashMap::new(),
            history: HashMap::new(),
        }
    }

    /// Rehydrate positions persisted by a previous run (orphan recovery).
    pub async fn restore(&mut self) -> Result<()> {
        let keys = self
            .store
            .keys(POSITION_KEY_PREFIX)
            .await
            .context("Failed to list persisted positions")?;

        for key in keys {
            let Some(raw) = self.store.get(&key).await? else {
                continue;
            };
            let position: Position = serde_json::from_str(&raw)
                .with_context(|| format!("Corrupt position state under {key}"))?;
            info!(
                uic = position.uic,
                entry = position.entry_price,
                peak = position.peak_price,
                "Restored orphaned position from state store"
            );
            self.positions.insert(position.uic, position);
        }

        Ok(())
    }

    /// Feed one price tick. Returns the signal to act on, if any.
    pub async fn update(&mut self, uic: Uic, price: f64) -> Option<Side> {
        let history = self
            .history
            .entry(uic)
            .or_insert_with(|| VecDeque::with_capacity(self.params.history_cap));
        if history.len() == self.params.history_cap {
            history.pop_front();
        }
        history.push_back(price);

        if self.positions.contains_key(&uic) {
            self.check_exit(uic, price).await
        } else {
            self.check_entry(uic, price).await
        }
    }

    async fn check_entry(&mut self, uic: Uic, price: f64) -> Option<Side> {
        let history = self.history.get(&uic)?;
        if history.len() < self.params.long_period {
            return None;
        }

        let prices: Vec<f64> = history.iter().copied().collect();
        let short = ema(&prices, self.params.short_period);
        let long = ema(&prices, self.params.long_period);
        if short <= long {
            return None;
        }

        info!(uic, "Entry signal: short EMA ({short:.2}) > long EMA ({long:.2})");
        let position = Position::open(uic, price, self.params.trade_quantity);
        self.positions.insert(uic, position);
        self.persist(uic).await;
        Some(Side::Buy)
    }

    async fn check_exit(&mut self, uic: Uic, price: f64) -> Option<Side> {
        let position = self.positions.get_mut(&uic)?;

        if price > position.peak_price {
            position.peak_price = price;
            self.persist(uic).await;
        }

        let position = self.positions.get(&uic)?.clone();
        let stop = position.peak_price * (1.0 - self.params.stop_loss_pct);
        if price > stop {
            return None;
        }

        warn!(uic, "Trailing stop hit at {price} (stop: {stop:.2})");
        if self
            .auditor
            .evaluate_exit(&position, price, &self.params.instrument_currency)
            .await
        {
            info!(uic, "Profit guard passed, net stays positive after costs. Selling.");
            self.positions.remove(&uic);
            self.delete_persisted(uic).await;
            Some(Side::Sell)
        } else {
            warn!(
                uic,
                "Profit guard veto: stop is visible but costs exceed the gain. Holding."
            );
            None
        }
    }

    pub fn position(&self, uic: Uic) -> Option<&Position> {
        self.positions.get(&uic)
    }

    pub fn peak_of(&self, uic: Uic) -> Option<f64> {
        self.positions.get(&uic).map(|p| p.peak_price)
    }

    /// UICs with an open position; never prunable from the stream.
    pub fn owned(&self) -> Vec<Uic> {
        let mut uics: Vec<Uic> = self.positions.keys().copied().collect();
        uics.sort_unstable();
        uics
    }

    /// Copy of the position map for observers.
    pub fn snapshot(&self) -> Vec<Position> {
        let mut positions: Vec<Position> = self.positions.values().cloned().collect();
        positions.sort_unstable_by_key(|p| p.uic);
        positions
    }

    /// Belt-and-braces write of every open position, used at shutdown even
    /// though each mutation already persisted.
    pub async fn persist_all(&self) {
        for uic in self.positions.keys().copied().collect::<Vec<_>>() {
            self.persist(uic).await;
        }
    }

    async fn persist(&self, uic: Uic) {
        let Some(position) = self.positions.get(&uic) else {
            return;
        };
        let json = match serde_json::to_string(position) {
            Ok(json) => json,
            Err(e) => {
                error!(uic, "Could not serialize position: {e}");
                return;
            }
        };
        if let Err(e) = self.store.set(&position_key(uic), &json).await {
            error!(uic, "Failed to persist position: {e:#}");
        }
    }

    async fn delete_persisted(&self, uic: Uic) {
        if let Err(e) = self.store.delete(&position_key(uic)).await {
            error!(uic, "Failed to delete persisted position: {e:#}");
        }
    }
}

/// Standard EMA: SMA over the first `period` values, then the iterative
/// update with k = 2 / (period + 1).
pub fn ema(prices: &[f64], period: usize) -> f64 {
    if prices.is_empty() || period == 0 {
        return 0.0;
    }

    let lead = period.min(prices.len());
    let mut ema = prices[..lead].iter().sum::<f64>() / lead as f64;

    let k = 2.0 / (period as f64 + 1.0);
    for price in &prices[lead..] {
        ema = price * k + ema * (1.0 - k);
    }
    ema
}
