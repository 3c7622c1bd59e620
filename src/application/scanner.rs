//! Periodic universe scan.
//!
//! The universe is every Stock UIC listed on the configured exchanges
//! (keyword search as a fallback when exchange listing comes back empty).
//! Each scan walks the universe in batches of 50 info-price requests,
//! filters for cheap movers, and enrolls the survivors into the stream.

use crate::config::ScannerConfig;
use crate::domain::errors::GatewayError;
use crate::domain::types::Uic;
use crate::infrastructure::gateway::SaxoGateway;
use crate::infrastructure::rate_limiter::{Priority, RateLimiter};
use crate::infrastructure::streaming::StreamingManager;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const BATCH_SIZE: usize = 50;
/// Pause between batches to smooth the call rate.
const BATCH_DELAY: Duration = Duration::from_millis(500);
/// Wait applied when the limiter refuses a batch.
const DENIED_BATCH_WAIT: Duration = Duration::from_secs(10);

pub struct MarketScanner {
    gateway: Arc<SaxoGateway>,
    limiter: Arc<RateLimiter>,
    streaming: Arc<StreamingManager>,
    config: ScannerConfig,
    /// Fallback universe when discovery fails entirely.
    bootstrap: Vec<Uic>,
    universe: Vec<Uic>,
}

impl MarketScanner {
    pub fn new(
        gateway: Arc<SaxoGateway>,
        limiter: Arc<RateLimiter>,
        streaming: Arc<StreamingManager>,
        config: ScannerConfig,
        bootstrap: Vec<Uic>,
    ) -> Self {
        Self {
            gateway,
            limiter,
            streaming,
            config,
            bootstrap,
            universe: Vec::new(),
        }
    }

    /// Fetch the scannable universe from the configured exchanges, falling
    /// back to keyword search, then to the bootstrap watchlist.
    pub async fn load_universe(&mut self) {
        let mut uics = BTreeSet::new();

        for exchange in &self.config.exchanges {
            match self.gateway.list_instruments_by_exchange(exchange).await {
                Ok(items) => {
                    let before = uics.len();
                    collect_stock_identifiers(&items, &mut uics);
                    info!(
                        %exchange,
                        count = uics.len() - before,
                        "Loaded instruments from exchange"
                    );
                }
                Err(e) => warn!(%exchange, "Exchange universe fetch failed: {e}"),
            }
        }

        if uics.is_empty() {
            warn!("Exchange lookup returned nothing, falling back to keyword search");
            for keyword in &self.config.fallback_keywords {
                match self.gateway.list_instruments_by_keyword(keyword).await {
                    Ok(items) => collect_stock_identifiers(&items, &mut uics),
                    Err(e) => warn!(%keyword, "Keyword search failed: {e}"),
                }
            }
        }

        if uics.is_empty() {
            warn!("Universe discovery failed, scanning the bootstrap watchlist only");
            uics.extend(self.bootstrap.iter().copied());
        }

        self.universe = uics.into_iter().collect();
        info!(
            instruments = self.universe.len(),
            "Market scanner universe ready"
        );
    }

    /// One full scan pass. Returns the UICs newly enrolled into the stream.
    pub async fn scan(&mut self) -> Vec<Uic> {
        if self.universe.is_empty() {
            self.load_universe().await;
            if self.universe.is_empty() {
                warn!("Empty universe, skipping scan");
                return Vec::new();
            }
        }

        let mut hot: Vec<Uic> = Vec::new();

        for batch in self.universe.chunks(BATCH_SIZE).map(<[Uic]>::to_vec) {
            if !self.limiter.admit(Priority::Low) {
                warn!("Scanner batch skipped by rate limiter");
                tokio::time::sleep(DENIED_BATCH_WAIT).await;
                continue;
            }

            let result = self.gateway.list_info_prices(&batch).await;
            self.limiter.record();

            match result {
                Ok(items) => {
                    let mut top_mover: f64 = 0.0;
                    for item in &items {
                        let pct = item
                            .get("Quote")
                            .and_then(|q| q.get("PercentChange"))
                            .and_then(Value::as_f64)
                            .unwrap_or(0.0);
                        top_mover = top_mover.max(pct.abs());

                        if let Some(uic) = hot_candidate(&self.config, item) {
                            hot.push(uic);
                        }
                    }
                    info!(
                        batch = items.len(),
                        "Scanner batch processed, top mover {top_mover:.2}%"
                    );
                }
                Err(GatewayError::RateLimited { retry_after_secs }) => {
                    // Cooldown is already armed by the gateway; stop the scan.
                    warn!(retry_after_secs, "Scanner hit the broker rate limit, aborting scan");
                    break;
                }
                Err(e) => {
                    error!("Scanner batch failed: {e}");
                }
            }

            tokio::time::sleep(BATCH_DELAY).await;
        }

        if !hot.is_empty() {
            info!(candidates = ?hot, "Scanner found hot candidates");
        }

        let mut enrolled = Vec::new();
        for uic in hot {
            if self.streaming.limit_reached() {
                warn!("Subscription limit flagged, pausing enrollments until the janitor prunes");
                break;
            }
            match self.streaming.add(uic).await {
                Ok(()) => enrolled.push(uic),
                Err(GatewayError::SubscriptionLimit) => break,
                Err(e) => warn!(uic, "Could not enroll candidate: {e}"),
            }
        }
        enrolled
    }

}

/// The momentum filter: price inside the configured band (inclusive) and
/// percent change strictly above the threshold.
fn hot_candidate(config: &ScannerConfig, item: &Value) -> Option<Uic> {
    let uic = item.get("Uic").and_then(Value::as_u64)? as Uic;
    let quote = item.get("Quote")?;

    let last_traded = quote.get("LastTraded").and_then(Value::as_f64)?;
    if last_traded < config.min_price || last_traded > config.max_price {
        return None;
    }

    let percent_change = quote
        .get("PercentChange")
        .and_then(Value::as_f64)
        .unwrap_or(0.0);
    if percent_change <= config.min_percent_change {
        return None;
    }

    let symbol = item
        .get("DisplayAndFormat")
        .and_then(|d| d.get("Symbol"))
        .and_then(Value::as_str)
        .unwrap_or("?");
    info!(
        uic,
        symbol, last_traded, percent_change, "Quick win detected"
    );
    Some(uic)
}

fn collect_stock_identifiers(items: &[Value], into: &mut BTreeSet<Uic>) {
    for item in items {
        if item.get("AssetType").and_then(Value::as_str) != Some("Stock") {
            continue;
        }
        if let Some(identifier) = item.get("Identifier").and_then(Value::as_u64) {
            into.insert(identifier as Uic);
        }
    }
}
