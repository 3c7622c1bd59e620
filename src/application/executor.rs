//! Order placement and the emergency kill switch.
//!
//! Sell-side calls run at high rate-limit priority so an exit is never
//! starved by scanner traffic. In dry-run mode the payload is logged and the
//! limiter still ticks, keeping simulated call pressure realistic.

use crate::domain::errors::GatewayError;
use crate::domain::types::{OrderKind, Side, Uic};
use crate::infrastructure::gateway::SaxoGateway;
use crate::infrastructure::rate_limiter::{Priority, RateLimiter};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{error, info, warn};

pub struct OrderExecutor {
    gateway: Arc<SaxoGateway>,
    limiter: Arc<RateLimiter>,
    dry_run: bool,
}

impl OrderExecutor {
    pub fn new(gateway: Arc<SaxoGateway>, limiter: Arc<RateLimiter>, dry_run: bool) -> Self {
        if dry_run {
            warn!("Executor is in SIMULATION mode, no real orders will be placed");
        }
        Self {
            gateway,
            limiter,
            dry_run,
        }
    }

    /// Place one whole-quantity day order. Returns whether the order went
    /// out (or, in dry-run, would have).
    pub async fn place(
        &self,
        uic: Uic,
        quantity: f64,
        side: Side,
        kind: OrderKind,
        price: Option<f64>,
        asset_type: &str,
    ) -> bool {
        let priority = match side {
            Side::Sell => Priority::High,
            Side::Buy => Priority::Normal,
        };
        if !self.limiter.admit(priority) {
            warn!(uic, %side, "Order skipped by rate limiter");
            return false;
        }

        let account_key = match self.gateway.account_key().await {
            Ok(key) => key,
            Err(e) => {
                error!("Cannot place order without an account key: {e}");
                return false;
            }
        };

        let Some(payload) =
            build_order_payload(uic, quantity, side, kind, price, asset_type, &account_key)
        else {
            error!(uic, "Limit order requires a price");
            return false;
        };

        if self.dry_run {
            info!("[dry run] Would place order: {payload}");
            self.limiter.record();
            return true;
        }

        let result = self.gateway.place_order(&payload).await;
        self.limiter.record();

        match result {
            Ok(body) => {
                let order_id = body.get("OrderId").and_then(Value::as_str).unwrap_or("?");
                info!(uic, order_id, "Order placed");
                true
            }
            Err(GatewayError::RateLimited { retry_after_secs }) => {
                error!(uic, retry_after_secs, "Order rejected by broker rate limit");
                false
            }
            Err(e) => {
                error!(uic, "Failed to place order: {e}");
                false
            }
        }
    }

    /// Emergency flatten: cancel every open order, then close every nonzero
    /// position at market. Each half logs its failures without aborting the
    /// other.
    pub async fn kill_switch(&self) {
        error!("CRITICAL: kill switch activated");
        self.cancel_all_orders().await;
        self.close_all_positions().await;
    }

    async fn cancel_all_orders(&self) {
        if self.dry_run {
            info!("[dry run] Would cancel all open orders");
            return;
        }
        warn!("Kill switch: cancelling all open orders...");

        let orders = match self.gateway.list_open_orders().await {
            Ok(orders) => orders,
            Err(e) => {
                error!("Could not list open orders for cancellation: {e}");
                return;
            }
        };

        for order in orders {
            let Some(order_id) = order.get("OrderId").and_then(Value::as_str) else {
                continue;
            };
            match self.gateway.cancel_order(order_id).await {
                Ok(()) => info!(order_id, "Cancelled order"),
                Err(e) => error!(order_id, "Failed to cancel order: {e}"),
            }
        }
    }

    async fn close_all_positions(&self) {
        if self.dry_run {
            info!("[dry run] Would close all positions");
            return;
        }
        warn!("Kill switch: closing all positions...");

        let positions = match self.gateway.list_positions().await {
            Ok(positions) => positions,
            Err(e) => {
                error!("Could not list positions for closure: {e}");
                return;
            }
        };

        for position in positions {
            let Some(base) = position.get("PositionBase") else {
                continue;
            };
            let Some(uic) = base.get("Uic").and_then(Value::as_u64) else {
                continue;
            };
            let amount = base.get("Amount").and_then(Value::as_f64).unwrap_or(0.0);
            if amount == 0.0 {
                continue;
            }
            let asset_type = base
                .get("AssetType")
                .and_then(Value::as_str)
                .unwrap_or("Stock");

            // Long positions sell, shorts buy back.
            let side = if amount > 0.0 { Side::Sell } else { Side::Buy };
            info!(uic, amount, %side, "Closing position");
            self.place(
                uic as Uic,
                amount.abs(),
                side,
                OrderKind::Market,
                None,
                asset_type,
            )
            .await;
        }
    }
}

fn build_order_payload(
    uic: Uic,
    quantity: f64,
    side: Side,
    kind: OrderKind,
    price: Option<f64>,
    asset_type: &str,
    account_key: &str,
) -> Option<Value> {
    let mut payload = json!({
        "Uic": uic,
        "AssetType": asset_type,
        "Amount": quantity,
        "BuySell": side.as_str(),
        "OrderDuration": { "DurationType": "DayOrder" },
        "AccountKey": account_key,
        "OrderType": kind.as_str(),
    });

    if kind == OrderKind::Limit {
        let price = price?;
        payload["OrderPrice"] = json!(price);
    }

    Some(payload)
}
