//! Audit-grade net-profit math behind the profit guard.
//!
//! A trailing-stop exit is vetoed unless the trade still clears every cost:
//! broker commission, FX friction when instrument and account currencies
//! differ, and a slippage buffer on the exit notional.

use crate::domain::ports::CostOracle;
use crate::domain::types::{Position, Uic};
use std::sync::Arc;
use tracing::info;

/// Conversion fee charged on round-trip notional when currencies differ.
const FX_FEE_PCT: f64 = 0.005;
/// Safety margin on the exit notional: 5 basis points.
const SLIPPAGE_BPS: f64 = 0.0005;

pub struct ProfitAuditor {
    oracle: Arc<dyn CostOracle>,
    account_currency: String,
}

impl ProfitAuditor {
    pub fn new(oracle: Arc<dyn CostOracle>, account_currency: String) -> Self {
        Self {
            oracle,
            account_currency,
        }
    }

    /// Net profit in account currency for a hypothetical round trip.
    pub async fn net_profit(
        &self,
        entry_price: f64,
        exit_price: f64,
        quantity: f64,
        uic: Uic,
        instrument_currency: &str,
        include_slippage: bool,
    ) -> f64 {
        let fx = self.oracle.fx_rate(instrument_currency, &self.account_currency);

        let gross_instr = (exit_price - entry_price) * quantity;
        let gross_acct = gross_instr * fx;

        // Commission estimated at the average of entry and exit.
        let avg_price = (entry_price + exit_price) / 2.0;
        let commission = self.oracle.commission(uic, quantity, avg_price).await;

        let fx_cost = if instrument_currency != self.account_currency {
            let round_trip_notional = entry_price * quantity + exit_price * quantity;
            round_trip_notional * fx * FX_FEE_PCT
        } else {
            0.0
        };

        let slippage = if include_slippage {
            exit_price * quantity * fx * SLIPPAGE_BPS
        } else {
            0.0
        };

        let net = gross_acct - commission - fx_cost - slippage;
        info!(
            uic,
            "Profit audit: gross({gross_acct:.2}) - commission({commission:.2}) - fx({fx_cost:.2}) - slippage({slippage:.2}) = net({net:.2}) {}",
            self.account_currency
        );
        net
    }

    /// The exit-time guard: safe to sell only if net profit stays positive
    /// with the slippage buffer applied.
    pub async fn evaluate_exit(
        &self,
        position: &Position,
        exit_price: f64,
        instrument_currency: &str,
    ) -> bool {
        self.net_profit(
            position.entry_price,
            exit_price,
            position.quantity,
            position.uic,
            instrument_currency,
            true,
        )
        .await
            > 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// Pure-math stand-in: 0.1% commission with a 1.0 floor, static FX.
    struct MockOracle;

    #[async_trait]
    impl CostOracle for MockOracle {
        async fn commission(&self, _uic: Uic, quantity: f64, price: f64) -> f64 {
            (price * quantity * 0.001).max(1.0)
        }

        fn fx_rate(&self, from: &str, to: &str) -> f64 {
            match (from, to) {
                (f, t) if f == t => 1.0,
                ("USD", "EUR") => 0.90,
                _ => 1.0,
            }
        }
    }

    fn auditor(account_currency: &str) -> ProfitAuditor {
        ProfitAuditor::new(Arc::new(MockOracle), account_currency.to_string())
    }

    #[tokio::test]
    async fn test_winning_usd_trade_clears_costs() {
        // Gross 5.00, commission 1.0025, slippage 0.5025 => net ~3.495.
        let net = auditor("USD")
            .net_profit(100.0, 100.5, 10.0, 123, "USD", true)
            .await;
        assert!((net - 3.495).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_paper_profit_eaten_by_fx_friction() {
        // Gross 45 EUR against ~90 EUR of conversion fees: vetoed.
        let net = auditor("EUR")
            .net_profit(100.0, 100.5, 100.0, 123, "USD", true)
            .await;
        assert!(net < 0.0);
    }

    #[tokio::test]
    async fn test_razor_thin_profit_killed_by_slippage_buffer() {
        // Gross 15.00, commission ~10.01, slippage ~5.01 => just negative.
        let net = auditor("USD")
            .net_profit(100.0, 100.15, 100.0, 123, "USD", true)
            .await;
        assert!(net < 0.0);

        // Without the buffer the same trade clears its costs.
        let net_no_slip = auditor("USD")
            .net_profit(100.0, 100.15, 100.0, 123, "USD", false)
            .await;
        assert!(net_no_slip > 0.0);
    }

    #[tokio::test]
    async fn test_evaluate_exit_applies_slippage() {
        let position = Position {
            uic: 123,
            entry_price: 100.0,
            quantity: 10.0,
            peak_price: 101.0,
        };
        assert!(auditor("USD").evaluate_exit(&position, 100.5, "USD").await);
        assert!(!auditor("USD").evaluate_exit(&position, 100.05, "USD").await);
    }
}
