//! Typed wrappers over the broker's REST endpoints.
//!
//! Broker responses are loosely-typed JSON; everything is read as a value
//! tree with fall-through optional accessors rather than rigid schemas.
//! Every call attaches the bearer credential from the token source; a 429
//! feeds `Retry-After` into the rate limiter's cooldown.

use crate::domain::errors::GatewayError;
use crate::domain::ports::{CostOracle, SubscriptionApi};
use crate::domain::types::Uic;
use crate::infrastructure::auth::{TokenSource, redact};
use crate::infrastructure::rate_limiter::RateLimiter;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Streaming snapshot refresh rate requested on subscribe.
const SUBSCRIPTION_REFRESH_MS: u64 = 1000;

pub struct SaxoGateway {
    http: reqwest::Client,
    base_url: String,
    auth: Arc<TokenSource>,
    limiter: Arc<RateLimiter>,
    account_key: tokio::sync::Mutex<Option<String>>,
}

impl SaxoGateway {
    pub fn new(base_url: String, auth: Arc<TokenSource>, limiter: Arc<RateLimiter>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            auth,
            limiter,
            account_key: tokio::sync::Mutex::new(None),
        }
    }

    /// The primary account key, fetched once and memoized.
    pub async fn account_key(&self) -> Result<String, GatewayError> {
        let mut cached = self.account_key.lock().await;
        if let Some(key) = cached.as_ref() {
            return Ok(key.clone());
        }

        let body = self
            .get_json(&format!("{}/port/v1/accounts/me", self.base_url), &[])
            .await?;

        let key = body
            .get("Data")
            .and_then(Value::as_array)
            .and_then(|accounts| accounts.first())
            .and_then(|account| account.get("AccountKey"))
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::Remote {
                status: 200,
                body: "accounts response carried no AccountKey".to_string(),
            })?
            .to_string();

        info!(account_key = %key, "Retrieved account key");
        *cached = Some(key.clone());
        Ok(key)
    }

    /// Estimated round-trip commission in account currency, from the
    /// trading-conditions endpoint (`Cost.Long.TotalCost`, falling back to
    /// `Cost.Short.TotalCost`).
    pub async fn cost_estimate(
        &self,
        uic: Uic,
        quantity: f64,
        price: f64,
        asset_type: &str,
    ) -> Result<f64, GatewayError> {
        let account_key = self.account_key().await?;
        let url = format!(
            "{}/cs/v1/tradingconditions/cost/{}/{}/{}",
            self.base_url, account_key, uic, asset_type
        );

        let body = self
            .get_json(
                &url,
                &[
                    ("Amount", quantity.to_string()),
                    ("Price", price.to_string()),
                    ("FieldGroups", "DisplayAndFormat".to_string()),
                ],
            )
            .await?;

        let total = body
            .get("Cost")
            .and_then(|cost| cost.get("Long").or_else(|| cost.get("Short")))
            .and_then(|side| side.get("TotalCost"))
            .and_then(Value::as_f64)
            .unwrap_or(0.0);

        Ok(total)
    }

    /// Stock instruments listed on `exchange`, non-tradable excluded.
    pub async fn list_instruments_by_exchange(
        &self,
        exchange: &str,
    ) -> Result<Vec<Value>, GatewayError> {
        self.list_instruments(&[
            ("ExchangeId", exchange.to_string()),
            ("AssetTypes", "Stock".to_string()),
            ("IncludeNonTradable", "false".to_string()),
        ])
        .await
    }

    /// Stock instruments matching a free-text keyword.
    pub async fn list_instruments_by_keyword(
        &self,
        keyword: &str,
    ) -> Result<Vec<Value>, GatewayError> {
        self.list_instruments(&[
            ("Keywords", keyword.to_string()),
            ("AssetTypes", "Stock".to_string()),
        ])
        .await
    }

    async fn list_instruments(
        &self,
        query: &[(&str, String)],
    ) -> Result<Vec<Value>, GatewayError> {
        let body = self
            .get_json(&format!("{}/ref/v1/instruments", self.base_url), query)
            .await?;
        Ok(data_array(&body))
    }

    /// Batched quote + percent-change snapshot for up to 50 UICs.
    pub async fn list_info_prices(&self, uics: &[Uic]) -> Result<Vec<Value>, GatewayError> {
        let body = self
            .get_json(
                &format!("{}/trade/v1/infoprices/list", self.base_url),
                &[
                    ("Uics", csv(uics)),
                    ("AssetType", "Stock".to_string()),
                ],
            )
            .await?;
        Ok(data_array(&body))
    }

    pub async fn place_order(&self, payload: &Value) -> Result<Value, GatewayError> {
        let token = self.auth.bearer().await?;
        let response = self
            .http
            .post(format!("{}/trade/v1/orders", self.base_url))
            .bearer_auth(token)
            .json(payload)
            .send()
            .await
            .map_err(transport)?;

        self.check(response).await
    }

    pub async fn list_open_orders(&self) -> Result<Vec<Value>, GatewayError> {
        let account_key = self.account_key().await?;
        let body = self
            .get_json(
                &format!("{}/trade/v1/orders", self.base_url),
                &[
                    ("AccountKey", account_key),
                    ("FieldGroups", "DisplayAndFormat".to_string()),
                ],
            )
            .await?;
        Ok(data_array(&body))
    }

    pub async fn cancel_order(&self, order_id: &str) -> Result<(), GatewayError> {
        let account_key = self.account_key().await?;
        let token = self.auth.bearer().await?;
        let response = self
            .http
            .delete(format!("{}/trade/v1/orders/{}", self.base_url, order_id))
            .query(&[("AccountKey", account_key)])
            .bearer_auth(token)
            .send()
            .await
            .map_err(transport)?;

        self.check(response).await.map(|_| ())
    }

    pub async fn list_positions(&self) -> Result<Vec<Value>, GatewayError> {
        let account_key = self.account_key().await?;
        let body = self
            .get_json(
                &format!("{}/port/v1/positions", self.base_url),
                &[
                    ("AccountKey", account_key),
                    ("FieldGroups", "DisplayAndFormat,PositionBase".to_string()),
                ],
            )
            .await?;
        Ok(data_array(&body))
    }

    async fn get_json(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<Value, GatewayError> {
        let token = self.auth.bearer().await?;
        let response = self
            .http
            .get(url)
            .query(query)
            .bearer_auth(token)
            .send()
            .await
            .map_err(transport)?;

        self.check(response).await
    }

    /// Common response handling: 2xx parses to JSON, 429 arms the cooldown,
    /// anything else becomes a logged `Remote` error.
    async fn check(&self, response: reqwest::Response) -> Result<Value, GatewayError> {
        let status = response.status();

        if status.as_u16() == 429 {
            let retry_after_secs = retry_after(&response);
            self.limiter
                .cooldown(Duration::from_secs(retry_after_secs));
            return Err(GatewayError::RateLimited { retry_after_secs });
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let redacted = redact(&body);
            error!("Broker request failed ({status}): {redacted}");
            return Err(GatewayError::Remote {
                status: status.as_u16(),
                body: redacted,
            });
        }

        if status.as_u16() == 204 {
            return Ok(Value::Null);
        }

        // Some DELETEs answer 2xx with an empty body.
        let text = response.text().await.map_err(transport)?;
        if text.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| GatewayError::Remote {
            status: status.as_u16(),
            body: format!("unparseable body: {e}"),
        })
    }
}

#[async_trait]
impl SubscriptionApi for SaxoGateway {
    async fn create_price_subscription(
        &self,
        context_id: &str,
        reference_id: &str,
        uics: &[Uic],
    ) -> Result<Vec<Value>, GatewayError> {
        let token = self.auth.bearer().await?;
        let payload = json!({
            "Arguments": {
                "Uics": csv(uics),
                "AssetType": "Stock",
            },
            "ContextId": context_id,
            "ReferenceId": reference_id,
            "RefreshRate": SUBSCRIPTION_REFRESH_MS,
        });

        let response = self
            .http
            .post(format!("{}/trade/v1/infoprices/subscriptions", self.base_url))
            .bearer_auth(token)
            .json(&payload)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if status.is_success() {
            let body: Value = response.json().await.map_err(transport)?;
            let snapshot = body
                .get("Snapshot")
                .map(data_array)
                .unwrap_or_default();
            info!(
                reference_id,
                uics = %csv(uics),
                "Streaming subscription confirmed"
            );
            return Ok(snapshot);
        }

        let body = response.text().await.unwrap_or_default();
        if status.as_u16() == 403 || body.contains("SubscriptionLimitExceeded") {
            return Err(GatewayError::SubscriptionLimit);
        }

        warn!("Subscription enroll failed ({status}): {}", redact(&body));
        Err(GatewayError::Remote {
            status: status.as_u16(),
            body: redact(&body),
        })
    }

    async fn delete_price_subscription(
        &self,
        context_id: &str,
        reference_id: &str,
    ) -> Result<(), GatewayError> {
        let token = self.auth.bearer().await?;
        let response = self
            .http
            .delete(format!(
                "{}/trade/v1/infoprices/subscriptions/{}/{}",
                self.base_url, context_id, reference_id
            ))
            .bearer_auth(token)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(GatewayError::Remote {
            status: status.as_u16(),
            body: redact(&body),
        })
    }
}

#[async_trait]
impl CostOracle for SaxoGateway {
    async fn commission(&self, uic: Uic, quantity: f64, price: f64) -> f64 {
        match self.cost_estimate(uic, quantity, price, "Stock").await {
            Ok(cost) => cost,
            Err(e) => {
                error!(uic, "Commission estimate failed, assuming 0.0: {e}");
                0.0
            }
        }
    }

    /// Static rates matching the simulation environment; a live FX feed is
    /// future work.
    fn fx_rate(&self, from: &str, to: &str) -> f64 {
        static_fx_rate(from, to)
    }
}

pub fn static_fx_rate(from: &str, to: &str) -> f64 {
    match (from, to) {
        (f, t) if f == t => 1.0,
        ("USD", "EUR") => 0.90,
        ("EUR", "USD") => 1.11,
        _ => 1.0,
    }
}

fn csv(uics: &[Uic]) -> String {
    uics.iter()
        .map(|u| u.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// The `Data` array most list endpoints wrap their payload in.
fn data_array(body: &Value) -> Vec<Value> {
    body.get("Data")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn retry_after(response: &reqwest::Response) -> u64 {
    response
        .headers()
        .get("Retry-After")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(60)
}

fn transport(e: reqwest::Error) -> GatewayError {
    GatewayError::Transport {
        reason: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csv_joins_uics() {
        assert_eq!(csv(&[211, 42, 7]), "211,42,7");
        assert_eq!(csv(&[]), "");
    }

    #[test]
    fn test_data_array_falls_through_missing_field() {
        let body = json!({"Data": [{"Uic": 211}]});
        assert_eq!(data_array(&body).len(), 1);
        assert!(data_array(&json!({})).is_empty());
        assert!(data_array(&json!({"Data": null})).is_empty());
    }

    #[test]
    fn test_static_fx_rates() {
        assert_eq!(static_fx_rate("USD", "USD"), 1.0);
        assert_eq!(static_fx_rate("USD", "EUR"), 0.90);
        assert_eq!(static_fx_rate("EUR", "USD"), 1.11);
        assert_eq!(static_fx_rate("GBP", "JPY"), 1.0);
    }
}
