// src/connectors/hyperliquid.rs
use crate::config::NetworkConfig;
use crate::connectors::traits::SnapshotProvider;
use crate::error::ConnectorError;
use crate::types::Snapshot;
use crate::utils::retry::RetryPolicy;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Public `/info` client. Only read endpoints; nothing here needs a key.
pub struct HyperliquidClient {
    http_client: Client,
    info_url: Url,
    retry: RetryPolicy,
}

impl HyperliquidClient {
    pub fn new(cfg: &NetworkConfig) -> anyhow::Result<Self> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs_f64(cfg.timeout_seconds))
            .build()?;
        let info_url = Url::parse(cfg.base_url.trim_end_matches('/'))?.join("/info")?;
        Ok(Self {
            http_client,
            info_url,
            retry: RetryPolicy::from_config(cfg),
        })
    }

    async fn post_once(&self, payload: &Value) -> Result<Value, ConnectorError> {
        let response = self
            .http_client
            .post(self.info_url.clone())
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ConnectorError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let value = response.json::<Value>().await?;
        if value.is_object() || value.is_array() {
            Ok(value)
        } else {
            Err(ConnectorError::Decode(format!("unexpected json type: {}", value)))
        }
    }

    /// POST /info with bounded retries on transient failures.
    pub async fn post_info(&self, payload: Value) -> Result<Value, ConnectorError> {
        let label = format!(
            "HL /info {}",
            payload.get("type").and_then(Value::as_str).unwrap_or("?")
        );
        self.retry.run(&label, || self.post_once(&payload)).await
    }

    pub async fn funding_history(
        &self,
        coin: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Value, ConnectorError> {
        self.post_info(json!({
            "type": "fundingHistory",
            "coin": coin,
            "startTime": start_ms,
            "endTime": end_ms,
        }))
        .await
    }

    pub async fn all_mids(&self) -> Result<HashMap<String, Decimal>, ConnectorError> {
        let value = self.post_info(json!({ "type": "allMids" })).await?;
        let map = value
            .as_object()
            .ok_or_else(|| ConnectorError::Decode("allMids is not an object".to_string()))?;
        Ok(map
            .iter()
            .filter_map(|(k, v)| parse_decimal(v).map(|px| (k.clone(), px)))
            .collect())
    }
}

#[async_trait]
impl SnapshotProvider for HyperliquidClient {
    async fn fetch_snapshot(&self, coin: &str, lookback_hours: u32) -> Option<Snapshot> {
        let end_ms = Utc::now().timestamp_millis();
        let start_ms = end_ms - i64::from(lookback_hours) * 3_600_000;

        match self.funding_history(coin, start_ms, end_ms).await {
            Ok(history) => {
                let snap = snapshot_from_history(coin, &history);
                if snap.is_none() {
                    warn!("No usable funding record | coin={}", coin);
                }
                snap
            }
            Err(e) => {
                warn!("Snapshot unavailable this cycle | coin={} err={}", coin, e);
                None
            }
        }
    }
}

fn parse_f64(v: &Value) -> Option<f64> {
    match v {
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
    .filter(|x| x.is_finite())
}

fn parse_decimal(v: &Value) -> Option<Decimal> {
    match v {
        Value::String(s) => Decimal::from_str(s.trim()).ok(),
        Value::Number(n) => n.as_f64().and_then(Decimal::from_f64),
        _ => None,
    }
}

/// API отдаёт fundingRate без знака для одной из сторон: отрицательное значение
/// оставляем как есть, неотрицательное следует за знаком премии.
pub fn signed_funding(premium: f64, fund_raw: f64) -> f64 {
    if fund_raw < 0.0 {
        return fund_raw;
    }
    if premium >= 0.0 {
        fund_raw
    } else {
        -fund_raw.abs()
    }
}

/// Picks the most recent record from a `fundingHistory` response.
pub fn snapshot_from_history(coin: &str, history: &Value) -> Option<Snapshot> {
    let latest = history
        .as_array()?
        .iter()
        .filter(|r| r.is_object())
        .max_by_key(|r| r.get("time").and_then(Value::as_i64).unwrap_or(0))?;

    let time = latest.get("time").and_then(Value::as_i64).unwrap_or(0);
    let fund_raw = latest.get("fundingRate").and_then(parse_f64);
    let premium = latest.get("premium").and_then(parse_f64);

    let (fund_raw, premium) = match (fund_raw, premium) {
        (Some(f), Some(p)) => (f, p),
        _ => {
            debug!("Funding record missing fields | coin={} raw={}", coin, latest);
            return None;
        }
    };

    Some(Snapshot::new(
        coin,
        Some(signed_funding(premium, fund_raw)),
        Some(premium),
        time,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn funding_sign_follows_premium_when_non_negative() {
        assert_eq!(signed_funding(0.0003, 0.00001), 0.00001);
        assert_eq!(signed_funding(-0.0003, 0.00001), -0.00001);
        assert_eq!(signed_funding(0.0003, -0.00001), -0.00001);
        assert_eq!(signed_funding(0.0, 0.00001), 0.00001);
    }

    #[test]
    fn latest_record_wins() {
        let history = json!([
            {"coin": "ETH", "fundingRate": "0.00001", "premium": "0.0002", "time": 1000},
            {"coin": "ETH", "fundingRate": "0.0000125", "premium": "-0.0004", "time": 3000},
            {"coin": "ETH", "fundingRate": "0.00002", "premium": "0.0005", "time": 2000}
        ]);
        let snap = snapshot_from_history("ETH", &history).unwrap();
        assert_eq!(snap.time, 3000);
        assert_eq!(snap.premium, Some(-0.0004));
        assert_eq!(snap.funding_rate, Some(-0.0000125));
    }

    #[test]
    fn malformed_history_yields_none() {
        assert!(snapshot_from_history("ETH", &json!([])).is_none());
        assert!(snapshot_from_history("ETH", &json!({"error": "x"})).is_none());
        assert!(snapshot_from_history(
            "ETH",
            &json!([{"coin": "ETH", "fundingRate": "abc", "premium": "0.1", "time": 1}])
        )
        .is_none());
        assert!(snapshot_from_history(
            "ETH",
            &json!([{"coin": "ETH", "premium": "0.1", "time": 1}])
        )
        .is_none());
    }

    #[test]
    fn numeric_fields_are_accepted() {
        let history = json!([{"fundingRate": 0.00003, "premium": 0.0006, "time": 5}]);
        let snap = snapshot_from_history("SOL", &history).unwrap();
        assert_eq!(snap.coin, "SOL");
        assert_eq!(snap.funding_rate, Some(0.00003));
    }
}
