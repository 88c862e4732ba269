use crate::error::ConnectorError;
use crate::types::{
    OrderResult, PerpOrderRequest, PositionRecord, Snapshot, SpotOrderRequest, SpotOrderResult,
};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;

#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    /// Latest funding/premium observation. Never errors: unavailable or malformed data is `None`.
    async fn fetch_snapshot(&self, coin: &str, lookback_hours: u32) -> Option<Snapshot>;
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn get_positions(&self, coin: Option<&str>) -> Result<Vec<PositionRecord>, ConnectorError>;

    /// Total balance per asset, keyed by upper-case symbol.
    async fn get_spot_balances(&self) -> Result<HashMap<String, Decimal>, ConnectorError>;

    async fn place_perp_order(&self, req: &PerpOrderRequest) -> Result<OrderResult, ConnectorError>;

    async fn place_spot_order(&self, req: &SpotOrderRequest) -> Result<SpotOrderResult, ConnectorError>;

    async fn can_trade_spot_pair(&self, base: &str, quote: &str) -> Result<bool, ConnectorError>;

    // Нужен для LONG_PERP_SHORT_SPOT: без займа шортить спот нечем.
    async fn spot_borrow_enabled(&self, base: &str) -> Result<bool, ConnectorError>;
}
