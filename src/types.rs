// src/types.rs
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Направление ордера на бирже (одна нога хеджа).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

/// Which way the carry is held. Exactly one side receives funding for a given sign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CarrySide {
    ShortPerpLongSpot,
    LongPerpShortSpot,
}

impl CarrySide {
    /// Positive funding: longs pay shorts.
    pub fn receives(self, funding: f64) -> bool {
        match self {
            CarrySide::ShortPerpLongSpot => funding > 0.0,
            CarrySide::LongPerpShortSpot => funding < 0.0,
        }
    }

    /// Perp order direction when opening.
    pub fn perp_open(self) -> Side {
        match self {
            CarrySide::ShortPerpLongSpot => Side::Sell,
            CarrySide::LongPerpShortSpot => Side::Buy,
        }
    }

    /// Spot order direction when opening.
    pub fn spot_open(self) -> Side {
        self.perp_open().opposite()
    }

    /// Side implied by a signed perp size reported by the exchange.
    pub fn from_perp_size(signed_size: Decimal) -> Option<Self> {
        if signed_size < Decimal::ZERO {
            Some(CarrySide::ShortPerpLongSpot)
        } else if signed_size > Decimal::ZERO {
            Some(CarrySide::LongPerpShortSpot)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CarrySide::ShortPerpLongSpot => "SHORT_PERP_LONG_SPOT",
            CarrySide::LongPerpShortSpot => "LONG_PERP_SHORT_SPOT",
        }
    }
}

impl fmt::Display for CarrySide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One funding/premium observation for a coin. `funding_rate` is already sign-normalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub coin: String,
    pub funding_rate: Option<f64>,
    pub premium: Option<f64>,
    pub time: i64,
}

impl Snapshot {
    pub fn new(coin: &str, funding_rate: Option<f64>, premium: Option<f64>, time: i64) -> Self {
        Self {
            coin: coin.to_string(),
            funding_rate,
            premium,
            time,
        }
    }

    /// Premium and funding share a non-zero sign.
    pub fn sign_matched(&self) -> bool {
        match (self.premium, self.funding_rate) {
            (Some(p), Some(f)) => (p > 0.0 && f > 0.0) || (p < 0.0 && f < 0.0),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Open,
    Hold,
    Close,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub action: Action,
    pub side: Option<CarrySide>,
    pub score: f64,
    pub reason: &'static str,
}

impl Decision {
    pub fn hold(side: Option<CarrySide>, score: f64, reason: &'static str) -> Self {
        Self {
            action: Action::Hold,
            side,
            score,
            reason,
        }
    }
}

/// Локальная запись о единственной позиции бота. Меняется только через новые значения.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionState {
    pub coin: String,
    pub side: CarrySide,
    pub is_open: bool,
    pub opened_at_ms: i64,
    #[serde(default)]
    pub entry_premium: f64,
    #[serde(default)]
    pub entry_funding: f64,
    #[serde(default)]
    pub size: Option<Decimal>,
    #[serde(default)]
    pub entry_px: Option<Decimal>,
}

impl PositionState {
    pub fn opened(snap: &Snapshot, side: CarrySide) -> Self {
        Self {
            coin: snap.coin.clone(),
            side,
            is_open: true,
            opened_at_ms: snap.time,
            entry_premium: snap.premium.unwrap_or_default(),
            entry_funding: snap.funding_rate.unwrap_or_default(),
            size: None,
            entry_px: None,
        }
    }

    pub fn with_fill(self, size: Decimal, entry_px: Decimal) -> Self {
        Self {
            size: Some(size),
            entry_px: Some(entry_px),
            ..self
        }
    }

    pub fn closed(&self) -> Self {
        Self {
            is_open: false,
            ..self.clone()
        }
    }
}

/// Perp position as reported by the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionRecord {
    pub coin: String,
    pub signed_size: Decimal,
    pub entry_price: Option<Decimal>,
    pub unrealized_pnl: Option<Decimal>,
}

impl PositionRecord {
    pub fn notional(&self) -> Decimal {
        self.signed_size.abs() * self.entry_price.unwrap_or(Decimal::ONE)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PerpOrderRequest {
    pub coin: String,
    pub side: Side,
    pub notional: Decimal,
    pub reduce_only: bool,
    /// Exact size in base units; overrides notional sizing.
    pub size: Option<Decimal>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SpotSizing {
    Notional,
    AvailableBalance,
    Exact(Decimal),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpotOrderRequest {
    pub base: String,
    pub quote: String,
    pub side: Side,
    pub notional: Decimal,
    pub sizing: SpotSizing,
}

/// Exchange acknowledgement for a perp order. `verified` is the broker's own opinion
/// and is never relied upon by the hedge engine.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderResult {
    pub ok: bool,
    pub verified: bool,
    pub reason: String,
    pub raw: serde_json::Value,
    pub mid_price: Decimal,
    pub size: Decimal,
    pub before: Option<PositionRecord>,
    pub after: Option<PositionRecord>,
    pub cloid: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpotOrderResult {
    pub ok: bool,
    pub verified: bool,
    pub reason: String,
    pub raw: serde_json::Value,
    pub pair: String,
    pub side: Side,
    pub mid_price: Decimal,
    pub size: Decimal,
    pub before_balance: Option<Decimal>,
    pub after_balance: Option<Decimal>,
    pub cloid: Option<String>,
}
