// src/connectors/paper.rs
use crate::config::PaperConfig;
use crate::connectors::hyperliquid::HyperliquidClient;
use crate::connectors::traits::Broker;
use crate::error::ConnectorError;
use crate::types::{
    OrderResult, PerpOrderRequest, PositionRecord, Side, SpotOrderRequest, SpotOrderResult,
    SpotSizing,
};
use crate::utils::precision::{normalize_quantity, size_for_notional, step_from_decimals};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};
use uuid::Uuid;

/// Injected misbehaviour for the next order on a venue.
#[derive(Debug, Clone)]
pub enum Fault {
    /// Fills normally. Lets a later fault in the queue target a specific order.
    Pass,
    /// Exchange answers with an error status, nothing fills.
    Reject,
    /// Exchange answers "ok" but the book does not change.
    AckWithoutFill,
    /// Only this fraction of the size fills; the answer still reports the full size.
    PartialFill(Decimal),
    /// Transport-level failure.
    Error(ConnectorError),
}

pub enum MidSource {
    Fixed(Mutex<HashMap<String, Decimal>>),
    Live(Arc<HyperliquidClient>),
}

#[derive(Debug, Default)]
struct Book {
    // coin -> (signed size, entry px)
    perps: HashMap<String, (Decimal, Decimal)>,
    balances: HashMap<String, Decimal>,
}

/// In-memory venue filling market orders at mid. Used for paper runs and tests.
pub struct PaperBroker {
    quote: String,
    size_decimals: u32,
    spot_borrow: bool,
    spot_pairs: Option<HashSet<String>>,
    mids: MidSource,
    book: Mutex<Book>,
    perp_faults: Mutex<VecDeque<Fault>>,
    spot_faults: Mutex<VecDeque<Fault>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl PaperBroker {
    pub fn new(cfg: &PaperConfig, quote: &str, mids: MidSource) -> Self {
        let mut book = Book::default();
        book.balances
            .insert(quote.to_uppercase(), cfg.quote_balance);
        Self {
            quote: quote.to_uppercase(),
            size_decimals: cfg.size_decimals,
            spot_borrow: cfg.spot_borrow,
            spot_pairs: None,
            mids,
            book: Mutex::new(book),
            perp_faults: Mutex::new(VecDeque::new()),
            spot_faults: Mutex::new(VecDeque::new()),
        }
    }

    pub fn with_fixed_mids(cfg: &PaperConfig, quote: &str, mids: &[(&str, Decimal)]) -> Self {
        let map: HashMap<String, Decimal> = mids
            .iter()
            .map(|(c, px)| (c.to_uppercase(), *px))
            .collect();
        Self::new(cfg, quote, MidSource::Fixed(Mutex::new(map)))
    }

    /// Restricts tradable spot bases. Without this every base is tradable.
    pub fn with_spot_pairs(mut self, bases: &[&str]) -> Self {
        self.spot_pairs = Some(bases.iter().map(|b| b.to_uppercase()).collect());
        self
    }

    pub fn set_mid(&self, coin: &str, px: Decimal) {
        if let MidSource::Fixed(m) = &self.mids {
            lock(m).insert(coin.to_uppercase(), px);
        }
    }

    pub fn inject_perp_fault(&self, fault: Fault) {
        lock(&self.perp_faults).push_back(fault);
    }

    pub fn inject_spot_fault(&self, fault: Fault) {
        lock(&self.spot_faults).push_back(fault);
    }

    pub fn seed_perp(&self, coin: &str, signed_size: Decimal, entry_px: Decimal) {
        lock(&self.book)
            .perps
            .insert(coin.to_uppercase(), (signed_size, entry_px));
    }

    pub fn seed_balance(&self, asset: &str, amount: Decimal) {
        lock(&self.book)
            .balances
            .insert(asset.to_uppercase(), amount);
    }

    async fn mid(&self, coin: &str) -> Result<Decimal, ConnectorError> {
        let coin = coin.to_uppercase();
        let px = match &self.mids {
            MidSource::Fixed(m) => {
                let px = lock(m).get(&coin).copied();
                px
            }
            MidSource::Live(client) => client.all_mids().await?.get(&coin).copied(),
        };
        match px {
            Some(p) if p > Decimal::ZERO => Ok(p),
            _ => Err(ConnectorError::Unavailable(format!(
                "mid price not available for {}",
                coin
            ))),
        }
    }

    fn record(coin: &str, entry: Option<&(Decimal, Decimal)>) -> Option<PositionRecord> {
        entry.filter(|(sz, _)| !sz.is_zero()).map(|(sz, px)| PositionRecord {
            coin: coin.to_string(),
            signed_size: *sz,
            entry_price: Some(*px),
            unrealized_pnl: None,
        })
    }

    fn fill_raw(size: Decimal, px: Decimal) -> serde_json::Value {
        json!({
            "status": "ok",
            "response": {"type": "order", "data": {"statuses": [
                {"filled": {"totalSz": size.to_string(), "avgPx": px.to_string()}}
            ]}}
        })
    }

    fn rejected(
        reason: &str,
        mid: Decimal,
        size: Decimal,
        before: Option<PositionRecord>,
        cloid: Option<String>,
    ) -> OrderResult {
        OrderResult {
            ok: false,
            verified: false,
            reason: reason.to_string(),
            raw: Self::error_raw(reason),
            mid_price: mid,
            size,
            after: before.clone(),
            before,
            cloid,
        }
    }

    fn error_raw(msg: &str) -> serde_json::Value {
        json!({
            "status": "ok",
            "response": {"type": "order", "data": {"statuses": [{"error": msg}]}}
        })
    }
}

#[async_trait]
impl Broker for PaperBroker {
    async fn get_positions(&self, coin: Option<&str>) -> Result<Vec<PositionRecord>, ConnectorError> {
        let book = lock(&self.book);
        let mut out: Vec<PositionRecord> = book
            .perps
            .iter()
            .filter(|(c, _)| coin.map_or(true, |want| want.eq_ignore_ascii_case(c)))
            .filter_map(|(c, entry)| Self::record(c, Some(entry)))
            .collect();
        out.sort_by(|a, b| a.coin.cmp(&b.coin));
        Ok(out)
    }

    async fn get_spot_balances(&self) -> Result<HashMap<String, Decimal>, ConnectorError> {
        Ok(lock(&self.book).balances.clone())
    }

    async fn place_perp_order(&self, req: &PerpOrderRequest) -> Result<OrderResult, ConnectorError> {
        let coin = req.coin.to_uppercase();
        let fault = lock(&self.perp_faults).pop_front();
        if let Some(Fault::Error(e)) = &fault {
            return Err(e.clone());
        }

        let mid = self.mid(&coin).await?;
        let step = step_from_decimals(self.size_decimals);
        let mut size = match req.size {
            Some(sz) => normalize_quantity(sz.abs(), step),
            None => size_for_notional(req.notional, mid, self.size_decimals),
        };
        if size <= Decimal::ZERO {
            return Err(ConnectorError::Rejected(format!(
                "order size too small after rounding | coin={} notional={}",
                coin, req.notional
            )));
        }

        let cloid = Some(format!("0x{}", Uuid::new_v4().simple()));
        let mut book = lock(&self.book);
        let before = Self::record(&coin, book.perps.get(&coin));
        let before_sz = before.as_ref().map_or(Decimal::ZERO, |p| p.signed_size);

        if req.reduce_only {
            if before_sz.is_zero() {
                return Ok(Self::rejected("reduce_only_with_no_position", mid, size, before, cloid));
            }
            let reduces = (req.side == Side::Buy && before_sz < Decimal::ZERO)
                || (req.side == Side::Sell && before_sz > Decimal::ZERO);
            if !reduces {
                return Ok(Self::rejected("reduce_only_would_increase", mid, size, before, cloid));
            }
            size = size.min(before_sz.abs());
        }

        match fault {
            Some(Fault::Reject) => {
                return Ok(Self::rejected("rejected_by_exchange", mid, size, before, cloid))
            }
            Some(Fault::AckWithoutFill) => {
                warn!("PAPER perp ack without fill | coin={}", coin);
                return Ok(OrderResult {
                    ok: true,
                    verified: false,
                    reason: "position_not_changed".to_string(),
                    raw: Self::fill_raw(Decimal::ZERO, mid),
                    mid_price: mid,
                    size,
                    after: before.clone(),
                    before,
                    cloid,
                });
            }
            _ => {}
        }

        let filled = match &fault {
            Some(Fault::PartialFill(ratio)) => normalize_quantity(size * *ratio, step),
            _ => size,
        };
        let delta = match req.side {
            Side::Buy => filled,
            Side::Sell => -filled,
        };
        let after_sz = before_sz + delta;
        let entry_px = match book.perps.get(&coin) {
            // Наращиваем позицию: средневзвешенная цена входа
            Some((sz, px)) if !sz.is_zero() && sz.is_sign_negative() == delta.is_sign_negative() => {
                (sz.abs() * *px + filled * mid) / (sz.abs() + filled)
            }
            Some((sz, px)) if !sz.is_zero() && after_sz.is_sign_negative() == sz.is_sign_negative() => *px,
            _ => mid,
        };
        if after_sz.is_zero() {
            book.perps.remove(&coin);
        } else {
            book.perps.insert(coin.clone(), (after_sz, entry_px));
        }
        let after = Self::record(&coin, book.perps.get(&coin));

        info!(
            "PAPER perp fill | {} {} sz={} @ {} reduce_only={} szi {} -> {}",
            coin,
            req.side.as_str(),
            filled,
            mid,
            req.reduce_only,
            before_sz,
            after_sz
        );

        Ok(OrderResult {
            ok: true,
            verified: true,
            reason: if req.reduce_only {
                "reduced_position".to_string()
            } else if req.side == Side::Buy {
                "increased_long".to_string()
            } else {
                "increased_short".to_string()
            },
            raw: Self::fill_raw(filled, mid),
            mid_price: mid,
            size,
            before,
            after,
            cloid,
        })
    }

    async fn place_spot_order(&self, req: &SpotOrderRequest) -> Result<SpotOrderResult, ConnectorError> {
        let base = req.base.to_uppercase();
        let quote = req.quote.to_uppercase();
        let pair = format!("{}/{}", base, quote);

        if !self.can_trade_spot_pair(&base, &quote).await? {
            return Err(ConnectorError::Rejected(format!("spot pair not found: {}", pair)));
        }

        let fault = lock(&self.spot_faults).pop_front();
        if let Some(Fault::Error(e)) = &fault {
            return Err(e.clone());
        }

        let mid = self.mid(&base).await?;
        let step = step_from_decimals(self.size_decimals);
        let mut book = lock(&self.book);
        let before_base = book.balances.get(&base).copied().unwrap_or(Decimal::ZERO);
        let before_quote = book.balances.get(&quote).copied().unwrap_or(Decimal::ZERO);

        let size = match req.sizing {
            SpotSizing::Notional => size_for_notional(req.notional, mid, self.size_decimals),
            SpotSizing::AvailableBalance if req.side == Side::Sell => {
                normalize_quantity(before_base.max(Decimal::ZERO), step)
            }
            SpotSizing::AvailableBalance => size_for_notional(req.notional, mid, self.size_decimals),
            SpotSizing::Exact(sz) => normalize_quantity(sz.abs(), step),
        };
        if size <= Decimal::ZERO {
            return Err(ConnectorError::Rejected(format!(
                "spot order size too small after rounding | pair={}",
                pair
            )));
        }

        let cloid = Some(format!("0x{}", Uuid::new_v4().simple()));
        let result = |ok: bool, verified: bool, reason: &str, after: Decimal, raw: serde_json::Value| SpotOrderResult {
            ok,
            verified,
            reason: reason.to_string(),
            raw,
            pair: pair.clone(),
            side: req.side,
            mid_price: mid,
            size,
            before_balance: Some(before_base),
            after_balance: Some(after),
            cloid: cloid.clone(),
        };

        match fault {
            Some(Fault::Reject) => {
                return Ok(result(false, false, "rejected_by_exchange", before_base, Self::error_raw("rejected")))
            }
            Some(Fault::AckWithoutFill) => {
                warn!("PAPER spot ack without fill | pair={}", pair);
                return Ok(result(
                    true,
                    false,
                    "base_balance_unchanged",
                    before_base,
                    Self::fill_raw(Decimal::ZERO, mid),
                ));
            }
            _ => {}
        }

        let filled = match &fault {
            Some(Fault::PartialFill(ratio)) => normalize_quantity(size * *ratio, step),
            _ => size,
        };
        let cost = filled * mid;
        let after_base = match req.side {
            Side::Buy => {
                if before_quote < cost {
                    return Ok(result(
                        false,
                        false,
                        "insufficient_quote_balance",
                        before_base,
                        Self::error_raw("insufficient balance"),
                    ));
                }
                book.balances.insert(quote.clone(), before_quote - cost);
                before_base + filled
            }
            Side::Sell => {
                if before_base < filled && !self.spot_borrow {
                    return Ok(result(
                        false,
                        false,
                        "insufficient_base_balance",
                        before_base,
                        Self::error_raw("insufficient balance"),
                    ));
                }
                book.balances.insert(quote.clone(), before_quote + cost);
                before_base - filled
            }
        };
        book.balances.insert(base.clone(), after_base);

        info!(
            "PAPER spot fill | {} {} sz={} @ {} base {} -> {}",
            pair,
            req.side.as_str(),
            filled,
            mid,
            before_base,
            after_base
        );

        Ok(result(true, true, "base_balance_changed", after_base, Self::fill_raw(filled, mid)))
    }

    async fn can_trade_spot_pair(&self, base: &str, quote: &str) -> Result<bool, ConnectorError> {
        if !quote.eq_ignore_ascii_case(&self.quote) {
            return Ok(false);
        }
        Ok(self
            .spot_pairs
            .as_ref()
            .map_or(true, |pairs| pairs.contains(&base.to_uppercase())))
    }

    async fn spot_borrow_enabled(&self, _base: &str) -> Result<bool, ConnectorError> {
        Ok(self.spot_borrow)
    }
}
