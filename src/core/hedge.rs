// src/core/hedge.rs
use crate::connectors::traits::Broker;
use crate::error::ConnectorError;
use crate::strategies::gate::direction_precheck;
use crate::types::{
    CarrySide, OrderResult, PerpOrderRequest, PositionRecord, Side, Snapshot, SpotOrderRequest,
    SpotOrderResult, SpotSizing,
};
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlanKind {
    Open,
    Close,
}

impl PlanKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PlanKind::Open => "OPEN",
            PlanKind::Close => "CLOSE",
        }
    }
}

impl fmt::Display for PlanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Intent for one hedge, built from a snapshot. Nothing is sent while building it.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderPlan {
    pub kind: PlanKind,
    pub coin: String,
    pub side: CarrySide,
    pub notional: Decimal,
    pub quote: String,
    pub ts: i64,
    pub reason: String,
    pub funding: Option<f64>,
    pub premium: Option<f64>,
}

impl OrderPlan {
    pub fn reduce_only(&self) -> bool {
        self.kind == PlanKind::Close
    }

    /// Perp order direction for this plan.
    pub fn perp_side(&self) -> Side {
        match self.kind {
            PlanKind::Open => self.side.perp_open(),
            PlanKind::Close => self.side.perp_open().opposite(),
        }
    }

    pub fn spot_side(&self) -> Side {
        match self.kind {
            PlanKind::Open => self.side.spot_open(),
            PlanKind::Close => self.side.spot_open().opposite(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HedgeStage {
    Planned,
    Leg1Sent,
    Leg1Verified,
    Leg1Failed,
    Leg2Sent,
    Leg2Verified,
    Leg2Failed,
    RollbackAttempted,
    RolledBack,
    RollbackFailed,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum HedgeFailure {
    #[error("spot_leg_failed: {0}")]
    SpotLegFailed(String),

    #[error("perp_leg_failed_after_spot_rolled_back: {0}")]
    PerpLegFailedRolledBack(String),

    #[error("rollback_failed: {0}")]
    RollbackFailed(String),

    #[error("perp_close_failed: {0}")]
    PerpCloseFailed(String),

    #[error("spot_close_failed_manual_intervention: {0}")]
    SpotCloseFailed(String),

    #[error("unsupported_branch: {0}")]
    Unsupported(String),

    #[error("direction_mismatch: {0}")]
    DirectionMismatch(String),

    #[error("duplicate_intent")]
    Duplicate,

    #[error("live_disabled: {0}")]
    LiveDisabled(String),
}

impl HedgeFailure {
    /// Failures that leave the book in an unknown or one-legged state.
    pub fn is_desync(&self) -> bool {
        matches!(
            self,
            HedgeFailure::SpotLegFailed(_)
                | HedgeFailure::PerpLegFailedRolledBack(_)
                | HedgeFailure::RollbackFailed(_)
                | HedgeFailure::PerpCloseFailed(_)
                | HedgeFailure::SpotCloseFailed(_)
        )
    }
}

#[derive(Debug, Clone)]
pub struct HedgeResult {
    pub plan: OrderPlan,
    pub ok: bool,
    pub stages: Vec<HedgeStage>,
    pub failure: Option<HedgeFailure>,
    pub perp: Option<OrderResult>,
    pub spot: Option<SpotOrderResult>,
    pub rollback: Option<SpotOrderResult>,
    /// Reduce-only unwind of a partially filled perp open.
    pub perp_rollback: Option<OrderResult>,
    /// Perp position observed after the perp leg.
    pub perp_after: Option<PositionRecord>,
}

impl HedgeResult {
    fn new(plan: &OrderPlan) -> Self {
        Self {
            plan: plan.clone(),
            ok: false,
            stages: vec![HedgeStage::Planned],
            failure: None,
            perp: None,
            spot: None,
            rollback: None,
            perp_rollback: None,
            perp_after: None,
        }
    }

    fn stage(&mut self, stage: HedgeStage) {
        self.stages.push(stage);
    }

    fn fail(mut self, failure: HedgeFailure) -> Self {
        self.ok = false;
        self.failure = Some(failure);
        self
    }

    pub fn last_stage(&self) -> HedgeStage {
        self.stages.last().copied().unwrap_or(HedgeStage::Planned)
    }

    pub fn reason(&self) -> String {
        match &self.failure {
            Some(f) => f.to_string(),
            None => "ok".to_string(),
        }
    }
}

type DedupKey = (PlanKind, String, CarrySide, i64);

struct SpotLeg {
    result: Option<SpotOrderResult>,
    /// Observed base balance change.
    moved: Decimal,
    verified: bool,
    reason: String,
}

struct PerpLeg {
    result: Option<OrderResult>,
    after: Option<PositionRecord>,
    /// Observed signed size change.
    moved: Decimal,
    verified: bool,
    reason: String,
}

/// Outcome of a manual reduce-only perp close.
#[derive(Debug, Clone)]
pub enum ForceClose {
    NoPositions,
    NotFound(String),
    Sent {
        coin: String,
        size: Decimal,
        result: Option<OrderResult>,
        verified: bool,
        reason: String,
        remaining: Option<PositionRecord>,
    },
}

/// Sequences the two legs of a hedge and checks each against the broker's books.
pub struct HedgeExecutor {
    broker: Arc<dyn Broker>,
    notional: Decimal,
    quote: String,
    tolerance: Decimal,
    dedup_bucket_ms: i64,
    live: bool,
    desync: Option<String>,
    seen: HashSet<DedupKey>,
}

impl HedgeExecutor {
    pub fn new(
        broker: Arc<dyn Broker>,
        notional: Decimal,
        quote: &str,
        verify_tolerance: f64,
        dedup_bucket_ms: i64,
        live: bool,
    ) -> Self {
        info!(
            "HedgeExecutor initialized | notional=${} | spot_quote={} | live={}",
            notional,
            quote.to_uppercase(),
            live
        );
        Self {
            broker,
            notional,
            quote: quote.trim().to_uppercase(),
            tolerance: Decimal::from_f64(verify_tolerance.clamp(0.0, 1.0)).unwrap_or(Decimal::ZERO),
            dedup_bucket_ms: dedup_bucket_ms.max(1),
            live,
            desync: None,
            seen: HashSet::new(),
        }
    }

    /// Orders are sent only while live and not desynced.
    pub fn is_live(&self) -> bool {
        self.live && self.desync.is_none()
    }

    pub fn desync_reason(&self) -> Option<&str> {
        self.desync.as_deref()
    }

    pub fn disable_live(&mut self, reason: &str) {
        if self.desync.is_none() {
            error!("🛑 EXECUTION_DESYNC_ABORT | live trading disabled | reason={}", reason);
            self.desync = Some(reason.to_string());
        }
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Builds and logs the plan. Always safe.
    pub fn preview(&self, snap: &Snapshot, kind: PlanKind, side: CarrySide, reason: &str) -> OrderPlan {
        let plan = OrderPlan {
            kind,
            coin: snap.coin.clone(),
            side,
            notional: self.notional,
            quote: self.quote.clone(),
            ts: snap.time,
            reason: reason.to_string(),
            funding: snap.funding_rate,
            premium: snap.premium,
        };
        info!(
            "ORDER_INTENT | kind={} coin={} side={} notional=${} ts={} | reason={}",
            plan.kind, plan.coin, plan.side, plan.notional, plan.ts, plan.reason
        );
        info!(
            "ORDER_PLAN | kind={} coin={} perp={} spot={} {}/{} reduce_only={}",
            plan.kind,
            plan.coin,
            plan.perp_side().as_str(),
            plan.spot_side().as_str(),
            plan.coin,
            plan.quote,
            plan.reduce_only()
        );
        if !self.is_live() {
            warn!("SAFE_MODE=ON | No orders will be sent. Plan only.");
        }
        plan
    }

    fn dedup_key(&self, plan: &OrderPlan) -> DedupKey {
        (
            plan.kind,
            plan.coin.clone(),
            plan.side,
            plan.ts.div_euclid(self.dedup_bucket_ms),
        )
    }

    pub async fn execute(&mut self, plan: &OrderPlan) -> HedgeResult {
        let result = HedgeResult::new(plan);

        if !self.live {
            return result.fail(HedgeFailure::LiveDisabled("safe_mode".to_string()));
        }
        if let Some(reason) = &self.desync {
            return result.fail(HedgeFailure::LiveDisabled(reason.clone()));
        }
        let key = self.dedup_key(plan);
        if self.seen.contains(&key) {
            warn!("Duplicate intent skipped | kind={} coin={} ts={}", plan.kind, plan.coin, plan.ts);
            return result.fail(HedgeFailure::Duplicate);
        }

        let result = match plan.kind {
            PlanKind::Open => self.execute_open(plan, key, result).await,
            PlanKind::Close => self.execute_close(plan, key, result).await,
        };

        match &result.failure {
            Some(f) if f.is_desync() => self.disable_live(&f.to_string()),
            Some(f) => warn!("Hedge refused | kind={} coin={} reason={}", plan.kind, plan.coin, f),
            None => info!(
                "✅ Hedge complete | kind={} coin={} side={} stages={:?}",
                plan.kind, plan.coin, plan.side, result.stages
            ),
        }
        result
    }

    async fn execute_open(&mut self, plan: &OrderPlan, key: DedupKey, mut result: HedgeResult) -> HedgeResult {
        if !direction_precheck(plan.side, plan.funding) {
            return result.fail(HedgeFailure::DirectionMismatch(format!(
                "{} does not receive funding {:?}",
                plan.side, plan.funding
            )));
        }
        match self.broker.can_trade_spot_pair(&plan.coin, &plan.quote).await {
            Ok(true) => {}
            Ok(false) => {
                return result.fail(HedgeFailure::Unsupported(format!(
                    "spot_pair_not_tradable {}/{}",
                    plan.coin, plan.quote
                )))
            }
            Err(e) => {
                return result.fail(HedgeFailure::Unsupported(format!(
                    "spot_pair_check_failed {}/{}: {}",
                    plan.coin, plan.quote, e
                )))
            }
        }
        if plan.side == CarrySide::LongPerpShortSpot {
            match self.broker.spot_borrow_enabled(&plan.coin).await {
                Ok(true) => {}
                Ok(false) => {
                    return result.fail(HedgeFailure::Unsupported(
                        "long_perp_short_spot_requires_spot_borrow".to_string(),
                    ))
                }
                Err(e) => {
                    return result.fail(HedgeFailure::Unsupported(format!(
                        "spot_borrow_unconfirmed: {}",
                        e
                    )))
                }
            }
        }

        self.seen.insert(key);

        // Leg 1: spot
        result.stage(HedgeStage::Leg1Sent);
        warn!(
            "LIVE ORDER SENT | OPEN {}/{} spot {} ${}",
            plan.coin,
            plan.quote,
            plan.spot_side().as_str(),
            plan.notional
        );
        let spot = self
            .spot_leg(&plan.coin, plan.spot_side(), plan.notional, SpotSizing::Notional)
            .await;
        let spot_size = spot.result.as_ref().map(|r| r.size);
        result.spot = spot.result;
        if !spot.verified {
            result.stage(HedgeStage::Leg1Failed);
            return result.fail(HedgeFailure::SpotLegFailed(spot.reason));
        }
        result.stage(HedgeStage::Leg1Verified);

        // Leg 2: perp
        result.stage(HedgeStage::Leg2Sent);
        warn!(
            "LIVE ORDER SENT | OPEN {} perp {} ${} reduce_only=false",
            plan.coin,
            plan.perp_side().as_str(),
            plan.notional
        );
        let perp = self
            .perp_leg(&PerpOrderRequest {
                coin: plan.coin.clone(),
                side: plan.perp_side(),
                notional: plan.notional,
                reduce_only: false,
                size: None,
            })
            .await;
        result.perp = perp.result;
        result.perp_after = perp.after;
        let perp_reason = if !perp.verified {
            perp.reason
        } else if !self.within_tolerance(perp.moved.abs(), spot.moved.abs()) {
            format!("hedge_size_mismatch perp={} spot={}", perp.moved.abs(), spot.moved.abs())
        } else {
            result.stage(HedgeStage::Leg2Verified);
            result.ok = true;
            return result;
        };

        result.stage(HedgeStage::Leg2Failed);
        error!("HEDGE_ROLLBACK | perp open failed after spot open, unwinding | reason={}", perp_reason);
        result.stage(HedgeStage::RollbackAttempted);

        // partial perp fill goes first
        let mut unwind_failures = Vec::new();
        if !perp.moved.is_zero() {
            let undo = self
                .perp_leg(&PerpOrderRequest {
                    coin: plan.coin.clone(),
                    side: plan.perp_side().opposite(),
                    notional: plan.notional,
                    reduce_only: true,
                    size: Some(perp.moved.abs()),
                })
                .await;
            result.perp_rollback = undo.result;
            result.perp_after = undo.after;
            if !undo.verified {
                unwind_failures.push(format!("perp unwind: {}", undo.reason));
            }
        }

        let sizing = match plan.side {
            CarrySide::ShortPerpLongSpot => SpotSizing::AvailableBalance,
            CarrySide::LongPerpShortSpot => SpotSizing::Exact(spot_size.unwrap_or(Decimal::ZERO)),
        };
        let rollback = self
            .spot_leg(&plan.coin, plan.spot_side().opposite(), plan.notional, sizing)
            .await;
        result.rollback = rollback.result;
        if !rollback.verified {
            unwind_failures.push(format!("spot unwind: {}", rollback.reason));
        }

        if unwind_failures.is_empty() {
            result.stage(HedgeStage::RolledBack);
            result.fail(HedgeFailure::PerpLegFailedRolledBack(perp_reason))
        } else {
            let unwind = unwind_failures.join("; ");
            error!("HEDGE_ROLLBACK_FAIL | {}", unwind);
            result.stage(HedgeStage::RollbackFailed);
            result.fail(HedgeFailure::RollbackFailed(format!("perp: {}; {}", perp_reason, unwind)))
        }
    }

    async fn execute_close(&mut self, plan: &OrderPlan, key: DedupKey, mut result: HedgeResult) -> HedgeResult {
        let held = match self.perp_size(&plan.coin).await {
            Ok(sz) => sz,
            Err(e) => {
                return result.fail(HedgeFailure::PerpCloseFailed(format!("position query failed: {}", e)))
            }
        };
        match CarrySide::from_perp_size(held) {
            Some(side) if side == plan.side => {}
            Some(side) => {
                return result.fail(HedgeFailure::DirectionMismatch(format!(
                    "exchange holds {} but plan closes {}",
                    side, plan.side
                )))
            }
            None => {
                self.seen.insert(key);
                result.stage(HedgeStage::Leg1Failed);
                return result.fail(HedgeFailure::PerpCloseFailed("no_perp_position_on_exchange".to_string()));
            }
        }

        self.seen.insert(key);

        // Leg 1: perp, reduce-only, exact held size
        result.stage(HedgeStage::Leg1Sent);
        warn!(
            "LIVE ORDER SENT | CLOSE {} perp {} sz={} reduce_only=true",
            plan.coin,
            plan.perp_side().as_str(),
            held.abs()
        );
        let perp = self
            .perp_leg(&PerpOrderRequest {
                coin: plan.coin.clone(),
                side: plan.perp_side(),
                notional: plan.notional,
                reduce_only: true,
                size: Some(held.abs()),
            })
            .await;
        result.perp = perp.result;
        result.perp_after = perp.after;
        if !perp.verified {
            result.stage(HedgeStage::Leg1Failed);
            return result.fail(HedgeFailure::PerpCloseFailed(perp.reason));
        }
        result.stage(HedgeStage::Leg1Verified);

        // Leg 2: spot
        let sizing = match plan.side {
            CarrySide::ShortPerpLongSpot => SpotSizing::AvailableBalance,
            CarrySide::LongPerpShortSpot => {
                let deficit = match self.base_balance(&plan.coin).await {
                    Ok(bal) if bal < Decimal::ZERO => -bal,
                    _ => held.abs(),
                };
                SpotSizing::Exact(deficit)
            }
        };
        result.stage(HedgeStage::Leg2Sent);
        warn!(
            "LIVE ORDER SENT | CLOSE {}/{} spot {} {:?}",
            plan.coin,
            plan.quote,
            plan.spot_side().as_str(),
            sizing
        );
        let spot = self.spot_leg(&plan.coin, plan.spot_side(), plan.notional, sizing).await;
        result.spot = spot.result;
        if !spot.verified {
            error!("HEDGE_CLOSE_WARN | perp closed but spot close failed; manual spot check required");
            result.stage(HedgeStage::Leg2Failed);
            return result.fail(HedgeFailure::SpotCloseFailed(spot.reason));
        }
        result.stage(HedgeStage::Leg2Verified);
        result.ok = true;
        result
    }

    async fn perp_record(&self, coin: &str) -> Result<Option<PositionRecord>, ConnectorError> {
        let positions = self.broker.get_positions(Some(coin)).await?;
        Ok(positions
            .into_iter()
            .find(|p| p.coin.eq_ignore_ascii_case(coin) && !p.signed_size.is_zero()))
    }

    async fn perp_size(&self, coin: &str) -> Result<Decimal, ConnectorError> {
        Ok(self
            .perp_record(coin)
            .await?
            .map_or(Decimal::ZERO, |p| p.signed_size))
    }

    async fn base_balance(&self, coin: &str) -> Result<Decimal, ConnectorError> {
        let balances = self.broker.get_spot_balances().await?;
        Ok(balances
            .get(&coin.to_uppercase())
            .copied()
            .unwrap_or(Decimal::ZERO))
    }

    /// Signed `delta` must point the way of `side` and cover `expected` within tolerance.
    fn moved_enough(&self, side: Side, delta: Decimal, expected: Decimal) -> bool {
        let directed = match side {
            Side::Buy => delta,
            Side::Sell => -delta,
        };
        if directed <= Decimal::ZERO {
            return false;
        }
        directed >= expected.abs() * (Decimal::ONE - self.tolerance)
    }

    /// Two unsigned quantities agree within tolerance of the larger one.
    fn within_tolerance(&self, a: Decimal, b: Decimal) -> bool {
        (a - b).abs() <= a.max(b) * self.tolerance
    }

    /// Manual reduce-only close of the perp on `coin` (or the first open perp) at its exact size.
    /// Runs whether or not live trading is enabled; the spot leg is left to the operator.
    pub async fn force_close(&self, coin: Option<&str>) -> Result<ForceClose, ConnectorError> {
        let positions: Vec<PositionRecord> = self
            .broker
            .get_positions(None)
            .await?
            .into_iter()
            .filter(|p| !p.signed_size.is_zero())
            .collect();
        if positions.is_empty() {
            info!("FORCE_CLOSE | no open positions on exchange");
            return Ok(ForceClose::NoPositions);
        }
        let picked = match coin {
            Some(c) => positions.iter().find(|p| p.coin.eq_ignore_ascii_case(c)),
            None => positions.first(),
        };
        let Some(pos) = picked else {
            let wanted = coin.unwrap_or_default().to_string();
            warn!("FORCE_CLOSE | no position found for coin={}", wanted);
            return Ok(ForceClose::NotFound(wanted));
        };

        let side = if pos.signed_size > Decimal::ZERO { Side::Sell } else { Side::Buy };
        let size = pos.signed_size.abs();
        warn!("FORCE_CLOSE | sending reduce-only close | coin={} side={} sz={}", pos.coin, side.as_str(), size);
        let leg = self
            .perp_leg(&PerpOrderRequest {
                coin: pos.coin.clone(),
                side,
                notional: self.notional,
                reduce_only: true,
                size: Some(size),
            })
            .await;
        info!(
            "FORCE_CLOSE_AFTER | coin={} verified={} reason={} remaining={:?}",
            pos.coin,
            leg.verified,
            leg.reason,
            leg.after.as_ref().map(|p| p.signed_size)
        );
        Ok(ForceClose::Sent {
            coin: pos.coin.clone(),
            size,
            result: leg.result,
            verified: leg.verified,
            reason: leg.reason,
            remaining: leg.after,
        })
    }

    async fn spot_leg(&self, coin: &str, side: Side, notional: Decimal, sizing: SpotSizing) -> SpotLeg {
        let before = match self.base_balance(coin).await {
            Ok(b) => b,
            Err(e) => {
                return SpotLeg {
                    result: None,
                    moved: Decimal::ZERO,
                    verified: false,
                    reason: format!("balance query failed: {}", e),
                }
            }
        };
        let req = SpotOrderRequest {
            base: coin.to_string(),
            quote: self.quote.clone(),
            side,
            notional,
            sizing,
        };
        let res = match self.broker.place_spot_order(&req).await {
            Ok(r) => r,
            Err(e) => {
                return SpotLeg {
                    result: None,
                    moved: Decimal::ZERO,
                    verified: false,
                    reason: format!("spot order error: {}", e),
                }
            }
        };
        if !res.ok {
            let reason = format!("spot order not ok: {}", res.reason);
            return SpotLeg {
                result: Some(res),
                moved: Decimal::ZERO,
                verified: false,
                reason,
            };
        }
        let after = match self.base_balance(coin).await {
            Ok(b) => b,
            Err(e) => {
                return SpotLeg {
                    result: Some(res),
                    moved: Decimal::ZERO,
                    verified: false,
                    reason: format!("balance re-query failed: {}", e),
                }
            }
        };
        let delta = after - before;
        let verified = self.moved_enough(side, delta, res.size);
        info!(
            "SPOT_VERIFY | {} {} sz={} base {} -> {} verified={}",
            coin,
            side.as_str(),
            res.size,
            before,
            after,
            verified
        );
        let reason = if verified {
            "base_balance_changed".to_string()
        } else if delta.is_zero() {
            "base_balance_unchanged".to_string()
        } else {
            format!("base_balance_short (delta={} expected={})", delta, res.size)
        };
        SpotLeg {
            result: Some(res),
            moved: delta,
            verified,
            reason,
        }
    }

    async fn perp_leg(&self, req: &PerpOrderRequest) -> PerpLeg {
        let failed = |result: Option<OrderResult>, after: Option<PositionRecord>, reason: String| PerpLeg {
            result,
            after,
            moved: Decimal::ZERO,
            verified: false,
            reason,
        };

        let before = match self.perp_size(&req.coin).await {
            Ok(sz) => sz,
            Err(e) => return failed(None, None, format!("position query failed: {}", e)),
        };
        let res = match self.broker.place_perp_order(req).await {
            Ok(r) => r,
            Err(e) => return failed(None, None, format!("perp order error: {}", e)),
        };
        if !res.ok {
            let reason = format!("perp order not ok: {}", res.reason);
            return failed(Some(res), None, reason);
        }
        let after_rec = match self.perp_record(&req.coin).await {
            Ok(r) => r,
            Err(e) => return failed(Some(res), None, format!("position re-query failed: {}", e)),
        };
        let after = after_rec.as_ref().map_or(Decimal::ZERO, |p| p.signed_size);
        let moved = after - before;

        let (verified, reason) = if req.reduce_only && before.is_zero() {
            (false, "reduce_only_with_no_position".to_string())
        } else if moved.is_zero() {
            let tag = if req.reduce_only { "position_not_reduced" } else { "position_not_changed" };
            (false, tag.to_string())
        } else if req.reduce_only && after.abs() >= before.abs() {
            (false, "position_not_reduced".to_string())
        } else if !self.moved_enough(req.side, moved, res.size) {
            (false, format!("partial_fill moved={} expected={}", moved, res.size))
        } else if req.reduce_only {
            (true, "reduced_position".to_string())
        } else {
            let tag = match req.side {
                Side::Buy => "increased_long",
                Side::Sell => "increased_short",
            };
            (true, tag.to_string())
        };

        info!(
            "PERP_VERIFY | {} {} sz={} szi {} -> {} verified={} reason={}",
            req.coin,
            req.side.as_str(),
            res.size,
            before,
            after,
            verified,
            reason
        );

        PerpLeg {
            result: Some(res),
            after: after_rec,
            moved,
            verified,
            reason,
        }
    }
}
