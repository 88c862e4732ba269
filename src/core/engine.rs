// src/core/engine.rs
use crate::config::{AppConfig, FundingMismatchPolicy};
use crate::connectors::traits::{Broker, SnapshotProvider};
use crate::core::guard::{CooldownTracker, FundingCheck, FundingVerdict};
use crate::core::hedge::{HedgeExecutor, PlanKind};
use crate::core::reconcile::reconcile;
use crate::storage::StateStore;
use crate::strategies::funding_premium::SIGN_MISMATCH;
use crate::strategies::gate::{direction_precheck, economic_gate};
use crate::strategies::rotation::{select_best, BestPick};
use crate::strategies::traits::Strategy;
use crate::types::{Action, CarrySide, Decision, PositionRecord, PositionState, Snapshot};
use anyhow::Result;
use chrono::{TimeZone, Utc};
use rust_decimal::prelude::ToPrimitive;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const FAIL_SUMMARY_EVERY_MS: i64 = 60_000;

fn ts(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| ms.to_string())
}

/// OPEN signal waiting for the cycle's rotation pick.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub pick: BestPick,
    pub snapshot: Snapshot,
    pub decision: Decision,
}

pub struct CarryEngine<S> {
    config: AppConfig,
    provider: Arc<dyn SnapshotProvider>,
    strategy: S,
    executor: HedgeExecutor,
    store: StateStore,
    position: Option<PositionState>,
    cooldown: CooldownTracker,
    funding_check: FundingCheck,
    last_seen: HashMap<String, i64>,
    latest: HashMap<String, Snapshot>,
    fail_counts: HashMap<&'static str, u64>,
    last_fail_log_ms: Option<i64>,
}

impl<S> CarryEngine<S>
where
    S: Strategy,
{
    pub fn new(
        config: AppConfig,
        provider: Arc<dyn SnapshotProvider>,
        broker: Arc<dyn Broker>,
        strategy: S,
    ) -> Self {
        let exec = &config.execution;
        let executor = HedgeExecutor::new(
            broker,
            exec.notional_usd,
            &exec.spot_quote,
            exec.verify_tolerance,
            exec.dedup_bucket_ms,
            exec.live,
        );
        Self {
            store: StateStore::new(&config.state_file),
            cooldown: CooldownTracker::new(exec.cooldown_seconds),
            funding_check: FundingCheck::new(&config.funding_check),
            executor,
            provider,
            strategy,
            position: None,
            last_seen: HashMap::new(),
            latest: HashMap::new(),
            fail_counts: HashMap::new(),
            last_fail_log_ms: None,
            config,
        }
    }

    pub fn current_side(&self) -> Option<CarrySide> {
        self.open_position().map(|p| p.side)
    }

    pub fn position(&self) -> Option<&PositionState> {
        self.position.as_ref()
    }

    fn open_position(&self) -> Option<&PositionState> {
        self.position.as_ref().filter(|p| p.is_open)
    }

    /// Live orders still allowed (configured live and no desync so far).
    pub fn live_active(&self) -> bool {
        self.executor.is_live()
    }

    /// Loads persisted state, then lets the exchange overrule it when live.
    pub async fn startup(&mut self, now_ms: i64) {
        let restored = self.store.load().await;
        match restored.as_ref().filter(|p| p.is_open) {
            Some(p) => info!("RESTORED position from state | coin={} side={} opened={}", p.coin, p.side, ts(p.opened_at_ms)),
            None => info!("No open position (FLAT)"),
        }
        self.position = restored;

        if self.config.execution.live {
            self.position = reconcile(
                self.executor.broker().as_ref(),
                &self.store,
                self.position.take(),
                now_ms,
            )
            .await;
        } else {
            info!("LIVE_DISABLED | skipping exchange state sync");
        }

        if let Some((coin, side, opened)) = self.open_position().map(|p| (p.coin.clone(), p.side, p.opened_at_ms)) {
            if let Some(due) = self.funding_check.arm(&coin, side, opened) {
                info!("FUNDING_CHECK armed | coin={} side={} due={}", coin, side, ts(due));
            }
        }
    }

    /// Applies a decision to local state and persists it. Returns a status line.
    pub async fn on_decision(&mut self, snap: &Snapshot, d: &Decision) -> String {
        self.apply_decision(snap, d, None).await
    }

    async fn apply_decision(&mut self, snap: &Snapshot, d: &Decision, fill: Option<&PositionRecord>) -> String {
        match d.action {
            Action::Open => {
                if self.current_side().is_some() {
                    return "OPEN_SKIPPED | already in position".to_string();
                }
                let Some(side) = d.side else {
                    return "OPEN_SKIPPED | missing side".to_string();
                };
                let pos = match fill {
                    Some(PositionRecord {
                        signed_size,
                        entry_price: Some(px),
                        ..
                    }) => PositionState::opened(snap, side).with_fill(signed_size.abs(), *px),
                    _ => PositionState::opened(snap, side),
                };
                self.position = Some(pos);
                self.store.save(self.position.as_ref()).await;
                format!(
                    "OPENED | coin={} side={} premium={:+.6} funding={:+.6}",
                    snap.coin,
                    side,
                    snap.premium.unwrap_or_default(),
                    snap.funding_rate.unwrap_or_default()
                )
            }
            Action::Close => {
                let Some(closed) = self.open_position().map(PositionState::closed) else {
                    return "CLOSE_SKIPPED | already flat".to_string();
                };
                let status = format!("CLOSED | coin={} side={}", closed.coin, closed.side);
                self.position = Some(closed);
                self.store.save(self.position.as_ref()).await;
                status
            }
            Action::Hold => "HOLD | no action".to_string(),
        }
    }

    /// One polling pass over every tracked coin. Returns how many fresh snapshots were processed.
    pub async fn run_cycle(&mut self, now_ms: i64) -> usize {
        let mut fresh: Vec<Snapshot> = Vec::new();
        let mut fetched = 0usize;

        for coin in self.config.coins.clone() {
            let Some(snap) = self.provider.fetch_snapshot(&coin, self.config.lookback_hours).await else {
                continue;
            };
            fetched += 1;
            if self.last_seen.get(&snap.coin) == Some(&snap.time) {
                debug!("Snapshot already processed | coin={} time={}", snap.coin, snap.time);
                continue;
            }
            self.last_seen.insert(snap.coin.clone(), snap.time);
            self.latest.insert(snap.coin.clone(), snap.clone());
            fresh.push(snap);
        }

        // a settlement record seen before the due time never comes back as fresh
        if let Some(held) = self.open_position().cloned() {
            let stale = !fresh.iter().any(|s| s.coin == held.coin);
            if stale && self.funding_check.is_due(&held.coin, now_ms) {
                if let Some(snap) = self.latest.get(&held.coin).cloned() {
                    self.check_funding(&snap, &held, now_ms).await;
                }
            }
        }

        if fetched == 0 {
            warn!("No snapshots fetched this cycle");
            return 0;
        }

        // held coin first, so a close can free the slot for this cycle's candidates
        let held = self.open_position().map(|p| p.coin.clone());
        fresh.sort_by_key(|s| held.as_deref() != Some(s.coin.as_str()));

        let mut candidates = Vec::new();
        for snap in &fresh {
            if let Some(c) = self.process_snapshot(snap, now_ms).await {
                candidates.push(c);
            }
        }
        self.select_and_open(&candidates, now_ms).await;
        fresh.len()
    }

    /// Held coin: funding check and close logic. Other coins: OPEN candidates.
    pub async fn process_snapshot(&mut self, snap: &Snapshot, now_ms: i64) -> Option<Candidate> {
        info!(
            "[DIAG] {} prem={:+.6} fund_signed={:+.6} match={}",
            snap.coin,
            snap.premium.unwrap_or_default(),
            snap.funding_rate.unwrap_or_default(),
            snap.sign_matched()
        );

        if let Some(held) = self.open_position().filter(|p| p.coin == snap.coin).cloned() {
            self.handle_held(snap, &held, now_ms).await;
            return None;
        }

        let d = self.strategy.decide_open(snap);
        if d.action == Action::Open {
            if let Some(side) = d.side {
                return Some(Candidate {
                    pick: BestPick::new(&snap.coin, side, d.score),
                    snapshot: snap.clone(),
                    decision: d,
                });
            }
        }
        self.log_flat_hold(snap, &d, now_ms);
        None
    }

    fn log_flat_hold(&mut self, snap: &Snapshot, d: &Decision, now_ms: i64) {
        *self.fail_counts.entry(d.reason).or_insert(0) += 1;
        let due = self
            .last_fail_log_ms
            .map_or(true, |t| now_ms - t >= FAIL_SUMMARY_EVERY_MS);
        if due {
            if let Some((reason, count)) = self.fail_counts.iter().max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0))) {
                info!("[DEBUG] OPEN_FAIL_MOST | reason={} count={}", reason, count);
            }
            self.last_fail_log_ms = Some(now_ms);
        }

        let tag = self.hold_tag();
        let (Some(prem), Some(fund)) = (snap.premium, snap.funding_rate) else {
            info!("[{}] [{}] HOLD | {} | reason={}", ts(snap.time), snap.coin, tag, d.reason);
            return;
        };
        let (prem_abs, fund_abs) = (prem.abs(), fund.abs());
        let (mut prem_gap, mut fund_gap) = self.strategy.entry_gaps(snap);
        let (prem_tag, fund_tag) = if d.reason == SIGN_MISMATCH {
            prem_gap = 0.0;
            fund_gap = 0.0;
            ("N/A", "N/A")
        } else {
            (
                if prem_gap <= 0.0 { "PASS" } else { "FAIL" },
                if fund_gap <= 0.0 { "PASS" } else { "FAIL" },
            )
        };
        info!(
            "[{}] [{}] HOLD | {} | reason={} | premium={:+.6} abs={:.6} {} gap={:.6} | funding={:+.6} abs={:.6} {} gap={:.6}",
            ts(snap.time), snap.coin, tag, d.reason, prem, prem_abs, prem_tag, prem_gap, fund, fund_abs, fund_tag, fund_gap
        );
    }

    /// Status tag for a coin that is not the held one.
    fn hold_tag(&self) -> String {
        match self.open_position() {
            Some(p) => format!("CANDIDATE(in_position={})", p.coin),
            None => "FLAT".to_string(),
        }
    }

    /// Runs the post-settlement check once due. Returns true when it closed the position.
    async fn check_funding(&mut self, snap: &Snapshot, held: &PositionState, now_ms: i64) -> bool {
        match self.funding_check.evaluate(&snap.coin, snap.funding_rate, snap.time, now_ms) {
            FundingVerdict::NotDue => false,
            FundingVerdict::Received { funding } => {
                info!("FUNDING_CHECK ok | coin={} side={} funding={:+.6}", snap.coin, held.side, funding);
                false
            }
            FundingVerdict::NoData => {
                warn!("FUNDING_CHECK skipped, no funding data | coin={}", snap.coin);
                false
            }
            FundingVerdict::Mismatch { funding } => {
                error!(
                    "FUNDING_CHECK_MISMATCH | coin={} side={} pays funding={:+.6} policy={:?}",
                    snap.coin,
                    held.side,
                    funding,
                    self.funding_check.policy()
                );
                if self.funding_check.policy() != FundingMismatchPolicy::ForceClose {
                    return false;
                }
                let closed = self
                    .try_close(snap, held.side, "funding_mismatch_force_close", now_ms, false)
                    .await;
                self.executor.disable_live("funding_mismatch_force_close");
                closed
            }
        }
    }

    async fn handle_held(&mut self, snap: &Snapshot, held: &PositionState, now_ms: i64) {
        if self.check_funding(snap, held, now_ms).await {
            return;
        }

        let d = self.strategy.should_close(snap, held.side);
        if d.action == Action::Close {
            self.try_close(snap, held.side, d.reason, now_ms, true).await;
            return;
        }

        let c = &self.config.strategy;
        let prem_abs = snap.premium.map(f64::abs).unwrap_or(0.0);
        let fund_abs = snap.funding_rate.map(f64::abs).unwrap_or(0.0);
        info!(
            "[{}] [{}] HOLD | IN_POSITION | reason={} | premium={:+.6} exit_thr={:.6} headroom={:+.6} needs_exit={} | funding={:+.6} exit_thr={:.6} headroom={:+.6} needs_exit={}",
            ts(snap.time),
            snap.coin,
            d.reason,
            snap.premium.unwrap_or_default(),
            c.prem_exit,
            prem_abs - c.prem_exit,
            prem_abs <= c.prem_exit,
            snap.funding_rate.unwrap_or_default(),
            c.fund_exit,
            fund_abs - c.fund_exit,
            fund_abs <= c.fund_exit
        );
    }

    async fn select_and_open(&mut self, candidates: &[Candidate], now_ms: i64) {
        if candidates.is_empty() {
            return;
        }
        let picks: Vec<BestPick> = candidates.iter().map(|c| c.pick.clone()).collect();
        let find = |pick: &BestPick| candidates.iter().find(|c| c.pick.coin == pick.coin);

        let Some(held) = self.open_position().cloned() else {
            if let Some(c) = select_best(None, &picks, &self.config.rotation).as_ref().and_then(find) {
                self.try_open(c, now_ms).await;
            }
            return;
        };

        if !self.config.rotation.enabled {
            debug!("Rotation disabled | holding {} | {} candidate(s) ignored", held.coin, candidates.len());
            return;
        }
        let Some(held_snap) = self.latest.get(&held.coin).cloned() else {
            return;
        };
        let d = self.strategy.should_close(&held_snap, held.side);
        if d.action != Action::Hold {
            return;
        }
        let incumbent = BestPick::new(&held.coin, held.side, d.score);
        let Some(best) = select_best(Some(incumbent.clone()), &picks, &self.config.rotation) else {
            return;
        };
        if best.coin == incumbent.coin {
            return;
        }

        info!(
            "🔄 ROTATION | {} {} score={:.6} -> {} {} score={:.6}",
            incumbent.coin, incumbent.side, incumbent.score, best.coin, best.side, best.score
        );
        if self
            .try_close(&held_snap, held.side, "rotation_to_better_carry", now_ms, true)
            .await
        {
            if let Some(c) = find(&best) {
                self.try_open(c, now_ms).await;
            }
        }
    }

    async fn try_open(&mut self, c: &Candidate, now_ms: i64) -> bool {
        let snap = &c.snapshot;
        let side = c.pick.side;
        let Some(funding) = snap.funding_rate else {
            return false;
        };

        let notional = self.config.execution.notional_usd.to_f64().unwrap_or(0.0);
        let gate = economic_gate(funding, notional, &self.config.gate);
        info!(
            "[GATE] {} exp_funding_{:.0}h=${:.6} est_round_trip_fees=${:.6} mult={:.2} pass={}",
            snap.coin, self.config.gate.horizon_hours, gate.expected_funding, gate.round_trip_fees, self.config.gate.multiplier, gate.passed
        );
        if !gate.passed {
            warn!(
                "[{}] [{}] HOLD | BREAK_EVEN_GATE | exp_funding=${:.6} required=${:.6}",
                ts(snap.time), snap.coin, gate.expected_funding, gate.required
            );
            return false;
        }
        if !direction_precheck(side, Some(funding)) {
            warn!(
                "[{}] [{}] HOLD | DIRECTION_PRECHECK_FAIL | side={} funding={:+.6}",
                ts(snap.time), snap.coin, side, funding
            );
            return false;
        }
        if self.cooldown_blocks(&snap.coin, now_ms) {
            return false;
        }

        let plan = self.executor.preview(snap, PlanKind::Open, side, c.decision.reason);
        let mut fill = None;
        if self.config.execution.live {
            if !self.executor.is_live() {
                warn!("[{}] [{}] OPEN | LIVE_DISABLED | not sent", ts(snap.time), snap.coin);
                return false;
            }
            let result = self.executor.execute(&plan).await;
            if !result.ok {
                warn!(
                    "[{}] [{}] OPEN | LIVE_FAILED | stage={:?} reason={}",
                    ts(snap.time), snap.coin, result.last_stage(), result.reason()
                );
                return false;
            }
            fill = result.perp_after;
        }

        self.cooldown.mark(&snap.coin, now_ms);
        let status = self.apply_decision(snap, &c.decision, fill.as_ref()).await;
        info!("[{}] [{}] OPEN | {}", ts(snap.time), snap.coin, status);
        if let Some(due) = self.funding_check.arm(&snap.coin, side, snap.time) {
            info!("FUNDING_CHECK armed | coin={} due={}", snap.coin, ts(due));
        }
        true
    }

    async fn try_close(
        &mut self,
        snap: &Snapshot,
        side: CarrySide,
        reason: &'static str,
        now_ms: i64,
        respect_cooldown: bool,
    ) -> bool {
        if respect_cooldown && self.cooldown_blocks(&snap.coin, now_ms) {
            return false;
        }

        let plan = self.executor.preview(snap, PlanKind::Close, side, reason);
        if self.config.execution.live {
            if !self.executor.is_live() {
                warn!("[{}] [{}] CLOSE | LIVE_DISABLED | not sent, local state kept", ts(snap.time), snap.coin);
                return false;
            }
            let result = self.executor.execute(&plan).await;
            if !result.ok {
                warn!(
                    "[{}] [{}] CLOSE | LIVE_FAILED | stage={:?} reason={}",
                    ts(snap.time), snap.coin, result.last_stage(), result.reason()
                );
                return false;
            }
        }

        self.cooldown.mark(&snap.coin, now_ms);
        let d = Decision {
            action: Action::Close,
            side: Some(side),
            score: 0.0,
            reason,
        };
        let status = self.apply_decision(snap, &d, None).await;
        self.funding_check.disarm();
        info!("[{}] [{}] CLOSE | {} | reason={}", ts(snap.time), snap.coin, status, reason);
        true
    }

    fn cooldown_blocks(&self, coin: &str, now_ms: i64) -> bool {
        let left = self.cooldown.remaining_ms(coin, now_ms);
        if left > 0 {
            info!(
                "[{}] HOLD | COOLDOWN_ACTIVE | cooldown_sec={} left_ms={}",
                coin, self.config.execution.cooldown_seconds, left
            );
            return true;
        }
        false
    }

    pub async fn run(&mut self) -> Result<()> {
        info!("Engine starting...");
        self.startup(Utc::now().timestamp_millis()).await;

        info!(
            "Starting MULTI-COIN bot | strategy={} coins={:?} poll={}s lookback={}h | live={}",
            self.strategy.name(),
            self.config.coins,
            self.config.poll_seconds,
            self.config.lookback_hours,
            self.config.execution.live
        );

        let (stop_tx, mut stop_rx) = watch::channel(false);
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    let _ = stop_tx.send(true);
                }
                Err(e) => {
                    error!("Ctrl+C handler unavailable: {}", e);
                    // sender must outlive the loop
                    std::future::pending::<()>().await;
                }
            }
        });

        let poll = Duration::from_secs(self.config.poll_seconds.max(1));
        loop {
            // a hedge in flight always reaches a terminal state before we stop
            self.run_cycle(Utc::now().timestamp_millis()).await;
            if *stop_rx.borrow() {
                break;
            }
            tokio::select! {
                _ = stop_rx.changed() => break,
                _ = tokio::time::sleep(poll) => {}
            }
        }

        info!("Stopped by user");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FundingCheckConfig, PaperConfig};
    use crate::connectors::paper::{Fault, PaperBroker};
    use crate::strategies::funding_premium::FundingPremiumStrategy;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Feed(Mutex<HashMap<String, Snapshot>>);

    impl Feed {
        fn set(&self, coin: &str, prem: f64, fund: f64, time: i64) {
            self.0
                .lock()
                .unwrap()
                .insert(coin.to_string(), Snapshot::new(coin, Some(fund), Some(prem), time));
        }
    }

    #[async_trait]
    impl SnapshotProvider for Feed {
        async fn fetch_snapshot(&self, coin: &str, _lookback_hours: u32) -> Option<Snapshot> {
            self.0.lock().unwrap().get(coin).cloned()
        }
    }

    struct Harness {
        feed: Arc<Feed>,
        broker: Arc<PaperBroker>,
        engine: CarryEngine<FundingPremiumStrategy>,
        _dir: tempfile::TempDir,
    }

    fn harness(live: bool, tweak: impl FnOnce(&mut AppConfig)) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = AppConfig::default();
        cfg.coins = vec!["ETH".to_string(), "BTC".to_string()];
        cfg.state_file = dir.path().join("state.json").to_string_lossy().into_owned();
        cfg.execution.live = live;
        cfg.execution.cooldown_seconds = 0;
        tweak(&mut cfg);

        let feed = Arc::new(Feed::default());
        let broker = Arc::new(PaperBroker::with_fixed_mids(
            &PaperConfig::default(),
            "USDC",
            &[("ETH", dec!(2000)), ("BTC", dec!(50000))],
        ));
        let strategy = FundingPremiumStrategy::new(&cfg.strategy);
        let engine = CarryEngine::new(cfg, feed.clone(), broker.clone(), strategy);
        Harness {
            feed,
            broker,
            engine,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn dry_run_opens_on_strong_carry_and_persists() {
        let mut h = harness(false, |_| {});
        h.engine.startup(0).await;
        h.feed.set("ETH", 0.0008, 0.0001, 1_000);

        assert_eq!(h.engine.run_cycle(0).await, 1);
        assert_eq!(h.engine.current_side(), Some(CarrySide::ShortPerpLongSpot));
        // nothing sent in dry-run
        assert!(h.broker.get_positions(None).await.unwrap().is_empty());

        let stored = h.engine.store.load().await.unwrap();
        assert_eq!(stored.coin, "ETH");
        assert!(stored.is_open);
    }

    #[tokio::test]
    async fn break_even_gate_blocks_thin_funding() {
        let mut h = harness(false, |_| {});
        // clears entry thresholds but 0.00001 * 100 * 24 = 0.024 < 1.5 * 0.09
        h.feed.set("ETH", 0.0008, 0.00001, 1_000);
        h.engine.run_cycle(0).await;
        assert_eq!(h.engine.current_side(), None);
    }

    #[tokio::test]
    async fn same_snapshot_time_is_processed_once() {
        let mut h = harness(false, |_| {});
        h.feed.set("ETH", 0.0001, 0.00001, 1_000);
        assert_eq!(h.engine.run_cycle(0).await, 1);
        assert_eq!(h.engine.run_cycle(10_000).await, 0);
        h.feed.set("ETH", 0.0001, 0.00001, 2_000);
        assert_eq!(h.engine.run_cycle(20_000).await, 1);
    }

    #[tokio::test]
    async fn live_open_then_close_on_decay() {
        let mut h = harness(true, |_| {});
        h.engine.startup(0).await;
        h.feed.set("ETH", 0.0008, 0.0001, 1_000);
        h.engine.run_cycle(0).await;

        let pos = h.engine.position().unwrap().clone();
        assert!(pos.is_open);
        assert_eq!(pos.size, Some(dec!(0.05)));
        assert_eq!(pos.entry_px, Some(dec!(2000)));
        assert_eq!(h.broker.get_positions(Some("ETH")).await.unwrap()[0].signed_size, dec!(-0.05));

        // premium decays below exit
        h.feed.set("ETH", 0.0001, 0.0001, 2_000);
        h.engine.run_cycle(5_000).await;
        assert_eq!(h.engine.current_side(), None);
        assert!(!h.engine.position().unwrap().is_open);
        assert!(h.broker.get_positions(None).await.unwrap().is_empty());
        assert!(h.engine.live_active());
    }

    #[tokio::test]
    async fn failed_leg_disables_live_and_keeps_state_flat() {
        let mut h = harness(true, |_| {});
        h.engine.startup(0).await;
        h.broker.inject_perp_fault(Fault::Reject);
        h.feed.set("ETH", 0.0008, 0.0001, 1_000);
        h.engine.run_cycle(0).await;
        assert_eq!(h.engine.current_side(), None);
        assert!(!h.engine.live_active());

        h.feed.set("ETH", 0.0008, 0.0001, 2_000);
        h.engine.run_cycle(1_000).await;
        assert_eq!(h.engine.current_side(), None);
        assert!(h.broker.get_positions(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cooldown_delays_close() {
        let mut h = harness(false, |c| c.execution.cooldown_seconds = 120);
        h.feed.set("ETH", 0.0008, 0.0001, 1_000);
        h.engine.run_cycle(0).await;
        assert!(h.engine.current_side().is_some());

        h.feed.set("ETH", 0.0001, 0.0001, 2_000);
        h.engine.run_cycle(60_000).await;
        assert!(h.engine.current_side().is_some());

        h.feed.set("ETH", 0.0001, 0.0001, 3_000);
        h.engine.run_cycle(121_000).await;
        assert_eq!(h.engine.current_side(), None);
    }

    #[tokio::test]
    async fn rotation_moves_to_clearly_better_coin() {
        let mut h = harness(true, |c| c.rotation.enabled = true);
        h.engine.startup(0).await;
        h.feed.set("ETH", 0.0004, 0.00006, 1_000);
        h.feed.set("BTC", 0.0001, 0.00001, 1_000);
        h.engine.run_cycle(0).await;
        assert_eq!(h.engine.position().unwrap().coin, "ETH");

        h.feed.set("ETH", 0.0004, 0.00006, 2_000);
        h.feed.set("BTC", 0.002, 0.0003, 2_000);
        h.engine.run_cycle(1_000).await;

        let pos = h.engine.position().unwrap();
        assert_eq!(pos.coin, "BTC");
        assert!(pos.is_open);
        let perps = h.broker.get_positions(None).await.unwrap();
        assert_eq!(perps.len(), 1);
        assert_eq!(perps[0].coin, "BTC");
    }

    #[tokio::test]
    async fn rotation_disabled_keeps_incumbent() {
        let mut h = harness(false, |_| {});
        h.feed.set("ETH", 0.0004, 0.00006, 1_000);
        h.engine.run_cycle(0).await;
        h.feed.set("BTC", 0.002, 0.0003, 2_000);
        h.engine.run_cycle(1_000).await;
        assert_eq!(h.engine.position().unwrap().coin, "ETH");
    }

    #[tokio::test]
    async fn flat_cycle_opens_only_the_best_candidate() {
        let mut h = harness(false, |_| {});
        h.feed.set("ETH", 0.0004, 0.00006, 1_000);
        h.feed.set("BTC", 0.002, 0.0003, 1_000);
        h.engine.run_cycle(0).await;
        assert_eq!(h.engine.position().unwrap().coin, "BTC");
    }

    #[tokio::test]
    async fn funding_mismatch_force_close_disables_live() {
        let mut h = harness(true, |c| {
            c.funding_check = FundingCheckConfig {
                enabled: true,
                interval_ms: 3_600_000,
                delay_ms: 0,
                policy: FundingMismatchPolicy::ForceClose,
            };
        });
        h.engine.startup(0).await;
        h.feed.set("ETH", 0.0008, 0.0001, 1_000);
        h.engine.run_cycle(0).await;
        assert!(h.engine.current_side().is_some());

        h.feed.set("ETH", 0.0008, -0.0001, 3_600_500);
        h.engine.run_cycle(3_600_500).await;
        assert_eq!(h.engine.current_side(), None);
        assert!(h.broker.get_positions(None).await.unwrap().is_empty());
        assert!(!h.engine.live_active());
    }

    #[tokio::test]
    async fn on_decision_statuses() {
        let mut h = harness(false, |_| {});
        let snap = Snapshot::new("ETH", Some(0.0001), Some(0.0008), 1_000);
        let hold = Decision::hold(None, 0.0, "missing_data");
        assert_eq!(h.engine.on_decision(&snap, &hold).await, "HOLD | no action");

        let close = Decision {
            action: Action::Close,
            side: Some(CarrySide::ShortPerpLongSpot),
            score: 0.0,
            reason: "t",
        };
        assert_eq!(h.engine.on_decision(&snap, &close).await, "CLOSE_SKIPPED | already flat");

        let open = Decision {
            action: Action::Open,
            side: Some(CarrySide::ShortPerpLongSpot),
            score: 0.0009,
            reason: "t",
        };
        assert!(h.engine.on_decision(&snap, &open).await.starts_with("OPENED"));
        assert_eq!(
            h.engine.on_decision(&snap, &open).await,
            "OPEN_SKIPPED | already in position"
        );
        assert!(h.engine.on_decision(&snap, &close).await.starts_with("CLOSED"));
        assert_eq!(h.engine.current_side(), None);
    }

    #[tokio::test]
    async fn live_startup_clears_stale_state() {
        let mut h = harness(true, |_| {});
        let snap = Snapshot::new("ETH", Some(0.0001), Some(0.0008), 1_000);
        h.engine
            .store
            .save(Some(&PositionState::opened(&snap, CarrySide::ShortPerpLongSpot)))
            .await;
        h.engine.startup(5_000).await;
        assert_eq!(h.engine.position(), None);
        assert_eq!(h.engine.store.load().await, None);
    }

    const HOUR: i64 = 3_600_000;

    #[tokio::test]
    async fn funding_check_with_default_delay_uses_cached_settlement() {
        let mut h = harness(true, |_| {});
        h.engine.startup(0).await;
        h.feed.set("ETH", 0.0008, 0.0001, 1_000);
        h.engine.run_cycle(0).await;
        let due = HOUR + FundingCheckConfig::default().delay_ms;
        assert_eq!(h.engine.funding_check.due_ms(), Some(due));

        // settlement record arrives before the due time
        h.feed.set("ETH", 0.0008, 0.0001, HOUR);
        h.engine.run_cycle(HOUR + 10_000).await;
        assert_eq!(h.engine.funding_check.due_ms(), Some(due));

        // same record, now past due
        assert_eq!(h.engine.run_cycle(due + 10_000).await, 0);
        assert_eq!(h.engine.funding_check.due_ms(), None);
        assert!(h.engine.current_side().is_some());
        assert!(h.engine.live_active());
    }

    fn long_cooldown(policy: FundingMismatchPolicy) -> impl FnOnce(&mut AppConfig) {
        move |c| {
            // strategy closes are held back, only the funding check may act
            c.execution.cooldown_seconds = 7_200;
            c.funding_check.policy = policy;
        }
    }

    #[tokio::test]
    async fn force_close_fires_on_cached_settlement_despite_cooldown() {
        let mut h = harness(true, long_cooldown(FundingMismatchPolicy::ForceClose));
        h.engine.startup(0).await;
        h.feed.set("ETH", 0.0008, 0.0001, 1_000);
        h.engine.run_cycle(0).await;
        assert!(h.engine.current_side().is_some());

        h.feed.set("ETH", 0.0008, -0.0001, HOUR);
        h.engine.run_cycle(HOUR + 10_000).await;
        assert!(h.engine.current_side().is_some());

        h.engine.run_cycle(HOUR + 130_000).await;
        assert_eq!(h.engine.current_side(), None);
        assert!(h.broker.get_positions(None).await.unwrap().is_empty());
        assert!(!h.engine.live_active());
    }

    #[tokio::test]
    async fn warn_policy_keeps_position_and_live() {
        let mut h = harness(true, long_cooldown(FundingMismatchPolicy::Warn));
        h.engine.startup(0).await;
        h.feed.set("ETH", 0.0008, 0.0001, 1_000);
        h.engine.run_cycle(0).await;

        h.feed.set("ETH", 0.0008, -0.0001, HOUR);
        h.engine.run_cycle(HOUR + 10_000).await;
        h.engine.run_cycle(HOUR + 130_000).await;

        assert_eq!(h.engine.funding_check.due_ms(), None);
        assert_eq!(h.engine.current_side(), Some(CarrySide::ShortPerpLongSpot));
        assert_eq!(h.broker.get_positions(Some("ETH")).await.unwrap()[0].signed_size, dec!(-0.05));
        assert!(h.engine.live_active());
    }

    #[tokio::test]
    async fn other_coins_are_tagged_as_candidates_while_holding() {
        let mut h = harness(false, |_| {});
        assert_eq!(h.engine.hold_tag(), "FLAT");
        let snap = Snapshot::new("ETH", Some(0.0001), Some(0.0008), 1_000);
        let open = Decision {
            action: Action::Open,
            side: Some(CarrySide::ShortPerpLongSpot),
            score: 0.0009,
            reason: "t",
        };
        h.engine.on_decision(&snap, &open).await;
        assert_eq!(h.engine.hold_tag(), "CANDIDATE(in_position=ETH)");
    }
}
