// src/core/guard.rs
use crate::config::FundingCheckConfig;
use crate::types::CarrySide;
use std::collections::HashMap;

/// Blocks new attempts on a coin for a while after a leg-pair was executed.
#[derive(Debug, Default)]
pub struct CooldownTracker {
    window_ms: i64,
    last_exec: HashMap<String, i64>,
}

impl CooldownTracker {
    pub fn new(cooldown_seconds: u64) -> Self {
        Self {
            window_ms: i64::try_from(cooldown_seconds.saturating_mul(1000)).unwrap_or(i64::MAX),
            last_exec: HashMap::new(),
        }
    }

    pub fn mark(&mut self, coin: &str, now_ms: i64) {
        self.last_exec.insert(coin.to_string(), now_ms);
    }

    /// Milliseconds left before `coin` may trade again; zero when free.
    pub fn remaining_ms(&self, coin: &str, now_ms: i64) -> i64 {
        self.last_exec
            .get(coin)
            .map_or(0, |t| (t.saturating_add(self.window_ms) - now_ms).max(0))
    }

    pub fn is_active(&self, coin: &str, now_ms: i64) -> bool {
        self.remaining_ms(coin, now_ms) > 0
    }
}

/// First settlement boundary strictly after `opened_ms`.
pub fn next_settlement_ms(opened_ms: i64, interval_ms: i64) -> i64 {
    if interval_ms <= 0 {
        return opened_ms;
    }
    (opened_ms.div_euclid(interval_ms) + 1) * interval_ms
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FundingVerdict {
    NotDue,
    Received { funding: f64 },
    /// Held side pays under the observed sign.
    Mismatch { funding: f64 },
    NoData,
}

#[derive(Debug, Clone, PartialEq)]
struct Armed {
    coin: String,
    side: CarrySide,
    settle_ms: i64,
    due_ms: i64,
}

/// One-shot check armed after an OPEN commits.
#[derive(Debug)]
pub struct FundingCheck {
    cfg: FundingCheckConfig,
    armed: Option<Armed>,
}

impl FundingCheck {
    pub fn new(cfg: &FundingCheckConfig) -> Self {
        Self {
            cfg: cfg.clone(),
            armed: None,
        }
    }

    pub fn arm(&mut self, coin: &str, side: CarrySide, opened_ms: i64) -> Option<i64> {
        if !self.cfg.enabled {
            return None;
        }
        let settle_ms = next_settlement_ms(opened_ms, self.cfg.interval_ms);
        let due_ms = settle_ms + self.cfg.delay_ms;
        self.armed = Some(Armed {
            coin: coin.to_string(),
            side,
            settle_ms,
            due_ms,
        });
        Some(due_ms)
    }

    pub fn disarm(&mut self) {
        self.armed = None;
    }

    pub fn due_ms(&self) -> Option<i64> {
        self.armed.as_ref().map(|a| a.due_ms)
    }

    /// Whether `coin` has a check whose due time has passed.
    pub fn is_due(&self, coin: &str, now_ms: i64) -> bool {
        self.armed
            .as_ref()
            .is_some_and(|a| a.coin == coin && now_ms >= a.due_ms)
    }

    /// Evaluates the armed check for `coin` against funding observed at `data_ms`.
    /// Data older than the settlement keeps the check armed. Any other verdict consumes it.
    pub fn evaluate(&mut self, coin: &str, funding: Option<f64>, data_ms: i64, now_ms: i64) -> FundingVerdict {
        let Some(armed) = self.armed.as_ref().filter(|a| a.coin == coin) else {
            return FundingVerdict::NotDue;
        };
        if now_ms < armed.due_ms || data_ms < armed.settle_ms {
            return FundingVerdict::NotDue;
        }
        let side = armed.side;
        self.armed = None;
        match funding {
            None => FundingVerdict::NoData,
            Some(f) if side.receives(f) => FundingVerdict::Received { funding: f },
            Some(f) => FundingVerdict::Mismatch { funding: f },
        }
    }

    pub fn policy(&self) -> crate::config::FundingMismatchPolicy {
        self.cfg.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FundingMismatchPolicy;

    const HOUR: i64 = 3_600_000;

    #[test]
    fn cooldown_blocks_then_expires() {
        let mut cd = CooldownTracker::new(120);
        assert!(!cd.is_active("ETH", 0));
        cd.mark("ETH", 1_000);
        assert!(cd.is_active("ETH", 1_000));
        assert_eq!(cd.remaining_ms("ETH", 61_000), 60_000);
        assert!(!cd.is_active("ETH", 121_000));
        assert!(!cd.is_active("BTC", 1_000));
    }

    #[test]
    fn settlement_boundary_is_strictly_after_open() {
        assert_eq!(next_settlement_ms(0, HOUR), HOUR);
        assert_eq!(next_settlement_ms(HOUR - 1, HOUR), HOUR);
        assert_eq!(next_settlement_ms(HOUR, HOUR), 2 * HOUR);
        assert_eq!(next_settlement_ms(5 * HOUR + 17, HOUR), 6 * HOUR);
    }

    fn check() -> FundingCheck {
        FundingCheck::new(&FundingCheckConfig {
            enabled: true,
            interval_ms: HOUR,
            delay_ms: 120_000,
            policy: FundingMismatchPolicy::ForceClose,
        })
    }

    #[test]
    fn check_waits_for_boundary_plus_delay() {
        let mut fc = check();
        let due = fc.arm("ETH", CarrySide::ShortPerpLongSpot, HOUR + 10).unwrap();
        assert_eq!(due, 2 * HOUR + 120_000);
        assert!(!fc.is_due("ETH", due - 1));
        assert!(fc.is_due("ETH", due));
        assert!(!fc.is_due("BTC", due));
        assert_eq!(fc.evaluate("ETH", Some(0.0001), 2 * HOUR, due - 1), FundingVerdict::NotDue);
        assert_eq!(fc.evaluate("BTC", Some(0.0001), 2 * HOUR, due), FundingVerdict::NotDue);
        assert_eq!(
            fc.evaluate("ETH", Some(0.0001), 2 * HOUR, due),
            FundingVerdict::Received { funding: 0.0001 }
        );
        // consumed
        assert_eq!(fc.evaluate("ETH", Some(0.0001), 2 * HOUR, due + 1), FundingVerdict::NotDue);
        assert_eq!(fc.policy(), FundingMismatchPolicy::ForceClose);
    }

    #[test]
    fn paying_side_is_a_mismatch() {
        let mut fc = check();
        let due = fc.arm("SOL", CarrySide::ShortPerpLongSpot, 0).unwrap();
        assert_eq!(
            fc.evaluate("SOL", Some(-0.00002), HOUR, due),
            FundingVerdict::Mismatch { funding: -0.00002 }
        );

        let due = fc.arm("SOL", CarrySide::LongPerpShortSpot, 0).unwrap();
        assert_eq!(fc.evaluate("SOL", None, HOUR, due), FundingVerdict::NoData);
    }

    #[test]
    fn pre_settlement_data_keeps_check_armed() {
        let mut fc = check();
        let due = fc.arm("ETH", CarrySide::ShortPerpLongSpot, 1_000).unwrap();
        // record from before the settlement says nothing about it
        assert_eq!(fc.evaluate("ETH", Some(-0.0001), 0, due + 5_000), FundingVerdict::NotDue);
        assert_eq!(fc.due_ms(), Some(due));
        assert_eq!(
            fc.evaluate("ETH", Some(-0.0001), HOUR, due + 10_000),
            FundingVerdict::Mismatch { funding: -0.0001 }
        );
        assert_eq!(fc.due_ms(), None);
    }

    #[test]
    fn disabled_check_never_arms() {
        let mut fc = FundingCheck::new(&FundingCheckConfig {
            enabled: false,
            ..FundingCheckConfig::default()
        });
        assert_eq!(fc.arm("ETH", CarrySide::ShortPerpLongSpot, 0), None);
        assert_eq!(fc.due_ms(), None);
    }
}
