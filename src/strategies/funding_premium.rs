use crate::config::StrategyConfig;
use crate::strategies::traits::Strategy;
use crate::types::{Action, CarrySide, Decision, Snapshot};

pub const MISSING_DATA: &str = "missing_data";
pub const SIGN_MISMATCH: &str = "sign_mismatch_not_a_carry";

/// Funding + premium carry signal with an entry/exit hysteresis band.
#[derive(Debug, Clone)]
pub struct FundingPremiumStrategy {
    prem_entry: f64,
    fund_entry: f64,
    prem_exit: f64,
    fund_exit: f64,
}

impl FundingPremiumStrategy {
    /// Creates the strategy.
    ///
    /// # Arguments
    /// * `cfg` - entry/exit thresholds on absolute premium and funding. Exit must be
    ///   strictly below entry, otherwise a position opened at the entry cutoff would
    ///   close on the very next tick.
    pub fn new(cfg: &StrategyConfig) -> Self {
        Self {
            prem_entry: cfg.prem_entry,
            fund_entry: cfg.fund_entry,
            prem_exit: cfg.prem_exit,
            fund_exit: cfg.fund_exit,
        }
    }

    /// Sign-matched magnitudes for a side, or None when the carry is not valid for it.
    fn carry_magnitudes(side: CarrySide, prem: f64, fund: f64) -> Option<(f64, f64)> {
        match side {
            CarrySide::ShortPerpLongSpot if prem > 0.0 && fund > 0.0 => Some((prem, fund)),
            CarrySide::LongPerpShortSpot if prem < 0.0 && fund < 0.0 => Some((-prem, -fund)),
            _ => None,
        }
    }
}

impl Strategy for FundingPremiumStrategy {
    fn name(&self) -> String {
        "funding_premium_carry".to_string()
    }

    fn decide_open(&self, snap: &Snapshot) -> Decision {
        let (prem, fund) = match (snap.premium, snap.funding_rate) {
            (Some(p), Some(f)) => (p, f),
            _ => return Decision::hold(None, 0.0, MISSING_DATA),
        };

        for (side, entry_reason, below_reason) in [
            (
                CarrySide::ShortPerpLongSpot,
                "valid_short_carry_entry",
                "short_carry_but_below_entry_thresholds",
            ),
            (
                CarrySide::LongPerpShortSpot,
                "valid_long_carry_entry",
                "long_carry_but_below_entry_thresholds",
            ),
        ] {
            if let Some((p, f)) = Self::carry_magnitudes(side, prem, fund) {
                let score = p + f;
                if p >= self.prem_entry && f >= self.fund_entry {
                    return Decision {
                        action: Action::Open,
                        side: Some(side),
                        score,
                        reason: entry_reason,
                    };
                }
                return Decision::hold(None, score, below_reason);
            }
        }

        Decision::hold(None, 0.0, SIGN_MISMATCH)
    }

    fn entry_gaps(&self, snap: &Snapshot) -> (f64, f64) {
        let prem = snap.premium.map(f64::abs).unwrap_or(0.0);
        let fund = snap.funding_rate.map(f64::abs).unwrap_or(0.0);
        (
            (self.prem_entry - prem).max(0.0),
            (self.fund_entry - fund).max(0.0),
        )
    }

    fn should_close(&self, snap: &Snapshot, current_side: CarrySide) -> Decision {
        let (prem, fund) = match (snap.premium, snap.funding_rate) {
            (Some(p), Some(f)) => (p, f),
            _ => return Decision::hold(Some(current_side), 0.0, "missing_data_hold"),
        };

        let (invalidated, decayed, ok) = match current_side {
            CarrySide::ShortPerpLongSpot => (
                "short_carry_invalidated_sign_mismatch",
                "short_carry_decayed_below_exit",
                "short_carry_ok_hold",
            ),
            CarrySide::LongPerpShortSpot => (
                "long_carry_invalidated_sign_mismatch",
                "long_carry_decayed_below_exit",
                "long_carry_ok_hold",
            ),
        };

        // Знак развернулся: позиция теперь платит фандинг, выходим без оглядки на величину.
        let Some((p, f)) = Self::carry_magnitudes(current_side, prem, fund) else {
            return Decision {
                action: Action::Close,
                side: Some(current_side),
                score: 0.0,
                reason: invalidated,
            };
        };

        if p <= self.prem_exit || f <= self.fund_exit {
            return Decision {
                action: Action::Close,
                side: Some(current_side),
                score: p + f,
                reason: decayed,
            };
        }

        Decision::hold(Some(current_side), p + f, ok)
    }
}
