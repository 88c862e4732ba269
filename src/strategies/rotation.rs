// src/strategies/rotation.rs
use crate::config::RotationConfig;
use crate::types::CarrySide;

#[derive(Debug, Clone, PartialEq)]
pub struct BestPick {
    pub coin: String,
    pub side: CarrySide,
    pub score: f64,
}

impl BestPick {
    pub fn new(coin: &str, side: CarrySide, score: f64) -> Self {
        Self {
            coin: coin.to_string(),
            side,
            score,
        }
    }
}

/// Candidate must beat the incumbent by both the ratio and the absolute delta.
pub fn should_rotate(
    current: Option<&BestPick>,
    candidate: &BestPick,
    ratio: f64,
    abs_delta: f64,
) -> bool {
    let Some(current) = current else {
        return true;
    };

    if candidate.coin == current.coin && candidate.side == current.side {
        return false;
    }

    if current.score <= 0.0 {
        return true;
    }

    candidate.score >= current.score * ratio && (candidate.score - current.score) >= abs_delta
}

/// Folds candidates in order through `should_rotate`, starting from `incumbent`.
/// Returns the surviving pick, which is the incumbent when nobody displaced it.
pub fn select_best<'a, I>(incumbent: Option<BestPick>, candidates: I, cfg: &RotationConfig) -> Option<BestPick>
where
    I: IntoIterator<Item = &'a BestPick>,
{
    candidates.into_iter().fold(incumbent, |best, cand| {
        if should_rotate(best.as_ref(), cand, cfg.ratio, cfg.abs_delta) {
            Some(cand.clone())
        } else {
            best
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATIO: f64 = 1.25;
    const DELTA: f64 = 0.00005;

    #[test]
    fn no_current_always_rotates() {
        for score in [-1.0, 0.0, 1e-9, 5.0] {
            let cand = BestPick::new("BTC", CarrySide::ShortPerpLongSpot, score);
            assert!(should_rotate(None, &cand, RATIO, DELTA));
        }
    }

    #[test]
    fn same_coin_and_side_never_rotates() {
        let cur = BestPick::new("BTC", CarrySide::ShortPerpLongSpot, 0.0001);
        for score in [0.0, 0.0001, 10.0] {
            let cand = BestPick::new("BTC", CarrySide::ShortPerpLongSpot, score);
            assert!(!should_rotate(Some(&cur), &cand, RATIO, DELTA));
        }
    }

    #[test]
    fn non_positive_incumbent_is_replaced() {
        let cur = BestPick::new("BTC", CarrySide::ShortPerpLongSpot, 0.0);
        let cand = BestPick::new("ETH", CarrySide::ShortPerpLongSpot, 0.00001);
        assert!(should_rotate(Some(&cur), &cand, RATIO, DELTA));
    }

    #[test]
    fn requires_both_ratio_and_delta() {
        let cur = BestPick::new("BTC", CarrySide::ShortPerpLongSpot, 0.0004);
        // ratio ok (1.5x) but delta 0.0002 ok -> rotate
        let big = BestPick::new("ETH", CarrySide::ShortPerpLongSpot, 0.0006);
        assert!(should_rotate(Some(&cur), &big, RATIO, DELTA));

        // delta ok, ratio fails (1.2x)
        let small_ratio = BestPick::new("ETH", CarrySide::ShortPerpLongSpot, 0.00048);
        assert!(!should_rotate(Some(&cur), &small_ratio, RATIO, DELTA));

        // ratio ok, delta fails
        let tiny = BestPick::new("SOL", CarrySide::ShortPerpLongSpot, 0.00003);
        let cur_tiny = BestPick::new("BTC", CarrySide::ShortPerpLongSpot, 0.00001);
        assert!(!should_rotate(Some(&cur_tiny), &tiny, RATIO, DELTA));
    }

    #[test]
    fn select_best_keeps_incumbent_on_marginal_edge() {
        let cfg = RotationConfig {
            enabled: true,
            ratio: RATIO,
            abs_delta: DELTA,
        };
        let cands = vec![
            BestPick::new("BTC", CarrySide::ShortPerpLongSpot, 0.0004),
            BestPick::new("ETH", CarrySide::ShortPerpLongSpot, 0.00045),
            BestPick::new("SOL", CarrySide::ShortPerpLongSpot, 0.0009),
        ];
        let best = select_best(None, &cands, &cfg).unwrap();
        assert_eq!(best.coin, "SOL");

        let best = select_best(None, &cands[..2], &cfg).unwrap();
        assert_eq!(best.coin, "BTC");

        assert_eq!(select_best(None, std::iter::empty(), &cfg), None);
    }
}
