// src/strategies/gate.rs
use crate::config::GateConfig;
use crate::types::CarrySide;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GateCheck {
    pub expected_funding: f64,
    pub required: f64,
    pub round_trip_fees: f64,
    pub passed: bool,
}

/// Break-even gate: funding accrued over the horizon must cover round-trip fees
/// times the multiplier.
pub fn economic_gate(funding: f64, notional: f64, cfg: &GateConfig) -> GateCheck {
    let expected_funding = funding.abs() * notional * cfg.horizon_hours;
    let round_trip_fees = notional * (cfg.fee_open + cfg.fee_close).max(0.0);
    let required = cfg.multiplier * round_trip_fees;
    GateCheck {
        expected_funding,
        required,
        round_trip_fees,
        passed: expected_funding >= required,
    }
}

/// Отдельная проверка направления перед OPEN: сторона должна получать фандинг,
/// а не платить его. Не полагается на решение стратегии.
pub fn direction_precheck(side: CarrySide, funding: Option<f64>) -> bool {
    matches!(funding, Some(f) if side.receives(f))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> GateConfig {
        GateConfig {
            horizon_hours: 24.0,
            fee_open: 0.00045,
            fee_close: 0.00045,
            multiplier: 1.5,
        }
    }

    #[test]
    fn small_funding_fails_gate() {
        let g = economic_gate(0.00002, 1000.0, &cfg());
        assert!((g.expected_funding - 0.48).abs() < 1e-9);
        assert!((g.required - 1.35).abs() < 1e-9);
        assert!(!g.passed);
    }

    #[test]
    fn large_funding_passes_gate() {
        let g = economic_gate(0.0005, 1000.0, &cfg());
        assert!((g.expected_funding - 12.0).abs() < 1e-9);
        assert!((g.required - 1.35).abs() < 1e-9);
        assert!(g.passed);
    }

    #[test]
    fn gate_uses_funding_magnitude() {
        assert!(economic_gate(-0.0005, 1000.0, &cfg()).passed);
    }

    #[test]
    fn direction_precheck_rejects_paying_side() {
        assert!(direction_precheck(CarrySide::ShortPerpLongSpot, Some(0.0001)));
        assert!(!direction_precheck(CarrySide::ShortPerpLongSpot, Some(-0.0001)));
        assert!(direction_precheck(CarrySide::LongPerpShortSpot, Some(-0.0001)));
        assert!(!direction_precheck(CarrySide::LongPerpShortSpot, Some(0.0)));
        assert!(!direction_precheck(CarrySide::LongPerpShortSpot, None));
    }
}
