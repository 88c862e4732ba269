// src/utils/precision.rs
use rust_decimal::Decimal;

/// Округляет количество ВНИЗ до ближайшего кратного step_size.
/// Пример: amount=10.999, step=1.0 -> 10.0
pub fn normalize_quantity(amount: Decimal, step_size: Decimal) -> Decimal {
    if step_size.is_zero() {
        return amount;
    }
    (amount / step_size).floor() * step_size
}

/// Шаг размера для биржи, задающей точность числом знаков (szDecimals).
pub fn step_from_decimals(decimals: u32) -> Decimal {
    Decimal::new(1, decimals)
}

/// Notional in quote currency -> size in base units, floored to the size step.
/// Returns zero for a non-positive price.
pub fn size_for_notional(notional: Decimal, mid: Decimal, size_decimals: u32) -> Decimal {
    if mid <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    normalize_quantity(notional / mid, step_from_decimals(size_decimals)).normalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn quantity_is_floored_to_step() {
        assert_eq!(normalize_quantity(dec!(10.999), dec!(1)), dec!(10));
        assert_eq!(normalize_quantity(dec!(0.12345), dec!(0.001)), dec!(0.123));
        assert_eq!(normalize_quantity(dec!(5), Decimal::ZERO), dec!(5));
    }

    #[test]
    fn notional_sizing_respects_decimals() {
        assert_eq!(size_for_notional(dec!(100), dec!(3000), 4), dec!(0.0333));
        assert_eq!(size_for_notional(dec!(100), dec!(7), 0), dec!(14));
        assert_eq!(size_for_notional(dec!(100), Decimal::ZERO, 4), Decimal::ZERO);
    }
}
