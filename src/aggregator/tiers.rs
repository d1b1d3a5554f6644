//! Bin-multiplier tiers.
//!
//! Footprint bins should stay near a useful width as prices move across
//! orders of magnitude: a 0.1-tick symbol at 60,000 needs far wider bins
//! than one at 0.5. The multiplier targets roughly a 10-basis-point bin and
//! snaps to a fixed ladder so neighbouring recomputations agree.

/// Allowed multipliers, ascending.
pub const MULTIPLIER_LADDER: [u32; 10] = [1, 2, 5, 10, 25, 50, 100, 250, 500, 1_000];

/// Fraction of price targeted as bin width.
const TARGET_WIDTH_FRACTION: f64 = 0.001;

/// Multiplier for the given market price and tick value, snapped down onto
/// the ladder. Always >= 1.
pub fn multiplier_for_price(price: f64, tick_value: f64) -> u32 {
    if !(price > 0.0) || !(tick_value > 0.0) {
        return 1;
    }
    let raw = price * TARGET_WIDTH_FRACTION / tick_value;
    let mut chosen = 1;
    for tier in MULTIPLIER_LADDER {
        if (tier as f64) <= raw {
            chosen = tier;
        } else {
            break;
        }
    }
    chosen
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn low_priced_symbols_stay_at_one() {
        assert_eq!(multiplier_for_price(0.5, 0.0001), 5);
        assert_eq!(multiplier_for_price(0.05, 0.0001), 1);
        assert_eq!(multiplier_for_price(1.0, 0.01), 1);
    }

    #[test]
    fn high_priced_symbols_widen() {
        // BTC at 60k, tick 0.1: raw = 600, snaps to 500.
        assert_eq!(multiplier_for_price(60_000.0, 0.1), 500);
        // ETH at 3k, tick 0.01: raw = 300, snaps to 250.
        assert_eq!(multiplier_for_price(3_000.0, 0.01), 250);
    }

    #[test]
    fn ladder_cap() {
        assert_eq!(multiplier_for_price(1_000_000.0, 0.01), 1_000);
    }

    #[test]
    fn degenerate_inputs() {
        assert_eq!(multiplier_for_price(0.0, 0.1), 1);
        assert_eq!(multiplier_for_price(100.0, 0.0), 1);
        assert_eq!(multiplier_for_price(f64::NAN, 0.1), 1);
    }
}
