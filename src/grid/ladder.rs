//! Ladder construction: discrete price levels and per-level quote sizing

use log::info;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use super::config::GridExecutorConfig;
use super::errors::{GridError, GridResult};
use super::level::GridLevel;
use super::types::TradingRules;

/// Safety margin applied to the per-level notional floor so that quantized
/// amounts survive the venue's minimum-notional check.
const NOTIONAL_SAFETY_MARGIN: Decimal = dec!(1.05);

/// The computed ladder. Fixed for the executor's lifetime; rebuilding
/// implies a restart.
#[derive(Debug, Clone)]
pub struct Ladder {
    pub levels: Vec<GridLevel>,
    /// Fractional step between adjacent levels
    pub step: Decimal,
    /// Quote notional committed per level
    pub quote_per_level: Decimal,
}

/// Build the ladder from the executor configuration, the venue's trading
/// rules, and the mid price observed at startup.
pub fn build_ladder(
    config: &GridExecutorConfig,
    rules: &TradingRules,
    mid_price: Decimal,
) -> GridResult<Ladder> {
    if mid_price <= Decimal::ZERO {
        return Err(GridError::InvalidConfig(format!(
            "cannot build ladder from non-positive mid price {mid_price}"
        )));
    }

    let base_increment = rules.min_base_amount_increment;

    // Per-level notional floor, with margin to survive rounding
    let min_notional = config.min_order_amount_quote.max(rules.min_notional);
    let min_quote_with_margin = min_notional * NOTIONAL_SAFETY_MARGIN;

    // Smallest increment-aligned base amount whose notional clears the floor
    let min_base_amount =
        (min_quote_with_margin / (base_increment * mid_price)).ceil() * base_increment;
    let min_quote_amount = min_base_amount * mid_price;

    // Capacity cap from the budget
    let max_levels_by_budget = (config.total_amount_quote / min_quote_amount)
        .floor()
        .to_u32()
        .unwrap_or(0);

    // Spacing cap from the configured spread and the price tick
    let grid_range = (config.end_price - config.start_price) / config.start_price;
    let min_step = config
        .min_spread_between_orders
        .max(rules.min_price_increment / mid_price);
    let max_levels_by_step = (grid_range / min_step).floor().to_u32().unwrap_or(0);

    let (n_levels, quote_per_level) = if max_levels_by_budget == 0 {
        // Budget does not even cover one full level; fall back to a single
        // minimum-sized one
        (1, min_quote_amount)
    } else {
        let mut n = max_levels_by_budget.min(max_levels_by_step).max(1);

        let base_per_level = ((config.total_amount_quote / (mid_price * Decimal::from(n)))
            / base_increment)
            .floor()
            * base_increment;
        let quote = min_quote_amount.max(base_per_level * mid_price);

        // Shrink the ladder if the boosted per-level quote overshoots the budget
        let affordable = (config.total_amount_quote / quote).floor().to_u32().unwrap_or(1);
        n = n.min(affordable).max(1);

        (n, quote)
    };

    let (prices, step) = if n_levels > 1 {
        let span = config.end_price - config.start_price;
        let price_step = span / Decimal::from(n_levels - 1);
        let prices = (0..n_levels)
            .map(|i| config.start_price + price_step * Decimal::from(i))
            .collect();
        (prices, grid_range / Decimal::from(n_levels - 1))
    } else {
        let midpoint = (config.start_price + config.end_price) / dec!(2);
        (vec![midpoint], grid_range)
    };

    let levels = prices
        .into_iter()
        .enumerate()
        .map(|(i, price)| {
            GridLevel::new(
                format!("L{i}"),
                price,
                quote_per_level,
                config.side,
                config.order_type,
                config.take_profit_pct,
            )
        })
        .collect::<Vec<_>>();

    info!(
        "Built ladder for {}: {} levels across [{}, {}], {:.4} quote per level",
        config.id,
        levels.len(),
        config.start_price,
        config.end_price,
        quote_per_level
    );

    Ok(Ladder {
        levels,
        step,
        quote_per_level,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::config::tests::test_config;
    use crate::grid::types::TradeType;

    fn rules() -> TradingRules {
        TradingRules {
            trading_pair: "XRP/USDC:USDC".to_string(),
            min_price_increment: dec!(0.00001),
            min_base_amount_increment: dec!(1),
            min_notional: dec!(5),
            min_order_size: dec!(1),
        }
    }

    #[test]
    fn ladder_for_reference_config() {
        let mut config = test_config(TradeType::Buy);
        config.min_order_amount_quote = dec!(15);

        let ladder = build_ladder(&config, &rules(), dec!(0.264)).unwrap();

        let n = ladder.levels.len();
        assert!((5..=64).contains(&n), "unexpected level count {n}");

        // Bounds are inclusive
        assert_eq!(ladder.levels.first().unwrap().price, dec!(0.248));
        assert_eq!(ladder.levels.last().unwrap().price, dec!(0.280));

        // Per-level quote clears the boosted floor and respects the budget
        assert!(ladder.quote_per_level >= dec!(15));
        assert!(
            ladder.quote_per_level * Decimal::from(n as u32)
                <= config.total_amount_quote * dec!(1.05)
        );
    }

    #[test]
    fn levels_are_evenly_spaced() {
        let mut config = test_config(TradeType::Buy);
        config.min_order_amount_quote = dec!(15);

        let ladder = build_ladder(&config, &rules(), dec!(0.264)).unwrap();

        let first_gap = ladder.levels[1].price - ladder.levels[0].price;
        for pair in ladder.levels.windows(2) {
            let gap = pair[1].price - pair[0].price;
            assert!((gap - first_gap).abs() < dec!(0.0000001), "uneven gap {gap}");
        }
    }

    #[test]
    fn budget_below_floor_yields_single_midpoint_level() {
        let mut config = test_config(TradeType::Buy);
        // Q_min at mid 0.264 is 5.28; a 5 USDC budget cannot cover it
        config.total_amount_quote = dec!(5);

        let ladder = build_ladder(&config, &rules(), dec!(0.264)).unwrap();

        assert_eq!(ladder.levels.len(), 1);
        assert_eq!(ladder.levels[0].price, (dec!(0.248) + dec!(0.280)) / dec!(2));
        assert!(ladder.quote_per_level >= dec!(5.25));
    }

    #[test]
    fn spacing_cap_binds_on_wide_spread() {
        let mut config = test_config(TradeType::Buy);
        config.min_spread_between_orders = dec!(0.02);

        let ladder = build_ladder(&config, &rules(), dec!(0.264)).unwrap();

        // R = 0.032/0.248 ~ 0.129; floor(0.129 / 0.02) = 6
        assert_eq!(ladder.levels.len(), 6);
    }

    #[test]
    fn invalid_mid_price_is_rejected() {
        let config = test_config(TradeType::Buy);
        assert!(build_ladder(&config, &rules(), Decimal::ZERO).is_err());
    }

    #[test]
    fn levels_inherit_config_parameters() {
        let config = test_config(TradeType::Sell);
        let ladder = build_ladder(&config, &rules(), dec!(0.264)).unwrap();

        for (i, level) in ladder.levels.iter().enumerate() {
            assert_eq!(level.id, format!("L{i}"));
            assert_eq!(level.side, TradeType::Sell);
            assert_eq!(level.take_profit_pct, config.take_profit_pct);
            assert_eq!(level.amount_quote, ladder.quote_per_level);
        }
    }

    mod laws {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // Budgets that cover at least one full level: the ladder always
            // exists and never overspends past the 5% floor margin
            #[test]
            fn ladder_fits_budget(
                start_mantissa in 100i64..100_000,
                span_mantissa in 10i64..50_000,
                total_mantissa in 200i64..1_000_000,
                spread_mantissa in 1i64..500,
            ) {
                let mut config = test_config(TradeType::Buy);
                config.start_price = Decimal::new(start_mantissa, 4);
                config.end_price = Decimal::new(start_mantissa + span_mantissa, 4);
                config.total_amount_quote = Decimal::new(total_mantissa, 1);
                config.min_spread_between_orders = Decimal::new(spread_mantissa, 5);

                let mid = (config.start_price + config.end_price) / dec!(2);
                let ladder = build_ladder(&config, &rules(), mid).unwrap();

                let n = Decimal::from(ladder.levels.len() as u64);
                prop_assert!(!ladder.levels.is_empty());
                prop_assert!(
                    ladder.quote_per_level * n <= config.total_amount_quote * dec!(1.05)
                );
            }
        }
    }
}
