//! Per-executor grid configuration

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::errors::{GridError, GridResult};
use super::types::{OrderType, TradeType};

fn default_order_type() -> OrderType {
    OrderType::Limit
}

/// Configuration of a single grid executor, immutable per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridExecutorConfig {
    /// Executor identity used in logs (e.g. "long_grid")
    pub id: String,

    /// Trading pair, e.g. "XRP/USDC:USDC"
    pub trading_pair: String,

    /// Grid direction: `Buy` opens long positions, `Sell` opens short
    pub side: TradeType,

    /// Lower bound of the ladder (inclusive)
    pub start_price: Decimal,

    /// Upper bound of the ladder (inclusive)
    pub end_price: Decimal,

    /// Total notional budget in quote currency
    pub total_amount_quote: Decimal,

    /// Cap on concurrently resting open orders
    pub max_open_orders: u32,

    /// Minimum fractional gap between adjacent levels
    pub min_spread_between_orders: Decimal,

    /// Floor on per-level notional in quote currency
    pub min_order_amount_quote: Decimal,

    /// Order type used for open orders
    #[serde(default = "default_order_type")]
    pub order_type: OrderType,

    /// Minimum seconds between consecutive open-order placements; 0 removes
    /// the throttle
    pub order_frequency: u64,

    /// Fractional window around mid outside which no orders are kept live;
    /// `None` disables the filter entirely
    #[serde(default)]
    pub activation_bounds: Option<Decimal>,

    /// Anti-taker buffer applied when a take-profit target has been overrun
    /// by the mid price
    pub safe_extra_spread: Decimal,

    /// Fractional profit target per level
    pub take_profit_pct: Decimal,

    /// Leverage the account is configured for
    pub leverage: u32,

    /// Fractional reduction of close amounts when the venue charged fees on
    /// the open leg in base asset. Venues charging fees in quote need none.
    #[serde(default)]
    pub close_fee_adjustment: Decimal,
}

impl GridExecutorConfig {
    /// Validate the configuration, rejecting anything the ladder builder or
    /// the control loop cannot work with.
    pub fn validate(&self) -> GridResult<()> {
        if self.trading_pair.is_empty() {
            return Err(GridError::InvalidConfig("trading_pair cannot be empty".into()));
        }

        if self.start_price >= self.end_price {
            return Err(GridError::InvalidConfig(format!(
                "start_price {} must be below end_price {}",
                self.start_price, self.end_price
            )));
        }

        if self.start_price <= Decimal::ZERO {
            return Err(GridError::InvalidConfig("start_price must be positive".into()));
        }

        if self.total_amount_quote <= Decimal::ZERO {
            return Err(GridError::InvalidConfig(
                "total_amount_quote must be positive".into(),
            ));
        }

        if self.max_open_orders == 0 {
            return Err(GridError::InvalidConfig(
                "max_open_orders must be at least 1".into(),
            ));
        }

        if self.min_order_amount_quote <= Decimal::ZERO {
            return Err(GridError::InvalidConfig(
                "min_order_amount_quote must be positive".into(),
            ));
        }

        if self.take_profit_pct <= Decimal::ZERO {
            return Err(GridError::InvalidConfig(
                "take_profit_pct must be positive".into(),
            ));
        }

        if self.min_spread_between_orders < Decimal::ZERO
            || self.safe_extra_spread < Decimal::ZERO
            || self.close_fee_adjustment < Decimal::ZERO
        {
            return Err(GridError::InvalidConfig(
                "spreads and adjustments cannot be negative".into(),
            ));
        }

        if let Some(bounds) = self.activation_bounds {
            if bounds < Decimal::ZERO {
                return Err(GridError::InvalidConfig(
                    "activation_bounds cannot be negative".into(),
                ));
            }
        }

        if self.leverage == 0 {
            return Err(GridError::InvalidConfig("leverage must be at least 1".into()));
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    pub(crate) fn test_config(side: TradeType) -> GridExecutorConfig {
        GridExecutorConfig {
            id: match side {
                TradeType::Buy => "long_grid".to_string(),
                TradeType::Sell => "short_grid".to_string(),
            },
            trading_pair: "XRP/USDC:USDC".to_string(),
            side,
            start_price: dec!(0.248),
            end_price: dec!(0.280),
            total_amount_quote: dec!(1000),
            max_open_orders: 5,
            min_spread_between_orders: dec!(0.0005),
            min_order_amount_quote: dec!(5),
            order_type: OrderType::Limit,
            order_frequency: 0,
            activation_bounds: None,
            safe_extra_spread: dec!(0.0001),
            take_profit_pct: dec!(0.001),
            leverage: 20,
            close_fee_adjustment: Decimal::ZERO,
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(test_config(TradeType::Buy).validate().is_ok());
    }

    #[test]
    fn inverted_range_rejected() {
        let mut config = test_config(TradeType::Buy);
        config.start_price = dec!(0.280);
        config.end_price = dec!(0.248);
        assert!(config.validate().is_err());
    }

    #[test]
    fn non_positive_total_rejected() {
        let mut config = test_config(TradeType::Buy);
        config.total_amount_quote = Decimal::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_max_open_orders_rejected() {
        let mut config = test_config(TradeType::Buy);
        config.max_open_orders = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_take_profit_rejected() {
        let mut config = test_config(TradeType::Buy);
        config.take_profit_pct = Decimal::ZERO;
        assert!(config.validate().is_err());
    }
}
