//! Core data types for the grid engine

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Order side, which doubles as the grid direction: a long grid opens with
/// buys, a short grid opens with sells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TradeType {
    Buy,
    Sell,
}

impl TradeType {
    /// Returns the opposite side
    pub fn opposite(&self) -> Self {
        match self {
            TradeType::Buy => TradeType::Sell,
            TradeType::Sell => TradeType::Buy,
        }
    }

    /// Convert to the venue's side string
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeType::Buy => "BUY",
            TradeType::Sell => "SELL",
        }
    }
}

/// Order execution type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Limit,
    Market,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Limit => "LIMIT",
            OrderType::Market => "MARKET",
        }
    }
}

/// Whether an order opens or closes a hedge-mode position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionAction {
    Open,
    Close,
}

/// Executor lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunnableStatus {
    NotStarted,
    Running,
    ShuttingDown,
    Terminated,
}

impl RunnableStatus {
    /// Active states still drive (or are about to drive) the control loop
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            RunnableStatus::NotStarted | RunnableStatus::Running | RunnableStatus::ShuttingDown
        )
    }
}

/// Immutable trading rules discovered from the venue.
///
/// All price/amount arithmetic against these is exact decimal; quantization
/// and minimum-notional checks are contractual with the venue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradingRules {
    pub trading_pair: String,
    pub min_price_increment: Decimal,
    pub min_base_amount_increment: Decimal,
    pub min_notional: Decimal,
    pub min_order_size: Decimal,
}

impl TradingRules {
    /// Quantize a price down to the price increment (round toward zero).
    pub fn quantize_price(&self, price: Decimal) -> Decimal {
        quantize_floor(price, self.min_price_increment)
    }

    /// Quantize a price up to the next price increment.
    pub fn quantize_price_up(&self, price: Decimal) -> Decimal {
        let inc = self.min_price_increment;
        if inc <= Decimal::ZERO {
            return price;
        }
        let floored = quantize_floor(price, inc);
        if floored == price {
            price
        } else {
            floored + inc
        }
    }

    /// Quantize a base amount down to the amount increment.
    pub fn quantize_amount(&self, amount: Decimal) -> Decimal {
        quantize_floor(amount, self.min_base_amount_increment)
    }
}

/// Floor `value` to a multiple of `increment`.
pub fn quantize_floor(value: Decimal, increment: Decimal) -> Decimal {
    if increment <= Decimal::ZERO {
        return value;
    }
    (value / increment).floor() * increment
}

/// An order the executor intends to place. The venue adapter quantizes,
/// assigns the client order id, and maps side/action to hedge-mode fields.
#[derive(Debug, Clone)]
pub struct OrderCandidate {
    pub trading_pair: String,
    pub order_type: OrderType,
    pub side: TradeType,
    /// Base-asset amount
    pub amount: Decimal,
    /// Limit price; `None` for market orders
    pub price: Option<Decimal>,
    pub position_action: PositionAction,
}

/// Acknowledgement returned by the venue for a successful placement
#[derive(Debug, Clone)]
pub struct PlacedOrder {
    pub order_id: String,
    pub client_order_id: String,
}

/// Quote-asset balance snapshot
#[derive(Debug, Clone, Default)]
pub struct Balance {
    pub free: Decimal,
    pub used: Decimal,
    pub total: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

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
    fn price_quantization_rounds_toward_zero() {
        let r = rules();
        assert_eq!(r.quantize_price(dec!(0.264019)), dec!(0.26401));
        assert_eq!(r.quantize_price(dec!(0.26400)), dec!(0.26400));
    }

    #[test]
    fn price_quantization_up_rounds_away() {
        let r = rules();
        assert_eq!(r.quantize_price_up(dec!(0.264011)), dec!(0.26402));
        // Already on the grid: unchanged
        assert_eq!(r.quantize_price_up(dec!(0.26400)), dec!(0.26400));
    }

    #[test]
    fn amount_quantization_floors() {
        let r = rules();
        assert_eq!(r.quantize_amount(dec!(37.9)), dec!(37));
        assert_eq!(r.quantize_amount(dec!(37)), dec!(37));
    }

    #[test]
    fn quantization_is_idempotent() {
        let r = rules();
        let once = r.quantize_price(dec!(0.2713577));
        assert_eq!(r.quantize_price(once), once);
    }

    #[test]
    fn opposite_side() {
        assert_eq!(TradeType::Buy.opposite(), TradeType::Sell);
        assert_eq!(TradeType::Sell.opposite(), TradeType::Buy);
    }

    mod laws {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn quantization_round_trips(
                mantissa in 1i64..1_000_000_000,
                scale in 0u32..7,
                increment_index in 0usize..4,
            ) {
                let value = Decimal::new(mantissa, scale);
                let increment =
                    [dec!(0.00001), dec!(0.001), dec!(0.5), dec!(1)][increment_index];

                let quantized = quantize_floor(value, increment);
                prop_assert_eq!(quantize_floor(quantized, increment), quantized);
                prop_assert!(quantized <= value);
                prop_assert!(value - quantized < increment);
                prop_assert_eq!((quantized / increment).fract(), Decimal::ZERO);
            }
        }
    }
}
