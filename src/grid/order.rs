//! Order tracking - the executor's mirror of venue-side order state

use log::debug;
use rust_decimal::Decimal;
use serde::Deserialize;

use super::types::{OrderType, TradeType};

/// Venue-side order status.
///
/// `Closed` is kept distinct from `Filled` only for logging; both count as
/// fully executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Closed,
    Canceled,
    Expired,
    Rejected,
}

impl OrderStatus {
    /// Parse a status string from either the REST or the stream payload.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "NEW" | "OPEN" => Some(OrderStatus::New),
            "PARTIALLY_FILLED" => Some(OrderStatus::PartiallyFilled),
            "FILLED" => Some(OrderStatus::Filled),
            "CLOSED" => Some(OrderStatus::Closed),
            "CANCELED" | "CANCELLED" => Some(OrderStatus::Canceled),
            "EXPIRED" => Some(OrderStatus::Expired),
            "REJECTED" => Some(OrderStatus::Rejected),
            _ => None,
        }
    }

    /// Terminal: the venue will never mutate this order again.
    pub fn is_done(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Closed
                | OrderStatus::Canceled
                | OrderStatus::Expired
                | OrderStatus::Rejected
        )
    }

    /// Fully executed.
    pub fn is_filled(&self) -> bool {
        matches!(self, OrderStatus::Filled | OrderStatus::Closed)
    }
}

/// A normalized order update, produced from either update shape.
#[derive(Debug, Clone)]
pub struct OrderUpdate {
    pub order_id: Option<String>,
    pub client_order_id: Option<String>,
    pub status: OrderStatus,
    /// Cumulative executed base amount
    pub executed_amount_base: Decimal,
    /// Cumulative executed quote amount
    pub executed_amount_quote: Decimal,
    /// Cumulative fees in quote, when the payload carries them
    pub fee_quote: Option<Decimal>,
}

/// REST order snapshot as returned by the venue's order-status endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct RestOrderSnapshot {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, rename = "clientOrderId")]
    pub client_order_id: Option<String>,
    pub status: String,
    /// Executed base amount
    #[serde(default)]
    pub filled: Option<Decimal>,
    /// Executed quote amount
    #[serde(default)]
    pub cost: Option<Decimal>,
    #[serde(default)]
    pub fee: Option<RestOrderFee>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RestOrderFee {
    #[serde(default)]
    pub cost: Option<Decimal>,
}

impl RestOrderSnapshot {
    pub fn normalize(&self) -> Option<OrderUpdate> {
        let status = OrderStatus::parse(&self.status)?;
        Some(OrderUpdate {
            order_id: self.id.clone(),
            client_order_id: self.client_order_id.clone(),
            status,
            executed_amount_base: self.filled.unwrap_or_default(),
            executed_amount_quote: self.cost.unwrap_or_default(),
            fee_quote: self.fee.as_ref().and_then(|f| f.cost),
        })
    }
}

/// User-data stream order payload (the `o` object of an order trade update).
#[derive(Debug, Clone, Deserialize)]
pub struct StreamOrderUpdate {
    /// Symbol
    #[serde(default, rename = "s")]
    pub symbol: Option<String>,
    /// Venue order id
    #[serde(default, rename = "i")]
    pub order_id: Option<u64>,
    /// Client order id
    #[serde(default, rename = "c")]
    pub client_order_id: Option<String>,
    /// Order status
    #[serde(rename = "X")]
    pub status: String,
    /// Cumulative filled base amount
    #[serde(default, rename = "z")]
    pub filled_base: Option<Decimal>,
    /// Cumulative filled quote amount
    #[serde(default, rename = "Z")]
    pub filled_quote: Option<Decimal>,
    /// Fee amount
    #[serde(default, rename = "n")]
    pub fee: Option<Decimal>,
    /// Fee asset
    #[serde(default, rename = "N")]
    pub fee_asset: Option<String>,
}

impl StreamOrderUpdate {
    pub fn normalize(&self) -> Option<OrderUpdate> {
        let status = OrderStatus::parse(&self.status)?;
        Some(OrderUpdate {
            order_id: self.order_id.map(|i| i.to_string()),
            client_order_id: self.client_order_id.clone(),
            status,
            executed_amount_base: self.filled_base.unwrap_or_default(),
            executed_amount_quote: self.filled_quote.unwrap_or_default(),
            fee_quote: self.fee,
        })
    }
}

/// Mirror of a single live order. The venue owns the authoritative state;
/// this struct is reconciled on every tick and on every stream event.
#[derive(Debug, Clone)]
pub struct TrackedOrder {
    pub order_id: String,
    pub client_order_id: Option<String>,
    pub side: TradeType,
    pub order_type: OrderType,
    /// Limit price the order was placed at
    pub price: Decimal,
    /// Intended base amount
    pub amount: Decimal,
    pub executed_amount_base: Decimal,
    pub executed_amount_quote: Decimal,
    pub cum_fees_quote: Decimal,
    pub status: OrderStatus,
}

impl TrackedOrder {
    pub fn new(
        order_id: impl Into<String>,
        client_order_id: Option<String>,
        side: TradeType,
        order_type: OrderType,
        price: Decimal,
        amount: Decimal,
    ) -> Self {
        Self {
            order_id: order_id.into(),
            client_order_id,
            side,
            order_type,
            price,
            amount,
            executed_amount_base: Decimal::ZERO,
            executed_amount_quote: Decimal::ZERO,
            cum_fees_quote: Decimal::ZERO,
            status: OrderStatus::New,
        }
    }

    pub fn is_done(&self) -> bool {
        self.status.is_done()
    }

    pub fn is_filled(&self) -> bool {
        self.status.is_filled()
    }

    pub fn is_partially_filled(&self) -> bool {
        self.executed_amount_base > Decimal::ZERO && !self.is_filled()
    }

    /// Apply a normalized update. Updates are monotonic: once the order is
    /// terminal, further updates are ignored. Cumulative fields are
    /// overwritten with the latest values, never summed.
    pub fn apply_update(&mut self, update: &OrderUpdate) -> bool {
        if self.is_done() {
            debug!("Ignoring update for terminal order {}", self.order_id);
            return false;
        }

        self.status = update.status;
        self.executed_amount_base = update.executed_amount_base;
        self.executed_amount_quote = update.executed_amount_quote;
        if let Some(fee) = update.fee_quote {
            self.cum_fees_quote = fee;
        }

        true
    }
}
