//! Grid levels and the per-level order lifecycle

use log::info;
use rust_decimal::Decimal;

use super::order::TrackedOrder;
use super::types::{OrderType, TradeType};

/// Lifecycle state of a grid level, derived from its two order slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GridLevelState {
    NotActive,
    OpenPlaced,
    OpenFilled,
    ClosePlaced,
    Complete,
}

impl GridLevelState {
    pub const ALL: [GridLevelState; 5] = [
        GridLevelState::NotActive,
        GridLevelState::OpenPlaced,
        GridLevelState::OpenFilled,
        GridLevelState::ClosePlaced,
        GridLevelState::Complete,
    ];
}

/// A fixed price point on the ladder, owned by a single executor.
///
/// Levels are created at startup and never destroyed; a completed level is
/// reset and reused. At most one open and one close order exist per level.
#[derive(Debug, Clone)]
pub struct GridLevel {
    pub id: String,
    pub price: Decimal,
    /// Quote notional this level commits per open order
    pub amount_quote: Decimal,
    pub side: TradeType,
    pub order_type: OrderType,
    pub take_profit_pct: Decimal,
    pub active_open_order: Option<TrackedOrder>,
    pub active_close_order: Option<TrackedOrder>,
    pub state: GridLevelState,
}

impl GridLevel {
    pub fn new(
        id: impl Into<String>,
        price: Decimal,
        amount_quote: Decimal,
        side: TradeType,
        order_type: OrderType,
        take_profit_pct: Decimal,
    ) -> Self {
        Self {
            id: id.into(),
            price,
            amount_quote,
            side,
            order_type,
            take_profit_pct,
            active_open_order: None,
            active_close_order: None,
            state: GridLevelState::NotActive,
        }
    }

    /// Re-derive the level state from the two order slots.
    ///
    /// The state is a pure function of the slots; nothing else feeds it.
    pub fn update_state(&mut self) {
        self.state = Self::derive_state(
            self.active_open_order.as_ref(),
            self.active_close_order.as_ref(),
        );
    }

    /// The state table: open slot x close slot.
    pub fn derive_state(
        open: Option<&TrackedOrder>,
        close: Option<&TrackedOrder>,
    ) -> GridLevelState {
        let open = match open {
            None => return GridLevelState::NotActive,
            Some(o) => o,
        };

        if !open.is_done() {
            return GridLevelState::OpenPlaced;
        }
        if !open.is_filled() {
            // Terminal but unfilled: the slot is dead weight, cleared by the
            // failed-order pass on the same tick
            return GridLevelState::NotActive;
        }

        match close {
            None => GridLevelState::OpenFilled,
            Some(c) if !c.is_done() => GridLevelState::ClosePlaced,
            Some(c) if !c.is_filled() => GridLevelState::OpenFilled,
            Some(_) => GridLevelState::Complete,
        }
    }

    /// Drop a terminal-but-unfilled open order so the level can retry.
    pub fn reset_open_order(&mut self) {
        self.active_open_order = None;
        self.update_state();
    }

    /// Drop a terminal-but-unfilled close order so the level can retry
    /// take-profit placement.
    pub fn reset_close_order(&mut self) {
        self.active_close_order = None;
        self.update_state();
    }

    /// Clear both slots after a completed round trip, returning the level to
    /// `NotActive` for reuse.
    pub fn reset_level(&mut self) {
        self.active_open_order = None;
        self.active_close_order = None;
        self.update_state();
        info!("Level {} reset for reuse", self.id);
    }

    /// Realized P&L for a completed round trip, net of fees. Only meaningful
    /// when both slots are filled.
    pub fn realized_pnl(&self) -> Decimal {
        let (open_quote, open_fees) = match &self.active_open_order {
            Some(o) => (o.executed_amount_quote, o.cum_fees_quote),
            None => return Decimal::ZERO,
        };
        let (close_quote, close_fees) = match &self.active_close_order {
            Some(c) => (c.executed_amount_quote, c.cum_fees_quote),
            None => return Decimal::ZERO,
        };

        let gross = match self.side {
            // Long: bought at the open, sold at the close
            TradeType::Buy => close_quote - open_quote,
            // Short: sold at the open, bought back at the close
            TradeType::Sell => open_quote - close_quote,
        };
        gross - open_fees - close_fees
    }

    /// The level's nominal take-profit price, before any safe-spread
    /// adjustment against the current mid.
    pub fn take_profit_price(&self) -> Option<Decimal> {
        let open = self.active_open_order.as_ref()?;
        let pct = self.take_profit_pct;
        Some(match self.side {
            TradeType::Buy => open.price * (Decimal::ONE + pct),
            TradeType::Sell => open.price * (Decimal::ONE - pct),
        })
    }
}
