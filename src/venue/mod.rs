//! Venue abstraction - the exchange surface the grid engine consumes
//!
//! The executor and controller talk to the venue only through the [`Venue`]
//! trait. The live Binance futures adapter and the in-memory mock both
//! implement it; nothing in the core depends on a concrete exchange.

pub mod binance;
pub mod mock;
mod stream;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use log::info;
use rust_decimal::Decimal;
use tokio::sync::mpsc;

use crate::grid::errors::{GridError, GridResult};
use crate::grid::order::OrderUpdate;
use crate::grid::types::{Balance, OrderCandidate, PlacedOrder, TradingRules};

pub use binance::{BinanceVenue, VenueCredentials};
pub use mock::MockVenue;

/// Positions payload of an account update event
#[derive(Debug, Clone, Copy, Default)]
pub struct PositionsUpdate {
    pub long: Decimal,
    pub short: Decimal,
}

/// Events pushed by the venue's user-data stream
#[derive(Debug, Clone)]
pub enum VenueEvent {
    OrderUpdate(OrderUpdate),
    AccountUpdate(PositionsUpdate),
    /// The stream's listen key expired; the tracker should fall back to
    /// polling until the stream reconnects
    StreamExpired,
}

/// Exchange operations required by the grid engine.
///
/// Synchronous-looking operations may block on I/O. The adapter owns
/// quantization to venue tick sizes, hedge-mode position-side mapping,
/// `reduce_only` on closes, client order id assignment, and the
/// transient/fatal classification of venue errors.
#[async_trait]
pub trait Venue: Send + Sync {
    /// Trading rules discovered at session setup
    fn trading_rules(&self) -> TradingRules;

    /// Mid price from the top of book, falling back to last trade
    async fn mid_price(&self) -> GridResult<Decimal>;

    /// Aggregate hedge-mode positions as (long, short), both non-negative
    async fn positions(&self) -> GridResult<(Decimal, Decimal)>;

    /// All resting orders for the configured pair
    async fn open_orders(&self) -> GridResult<Vec<OrderUpdate>>;

    /// Status of a single order
    async fn order_status(&self, order_id: &str) -> GridResult<Option<OrderUpdate>>;

    /// Bulk status lookup; absent entries mean the venue did not answer for
    /// that id this round
    async fn order_status_bulk(
        &self,
        order_ids: &[String],
    ) -> GridResult<HashMap<String, OrderUpdate>>;

    /// Place an order. The returned ids identify the order on both the
    /// venue side and the event stream.
    async fn place_order(&self, candidate: &OrderCandidate) -> GridResult<PlacedOrder>;

    /// Cancel one order. `Ok(false)` means the venue refused (e.g. already
    /// terminal).
    async fn cancel_order(&self, order_id: &str) -> GridResult<bool>;

    /// Cancel every resting order on the pair
    async fn cancel_all_orders(&self) -> GridResult<bool>;

    /// Market-close every open position on the pair
    async fn close_all_positions(&self) -> GridResult<bool>;

    /// Quote-asset balance
    async fn balance(&self) -> GridResult<Balance>;

    /// REST reachability probe (server ping)
    async fn check_connection(&self) -> bool;

    /// Whether the user-data stream has delivered a heartbeat recently.
    /// Distinct from [`check_connection`](Venue::check_connection): a venue
    /// can be REST-reachable while its stream is stale.
    fn stream_healthy(&self) -> bool;

    /// Subscribe to the user-data event stream. Starts the stream task on
    /// first call.
    async fn subscribe_events(&self) -> GridResult<mpsc::UnboundedReceiver<VenueEvent>>;

    /// Cross-account fund transfer. No venue adapter implements this yet.
    async fn transfer_funds(&self, _asset: &str, _amount: Decimal) -> GridResult<()> {
        Err(GridError::Unsupported("fund transfer"))
    }

    /// Cancel all orders, close all positions, and verify the account is
    /// flat. The settle pauses give the venue time to report the flattened
    /// state.
    async fn cleanup(&self) -> GridResult<bool> {
        info!("Starting account cleanup");

        let cancelled = self.cancel_all_orders().await?;
        tokio::time::sleep(Duration::from_secs(2)).await;

        let closed = self.close_all_positions().await?;
        tokio::time::sleep(Duration::from_secs(2)).await;

        let verified = self.verify_cleanup().await?;
        let success = cancelled && closed && verified;
        info!("Account cleanup finished: success={success}");
        Ok(success)
    }

    /// Verify the account holds no resting orders and no positions
    async fn verify_cleanup(&self) -> GridResult<bool> {
        let orders = self.open_orders().await?;
        if !orders.is_empty() {
            log::warn!("{} orders still resting after cleanup", orders.len());
            return Ok(false);
        }

        let (long, short) = self.positions().await?;
        if long > Decimal::ZERO || short > Decimal::ZERO {
            log::warn!("Positions remain after cleanup: long={long}, short={short}");
            return Ok(false);
        }

        Ok(true)
    }
}
