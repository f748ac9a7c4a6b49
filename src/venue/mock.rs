//! In-memory venue for driving the engine in tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::grid::errors::{GridError, GridResult};
use crate::grid::order::{OrderStatus, OrderUpdate};
use crate::grid::types::{
    Balance, OrderCandidate, OrderType, PlacedOrder, PositionAction, TradeType, TradingRules,
};

use super::{Venue, VenueEvent};

/// One simulated order on the mock venue's book
#[derive(Debug, Clone)]
pub struct MockOrder {
    pub order_id: String,
    pub client_order_id: String,
    pub side: TradeType,
    pub position_action: PositionAction,
    pub price: Decimal,
    pub amount: Decimal,
    pub status: OrderStatus,
    pub executed_base: Decimal,
    pub executed_quote: Decimal,
    pub fee_quote: Decimal,
}

impl MockOrder {
    fn to_update(&self) -> OrderUpdate {
        OrderUpdate {
            order_id: Some(self.order_id.clone()),
            client_order_id: Some(self.client_order_id.clone()),
            status: self.status,
            executed_amount_base: self.executed_base,
            executed_amount_quote: self.executed_quote,
            fee_quote: Some(self.fee_quote),
        }
    }
}

/// Mock venue: orders rest until a test fills, cancels, or rejects them.
pub struct MockVenue {
    rules: TradingRules,
    pub mid_price: Arc<Mutex<Decimal>>,
    pub orders: Arc<Mutex<HashMap<String, MockOrder>>>,
    /// Placement log in venue-receive order
    pub placed: Arc<Mutex<Vec<MockOrder>>>,
    pub cancelled: Arc<Mutex<Vec<String>>>,
    pub long_position: Arc<Mutex<Decimal>>,
    pub short_position: Arc<Mutex<Decimal>>,
    pub free_balance: Arc<Mutex<Decimal>>,
    pub should_fail_place: Arc<Mutex<bool>>,
    /// Error returned by `mid_price` while set, for driving the retry and
    /// escalation paths
    pub mid_price_error: Arc<Mutex<Option<GridError>>>,
    pub rest_reachable: Arc<Mutex<bool>>,
    pub stream_is_healthy: Arc<Mutex<bool>>,
    event_tx: Arc<Mutex<Option<mpsc::UnboundedSender<VenueEvent>>>>,
    next_order_id: AtomicU64,
}

impl MockVenue {
    pub fn new(mid_price: Decimal) -> Self {
        Self {
            rules: TradingRules {
                trading_pair: "XRP/USDC:USDC".to_string(),
                min_price_increment: dec!(0.00001),
                min_base_amount_increment: dec!(1),
                min_notional: dec!(5),
                min_order_size: dec!(1),
            },
            mid_price: Arc::new(Mutex::new(mid_price)),
            orders: Arc::new(Mutex::new(HashMap::new())),
            placed: Arc::new(Mutex::new(Vec::new())),
            cancelled: Arc::new(Mutex::new(Vec::new())),
            long_position: Arc::new(Mutex::new(Decimal::ZERO)),
            short_position: Arc::new(Mutex::new(Decimal::ZERO)),
            free_balance: Arc::new(Mutex::new(dec!(100000))),
            should_fail_place: Arc::new(Mutex::new(false)),
            mid_price_error: Arc::new(Mutex::new(None)),
            rest_reachable: Arc::new(Mutex::new(true)),
            stream_is_healthy: Arc::new(Mutex::new(true)),
            event_tx: Arc::new(Mutex::new(None)),
            next_order_id: AtomicU64::new(1),
        }
    }

    pub fn with_rules(mid_price: Decimal, rules: TradingRules) -> Self {
        let mut venue = Self::new(mid_price);
        venue.rules = rules;
        venue
    }

    pub async fn set_mid_price(&self, price: Decimal) {
        *self.mid_price.lock().await = price;
    }

    pub async fn set_should_fail_place(&self, fail: bool) {
        *self.should_fail_place.lock().await = fail;
    }

    /// Fully fill a resting order at its limit price.
    pub async fn fill_order(&self, order_id: &str) {
        self.fill_order_with_fee(order_id, Decimal::ZERO).await;
    }

    pub async fn fill_order_with_fee(&self, order_id: &str, fee_quote: Decimal) {
        let mut orders = self.orders.lock().await;
        if let Some(order) = orders.get_mut(order_id) {
            order.status = OrderStatus::Filled;
            order.executed_base = order.amount;
            order.executed_quote = order.amount * order.price;
            order.fee_quote = fee_quote;
        }
    }

    /// Cancel an order venue-side after a partial execution, as a taker
    /// sweep followed by a user cancel would.
    pub async fn cancel_after_partial(&self, order_id: &str, executed_base: Decimal) {
        let mut orders = self.orders.lock().await;
        if let Some(order) = orders.get_mut(order_id) {
            order.status = OrderStatus::Canceled;
            order.executed_base = executed_base;
            order.executed_quote = executed_base * order.price;
        }
    }

    pub async fn reject_order(&self, order_id: &str) {
        let mut orders = self.orders.lock().await;
        if let Some(order) = orders.get_mut(order_id) {
            order.status = OrderStatus::Rejected;
        }
    }

    /// Ids of orders currently resting (not terminal), in placement order.
    pub async fn resting_order_ids(&self) -> Vec<String> {
        let placed = self.placed.lock().await;
        let orders = self.orders.lock().await;
        placed
            .iter()
            .filter(|p| {
                orders
                    .get(&p.order_id)
                    .map(|o| !o.status.is_done())
                    .unwrap_or(false)
            })
            .map(|p| p.order_id.clone())
            .collect()
    }

    /// Push an event as the user-data stream task would.
    pub async fn push_event(&self, event: VenueEvent) {
        if let Some(tx) = self.event_tx.lock().await.as_ref() {
            let _ = tx.send(event);
        }
    }
}

#[async_trait]
impl Venue for MockVenue {
    fn trading_rules(&self) -> TradingRules {
        self.rules.clone()
    }

    async fn mid_price(&self) -> GridResult<Decimal> {
        if let Some(error) = self.mid_price_error.lock().await.clone() {
            return Err(error);
        }
        Ok(*self.mid_price.lock().await)
    }

    async fn positions(&self) -> GridResult<(Decimal, Decimal)> {
        Ok((
            *self.long_position.lock().await,
            *self.short_position.lock().await,
        ))
    }

    async fn open_orders(&self) -> GridResult<Vec<OrderUpdate>> {
        let orders = self.orders.lock().await;
        Ok(orders
            .values()
            .filter(|o| !o.status.is_done())
            .map(|o| o.to_update())
            .collect())
    }

    async fn order_status(&self, order_id: &str) -> GridResult<Option<OrderUpdate>> {
        let orders = self.orders.lock().await;
        Ok(orders.get(order_id).map(|o| o.to_update()))
    }

    async fn order_status_bulk(
        &self,
        order_ids: &[String],
    ) -> GridResult<HashMap<String, OrderUpdate>> {
        let orders = self.orders.lock().await;
        Ok(order_ids
            .iter()
            .filter_map(|id| orders.get(id).map(|o| (id.clone(), o.to_update())))
            .collect())
    }

    async fn place_order(&self, candidate: &OrderCandidate) -> GridResult<PlacedOrder> {
        if *self.should_fail_place.lock().await {
            return Err(GridError::Venue("mock placement failure".into()));
        }

        // Mirror the live adapter's quantization and notional gate
        let amount = self.rules.quantize_amount(candidate.amount);
        let price = match (candidate.order_type, candidate.price) {
            (OrderType::Limit, Some(p)) => self.rules.quantize_price(p),
            (OrderType::Market, _) => *self.mid_price.lock().await,
            (OrderType::Limit, None) => {
                return Err(GridError::Venue("limit order without price".into()))
            }
        };

        if amount * price < self.rules.min_notional {
            return Err(GridError::Venue(format!(
                "notional {} below venue minimum {}",
                amount * price,
                self.rules.min_notional
            )));
        }

        let order_id = self.next_order_id.fetch_add(1, Ordering::SeqCst).to_string();
        let client_order_id = format!("DualGridBot_{}", &Uuid::new_v4().simple().to_string()[..8]);

        let order = MockOrder {
            order_id: order_id.clone(),
            client_order_id: client_order_id.clone(),
            side: candidate.side,
            position_action: candidate.position_action,
            price,
            amount,
            status: OrderStatus::New,
            executed_base: Decimal::ZERO,
            executed_quote: Decimal::ZERO,
            fee_quote: Decimal::ZERO,
        };

        self.orders.lock().await.insert(order_id.clone(), order.clone());
        self.placed.lock().await.push(order);

        Ok(PlacedOrder {
            order_id,
            client_order_id,
        })
    }

    async fn cancel_order(&self, order_id: &str) -> GridResult<bool> {
        self.cancelled.lock().await.push(order_id.to_string());

        let mut orders = self.orders.lock().await;
        match orders.get_mut(order_id) {
            Some(order) if !order.status.is_done() => {
                order.status = OrderStatus::Canceled;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Ok(false),
        }
    }

    async fn cancel_all_orders(&self) -> GridResult<bool> {
        let mut orders = self.orders.lock().await;
        for order in orders.values_mut() {
            if !order.status.is_done() {
                order.status = OrderStatus::Canceled;
            }
        }
        Ok(true)
    }

    async fn close_all_positions(&self) -> GridResult<bool> {
        *self.long_position.lock().await = Decimal::ZERO;
        *self.short_position.lock().await = Decimal::ZERO;
        Ok(true)
    }

    async fn balance(&self) -> GridResult<Balance> {
        let free = *self.free_balance.lock().await;
        Ok(Balance {
            free,
            used: Decimal::ZERO,
            total: free,
        })
    }

    async fn check_connection(&self) -> bool {
        *self.rest_reachable.lock().await
    }

    fn stream_healthy(&self) -> bool {
        self.stream_is_healthy
            .try_lock()
            .map(|healthy| *healthy)
            .unwrap_or(true)
    }

    async fn subscribe_events(&self) -> GridResult<mpsc::UnboundedReceiver<VenueEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.event_tx.lock().await = Some(tx);
        Ok(rx)
    }
}
