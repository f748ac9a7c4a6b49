//! Grid executor - the per-account control loop
//!
//! Drives one account's ladder: keeps at most one open and one close order
//! per level, walks each level through its lifecycle in response to fills,
//! and enforces the capacity, proximity, and rate policies.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use rust_decimal::Decimal;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::venue::{Venue, VenueEvent};

use super::config::GridExecutorConfig;
use super::errors::{GridError, GridResult};
use super::ladder::build_ladder;
use super::level::{GridLevel, GridLevelState};
use super::order::{OrderUpdate, TrackedOrder};
use super::types::{OrderCandidate, OrderType, PositionAction, RunnableStatus, TradeType, TradingRules};

/// Point-in-time snapshot of an executor, published every tick.
#[derive(Debug, Clone)]
pub struct ExecutorStatus {
    pub id: String,
    pub side: TradeType,
    pub status: RunnableStatus,
    pub levels_by_state: HashMap<GridLevelState, usize>,
    pub position_size_base: Decimal,
    pub current_retries: u32,
    pub max_retries: u32,
    pub realized_pnl: Decimal,
    pub completed_trips: u32,
}

impl ExecutorStatus {
    /// Healthy means the control loop can keep going unattended.
    pub fn is_healthy(&self) -> bool {
        matches!(
            self.status,
            RunnableStatus::NotStarted | RunnableStatus::Running
        ) && self.current_retries < self.max_retries
    }
}

/// Per-account grid state machine.
///
/// The executor exclusively owns its levels and tracked orders; the venue
/// owns the authoritative order state, mirrored here on every tick and on
/// every stream event.
pub struct GridExecutor {
    config: GridExecutorConfig,
    venue: Arc<dyn Venue>,
    rules: TradingRules,
    update_interval: Duration,
    max_retries: u32,

    grid_levels: Vec<GridLevel>,
    status: RunnableStatus,
    current_retries: u32,
    position_size_base: Decimal,

    /// When the most recent open order was placed, for the rate throttle
    last_open_placement: Option<Instant>,

    /// Updates pushed by the user-data stream between ticks
    events: mpsc::UnboundedReceiver<VenueEvent>,
    /// Order ids already updated by events this tick; skipped when polling
    fresh_order_ids: HashSet<String>,
    /// An account event already refreshed the position mirror this tick
    position_fresh: bool,

    realized_pnl: Decimal,
    completed_trips: u32,
}

impl GridExecutor {
    /// Build the executor: validate the configuration, discover trading
    /// rules, and lay out the ladder from the current mid price.
    pub async fn new(
        config: GridExecutorConfig,
        venue: Arc<dyn Venue>,
        events: mpsc::UnboundedReceiver<VenueEvent>,
        update_interval: Duration,
        max_retries: u32,
    ) -> GridResult<Self> {
        config.validate()?;

        let rules = venue.trading_rules();
        let mid = venue.mid_price().await?;
        let ladder = build_ladder(&config, &rules, mid)?;

        info!(
            "Executor {} initialized: {:?} side, {} levels",
            config.id,
            config.side,
            ladder.levels.len()
        );

        Ok(Self {
            config,
            venue,
            rules,
            update_interval,
            max_retries,
            grid_levels: ladder.levels,
            status: RunnableStatus::NotStarted,
            current_retries: 0,
            position_size_base: Decimal::ZERO,
            last_open_placement: None,
            events,
            fresh_order_ids: HashSet::new(),
            position_fresh: false,
            realized_pnl: Decimal::ZERO,
            completed_trips: 0,
        })
    }

    pub fn status(&self) -> RunnableStatus {
        self.status
    }

    pub fn config(&self) -> &GridExecutorConfig {
        &self.config
    }

    pub fn levels(&self) -> &[GridLevel] {
        &self.grid_levels
    }

    /// Mark the executor runnable. The controller calls this right before
    /// spawning the control loop.
    pub fn start(&mut self) {
        self.status = RunnableStatus::Running;
    }

    /// Request a cooperative shutdown; the next tick cancels the orders,
    /// closes the position, and terminates.
    pub fn begin_shutdown(&mut self) {
        if self.status == RunnableStatus::Running || self.status == RunnableStatus::NotStarted {
            self.status = RunnableStatus::ShuttingDown;
        }
    }

    pub fn status_snapshot(&self) -> ExecutorStatus {
        let mut levels_by_state: HashMap<GridLevelState, usize> =
            GridLevelState::ALL.iter().map(|s| (*s, 0)).collect();
        for level in &self.grid_levels {
            *levels_by_state.entry(level.state).or_default() += 1;
        }

        ExecutorStatus {
            id: self.config.id.clone(),
            side: self.config.side,
            status: self.status,
            levels_by_state,
            position_size_base: self.position_size_base,
            current_retries: self.current_retries,
            max_retries: self.max_retries,
            realized_pnl: self.realized_pnl,
            completed_trips: self.completed_trips,
        }
    }

    /// One pass of the control loop, in strict order: ingest events, refresh
    /// order mirrors, re-derive level states, refresh the position mirror,
    /// then decide and act.
    pub async fn control_tick(&mut self) -> GridResult<()> {
        self.drain_events();
        self.refresh_orders().await?;
        self.update_grid_levels();
        self.update_position_mirror().await;

        match self.status {
            RunnableStatus::Running => self.process_decisions().await?,
            RunnableStatus::ShuttingDown => {
                self.cancel_open_orders().await;
                self.close_open_positions().await;
                self.status = RunnableStatus::Terminated;
                info!("Executor {} terminated", self.config.id);
            }
            _ => {}
        }

        Ok(())
    }

    /// Run the control loop until terminated, publishing status snapshots.
    /// A flipped stop signal triggers the shutdown sequence.
    pub async fn run(
        mut self,
        mut stop: watch::Receiver<bool>,
        status_tx: watch::Sender<ExecutorStatus>,
    ) {
        if self.status == RunnableStatus::NotStarted {
            self.start();
        }

        loop {
            if *stop.borrow() {
                self.begin_shutdown();
            }

            match self.control_tick().await {
                Ok(()) => self.current_retries = 0,
                Err(e) if !e.is_transient() => {
                    error!(
                        "Executor {} hit a persistent venue error, shutting down: {}",
                        self.config.id, e
                    );
                    self.begin_shutdown();
                }
                Err(e) => {
                    self.current_retries += 1;
                    error!(
                        "Executor {} tick failed ({}/{}): {}",
                        self.config.id, self.current_retries, self.max_retries, e
                    );
                    if self.current_retries >= self.max_retries {
                        error!(
                            "Executor {} exhausted retries, shutting down",
                            self.config.id
                        );
                        self.begin_shutdown();
                    }
                }
            }

            let _ = status_tx.send(self.status_snapshot());

            if self.status == RunnableStatus::Terminated {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.update_interval) => {}
                _ = stop.changed() => {}
            }
        }

        let _ = status_tx.send(self.status_snapshot());
    }

    // ── Step 1: event ingress ───────────────────────────────────────────

    fn drain_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            match event {
                VenueEvent::OrderUpdate(update) => self.apply_event_update(update),
                VenueEvent::AccountUpdate(positions) => {
                    self.position_size_base = match self.config.side {
                        TradeType::Buy => positions.long,
                        TradeType::Sell => positions.short,
                    };
                    self.position_fresh = true;
                }
                VenueEvent::StreamExpired => {
                    warn!(
                        "Executor {}: user-data stream expired, relying on polling",
                        self.config.id
                    );
                }
            }
        }
    }

    fn apply_event_update(&mut self, update: OrderUpdate) {
        let mut matched = None;

        'levels: for level in &mut self.grid_levels {
            for order in [&mut level.active_open_order, &mut level.active_close_order] {
                if let Some(tracked) = order {
                    let by_client = match (&update.client_order_id, &tracked.client_order_id) {
                        (Some(a), Some(b)) => a == b,
                        _ => false,
                    };
                    let by_id = update.order_id.as_deref() == Some(tracked.order_id.as_str());

                    if by_client || by_id {
                        if tracked.apply_update(&update) {
                            matched = Some(tracked.order_id.clone());
                        }
                        break 'levels;
                    }
                }
            }
        }

        match matched {
            Some(order_id) => {
                self.fresh_order_ids.insert(order_id);
            }
            None => {
                // Likely a residual from a previous run on this account
                info!(
                    "Executor {}: event for untracked order (client id {:?}), ignored",
                    self.config.id, update.client_order_id
                );
            }
        }
    }

    // ── Step 2: order refresh ───────────────────────────────────────────

    async fn refresh_orders(&mut self) -> GridResult<()> {
        let mut to_poll = Vec::new();
        for level in &self.grid_levels {
            for order in [&level.active_open_order, &level.active_close_order] {
                if let Some(tracked) = order {
                    if !tracked.is_done() && !self.fresh_order_ids.contains(&tracked.order_id) {
                        to_poll.push(tracked.order_id.clone());
                    }
                }
            }
        }
        self.fresh_order_ids.clear();

        if to_poll.is_empty() {
            return Ok(());
        }

        let statuses = self.venue.order_status_bulk(&to_poll).await?;
        self.apply_polled_statuses(&statuses);
        Ok(())
    }

    fn apply_polled_statuses(&mut self, statuses: &HashMap<String, OrderUpdate>) {
        for level in &mut self.grid_levels {
            for order in [&mut level.active_open_order, &mut level.active_close_order] {
                if let Some(tracked) = order {
                    if let Some(update) = statuses.get(&tracked.order_id) {
                        let was_filled = tracked.is_filled();
                        if tracked.apply_update(update) && !was_filled && tracked.is_filled() {
                            info!(
                                "Order {} filled: base={}, quote={}",
                                tracked.order_id,
                                tracked.executed_amount_base,
                                tracked.executed_amount_quote
                            );
                        }
                    }
                }
            }
        }
    }

    // ── Step 3: level state derivation ─────────────────────────────────

    fn update_grid_levels(&mut self) {
        for level in &mut self.grid_levels {
            level.update_state();
        }

        // Completed round trips: realize the P&L and recycle the level
        let mut completed_pnl = Decimal::ZERO;
        let mut completed = 0u32;
        for level in &mut self.grid_levels {
            if level.state != GridLevelState::Complete {
                continue;
            }

            let pnl = level.realized_pnl();
            info!(
                "Level {} round trip complete: open={}, close={}, net={}",
                level.id,
                level
                    .active_open_order
                    .as_ref()
                    .map(|o| o.executed_amount_quote)
                    .unwrap_or_default(),
                level
                    .active_close_order
                    .as_ref()
                    .map(|o| o.executed_amount_quote)
                    .unwrap_or_default(),
                pnl
            );
            completed_pnl += pnl;
            completed += 1;
            level.reset_level();
        }
        self.realized_pnl += completed_pnl;
        self.completed_trips += completed;

        // Terminal-but-unfilled slots: clear so the level can retry
        for level in &mut self.grid_levels {
            if let Some(open) = &level.active_open_order {
                if open.is_done() && !open.is_filled() {
                    warn!(
                        "Level {} open order {} ended {:?} unfilled",
                        level.id, open.order_id, open.status
                    );
                    level.reset_open_order();
                }
            }
            if let Some(close) = &level.active_close_order {
                if close.is_done() && !close.is_filled() {
                    warn!(
                        "Level {} close order {} ended {:?} unfilled",
                        level.id, close.order_id, close.status
                    );
                    level.reset_close_order();
                }
            }
        }
    }

    // ── Step 4: position mirror ────────────────────────────────────────

    async fn update_position_mirror(&mut self) {
        if self.position_fresh {
            self.position_fresh = false;
            return;
        }
        match self.venue.positions().await {
            Ok((long, short)) => {
                self.position_size_base = match self.config.side {
                    TradeType::Buy => long,
                    TradeType::Sell => short,
                };
            }
            Err(e) => warn!(
                "Executor {}: position refresh failed: {}",
                self.config.id, e
            ),
        }
    }

    // ── Step 5: decide and act ─────────────────────────────────────────

    async fn process_decisions(&mut self) -> GridResult<()> {
        let mid = self.venue.mid_price().await?;

        let opens = self.get_open_orders_to_create(mid);
        let closes = self.get_close_orders_to_create(mid);
        let open_cancels = self.get_open_order_ids_to_cancel(mid);
        let close_cancels = self.get_close_order_ids_to_cancel(mid);

        for idx in opens {
            // The cap and the throttle can both be consumed by placements
            // earlier in this same tick
            if self.count_levels_in(GridLevelState::OpenPlaced) >= self.config.max_open_orders as usize
            {
                debug!("Open-order cap reached mid-tick, stopping placements");
                break;
            }
            if self.open_throttle_active() {
                break;
            }
            if let Err(e) = self.adjust_and_place_open_order(idx).await {
                warn!(
                    "Executor {}: open placement for level {} failed: {}",
                    self.config.id, self.grid_levels[idx].id, e
                );
            }
        }

        for idx in closes {
            if let Err(e) = self.adjust_and_place_close_order(idx, mid).await {
                warn!(
                    "Executor {}: close placement for level {} failed: {}",
                    self.config.id, self.grid_levels[idx].id, e
                );
            }
        }

        for order_id in open_cancels.into_iter().chain(close_cancels) {
            if let Err(e) = self.cancel_order(&order_id).await {
                warn!(
                    "Executor {}: cancel of {} failed: {}",
                    self.config.id, order_id, e
                );
            }
        }

        Ok(())
    }

    fn count_levels_in(&self, state: GridLevelState) -> usize {
        self.grid_levels.iter().filter(|l| l.state == state).count()
    }

    fn open_throttle_active(&self) -> bool {
        if self.config.order_frequency == 0 {
            return false;
        }
        match self.last_open_placement {
            Some(at) => at.elapsed() < Duration::from_secs(self.config.order_frequency),
            None => false,
        }
    }

    fn within_activation_bounds(&self, price: Decimal, mid: Decimal) -> bool {
        match self.config.activation_bounds {
            Some(bounds) => mid > Decimal::ZERO && (price - mid).abs() / mid <= bounds,
            None => true,
        }
    }

    /// NotActive levels eligible for a fresh open order, closest to mid
    /// first, capped by the remaining open-order budget.
    fn get_open_orders_to_create(&self, mid: Decimal) -> Vec<usize> {
        if self.open_throttle_active() {
            return Vec::new();
        }

        let n_open = self.count_levels_in(GridLevelState::OpenPlaced);
        if n_open >= self.config.max_open_orders as usize {
            return Vec::new();
        }

        let mut eligible: Vec<usize> = self
            .grid_levels
            .iter()
            .enumerate()
            .filter(|(_, l)| {
                l.state == GridLevelState::NotActive && self.within_activation_bounds(l.price, mid)
            })
            .map(|(i, _)| i)
            .collect();

        eligible.sort_by_key(|&i| (self.grid_levels[i].price - mid).abs());
        eligible.truncate(self.config.max_open_orders as usize - n_open);
        eligible
    }

    /// OpenFilled levels whose take-profit price is inside the activation
    /// window (every such level when bounds are unset).
    fn get_close_orders_to_create(&self, mid: Decimal) -> Vec<usize> {
        self.grid_levels
            .iter()
            .enumerate()
            .filter(|(_, l)| l.state == GridLevelState::OpenFilled)
            .filter(|(_, l)| match l.take_profit_price() {
                Some(tp) => self.within_activation_bounds(tp, mid),
                None => false,
            })
            .map(|(i, _)| i)
            .collect()
    }

    fn get_open_order_ids_to_cancel(&self, mid: Decimal) -> Vec<String> {
        if self.config.activation_bounds.is_none() {
            return Vec::new();
        }

        self.grid_levels
            .iter()
            .filter(|l| l.state == GridLevelState::OpenPlaced)
            .filter_map(|l| l.active_open_order.as_ref())
            .filter(|o| !self.within_activation_bounds(o.price, mid))
            .map(|o| o.order_id.clone())
            .collect()
    }

    fn get_close_order_ids_to_cancel(&self, mid: Decimal) -> Vec<String> {
        if self.config.activation_bounds.is_none() {
            return Vec::new();
        }

        self.grid_levels
            .iter()
            .filter(|l| l.state == GridLevelState::ClosePlaced)
            .filter_map(|l| l.active_close_order.as_ref())
            .filter(|o| !self.within_activation_bounds(o.price, mid))
            .map(|o| o.order_id.clone())
            .collect()
    }

    async fn adjust_and_place_open_order(&mut self, idx: usize) -> GridResult<()> {
        let level = &self.grid_levels[idx];
        let price = self.rules.quantize_price(level.price);
        let amount = self.rules.quantize_amount(level.amount_quote / level.price);

        let candidate = OrderCandidate {
            trading_pair: self.config.trading_pair.clone(),
            order_type: level.order_type,
            side: self.config.side,
            amount,
            price: Some(price),
            position_action: PositionAction::Open,
        };

        let placed = self.venue.place_order(&candidate).await?;
        self.last_open_placement = Some(Instant::now());

        let level = &mut self.grid_levels[idx];
        level.active_open_order = Some(TrackedOrder::new(
            placed.order_id.clone(),
            Some(placed.client_order_id),
            candidate.side,
            candidate.order_type,
            price,
            amount,
        ));
        level.update_state();

        info!(
            "Level {} open order placed: {} {} @ {} (order {})",
            level.id,
            candidate.side.as_str(),
            amount,
            price,
            placed.order_id
        );
        Ok(())
    }

    async fn adjust_and_place_close_order(&mut self, idx: usize, mid: Decimal) -> GridResult<()> {
        let level = &self.grid_levels[idx];

        let open = match &level.active_open_order {
            Some(o) if o.is_filled() => o,
            _ => {
                debug!("Level {} open not filled, skipping close", level.id);
                return Ok(());
            }
        };
        if level.active_close_order.is_some() {
            // One close order at a time; a stale one is cancelled by the
            // distance pass and replaced on a later tick
            return Ok(());
        }

        let take_profit = match self.config.side {
            TradeType::Buy => open.price * (Decimal::ONE + level.take_profit_pct),
            TradeType::Sell => open.price * (Decimal::ONE - level.take_profit_pct),
        };

        // Keep the close out of the book's crossing range on adverse moves
        let (raw_price, close_side) = match self.config.side {
            TradeType::Buy => {
                let price = if take_profit <= mid {
                    let adjusted = mid * (Decimal::ONE + self.config.safe_extra_spread);
                    debug!(
                        "Level {} take-profit {} under mid, raised to {}",
                        level.id, take_profit, adjusted
                    );
                    adjusted
                } else {
                    take_profit
                };
                (price, TradeType::Sell)
            }
            TradeType::Sell => {
                let price = if take_profit >= mid {
                    let adjusted = mid * (Decimal::ONE - self.config.safe_extra_spread);
                    debug!(
                        "Level {} take-profit {} over mid, lowered to {}",
                        level.id, take_profit, adjusted
                    );
                    adjusted
                } else {
                    take_profit
                };
                (price, TradeType::Buy)
            }
        };

        // Quantize away from the level so the target is never given back
        let close_price = match self.config.side {
            TradeType::Buy => self.rules.quantize_price_up(raw_price),
            TradeType::Sell => self.rules.quantize_price(raw_price),
        };

        let mut close_amount = open.executed_amount_base;
        if open.cum_fees_quote > Decimal::ZERO
            && self.config.close_fee_adjustment > Decimal::ZERO
        {
            close_amount -= close_amount * self.config.close_fee_adjustment;
        }
        let close_amount = self.rules.quantize_amount(close_amount);

        if close_amount < self.rules.min_order_size {
            warn!(
                "Level {} close amount {} below venue minimum {}",
                level.id, close_amount, self.rules.min_order_size
            );
            return Ok(());
        }

        let candidate = OrderCandidate {
            trading_pair: self.config.trading_pair.clone(),
            order_type: OrderType::Limit,
            side: close_side,
            amount: close_amount,
            price: Some(close_price),
            position_action: PositionAction::Close,
        };

        let placed = self.venue.place_order(&candidate).await?;

        let level = &mut self.grid_levels[idx];
        level.active_close_order = Some(TrackedOrder::new(
            placed.order_id.clone(),
            Some(placed.client_order_id),
            close_side,
            OrderType::Limit,
            close_price,
            close_amount,
        ));
        level.update_state();

        info!(
            "Level {} take-profit placed: {} {} @ {} (order {})",
            level.id,
            close_side.as_str(),
            close_amount,
            close_price,
            placed.order_id
        );
        Ok(())
    }

    /// Request a cancel. The slot is deliberately left alone; the state
    /// machine clears it once the terminal status is observed on a refresh.
    async fn cancel_order(&self, order_id: &str) -> GridResult<()> {
        if !self.venue.cancel_order(order_id).await? {
            return Err(GridError::OrderNotFound(order_id.to_string()));
        }
        Ok(())
    }

    // ── Shutdown ───────────────────────────────────────────────────────

    async fn cancel_open_orders(&mut self) {
        match self.venue.cancel_all_orders().await {
            Ok(_) => {
                for level in &mut self.grid_levels {
                    if level
                        .active_open_order
                        .as_ref()
                        .map(|o| !o.is_filled())
                        .unwrap_or(false)
                    {
                        level.reset_open_order();
                    }
                    if level
                        .active_close_order
                        .as_ref()
                        .map(|o| !o.is_filled())
                        .unwrap_or(false)
                    {
                        level.reset_close_order();
                    }
                }
                info!("Executor {}: all orders cancelled", self.config.id);
            }
            Err(e) => error!("Executor {}: cancel-all failed: {}", self.config.id, e),
        }
    }

    async fn close_open_positions(&mut self) {
        match self.venue.close_all_positions().await {
            Ok(true) => info!("Executor {}: positions closed", self.config.id),
            Ok(false) => error!("Executor {}: position close incomplete", self.config.id),
            Err(e) => error!("Executor {}: position close failed: {}", self.config.id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::config::tests::test_config;
    use crate::grid::order::OrderStatus;
    use crate::venue::mock::MockOrder;
    use crate::venue::{MockVenue, PositionsUpdate};
    use rust_decimal_macros::dec;

    async fn make_executor(
        config: GridExecutorConfig,
        mid: Decimal,
    ) -> (GridExecutor, Arc<MockVenue>) {
        let venue = Arc::new(MockVenue::new(mid));
        let events = venue.subscribe_events().await.unwrap();
        let mut executor = GridExecutor::new(
            config,
            venue.clone(),
            events,
            Duration::from_secs(1),
            10,
        )
        .await
        .unwrap();
        executor.start();
        (executor, venue)
    }

    async fn placed_by_side(venue: &MockVenue, side: TradeType) -> Vec<MockOrder> {
        venue
            .placed
            .lock()
            .await
            .iter()
            .filter(|o| o.side == side)
            .cloned()
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn first_tick_places_cap_worth_of_opens_nearest_mid() {
        let (mut executor, venue) = make_executor(test_config(TradeType::Buy), dec!(0.264)).await;

        executor.control_tick().await.unwrap();

        let buys = placed_by_side(&venue, TradeType::Buy).await;
        assert_eq!(buys.len(), 5);
        assert_eq!(
            executor.count_levels_in(GridLevelState::OpenPlaced),
            5
        );

        // The five levels closest to mid; with this ladder that is within
        // three steps of 0.264
        for order in &buys {
            assert!((order.price - dec!(0.264)).abs() < dec!(0.0006));
            assert_eq!(order.position_action, PositionAction::Open);
        }

        // Invariant 3/4: placements land quantized and above min notional
        let rules = venue.trading_rules();
        for order in &buys {
            assert_eq!(rules.quantize_price(order.price), order.price);
            assert_eq!(rules.quantize_amount(order.amount), order.amount);
            assert!(order.amount * order.price >= rules.min_notional);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fill_drives_level_through_close_to_reset() {
        let (mut executor, venue) = make_executor(test_config(TradeType::Buy), dec!(0.264)).await;
        executor.control_tick().await.unwrap();

        // Fill the lowest of the resting buys
        let buys = placed_by_side(&venue, TradeType::Buy).await;
        let lowest = buys.iter().min_by_key(|o| o.price).unwrap().clone();
        venue.fill_order(&lowest.order_id).await;

        executor.control_tick().await.unwrap();

        // The filled level placed its take-profit sell one tp step up
        let sells = placed_by_side(&venue, TradeType::Sell).await;
        assert_eq!(sells.len(), 1);
        let close = &sells[0];
        assert_eq!(close.position_action, PositionAction::Close);
        let expected = venue
            .trading_rules()
            .quantize_price_up(lowest.price * dec!(1.001));
        assert_eq!(close.price, expected);
        assert_eq!(close.amount, lowest.amount);

        let filled_level = executor
            .levels()
            .iter()
            .find(|l| l.state == GridLevelState::ClosePlaced)
            .expect("one level should hold the close order");
        let level_id = filled_level.id.clone();

        // Fill the take-profit: the level completes and resets for reuse
        venue.fill_order(&close.order_id).await;
        executor.control_tick().await.unwrap();

        let level = executor
            .levels()
            .iter()
            .find(|l| l.id == level_id)
            .unwrap();
        assert_eq!(level.state, GridLevelState::NotActive);
        assert!(level.active_open_order.is_none());
        assert!(level.active_close_order.is_none());
        assert_eq!(executor.completed_trips, 1);
        // Round trip at +0.1% with no fees nets a profit
        assert!(executor.realized_pnl > Decimal::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn open_placements_respect_order_frequency() {
        let mut config = test_config(TradeType::Buy);
        config.order_frequency = 30;
        let (mut executor, venue) = make_executor(config, dec!(0.264)).await;

        // Tick 0: exactly one placement, then the throttle bites
        executor.control_tick().await.unwrap();
        assert_eq!(venue.placed.lock().await.len(), 1);

        // Ticks 1..=29: nothing new despite free capacity
        for _ in 0..29 {
            tokio::time::advance(Duration::from_secs(1)).await;
            executor.control_tick().await.unwrap();
            assert_eq!(venue.placed.lock().await.len(), 1);
        }

        // Tick 30: the cooldown has elapsed
        tokio::time::advance(Duration::from_secs(1)).await;
        executor.control_tick().await.unwrap();
        assert_eq!(venue.placed.lock().await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn activation_bounds_churn_cancels_and_reseeds() {
        let mut config = test_config(TradeType::Buy);
        config.activation_bounds = Some(dec!(0.01));
        let (mut executor, venue) = make_executor(config, dec!(0.264)).await;

        executor.control_tick().await.unwrap();
        let initial = placed_by_side(&venue, TradeType::Buy).await;
        assert_eq!(initial.len(), 5);
        for order in &initial {
            assert!((order.price - dec!(0.264)).abs() / dec!(0.264) <= dec!(0.01));
        }

        // Mid drifts; everything resting is now outside the window
        venue.set_mid_price(dec!(0.272)).await;
        executor.control_tick().await.unwrap();
        assert_eq!(venue.cancelled.lock().await.len(), 5);

        // Next tick observes the terminal statuses and reseeds inside the
        // new window
        executor.control_tick().await.unwrap();
        let buys = placed_by_side(&venue, TradeType::Buy).await;
        let reseeded: Vec<_> = buys.iter().skip(5).collect();
        assert_eq!(reseeded.len(), 5);
        for order in reseeded {
            assert!((order.price - dec!(0.272)).abs() / dec!(0.272) <= dec!(0.01));
        }
        assert_eq!(executor.count_levels_in(GridLevelState::OpenPlaced), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_partial_fill_never_creates_a_close() {
        let (mut executor, venue) = make_executor(test_config(TradeType::Buy), dec!(0.264)).await;
        executor.control_tick().await.unwrap();

        let buys = placed_by_side(&venue, TradeType::Buy).await;
        let victim = buys[0].clone();
        let partial = venue.trading_rules().quantize_amount(victim.amount * dec!(0.4));
        venue.cancel_after_partial(&victim.order_id, partial).await;

        executor.control_tick().await.unwrap();

        // No take-profit was created from a cancelled-not-filled open
        assert!(placed_by_side(&venue, TradeType::Sell).await.is_empty());

        // The level went back to NotActive with a cleared slot and is
        // eligible again (a replacement open was placed this tick)
        assert_eq!(executor.count_levels_in(GridLevelState::OpenFilled), 0);
        assert_eq!(executor.count_levels_in(GridLevelState::OpenPlaced), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_open_clears_and_level_retries() {
        let (mut executor, venue) = make_executor(test_config(TradeType::Buy), dec!(0.264)).await;
        executor.control_tick().await.unwrap();

        let victim = venue.resting_order_ids().await[0].clone();
        venue.reject_order(&victim).await;

        // The slot clears on the next refresh and capacity is refilled
        executor.control_tick().await.unwrap();
        assert_eq!(executor.count_levels_in(GridLevelState::OpenPlaced), 5);
        assert!(placed_by_side(&venue, TradeType::Sell).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn adverse_move_lifts_take_profit_above_mid() {
        let (mut executor, venue) = make_executor(test_config(TradeType::Buy), dec!(0.264)).await;
        executor.control_tick().await.unwrap();

        let buys = placed_by_side(&venue, TradeType::Buy).await;
        let filled = buys[0].clone();
        venue.fill_order(&filled.order_id).await;

        // Mid runs past the nominal target before the close goes out
        let new_mid = filled.price * dec!(1.002);
        venue.set_mid_price(new_mid).await;
        executor.control_tick().await.unwrap();

        let sells = placed_by_side(&venue, TradeType::Sell).await;
        assert_eq!(sells.len(), 1);
        let expected = venue
            .trading_rules()
            .quantize_price_up(new_mid * dec!(1.0001));
        assert_eq!(sells[0].price, expected);
        assert!(sells[0].price >= new_mid, "close must never sit below mid");
    }

    #[tokio::test(start_paused = true)]
    async fn short_grid_mirrors_sides() {
        let (mut executor, venue) = make_executor(test_config(TradeType::Sell), dec!(0.264)).await;
        executor.control_tick().await.unwrap();

        let sells = placed_by_side(&venue, TradeType::Sell).await;
        assert_eq!(sells.len(), 5);
        for order in &sells {
            assert_eq!(order.position_action, PositionAction::Open);
        }

        // Fill one short open; its take-profit is a BUY below the open price
        let opened = sells[0].clone();
        venue.fill_order(&opened.order_id).await;
        executor.control_tick().await.unwrap();

        let closes = placed_by_side(&venue, TradeType::Buy).await;
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].position_action, PositionAction::Close);
        assert!(closes[0].price < opened.price);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_activation_bounds_disable_every_level() {
        let mut config = test_config(TradeType::Buy);
        config.activation_bounds = Some(Decimal::ZERO);
        // Mid chosen off the ladder so no level price equals it exactly
        let (mut executor, venue) = make_executor(config, dec!(0.2641)).await;

        executor.control_tick().await.unwrap();
        assert!(venue.placed.lock().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn mid_outside_range_with_bounds_places_nothing() {
        let mut config = test_config(TradeType::Buy);
        config.activation_bounds = Some(dec!(0.01));
        let (mut executor, venue) = make_executor(config, dec!(0.30)).await;

        executor.control_tick().await.unwrap();
        assert!(venue.placed.lock().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_cap_holds_under_churn() {
        let mut config = test_config(TradeType::Buy);
        config.max_open_orders = 3;
        let (mut executor, venue) = make_executor(config, dec!(0.264)).await;

        for _ in 0..5 {
            executor.control_tick().await.unwrap();
            assert!(executor.count_levels_in(GridLevelState::OpenPlaced) <= 3);
        }
        assert_eq!(venue.placed.lock().await.len(), 3);

        // A fill frees one slot; the next tick tops the cap back up
        let id = venue.resting_order_ids().await[0].clone();
        venue.fill_order(&id).await;
        executor.control_tick().await.unwrap();
        assert_eq!(executor.count_levels_in(GridLevelState::OpenPlaced), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stream_events_update_orders_between_ticks() {
        let (mut executor, venue) = make_executor(test_config(TradeType::Buy), dec!(0.264)).await;
        executor.control_tick().await.unwrap();

        let buys = placed_by_side(&venue, TradeType::Buy).await;
        let target = buys[0].clone();

        // Event arrives on the queue with only the client id for correlation
        venue
            .push_event(VenueEvent::OrderUpdate(OrderUpdate {
                order_id: None,
                client_order_id: Some(target.client_order_id.clone()),
                status: OrderStatus::Filled,
                executed_amount_base: target.amount,
                executed_amount_quote: target.amount * target.price,
                fee_quote: None,
            }))
            .await;
        venue
            .push_event(VenueEvent::AccountUpdate(PositionsUpdate {
                long: target.amount,
                short: Decimal::ZERO,
            }))
            .await;
        // An update for an order this executor never placed is ignored
        venue
            .push_event(VenueEvent::OrderUpdate(OrderUpdate {
                order_id: Some("999999".to_string()),
                client_order_id: Some("DualGridBot_residual".to_string()),
                status: OrderStatus::Filled,
                executed_amount_base: dec!(1),
                executed_amount_quote: dec!(1),
                fee_quote: None,
            }))
            .await;

        executor.control_tick().await.unwrap();

        assert_eq!(executor.count_levels_in(GridLevelState::ClosePlaced), 1);
        assert_eq!(executor.position_size_base, target.amount);
    }

    #[tokio::test(start_paused = true)]
    async fn close_fee_adjustment_shaves_close_amount() {
        let mut config = test_config(TradeType::Buy);
        config.close_fee_adjustment = dec!(0.001);
        let (mut executor, venue) = make_executor(config, dec!(0.264)).await;
        executor.control_tick().await.unwrap();

        let buys = placed_by_side(&venue, TradeType::Buy).await;
        let target = buys[0].clone();
        venue.fill_order_with_fee(&target.order_id, dec!(0.01)).await;

        executor.control_tick().await.unwrap();

        let sells = placed_by_side(&venue, TradeType::Sell).await;
        assert_eq!(sells.len(), 1);
        let rules = venue.trading_rules();
        let expected = rules.quantize_amount(target.amount - target.amount * dec!(0.001));
        assert_eq!(sells[0].amount, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_venue_error_escalates_without_retries() {
        let (executor, venue) = make_executor(test_config(TradeType::Buy), dec!(0.264)).await;
        *venue.mid_price_error.lock().await =
            Some(GridError::VenueFatal("authentication failed".into()));

        let (_stop_tx, stop_rx) = watch::channel(false);
        let (status_tx, mut status_rx) = watch::channel(executor.status_snapshot());
        let task = tokio::spawn(executor.run(stop_rx, status_tx));

        loop {
            status_rx.changed().await.unwrap();
            let snapshot = status_rx.borrow().clone();
            if snapshot.status == RunnableStatus::Terminated {
                // Shut down on the first failed tick, not after max_retries
                assert_eq!(snapshot.current_retries, 0);
                break;
            }
        }
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_closes_and_terminates() {
        let (mut executor, venue) = make_executor(test_config(TradeType::Buy), dec!(0.264)).await;
        executor.control_tick().await.unwrap();
        assert_eq!(venue.placed.lock().await.len(), 5);

        *venue.long_position.lock().await = dec!(20);

        executor.begin_shutdown();
        executor.control_tick().await.unwrap();

        assert_eq!(executor.status(), RunnableStatus::Terminated);
        assert!(venue.resting_order_ids().await.is_empty());
        let (long, short) = venue.positions().await.unwrap();
        assert_eq!(long, Decimal::ZERO);
        assert_eq!(short, Decimal::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn state_matches_slot_table_every_tick() {
        let (mut executor, venue) = make_executor(test_config(TradeType::Buy), dec!(0.264)).await;

        for round in 0..4 {
            executor.control_tick().await.unwrap();

            for level in executor.levels() {
                assert_eq!(
                    level.state,
                    GridLevel::derive_state(
                        level.active_open_order.as_ref(),
                        level.active_close_order.as_ref(),
                    ),
                    "round {round}: level {} out of sync with its slots",
                    level.id
                );
            }

            // Perturb the book a little every round
            if let Some(id) = venue.resting_order_ids().await.first() {
                venue.fill_order(id).await;
            }
        }
    }
}
