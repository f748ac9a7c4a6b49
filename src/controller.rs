//! Strategy controller - supervises the two mirrored grid executors
//!
//! Owns the startup and teardown ordering for the dual-account pair:
//! connectivity checks, account cleanup, notional balance validation,
//! executor launch, liveness monitoring, and the final flatness check.

use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use rust_decimal::Decimal;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::grid::config::GridExecutorConfig;
use crate::grid::errors::{GridError, GridResult};
use crate::grid::executor::{ExecutorStatus, GridExecutor};
use crate::grid::types::{RunnableStatus, TradeType};
use crate::venue::Venue;

/// Supervisor cadence settings
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Executor tick period
    pub update_interval: Duration,
    /// Consecutive tick failures before an executor shuts down
    pub max_retries: u32,
    /// How often the supervisor logs the aggregate status line
    pub sync_interval: Duration,
    /// How often the supervisor probes venue reachability
    pub heartbeat_interval: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            update_interval: Duration::from_secs(1),
            max_retries: 10,
            sync_interval: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

struct ExecutorHandle {
    id: String,
    status_rx: watch::Receiver<ExecutorStatus>,
    task: JoinHandle<()>,
}

impl ExecutorHandle {
    fn status(&self) -> ExecutorStatus {
        self.status_rx.borrow().clone()
    }
}

/// Why the supervisor loop decided to stop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// External stop request (signal handler)
    Requested,
    /// An executor reached shutdown or its task exited
    ExecutorFailed(String),
    /// A venue became unreachable or its stream went stale
    VenueUnhealthy(String),
}

/// Dual-account supervisor. Account A runs the long grid, account B the
/// mirrored short grid on the same instrument.
pub struct StrategyController {
    venue_a: Arc<dyn Venue>,
    venue_b: Arc<dyn Venue>,
    long_config: GridExecutorConfig,
    short_config: GridExecutorConfig,
    settings: ControllerSettings,

    executors: Vec<ExecutorHandle>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    is_running: bool,
}

impl StrategyController {
    pub fn new(
        venue_a: Arc<dyn Venue>,
        venue_b: Arc<dyn Venue>,
        long_config: GridExecutorConfig,
        short_config: GridExecutorConfig,
        settings: ControllerSettings,
    ) -> GridResult<Self> {
        if long_config.side != TradeType::Buy || short_config.side != TradeType::Sell {
            return Err(GridError::InvalidConfig(
                "controller expects a long config and a short config".into(),
            ));
        }
        long_config.validate()?;
        short_config.validate()?;

        let (stop_tx, stop_rx) = watch::channel(false);

        Ok(Self {
            venue_a,
            venue_b,
            long_config,
            short_config,
            settings,
            executors: Vec::new(),
            stop_tx,
            stop_rx,
            is_running: false,
        })
    }

    /// Sequential startup, failing fast on every step.
    pub async fn start(&mut self) -> GridResult<()> {
        info!("Starting dual-account hedge grid strategy");

        // 1. Both venues must answer before anything is touched
        if !self.venue_a.check_connection().await {
            return Err(GridError::Venue("account A venue unreachable".into()));
        }
        if !self.venue_b.check_connection().await {
            return Err(GridError::Venue("account B venue unreachable".into()));
        }

        // 2. Start from flat accounts
        self.cleanup_accounts().await?;

        // 3. Leveraged notional must cover the configured budget on both sides
        self.validate_dual_account_balance().await?;

        // 4. Executors, with their event queues wired to the streams
        self.spawn_executors().await?;

        self.is_running = true;
        info!("Dual-account hedge grid strategy started");
        Ok(())
    }

    async fn cleanup_accounts(&self) -> GridResult<()> {
        info!("Cleaning up both accounts before start");

        let (a, b) = tokio::join!(self.venue_a.cleanup(), self.venue_b.cleanup());
        let success_a = a.unwrap_or_else(|e| {
            error!("Account A cleanup failed: {e}");
            false
        });
        let success_b = b.unwrap_or_else(|e| {
            error!("Account B cleanup failed: {e}");
            false
        });

        if !(success_a && success_b) {
            return Err(GridError::CleanupFailed(
                "startup cleanup left residual orders or positions".into(),
            ));
        }

        info!("Account cleanup completed");
        Ok(())
    }

    /// Both accounts need `free_balance x leverage >= total_amount_quote`.
    async fn validate_dual_account_balance(&self) -> GridResult<()> {
        let balance_a = self.venue_a.balance().await?;
        let balance_b = self.venue_b.balance().await?;

        let nominal_a = balance_a.free * Decimal::from(self.long_config.leverage);
        let nominal_b = balance_b.free * Decimal::from(self.short_config.leverage);
        let required = self.long_config.total_amount_quote;

        info!(
            "Balance check: A free={} nominal={}, B free={} nominal={}, required={}",
            balance_a.free, nominal_a, balance_b.free, nominal_b, required
        );

        // Fund transfer between the accounts would even out a skew here,
        // but no venue adapter implements it; the skew is only reported
        let skew = (balance_a.free - balance_b.free).abs() / Decimal::TWO;
        if skew >= Decimal::ONE {
            warn!(
                "Account balances differ; {} quote would need transferring (unsupported)",
                skew
            );
        }

        let min_nominal = nominal_a.min(nominal_b);
        if min_nominal < required {
            return Err(GridError::InsufficientBalance {
                required,
                available: min_nominal,
            });
        }

        Ok(())
    }

    async fn spawn_executors(&mut self) -> GridResult<()> {
        let pairs = [
            (self.venue_a.clone(), self.long_config.clone()),
            (self.venue_b.clone(), self.short_config.clone()),
        ];

        for (venue, config) in pairs {
            let events = venue.subscribe_events().await?;
            let mut executor = GridExecutor::new(
                config.clone(),
                venue,
                events,
                self.settings.update_interval,
                self.settings.max_retries,
            )
            .await?;
            executor.start();

            let (status_tx, status_rx) = watch::channel(executor.status_snapshot());
            let task = tokio::spawn(executor.run(self.stop_rx.clone(), status_tx));

            self.executors.push(ExecutorHandle {
                id: config.id,
                status_rx,
                task,
            });
        }

        info!("Both grid executors running");
        Ok(())
    }

    /// Supervisor loop. Returns the reason once a stop condition fires;
    /// the caller then runs [`stop`](Self::stop).
    pub async fn supervise(&mut self) -> StopReason {
        let mut last_sync = tokio::time::Instant::now();
        let mut last_heartbeat = tokio::time::Instant::now();

        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;

            if *self.stop_rx.borrow() {
                return StopReason::Requested;
            }

            for handle in &self.executors {
                let status = handle.status();
                if status.status == RunnableStatus::ShuttingDown
                    || status.status == RunnableStatus::Terminated
                {
                    warn!("Executor {} is shutting down, stopping strategy", handle.id);
                    return StopReason::ExecutorFailed(handle.id.clone());
                }
                if !status.is_healthy() {
                    warn!("Executor {} unhealthy, stopping strategy", handle.id);
                    return StopReason::ExecutorFailed(handle.id.clone());
                }
                if handle.task.is_finished() {
                    warn!("Executor task {} exited unexpectedly", handle.id);
                    return StopReason::ExecutorFailed(handle.id.clone());
                }
            }

            if last_heartbeat.elapsed() >= self.settings.heartbeat_interval {
                last_heartbeat = tokio::time::Instant::now();

                if !self.venue_a.check_connection().await {
                    return StopReason::VenueUnhealthy("account A".into());
                }
                if !self.venue_b.check_connection().await {
                    return StopReason::VenueUnhealthy("account B".into());
                }
                if !self.venue_a.stream_healthy() {
                    warn!("Account A user-data stream is stale");
                }
                if !self.venue_b.stream_healthy() {
                    warn!("Account B user-data stream is stale");
                }
            }

            if last_sync.elapsed() >= self.settings.sync_interval {
                last_sync = tokio::time::Instant::now();
                self.log_status();
            }
        }
    }

    fn log_status(&self) {
        let mut parts = Vec::with_capacity(self.executors.len());
        for handle in &self.executors {
            let s = handle.status();
            parts.push(format!(
                "{}: {:?} (pos={}, pnl={}, trips={})",
                s.id, s.status, s.position_size_base, s.realized_pnl, s.completed_trips
            ));
        }
        info!("Strategy status - {}", parts.join(", "));
    }

    /// Request a stop from outside the supervisor loop.
    pub fn request_stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Stop sequence: signal the executors, wait for their own shutdown
    /// (cancel-all, close-all), then the final cross-account cleanup and
    /// flatness verification. Returns whether both accounts verified flat.
    pub async fn stop(&mut self) -> GridResult<bool> {
        info!("Stopping dual-account hedge grid strategy");
        self.is_running = false;
        let _ = self.stop_tx.send(true);

        for handle in self.executors.drain(..) {
            match tokio::time::timeout(Duration::from_secs(30), handle.task).await {
                Ok(Ok(())) => info!("Executor {} stopped", handle.id),
                Ok(Err(e)) => error!("Executor {} task panicked: {e}", handle.id),
                Err(_) => error!("Executor {} did not stop in time", handle.id),
            }
        }

        let (a, b) = tokio::join!(self.venue_a.cleanup(), self.venue_b.cleanup());
        for (name, result) in [("A", a), ("B", b)] {
            if let Err(e) = result {
                error!("Account {name} final cleanup failed: {e}");
            }
        }

        let (flat_a, flat_b) = tokio::join!(
            self.venue_a.verify_cleanup(),
            self.venue_b.verify_cleanup()
        );
        let flat = flat_a.unwrap_or(false) && flat_b.unwrap_or(false);

        if flat {
            info!("Final cleanup verification passed, both accounts flat");
        } else {
            error!("Final cleanup verification FAILED, manual intervention required");
        }

        Ok(flat)
    }

    pub fn is_running(&self) -> bool {
        self.is_running
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::config::tests::test_config;
    use crate::venue::MockVenue;
    use rust_decimal_macros::dec;

    fn controller_with_mocks() -> (StrategyController, Arc<MockVenue>, Arc<MockVenue>) {
        let venue_a = Arc::new(MockVenue::new(dec!(0.264)));
        let venue_b = Arc::new(MockVenue::new(dec!(0.264)));

        let mut settings = ControllerSettings::default();
        settings.max_retries = 3;

        let controller = StrategyController::new(
            venue_a.clone(),
            venue_b.clone(),
            test_config(TradeType::Buy),
            test_config(TradeType::Sell),
            settings,
        )
        .unwrap();

        (controller, venue_a, venue_b)
    }

    #[test]
    fn rejects_mismatched_sides() {
        let venue_a = Arc::new(MockVenue::new(dec!(0.264)));
        let venue_b = Arc::new(MockVenue::new(dec!(0.264)));

        let result = StrategyController::new(
            venue_a,
            venue_b,
            test_config(TradeType::Sell),
            test_config(TradeType::Sell),
            ControllerSettings::default(),
        );
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn startup_rejects_unreachable_venue() {
        let (mut controller, venue_a, _venue_b) = controller_with_mocks();
        *venue_a.rest_reachable.lock().await = false;

        assert!(controller.start().await.is_err());
        assert!(!controller.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn startup_rejects_insufficient_nominal_balance() {
        let (mut controller, _venue_a, venue_b) = controller_with_mocks();
        // 1000 required; 10 free x 20 leverage = 200 nominal
        *venue_b.free_balance.lock().await = dec!(10);

        let result = controller.start().await;
        assert!(matches!(
            result,
            Err(GridError::InsufficientBalance { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn start_spawns_both_executors() {
        let (mut controller, venue_a, venue_b) = controller_with_mocks();
        controller.start().await.unwrap();

        assert!(controller.is_running());
        assert_eq!(controller.executors.len(), 2);

        // First ticks place the long grid's buys on A and the short grid's
        // sells on B
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!venue_a.placed.lock().await.is_empty());
        assert!(!venue_b.placed.lock().await.is_empty());

        let flat = controller.stop().await.unwrap();
        assert!(flat);
    }

    #[tokio::test(start_paused = true)]
    async fn supervisor_stops_both_when_one_executor_fails() {
        let (mut controller, venue_a, venue_b) = controller_with_mocks();
        controller.start().await.unwrap();

        // Break account B's price feed transiently; its executor burns
        // through retries
        *venue_b.mid_price_error.lock().await =
            Some(GridError::Venue("mock price feed failure".into()));

        let reason = tokio::time::timeout(Duration::from_secs(60), controller.supervise())
            .await
            .expect("supervisor should observe the failure");
        assert_eq!(reason, StopReason::ExecutorFailed("short_grid".to_string()));

        let flat = controller.stop().await.unwrap();
        assert!(flat);

        // Both accounts were cleaned: no resting orders anywhere
        assert!(venue_a.resting_order_ids().await.is_empty());
        assert!(venue_b.resting_order_ids().await.is_empty());
    }
}
