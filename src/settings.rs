//! Application settings
//!
//! Strategy parameters come from a config file layered with `APP_`-prefixed
//! environment overrides; API credentials come only from the environment
//! (loaded from `.env` by the binaries).

use std::time::Duration;

use config::{Config, ConfigError, File};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::controller::ControllerSettings;
use crate::grid::config::GridExecutorConfig;
use crate::grid::errors::{GridError, GridResult};
use crate::grid::types::{OrderType, TradeType};
use crate::venue::VenueCredentials;

/// Main configuration struct
#[derive(Debug, Deserialize)]
pub struct Settings {
    /// Instrument and account-level trading parameters
    pub trading: TradingSettings,
    /// Grid shape and policy parameters, shared by both executors
    pub grid: GridSettings,
    /// Supervisor cadence
    #[serde(default)]
    pub monitor: MonitorSettings,
}

#[derive(Debug, Deserialize)]
pub struct TradingSettings {
    /// Trading pair, e.g. "XRP/USDC:USDC"
    pub pair: String,
    /// Quote/settle asset, e.g. "USDC"
    pub contract_type: String,
    pub leverage: u32,
}

#[derive(Debug, Deserialize)]
pub struct GridSettings {
    pub start_price: Decimal,
    pub end_price: Decimal,
    pub total_amount_quote: Decimal,
    pub max_open_orders: u32,
    pub min_spread_between_orders: Decimal,
    pub min_order_amount_quote: Decimal,
    /// Seconds between open placements; 0 disables the throttle
    pub order_frequency: u64,
    #[serde(default)]
    pub activation_bounds: Option<Decimal>,
    pub safe_extra_spread: Decimal,
    pub take_profit_pct: Decimal,
    #[serde(default)]
    pub close_fee_adjustment: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct MonitorSettings {
    #[serde(default = "default_update_interval")]
    pub update_interval_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
}

fn default_update_interval() -> u64 {
    1
}

fn default_max_retries() -> u32 {
    10
}

fn default_sync_interval() -> u64 {
    30
}

fn default_heartbeat_interval() -> u64 {
    30
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            update_interval_secs: default_update_interval(),
            max_retries: default_max_retries(),
            sync_interval_secs: default_sync_interval(),
            heartbeat_interval_secs: default_heartbeat_interval(),
        }
    }
}

impl Settings {
    /// Load settings from a configuration file, with environment overrides
    /// (e.g. `APP_GRID__TAKE_PROFIT_PCT=0.002`).
    pub fn load(config_path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(config_path))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        s.try_deserialize()
    }

    /// Executor configuration for one side of the hedge pair.
    pub fn executor_config(&self, side: TradeType) -> GridExecutorConfig {
        GridExecutorConfig {
            id: match side {
                TradeType::Buy => "long_grid".to_string(),
                TradeType::Sell => "short_grid".to_string(),
            },
            trading_pair: self.trading.pair.clone(),
            side,
            start_price: self.grid.start_price,
            end_price: self.grid.end_price,
            total_amount_quote: self.grid.total_amount_quote,
            max_open_orders: self.grid.max_open_orders,
            min_spread_between_orders: self.grid.min_spread_between_orders,
            min_order_amount_quote: self.grid.min_order_amount_quote,
            order_type: OrderType::Limit,
            order_frequency: self.grid.order_frequency,
            activation_bounds: self.grid.activation_bounds,
            safe_extra_spread: self.grid.safe_extra_spread,
            take_profit_pct: self.grid.take_profit_pct,
            leverage: self.trading.leverage,
            close_fee_adjustment: self.grid.close_fee_adjustment,
        }
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            update_interval: Duration::from_secs(self.monitor.update_interval_secs.max(1)),
            max_retries: self.monitor.max_retries,
            sync_interval: Duration::from_secs(self.monitor.sync_interval_secs),
            heartbeat_interval: Duration::from_secs(self.monitor.heartbeat_interval_secs),
        }
    }
}

/// Credentials for one of the two accounts, from `BINANCE_<ACCOUNT>_API_KEY`
/// / `BINANCE_<ACCOUNT>_API_SECRET`.
pub fn account_credentials(account: &str) -> GridResult<VenueCredentials> {
    let key_var = format!("BINANCE_{account}_API_KEY");
    let secret_var = format!("BINANCE_{account}_API_SECRET");

    let api_key = std::env::var(&key_var)
        .map_err(|_| GridError::InvalidConfig(format!("{key_var} is not set")))?;
    let api_secret = std::env::var(&secret_var)
        .map_err(|_| GridError::InvalidConfig(format!("{secret_var} is not set")))?;

    Ok(VenueCredentials {
        api_key,
        api_secret,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn settings() -> Settings {
        Settings {
            trading: TradingSettings {
                pair: "XRP/USDC:USDC".to_string(),
                contract_type: "USDC".to_string(),
                leverage: 20,
            },
            grid: GridSettings {
                start_price: dec!(0.248),
                end_price: dec!(0.280),
                total_amount_quote: dec!(1000),
                max_open_orders: 5,
                min_spread_between_orders: dec!(0.0005),
                min_order_amount_quote: dec!(5),
                order_frequency: 0,
                activation_bounds: Some(dec!(0.01)),
                safe_extra_spread: dec!(0.0001),
                take_profit_pct: dec!(0.001),
                close_fee_adjustment: Decimal::ZERO,
            },
            monitor: MonitorSettings::default(),
        }
    }

    #[test]
    fn executor_configs_mirror_each_other() {
        let settings = settings();
        let long = settings.executor_config(TradeType::Buy);
        let short = settings.executor_config(TradeType::Sell);

        assert_eq!(long.id, "long_grid");
        assert_eq!(short.id, "short_grid");
        assert_eq!(long.side, TradeType::Buy);
        assert_eq!(short.side, TradeType::Sell);
        assert_eq!(long.start_price, short.start_price);
        assert_eq!(long.total_amount_quote, short.total_amount_quote);

        assert!(long.validate().is_ok());
        assert!(short.validate().is_ok());
    }

    #[test]
    fn monitor_defaults() {
        let controller = settings().controller_settings();
        assert_eq!(controller.update_interval, Duration::from_secs(1));
        assert_eq!(controller.max_retries, 10);
    }
}
