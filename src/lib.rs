//! Dual-account hedge grid trading engine for perpetual futures.
//!
//! Two segregated accounts run mirrored grids on the same instrument, one
//! long-only and one short-only, so net delta across the pair stays near
//! zero while each grid harvests the spread from local oscillations.
//!
//! The [`grid`] module holds the per-account executor core, [`venue`] the
//! exchange abstraction (live Binance futures adapter plus an in-memory
//! mock), and [`controller`] the supervisor that coordinates the pair.

pub mod controller;
pub mod grid;
pub mod settings;
pub mod venue;

pub use controller::{ControllerSettings, StopReason, StrategyController};
pub use grid::{
    ExecutorStatus, GridError, GridExecutor, GridExecutorConfig, GridLevel, GridLevelState,
    GridResult, RunnableStatus, TradeType, TrackedOrder, TradingRules,
};
pub use settings::Settings;
pub use venue::{BinanceVenue, MockVenue, Venue, VenueCredentials, VenueEvent};
